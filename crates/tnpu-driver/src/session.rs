//! Client sessions.
//!
//! A session owns a network table and an IO-buffer table. Closing it, by
//! [`Session::close`] or by dropping it, destroys every network (detaching
//! their buffers) and then every buffer.

use crate::buffer::IoBuffer;
use crate::device::DeviceShared;
use crate::engine::{LayerProfile, RunReport};
use crate::error::{NpuError, Result};
use crate::handle::HandleTable;
use crate::mem::ExternalHandle;
use crate::network::{Network, NetworkStats, SlotRole};
use parking_lot::{Mutex, MutexGuard};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tracing::{debug, info};

/// Identifier of a session, unique for the device lifetime.
pub type SessionId = u64;

/// Identifiers returned when an IO buffer is created.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CreatedBuffer {
    /// Buffer handle
    pub bid: u32,
    /// Memory id other sessions can share
    pub mem_id: u32,
    /// Handle exported to the caller, for allocated buffers
    pub fd: Option<ExternalHandle>,
}

#[derive(Debug)]
pub(crate) struct SessionState {
    networks: HandleTable<Network>,
    buffers: HandleTable<IoBuffer>,
}

/// One open client connection.
#[derive(Debug)]
pub struct Session {
    id: SessionId,
    pid: u32,
    device: Arc<DeviceShared>,
    state: Mutex<SessionState>,
    closed: AtomicBool,
}

/// Per-session view used by device snapshots.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SessionSnapshot {
    /// Session id
    pub id: SessionId,
    /// Owning process
    pub pid: u32,
    /// Statistics per network handle
    pub networks: Vec<(u32, NetworkStats)>,
    /// Live IO buffers
    pub buffers: usize,
}

impl Session {
    pub(crate) fn new(id: SessionId, pid: u32, device: Arc<DeviceShared>) -> Self {
        let limit = device.config().max_handles;
        Self {
            id,
            pid,
            device,
            state: Mutex::new(SessionState {
                networks: HandleTable::new("network", limit),
                buffers: HandleTable::new("io buffer", limit),
            }),
            closed: AtomicBool::new(false),
        }
    }

    /// Session id.
    pub fn id(&self) -> SessionId {
        self.id
    }

    /// Process that opened the session.
    pub fn pid(&self) -> u32 {
        self.pid
    }

    /// Closed explicitly or by drop.
    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::Acquire)
    }

    fn state(&self) -> Result<MutexGuard<'_, SessionState>> {
        let state = self.state.lock();
        if self.is_closed() {
            return Err(NpuError::invalid_state(format!("session {} is closed", self.id)));
        }
        Ok(state)
    }

    // ── Networks ────────────────────────────────────────────────────────────

    /// Upload a model image; returns the network handle.
    ///
    /// # Errors
    ///
    /// Returns error if the image is malformed, memory runs out, or the peer
    /// rejects the model. Nothing stays allocated on failure.
    pub fn create_network(&self, model: &[u8]) -> Result<u32> {
        let mut state = self.state()?;
        let dev = &self.device;
        state.networks.insert_with(|_| {
            Network::create(model, dev.memory(), dev.channel(), dev.config().max_handles)
        })
    }

    /// Destroy a network, detaching its buffers first.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown handle.
    pub fn destroy_network(&self, nid: u32) -> Result<()> {
        let mut state = self.state()?;
        let network = state
            .networks
            .release(nid)
            .ok_or_else(|| NpuError::not_found("network", nid))?;
        network.destroy(self.device.memory(), self.device.channel(), &mut state.buffers);
        debug!("session {}: network {nid} destroyed", self.id);
        Ok(())
    }

    /// Statistics of a network.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown handle.
    pub fn network_stats(&self, nid: u32) -> Result<NetworkStats> {
        Ok(self.state()?.networks.lookup(nid)?.stats())
    }

    /// Per-layer timings of the network's last profiling run.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown handle.
    pub fn last_profile(&self, nid: u32) -> Result<Vec<LayerProfile>> {
        Ok(self.state()?.networks.lookup(nid)?.last_profile().to_vec())
    }

    /// Live attachment handles of a network.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown handle.
    pub fn attachments(&self, nid: u32) -> Result<Vec<u32>> {
        Ok(self.state()?.networks.lookup(nid)?.attachments().handles())
    }

    /// Live network handles.
    pub fn networks(&self) -> Vec<u32> {
        self.state.lock().networks.handles()
    }

    // ── IO buffers ──────────────────────────────────────────────────────────

    /// Allocate and export an IO buffer.
    ///
    /// # Errors
    ///
    /// Returns error if memory runs out or the peer rejects the buffer.
    pub fn create_io_buffer(&self, size: u64) -> Result<CreatedBuffer> {
        let mut state = self.state()?;
        let dev = &self.device;
        let bid = state
            .buffers
            .insert_with(|_| IoBuffer::allocate(size, dev.memory(), dev.channel()))?;
        let buffer = state.buffers.lookup(bid)?;
        Ok(CreatedBuffer {
            bid,
            mem_id: buffer.mem_id(),
            fd: buffer.export(),
        })
    }

    /// Wrap external memory as an IO buffer.
    ///
    /// # Errors
    ///
    /// Returns error if the handle is unknown, `offset` is misaligned, the
    /// memory is too small, or its security does not match `secure`.
    pub fn create_io_buffer_from_external(
        &self,
        handle: ExternalHandle,
        offset: u64,
        size: u64,
        secure: bool,
    ) -> Result<CreatedBuffer> {
        let mut state = self.state()?;
        let dev = &self.device;
        let bid = state.buffers.insert_with(|_| {
            IoBuffer::from_external(handle, offset, size, secure, dev.memory(), dev.channel())
        })?;
        Ok(CreatedBuffer {
            bid,
            mem_id: state.buffers.lookup(bid)?.mem_id(),
            fd: None,
        })
    }

    /// Share memory of a buffer, possibly another session's, by memory id.
    ///
    /// # Errors
    ///
    /// Returns error if the peer does not know `mem_id` or the range is invalid.
    pub fn create_io_buffer_from_mem_id(&self, mem_id: u32, offset: u32, size: u32) -> Result<u32> {
        let mut state = self.state()?;
        let channel = self.device.channel();
        state
            .buffers
            .insert_with(|_| IoBuffer::from_mem_id(mem_id, offset, size, channel))
    }

    /// Destroy an IO buffer that is not attached anywhere.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::BufferInUse`] while attachments remain, or
    /// [`NpuError::NotFound`] for an unknown handle.
    pub fn destroy_io_buffer(&self, bid: u32) -> Result<()> {
        let mut state = self.state()?;
        let ref_count = state.buffers.lookup(bid)?.ref_count();
        if ref_count > 0 {
            return Err(NpuError::BufferInUse { bid, ref_count });
        }
        if let Some(buffer) = state.buffers.release(bid) {
            buffer.release(self.device.memory(), self.device.channel());
        }
        Ok(())
    }

    /// Attachments referencing a buffer.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for an unknown handle.
    pub fn buffer_ref_count(&self, bid: u32) -> Result<u32> {
        Ok(self.state()?.buffers.lookup(bid)?.ref_count())
    }

    /// Live buffer handles.
    pub fn buffers(&self) -> Vec<u32> {
        self.state.lock().buffers.handles()
    }

    // ── Attachments ─────────────────────────────────────────────────────────

    /// Attach buffer `bid` to network `nid`; returns the attachment handle.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for unknown handles or the peer error.
    pub fn attach_io_buffer(&self, nid: u32, bid: u32) -> Result<u32> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let key = state
            .buffers
            .key(bid)
            .ok_or_else(|| NpuError::not_found("io buffer", bid))?;
        let buffer = state.buffers.lookup_mut(bid)?;
        let network = state.networks.lookup_mut(nid)?;
        network.attach(self.device.channel(), key, buffer)
    }

    /// Detach attachment `aid` from network `nid`.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for unknown handles or the peer error.
    pub fn detach_io_buffer(&self, nid: u32, aid: u32) -> Result<()> {
        let mut guard = self.state()?;
        let state = &mut *guard;
        let network = state.networks.lookup_mut(nid)?;
        network.detach(self.device.channel(), aid, &mut state.buffers)
    }

    /// Use attachment `aid` as input slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for unknown handles or the peer error.
    pub fn set_input(&self, nid: u32, aid: u32, index: u32) -> Result<()> {
        self.bind_slot(nid, aid, SlotRole::Input(index))
    }

    /// Use attachment `aid` as output slot `index`.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::NotFound`] for unknown handles or the peer error.
    pub fn set_output(&self, nid: u32, aid: u32, index: u32) -> Result<()> {
        self.bind_slot(nid, aid, SlotRole::Output(index))
    }

    fn bind_slot(&self, nid: u32, aid: u32, role: SlotRole) -> Result<()> {
        let mut state = self.state()?;
        state
            .networks
            .lookup_mut(nid)?
            .bind_slot(self.device.channel(), aid, role)
    }

    // ── Execution ───────────────────────────────────────────────────────────

    /// Run network `nid` once, blocking until it completes.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::PermissionDenied`] at once if another session holds
    /// the reservation, otherwise the engine's outcome.
    pub fn run_network(&self, nid: u32) -> Result<RunReport> {
        self.device.check_may_run(self.id)?;
        let mut state = self.state()?;
        let network = state.networks.lookup_mut(nid)?;
        let report = self.device.engine().run(&network.run_target()?)?;
        network.record_run(&report);
        Ok(report)
    }

    // ── Reservation ─────────────────────────────────────────────────────────

    /// Reserve the hardware for this session.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::PermissionDenied`] if any session holds the reservation.
    pub fn lock_hardware(&self) -> Result<()> {
        self.device.lock_hardware(self.id)
    }

    /// Release this session's reservation.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::PermissionDenied`] unless this session holds it.
    pub fn unlock_hardware(&self) -> Result<()> {
        self.device.unlock_hardware(self.id)
    }

    /// Some session holds the reservation.
    pub fn query_hardware_lock(&self) -> bool {
        self.device.query_hardware_lock()
    }

    // ── Teardown ────────────────────────────────────────────────────────────

    /// Close the session. Later calls do nothing.
    pub fn close(&self) {
        if self.closed.swap(true, Ordering::AcqRel) {
            return;
        }
        self.device.remove_session(self.id);

        let mut state = self.state.lock();
        let networks = state.networks.drain();
        let network_count = networks.len();
        for (_, network) in networks {
            network.destroy(self.device.memory(), self.device.channel(), &mut state.buffers);
        }
        let buffers = state.buffers.drain();
        let buffer_count = buffers.len();
        for (_, buffer) in buffers {
            buffer.release(self.device.memory(), self.device.channel());
        }
        info!(
            "Session {} closed: {network_count} network(s), {buffer_count} buffer(s) released",
            self.id
        );
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let state = self.state.lock();
        SessionSnapshot {
            id: self.id,
            pid: self.pid,
            networks: state
                .networks
                .iter()
                .map(|(nid, network)| (nid, network.stats()))
                .collect(),
            buffers: state.buffers.len(),
        }
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        self.close();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::channel::ActivationMode;
    use crate::engine::RunTarget;
    use crate::mem::MemoryKind;
    use crate::simulator::SimulatedPlatform;
    use tnpu_models::ModelBuilder;

    #[test]
    fn unreadable_profile_still_counts_the_run() {
        let platform = SimulatedPlatform::builder().build().unwrap();
        let session = platform.device().open_session(1).unwrap();
        let model = ModelBuilder::new()
            .code(vec![0; 4096])
            .page_table_pages(16)
            .profiling(vec![2, 3])
            .build();
        let nid = session.create_network(&model).unwrap();
        let peer_nid = session.state().unwrap().networks.lookup(nid).unwrap().peer_nid().unwrap();

        // Secure memory is not CPU readable, so the profile read fails.
        let secure = session
            .device
            .memory()
            .allocate(MemoryKind::ProfileOperations, true, 4096)
            .unwrap();
        let engine = session.device.engine();
        let report = engine
            .run(&RunTarget {
                nid: peer_nid,
                mode: ActivationMode::NonSecure,
                profiling: true,
                profile: Some(&secure),
                layer_operations: &[2, 3],
            })
            .unwrap();
        assert!(report.layers.is_empty());
        assert_eq!(engine.stats().inferences, 1);

        let report = session.run_network(nid).unwrap();
        assert_eq!(report.layers.len(), 2);
        assert_eq!(engine.stats().inferences, 2);
        assert_eq!(session.network_stats(nid).unwrap().inferences, 1);
    }
}
