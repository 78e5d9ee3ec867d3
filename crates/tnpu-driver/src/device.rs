//! Device lifecycle: attach, power sequencing, suspend/resume and the
//! hardware reservation.
//!
//! ```text
//! Detached ──attach──▶ Attached(idle) ──first open──▶ Attached(powered)
//!                          ▲                             │        ▲
//!                          └──────── last close ─────────┘        │
//!                                                    suspend ▼    │ resume
//!                                                        Suspended
//! ```
//!
//! Locks are taken in one order only: the session list here, then a
//! session's own state, then the engine's hardware lock.

use crate::channel::{ActivationMode, SecureChannel};
use crate::config::DeviceConfig;
use crate::engine::{EngineStats, ExecutionEngine};
use crate::error::{NpuError, Result};
use crate::mem::{MemoryKind, MemoryManager, Region};
use crate::power::PowerControl;
use crate::session::{Session, SessionId, SessionSnapshot};
use crate::signal::{CompletionSignal, InterruptHandler, IrqLine, RunInterrupter};
use parking_lot::Mutex;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use tracing::{debug, error, info, warn};

#[derive(Debug, Default)]
struct SessionList {
    open: Vec<(SessionId, Weak<Session>)>,
    reservation: Option<SessionId>,
    suspended: bool,
}

/// State shared by the device handle, its sessions and the interrupt path.
#[derive(Debug)]
pub struct DeviceShared {
    config: DeviceConfig,
    channel: Arc<dyn SecureChannel>,
    memory: MemoryManager,
    power: Arc<dyn PowerControl>,
    engine: ExecutionEngine,
    signal: Arc<CompletionSignal>,
    irq: Arc<IrqLine>,
    sessions: Mutex<SessionList>,
    next_session: AtomicU64,
    // Handed to the peer at session open; freed after the peer session closes.
    driver_buffers: (Region, Region),
}

impl DeviceShared {
    pub(crate) fn config(&self) -> &DeviceConfig {
        &self.config
    }

    pub(crate) fn channel(&self) -> &dyn SecureChannel {
        self.channel.as_ref()
    }

    pub(crate) fn memory(&self) -> &MemoryManager {
        &self.memory
    }

    pub(crate) fn engine(&self) -> &ExecutionEngine {
        &self.engine
    }

    pub(crate) fn check_may_run(&self, id: SessionId) -> Result<()> {
        let list = self.sessions.lock();
        if list.suspended {
            return Err(NpuError::invalid_state("device is suspended"));
        }
        match list.reservation {
            Some(owner) if owner != id => Err(NpuError::permission_denied(format!(
                "hardware reserved by session {owner}"
            ))),
            _ => Ok(()),
        }
    }

    pub(crate) fn lock_hardware(&self, id: SessionId) -> Result<()> {
        let mut list = self.sessions.lock();
        if let Some(owner) = list.reservation {
            return Err(NpuError::permission_denied(format!(
                "hardware already reserved by session {owner}"
            )));
        }
        list.reservation = Some(id);
        info!("Hardware reserved by session {id}");
        Ok(())
    }

    pub(crate) fn unlock_hardware(&self, id: SessionId) -> Result<()> {
        let mut list = self.sessions.lock();
        if list.reservation != Some(id) {
            return Err(NpuError::permission_denied(format!(
                "session {id} does not hold the hardware reservation"
            )));
        }
        list.reservation = None;
        info!("Hardware released by session {id}");
        Ok(())
    }

    pub(crate) fn query_hardware_lock(&self) -> bool {
        self.sessions.lock().reservation.is_some()
    }

    /// Drop `id` from the open list; the last one out powers the device down.
    pub(crate) fn remove_session(&self, id: SessionId) {
        let mut list = self.sessions.lock();
        list.open.retain(|(sid, _)| *sid != id);
        if list.reservation == Some(id) {
            list.reservation = None;
            info!("Hardware reservation of closing session {id} released");
        }
        if list.open.is_empty() && !list.suspended {
            self.engine.quiesce(|| self.power.power_off());
            info!("Last session closed, device powered off");
        }
    }

    fn on_interrupt(&self) {
        let _handler = self.irq.enter();
        match self.channel.read_interrupt_status() {
            Ok(status) => {
                if !self.signal.raise(status) {
                    debug!("spurious interrupt, status {status:#010x}");
                }
            }
            Err(e) => error!("Reading interrupt status failed: {e}"),
        }
    }
}

impl Drop for DeviceShared {
    fn drop(&mut self) {
        self.engine.reset();
        if let Err(e) = self.channel.close_session() {
            warn!("Closing peer session failed: {e}");
        }
        self.power.power_off();
        info!("Device detached");
    }
}

/// Device-wide view for diagnostics.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DeviceSnapshot {
    /// Device-wide run counters
    pub stats: EngineStats,
    /// Mode the execution unit is activated in
    pub active_mode: Option<ActivationMode>,
    /// Clock domain enabled
    pub powered: bool,
    /// Suspended by the platform
    pub suspended: bool,
    /// Session holding the hardware reservation
    pub reservation: Option<SessionId>,
    /// Open sessions
    pub sessions: Vec<SessionSnapshot>,
}

impl fmt::Display for DeviceSnapshot {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        writeln!(f, "powered: {}", self.powered)?;
        writeln!(f, "suspended: {}", self.suspended)?;
        match self.active_mode {
            Some(mode) => writeln!(f, "active: {mode:?}")?,
            None => writeln!(f, "active: none")?,
        }
        match self.reservation {
            Some(id) => writeln!(f, "reserved by: session {id}")?,
            None => writeln!(f, "reserved by: none")?,
        }
        writeln!(
            f,
            "inferences: {} (total {}us, last {}us)",
            self.stats.inferences, self.stats.total_us, self.stats.last_us
        )?;
        for session in &self.sessions {
            writeln!(
                f,
                "session {} (pid {}): {} network(s), {} buffer(s)",
                session.id,
                session.pid,
                session.networks.len(),
                session.buffers
            )?;
            for (nid, stats) in &session.networks {
                writeln!(
                    f,
                    "  network {nid}: {} inference(s), total {}us, last {}us, {} buffer(s) / {} bytes",
                    stats.inferences,
                    stats.total_us,
                    stats.last_us,
                    stats.io_buffer_count,
                    stats.io_buffer_bytes
                )?;
            }
        }
        Ok(())
    }
}

/// An attached accelerator.
#[derive(Debug, Clone)]
pub struct Device {
    shared: Arc<DeviceShared>,
}

impl Device {
    /// Bring the device up: allocate the driver buffers, load the Trusted
    /// Application and open the peer session.
    ///
    /// The clock domain stays off until the first session opens.
    ///
    /// # Errors
    ///
    /// Returns error if the driver buffers cannot be allocated or the peer
    /// refuses the session.
    pub fn attach(
        config: DeviceConfig,
        channel: Arc<dyn SecureChannel>,
        memory: MemoryManager,
        power: Arc<dyn PowerControl>,
    ) -> Result<Self> {
        let non_secure =
            memory.allocate(MemoryKind::DriverBuffer, false, config.driver_buffer_size)?;
        let secure = memory.allocate(MemoryKind::DriverBuffer, true, config.driver_buffer_size)?;

        channel.load_ta(&config.ta_image)?;
        channel.open_session(&non_secure, &secure)?;

        let signal = Arc::new(CompletionSignal::new());
        let irq = Arc::new(IrqLine::new());
        let engine = ExecutionEngine::new(
            Arc::clone(&channel),
            Arc::clone(&signal),
            Arc::clone(&irq),
            config.irq_timeout,
        );
        info!(
            "Device attached ({} backend, irq timeout {}ms)",
            channel.backend_type(),
            config.irq_timeout.as_millis()
        );

        Ok(Self {
            shared: Arc::new(DeviceShared {
                config,
                channel,
                memory,
                power,
                engine,
                signal,
                irq,
                sessions: Mutex::new(SessionList::default()),
                next_session: AtomicU64::new(1),
                driver_buffers: (non_secure, secure),
            }),
        })
    }

    /// Open a client session for process `pid`.
    ///
    /// The first session powers the device on unless it is suspended.
    ///
    /// # Errors
    ///
    /// Returns error if the clock domain cannot be powered on.
    pub fn open_session(&self, pid: u32) -> Result<Arc<Session>> {
        let mut list = self.shared.sessions.lock();
        list.open.retain(|(_, weak)| weak.strong_count() > 0);
        if list.open.is_empty() && !list.suspended {
            self.shared.power.power_on()?;
            info!("First session opened, device powered on");
        }
        let id = self.shared.next_session.fetch_add(1, Ordering::Relaxed);
        let session = Arc::new(Session::new(id, pid, Arc::clone(&self.shared)));
        list.open.push((id, Arc::downgrade(&session)));
        debug!("session {id} opened by pid {pid}");
        Ok(session)
    }

    /// Power down for platform suspend. Does nothing with no open sessions.
    pub fn suspend(&self) {
        let mut list = self.shared.sessions.lock();
        if list.open.is_empty() || list.suspended {
            return;
        }
        self.shared.engine.quiesce(|| self.shared.power.power_off());
        list.suspended = true;
        info!("Device suspended");
    }

    /// Power back up after suspend. The execution unit is activated by the
    /// next run, in whatever mode that network needs.
    ///
    /// # Errors
    ///
    /// Returns error if the clock domain cannot be powered on.
    pub fn resume(&self) -> Result<()> {
        let mut list = self.shared.sessions.lock();
        if !list.suspended {
            return Ok(());
        }
        if !list.open.is_empty() {
            self.shared.power.power_on()?;
        }
        list.suspended = false;
        info!("Device resumed");
        Ok(())
    }

    /// Suspended by [`Self::suspend`].
    pub fn is_suspended(&self) -> bool {
        self.shared.sessions.lock().suspended
    }

    /// Open sessions.
    pub fn session_count(&self) -> usize {
        self.shared.sessions.lock().open.len()
    }

    /// Callback to hand to the secure peer for completion interrupts.
    ///
    /// The callback holds the device weakly; once the device is gone it does
    /// nothing.
    pub fn interrupt_handler(&self) -> InterruptHandler {
        let weak = Arc::downgrade(&self.shared);
        Arc::new(move || {
            if let Some(shared) = weak.upgrade() {
                shared.on_interrupt();
            }
        })
    }

    /// Handle that cancels the run currently waiting on this device.
    pub fn run_interrupter(&self) -> RunInterrupter {
        RunInterrupter::new(Arc::clone(&self.shared.signal))
    }

    /// Secure channel in use.
    pub fn channel(&self) -> &Arc<dyn SecureChannel> {
        &self.shared.channel
    }

    /// Region manager.
    pub fn memory(&self) -> &MemoryManager {
        &self.shared.memory
    }

    /// Configuration fixed at attach.
    pub fn config(&self) -> &DeviceConfig {
        &self.shared.config
    }

    /// Mode the execution unit is activated in.
    pub fn active_mode(&self) -> Option<ActivationMode> {
        self.shared.engine.active_mode()
    }

    /// Device-wide run counters.
    pub fn stats(&self) -> EngineStats {
        self.shared.engine.stats()
    }

    /// Driver buffers handed to the peer, non-secure first.
    pub fn driver_buffers(&self) -> (&Region, &Region) {
        let (non_secure, secure) = &self.shared.driver_buffers;
        (non_secure, secure)
    }

    /// Diagnostic view of the device and every open session.
    pub fn snapshot(&self) -> DeviceSnapshot {
        let (open, reservation, suspended) = {
            let list = self.shared.sessions.lock();
            let open: Vec<Arc<Session>> =
                list.open.iter().filter_map(|(_, weak)| weak.upgrade()).collect();
            (open, list.reservation, list.suspended)
        };
        DeviceSnapshot {
            stats: self.stats(),
            active_mode: self.active_mode(),
            powered: self.shared.power.is_powered(),
            suspended,
            reservation,
            sessions: open.iter().map(|s| s.snapshot()).collect(),
        }
    }
}
