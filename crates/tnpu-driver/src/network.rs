//! Networks and their IO-buffer attachments.
//!
//! A network owns its device regions and its attachment table. Creating one
//! parses the model header before anything else is touched; every region
//! allocated along the way is freed by drop if a later step fails.

use crate::buffer::IoBuffer;
use crate::channel::{ActivationMode, NetworkUpload, SecureChannel};
use crate::engine::{LayerProfile, RunReport, RunTarget};
use crate::error::{NpuError, Result};
use crate::handle::{HandleKey, HandleTable};
use crate::mem::{MemoryKind, MemoryManager, Region};
use tnpu_models::{ModelError, ModelHeader, ResourceDescriptor, ResourceSizing, HEADER_SIZE};
use tracing::{info, warn};

/// Slot an attachment is bound to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SlotRole {
    /// Input slot index
    Input(u32),
    /// Output slot index
    Output(u32),
}

/// One IO buffer bound to one network.
#[derive(Debug)]
pub struct Attachment {
    buffer: HandleKey,
    peer_aid: u32,
    bytes: u64,
    role: Option<SlotRole>,
}

impl Attachment {
    /// Handle of the attached buffer.
    pub fn buffer(&self) -> u32 {
        self.buffer.handle
    }

    /// Peer attachment id.
    pub fn peer_aid(&self) -> u32 {
        self.peer_aid
    }

    /// Slot binding, once set.
    pub fn role(&self) -> Option<SlotRole> {
        self.role
    }
}

/// Running statistics of a network.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct NetworkStats {
    /// Completed runs
    pub inferences: u64,
    /// Cumulative execution time
    pub total_us: u64,
    /// Execution time of the last completed run
    pub last_us: u64,
    /// Attached buffers
    pub io_buffer_count: u32,
    /// Bytes of attached buffers
    pub io_buffer_bytes: u64,
}

/// A model registered with the secure peer.
#[derive(Debug)]
pub struct Network {
    peer_nid: Option<u32>,
    header: ModelHeader,
    descriptor: ResourceDescriptor,
    public: Region,
    page_table: Region,
    code: Region,
    pool: Option<Region>,
    profile: Option<Region>,
    attachments: HandleTable<Attachment>,
    stats: NetworkStats,
    last_profile: Vec<LayerProfile>,
}

impl Network {
    /// Parse `model`, allocate its regions and register it with the peer.
    pub(crate) fn create(
        model: &[u8],
        memory: &MemoryManager,
        channel: &dyn SecureChannel,
        max_handles: u32,
    ) -> Result<Self> {
        if model.len() < HEADER_SIZE {
            return Err(ModelError::truncated("header", HEADER_SIZE as u64, model.len() as u64).into());
        }
        let header = ModelHeader::parse(&model[..HEADER_SIZE])?;
        header.check_upload_size(model.len() as u64)?;

        let public_len = usize::try_from(header.public_data_length())
            .map_err(|_| NpuError::invalid_argument("public data exceeds address space"))?;
        let (public_bytes, payload_bytes) = model.split_at(public_len);
        let public = memory.allocate(MemoryKind::PublicData, false, public_len as u64)?;
        public.write(0, public_bytes)?;

        let descriptor = ResourceDescriptor::from_public_data(public_bytes)?;
        let sizing = ResourceSizing::plan(&header, &descriptor);

        let page_table =
            memory.allocate(MemoryKind::PageTable, sizing.secure, sizing.page_table_size)?;
        let code = memory.allocate(MemoryKind::Code, sizing.secure, sizing.code_size)?;
        let pool = (sizing.pool_size > 0)
            .then(|| memory.allocate(MemoryKind::Pool, sizing.secure, sizing.pool_size))
            .transpose()?;
        let profile = (sizing.profile_size > 0)
            .then(|| memory.allocate(MemoryKind::ProfileOperations, false, sizing.profile_size))
            .transpose()?;
        let payload = memory.wrap_caller_memory(payload_bytes)?;

        let nid = channel.create_network(&NetworkUpload {
            header: &public,
            payload: &payload,
            code: &code,
            page_table: &page_table,
            pool: pool.as_ref(),
            profile: profile.as_ref(),
        })?;
        info!(
            "Created network {nid}: code {} B, page table {} B, pool {} B, secure={}, profiling={}",
            sizing.code_size, sizing.page_table_size, sizing.pool_size, sizing.secure, sizing.profiling
        );

        Ok(Self {
            peer_nid: Some(nid),
            header,
            descriptor,
            public,
            page_table,
            code,
            pool,
            profile,
            attachments: HandleTable::new("attachment", max_handles),
            stats: NetworkStats::default(),
            last_profile: Vec::new(),
        })
    }

    /// Peer network id.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidState`] once the network is torn down.
    pub fn peer_nid(&self) -> Result<u32> {
        self.peer_nid
            .ok_or_else(|| NpuError::invalid_state("network has no peer id"))
    }

    /// Parsed model header.
    pub fn header(&self) -> &ModelHeader {
        &self.header
    }

    /// Resource descriptor from the public metadata.
    pub fn descriptor(&self) -> &ResourceDescriptor {
        &self.descriptor
    }

    /// Code and pool live in secure memory.
    pub fn is_secure(&self) -> bool {
        self.header.is_secure()
    }

    /// Built in profiling mode.
    pub fn is_profiling(&self) -> bool {
        self.header.is_profiling()
    }

    /// Mode the execution unit must be in to run this network.
    pub fn activation_mode(&self) -> ActivationMode {
        if self.is_secure() {
            ActivationMode::Secure
        } else {
            ActivationMode::NonSecure
        }
    }

    /// Running statistics.
    pub fn stats(&self) -> NetworkStats {
        self.stats
    }

    /// Per-layer timings of the last completed profiling run.
    pub fn last_profile(&self) -> &[LayerProfile] {
        &self.last_profile
    }

    /// Attachment table.
    pub fn attachments(&self) -> &HandleTable<Attachment> {
        &self.attachments
    }

    /// Regions owned by the network.
    pub fn regions(&self) -> impl Iterator<Item = &Region> {
        [Some(&self.public), Some(&self.page_table), Some(&self.code)]
            .into_iter()
            .chain([self.pool.as_ref(), self.profile.as_ref()])
            .flatten()
    }

    pub(crate) fn run_target(&self) -> Result<RunTarget<'_>> {
        Ok(RunTarget {
            nid: self.peer_nid()?,
            mode: self.activation_mode(),
            profiling: self.is_profiling(),
            profile: self.profile.as_ref(),
            layer_operations: &self.descriptor.layer_operations,
        })
    }

    pub(crate) fn record_run(&mut self, report: &RunReport) {
        self.stats.inferences += 1;
        self.stats.total_us = self.stats.total_us.saturating_add(report.elapsed_us);
        self.stats.last_us = report.elapsed_us;
        if self.is_profiling() {
            self.last_profile.clone_from(&report.layers);
        }
    }

    /// Bind `buffer` (live under `key`) to this network.
    pub(crate) fn attach(
        &mut self,
        channel: &dyn SecureChannel,
        key: HandleKey,
        buffer: &mut IoBuffer,
    ) -> Result<u32> {
        let nid = self.peer_nid()?;
        let bid = buffer.peer_bid()?;
        let bytes = buffer.size();
        let aid = self.attachments.insert_with(|_| {
            let peer_aid = channel.attach_io_buffer(nid, bid)?;
            Ok(Attachment {
                buffer: key,
                peer_aid,
                bytes,
                role: None,
            })
        })?;
        buffer.ref_count += 1;
        self.stats.io_buffer_count += 1;
        self.stats.io_buffer_bytes += bytes;
        Ok(aid)
    }

    /// Unbind attachment `aid`.
    pub(crate) fn detach(
        &mut self,
        channel: &dyn SecureChannel,
        aid: u32,
        buffers: &mut HandleTable<IoBuffer>,
    ) -> Result<()> {
        let nid = self.peer_nid()?;
        let peer_aid = self.attachments.lookup(aid)?.peer_aid;
        channel.detach_io_buffer(nid, peer_aid)?;
        if let Some(attachment) = self.attachments.release(aid) {
            self.forget(&attachment, buffers);
        }
        Ok(())
    }

    /// Bind attachment `aid` to an input or output slot.
    pub(crate) fn bind_slot(
        &mut self,
        channel: &dyn SecureChannel,
        aid: u32,
        role: SlotRole,
    ) -> Result<()> {
        let nid = self.peer_nid()?;
        let attachment = self.attachments.lookup_mut(aid)?;
        match role {
            SlotRole::Input(index) => channel.set_input(nid, attachment.peer_aid, index)?,
            SlotRole::Output(index) => channel.set_output(nid, attachment.peer_aid, index)?,
        }
        attachment.role = Some(role);
        Ok(())
    }

    fn forget(&mut self, attachment: &Attachment, buffers: &mut HandleTable<IoBuffer>) {
        if let Some(buffer) = buffers.get_by_key_mut(attachment.buffer) {
            buffer.ref_count = buffer.ref_count.saturating_sub(1);
        }
        self.stats.io_buffer_count = self.stats.io_buffer_count.saturating_sub(1);
        self.stats.io_buffer_bytes = self.stats.io_buffer_bytes.saturating_sub(attachment.bytes);
    }

    /// Detach everything, release the peer network, then free the regions.
    pub(crate) fn destroy(
        mut self,
        memory: &MemoryManager,
        channel: &dyn SecureChannel,
        buffers: &mut HandleTable<IoBuffer>,
    ) {
        let nid = self.peer_nid.take();
        for (aid, attachment) in self.attachments.drain() {
            if let Some(nid) = nid {
                if let Err(e) = channel.detach_io_buffer(nid, attachment.peer_aid) {
                    warn!("Detaching attachment {aid} failed: {e}");
                }
            }
            self.forget(&attachment, buffers);
        }
        if let Some(nid) = nid {
            if let Err(e) = channel.destroy_network(nid) {
                warn!("Peer refused to destroy network {nid}: {e}");
            }
        }
        let Self {
            public,
            page_table,
            code,
            pool,
            profile,
            ..
        } = self;
        for region in [Some(public), Some(page_table), Some(code), pool, profile]
            .into_iter()
            .flatten()
        {
            memory.free(region);
        }
    }
}
