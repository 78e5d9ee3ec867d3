//! IO buffers.

use crate::channel::SecureChannel;
use crate::error::{NpuError, Result};
use crate::mem::{ExternalHandle, MemoryKind, MemoryManager, Region};
use tracing::{debug, warn};

/// Where a buffer's memory came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BufferOrigin {
    /// Allocated by this session and exported to the caller
    Allocated,
    /// Wrapped from an external memory handle
    External,
    /// Shares another buffer's memory through its memory id
    MemId,
}

/// Tensor storage registered with the secure peer.
#[derive(Debug)]
pub struct IoBuffer {
    region: Option<Region>,
    peer_bid: Option<u32>,
    mem_id: u32,
    origin: BufferOrigin,
    secure: bool,
    size: u64,
    export: Option<ExternalHandle>,
    pub(crate) ref_count: u32,
}

impl IoBuffer {
    /// Allocate `size` bytes of non-secure memory and export it.
    pub(crate) fn allocate(
        size: u64,
        memory: &MemoryManager,
        channel: &dyn SecureChannel,
    ) -> Result<Self> {
        let region = memory.allocate(MemoryKind::IoBuffer, false, size)?;
        let export = memory.export(&region)?;
        let peer = match channel.create_io_buffer(&region, false) {
            Ok(peer) => peer,
            Err(e) => {
                memory.close_external(export);
                return Err(e);
            }
        };
        debug!(
            "io buffer: {size} bytes, peer bid {}, mem_id {}, fd {}",
            peer.bid,
            peer.mem_id,
            export.raw()
        );
        Ok(Self {
            region: Some(region),
            peer_bid: Some(peer.bid),
            mem_id: peer.mem_id,
            origin: BufferOrigin::Allocated,
            secure: false,
            size,
            export: Some(export),
            ref_count: 0,
        })
    }

    /// Wrap `size` bytes at `offset` of external memory.
    pub(crate) fn from_external(
        handle: ExternalHandle,
        offset: u64,
        size: u64,
        secure: bool,
        memory: &MemoryManager,
        channel: &dyn SecureChannel,
    ) -> Result<Self> {
        let region = memory.wrap_external(handle, size, offset)?;
        if region.is_secure() != secure {
            return Err(NpuError::invalid_argument(format!(
                "external memory {} is {}secure",
                handle.raw(),
                if region.is_secure() { "" } else { "not " }
            )));
        }
        let peer = channel.create_io_buffer(&region, secure)?;
        Ok(Self {
            region: Some(region),
            peer_bid: Some(peer.bid),
            mem_id: peer.mem_id,
            origin: BufferOrigin::External,
            secure,
            size,
            export: None,
            ref_count: 0,
        })
    }

    /// Share `size` bytes at `offset` of the memory named by `mem_id`.
    pub(crate) fn from_mem_id(
        mem_id: u32,
        offset: u32,
        size: u32,
        channel: &dyn SecureChannel,
    ) -> Result<Self> {
        if size == 0 {
            return Err(NpuError::invalid_argument("zero-size shared buffer"));
        }
        let bid = channel.create_io_buffer_from_mem_id(mem_id, offset, size)?;
        Ok(Self {
            region: None,
            peer_bid: Some(bid),
            mem_id,
            origin: BufferOrigin::MemId,
            secure: false,
            size: u64::from(size),
            export: None,
            ref_count: 0,
        })
    }

    /// Peer buffer id.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidState`] once the peer side is released.
    pub fn peer_bid(&self) -> Result<u32> {
        self.peer_bid
            .ok_or_else(|| NpuError::invalid_state("io buffer has no peer id"))
    }

    /// Memory id other sessions can share.
    pub fn mem_id(&self) -> u32 {
        self.mem_id
    }

    /// Size in bytes.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Origin of the memory.
    pub fn origin(&self) -> BufferOrigin {
        self.origin
    }

    /// Registered as secure.
    pub fn is_secure(&self) -> bool {
        self.secure
    }

    /// Live attachments.
    pub fn ref_count(&self) -> u32 {
        self.ref_count
    }

    /// Backing region, absent for memory shared by id.
    pub fn region(&self) -> Option<&Region> {
        self.region.as_ref()
    }

    /// Handle exported to the caller, for allocated buffers.
    pub fn export(&self) -> Option<ExternalHandle> {
        self.export
    }

    /// Release the peer side, the exported handle and the memory.
    pub(crate) fn release(mut self, memory: &MemoryManager, channel: &dyn SecureChannel) {
        if let Some(bid) = self.peer_bid.take() {
            if let Err(e) = channel.destroy_io_buffer(bid) {
                warn!("Peer refused to destroy io buffer {bid}: {e}");
            }
        }
        if let Some(handle) = self.export.take() {
            memory.close_external(handle);
        }
        if let Some(region) = self.region.take() {
            memory.free(region);
        }
    }
}
