//! Described blocks of device-addressable memory.

use super::{clip, DmaHeap, MemoryKind, Segment};
use crate::error::{NpuError, Result};
use std::marker::PhantomData;
use std::ops::Deref;
use std::sync::Arc;

/// Backing pages shared by every [`Region`] cut from one allocation.
///
/// Heap pages go back to the heap when the last holder is dropped.
#[derive(Debug)]
pub(crate) struct Allocation {
    pub(crate) heap: Option<Arc<dyn DmaHeap>>,
    pub(crate) segments: Vec<Segment>,
    pub(crate) secure: bool,
}

impl Allocation {
    pub(crate) fn len(&self) -> u64 {
        self.segments.iter().map(|s| s.len).sum()
    }
}

impl Drop for Allocation {
    fn drop(&mut self) {
        if let Some(heap) = &self.heap {
            heap.release(&self.segments);
        }
    }
}

/// A window of `size` bytes starting `offset` bytes into an allocation.
#[derive(Debug, Clone)]
pub struct Region {
    pub(crate) alloc: Arc<Allocation>,
    pub(crate) kind: MemoryKind,
    pub(crate) offset: u64,
    pub(crate) size: u64,
}

impl Region {
    /// What the region holds.
    pub fn kind(&self) -> MemoryKind {
        self.kind
    }

    /// Size in bytes as requested.
    pub fn size(&self) -> u64 {
        self.size
    }

    /// Offset of the first byte within the backing segments.
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Lives in secure physical address space.
    pub fn is_secure(&self) -> bool {
        self.alloc.secure
    }

    /// Backed by a single physical segment.
    pub fn is_contiguous(&self) -> bool {
        self.alloc.segments.len() == 1
    }

    /// Every backing segment, including bytes before `offset` or past `size`.
    pub fn segments(&self) -> &[Segment] {
        &self.alloc.segments
    }

    /// Physical address of byte `at` of the region.
    pub fn address_at(&self, at: u64) -> Option<u64> {
        if at >= self.size {
            return None;
        }
        clip::address_of(&self.alloc.segments, self.offset + at)
    }

    /// Physical address of the first byte.
    pub fn base_address(&self) -> u64 {
        self.address_at(0).unwrap_or_default()
    }

    /// Segments covering bytes `[offset, offset + size)` of the region.
    ///
    /// # Errors
    ///
    /// Returns error if the range is empty or outside the region.
    pub fn clip(&self, offset: u64, size: u64) -> Result<Vec<Segment>> {
        let end = offset.checked_add(size).unwrap_or(u64::MAX);
        if end > self.size {
            return Err(NpuError::invalid_argument(format!(
                "range {offset:#x}+{size:#x} exceeds region of {:#x} bytes",
                self.size
            )));
        }
        clip::clip(&self.alloc.segments, self.offset + offset, size)
    }

    fn cpu_heap(&self) -> Result<&Arc<dyn DmaHeap>> {
        if self.alloc.secure {
            return Err(NpuError::permission_denied(
                "secure memory is not CPU accessible",
            ));
        }
        self.alloc
            .heap
            .as_ref()
            .ok_or_else(|| NpuError::invalid_state("caller memory is accessed by the caller"))
    }

    /// Copy `data` into the region at byte `at`.
    ///
    /// # Errors
    ///
    /// Returns error if the region is secure, caller memory, or too small.
    #[allow(clippy::cast_possible_truncation)]
    pub fn write(&self, at: u64, data: &[u8]) -> Result<()> {
        if data.is_empty() {
            return Ok(());
        }
        let heap = self.cpu_heap()?;
        let mut done = 0usize;
        for seg in self.clip(at, data.len() as u64)? {
            let n = seg.len as usize;
            heap.write(seg.addr, &data[done..done + n])?;
            done += n;
        }
        Ok(())
    }

    /// Copy bytes starting at `at` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns error if the region is secure, caller memory, or too small.
    #[allow(clippy::cast_possible_truncation)]
    pub fn read(&self, at: u64, buf: &mut [u8]) -> Result<()> {
        if buf.is_empty() {
            return Ok(());
        }
        let heap = self.cpu_heap()?;
        let mut done = 0usize;
        for seg in self.clip(at, buf.len() as u64)? {
            let n = seg.len as usize;
            heap.read(seg.addr, &mut buf[done..done + n])?;
            done += n;
        }
        Ok(())
    }
}

/// Region wrapping caller memory, pinned for as long as it is borrowed.
#[derive(Debug)]
pub struct PinnedRegion<'a> {
    region: Region,
    pinned: Option<(usize, usize)>,
    _bytes: PhantomData<&'a [u8]>,
}

impl<'a> PinnedRegion<'a> {
    pub(crate) fn new(bytes: &'a [u8], region: Region) -> Self {
        let pinned = pin(bytes);
        Self {
            region,
            pinned,
            _bytes: PhantomData,
        }
    }

    /// The pages are locked in host memory.
    pub fn is_pinned(&self) -> bool {
        self.pinned.is_some()
    }
}

impl Deref for PinnedRegion<'_> {
    type Target = Region;

    fn deref(&self) -> &Region {
        &self.region
    }
}

impl Drop for PinnedRegion<'_> {
    fn drop(&mut self) {
        if let Some((addr, len)) = self.pinned.take() {
            // SAFETY: the range was locked by `pin` from a slice that is still
            // borrowed for `'a`; unlocking does not touch its contents.
            let unlocked = unsafe { rustix::mm::munlock(addr as *mut std::ffi::c_void, len) };
            if let Err(e) = unlocked {
                tracing::warn!("munlock of {len} bytes failed: {e}");
            }
        }
    }
}

fn pin(bytes: &[u8]) -> Option<(usize, usize)> {
    if bytes.is_empty() {
        return None;
    }
    // Lock whole host pages; the borrowed slice need not start on one.
    let host_page = rustix::param::page_size();
    let start = bytes.as_ptr() as usize & !(host_page - 1);
    let end = (bytes.as_ptr() as usize + bytes.len()).next_multiple_of(host_page);
    let len = end - start;
    // SAFETY: the range covers a live borrowed slice rounded out to host
    // pages; mlock only changes residency and never writes through the pointer.
    match unsafe { rustix::mm::mlock(start as *mut std::ffi::c_void, len) } {
        Ok(()) => Some((start, len)),
        Err(e) => {
            tracing::warn!("could not pin {} bytes of caller memory ({e}); continuing unpinned", bytes.len());
            None
        }
    }
}
