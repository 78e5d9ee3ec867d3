//! Memory region manager.
//!
//! Allocates device-visible memory from a [`DmaHeap`], wraps memory handed
//! in from elsewhere (external handles, caller slices), and describes
//! regions as physical segment lists for the secure peer.
//!
//! ```text
//! kind             pool
//! PageTable        contiguous (secure or non-secure)
//! DriverBuffer     contiguous (secure or non-secure)
//! everything else  scattered
//! ```

mod clip;
mod heap;
mod region;

pub use clip::clip as clip_segment_list;
pub use heap::{DmaHeap, HeapConfig, SimulatedHeap};
pub use region::{PinnedRegion, Region};

use crate::error::{NpuError, Result};
use parking_lot::Mutex;
use region::Allocation;
use std::collections::HashMap;
use std::sync::Arc;
use tnpu_chip::page::{align_up, is_aligned, pages_for, NPU_PAGE_SIZE};

/// What a region is used for.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MemoryKind {
    /// Constant pool (weights)
    Pool,
    /// Network command stream
    Code,
    /// Address-translation tables
    PageTable,
    /// Scratch memory the secure peer owns for the device lifetime
    DriverBuffer,
    /// Input or output tensor storage
    IoBuffer,
    /// Per-operation profiling records
    ProfileOperations,
    /// Copy of the model's public data
    PublicData,
}

impl MemoryKind {
    /// Must come from a physically contiguous pool.
    pub const fn requires_contiguous(self) -> bool {
        matches!(self, Self::PageTable | Self::DriverBuffer)
    }
}

/// One physically contiguous byte range.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Segment {
    /// Physical start address
    pub addr: u64,
    /// Length in bytes
    pub len: u64,
}

impl Segment {
    /// One past the last byte.
    pub const fn end(&self) -> u64 {
        self.addr + self.len
    }

    /// Device pages spanned when mapped from a page boundary, rounding up.
    pub const fn pages(&self) -> u64 {
        pages_for(self.len)
    }
}

/// Handle to memory shareable across processes (a dma-buf fd stand-in).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ExternalHandle(i32);

impl ExternalHandle {
    /// Wrap a raw descriptor number.
    pub const fn from_raw(fd: i32) -> Self {
        Self(fd)
    }

    /// Raw descriptor number.
    pub const fn raw(self) -> i32 {
        self.0
    }
}

#[derive(Debug)]
struct ExportTable {
    next: i32,
    entries: HashMap<i32, Arc<Allocation>>,
}

/// Region manager over one heap.
///
/// Cloning shares the heap and the external-handle table.
#[derive(Debug, Clone)]
pub struct MemoryManager {
    heap: Arc<dyn DmaHeap>,
    exports: Arc<Mutex<ExportTable>>,
}

impl MemoryManager {
    /// Manager allocating from `heap`.
    pub fn new(heap: Arc<dyn DmaHeap>) -> Self {
        Self {
            heap,
            exports: Arc::new(Mutex::new(ExportTable {
                next: 3,
                entries: HashMap::new(),
            })),
        }
    }

    /// Underlying heap.
    pub fn heap(&self) -> &Arc<dyn DmaHeap> {
        &self.heap
    }

    /// Allocate `size` bytes of `kind` memory.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] for a zero size, or
    /// [`NpuError::OutOfMemory`] when the pool is exhausted.
    pub fn allocate(&self, kind: MemoryKind, secure: bool, size: u64) -> Result<Region> {
        if size == 0 {
            return Err(NpuError::invalid_argument(format!("zero-size {kind:?} allocation")));
        }
        let contiguous = kind.requires_contiguous();
        let segments = self.heap.allocate(align_up(size), contiguous, secure)?;
        tracing::debug!(
            "allocated {kind:?} region: {size} bytes, secure={secure}, {} segment(s)",
            segments.len()
        );
        Ok(Region {
            alloc: Arc::new(Allocation {
                heap: Some(Arc::clone(&self.heap)),
                segments,
                secure,
            }),
            kind,
            offset: 0,
            size,
        })
    }

    /// Wrap `size` bytes at `offset` of externally supplied memory.
    ///
    /// # Errors
    ///
    /// Returns error if `size` is zero, `offset` is not page aligned, the
    /// handle is unknown, or the memory cannot hold `align_up(size) + offset`.
    pub fn wrap_external(&self, handle: ExternalHandle, size: u64, offset: u64) -> Result<Region> {
        if size == 0 {
            return Err(NpuError::invalid_argument("zero-size external region"));
        }
        if !is_aligned(offset) {
            return Err(NpuError::Misaligned { offset });
        }
        let alloc = self
            .exports
            .lock()
            .entries
            .get(&handle.raw())
            .cloned()
            .ok_or_else(|| NpuError::not_found("external memory", handle.raw().unsigned_abs()))?;
        let needed = align_up(size).saturating_add(offset);
        if needed > alloc.len() {
            return Err(NpuError::invalid_argument(format!(
                "external memory {} holds {} bytes, need {needed}",
                handle.raw(),
                alloc.len()
            )));
        }
        Ok(Region {
            alloc,
            kind: MemoryKind::IoBuffer,
            offset,
            size,
        })
    }

    /// Describe caller memory as a region, pinning it for the borrow.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::InvalidArgument`] for an empty slice.
    pub fn wrap_caller_memory<'a>(&self, bytes: &'a [u8]) -> Result<PinnedRegion<'a>> {
        if bytes.is_empty() {
            return Err(NpuError::invalid_argument("empty caller buffer"));
        }
        let addr = bytes.as_ptr() as u64;
        let first_page = addr & !(NPU_PAGE_SIZE - 1);
        let end = align_up(addr + bytes.len() as u64);
        let region = Region {
            alloc: Arc::new(Allocation {
                heap: None,
                segments: vec![Segment {
                    addr: first_page,
                    len: end - first_page,
                }],
                secure: false,
            }),
            kind: MemoryKind::PublicData,
            offset: addr - first_page,
            size: bytes.len() as u64,
        };
        Ok(PinnedRegion::new(bytes, region))
    }

    /// Drop a region. Backing pages go back to the heap once no other
    /// region or external handle shares them.
    pub fn free(&self, region: Region) {
        tracing::trace!(
            "freeing {:?} region of {} bytes at {:#x}",
            region.kind,
            region.size,
            region.base_address()
        );
        drop(region);
    }

    /// Every backing segment of `region`.
    pub fn describe_segments(&self, region: &Region) -> Vec<Segment> {
        region.segments().to_vec()
    }

    /// Segments of `region` restricted to `[offset, offset + size)`.
    ///
    /// # Errors
    ///
    /// Returns error if the range is empty or outside the region.
    pub fn clip_segments(&self, region: &Region, offset: u64, size: u64) -> Result<Vec<Segment>> {
        region.clip(offset, size)
    }

    /// Export a region's allocation under a new external handle.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::HandleExhausted`] once every handle value has been issued.
    pub fn export(&self, region: &Region) -> Result<ExternalHandle> {
        let mut table = self.exports.lock();
        let fd = table.next;
        table.next = fd
            .checked_add(1)
            .ok_or(NpuError::HandleExhausted { kind: "external handle" })?;
        table.entries.insert(fd, Arc::clone(&region.alloc));
        tracing::debug!("exported {:?} region as handle {fd}", region.kind);
        Ok(ExternalHandle(fd))
    }

    /// Allocate memory as another process would and export it.
    ///
    /// # Errors
    ///
    /// Returns error if the allocation fails.
    pub fn import_foreign(&self, size: u64, secure: bool) -> Result<ExternalHandle> {
        let region = self.allocate(MemoryKind::IoBuffer, secure, size)?;
        self.export(&region)
    }

    /// Close an external handle. Regions already wrapping it stay valid.
    ///
    /// Returns `false` if the handle was unknown.
    pub fn close_external(&self, handle: ExternalHandle) -> bool {
        self.exports.lock().entries.remove(&handle.raw()).is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = NPU_PAGE_SIZE;

    fn manager() -> MemoryManager {
        MemoryManager::new(Arc::new(SimulatedHeap::new(HeapConfig {
            scatter_chunk_pages: 1,
            ..HeapConfig::default()
        })))
    }

    #[test]
    fn kinds_choose_pools() {
        let mm = manager();
        let pt = mm.allocate(MemoryKind::PageTable, false, 16 * PAGE).unwrap();
        assert!(pt.is_contiguous());
        let code = mm.allocate(MemoryKind::Code, false, 3 * PAGE).unwrap();
        assert_eq!(code.segments().len(), 3);
        assert!(mm.allocate(MemoryKind::Code, false, 0).is_err());
    }

    #[test]
    fn regions_free_on_drop() {
        let mm = manager();
        let region = mm.allocate(MemoryKind::IoBuffer, false, 256).unwrap();
        assert_eq!(mm.heap().used(), PAGE);
        let copy = region.clone();
        mm.free(region);
        assert_eq!(mm.heap().used(), PAGE);
        drop(copy);
        assert_eq!(mm.heap().used(), 0);
    }

    #[test]
    fn write_read_across_segments() {
        let mm = manager();
        let region = mm.allocate(MemoryKind::IoBuffer, false, 2 * PAGE).unwrap();
        let data: Vec<u8> = (0..=255u8).cycle().take(300).collect();
        region.write(PAGE - 100, &data).unwrap();
        let mut back = vec![0u8; 300];
        region.read(PAGE - 100, &mut back).unwrap();
        assert_eq!(back, data);
        assert!(region.write(2 * PAGE - 1, &[1, 2]).is_err());
    }

    #[test]
    fn secure_region_not_cpu_accessible() {
        let mm = manager();
        let region = mm.allocate(MemoryKind::PageTable, true, PAGE).unwrap();
        assert!(matches!(
            region.write(0, &[1]),
            Err(NpuError::PermissionDenied { .. })
        ));
    }

    #[test]
    fn external_offset_must_be_aligned() {
        let mm = manager();
        let fd = mm.import_foreign(4 * PAGE, false).unwrap();
        assert!(matches!(
            mm.wrap_external(fd, 100, 10),
            Err(NpuError::Misaligned { offset: 10 })
        ));
        assert!(mm.wrap_external(fd, 0, 0).is_err());
        let region = mm.wrap_external(fd, 100, PAGE).unwrap();
        assert_eq!(region.offset(), PAGE);
        assert_eq!(region.base_address(), region.segments()[1].addr);
    }

    #[test]
    fn external_must_hold_aligned_size() {
        let mm = manager();
        let fd = mm.import_foreign(2 * PAGE, false).unwrap();
        assert!(mm.wrap_external(fd, PAGE + 1, PAGE).is_err());
        assert!(mm.wrap_external(fd, PAGE, PAGE).is_ok());
        assert!(mm.wrap_external(ExternalHandle::from_raw(999), 1, 0).is_err());
    }

    #[test]
    fn closed_handle_keeps_wrapped_region_alive() {
        let mm = manager();
        let fd = mm.import_foreign(PAGE, false).unwrap();
        let region = mm.wrap_external(fd, PAGE, 0).unwrap();
        assert!(mm.close_external(fd));
        assert!(!mm.close_external(fd));
        assert_eq!(mm.heap().used(), PAGE);
        region.write(0, b"still here").unwrap();
        drop(region);
        assert_eq!(mm.heap().used(), 0);
    }

    #[test]
    fn export_ids_run_out_without_wrapping() {
        let mm = manager();
        let region = mm.allocate(MemoryKind::IoBuffer, false, PAGE).unwrap();
        mm.exports.lock().next = i32::MAX - 1;
        assert_eq!(mm.export(&region).unwrap().raw(), i32::MAX - 1);
        assert!(matches!(
            mm.export(&region),
            Err(NpuError::HandleExhausted { kind: "external handle" })
        ));
        assert!(matches!(
            mm.import_foreign(PAGE, false),
            Err(NpuError::HandleExhausted { .. })
        ));
        assert!(mm.close_external(ExternalHandle::from_raw(i32::MAX - 1)));
    }

    #[test]
    fn clip_starts_at_region_offset() {
        let mm = manager();
        let fd = mm.import_foreign(6 * PAGE, false).unwrap();
        let region = mm.wrap_external(fd, 3 * PAGE, 2 * PAGE).unwrap();
        let segs = mm.clip_segments(&region, 100, PAGE).unwrap();
        assert_eq!(segs[0].addr, region.address_at(100).unwrap());
        assert_eq!(segs.iter().map(|s| s.len).sum::<u64>(), PAGE);
        assert!(mm.clip_segments(&region, 0, 3 * PAGE + 1).is_err());
        assert_eq!(mm.describe_segments(&region).len(), 6);
    }

    #[test]
    fn caller_memory_keeps_offset() {
        let mm = manager();
        let bytes = vec![5u8; 5000];
        let region = mm.wrap_caller_memory(&bytes[10..]).unwrap();
        assert_eq!(region.size(), 4990);
        assert_eq!(region.base_address(), bytes[10..].as_ptr() as u64);
        assert!(region.offset() < PAGE);
        assert!(mm.wrap_caller_memory(&[]).is_err());
    }
}
