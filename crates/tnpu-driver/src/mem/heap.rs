//! Physical memory providers.
//!
//! [`DmaHeap`] is the seam between the region manager and whatever hands
//! out device-visible pages. [`SimulatedHeap`] is the in-tree provider: three
//! bounded pools at fixed physical windows plus a sparse backing store, so
//! regions can be written, read back and inspected by the simulated peer.

use super::Segment;
use crate::error::{NpuError, Result};
use parking_lot::Mutex;
use std::collections::{BTreeMap, HashMap};
use std::fmt::Debug;
use tnpu_chip::page::{is_aligned, NPU_PAGE_SIZE};

/// Provider of device-visible physical pages.
pub trait DmaHeap: Debug + Send + Sync {
    /// Allocate `size` bytes (a whole number of device pages).
    ///
    /// Contiguous requests return exactly one segment.
    ///
    /// # Errors
    ///
    /// Returns [`NpuError::OutOfMemory`] if the pool cannot satisfy the request.
    fn allocate(&self, size: u64, contiguous: bool, secure: bool) -> Result<Vec<Segment>>;

    /// Return segments obtained from [`DmaHeap::allocate`].
    fn release(&self, segments: &[Segment]);

    /// Copy physical memory at `addr` into `buf`.
    ///
    /// # Errors
    ///
    /// Returns error if any byte is outside a live allocation.
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()>;

    /// Copy `data` to physical memory at `addr`.
    ///
    /// # Errors
    ///
    /// Returns error if any byte is outside a live allocation.
    fn write(&self, addr: u64, data: &[u8]) -> Result<()>;

    /// Bytes currently allocated across all pools.
    fn used(&self) -> u64;
}

/// Pool sizes and scatter behaviour of a [`SimulatedHeap`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HeapConfig {
    /// Non-secure contiguous pool capacity in bytes
    pub contiguous_capacity: u64,
    /// Secure contiguous pool capacity in bytes
    pub secure_capacity: u64,
    /// Scattered pool capacity in bytes
    pub scatter_capacity: u64,
    /// Largest chunk, in pages, the scattered pool hands out at once
    pub scatter_chunk_pages: u64,
}

impl Default for HeapConfig {
    fn default() -> Self {
        Self {
            contiguous_capacity: 64 << 20,
            secure_capacity: 64 << 20,
            scatter_capacity: 256 << 20,
            scatter_chunk_pages: 4,
        }
    }
}

const CONTIGUOUS_BASE: u64 = 0x4000_0000;
const SECURE_BASE: u64 = 0x8000_0000;
const SCATTER_BASE: u64 = 0x1_0000_0000;

#[derive(Debug)]
struct Pool {
    name: &'static str,
    base: u64,
    capacity: u64,
    // start address -> length, coalesced
    free: BTreeMap<u64, u64>,
}

impl Pool {
    fn new(name: &'static str, base: u64, capacity: u64) -> Self {
        let capacity = capacity & !(NPU_PAGE_SIZE - 1);
        let mut free = BTreeMap::new();
        if capacity > 0 {
            free.insert(base, capacity);
        }
        Self {
            name,
            base,
            capacity,
            free,
        }
    }

    fn contains(&self, addr: u64) -> bool {
        addr >= self.base && addr < self.base + self.capacity
    }

    fn available(&self) -> u64 {
        self.free.values().sum()
    }

    fn take_contiguous(&mut self, size: u64) -> Option<Segment> {
        let (&start, &len) = self.free.iter().find(|&(_, &len)| len >= size)?;
        self.free.remove(&start);
        if len > size {
            self.free.insert(start + size, len - size);
        }
        Some(Segment { addr: start, len: size })
    }

    // Chunks come from the top of the window downward, with one page held
    // back between them so consecutive chunks are never physically adjacent.
    fn take_scattered(&mut self, size: u64, chunk: u64) -> Option<Vec<Segment>> {
        if self.available() < size {
            return None;
        }
        let mut out = Vec::new();
        let mut holes = Vec::new();
        let mut remaining = size;
        while remaining > 0 {
            let Some((&start, &len)) = self.free.iter().next_back() else {
                if holes.is_empty() {
                    for seg in out {
                        self.put(seg);
                    }
                    return None;
                }
                // Only held-back pages remain; use them.
                for hole in holes.drain(..) {
                    self.put(hole);
                }
                continue;
            };
            let want = remaining.min(chunk).min(len);
            self.free.remove(&start);
            let chunk_start = start + len - want;
            out.push(Segment {
                addr: chunk_start,
                len: want,
            });
            remaining -= want;

            let mut rest = len - want;
            if remaining > 0 && rest >= NPU_PAGE_SIZE {
                holes.push(Segment {
                    addr: chunk_start - NPU_PAGE_SIZE,
                    len: NPU_PAGE_SIZE,
                });
                rest -= NPU_PAGE_SIZE;
            }
            if rest > 0 {
                self.free.insert(start, rest);
            }
        }
        for hole in holes {
            self.put(hole);
        }
        Some(out)
    }

    fn put(&mut self, seg: Segment) {
        let mut start = seg.addr;
        let mut len = seg.len;
        if let Some((&prev, &prev_len)) = self.free.range(..start).next_back() {
            if prev + prev_len == start {
                self.free.remove(&prev);
                start = prev;
                len += prev_len;
            }
        }
        if let Some(&next_len) = self.free.get(&(start + len)) {
            self.free.remove(&(start + len));
            len += next_len;
        }
        self.free.insert(start, len);
    }
}

#[derive(Debug)]
struct HeapState {
    contiguous: Pool,
    secure: Pool,
    scatter: Pool,
    // live segments: start -> len
    live: BTreeMap<u64, u64>,
    pages: HashMap<u64, Box<[u8]>>,
    used: u64,
}

impl HeapState {
    fn pool_for(&mut self, addr: u64) -> Option<&mut Pool> {
        if self.contiguous.contains(addr) {
            Some(&mut self.contiguous)
        } else if self.secure.contains(addr) {
            Some(&mut self.secure)
        } else if self.scatter.contains(addr) {
            Some(&mut self.scatter)
        } else {
            None
        }
    }

    fn check_live(&self, addr: u64, len: u64) -> Result<()> {
        let end = addr
            .checked_add(len)
            .ok_or_else(|| NpuError::invalid_argument("physical range overflows"))?;
        let mut at = addr;
        while at < end {
            let (&start, &seg_len) = self
                .live
                .range(..=at)
                .next_back()
                .filter(|&(&s, &l)| at < s + l)
                .ok_or_else(|| {
                    NpuError::invalid_argument(format!("physical address {at:#x} is not allocated"))
                })?;
            at = start + seg_len;
        }
        Ok(())
    }
}

/// In-memory DMA heap with bounded pools.
#[derive(Debug)]
pub struct SimulatedHeap {
    config: HeapConfig,
    state: Mutex<HeapState>,
}

impl Default for SimulatedHeap {
    fn default() -> Self {
        Self::new(HeapConfig::default())
    }
}

impl SimulatedHeap {
    /// Create a heap with the given pool sizes.
    pub fn new(config: HeapConfig) -> Self {
        Self {
            config,
            state: Mutex::new(HeapState {
                contiguous: Pool::new("contiguous", CONTIGUOUS_BASE, config.contiguous_capacity),
                secure: Pool::new("secure contiguous", SECURE_BASE, config.secure_capacity),
                scatter: Pool::new("scattered", SCATTER_BASE, config.scatter_capacity),
                live: BTreeMap::new(),
                pages: HashMap::new(),
                used: 0,
            }),
        }
    }

    /// Pool configuration.
    pub fn config(&self) -> HeapConfig {
        self.config
    }

    /// True if `addr` lies in the secure window.
    pub fn is_secure_address(&self, addr: u64) -> bool {
        self.state.lock().secure.contains(addr)
    }
}

impl DmaHeap for SimulatedHeap {
    fn allocate(&self, size: u64, contiguous: bool, secure: bool) -> Result<Vec<Segment>> {
        if size == 0 || !is_aligned(size) {
            return Err(NpuError::invalid_argument(format!(
                "heap allocation of {size} bytes is not a whole number of pages"
            )));
        }
        let chunk = self.config.scatter_chunk_pages.max(1) * NPU_PAGE_SIZE;
        let mut state = self.state.lock();
        let (segments, pool) = if contiguous {
            let pool = if secure {
                &mut state.secure
            } else {
                &mut state.contiguous
            };
            (pool.take_contiguous(size).map(|s| vec![s]), pool.name)
        } else {
            let pool = &mut state.scatter;
            (pool.take_scattered(size, chunk), pool.name)
        };
        let segments = segments.ok_or(NpuError::OutOfMemory {
            requested: size,
            pool,
        })?;
        for seg in &segments {
            state.live.insert(seg.addr, seg.len);
        }
        state.used += size;
        tracing::trace!("heap: {size} bytes from {pool} in {} segment(s)", segments.len());
        Ok(segments)
    }

    fn release(&self, segments: &[Segment]) {
        let mut state = self.state.lock();
        for seg in segments {
            if state.live.remove(&seg.addr).is_none() {
                tracing::warn!("heap: release of unknown segment {:#x}", seg.addr);
                continue;
            }
            let mut page = seg.addr;
            while page < seg.end() {
                state.pages.remove(&page);
                page += NPU_PAGE_SIZE;
            }
            state.used -= seg.len;
            if let Some(pool) = state.pool_for(seg.addr) {
                pool.put(*seg);
            }
        }
    }

    #[allow(clippy::cast_possible_truncation)]
    fn read(&self, addr: u64, buf: &mut [u8]) -> Result<()> {
        let state = self.state.lock();
        state.check_live(addr, buf.len() as u64)?;
        let mut done = 0usize;
        while done < buf.len() {
            let at = addr + done as u64;
            let page = at & !(NPU_PAGE_SIZE - 1);
            let in_page = (at - page) as usize;
            let n = (NPU_PAGE_SIZE as usize - in_page).min(buf.len() - done);
            match state.pages.get(&page) {
                Some(data) => buf[done..done + n].copy_from_slice(&data[in_page..in_page + n]),
                None => buf[done..done + n].fill(0),
            }
            done += n;
        }
        Ok(())
    }

    #[allow(clippy::cast_possible_truncation)]
    fn write(&self, addr: u64, data: &[u8]) -> Result<()> {
        let mut state = self.state.lock();
        state.check_live(addr, data.len() as u64)?;
        let mut done = 0usize;
        while done < data.len() {
            let at = addr + done as u64;
            let page = at & !(NPU_PAGE_SIZE - 1);
            let in_page = (at - page) as usize;
            let n = (NPU_PAGE_SIZE as usize - in_page).min(data.len() - done);
            let dst = state
                .pages
                .entry(page)
                .or_insert_with(|| vec![0u8; NPU_PAGE_SIZE as usize].into_boxed_slice());
            dst[in_page..in_page + n].copy_from_slice(&data[done..done + n]);
            done += n;
        }
        Ok(())
    }

    fn used(&self) -> u64 {
        self.state.lock().used
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = NPU_PAGE_SIZE;

    #[test]
    fn contiguous_is_one_segment() {
        let heap = SimulatedHeap::default();
        let segs = heap.allocate(16 * PAGE, true, false).unwrap();
        assert_eq!(segs.len(), 1);
        assert_eq!(segs[0].len, 16 * PAGE);
        assert!(!heap.is_secure_address(segs[0].addr));

        let secure = heap.allocate(PAGE, true, true).unwrap();
        assert!(heap.is_secure_address(secure[0].addr));
    }

    #[test]
    fn scattered_chunks_are_not_adjacent() {
        let heap = SimulatedHeap::new(HeapConfig {
            scatter_chunk_pages: 2,
            ..HeapConfig::default()
        });
        let segs = heap.allocate(5 * PAGE, false, false).unwrap();
        assert_eq!(segs.iter().map(|s| s.len).sum::<u64>(), 5 * PAGE);
        assert_eq!(segs.len(), 3);
        for pair in segs.windows(2) {
            assert_ne!(pair[0].addr, pair[1].end());
            assert_ne!(pair[1].addr, pair[0].end());
        }
    }

    #[test]
    fn exhaustion_and_release() {
        let heap = SimulatedHeap::new(HeapConfig {
            contiguous_capacity: 4 * PAGE,
            ..HeapConfig::default()
        });
        let a = heap.allocate(3 * PAGE, true, false).unwrap();
        assert!(matches!(
            heap.allocate(2 * PAGE, true, false),
            Err(NpuError::OutOfMemory { pool: "contiguous", .. })
        ));
        heap.release(&a);
        assert_eq!(heap.used(), 0);
        assert!(heap.allocate(4 * PAGE, true, false).is_ok());
    }

    #[test]
    fn read_back_and_bounds() {
        let heap = SimulatedHeap::default();
        let segs = heap.allocate(2 * PAGE, true, false).unwrap();
        let base = segs[0].addr;
        heap.write(base + PAGE - 2, &[1, 2, 3, 4]).unwrap();

        let mut buf = [0xFF; 6];
        heap.read(base + PAGE - 3, &mut buf).unwrap();
        assert_eq!(buf, [0, 1, 2, 3, 4, 0]);

        assert!(heap.write(base + 2 * PAGE - 1, &[0, 0]).is_err());
        heap.release(&segs);
        assert!(heap.read(base, &mut buf).is_err());
    }
}
