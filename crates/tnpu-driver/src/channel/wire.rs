//! Shared-memory block layouts.
//!
//! ```text
//! memory area       addr: u64, npage: u32, reserved: u32
//! session           area[2]  (non-secure driver buffer, secure driver buffer)
//! user buffer       areas_count: u32, offset: u32, size: u32, area[areas_count]
//! network resources code_count, page_table_count, pool_count, profile_count: u32,
//!                   area[...] in that order
//! io buffer         area[n]
//! ```
//!
//! All fields are little endian. Every block is sized to exactly the
//! segments it describes.

use crate::error::{NpuError, Result};
use crate::mem::{Region, Segment};
use bytes::{Buf, BufMut, Bytes, BytesMut};
use tnpu_chip::page::is_aligned;
use tnpu_chip::ta::{
    MEMORY_AREA_SIZE, NETWORK_RESOURCES_HEADER_SIZE, SESSION_AREA_COUNT, USER_BUFFER_HEADER_SIZE,
};

/// One decoded memory area.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MemoryArea {
    /// Physical start address
    pub addr: u64,
    /// Pages mapped from `addr`
    pub npage: u32,
}

/// Decoded user-buffer block.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserBuffer {
    /// Offset of the first byte within the areas
    pub offset: u32,
    /// Size in bytes
    pub size: u32,
    /// Backing areas
    pub areas: Vec<MemoryArea>,
}

/// Decoded network-resources block.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct NetworkResources {
    /// Code areas
    pub code: Vec<MemoryArea>,
    /// Page-table areas
    pub page_table: Vec<MemoryArea>,
    /// Constant-pool areas
    pub pool: Vec<MemoryArea>,
    /// Profiling areas
    pub profile: Vec<MemoryArea>,
}

fn wire_u32(value: u64, what: &str) -> Result<u32> {
    u32::try_from(value)
        .map_err(|_| NpuError::invalid_argument(format!("{what} {value:#x} does not fit the wire format")))
}

fn put_areas(out: &mut BytesMut, segments: &[Segment]) -> Result<()> {
    for seg in segments {
        out.put_u64_le(seg.addr);
        out.put_u32_le(wire_u32(seg.pages(), "page count")?);
        out.put_u32_le(0);
    }
    Ok(())
}

/// Areas for session open. Both driver buffers must be one segment each.
///
/// # Errors
///
/// Returns error if either buffer is scattered.
pub fn session_block(non_secure: &Region, secure: &Region) -> Result<Bytes> {
    if !non_secure.is_contiguous() || !secure.is_contiguous() {
        return Err(NpuError::invalid_argument(
            "only contiguous driver buffers are supported",
        ));
    }
    let mut out = BytesMut::with_capacity(SESSION_AREA_COUNT * MEMORY_AREA_SIZE);
    put_areas(&mut out, non_secure.segments())?;
    put_areas(&mut out, secure.segments())?;
    Ok(out.freeze())
}

/// Describe a whole region plus the window inside it.
///
/// # Errors
///
/// Returns error if the offset or size overflow the wire fields.
pub fn user_buffer_block(region: &Region) -> Result<Bytes> {
    let segments = region.segments();
    let mut out =
        BytesMut::with_capacity(USER_BUFFER_HEADER_SIZE + segments.len() * MEMORY_AREA_SIZE);
    out.put_u32_le(wire_u32(segments.len() as u64, "area count")?);
    out.put_u32_le(wire_u32(region.offset(), "offset")?);
    out.put_u32_le(wire_u32(region.size(), "size")?);
    put_areas(&mut out, segments)?;
    Ok(out.freeze())
}

/// Areas of an IO buffer, clipped to the region's window.
///
/// Returns the block and the area count.
///
/// # Errors
///
/// Returns [`NpuError::Misaligned`] if the window does not start on a page.
pub fn io_buffer_block(region: &Region) -> Result<(Bytes, u32)> {
    if !is_aligned(region.offset()) {
        return Err(NpuError::Misaligned {
            offset: region.offset(),
        });
    }
    let clipped = region.clip(0, region.size())?;
    let mut out = BytesMut::with_capacity(clipped.len() * MEMORY_AREA_SIZE);
    put_areas(&mut out, &clipped)?;
    Ok((out.freeze(), wire_u32(clipped.len() as u64, "area count")?))
}

/// Areas of every region a network owns.
///
/// # Errors
///
/// Returns error if a count overflows the wire fields.
pub fn network_resources_block(
    code: &Region,
    page_table: &Region,
    pool: Option<&Region>,
    profile: Option<&Region>,
) -> Result<Bytes> {
    let code_segs = code.segments();
    let pt_segs = page_table.segments();
    let pool_segs = pool.map_or(&[][..], Region::segments);
    let profile_segs = profile.map_or(&[][..], Region::segments);

    let areas = code_segs.len() + pt_segs.len() + pool_segs.len() + profile_segs.len();
    let mut out = BytesMut::with_capacity(NETWORK_RESOURCES_HEADER_SIZE + areas * MEMORY_AREA_SIZE);
    for segs in [code_segs, pt_segs, pool_segs, profile_segs] {
        out.put_u32_le(wire_u32(segs.len() as u64, "area count")?);
    }
    for segs in [code_segs, pt_segs, pool_segs, profile_segs] {
        put_areas(&mut out, segs)?;
    }
    Ok(out.freeze())
}

// ── Decoding (peer side) ─────────────────────────────────────────────────────

fn take_areas(buf: &mut &[u8], count: u32) -> Option<Vec<MemoryArea>> {
    let count = count as usize;
    if buf.remaining() < count.checked_mul(MEMORY_AREA_SIZE)? {
        return None;
    }
    let mut areas = Vec::with_capacity(count);
    for _ in 0..count {
        let addr = buf.get_u64_le();
        let npage = buf.get_u32_le();
        let _reserved = buf.get_u32_le();
        areas.push(MemoryArea { addr, npage });
    }
    Some(areas)
}

/// Decode a block made only of areas.
pub fn decode_areas(block: &[u8]) -> Option<Vec<MemoryArea>> {
    if block.len() % MEMORY_AREA_SIZE != 0 {
        return None;
    }
    let mut buf = block;
    #[allow(clippy::cast_possible_truncation)]
    let count = (block.len() / MEMORY_AREA_SIZE) as u32;
    take_areas(&mut buf, count)
}

/// Decode a user-buffer block; `None` unless the length matches exactly.
pub fn decode_user_buffer(block: &[u8]) -> Option<UserBuffer> {
    let mut buf = block;
    if buf.remaining() < USER_BUFFER_HEADER_SIZE {
        return None;
    }
    let count = buf.get_u32_le();
    let offset = buf.get_u32_le();
    let size = buf.get_u32_le();
    let areas = take_areas(&mut buf, count)?;
    buf.is_empty().then_some(UserBuffer {
        offset,
        size,
        areas,
    })
}

/// Decode a network-resources block; `None` unless the length matches exactly.
pub fn decode_network_resources(block: &[u8]) -> Option<NetworkResources> {
    let mut buf = block;
    if buf.remaining() < NETWORK_RESOURCES_HEADER_SIZE {
        return None;
    }
    let counts = [
        buf.get_u32_le(),
        buf.get_u32_le(),
        buf.get_u32_le(),
        buf.get_u32_le(),
    ];
    let res = NetworkResources {
        code: take_areas(&mut buf, counts[0])?,
        page_table: take_areas(&mut buf, counts[1])?,
        pool: take_areas(&mut buf, counts[2])?,
        profile: take_areas(&mut buf, counts[3])?,
    };
    buf.is_empty().then_some(res)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mem::{HeapConfig, MemoryKind, MemoryManager, SimulatedHeap};
    use std::sync::Arc;
    use tnpu_chip::page::NPU_PAGE_SIZE as PAGE;

    fn manager() -> MemoryManager {
        MemoryManager::new(Arc::new(SimulatedHeap::new(HeapConfig {
            scatter_chunk_pages: 1,
            ..HeapConfig::default()
        })))
    }

    #[test]
    fn session_block_has_two_areas() {
        let mm = manager();
        let ns = mm.allocate(MemoryKind::DriverBuffer, false, 2 * PAGE).unwrap();
        let s = mm.allocate(MemoryKind::DriverBuffer, true, PAGE).unwrap();
        let block = session_block(&ns, &s).unwrap();
        assert_eq!(block.len(), 2 * MEMORY_AREA_SIZE);
        let areas = decode_areas(&block).unwrap();
        assert_eq!(areas[0], MemoryArea { addr: ns.base_address(), npage: 2 });
        assert_eq!(areas[1], MemoryArea { addr: s.base_address(), npage: 1 });

        let scattered = mm.allocate(MemoryKind::IoBuffer, false, 2 * PAGE).unwrap();
        assert!(session_block(&scattered, &s).is_err());
    }

    #[test]
    fn io_buffer_block_is_exact() {
        let mm = manager();
        let fd = mm.import_foreign(8 * PAGE, false).unwrap();
        let region = mm.wrap_external(fd, 2 * PAGE + 10, 3 * PAGE).unwrap();
        let (block, count) = io_buffer_block(&region).unwrap();
        assert_eq!(count, 3);
        assert_eq!(block.len(), 3 * MEMORY_AREA_SIZE);
        let areas = decode_areas(&block).unwrap();
        assert_eq!(areas[0].addr, region.base_address());
        assert_eq!(areas.iter().map(|a| a.npage).sum::<u32>(), 3);
    }

    #[test]
    fn network_resources_layout() {
        let mm = manager();
        let code = mm.allocate(MemoryKind::Code, false, 2 * PAGE).unwrap();
        let pt = mm.allocate(MemoryKind::PageTable, false, 16 * PAGE).unwrap();
        let block = network_resources_block(&code, &pt, None, None).unwrap();
        assert_eq!(block.len(), NETWORK_RESOURCES_HEADER_SIZE + 3 * MEMORY_AREA_SIZE);
        let res = decode_network_resources(&block).unwrap();
        assert_eq!(res.code.len(), 2);
        assert_eq!(res.page_table, vec![MemoryArea { addr: pt.base_address(), npage: 16 }]);
        assert!(res.pool.is_empty() && res.profile.is_empty());

        assert!(decode_network_resources(&block[..block.len() - 1]).is_none());
    }

    #[test]
    fn user_buffer_keeps_window() {
        let mm = manager();
        let bytes = vec![0u8; 3 * PAGE as usize];
        let region = mm.wrap_caller_memory(&bytes[100..]).unwrap();
        let ub = decode_user_buffer(&user_buffer_block(&region).unwrap()).unwrap();
        assert_eq!(u64::from(ub.size), region.size());
        assert_eq!(u64::from(ub.offset), region.offset());
        assert_eq!(ub.areas.len(), 1);
    }
}
