//! Device page geometry.
//!
//! The secure peer maps every region on device-page boundaries, so every
//! size handed across the wire is expressed in whole pages.

/// Device page size in bytes.
pub const NPU_PAGE_SIZE: u64 = 4096;

/// Bytes described by one page-table page.
pub const PAGE_TABLE_PAGE_BYTES: u64 = 4096;

/// Round `size` up to the next device page boundary.
///
/// Saturates instead of wrapping for sizes within one page of `u64::MAX`.
pub const fn align_up(size: u64) -> u64 {
    match size.checked_add(NPU_PAGE_SIZE - 1) {
        Some(v) => v & !(NPU_PAGE_SIZE - 1),
        None => u64::MAX & !(NPU_PAGE_SIZE - 1),
    }
}

/// True when `value` lies on a device page boundary.
pub const fn is_aligned(value: u64) -> bool {
    value % NPU_PAGE_SIZE == 0
}

/// Number of device pages needed to hold `len` bytes.
pub const fn pages_for(len: u64) -> u64 {
    len.div_ceil(NPU_PAGE_SIZE)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn align_rounds_up_to_page() {
        assert_eq!(align_up(0), 0);
        assert_eq!(align_up(1), 4096);
        assert_eq!(align_up(4096), 4096);
        assert_eq!(align_up(4097), 8192);
        assert_eq!(align_up(u64::MAX), u64::MAX & !4095);
    }

    #[test]
    fn page_counts() {
        assert_eq!(pages_for(0), 0);
        assert_eq!(pages_for(256), 1);
        assert_eq!(pages_for(8192), 2);
        assert_eq!(pages_for(8193), 3);
        assert!(is_aligned(3 * NPU_PAGE_SIZE));
        assert!(!is_aligned(100));
    }
}
