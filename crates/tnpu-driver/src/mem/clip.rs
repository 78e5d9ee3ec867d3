//! Byte-range clipping of segment lists.

use super::Segment;
use crate::error::{NpuError, Result};

/// Restrict `segments` to the byte range `[offset, offset + size)`.
///
/// The result keeps only the part of each segment that intersects the
/// range, so the first returned segment starts at the address of byte
/// `offset` and the lengths add up to exactly `size`. Page rounding for the
/// wire happens later through [`Segment::pages`].
///
/// # Errors
///
/// Returns [`NpuError::InvalidArgument`] if `size` is zero or the range runs
/// past the end of the segments.
pub fn clip(segments: &[Segment], offset: u64, size: u64) -> Result<Vec<Segment>> {
    if size == 0 {
        return Err(NpuError::invalid_argument("clip size must be non-zero"));
    }
    let total: u64 = segments.iter().map(|s| s.len).sum();
    let end = offset
        .checked_add(size)
        .filter(|&end| end <= total)
        .ok_or_else(|| {
            NpuError::invalid_argument(format!(
                "range {offset:#x}+{size:#x} exceeds region of {total:#x} bytes"
            ))
        })?;

    let mut out = Vec::new();
    let mut seg_start = 0u64;
    for seg in segments {
        let seg_end = seg_start + seg.len;
        if seg_end > offset && seg_start < end {
            let from = offset.max(seg_start);
            let to = end.min(seg_end);
            out.push(Segment {
                addr: seg.addr + (from - seg_start),
                len: to - from,
            });
        }
        if seg_end >= end {
            break;
        }
        seg_start = seg_end;
    }
    Ok(out)
}

/// Physical address of byte `offset`, if inside the segments.
pub fn address_of(segments: &[Segment], offset: u64) -> Option<u64> {
    let mut seg_start = 0u64;
    for seg in segments {
        if offset < seg_start + seg.len {
            return Some(seg.addr + (offset - seg_start));
        }
        seg_start += seg.len;
    }
    None
}

#[cfg(test)]
mod tests {
    use super::*;

    const PAGE: u64 = 4096;

    fn scattered() -> Vec<Segment> {
        vec![
            Segment { addr: 0x10_0000, len: 2 * PAGE },
            Segment { addr: 0x40_0000, len: PAGE },
            Segment { addr: 0x20_0000, len: 3 * PAGE },
        ]
    }

    #[test]
    fn within_one_segment() {
        let out = clip(&scattered(), 100, 200).unwrap();
        assert_eq!(out, vec![Segment { addr: 0x10_0000 + 100, len: 200 }]);
        assert_eq!(out[0].pages(), 1);
    }

    #[test]
    fn spanning_segments_ends_mid_segment() {
        let out = clip(&scattered(), PAGE, 2 * PAGE + 10).unwrap();
        assert_eq!(
            out,
            vec![
                Segment { addr: 0x10_0000 + PAGE, len: PAGE },
                Segment { addr: 0x40_0000, len: PAGE },
                Segment { addr: 0x20_0000, len: 10 },
            ]
        );
        assert_eq!(out[2].pages(), 1);
    }

    #[test]
    fn lengths_sum_and_start_address_hold_everywhere() {
        let segs = scattered();
        let total: u64 = segs.iter().map(|s| s.len).sum();
        for offset in (0..total).step_by(511) {
            for size in [1, 7, PAGE - 1, PAGE, PAGE + 1, 3 * PAGE + 5] {
                if offset + size > total {
                    continue;
                }
                let out = clip(&segs, offset, size).unwrap();
                assert_eq!(out.iter().map(|s| s.len).sum::<u64>(), size);
                assert_eq!(Some(out[0].addr), address_of(&segs, offset));
                assert!(out.iter().all(|s| s.len > 0));
            }
        }
    }

    #[test]
    fn out_of_range_rejected() {
        let segs = scattered();
        assert!(clip(&segs, 6 * PAGE - 1, 2).is_err());
        assert!(clip(&segs, 0, 0).is_err());
        assert!(clip(&segs, u64::MAX, 2).is_err());
    }
}
