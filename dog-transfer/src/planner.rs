//! Splits a blob into contiguous byte-range chunks.
//!
//! Boundaries respect the payload transform's alignment: every chunk except
//! the last starts and ends on a multiple of the alignment.

use crate::error::{TransferError, TransferResult};
use crate::types::ByteRange;

/// Chunk size rounded up to a multiple of `alignment` (0 means unaligned)
pub fn effective_chunk_size(chunk_size: u64, alignment: u64) -> u64 {
    if alignment == 0 || chunk_size % alignment == 0 {
        return chunk_size;
    }
    (chunk_size / alignment + 1).saturating_mul(alignment)
}

/// Plan the whole blob.
///
/// With an unknown total a single provisional range `[0, C)` is returned;
/// the rest is planned with [`plan_from`] once the first response reports
/// the size.
pub fn plan(total: Option<u64>, chunk_size: u64, alignment: u64) -> TransferResult<Vec<ByteRange>> {
    plan_from(0, total, chunk_size, alignment)
}

/// Plan the ranges covering `[start, total)`, with `start` shifted back to
/// the nearest alignment boundary.
pub fn plan_from(
    start: u64,
    total: Option<u64>,
    chunk_size: u64,
    alignment: u64,
) -> TransferResult<Vec<ByteRange>> {
    if chunk_size == 0 {
        return Err(TransferError::planning("chunk size must be greater than zero"));
    }

    let step = effective_chunk_size(chunk_size, alignment);
    let start = if alignment > 0 {
        start - start % alignment
    } else {
        start
    };

    let total = match total {
        Some(total) => total,
        None => return Ok(vec![ByteRange::new(start, start.saturating_add(step))]),
    };

    let mut ranges = Vec::new();
    let mut offset = start;
    while offset < total {
        let end = offset.saturating_add(step).min(total);
        ranges.push(ByteRange::new(offset, end));
        offset = end;
    }

    Ok(ranges)
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn test_plan_ten_bytes_in_fours() {
        let ranges = plan(Some(10), 4, 0).unwrap();
        assert_eq!(
            ranges,
            vec![
                ByteRange::new(0, 4),
                ByteRange::new(4, 8),
                ByteRange::new(8, 10)
            ]
        );
    }

    #[test]
    fn test_plan_empty_blob() {
        assert!(plan(Some(0), 4, 0).unwrap().is_empty());
    }

    #[test]
    fn test_zero_chunk_size_is_rejected() {
        let err = plan(Some(10), 0, 0).unwrap_err();
        assert!(matches!(err, TransferError::Planning(_)));
    }

    #[test]
    fn test_unknown_total_is_single_provisional_range() {
        assert_eq!(plan(None, 4, 0).unwrap(), vec![ByteRange::new(0, 4)]);
        assert_eq!(plan(None, 5, 4).unwrap(), vec![ByteRange::new(0, 8)]);
    }

    #[test]
    fn test_alignment_rounds_chunk_size_up() {
        assert_eq!(effective_chunk_size(10, 16), 16);
        assert_eq!(effective_chunk_size(32, 16), 32);
        assert_eq!(effective_chunk_size(33, 16), 48);
        assert_eq!(effective_chunk_size(7, 0), 7);
    }

    #[test]
    fn test_plan_from_shifts_start_to_alignment() {
        let ranges = plan_from(20, Some(40), 16, 16).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(16, 32), ByteRange::new(32, 40)]);
    }

    #[test]
    fn test_plan_from_remainder_after_provisional_chunk() {
        let ranges = plan_from(4, Some(10), 4, 0).unwrap();
        assert_eq!(ranges, vec![ByteRange::new(4, 8), ByteRange::new(8, 10)]);
        assert!(plan_from(4, Some(3), 4, 0).unwrap().is_empty());
    }

    proptest! {
        #[test]
        fn prop_ranges_cover_blob_in_order(
            total in 0u64..100_000,
            chunk_size in 1u64..10_000,
            alignment in prop_oneof![Just(0u64), 1u64..512],
        ) {
            let ranges = plan(Some(total), chunk_size, alignment).unwrap();

            let mut expected_start = 0;
            for range in &ranges {
                prop_assert_eq!(range.start, expected_start);
                prop_assert!(range.start < range.end);
                expected_start = range.end;
            }
            prop_assert_eq!(expected_start, total);
        }

        #[test]
        fn prop_inner_boundaries_are_aligned(
            total in 1u64..100_000,
            chunk_size in 1u64..10_000,
            alignment in 1u64..512,
        ) {
            let ranges = plan(Some(total), chunk_size, alignment).unwrap();
            for range in &ranges[..ranges.len() - 1] {
                prop_assert_eq!(range.end % alignment, 0);
            }
        }
    }
}
