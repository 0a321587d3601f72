//! Splitting files into part ranges.

use ferry_core::Range;

/// Split `size` bytes into contiguous inclusive ranges.
///
/// Parts are at least `min_part_size` bytes, grown so a file never needs
/// more than `max_part_count` parts. The last part holds the remainder.
pub fn split_ranges(size: u64, min_part_size: u64, max_part_count: u64) -> Vec<Range> {
    if size == 0 {
        return Vec::new();
    }
    let part_size = min_part_size
        .max(size.div_ceil(max_part_count.max(1)))
        .max(1);
    let mut ranges = Vec::with_capacity(size.div_ceil(part_size) as usize);
    let mut start = 0u64;
    while start < size {
        let end = start.saturating_add(part_size - 1).min(size - 1);
        if let Ok(range) = Range::new(start, end) {
            ranges.push(range);
        }
        start = end + 1;
    }
    ranges
}
