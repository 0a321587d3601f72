//! Closed-interval byte ranges and the merge algorithm used to decide
//! whether a file is fully covered by its completed parts.

use crate::error::{Error, Result};
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::fmt;
use std::str::FromStr;

/// An inclusive byte range `start..=end`.
///
/// Construction enforces `start <= end`, including when decoded from the wire,
/// so a `Range` value is always non-empty.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "RawRange")]
pub struct Range {
    start: u64,
    end: u64,
}

#[derive(Deserialize)]
struct RawRange {
    start: u64,
    end: u64,
}

impl TryFrom<RawRange> for Range {
    type Error = Error;

    fn try_from(raw: RawRange) -> Result<Self> {
        Range::new(raw.start, raw.end)
    }
}

impl Range {
    /// Create a range, rejecting `end < start`.
    pub fn new(start: u64, end: u64) -> Result<Self> {
        if end < start {
            return Err(Error::Parse(format!(
                "range end {end} precedes start {start}"
            )));
        }
        Ok(Self { start, end })
    }

    /// Range covering `len` bytes starting at `offset`. `len` must be non-zero.
    pub fn from_offset(offset: u64, len: u64) -> Result<Self> {
        if len == 0 {
            return Err(Error::Parse("range length must be non-zero".to_string()));
        }
        let end = offset
            .checked_add(len - 1)
            .ok_or_else(|| Error::Parse(format!("range {offset}+{len} overflows")))?;
        Self::new(offset, end)
    }

    pub fn start(&self) -> u64 {
        self.start
    }

    pub fn end(&self) -> u64 {
        self.end
    }

    /// Number of bytes covered.
    pub fn size(&self) -> u64 {
        self.end - self.start + 1
    }

    /// True if the two ranges overlap or are directly adjacent.
    pub fn touches(&self, other: &Range) -> bool {
        self.end.saturating_add(1) >= other.start && self.start <= other.end.saturating_add(1)
    }

    /// True if the ranges share at least one byte.
    pub fn overlaps(&self, other: &Range) -> bool {
        self.start <= other.end && other.start <= self.end
    }
}

impl PartialOrd for Range {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Range {
    fn cmp(&self, other: &Self) -> Ordering {
        self.start
            .cmp(&other.start)
            .then_with(|| self.end.cmp(&other.end))
    }
}

impl fmt::Display for Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.start, self.end)
    }
}

impl FromStr for Range {
    type Err = Error;

    fn from_str(s: &str) -> Result<Self> {
        let (start, end) = s
            .split_once('-')
            .ok_or_else(|| Error::Parse(format!("expected 'start-end', got '{s}'")))?;
        let parse = |part: &str| {
            if part.is_empty() || !part.bytes().all(|b| b.is_ascii_digit()) {
                return Err(Error::Parse(format!("invalid range bound '{part}' in '{s}'")));
            }
            part.parse::<u64>()
                .map_err(|e| Error::Parse(format!("invalid range bound '{part}': {e}")))
        };
        Range::new(parse(start)?, parse(end)?)
    }
}

/// Sort and merge ranges into disjoint, non-touching spans.
///
/// Identical ranges collapse into one. Ranges that share bytes without being
/// identical fail with [`Error::Overlap`], since two different payloads for
/// the same bytes must never be merged as if they were contiguous.
pub fn reduce_ranges(ranges: &[Range]) -> Result<Vec<Range>> {
    let mut sorted = ranges.to_vec();
    sorted.sort();
    sorted.dedup();

    for pair in sorted.windows(2) {
        if pair[0].overlaps(&pair[1]) {
            return Err(Error::Overlap {
                first: pair[0].to_string(),
                second: pair[1].to_string(),
            });
        }
    }

    let mut merged: Vec<Range> = Vec::with_capacity(sorted.len());
    for range in sorted {
        match merged.last_mut() {
            Some(last) if last.touches(&range) => last.end = last.end.max(range.end),
            _ => merged.push(range),
        }
    }
    Ok(merged)
}

/// True iff the ranges reduce to exactly `[0, size)`.
pub fn is_fully_covered(ranges: &[Range], size: u64) -> Result<bool> {
    let reduced = reduce_ranges(ranges)?;
    Ok(matches!(reduced.as_slice(), [only] if only.start == 0 && only.size() == size))
}
