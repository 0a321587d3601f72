//! Storage object key convention for transient parts.
//!
//! A part of `path` covering `range` is stored under `"{path}.{start}-{end}"`.
//! Reconciliation depends on nothing else about the object name.

use crate::range::Range;

/// Object key for the part of `path` covering `range`.
pub fn part_key(path: &str, range: &Range) -> String {
    format!("{path}.{range}")
}

/// Split an object key back into its file path and range.
///
/// Returns `None` for keys that do not carry a valid range suffix.
pub fn parse_part_key(key: &str) -> Option<(&str, Range)> {
    let (path, suffix) = key.rsplit_once('.')?;
    if path.is_empty() {
        return None;
    }
    let range = suffix.parse().ok()?;
    Some((path, range))
}
