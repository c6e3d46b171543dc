use serde::{Deserialize, Serialize};
use std::fmt;

/// Half-open byte range `[start, end)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    pub fn new(start: u64, end: u64) -> Self {
        Self { start, end }
    }

    pub fn len(&self) -> u64 {
        self.end.saturating_sub(self.start)
    }

    pub fn is_empty(&self) -> bool {
        self.end <= self.start
    }

    /// Clamp the end of the range to `total` bytes
    pub fn truncate(&self, total: u64) -> Self {
        Self {
            start: self.start,
            end: self.end.min(total),
        }
    }

    /// Render as an inclusive HTTP `Range` header value
    pub fn header_value(&self) -> String {
        format!("bytes={}-{}", self.start, self.end.saturating_sub(1))
    }
}

impl fmt::Display for ByteRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[{}, {})", self.start, self.end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_header_value_is_inclusive() {
        assert_eq!(ByteRange::new(0, 4).header_value(), "bytes=0-3");
        assert_eq!(ByteRange::new(8, 10).header_value(), "bytes=8-9");
    }

    #[test]
    fn test_truncate() {
        let range = ByteRange::new(4, 8).truncate(6);
        assert_eq!(range, ByteRange::new(4, 6));
        assert_eq!(range.len(), 2);
        assert!(ByteRange::new(4, 8).truncate(2).is_empty());
    }
}
