//! Ranges over the effective partition key (EPK) space.
//!
//! EPKs are upper-case hex strings compared lexicographically. The empty string is the
//! smallest key and `"FF"` is the exclusive upper bound of the whole space.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

/// Smallest effective partition key.
pub const MIN_EPK: &str = "";

/// Exclusive upper bound of the effective partition key space.
pub const MAX_EPK: &str = "FF";

/// A half-open `[min, max)` range of effective partition keys.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct Range {
    pub min: String,
    pub max: String,
}

impl Range {
    pub fn new(min: impl Into<String>, max: impl Into<String>) -> Self {
        Self {
            min: min.into(),
            max: max.into(),
        }
    }

    /// The entire key space.
    pub fn full() -> Self {
        Self::new(MIN_EPK, MAX_EPK)
    }

    pub fn is_empty(&self) -> bool {
        self.min >= self.max
    }

    pub fn contains_key(&self, epk: &str) -> bool {
        self.min.as_str() <= epk && epk < self.max.as_str()
    }

    /// `true` if `other` lies entirely within `self`.
    pub fn contains(&self, other: &Self) -> bool {
        self.min <= other.min && other.max <= self.max
    }

    pub fn overlaps(&self, other: &Self) -> bool {
        !self.is_empty() && !other.is_empty() && self.min < other.max && other.min < self.max
    }

    /// Overlap of the two ranges, `None` if they are disjoint.
    pub fn intersect(&self, other: &Self) -> Option<Self> {
        if !self.overlaps(other) {
            return None;
        }
        Some(Self::new(
            std::cmp::max(&self.min, &other.min).clone(),
            std::cmp::min(&self.max, &other.max).clone(),
        ))
    }
}

impl Display for Range {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{},{})", self.min, self.max)
    }
}

/// The slice of the key space a change feed state or a lease tracks.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct FeedRange {
    #[serde(rename = "Range")]
    range: Range,
}

impl FeedRange {
    pub fn new(range: Range) -> Self {
        Self { range }
    }

    pub fn full() -> Self {
        Self::new(Range::full())
    }

    pub fn range(&self) -> &Range {
        &self.range
    }

    /// Lease token identifying this range: `{min}-{max}`.
    pub fn lease_token(&self) -> String {
        format!("{}-{}", self.range.min, self.range.max)
    }
}

impl From<Range> for FeedRange {
    fn from(range: Range) -> Self {
        Self::new(range)
    }
}

impl Display for FeedRange {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        self.range.fmt(f)
    }
}

/// A physical partition of the monitored container, as reported by the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PartitionKeyRange {
    pub id: String,
    pub min_inclusive: String,
    pub max_exclusive: String,
    #[serde(default)]
    pub parents: Vec<String>,
}

impl PartitionKeyRange {
    pub fn new(
        id: impl Into<String>,
        min_inclusive: impl Into<String>,
        max_exclusive: impl Into<String>,
    ) -> Self {
        Self {
            id: id.into(),
            min_inclusive: min_inclusive.into(),
            max_exclusive: max_exclusive.into(),
            parents: vec![],
        }
    }

    pub fn to_range(&self) -> Range {
        Range::new(self.min_inclusive.clone(), self.max_exclusive.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_overlap_and_intersect() {
        let full = Range::full();
        let left = Range::new("", "7F");
        let right = Range::new("7F", "FF");

        assert!(full.contains(&left));
        assert!(!left.contains(&full));
        assert!(!left.overlaps(&right));
        assert_eq!(left.intersect(&right), None);
        assert_eq!(full.intersect(&right), Some(right.clone()));
        assert_eq!(
            Range::new("10", "90").intersect(&right),
            Some(Range::new("7F", "90"))
        );
        assert!(Range::new("AA", "AA").is_empty());
        assert!(!Range::new("AA", "AA").overlaps(&full));
    }

    #[test]
    fn test_contains_key() {
        let range = Range::new("3FFF", "7FFF");
        assert!(range.contains_key("3FFF"));
        assert!(range.contains_key("5000"));
        assert!(!range.contains_key("7FFF"));
        assert!(Range::full().contains_key(""));
        assert!(Range::full().contains_key("FEFF"));
    }

    #[test]
    fn test_feed_range_json() {
        let feed_range = FeedRange::new(Range::new("", "7F"));
        let json = serde_json::to_string(&feed_range).unwrap();
        assert_eq!(json, r#"{"Range":{"min":"","max":"7F"}}"#);
        assert_eq!(feed_range.lease_token(), "-7F");
        assert_eq!(feed_range.to_string(), "[,7F)");
    }
}
