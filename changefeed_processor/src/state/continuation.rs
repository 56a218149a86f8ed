//! Per-sub-range read progress within a feed range.

use std::collections::VecDeque;

use serde::{Deserialize, Serialize};

use crate::range::{FeedRange, Range};

use super::StateError;

/// Progress through one sub-range: the last etag the store returned for it, `None` until the
/// first response arrives.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct CompositeContinuationToken {
    pub token: Option<String>,
    pub range: Range,
}

impl CompositeContinuationToken {
    pub fn new(token: Option<String>, range: Range) -> Self {
        Self { token, range }
    }
}

/// Read progress for a [`FeedRange`] that may span several sub-ranges (for example after a
/// partition split), bound to the container it was created for.
///
/// The tokens are visited round-robin: the front token is the current one.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "ContinuationJson", into = "ContinuationJson")]
pub struct FeedRangeContinuation {
    container_rid: String,
    feed_range: FeedRange,
    // never empty
    tokens: VecDeque<CompositeContinuationToken>,
}

impl FeedRangeContinuation {
    /// A continuation with one empty token per sub-range.
    pub fn create(
        container_rid: impl Into<String>,
        feed_range: FeedRange,
        ranges: impl IntoIterator<Item = Range>,
    ) -> Result<Self, StateError> {
        let tokens = ranges
            .into_iter()
            .map(|range| CompositeContinuationToken::new(None, range))
            .collect::<VecDeque<_>>();
        Self::from_parts(container_rid.into(), feed_range, tokens)
    }

    fn from_parts(
        container_rid: String,
        feed_range: FeedRange,
        tokens: VecDeque<CompositeContinuationToken>,
    ) -> Result<Self, StateError> {
        if tokens.is_empty() {
            return Err(StateError::EmptyContinuation);
        }
        Ok(Self {
            container_rid,
            feed_range,
            tokens,
        })
    }

    pub fn container_rid(&self) -> &str {
        &self.container_rid
    }

    pub fn feed_range(&self) -> &FeedRange {
        &self.feed_range
    }

    pub fn current_token(&self) -> &CompositeContinuationToken {
        &self.tokens[0]
    }

    pub fn tokens(&self) -> impl Iterator<Item = &CompositeContinuationToken> {
        self.tokens.iter()
    }

    /// Record `token` as the progress of the current sub-range and optionally rotate to the
    /// next one.
    pub fn replace_continuation(&mut self, token: &str, move_to_next: bool) {
        self.tokens[0].token = Some(token.to_string());
        if move_to_next {
            self.move_to_next_token();
        }
    }

    fn move_to_next_token(&mut self) {
        if let Some(current) = self.tokens.pop_front() {
            self.tokens.push_back(current);
        }
    }

    /// The progress that applies to `range`: tokens overlapping it, clipped to it. Returns
    /// `None` when nothing overlaps.
    pub fn rescope(&self, range: &Range) -> Option<Self> {
        let tokens = self
            .tokens
            .iter()
            .filter_map(|t| {
                t.range
                    .intersect(range)
                    .map(|r| CompositeContinuationToken::new(t.token.clone(), r))
            })
            .collect::<VecDeque<_>>();
        Self::from_parts(
            self.container_rid.clone(),
            FeedRange::new(range.clone()),
            tokens,
        )
        .ok()
    }

    /// Fails if this continuation was created for another container.
    pub fn validate_container(&self, container_rid: &str) -> Result<(), StateError> {
        if self.container_rid != container_rid {
            return Err(StateError::ContainerMismatch {
                expected: container_rid.to_string(),
                actual: self.container_rid.clone(),
            });
        }
        Ok(())
    }
}

#[derive(Serialize, Deserialize)]
struct ContinuationJson {
    #[serde(rename = "V")]
    version: u64,
    #[serde(rename = "Rid")]
    container_rid: String,
    #[serde(rename = "Continuation")]
    tokens: VecDeque<CompositeContinuationToken>,
    #[serde(rename = "FeedRange")]
    feed_range: FeedRange,
}

const CONTINUATION_VERSION: u64 = 1;

impl TryFrom<ContinuationJson> for FeedRangeContinuation {
    type Error = StateError;

    fn try_from(value: ContinuationJson) -> Result<Self, Self::Error> {
        if value.version != CONTINUATION_VERSION {
            return Err(StateError::UnsupportedVersion(value.version));
        }
        Self::from_parts(value.container_rid, value.feed_range, value.tokens)
    }
}

impl From<FeedRangeContinuation> for ContinuationJson {
    fn from(value: FeedRangeContinuation) -> Self {
        Self {
            version: CONTINUATION_VERSION,
            container_rid: value.container_rid,
            tokens: value.tokens,
            feed_range: value.feed_range,
        }
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    fn halves() -> Vec<Range> {
        vec![Range::new("", "7F"), Range::new("7F", "FF")]
    }

    #[test]
    fn test_create_requires_a_range() {
        assert_matches!(
            FeedRangeContinuation::create("rid", FeedRange::full(), vec![]),
            Err(StateError::EmptyContinuation)
        );
    }

    #[test]
    fn test_replace_and_rotate() {
        let mut c = FeedRangeContinuation::create("rid", FeedRange::full(), halves()).unwrap();
        assert_eq!(c.current_token().range, Range::new("", "7F"));
        assert_eq!(c.current_token().token, None);

        c.replace_continuation("\"10\"", false);
        assert_eq!(c.current_token().token.as_deref(), Some("\"10\""));

        c.replace_continuation("\"11\"", true);
        assert_eq!(c.current_token().range, Range::new("7F", "FF"));
        assert_eq!(c.current_token().token, None);

        let tokens = c.tokens().cloned().collect::<Vec<_>>();
        assert_eq!(
            tokens,
            vec![
                CompositeContinuationToken::new(None, Range::new("7F", "FF")),
                CompositeContinuationToken::new(Some("\"11\"".into()), Range::new("", "7F")),
            ]
        );
    }

    #[test]
    fn test_rescope() {
        let mut c =
            FeedRangeContinuation::create("rid", FeedRange::full(), vec![Range::full()]).unwrap();
        c.replace_continuation("\"9\"", false);

        let child = c.rescope(&Range::new("7F", "FF")).unwrap();
        assert_eq!(child.feed_range(), &FeedRange::new(Range::new("7F", "FF")));
        assert_eq!(child.current_token().range, Range::new("7F", "FF"));
        assert_eq!(child.current_token().token.as_deref(), Some("\"9\""));
        assert_eq!(child.container_rid(), "rid");

        let narrow =
            FeedRangeContinuation::create("rid", FeedRange::full(), vec![Range::new("", "10")])
                .unwrap();
        assert!(narrow.rescope(&Range::new("20", "30")).is_none());
    }

    #[test]
    fn test_validate_container() {
        let c = FeedRangeContinuation::create("rid-a", FeedRange::full(), halves()).unwrap();
        c.validate_container("rid-a").unwrap();
        assert_matches!(
            c.validate_container("rid-b"),
            Err(StateError::ContainerMismatch { expected, actual }) if expected == "rid-b" && actual == "rid-a"
        );
    }

    #[test]
    fn test_json() {
        let c = FeedRangeContinuation::create("rid", FeedRange::full(), halves()).unwrap();
        let json = serde_json::to_value(&c).unwrap();
        assert_eq!(json["V"], 1);
        assert_eq!(json["Rid"], "rid");
        assert_eq!(json["Continuation"].as_array().unwrap().len(), 2);

        let back: FeedRangeContinuation = serde_json::from_value(json).unwrap();
        assert_eq!(back, c);

        let empty = serde_json::json!({
            "V": 1,
            "Rid": "rid",
            "Continuation": [],
            "FeedRange": {"Range": {"min": "", "max": "FF"}},
        });
        assert!(serde_json::from_value::<FeedRangeContinuation>(empty).is_err());
    }
}
