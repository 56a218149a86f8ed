//! Where reading a feed range starts when there is no continuation yet.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{range::FeedRange, request::ChangeFeedRequest};

/// Start position of a change feed read.
///
/// A closed set: each variant knows how it is expressed on a request and whether the store can
/// serve a full-fidelity feed from it.
#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(tag = "Type")]
pub enum ChangeFeedStartFrom {
    /// Every change still retained by the store.
    #[serde(rename = "BEGINNING")]
    Beginning,

    /// Only changes made after the first request.
    #[default]
    #[serde(rename = "NOW")]
    Now,

    /// Changes made at or after the given time.
    #[serde(rename = "POINT_IN_TIME")]
    PointInTime {
        #[serde(rename = "PointInTimeMs", with = "chrono::serde::ts_milliseconds")]
        point_in_time: DateTime<Utc>,
    },

    /// An opaque continuation produced by an older processor version.
    #[serde(rename = "LEGACY_CHECKPOINT")]
    LegacyContinuation {
        #[serde(rename = "Continuation")]
        continuation: String,
    },

    /// A concrete position: the etag reached within `feed_range`. A missing etag means nothing
    /// has been read from the range yet.
    #[serde(rename = "LEASE")]
    ETagAndFeedRange {
        #[serde(rename = "Etag", default, skip_serializing_if = "Option::is_none")]
        etag: Option<String>,
        #[serde(rename = "FeedRange")]
        feed_range: FeedRange,
    },
}

impl ChangeFeedStartFrom {
    pub fn point_in_time(point_in_time: DateTime<Utc>) -> Self {
        Self::PointInTime { point_in_time }
    }

    pub fn etag_and_feed_range(etag: Option<String>, feed_range: FeedRange) -> Self {
        Self::ETagAndFeedRange { etag, feed_range }
    }

    /// Express this start position on `request`.
    pub fn populate_request(&self, request: &mut ChangeFeedRequest) {
        match self {
            Self::Beginning => {}
            Self::Now => request.if_none_match = Some("*".to_string()),
            Self::PointInTime { point_in_time } => {
                request.if_modified_since = Some(*point_in_time);
            }
            Self::LegacyContinuation { continuation } => {
                request.if_none_match = Some(continuation.clone());
            }
            Self::ETagAndFeedRange { etag, .. } => {
                if let Some(etag) = etag {
                    request.if_none_match = Some(etag.clone());
                }
            }
        }
    }

    /// The full-fidelity feed only retains history from a concrete point onwards, so reading it
    /// from the beginning or from a point in time is not possible.
    pub fn supports_full_fidelity_retention(&self) -> bool {
        match self {
            Self::Now | Self::ETagAndFeedRange { .. } => true,
            Self::Beginning | Self::PointInTime { .. } | Self::LegacyContinuation { .. } => false,
        }
    }
}
