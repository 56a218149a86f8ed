//! The logical shape of a change feed read request.
//!
//! Transport is out of scope for this crate: a [`ChangeFeedRequest`] carries the settings a
//! store client needs to turn into its own protocol headers. It is filled in by
//! [`ChangeFeedStateV1::populate_request`](crate::state::ChangeFeedStateV1::populate_request).

use chrono::{DateTime, Utc};

use crate::range::{FeedRange, Range};

/// Wire format version requested alongside a full-fidelity feed; it separates item metadata
/// (including the conflict resolution timestamp) from the item body.
pub const FULL_FIDELITY_WIRE_FORMAT_VERSION: &str = "2021-09-15";

/// Which flavour of change feed the store should serve.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum FeedType {
    IncrementalFeed,
    FullFidelityFeed,
}

impl FeedType {
    /// Value of the `A-IM` header the store protocol uses to select the feed.
    pub fn header_value(&self) -> &'static str {
        match self {
            Self::IncrementalFeed => "Incremental feed",
            Self::FullFidelityFeed => "Full-Fidelity Feed",
        }
    }
}

/// How the request is routed to physical partitions.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash)]
pub enum RoutingMode {
    /// The client resolves the target partition and handles splits itself.
    #[default]
    Direct,

    /// The request goes through the service gateway, which handles splits server-side.
    Gateway,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChangeFeedRequest {
    pub page_size: Option<u32>,
    pub feed_type: Option<FeedType>,
    pub wire_format_version: Option<&'static str>,
    pub routing_mode: RoutingMode,
    /// Resume after this etag; `*` means "only changes from now on".
    pub if_none_match: Option<String>,
    /// Start from the first change at or after this time.
    pub if_modified_since: Option<DateTime<Utc>>,
    pub feed_range: Option<FeedRange>,
}

impl ChangeFeedRequest {
    pub fn new() -> Self {
        Self::default()
    }

    /// Restricts the request to `range`.
    pub fn apply_feed_range_filter(&mut self, range: Range) {
        self.feed_range = Some(FeedRange::new(range));
    }

    /// The key range this request reads, if one was set.
    pub fn effective_range(&self) -> Option<&Range> {
        self.feed_range.as_ref().map(FeedRange::range)
    }
}
