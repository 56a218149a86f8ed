//! "Where have we read to" for a feed range, and how that position is put on a request.
//!
//! A [`ChangeFeedStateV1`] is created when a lease is first processed, advanced with
//! [`apply_server_response_continuation`](ChangeFeedStateV1::apply_server_response_continuation)
//! after every page read from the store and persisted into the lease on checkpoint in its
//! [`encode`](ChangeFeedStateV1::encode)d form (base64-encoded JSON). Parsing it back restores an
//! equal state.

use std::str::FromStr;

use base64::{Engine as _, engine::general_purpose::STANDARD as B64};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::{
    range::{FeedRange, Range},
    request::{ChangeFeedRequest, FULL_FIDELITY_WIRE_FORMAT_VERSION, FeedType, RoutingMode},
};

pub mod continuation;
pub mod start_from;

pub use continuation::{CompositeContinuationToken, FeedRangeContinuation};
pub use start_from::ChangeFeedStartFrom;

#[derive(Debug, thiserror::Error)]
pub enum StateError {
    #[error("the server response did not carry a continuation token")]
    MissingContinuation,

    #[error("continuation was created for container {actual} and cannot be used with container {expected}")]
    ContainerMismatch { expected: String, actual: String },

    #[error("unsupported change feed state version {0}")]
    UnsupportedVersion(u64),

    #[error("a continuation must track at least one range")]
    EmptyContinuation,

    #[error("invalid change feed state encoding: {0}")]
    Encoding(#[from] base64::DecodeError),

    #[error("invalid change feed state: {0}")]
    Json(#[from] serde_json::Error),
}

/// Which changes the feed reports.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChangeFeedMode {
    /// The latest version of each changed item.
    #[default]
    Incremental,

    /// Every version of every item, deletes included.
    FullFidelity,
}

/// Version 1 of the change feed state.
///
/// Equality and hashing are structural over all fields so states produced by splitting a range
/// can be compared and de-duplicated.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct ChangeFeedStateV1 {
    container_rid: String,
    feed_range: FeedRange,
    mode: ChangeFeedMode,
    start_from: ChangeFeedStartFrom,
    continuation: Option<FeedRangeContinuation>,
}

impl ChangeFeedStateV1 {
    pub fn new(
        container_rid: impl Into<String>,
        feed_range: FeedRange,
        mode: ChangeFeedMode,
        start_from: ChangeFeedStartFrom,
        continuation: Option<FeedRangeContinuation>,
    ) -> Self {
        Self {
            container_rid: container_rid.into(),
            feed_range,
            mode,
            start_from,
            continuation,
        }
    }

    pub fn container_rid(&self) -> &str {
        &self.container_rid
    }

    pub fn feed_range(&self) -> &FeedRange {
        &self.feed_range
    }

    pub fn mode(&self) -> ChangeFeedMode {
        self.mode
    }

    pub fn start_from(&self) -> &ChangeFeedStartFrom {
        &self.start_from
    }

    pub fn continuation(&self) -> Option<&FeedRangeContinuation> {
        self.continuation.as_ref()
    }

    /// Advance past the page the store answered `request` with.
    ///
    /// The first call creates the continuation, bound to this state's container and to the
    /// range the request read; later calls only advance it.
    pub fn apply_server_response_continuation(
        &mut self,
        server_continuation: Option<&str>,
        request: &ChangeFeedRequest,
        move_to_next_on_etag_replace: bool,
    ) -> Result<(), StateError> {
        let server_continuation = server_continuation.ok_or(StateError::MissingContinuation)?;

        let continuation = match self.continuation.take() {
            Some(continuation) => continuation,
            None => {
                let range = request
                    .effective_range()
                    .unwrap_or_else(|| self.feed_range.range())
                    .clone();
                FeedRangeContinuation::create(
                    self.container_rid.clone(),
                    self.feed_range.clone(),
                    [range],
                )?
            }
        };
        let continuation = self.continuation.insert(continuation);
        continuation.replace_continuation(server_continuation, move_to_next_on_etag_replace);
        Ok(())
    }

    /// Prepare `request` to read the next page of this state's feed range.
    pub fn populate_request(&self, request: &mut ChangeFeedRequest, max_item_count: u32) {
        request.page_size = Some(max_item_count);

        match self.mode {
            ChangeFeedMode::Incremental => {
                request.feed_type = Some(FeedType::IncrementalFeed);
            }
            ChangeFeedMode::FullFidelity => {
                request.feed_type = Some(FeedType::FullFidelityFeed);
                request.wire_format_version = Some(FULL_FIDELITY_WIRE_FORMAT_VERSION);
                // split handling for this feed happens in the gateway
                request.routing_mode = RoutingMode::Gateway;
            }
        }

        self.populate_effective_range_and_start_from_settings_to_request(request);
    }

    /// Set the range and start position on `request`.
    ///
    /// Without a continuation the original range and start settings apply. With one, the
    /// request is narrowed to the current sub-range and the start settings derived from its
    /// etag are applied after the original ones, so that actual progress wins.
    pub fn populate_effective_range_and_start_from_settings_to_request(
        &self,
        request: &mut ChangeFeedRequest,
    ) {
        match &self.continuation {
            None => {
                request.apply_feed_range_filter(self.feed_range.range().clone());
                self.start_from.populate_request(request);
            }
            Some(continuation) => {
                let current = continuation.current_token();
                request.apply_feed_range_filter(current.range.clone());

                let effective_start_from = ChangeFeedStartFrom::etag_and_feed_range(
                    current.token.clone(),
                    FeedRange::new(current.range.clone()),
                );
                self.start_from.populate_request(request);
                effective_start_from.populate_request(request);
            }
        }
    }

    /// The state of a child range after `self.feed_range` was split, carrying over whatever
    /// progress overlaps `range`.
    pub fn rescope(&self, range: &Range) -> Self {
        Self {
            container_rid: self.container_rid.clone(),
            feed_range: FeedRange::new(range.clone()),
            mode: self.mode,
            start_from: self.start_from.clone(),
            continuation: self
                .continuation
                .as_ref()
                .and_then(|continuation| continuation.rescope(range)),
        }
    }

    /// Write this state's properties into `bag`.
    pub fn populate_property_bag(&self, bag: &mut Map<String, Value>) -> Result<(), StateError> {
        bag.insert("V".to_string(), Value::from(STATE_VERSION));
        bag.insert("Rid".to_string(), Value::from(self.container_rid.clone()));
        bag.insert("Mode".to_string(), serde_json::to_value(self.mode)?);
        bag.insert("StartFrom".to_string(), serde_json::to_value(&self.start_from)?);
        bag.insert("FeedRange".to_string(), serde_json::to_value(&self.feed_range)?);
        if let Some(continuation) = &self.continuation {
            bag.insert(
                "Continuation".to_string(),
                serde_json::to_value(continuation)?,
            );
        }
        Ok(())
    }

    /// Inverse of [`populate_property_bag`](Self::populate_property_bag).
    pub fn from_property_bag(bag: &Map<String, Value>) -> Result<Self, StateError> {
        let version = bag.get("V").and_then(Value::as_u64).unwrap_or_default();
        if version != STATE_VERSION {
            return Err(StateError::UnsupportedVersion(version));
        }
        let json: StateV1Json = serde_json::from_value(Value::Object(bag.clone()))?;
        Ok(Self {
            container_rid: json.container_rid,
            feed_range: json.feed_range,
            mode: json.mode,
            start_from: json.start_from,
            continuation: json.continuation,
        })
    }
}

const STATE_VERSION: u64 = 1;

#[derive(Deserialize)]
struct StateV1Json {
    #[serde(rename = "Rid")]
    container_rid: String,
    #[serde(rename = "FeedRange")]
    feed_range: FeedRange,
    #[serde(rename = "Mode")]
    mode: ChangeFeedMode,
    #[serde(rename = "StartFrom")]
    start_from: ChangeFeedStartFrom,
    #[serde(rename = "Continuation", default)]
    continuation: Option<FeedRangeContinuation>,
}

/// A versioned change feed state, as persisted in a lease.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum ChangeFeedState {
    V1(ChangeFeedStateV1),
}

impl ChangeFeedState {
    /// Parse a persisted state for use against the container `container_rid`.
    ///
    /// Reusing a state across containers is a fatal error.
    pub fn parse_for_container(s: &str, container_rid: &str) -> Result<Self, StateError> {
        let state = s.parse::<Self>()?;
        let Self::V1(v1) = &state;
        if v1.container_rid != container_rid {
            return Err(StateError::ContainerMismatch {
                expected: container_rid.to_string(),
                actual: v1.container_rid.clone(),
            });
        }
        if let Some(continuation) = &v1.continuation {
            continuation.validate_container(container_rid)?;
        }
        Ok(state)
    }

    pub fn into_v1(self) -> ChangeFeedStateV1 {
        match self {
            Self::V1(v1) => v1,
        }
    }
}

impl From<ChangeFeedStateV1> for ChangeFeedState {
    fn from(value: ChangeFeedStateV1) -> Self {
        Self::V1(value)
    }
}

impl ChangeFeedStateV1 {
    /// The persisted form of this state.
    pub fn encode(&self) -> Result<String, StateError> {
        let mut bag = Map::new();
        self.populate_property_bag(&mut bag)?;
        let json = Value::Object(bag).to_string();
        Ok(B64.encode(json))
    }
}

impl ChangeFeedState {
    pub fn encode(&self) -> Result<String, StateError> {
        let Self::V1(v1) = self;
        v1.encode()
    }
}

impl FromStr for ChangeFeedState {
    type Err = StateError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let json = B64.decode(s.trim())?;
        let bag: Map<String, Value> = serde_json::from_slice(&json)?;
        Ok(Self::V1(ChangeFeedStateV1::from_property_bag(&bag)?))
    }
}
