//! Leases: who owns a feed range and how far it has been read.

use std::{collections::BTreeMap, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::{
    client::VersionedItem,
    error::StoreError,
    range::FeedRange,
    state::{ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedState, ChangeFeedStateV1, StateError},
    time::Time,
};

mod store;

pub use store::LeaseStoreManager;

#[derive(Debug, thiserror::Error)]
pub enum LeaseError {
    #[error("lease {lease_token} is no longer owned by this host (owner: {owner:?})")]
    LeaseLost {
        lease_token: String,
        owner: Option<String>,
    },

    #[error("gave up updating lease {lease_token} after repeated conflicts")]
    Contended { lease_token: String },

    #[error("lease store request failed: {0}")]
    Store(#[from] StoreError),

    #[error("cannot encode or decode lease document: {0}")]
    Json(#[from] serde_json::Error),

    #[error("invalid continuation in lease {lease_token}: {source}")]
    State {
        lease_token: String,
        source: StateError,
    },
}

/// Result of a conditional lease write.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CasOutcome {
    /// The write went through; the lease as now stored.
    Applied(Lease),

    /// Another writer changed the lease since it was read.
    Conflict,
}

/// Ownership and progress record for one feed range, stored as a lease-container item.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Lease {
    pub id: String,

    /// Version of the stored document this lease was read from.
    #[serde(skip)]
    pub etag: String,

    #[serde(rename = "LeaseToken")]
    pub lease_token: String,

    #[serde(rename = "Owner", default, skip_serializing_if = "Option::is_none")]
    pub owner: Option<String>,

    /// Last acquisition, renewal or checkpoint.
    pub timestamp: DateTime<Utc>,

    /// Serialized [`ChangeFeedState`], or an etag written by an older processor.
    #[serde(
        rename = "ContinuationToken",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub continuation_token: Option<String>,

    #[serde(rename = "FeedRange")]
    pub feed_range: FeedRange,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub properties: BTreeMap<String, String>,
}

impl Lease {
    /// An unowned lease for `feed_range`, stored under `id`.
    pub fn new(
        id: impl Into<String>,
        feed_range: FeedRange,
        continuation_token: Option<String>,
        now: Time,
    ) -> Self {
        Self {
            id: id.into(),
            etag: String::new(),
            lease_token: feed_range.lease_token(),
            owner: None,
            timestamp: now.date_time(),
            continuation_token,
            feed_range,
            properties: BTreeMap::new(),
        }
    }

    /// Current owner, `None` when the lease is free.
    pub fn owner(&self) -> Option<&str> {
        self.owner.as_deref().filter(|owner| !owner.is_empty())
    }

    /// Host names compare case-insensitively.
    pub fn is_owned_by(&self, host_name: &str) -> bool {
        self.owner()
            .is_some_and(|owner| owner.eq_ignore_ascii_case(host_name))
    }

    /// A lease is expired when nobody owns it or its owner stopped renewing it for longer than
    /// `expiration_interval`. A timestamp in the future never counts as expired.
    pub fn is_expired(&self, now: Time, expiration_interval: Duration) -> bool {
        if self.owner().is_none() {
            return true;
        }
        now.checked_duration_since(Time::from_datetime(self.timestamp))
            .is_some_and(|elapsed| elapsed > expiration_interval)
    }

    /// The read position to resume from.
    ///
    /// Without a stored continuation, reading starts at `start_from`. A stored continuation
    /// that is not a change feed state is treated as an etag left by an older processor.
    pub fn read_state(
        &self,
        container_rid: &str,
        mode: ChangeFeedMode,
        start_from: &ChangeFeedStartFrom,
    ) -> Result<ChangeFeedStateV1, LeaseError> {
        let Some(continuation) = self.continuation_token.as_deref() else {
            return Ok(ChangeFeedStateV1::new(
                container_rid,
                self.feed_range.clone(),
                mode,
                start_from.clone(),
                None,
            ));
        };

        match ChangeFeedState::parse_for_container(continuation, container_rid) {
            Ok(state) => Ok(state.into_v1()),
            Err(StateError::Encoding(_) | StateError::Json(_)) => Ok(ChangeFeedStateV1::new(
                container_rid,
                self.feed_range.clone(),
                mode,
                ChangeFeedStartFrom::LegacyContinuation {
                    continuation: continuation.to_string(),
                },
                None,
            )),
            Err(source) => Err(LeaseError::State {
                lease_token: self.lease_token.clone(),
                source,
            }),
        }
    }

    pub(crate) fn from_item(item: VersionedItem) -> Result<Self, serde_json::Error> {
        let mut lease: Self = serde_json::from_value(item.body)?;
        lease.id = item.id;
        lease.etag = item.etag;
        Ok(lease)
    }

    pub(crate) fn to_body(&self) -> Result<Value, serde_json::Error> {
        serde_json::to_value(self)
    }
}
