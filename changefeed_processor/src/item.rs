//! The per-change envelope served by the full-fidelity feed.

use serde::{Deserialize, Serialize, de::DeserializeOwned};
use serde_json::Value;

/// Kind of change an item describes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum OperationType {
    Create,
    Replace,
    Delete,
}

/// Metadata of one change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChangeFeedMetaData {
    /// Log sequence number of the change; ascending within a range.
    pub lsn: u64,

    /// LSN of the version this change replaced or deleted.
    #[serde(rename = "previousImageLSN", default)]
    pub previous_image_lsn: u64,

    /// Conflict resolution timestamp, seconds since the epoch.
    #[serde(rename = "crts")]
    pub conflict_resolution_timestamp: i64,

    pub operation_type: OperationType,

    /// Set when a delete was caused by TTL expiry rather than an explicit delete.
    #[serde(default)]
    pub time_to_live_expired: bool,
}

/// One change as delivered by the full-fidelity feed.
///
/// `previous` is always set for deletes and, when the store was asked to keep previous images,
/// for replaces.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChangeFeedProcessorItem {
    #[serde(default)]
    pub current: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub previous: Option<Value>,
    pub metadata: ChangeFeedMetaData,
}

impl ChangeFeedProcessorItem {
    pub fn operation_type(&self) -> OperationType {
        self.metadata.operation_type
    }

    pub fn lsn(&self) -> u64 {
        self.metadata.lsn
    }

    /// Decode the current image into `T`.
    pub fn current_as<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
        T::deserialize(&self.current)
    }

    /// Decode the previous image into `T`, if there is one.
    pub fn previous_as<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
        self.previous.as_ref().map(T::deserialize).transpose()
    }
}

/// Extract the LSN of a raw feed document.
///
/// Incremental documents carry it as `_lsn`, full-fidelity envelopes as `metadata.lsn`.
pub(crate) fn document_lsn(document: &Value) -> Option<u64> {
    document
        .get("_lsn")
        .or_else(|| document.get("metadata").and_then(|m| m.get("lsn")))
        .and_then(Value::as_u64)
}
