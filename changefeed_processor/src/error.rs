//! Error types shared by the storage boundary and every component above it.

use std::time::Duration;

use crate::classifier::{ExceptionClassifier, StatusCodeErrorType};

/// Dynamic error type used by observers and other pluggable components.
pub type DynError = Box<dyn std::error::Error + Send + Sync>;

/// HTTP-style status code reported by the store for a missing resource.
pub const NOT_FOUND: u16 = 404;
/// Status code for a conditional write that lost against a newer version.
pub const PRECONDITION_FAILED: u16 = 412;
/// Status code for an insert of an id that already exists.
pub const CONFLICT: u16 = 409;
/// Status code for a request that ran out of its latency budget.
pub const REQUEST_TIMEOUT: u16 = 408;
/// Status code for a partition that moved (split or merge).
pub const GONE: u16 = 410;
/// Status code for a throttled request.
pub const TOO_MANY_REQUESTS: u16 = 429;

/// Sub-status: the addressed partition key range is gone.
pub const PARTITION_KEY_RANGE_GONE: u32 = 1002;
/// Sub-status: the partition is being split.
pub const COMPLETING_SPLIT: u32 = 1007;
/// Sub-status: the partition is being migrated.
pub const COMPLETING_PARTITION_MIGRATION: u32 = 1008;

/// Error reported by the store behind a [`ChangeFeedContextClient`](crate::client::ChangeFeedContextClient).
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("store request failed with {status_code}/{sub_status_code}: {message}")]
    Status {
        status_code: u16,
        sub_status_code: u32,
        message: String,
        retry_after: Option<Duration>,
    },

    #[error("cannot decode store response: {0}")]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Unexpected(#[from] anyhow::Error),
}

impl StoreError {
    pub fn status(status_code: u16, sub_status_code: u32, message: impl Into<String>) -> Self {
        Self::Status {
            status_code,
            sub_status_code,
            message: message.into(),
            retry_after: None,
        }
    }

    pub fn not_found(message: impl Into<String>) -> Self {
        Self::status(NOT_FOUND, 0, message)
    }

    pub fn throttled(retry_after: Duration) -> Self {
        Self::Status {
            status_code: TOO_MANY_REQUESTS,
            sub_status_code: 0,
            message: "request rate is large".to_string(),
            retry_after: Some(retry_after),
        }
    }

    pub fn status_code(&self) -> Option<u16> {
        match self {
            Self::Status { status_code, .. } => Some(*status_code),
            _ => None,
        }
    }

    pub fn sub_status_code(&self) -> Option<u32> {
        match self {
            Self::Status {
                sub_status_code, ..
            } => Some(*sub_status_code),
            _ => None,
        }
    }

    /// How long the store asked the caller to wait before retrying.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            Self::Status { retry_after, .. } => *retry_after,
            _ => None,
        }
    }

    pub fn is_not_found(&self) -> bool {
        self.status_code() == Some(NOT_FOUND)
    }

    pub fn classify(&self) -> StatusCodeErrorType {
        ExceptionClassifier::classify(self)
    }
}
