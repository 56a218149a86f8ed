//! Maps store failures onto the small set of conditions the processor reacts to.

use std::fmt::Display;

use crate::error::{
    COMPLETING_PARTITION_MIGRATION, COMPLETING_SPLIT, GONE, NOT_FOUND, PARTITION_KEY_RANGE_GONE,
    StoreError, TOO_MANY_REQUESTS,
};

/// Message the store returns when a page of the requested size does not fit in a response.
pub const MAX_ITEM_COUNT_TOO_LARGE_MESSAGE: &str = "Reduce page size and try again.";

/// Error category of a failed store operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum StatusCodeErrorType {
    /// The partition or lease no longer exists.
    PartitionNotFound,

    /// The partition was split or merged; the range must be re-resolved.
    PartitionSplitOrMerge,

    /// Throttling or a server-side failure; retry with backoff.
    TransientError,

    /// The response for the requested page size was too large.
    MaxItemCountTooLarge,

    /// A document was nested too deeply to be decoded.
    StreamsConstrained,

    /// A document could not be decoded.
    JsonParsingError,

    /// Anything else.
    Undefined,
}

impl StatusCodeErrorType {
    pub fn name(&self) -> &'static str {
        match self {
            Self::PartitionNotFound => "partition_not_found",
            Self::PartitionSplitOrMerge => "partition_split_or_merge",
            Self::TransientError => "transient",
            Self::MaxItemCountTooLarge => "max_item_count_too_large",
            Self::StreamsConstrained => "streams_constrained",
            Self::JsonParsingError => "json_parsing",
            Self::Undefined => "undefined",
        }
    }

    /// Decoding or response-size failures that a smaller page may avoid.
    pub fn is_page_size_related(&self) -> bool {
        matches!(
            self,
            Self::MaxItemCountTooLarge | Self::StreamsConstrained | Self::JsonParsingError
        )
    }
}

impl Display for StatusCodeErrorType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct ExceptionClassifier;

impl ExceptionClassifier {
    pub fn classify(e: &StoreError) -> StatusCodeErrorType {
        match e {
            StoreError::Status {
                status_code,
                sub_status_code,
                message,
                ..
            } => Self::classify_status(*status_code, *sub_status_code, message),
            StoreError::Json(e) => Self::classify_json(e),
            StoreError::Unexpected(_) => StatusCodeErrorType::Undefined,
        }
    }

    pub fn classify_status(
        status_code: u16,
        sub_status_code: u32,
        message: &str,
    ) -> StatusCodeErrorType {
        if status_code == NOT_FOUND && sub_status_code != PARTITION_KEY_RANGE_GONE {
            return StatusCodeErrorType::PartitionNotFound;
        }

        if status_code == GONE
            && matches!(
                sub_status_code,
                PARTITION_KEY_RANGE_GONE | COMPLETING_SPLIT | COMPLETING_PARTITION_MIGRATION
            )
        {
            return StatusCodeErrorType::PartitionSplitOrMerge;
        }

        if status_code == TOO_MANY_REQUESTS || status_code >= 500 {
            return StatusCodeErrorType::TransientError;
        }

        if message.contains(MAX_ITEM_COUNT_TOO_LARGE_MESSAGE) {
            return StatusCodeErrorType::MaxItemCountTooLarge;
        }

        StatusCodeErrorType::Undefined
    }

    pub fn classify_json(e: &serde_json::Error) -> StatusCodeErrorType {
        if e.to_string().contains("recursion limit exceeded") {
            StatusCodeErrorType::StreamsConstrained
        } else {
            StatusCodeErrorType::JsonParsingError
        }
    }
}
