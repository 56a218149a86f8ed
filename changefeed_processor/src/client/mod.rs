//! The boundary between the processor and the document store.
//!
//! The processor talks to two containers through this trait: the monitored container, whose
//! change feed it reads, and the lease container, where lease documents live as ordinary items.
//! Transport and authentication are the implementation's concern.

use std::{
    fmt::{Debug, Display},
    sync::Arc,
};

use async_trait::async_trait;
use serde_json::Value;

use crate::{
    error::StoreError,
    range::{PartitionKeyRange, Range},
    request::ChangeFeedRequest,
    request_options::RequestOptions,
};

pub mod mem;

/// A lease-container item together with its version.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct VersionedItem {
    pub id: String,
    pub etag: String,
    pub body: Value,
}

/// Result of a conditional write.
///
/// Losing an optimistic-concurrency race is an expected outcome, not an error.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum WriteOutcome {
    Applied(VersionedItem),
    Conflict,
}

/// One page of the change feed.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct FeedResponse {
    /// Raw JSON documents, ascending by LSN.
    pub documents: Vec<String>,

    /// Etag to resume after this page.
    pub continuation: Option<String>,

    /// Most recent LSN of the partition at the time of the read.
    pub latest_lsn: Option<u64>,
}

#[async_trait]
pub trait ChangeFeedContextClient: Debug + Display + Send + Sync {
    /// Resource id of the monitored container.
    async fn read_container_rid(&self) -> Result<String, StoreError>;

    /// Every physical partition of the monitored container.
    async fn read_partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError>;

    /// Physical partitions overlapping `range`. `force_refresh` bypasses any cached routing map.
    async fn get_overlapping_ranges(
        &self,
        range: &Range,
        force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>, StoreError>;

    /// Read one page of the change feed.
    async fn query_change_feed(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<FeedResponse, StoreError>;

    /// Insert `body` as item `id`; [`WriteOutcome::Conflict`] if the id exists.
    async fn create_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError>;

    /// `None` if the item does not exist.
    async fn read_item(
        &self,
        id: &str,
        options: &RequestOptions,
    ) -> Result<Option<VersionedItem>, StoreError>;

    /// Replace item `id`; conditional on [`RequestOptions::if_match`] when set.
    async fn replace_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError>;

    /// Delete item `id`; a 404 [`StoreError`] if it does not exist.
    async fn delete_item(&self, id: &str, options: &RequestOptions) -> Result<(), StoreError>;

    /// Every item whose id starts with `id_prefix`.
    async fn query_items(
        &self,
        id_prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<VersionedItem>, StoreError>;

    /// Delete several items, ignoring ones that are already gone.
    async fn delete_items(&self, ids: &[String], options: &RequestOptions) -> Result<(), StoreError> {
        for id in ids {
            match self.delete_item(id, options).await {
                Ok(()) => {}
                Err(e) if e.is_not_found() => {}
                Err(e) => return Err(e),
            }
        }
        Ok(())
    }
}

#[async_trait]
impl<T> ChangeFeedContextClient for Arc<T>
where
    T: ChangeFeedContextClient + ?Sized,
{
    async fn read_container_rid(&self) -> Result<String, StoreError> {
        self.as_ref().read_container_rid().await
    }

    async fn read_partition_key_ranges(&self) -> Result<Vec<PartitionKeyRange>, StoreError> {
        self.as_ref().read_partition_key_ranges().await
    }

    async fn get_overlapping_ranges(
        &self,
        range: &Range,
        force_refresh: bool,
    ) -> Result<Vec<PartitionKeyRange>, StoreError> {
        self.as_ref()
            .get_overlapping_ranges(range, force_refresh)
            .await
    }

    async fn query_change_feed(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<FeedResponse, StoreError> {
        self.as_ref().query_change_feed(request).await
    }

    async fn create_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError> {
        self.as_ref().create_item(id, body, options).await
    }

    async fn read_item(
        &self,
        id: &str,
        options: &RequestOptions,
    ) -> Result<Option<VersionedItem>, StoreError> {
        self.as_ref().read_item(id, options).await
    }

    async fn replace_item(
        &self,
        id: &str,
        body: Value,
        options: &RequestOptions,
    ) -> Result<WriteOutcome, StoreError> {
        self.as_ref().replace_item(id, body, options).await
    }

    async fn delete_item(&self, id: &str, options: &RequestOptions) -> Result<(), StoreError> {
        self.as_ref().delete_item(id, options).await
    }

    async fn query_items(
        &self,
        id_prefix: &str,
        options: &RequestOptions,
    ) -> Result<Vec<VersionedItem>, StoreError> {
        self.as_ref().query_items(id_prefix, options).await
    }

    async fn delete_items(&self, ids: &[String], options: &RequestOptions) -> Result<(), StoreError> {
        self.as_ref().delete_items(ids, options).await
    }
}
