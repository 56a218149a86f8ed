//! Per-operation settings for requests against the lease container.

use std::{fmt::Display, future::Future, sync::Arc, time::Duration};

use crate::error::{REQUEST_TIMEOUT, StoreError};

/// Settings for one store request.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RequestOptions {
    /// Partition key the item lives under, if the container is partitioned.
    pub partition_key: Option<String>,

    /// Apply a write only if the stored item still has this etag.
    pub if_match: Option<String>,

    /// Overall latency budget; overrides the client's default policy.
    pub end_to_end_timeout: Option<Duration>,

    /// Whether the client's default end-to-end latency policy applies.
    pub end_to_end_latency_policy_enabled: bool,
}

impl Default for RequestOptions {
    fn default() -> Self {
        Self {
            partition_key: None,
            if_match: None,
            end_to_end_timeout: None,
            end_to_end_latency_policy_enabled: true,
        }
    }
}

impl RequestOptions {
    pub fn with_if_match(mut self, etag: impl Into<String>) -> Self {
        self.if_match = Some(etag.into());
        self
    }

    /// Latency budget of this request on a client whose default policy is `client_default`.
    pub fn latency_budget(&self, client_default: Option<Duration>) -> Option<Duration> {
        match self.end_to_end_timeout {
            Some(timeout) => Some(timeout),
            None if self.end_to_end_latency_policy_enabled => client_default,
            None => None,
        }
    }

    /// Run `fut`, failing with a request timeout once the budget is spent.
    pub async fn run_within_budget<F, T>(
        &self,
        client_default: Option<Duration>,
        fut: F,
    ) -> Result<T, StoreError>
    where
        F: Future<Output = Result<T, StoreError>> + Send,
    {
        let Some(budget) = self.latency_budget(client_default) else {
            return fut.await;
        };
        match tokio::time::timeout(budget, fut).await {
            Ok(res) => res,
            Err(_) => Err(StoreError::status(
                REQUEST_TIMEOUT,
                0,
                format!("end-to-end latency budget of {budget:?} exceeded"),
            )),
        }
    }
}

/// Builds [`RequestOptions`] for lease documents and lease queries.
pub trait RequestOptionsFactory: std::fmt::Debug + Display + Send + Sync {
    /// Options for a point operation on the lease-container item `id`.
    fn create_item_request_options(&self, id: &str) -> RequestOptions;

    /// Options for enumerating lease-container items.
    fn create_query_request_options(&self) -> RequestOptions;
}

impl<T> RequestOptionsFactory for Arc<T>
where
    T: RequestOptionsFactory + ?Sized,
{
    fn create_item_request_options(&self, id: &str) -> RequestOptions {
        self.as_ref().create_item_request_options(id)
    }

    fn create_query_request_options(&self) -> RequestOptions {
        self.as_ref().create_query_request_options()
    }
}

/// Lease container partitioned by `/id`.
///
/// Every request has the default end-to-end latency policy disabled: lease operations run without
/// a latency budget.
#[derive(Debug, Clone, Copy, Default)]
pub struct PartitionedByIdCollectionRequestOptionsFactory;

impl Display for PartitionedByIdCollectionRequestOptionsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partitioned_by_id")
    }
}

impl RequestOptionsFactory for PartitionedByIdCollectionRequestOptionsFactory {
    fn create_item_request_options(&self, id: &str) -> RequestOptions {
        RequestOptions {
            partition_key: Some(id.to_string()),
            end_to_end_latency_policy_enabled: false,
            ..Default::default()
        }
    }

    fn create_query_request_options(&self) -> RequestOptions {
        RequestOptions {
            end_to_end_latency_policy_enabled: false,
            ..Default::default()
        }
    }
}

/// Unpartitioned lease container.
#[derive(Debug, Clone, Copy, Default)]
pub struct SinglePartitionRequestOptionsFactory;

impl Display for SinglePartitionRequestOptionsFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "single_partition")
    }
}

impl RequestOptionsFactory for SinglePartitionRequestOptionsFactory {
    fn create_item_request_options(&self, _id: &str) -> RequestOptions {
        RequestOptions::default()
    }

    fn create_query_request_options(&self) -> RequestOptions {
        RequestOptions::default()
    }
}
