use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::lease::{LeaseError, LeaseStoreManager};

use super::{PartitionError, SharedLease, sleep_unless_cancelled};

/// Keeps a lease alive while it is being processed.
#[derive(Debug)]
pub struct LeaseRenewer {
    store: Arc<LeaseStoreManager>,
    lease: SharedLease,
    renew_interval: Duration,
}

impl LeaseRenewer {
    pub fn new(store: Arc<LeaseStoreManager>, lease: SharedLease, renew_interval: Duration) -> Self {
        Self {
            store,
            lease,
            renew_interval,
        }
    }

    /// Renew every `renew_interval` until `shutdown` fires.
    ///
    /// Only a lost lease ends renewal early; other failures are retried on the next tick, the
    /// lease only expires after several missed renewals.
    pub async fn run(&self, shutdown: &CancellationToken) -> Result<(), PartitionError> {
        while sleep_unless_cancelled(self.renew_interval, shutdown).await {
            let lease = self.lease.get();
            match self.store.renew(&lease).await {
                Ok(renewed) => {
                    debug!(lease_token = %renewed.lease_token, "Renewed lease");
                    self.lease.set(renewed);
                }
                Err(e @ LeaseError::LeaseLost { .. }) => {
                    warn!(lease_token = %lease.lease_token, %e, "Lease lost while renewing");
                    return Err(e.into());
                }
                Err(e) => {
                    warn!(lease_token = %lease.lease_token, %e, "Failed to renew lease");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use changefeed_test_helpers::timeout::{FutureTimeout, wait_until};

    use crate::{
        client::mem::InMemoryContextClient,
        error::StoreError,
        lease::Lease,
        range::FeedRange,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        time::{MockProvider, Time},
    };

    use super::*;

    struct Fixture {
        client: Arc<InMemoryContextClient>,
        time: Arc<MockProvider>,
    }

    impl Fixture {
        fn new() -> Self {
            Self {
                client: Arc::new(InMemoryContextClient::new("rid", 1)),
                time: Arc::new(MockProvider::new(
                    Time::from_timestamp_millis(1_700_000_000_000).unwrap(),
                )),
            }
        }

        fn store(&self, host: &str) -> Arc<LeaseStoreManager> {
            Arc::new(LeaseStoreManager::new(
                "p.",
                "rid",
                host,
                Arc::clone(&self.client) as _,
                Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
                Arc::clone(&self.time) as _,
            ))
        }

        async fn owned_lease(&self, store: &LeaseStoreManager) -> Lease {
            let lease = store
                .create_lease_if_not_exist(&FeedRange::full(), None)
                .await
                .unwrap()
                .unwrap();
            store.acquire(&lease).await.unwrap().unwrap()
        }
    }

    #[tokio::test]
    async fn test_renews_until_shutdown() {
        let fixture = Fixture::new();
        let store = fixture.store("w1");
        let lease = fixture.owned_lease(&store).await;
        let shared = SharedLease::new(lease.clone());
        let renewer = LeaseRenewer::new(
            Arc::clone(&store),
            shared.clone(),
            Duration::from_millis(1),
        );

        let shutdown = CancellationToken::new();
        let task = {
            let shutdown = shutdown.clone();
            async move { renewer.run(&shutdown).await }
        };
        let handle = tokio::spawn(task);

        let renewed_at = fixture.time.inc(Duration::from_secs(5));
        wait_until("renewal", || {
            shared.get().timestamp == renewed_at.date_time()
        })
        .await;

        shutdown.cancel();
        handle
            .with_timeout_panic(Duration::from_secs(5))
            .await
            .unwrap()
            .unwrap();
        assert_ne!(shared.get().etag, lease.etag);
    }

    #[tokio::test]
    async fn test_stops_when_lease_is_lost() {
        let fixture = Fixture::new();
        let w1 = fixture.store("w1");
        let lease = fixture.owned_lease(&w1).await;

        let w2 = fixture.store("w2");
        w2.acquire(&lease).await.unwrap().unwrap();

        let renewer = LeaseRenewer::new(w1, SharedLease::new(lease), Duration::from_millis(1));
        let err = renewer
            .run(&CancellationToken::new())
            .with_timeout_panic(Duration::from_secs(5))
            .await
            .unwrap_err();
        assert_matches!(err, PartitionError::Lease(LeaseError::LeaseLost { owner: Some(owner), .. }) if owner == "w2");
    }

    #[tokio::test]
    async fn test_store_failures_are_retried() {
        let fixture = Fixture::new();
        let store = fixture.store("w1");
        let lease = fixture.owned_lease(&store).await;
        fixture
            .client
            .inject_item_fault(StoreError::status(503, 0, "unavailable"));

        let shared = SharedLease::new(lease.clone());
        let renewer = LeaseRenewer::new(store, shared.clone(), Duration::from_millis(1));
        let shutdown = CancellationToken::new();
        let handle = {
            let shutdown = shutdown.clone();
            tokio::spawn(async move { renewer.run(&shutdown).await })
        };

        wait_until("renewal after failure", || {
            shared.get().etag != lease.etag
        })
        .await;
        shutdown.cancel();
        handle.await.unwrap().unwrap();
    }
}
