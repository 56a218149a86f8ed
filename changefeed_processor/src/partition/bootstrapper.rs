use std::{sync::Arc, time::Duration};

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::lease::{LeaseError, LeaseStoreManager};

use super::{PartitionSynchronizer, sleep_unless_cancelled};

/// Makes sure the lease store holds a lease for every partition before balancing starts.
///
/// Hosts starting together race for the initialization lock; the winner creates the leases and
/// marks the store initialized, everybody else waits for that marker.
#[derive(Debug)]
pub struct Bootstrapper {
    synchronizer: Arc<PartitionSynchronizer>,
    store: Arc<LeaseStoreManager>,
    lock_ttl: Duration,
    retry_delay: Duration,
}

impl Bootstrapper {
    pub fn new(
        synchronizer: Arc<PartitionSynchronizer>,
        store: Arc<LeaseStoreManager>,
        lock_ttl: Duration,
        retry_delay: Duration,
    ) -> Self {
        Self {
            synchronizer,
            store,
            lock_ttl,
            retry_delay,
        }
    }

    /// Wait until the lease store is initialized, initializing it if this host wins the lock.
    ///
    /// Returns `false` if `shutdown` fired while waiting for another host.
    pub async fn initialize(&self, shutdown: &CancellationToken) -> Result<bool, LeaseError> {
        loop {
            if self.store.is_initialized().await? {
                return Ok(true);
            }

            if self.store.acquire_initialization_lock(self.lock_ttl).await? {
                let res = self.populate().await;
                if let Err(e) = self.store.release_initialization_lock().await {
                    warn!(%e, "Failed to release initialization lock");
                }
                return res.map(|()| true);
            }

            debug!(
                retry_delay = ?self.retry_delay,
                "Lease store is being initialized by another host"
            );
            if !sleep_unless_cancelled(self.retry_delay, shutdown).await {
                info!("Stopped waiting for lease store initialization");
                return Ok(false);
            }
        }
    }

    async fn populate(&self) -> Result<(), LeaseError> {
        let created = self.synchronizer.create_missing_leases().await?;
        self.store.mark_initialized().await?;
        info!(created, "Initialized lease store");
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use changefeed_test_helpers::timeout::FutureTimeout;

    use crate::{
        client::mem::InMemoryContextClient,
        error::StoreError,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        time::SystemProvider,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    fn bootstrapper(client: &Arc<InMemoryContextClient>, host: &str) -> Bootstrapper {
        let store = Arc::new(LeaseStoreManager::new(
            "p.",
            "rid",
            host,
            Arc::clone(client) as _,
            Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
            Arc::new(SystemProvider::new()),
        ));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            Arc::clone(client) as _,
            Arc::clone(&store),
            "rid",
        ));
        Bootstrapper::new(
            synchronizer,
            store,
            Duration::from_secs(60),
            Duration::from_millis(5),
        )
    }

    #[tokio::test]
    async fn test_initialize_creates_leases_once() {
        let client = Arc::new(InMemoryContextClient::new("rid", 4));
        let w1 = bootstrapper(&client, "w1");
        let w2 = bootstrapper(&client, "w2");

        let shutdown = CancellationToken::new();
        let (r1, r2) = tokio::join!(w1.initialize(&shutdown), w2.initialize(&shutdown));
        assert!(r1.unwrap());
        assert!(r2.unwrap());

        assert!(w1.store.is_initialized().await.unwrap());
        assert_eq!(w1.store.read_all_leases().await.unwrap().len(), 4);

        // the lock is gone, so a later initialization can take it again
        assert!(
            w2.store
                .acquire_initialization_lock(Duration::from_secs(60))
                .await
                .unwrap()
        );
    }

    #[tokio::test]
    async fn test_waits_for_other_host() {
        let client = Arc::new(InMemoryContextClient::new("rid", 2));
        let w1 = bootstrapper(&client, "w1");
        let w2 = bootstrapper(&client, "w2");

        assert!(
            w1.store
                .acquire_initialization_lock(Duration::from_secs(60))
                .await
                .unwrap()
        );
        let waiting = tokio::spawn(async move { w2.initialize(&CancellationToken::new()).await });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        w1.populate().await.unwrap();
        assert!(waiting.with_timeout_panic(WAIT).await.unwrap().unwrap());
        assert_eq!(w1.store.read_all_leases().await.unwrap().len(), 2);
    }

    #[tokio::test]
    async fn test_shutdown_while_waiting_for_other_host() {
        let client = Arc::new(InMemoryContextClient::new("rid", 2));
        let w1 = bootstrapper(&client, "w1");
        let w2 = bootstrapper(&client, "w2");

        assert!(
            w1.store
                .acquire_initialization_lock(Duration::from_secs(60))
                .await
                .unwrap()
        );
        let shutdown = CancellationToken::new();
        let waiting = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { w2.initialize(&shutdown).await }
        });

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert!(!waiting.is_finished());

        shutdown.cancel();
        assert!(!waiting.with_timeout_panic(WAIT).await.unwrap().unwrap());
        assert!(!w1.store.is_initialized().await.unwrap());
        assert!(w1.store.read_all_leases().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_store_errors_propagate() {
        let client = Arc::new(InMemoryContextClient::new("rid", 1));
        let w1 = bootstrapper(&client, "w1");

        client.inject_item_fault(StoreError::status(503, 0, "unavailable"));
        let shutdown = CancellationToken::new();
        assert_matches!(w1.initialize(&shutdown).await, Err(LeaseError::Store(_)));

        assert!(
            w1.initialize(&shutdown)
                .with_timeout_panic(WAIT)
                .await
                .unwrap()
        );
        assert_eq!(w1.store.read_all_leases().await.unwrap().len(), 1);
    }
}
