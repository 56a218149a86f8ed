use std::{collections::HashMap, sync::Arc};

use parking_lot::Mutex;
use serde::de::DeserializeOwned;
use tokio_util::{sync::CancellationToken, task::TaskTracker};
use tracing::{debug, info, warn};

use crate::{
    client::ChangeFeedContextClient,
    lease::{Lease, LeaseError, LeaseStoreManager},
    observer::{ChangeFeedObserverContext, ChangeFeedObserverFactory},
    options::ChangeFeedProcessorOptions,
    state::ChangeFeedStateV1,
};

use super::{
    LeaseCheckpointer, LeaseRenewer, PartitionError, PartitionProcessor, PartitionSupervisor,
    PartitionSynchronizer, SharedLease, processor::ProcessorSettings,
};

/// Owns the processing tasks of every lease this host holds.
#[derive(Debug)]
pub struct PartitionController<T>
where
    T: Send + 'static,
{
    store: Arc<LeaseStoreManager>,
    synchronizer: Arc<PartitionSynchronizer>,
    factory: Arc<dyn ChangeFeedObserverFactory<T>>,
    client: Arc<dyn ChangeFeedContextClient>,
    container_rid: String,
    options: ChangeFeedProcessorOptions,

    /// Leases being processed, by lease token.
    current: Mutex<HashMap<String, SharedLease>>,
    tasks: TaskTracker,
    shutdown: CancellationToken,
}

impl<T> PartitionController<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        store: Arc<LeaseStoreManager>,
        synchronizer: Arc<PartitionSynchronizer>,
        factory: Arc<dyn ChangeFeedObserverFactory<T>>,
        client: Arc<dyn ChangeFeedContextClient>,
        container_rid: impl Into<String>,
        options: ChangeFeedProcessorOptions,
    ) -> Self {
        Self {
            store,
            synchronizer,
            factory,
            client,
            container_rid: container_rid.into(),
            options,
            current: Default::default(),
            tasks: TaskTracker::new(),
            shutdown: CancellationToken::new(),
        }
    }

    /// Tokens of the leases currently processed, sorted.
    pub fn lease_tokens(&self) -> Vec<String> {
        let mut tokens = self.current.lock().keys().cloned().collect::<Vec<_>>();
        tokens.sort();
        tokens
    }

    /// Start processing `lease`, or refresh its properties if it is already being processed.
    ///
    /// Losing the race to acquire the lease is not an error.
    pub async fn add_or_update_lease(self: &Arc<Self>, lease: Lease) -> Result<(), LeaseError> {
        if self.shutdown.is_cancelled() {
            return Ok(());
        }

        let known = self.current.lock().get(&lease.lease_token).cloned();
        if let Some(shared) = known {
            let mut current = shared.get();
            current.properties = lease.properties;
            let updated = self.store.update_properties(&current).await?;
            shared.set(updated);
            return Ok(());
        }

        let Some(acquired) = self.store.acquire(&lease).await? else {
            return Ok(());
        };
        let state = match acquired.read_state(
            &self.container_rid,
            self.options.mode,
            &self.options.start_from,
        ) {
            Ok(state) => state,
            Err(e) => {
                self.release(&acquired).await;
                return Err(e);
            }
        };
        self.start_processing(acquired, state);
        Ok(())
    }

    fn start_processing(self: &Arc<Self>, lease: Lease, state: ChangeFeedStateV1) {
        let shared = SharedLease::new(lease.clone());
        {
            let mut current = self.current.lock();
            if current.contains_key(&lease.lease_token) {
                debug!(lease_token = %lease.lease_token, "Lease is already being processed");
                return;
            }
            current.insert(lease.lease_token.clone(), shared.clone());
        }

        let ctx = ChangeFeedObserverContext::new(
            lease.lease_token.clone(),
            lease.feed_range.clone(),
            Arc::new(LeaseCheckpointer::new(
                Arc::clone(&self.store),
                shared.clone(),
            )),
            self.options.checkpoint_frequency.explicit_checkpoint,
        );
        let processor = PartitionProcessor::new(
            Arc::clone(&self.client),
            ctx.clone(),
            state,
            ProcessorSettings {
                max_items_count: self.options.max_items_count,
                feed_poll_delay: self.options.feed_poll_delay,
                backoff: self.options.backoff,
            },
        );
        let renewer = LeaseRenewer::new(
            Arc::clone(&self.store),
            shared.clone(),
            self.options.lease_renew_interval,
        );
        let supervisor =
            PartitionSupervisor::new(ctx, self.factory.create_observer(), processor, renewer);

        info!(lease_token = %lease.lease_token, "Starting partition processing");
        let this = Arc::clone(self);
        let shutdown = self.shutdown.clone();
        self.tasks.spawn(async move {
            let res = supervisor.run(shutdown).await;
            this.on_partition_completed(shared, res).await;
        });
    }

    async fn on_partition_completed(
        self: Arc<Self>,
        shared: SharedLease,
        res: Result<(), PartitionError>,
    ) {
        let lease = shared.get();
        self.current.lock().remove(&lease.lease_token);

        match res {
            Ok(()) => self.release(&lease).await,
            Err(PartitionError::FeedRangeGone { .. }) => self.handle_feed_range_gone(lease).await,
            Err(PartitionError::PartitionNotFound { .. }) => {
                info!(lease_token = %lease.lease_token, "Partition is gone, removing lease");
                if let Err(e) = self.store.delete(&lease).await {
                    warn!(lease_token = %lease.lease_token, %e, "Failed to delete lease");
                }
            }
            Err(PartitionError::Lease(e @ LeaseError::LeaseLost { .. })) => {
                info!(lease_token = %lease.lease_token, %e, "Stopped processing lost lease");
            }
            Err(e) => {
                warn!(lease_token = %lease.lease_token, %e, "Partition processing failed");
                self.release(&lease).await;
            }
        }
    }

    async fn handle_feed_range_gone(self: &Arc<Self>, lease: Lease) {
        let leases = match self.synchronizer.handle_feed_range_gone(&lease).await {
            Ok(leases) => leases,
            Err(LeaseError::Store(e)) if e.is_not_found() => {
                info!(lease_token = %lease.lease_token, %e, "No partition left, removing lease");
                if let Err(e) = self.store.delete(&lease).await {
                    warn!(lease_token = %lease.lease_token, %e, "Failed to delete lease");
                }
                return;
            }
            Err(e) => {
                warn!(lease_token = %lease.lease_token, %e, "Failed to handle split or merge");
                self.release(&lease).await;
                return;
            }
        };

        for lease in leases {
            if self.shutdown.is_cancelled() {
                if lease.is_owned_by(self.store.host_name()) {
                    self.release(&lease).await;
                }
                continue;
            }
            if let Err(e) = self.add_or_update_lease(lease.clone()).await {
                warn!(lease_token = %lease.lease_token, %e, "Failed to take over lease");
            }
        }
    }

    async fn release(&self, lease: &Lease) {
        match self.store.release(lease).await {
            Ok(()) => {}
            Err(e @ LeaseError::LeaseLost { .. }) => {
                debug!(lease_token = %lease.lease_token, %e, "Lease was already taken over");
            }
            Err(e) => warn!(lease_token = %lease.lease_token, %e, "Failed to release lease"),
        }
    }

    /// Stop every partition task and wait until they released their leases.
    pub async fn shutdown(&self) {
        self.shutdown.cancel();
        self.tasks.close();
        self.tasks.wait().await;
        info!("Partition controller stopped");
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use changefeed_test_helpers::timeout::{FutureTimeout, wait_until};
    use serde_json::{Value, json};

    use crate::{
        client::mem::InMemoryContextClient,
        observer::{
            CheckpointFrequency, CheckpointerObserverFactory, CloseReason,
            mock::{MockObserverFactory, MockObserverLog, MockStep},
        },
        range::FeedRange,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        state::ChangeFeedStartFrom,
        time::SystemProvider,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    struct Fixture {
        client: Arc<InMemoryContextClient>,
        store: Arc<LeaseStoreManager>,
        controller: Arc<PartitionController<Value>>,
        log: Arc<MockObserverLog<Value>>,
    }

    impl Fixture {
        fn new(partitions: usize, mock: MockObserverFactory<Value>) -> Self {
            let client = Arc::new(InMemoryContextClient::new("rid", partitions));
            let store = Arc::new(LeaseStoreManager::new(
                "p.",
                "rid",
                "w1",
                Arc::clone(&client) as _,
                Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
                Arc::new(SystemProvider::new()),
            ));
            let synchronizer = Arc::new(PartitionSynchronizer::new(
                Arc::clone(&client) as _,
                Arc::clone(&store),
                "rid",
            ));
            let options = ChangeFeedProcessorOptions {
                lease_renew_interval: Duration::from_millis(10),
                feed_poll_delay: Duration::from_millis(5),
                start_from: ChangeFeedStartFrom::Beginning,
                ..Default::default()
            };
            let log = mock.log();
            let factory = CheckpointerObserverFactory::new(
                mock,
                CheckpointFrequency::every_batch(),
                Arc::new(SystemProvider::new()),
            );
            let controller = Arc::new(PartitionController::new(
                Arc::clone(&store),
                synchronizer,
                Arc::new(factory),
                Arc::clone(&client) as _,
                "rid",
                options,
            ));
            Self {
                client,
                store,
                controller,
                log,
            }
        }

        async fn create_leases(&self) -> Vec<Lease> {
            for partition in self.client.partitions() {
                self.store
                    .create_lease_if_not_exist(&FeedRange::new(partition.to_range()), None)
                    .await
                    .unwrap();
            }
            self.store.read_all_leases().await.unwrap()
        }

        async fn stored(&self, lease_token: &str) -> Lease {
            self.store
                .read_all_leases()
                .await
                .unwrap()
                .into_iter()
                .find(|l| l.lease_token == lease_token)
                .unwrap()
        }
    }

    #[tokio::test]
    async fn test_processes_and_releases_on_shutdown() {
        let fixture = Fixture::new(1, MockObserverFactory::new());
        let lease = fixture.create_leases().await.remove(0);
        fixture.client.upsert_document("a", json!({"id": "a"}));

        fixture.controller.add_or_update_lease(lease).await.unwrap();
        assert_eq!(fixture.controller.lease_tokens(), ["-FF"]);
        assert!(fixture.stored("-FF").await.is_owned_by("w1"));

        wait_until("change delivered", || fixture.log.changes().len() == 1).await;

        fixture.controller.shutdown().with_timeout_panic(WAIT).await;
        assert!(fixture.controller.lease_tokens().is_empty());
        assert_eq!(
            fixture.log.closed(),
            [("-FF".to_string(), CloseReason::Shutdown)]
        );

        let stored = fixture.stored("-FF").await;
        assert_eq!(stored.owner(), None);
        assert!(stored.continuation_token.is_some());
    }

    #[tokio::test]
    async fn test_lost_acquire_race_is_skipped() {
        let fixture = Fixture::new(1, MockObserverFactory::new());
        let lease = fixture.create_leases().await.remove(0);

        // someone else acquires first, our copy is stale
        let other = LeaseStoreManager::new(
            "p.",
            "rid",
            "w2",
            Arc::clone(&fixture.client) as _,
            Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
            Arc::new(SystemProvider::new()),
        );
        other.acquire(&lease).await.unwrap().unwrap();

        fixture.controller.add_or_update_lease(lease).await.unwrap();
        assert!(fixture.controller.lease_tokens().is_empty());
        assert!(fixture.stored("-FF").await.is_owned_by("w2"));
        assert!(fixture.log.opened().is_empty());
    }

    #[tokio::test]
    async fn test_known_lease_only_updates_properties() {
        let fixture = Fixture::new(1, MockObserverFactory::new());
        let lease = fixture.create_leases().await.remove(0);
        fixture
            .controller
            .add_or_update_lease(lease.clone())
            .await
            .unwrap();

        let mut update = fixture.stored("-FF").await;
        update
            .properties
            .insert("region".to_string(), "west".to_string());
        fixture.controller.add_or_update_lease(update).await.unwrap();

        wait_until("observer opened", || !fixture.log.opened().is_empty()).await;
        assert_eq!(fixture.log.opened(), ["-FF"]);
        assert_eq!(
            fixture.stored("-FF").await.properties.get("region"),
            Some(&"west".to_string())
        );
        fixture.controller.shutdown().with_timeout_panic(WAIT).await;
    }

    #[tokio::test]
    async fn test_split_hands_over_to_children() {
        let fixture = Fixture::new(1, MockObserverFactory::new());
        let lease = fixture.create_leases().await.remove(0);
        fixture.client.upsert_document("a", json!({"id": "a"}));

        fixture.controller.add_or_update_lease(lease).await.unwrap();
        wait_until("first change", || fixture.log.changes().len() == 1).await;

        fixture.client.split_partition("0").unwrap();
        fixture.client.upsert_document("b", json!({"id": "b"}));
        fixture.client.upsert_document("c", json!({"id": "c"}));

        wait_until("children processing", || {
            fixture.controller.lease_tokens() == ["-7F80", "7F80-FF"]
        })
        .await;
        wait_until("all changes", || fixture.log.changes().len() == 3).await;
        assert!(fixture.log.closed().contains(&("-FF".to_string(), CloseReason::LeaseGone)));

        let mut ids = fixture
            .log
            .changes()
            .iter()
            .map(|c| c["id"].as_str().unwrap().to_string())
            .collect::<Vec<_>>();
        ids.sort();
        assert_eq!(ids, ["a", "b", "c"]);

        fixture.controller.shutdown().with_timeout_panic(WAIT).await;
        let tokens = fixture
            .store
            .read_all_leases()
            .await
            .unwrap()
            .into_iter()
            .map(|l| l.lease_token)
            .collect::<Vec<_>>();
        assert_eq!(tokens, ["-7F80", "7F80-FF"]);
    }

    #[tokio::test]
    async fn test_failed_observer_releases_lease() {
        let fixture = Fixture::new(
            1,
            MockObserverFactory::new().with_steps([MockStep::Fail("boom".into())]),
        );
        let lease = fixture.create_leases().await.remove(0);
        fixture.client.upsert_document("a", json!({"id": "a"}));

        fixture.controller.add_or_update_lease(lease).await.unwrap();
        wait_until("lease released", || {
            fixture.controller.lease_tokens().is_empty()
        })
        .await;
        fixture.controller.shutdown().with_timeout_panic(WAIT).await;

        assert_eq!(
            fixture.log.closed(),
            [("-FF".to_string(), CloseReason::ObserverError)]
        );
        let stored = fixture.stored("-FF").await;
        assert_eq!(stored.owner(), None);
        // nothing was checkpointed, the batch is read again by the next owner
        assert_eq!(stored.continuation_token, None);
    }

    #[tokio::test]
    async fn test_no_new_work_after_shutdown() {
        let fixture = Fixture::new(1, MockObserverFactory::new());
        let lease = fixture.create_leases().await.remove(0);
        fixture.controller.shutdown().with_timeout_panic(WAIT).await;

        fixture.controller.add_or_update_lease(lease).await.unwrap();
        assert_eq!(fixture.stored("-FF").await.owner(), None);
    }
}
