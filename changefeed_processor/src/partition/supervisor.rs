use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::observer::{
    ChangeFeedObserver, ChangeFeedObserverContext, CloseReason, exception_wrapping::ObserverStage,
};

use super::{LeaseRenewer, PartitionError, PartitionProcessor};

/// Runs everything that belongs to one acquired lease.
///
/// Opens the observer, then drives the pump and the renewer concurrently until one of them
/// stops, and closes the observer with the reason the lease stopped for.
#[derive(Debug)]
pub struct PartitionSupervisor<T>
where
    T: Send + 'static,
{
    ctx: ChangeFeedObserverContext,
    observer: Box<dyn ChangeFeedObserver<T>>,
    processor: PartitionProcessor<T>,
    renewer: LeaseRenewer,
}

impl<T> PartitionSupervisor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        ctx: ChangeFeedObserverContext,
        observer: Box<dyn ChangeFeedObserver<T>>,
        processor: PartitionProcessor<T>,
        renewer: LeaseRenewer,
    ) -> Self {
        Self {
            ctx,
            observer,
            processor,
            renewer,
        }
    }

    /// Process the lease until `shutdown` fires (`Ok`) or it cannot be processed any further.
    pub async fn run(self, shutdown: CancellationToken) -> Result<(), PartitionError> {
        let Self {
            ctx,
            mut observer,
            mut processor,
            renewer,
        } = self;

        if let Err(e) = observer.open(&ctx).await {
            let e = PartitionError::from_observer(e, ObserverStage::Open);
            close(observer.as_mut(), &ctx, e.close_reason()).await;
            return Err(e);
        }

        let stop = shutdown.child_token();
        let (processed, renewed) = tokio::join!(
            async {
                let res = processor.run(observer.as_mut(), &stop).await;
                stop.cancel();
                res
            },
            async {
                let res = renewer.run(&stop).await;
                stop.cancel();
                res
            },
        );

        let res = processed.and(renewed);
        let reason = match &res {
            Ok(()) => CloseReason::Shutdown,
            Err(e) => e.close_reason(),
        };
        close(observer.as_mut(), &ctx, reason).await;
        res
    }
}

async fn close<T>(
    observer: &mut dyn ChangeFeedObserver<T>,
    ctx: &ChangeFeedObserverContext,
    reason: CloseReason,
) where
    T: Send + 'static,
{
    match observer.close(ctx, reason).await {
        Ok(()) => info!(lease_token = ctx.lease_token(), %reason, "Partition processing stopped"),
        Err(e) => warn!(
            lease_token = ctx.lease_token(),
            %reason,
            %e,
            "Observer failed to close"
        ),
    }
}

#[cfg(test)]
mod tests {
    use std::{sync::Arc, time::Duration};

    use assert_matches::assert_matches;
    use changefeed_test_helpers::timeout::{FutureTimeout, wait_until};
    use serde_json::{Value, json};

    use crate::{
        backoff::BackoffConfig,
        client::mem::InMemoryContextClient,
        lease::{LeaseError, LeaseStoreManager},
        observer::{
            ChangeFeedObserverFactory, CheckpointFrequency, CheckpointerObserverFactory,
            ObserverExceptionWrapping,
            mock::{MockChangeFeedObserver, MockObserverFactory, MockStep},
        },
        partition::{LeaseCheckpointer, SharedLease, processor::ProcessorSettings},
        range::FeedRange,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        state::{ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedStateV1},
        time::SystemProvider,
    };

    use super::*;

    const WAIT: Duration = Duration::from_secs(10);

    struct Fixture {
        client: Arc<InMemoryContextClient>,
        store: Arc<LeaseStoreManager>,
        lease: SharedLease,
    }

    impl Fixture {
        async fn new() -> Self {
            let client = Arc::new(InMemoryContextClient::new("rid", 1));
            let store = Arc::new(LeaseStoreManager::new(
                "p.",
                "rid",
                "w1",
                Arc::clone(&client) as _,
                Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
                Arc::new(SystemProvider::new()),
            ));
            let lease = store
                .create_lease_if_not_exist(&FeedRange::full(), None)
                .await
                .unwrap()
                .unwrap();
            let lease = store.acquire(&lease).await.unwrap().unwrap();
            Self {
                client,
                store,
                lease: SharedLease::new(lease),
            }
        }

        fn supervisor(
            &self,
            observer: Box<dyn ChangeFeedObserver<Value>>,
        ) -> PartitionSupervisor<Value> {
            let lease = self.lease.get();
            let ctx = ChangeFeedObserverContext::new(
                lease.lease_token.clone(),
                lease.feed_range.clone(),
                Arc::new(LeaseCheckpointer::new(
                    Arc::clone(&self.store),
                    self.lease.clone(),
                )),
                false,
            );
            let state = ChangeFeedStateV1::new(
                "rid",
                lease.feed_range,
                ChangeFeedMode::Incremental,
                ChangeFeedStartFrom::Beginning,
                None,
            );
            let processor = PartitionProcessor::new(
                Arc::clone(&self.client) as _,
                ctx.clone(),
                state,
                ProcessorSettings {
                    max_items_count: 10,
                    feed_poll_delay: Duration::from_millis(5),
                    backoff: BackoffConfig::default(),
                },
            );
            let renewer = LeaseRenewer::new(
                Arc::clone(&self.store),
                self.lease.clone(),
                Duration::from_millis(5),
            );
            PartitionSupervisor::new(ctx, observer, processor, renewer)
        }
    }

    #[tokio::test]
    async fn test_shutdown_closes_observer() {
        let fixture = Fixture::new().await;
        fixture.client.upsert_document("a", json!({"id": "a"}));

        let mock = MockObserverFactory::<Value>::new();
        let log = mock.log();
        let factory = CheckpointerObserverFactory::new(
            mock,
            CheckpointFrequency::every_batch(),
            Arc::new(SystemProvider::new()),
        );
        let supervisor = fixture.supervisor(factory.create_observer());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));
        wait_until("batch delivered", || log.changes().len() == 1).await;
        wait_until("checkpoint", || {
            fixture.lease.get().continuation_token.is_some()
        })
        .await;

        shutdown.cancel();
        handle.with_timeout_panic(WAIT).await.unwrap().unwrap();
        assert_eq!(log.opened(), ["-FF"]);
        assert_eq!(log.closed(), [("-FF".to_string(), CloseReason::Shutdown)]);
    }

    #[tokio::test]
    async fn test_shutdown_mid_batch_finishes_batch() {
        let fixture = Fixture::new().await;
        fixture.client.upsert_document("a", json!({"id": "a"}));

        let mock = MockObserverFactory::<Value>::new()
            .with_steps([MockStep::Delay(Duration::from_millis(100))]);
        let log = mock.log();
        let factory = CheckpointerObserverFactory::new(
            mock,
            CheckpointFrequency::every_batch(),
            Arc::new(SystemProvider::new()),
        );
        let supervisor = fixture.supervisor(factory.create_observer());

        let shutdown = CancellationToken::new();
        let handle = tokio::spawn(supervisor.run(shutdown.clone()));
        wait_until("batch started", || log.batches().len() == 1).await;
        assert_eq!(fixture.lease.get().continuation_token, None);

        shutdown.cancel();
        handle.with_timeout_panic(WAIT).await.unwrap().unwrap();

        assert_eq!(log.batches().len(), 1);
        assert!(fixture.lease.get().continuation_token.is_some());
        let stored = fixture
            .store
            .read_lease(&fixture.lease.get().id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(stored.continuation_token, fixture.lease.get().continuation_token);
        assert_eq!(log.closed(), [("-FF".to_string(), CloseReason::Shutdown)]);
    }

    #[tokio::test]
    async fn test_observer_failure_closes_with_observer_error() {
        let fixture = Fixture::new().await;
        fixture.client.upsert_document("a", json!({"id": "a"}));

        let observer = MockChangeFeedObserver::<Value>::new().with_steps([MockStep::Panic]);
        let log = observer.log();
        let wrapped = Box::new(ObserverExceptionWrapping::new(observer));

        let err = fixture
            .supervisor(wrapped)
            .run(CancellationToken::new())
            .with_timeout_panic(WAIT)
            .await
            .unwrap_err();
        assert_matches!(err, PartitionError::Observer(_));
        assert_eq!(
            log.closed(),
            [("-FF".to_string(), CloseReason::ObserverError)]
        );
    }

    #[tokio::test]
    async fn test_open_failure() {
        let fixture = Fixture::new().await;
        let observer =
            MockChangeFeedObserver::<Value>::new().with_open_result(Err("no config".into()));
        let log = observer.log();

        let err = fixture
            .supervisor(Box::new(observer))
            .run(CancellationToken::new())
            .with_timeout_panic(WAIT)
            .await
            .unwrap_err();
        assert_matches!(err, PartitionError::Observer(e) if e.stage() == ObserverStage::Open);
        assert_eq!(
            log.closed(),
            [("-FF".to_string(), CloseReason::ObserverError)]
        );
        assert_eq!(fixture.client.feed_read_count(), 0);
    }

    #[tokio::test]
    async fn test_lost_lease_stops_pump() {
        let fixture = Fixture::new().await;
        let observer = MockChangeFeedObserver::<Value>::new();
        let log = observer.log();

        let thief = LeaseStoreManager::new(
            "p.",
            "rid",
            "w2",
            Arc::clone(&fixture.client) as _,
            Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
            Arc::new(SystemProvider::new()),
        );
        thief.acquire(&fixture.lease.get()).await.unwrap().unwrap();

        let err = fixture
            .supervisor(Box::new(observer))
            .run(CancellationToken::new())
            .with_timeout_panic(WAIT)
            .await
            .unwrap_err();
        assert_matches!(err, PartitionError::Lease(LeaseError::LeaseLost { .. }));
        assert_eq!(log.closed(), [("-FF".to_string(), CloseReason::LeaseLost)]);
    }

    #[tokio::test]
    async fn test_split_closes_with_lease_gone() {
        let fixture = Fixture::new().await;
        fixture.client.split_partition("0").unwrap();
        let observer = MockChangeFeedObserver::<Value>::new();
        let log = observer.log();

        let err = fixture
            .supervisor(Box::new(observer))
            .run(CancellationToken::new())
            .with_timeout_panic(WAIT)
            .await
            .unwrap_err();
        assert_matches!(err, PartitionError::FeedRangeGone { .. });
        assert_eq!(log.closed(), [("-FF".to_string(), CloseReason::LeaseGone)]);
    }
}
