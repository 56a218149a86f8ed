use std::sync::Arc;

use async_trait::async_trait;

use crate::{
    lease::{LeaseError, LeaseStoreManager},
    observer::{CheckpointError, PartitionCheckpointer},
    state::ChangeFeedStateV1,
};

use super::SharedLease;

/// Writes checkpoints into the lease document.
#[derive(Debug)]
pub struct LeaseCheckpointer {
    store: Arc<LeaseStoreManager>,
    lease: SharedLease,
}

impl LeaseCheckpointer {
    pub fn new(store: Arc<LeaseStoreManager>, lease: SharedLease) -> Self {
        Self { store, lease }
    }
}

#[async_trait]
impl PartitionCheckpointer for LeaseCheckpointer {
    async fn checkpoint(&self, state: &ChangeFeedStateV1) -> Result<(), CheckpointError> {
        let lease = self.lease.get();
        let encoded = state.encode().map_err(|source| LeaseError::State {
            lease_token: lease.lease_token.clone(),
            source,
        })?;
        let updated = self.store.checkpoint(&lease, encoded).await?;
        self.lease.set(updated);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use crate::{
        client::mem::InMemoryContextClient,
        range::FeedRange,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        state::{ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedState},
        time::SystemProvider,
    };

    use super::*;

    fn store(client: &Arc<InMemoryContextClient>, host: &str) -> Arc<LeaseStoreManager> {
        Arc::new(LeaseStoreManager::new(
            "p.",
            "rid",
            host,
            Arc::clone(client) as _,
            Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
            Arc::new(SystemProvider::new()),
        ))
    }

    #[tokio::test]
    async fn test_checkpoint_updates_shared_lease() {
        let client = Arc::new(InMemoryContextClient::new("rid", 1));
        let w1 = store(&client, "w1");
        let lease = w1
            .create_lease_if_not_exist(&FeedRange::full(), None)
            .await
            .unwrap()
            .unwrap();
        let lease = w1.acquire(&lease).await.unwrap().unwrap();
        let shared = SharedLease::new(lease.clone());
        let checkpointer = LeaseCheckpointer::new(Arc::clone(&w1), shared.clone());

        let state = ChangeFeedStateV1::new(
            "rid",
            FeedRange::full(),
            ChangeFeedMode::Incremental,
            ChangeFeedStartFrom::Beginning,
            None,
        );
        checkpointer.checkpoint(&state).await.unwrap();

        let stored = shared.get();
        assert_ne!(stored.etag, lease.etag);
        let continuation = stored.continuation_token.unwrap();
        assert_eq!(
            ChangeFeedState::parse_for_container(&continuation, "rid")
                .unwrap()
                .into_v1(),
            state
        );

        // another host takes over
        let w2 = store(&client, "w2");
        let current = w2.read_lease(&lease.id).await.unwrap().unwrap();
        w2.acquire(&current).await.unwrap().unwrap();

        assert_matches!(
            checkpointer.checkpoint(&state).await,
            Err(CheckpointError::Lease(LeaseError::LeaseLost { .. }))
        );
    }
}
