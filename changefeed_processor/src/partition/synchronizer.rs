use std::sync::Arc;

use tracing::{debug, info};

use crate::{
    client::ChangeFeedContextClient,
    error::StoreError,
    lease::{Lease, LeaseError, LeaseStoreManager},
    range::{FeedRange, Range},
    state::{ChangeFeedState, StateError},
};

/// Keeps the lease set in line with the physical partitions of the monitored container.
#[derive(Debug)]
pub struct PartitionSynchronizer {
    client: Arc<dyn ChangeFeedContextClient>,
    store: Arc<LeaseStoreManager>,
    container_rid: String,
}

impl PartitionSynchronizer {
    pub fn new(
        client: Arc<dyn ChangeFeedContextClient>,
        store: Arc<LeaseStoreManager>,
        container_rid: impl Into<String>,
    ) -> Self {
        Self {
            client,
            store,
            container_rid: container_rid.into(),
        }
    }

    /// Create a lease for every physical partition no existing lease overlaps. Returns how
    /// many were created.
    pub async fn create_missing_leases(&self) -> Result<usize, LeaseError> {
        let partitions = self.client.read_partition_key_ranges().await?;
        let leases = self.store.read_all_leases().await?;

        let mut created = 0;
        for partition in partitions {
            let range = partition.to_range();
            if leases.iter().any(|l| l.feed_range.range().overlaps(&range)) {
                continue;
            }
            if self
                .store
                .create_lease_if_not_exist(&FeedRange::new(range), None)
                .await?
                .is_some()
            {
                created += 1;
            }
        }
        info!(created, "Created missing leases");
        Ok(created)
    }

    /// Work out what replaces `lease` once its range no longer maps to one partition.
    ///
    /// After a split the parent is replaced by one lease per child partition, each starting
    /// where the parent left off, and the parent is deleted. After a merge the lease is kept
    /// and reading resumes against the merged partition.
    pub async fn handle_feed_range_gone(&self, lease: &Lease) -> Result<Vec<Lease>, LeaseError> {
        let parent = lease.feed_range.range();
        let overlapping = self.client.get_overlapping_ranges(parent, true).await?;

        match overlapping.len() {
            0 => Err(StoreError::not_found(format!(
                "no partition overlaps the range of lease {}",
                lease.lease_token
            ))
            .into()),
            1 => {
                info!(lease_token = %lease.lease_token, "Partitions merged, keeping lease");
                Ok(vec![lease.clone()])
            }
            n => {
                info!(lease_token = %lease.lease_token, children = n, "Partition split");
                let mut children = Vec::with_capacity(n);
                for partition in overlapping {
                    let Some(range) = partition.to_range().intersect(parent) else {
                        continue;
                    };
                    children.push(self.create_child(lease, range).await?);
                }
                self.store.delete(lease).await?;
                Ok(children)
            }
        }
    }

    async fn create_child(&self, parent: &Lease, range: Range) -> Result<Lease, LeaseError> {
        let continuation = self.child_continuation(parent, &range)?;
        let feed_range = FeedRange::new(range);
        if let Some(child) = self
            .store
            .create_lease_if_not_exist(&feed_range, continuation)
            .await?
        {
            return Ok(child);
        }

        // another host handled the same split first
        let id = self.store.lease_id(&feed_range);
        debug!(lease_token = %feed_range.lease_token(), "Child lease already exists");
        self.store
            .read_lease(&id)
            .await?
            .ok_or_else(|| LeaseError::LeaseLost {
                lease_token: feed_range.lease_token(),
                owner: None,
            })
    }

    fn child_continuation(
        &self,
        parent: &Lease,
        range: &Range,
    ) -> Result<Option<String>, LeaseError> {
        let Some(continuation) = parent.continuation_token.as_deref() else {
            return Ok(None);
        };
        let state = match ChangeFeedState::parse_for_container(continuation, &self.container_rid) {
            Ok(state) => state,
            // an etag written by an older processor applies to every child
            Err(StateError::Encoding(_) | StateError::Json(_)) => {
                return Ok(Some(continuation.to_string()));
            }
            Err(source) => {
                return Err(LeaseError::State {
                    lease_token: parent.lease_token.clone(),
                    source,
                });
            }
        };
        let child = state
            .into_v1()
            .rescope(range)
            .encode()
            .map_err(|source| LeaseError::State {
                lease_token: parent.lease_token.clone(),
                source,
            })?;
        Ok(Some(child))
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use pretty_assertions::assert_eq;

    use crate::{
        client::mem::InMemoryContextClient,
        request::ChangeFeedRequest,
        request_options::PartitionedByIdCollectionRequestOptionsFactory,
        state::{
            ChangeFeedMode, ChangeFeedStartFrom, ChangeFeedStateV1, FeedRangeContinuation,
        },
        time::SystemProvider,
    };

    use super::*;

    struct Fixture {
        client: Arc<InMemoryContextClient>,
        store: Arc<LeaseStoreManager>,
        synchronizer: PartitionSynchronizer,
    }

    impl Fixture {
        fn new(partitions: usize) -> Self {
            let client = Arc::new(InMemoryContextClient::new("rid", partitions));
            let store = Arc::new(LeaseStoreManager::new(
                "p.",
                "rid",
                "w1",
                Arc::clone(&client) as _,
                Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
                Arc::new(SystemProvider::new()),
            ));
            let synchronizer =
                PartitionSynchronizer::new(Arc::clone(&client) as _, Arc::clone(&store), "rid");
            Self {
                client,
                store,
                synchronizer,
            }
        }

        async fn tokens(&self) -> Vec<String> {
            self.store
                .read_all_leases()
                .await
                .unwrap()
                .into_iter()
                .map(|l| l.lease_token)
                .collect()
        }
    }

    #[tokio::test]
    async fn test_create_missing_leases() {
        let fixture = Fixture::new(3);
        assert_eq!(fixture.synchronizer.create_missing_leases().await.unwrap(), 3);
        assert_eq!(fixture.synchronizer.create_missing_leases().await.unwrap(), 0);

        let mut expected = fixture
            .client
            .partitions()
            .iter()
            .map(|p| FeedRange::new(p.to_range()).lease_token())
            .collect::<Vec<_>>();
        expected.sort();
        let mut tokens = fixture.tokens().await;
        tokens.sort();
        assert_eq!(tokens, expected);
    }

    #[tokio::test]
    async fn test_create_missing_leases_skips_covered_partitions() {
        let fixture = Fixture::new(2);
        let first = fixture.client.partitions()[0].to_range();
        fixture
            .store
            .create_lease_if_not_exist(&FeedRange::new(first), None)
            .await
            .unwrap()
            .unwrap();

        assert_eq!(fixture.synchronizer.create_missing_leases().await.unwrap(), 1);
        assert_eq!(fixture.tokens().await.len(), 2);
    }

    #[tokio::test]
    async fn test_split_creates_children() {
        let fixture = Fixture::new(1);
        let lease = fixture
            .store
            .create_lease_if_not_exist(&FeedRange::full(), None)
            .await
            .unwrap()
            .unwrap();
        let lease = fixture.store.acquire(&lease).await.unwrap().unwrap();

        let mut state = ChangeFeedStateV1::new(
            "rid",
            FeedRange::full(),
            ChangeFeedMode::Incremental,
            ChangeFeedStartFrom::Beginning,
            Some(
                FeedRangeContinuation::create("rid", FeedRange::full(), [Range::full()]).unwrap(),
            ),
        );
        state
            .apply_server_response_continuation(Some("\"42\""), &ChangeFeedRequest::new(), false)
            .unwrap();
        let lease = fixture
            .store
            .checkpoint(&lease, state.encode().unwrap())
            .await
            .unwrap();

        let (left, right) = fixture.client.split_partition("0").unwrap();
        let children = fixture
            .synchronizer
            .handle_feed_range_gone(&lease)
            .await
            .unwrap();

        let ranges = children
            .iter()
            .map(|c| c.feed_range.range().clone())
            .collect::<Vec<_>>();
        assert_eq!(ranges, [left.to_range(), right.to_range()]);
        for child in &children {
            assert_eq!(child.owner(), None);
            let child_state = child
                .read_state("rid", ChangeFeedMode::Incremental, &ChangeFeedStartFrom::Now)
                .unwrap();
            assert_eq!(child_state, state.rescope(child.feed_range.range()));
            let token = child_state.continuation().unwrap().current_token();
            assert_eq!(token.token.as_deref(), Some("\"42\""));
        }

        let mut tokens = fixture.tokens().await;
        tokens.sort();
        assert_eq!(tokens, ["-7F80", "7F80-FF"]);
    }

    #[tokio::test]
    async fn test_split_inherits_legacy_continuation() {
        let fixture = Fixture::new(1);
        let lease = fixture
            .store
            .create_lease_if_not_exist(&FeedRange::full(), Some("\"17\"".into()))
            .await
            .unwrap()
            .unwrap();
        fixture.client.split_partition("0").unwrap();

        let children = fixture
            .synchronizer
            .handle_feed_range_gone(&lease)
            .await
            .unwrap();
        assert_eq!(children.len(), 2);
        for child in children {
            assert_eq!(child.continuation_token.as_deref(), Some("\"17\""));
        }
    }

    #[tokio::test]
    async fn test_split_reuses_existing_children() {
        let fixture = Fixture::new(1);
        let lease = fixture
            .store
            .create_lease_if_not_exist(&FeedRange::full(), None)
            .await
            .unwrap()
            .unwrap();
        let (left, _) = fixture.client.split_partition("0").unwrap();
        let existing = fixture
            .store
            .create_lease_if_not_exist(&FeedRange::new(left.to_range()), Some("\"5\"".into()))
            .await
            .unwrap()
            .unwrap();

        let children = fixture
            .synchronizer
            .handle_feed_range_gone(&lease)
            .await
            .unwrap();
        assert_eq!(children[0], existing);
        assert_eq!(fixture.tokens().await.len(), 2);
    }

    #[tokio::test]
    async fn test_merge_keeps_lease() {
        let fixture = Fixture::new(2);
        fixture.synchronizer.create_missing_leases().await.unwrap();
        let leases = fixture.store.read_all_leases().await.unwrap();
        fixture.client.merge_partitions("0", "1").unwrap();

        for lease in &leases {
            let kept = fixture
                .synchronizer
                .handle_feed_range_gone(lease)
                .await
                .unwrap();
            assert_eq!(kept, vec![lease.clone()]);
        }
        assert_eq!(fixture.tokens().await.len(), 2);
    }

    #[tokio::test]
    async fn test_foreign_continuation_is_rejected() {
        let fixture = Fixture::new(1);
        let foreign = ChangeFeedStateV1::new(
            "other",
            FeedRange::full(),
            ChangeFeedMode::Incremental,
            ChangeFeedStartFrom::Beginning,
            None,
        );
        let lease = fixture
            .store
            .create_lease_if_not_exist(&FeedRange::full(), Some(foreign.encode().unwrap()))
            .await
            .unwrap()
            .unwrap();
        fixture.client.split_partition("0").unwrap();

        assert_matches!(
            fixture.synchronizer.handle_feed_range_gone(&lease).await,
            Err(LeaseError::State {
                source: StateError::ContainerMismatch { .. },
                ..
            })
        );
        // the parent survives a failed split
        assert_eq!(fixture.tokens().await, ["-FF"]);
    }
}
