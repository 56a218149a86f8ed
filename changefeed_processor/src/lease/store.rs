use std::{fmt::Display, sync::Arc, time::Duration};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, warn};

use crate::{
    client::{ChangeFeedContextClient, WriteOutcome},
    range::FeedRange,
    request_options::RequestOptionsFactory,
    time::{Time, TimeProvider},
};

use super::{CasOutcome, Lease, LeaseError};

/// How often an owner-preserving update is retried after losing a race with another writer.
const RETRY_COUNT_ON_CONFLICT: usize = 5;

#[derive(Debug, Serialize, Deserialize)]
struct LockDocument {
    id: String,
    owner: String,
    timestamp: DateTime<Utc>,
}

/// Lease CRUD and ownership transitions on top of the lease container.
///
/// Every write is conditional on the etag the lease was read with. A conflict while acquiring
/// means another host won and is reported as such; renewals, releases and checkpoints re-read
/// the lease and retry as long as this host still owns it.
#[derive(Debug)]
pub struct LeaseStoreManager {
    store_prefix: String,
    host_name: String,
    client: Arc<dyn ChangeFeedContextClient>,
    options_factory: Arc<dyn RequestOptionsFactory>,
    time_provider: Arc<dyn TimeProvider>,
}

impl LeaseStoreManager {
    pub fn new(
        lease_prefix: &str,
        container_rid: &str,
        host_name: impl Into<String>,
        client: Arc<dyn ChangeFeedContextClient>,
        options_factory: Arc<dyn RequestOptionsFactory>,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            store_prefix: format!("{lease_prefix}{container_rid}"),
            host_name: host_name.into(),
            client,
            options_factory,
            time_provider,
        }
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    fn now(&self) -> Time {
        self.time_provider.now()
    }

    fn lease_id_prefix(&self) -> String {
        format!("{}..", self.store_prefix)
    }

    /// Id of the lease document for `feed_range`: `{prefix}{containerRid}..{leaseToken}`.
    pub fn lease_id(&self, feed_range: &FeedRange) -> String {
        format!("{}{}", self.lease_id_prefix(), feed_range.lease_token())
    }

    fn info_id(&self) -> String {
        format!("{}.info", self.store_prefix)
    }

    fn lock_id(&self) -> String {
        format!("{}.lock", self.store_prefix)
    }

    /// Every lease of this processor, in id order.
    pub async fn read_all_leases(&self) -> Result<Vec<Lease>, LeaseError> {
        let options = self.options_factory.create_query_request_options();
        let items = self
            .client
            .query_items(&self.lease_id_prefix(), &options)
            .await?;
        Ok(items
            .into_iter()
            .map(Lease::from_item)
            .collect::<Result<Vec<_>, _>>()?)
    }

    /// `None` if the lease no longer exists.
    pub async fn read_lease(&self, id: &str) -> Result<Option<Lease>, LeaseError> {
        let options = self.options_factory.create_item_request_options(id);
        match self.client.read_item(id, &options).await? {
            Some(item) => Ok(Some(Lease::from_item(item)?)),
            None => Ok(None),
        }
    }

    /// Write `lease` if the stored document still has `expected_etag`.
    pub async fn try_acquire_or_renew(
        &self,
        lease: &Lease,
        expected_etag: &str,
    ) -> Result<CasOutcome, LeaseError> {
        let options = self
            .options_factory
            .create_item_request_options(&lease.id)
            .with_if_match(expected_etag);
        let body = lease.to_body()?;
        match self.client.replace_item(&lease.id, body, &options).await {
            Ok(WriteOutcome::Applied(item)) => Ok(CasOutcome::Applied(Lease::from_item(item)?)),
            Ok(WriteOutcome::Conflict) => Ok(CasOutcome::Conflict),
            Err(e) if e.is_not_found() => Err(LeaseError::LeaseLost {
                lease_token: lease.lease_token.clone(),
                owner: None,
            }),
            Err(e) => Err(e.into()),
        }
    }

    /// Create an unowned lease for `feed_range`. Returns `None` if it already exists.
    pub async fn create_lease_if_not_exist(
        &self,
        feed_range: &FeedRange,
        continuation_token: Option<String>,
    ) -> Result<Option<Lease>, LeaseError> {
        let lease = Lease::new(
            self.lease_id(feed_range),
            feed_range.clone(),
            continuation_token,
            self.now(),
        );
        let options = self.options_factory.create_item_request_options(&lease.id);
        match self
            .client
            .create_item(&lease.id, lease.to_body()?, &options)
            .await?
        {
            WriteOutcome::Applied(item) => {
                info!(lease_token = %lease.lease_token, "Created lease");
                Ok(Some(Lease::from_item(item)?))
            }
            WriteOutcome::Conflict => {
                debug!(lease_token = %lease.lease_token, "Lease already exists");
                Ok(None)
            }
        }
    }

    /// Delete `lease`; a lease that is already gone is not an error.
    pub async fn delete(&self, lease: &Lease) -> Result<(), LeaseError> {
        let options = self.options_factory.create_item_request_options(&lease.id);
        match self.client.delete_item(&lease.id, &options).await {
            Ok(()) => {
                info!(lease_token = %lease.lease_token, "Deleted lease");
                Ok(())
            }
            Err(e) if e.is_not_found() => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    /// Take ownership of `lease` as read. `None` if another host changed it first.
    pub async fn acquire(&self, lease: &Lease) -> Result<Option<Lease>, LeaseError> {
        let mut updated = lease.clone();
        updated.owner = Some(self.host_name.clone());
        updated.timestamp = self.now().date_time();

        match self.try_acquire_or_renew(&updated, &lease.etag).await? {
            CasOutcome::Applied(acquired) => {
                info!(
                    lease_token = %lease.lease_token,
                    previous_owner = lease.owner().unwrap_or_default(),
                    "Acquired lease",
                );
                Ok(Some(acquired))
            }
            CasOutcome::Conflict => {
                debug!(lease_token = %lease.lease_token, "Lost race to acquire lease");
                Ok(None)
            }
        }
    }

    /// Refresh the lease timestamp to keep ownership.
    pub async fn renew(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let now = self.now().date_time();
        self.update_owned(lease, |l| l.timestamp = now).await
    }

    /// Give up ownership.
    pub async fn release(&self, lease: &Lease) -> Result<(), LeaseError> {
        let now = self.now().date_time();
        self.update_owned(lease, |l| {
            l.owner = None;
            l.timestamp = now;
        })
        .await?;
        info!(lease_token = %lease.lease_token, "Released lease");
        Ok(())
    }

    /// Persist `continuation_token` as the lease's read progress.
    pub async fn checkpoint(
        &self,
        lease: &Lease,
        continuation_token: String,
    ) -> Result<Lease, LeaseError> {
        let now = self.now().date_time();
        let lease = self
            .update_owned(lease, |l| {
                l.continuation_token = Some(continuation_token.clone());
                l.timestamp = now;
            })
            .await?;
        debug!(lease_token = %lease.lease_token, "Checkpointed lease");
        Ok(lease)
    }

    /// Persist the lease's user properties.
    pub async fn update_properties(&self, lease: &Lease) -> Result<Lease, LeaseError> {
        let properties = lease.properties.clone();
        self.update_owned(lease, |l| l.properties = properties.clone())
            .await
    }

    /// Apply `update` to the latest stored version of `lease` for as long as this host owns it.
    async fn update_owned<F>(&self, lease: &Lease, update: F) -> Result<Lease, LeaseError>
    where
        F: Fn(&mut Lease) + Send + Sync,
    {
        let mut current = lease.clone();
        for _ in 0..RETRY_COUNT_ON_CONFLICT {
            if !current.is_owned_by(&self.host_name) {
                return Err(LeaseError::LeaseLost {
                    lease_token: current.lease_token,
                    owner: current.owner,
                });
            }

            let mut updated = current.clone();
            update(&mut updated);
            match self.try_acquire_or_renew(&updated, &current.etag).await? {
                CasOutcome::Applied(lease) => return Ok(lease),
                CasOutcome::Conflict => {
                    debug!(lease_token = %lease.lease_token, "Lease changed concurrently, re-reading");
                    current = self.read_lease(&lease.id).await?.ok_or_else(|| {
                        LeaseError::LeaseLost {
                            lease_token: lease.lease_token.clone(),
                            owner: None,
                        }
                    })?;
                }
            }
        }

        warn!(lease_token = %lease.lease_token, "Giving up on contended lease update");
        Err(LeaseError::Contended {
            lease_token: lease.lease_token.clone(),
        })
    }

    /// Whether the lease store was populated by some host.
    pub async fn is_initialized(&self) -> Result<bool, LeaseError> {
        let id = self.info_id();
        let options = self.options_factory.create_item_request_options(&id);
        Ok(self.client.read_item(&id, &options).await?.is_some())
    }

    pub async fn mark_initialized(&self) -> Result<(), LeaseError> {
        let id = self.info_id();
        let options = self.options_factory.create_item_request_options(&id);
        let body = serde_json::json!({ "id": id });
        self.client.create_item(&id, body, &options).await?;
        Ok(())
    }

    /// Try to become the host that populates the lease store.
    ///
    /// A lock left behind by a host that died expires `ttl` after it was taken.
    pub async fn acquire_initialization_lock(&self, ttl: Duration) -> Result<bool, LeaseError> {
        let id = self.lock_id();
        let options = self.options_factory.create_item_request_options(&id);
        let now = self.now();
        let body = serde_json::to_value(LockDocument {
            id: id.clone(),
            owner: self.host_name.clone(),
            timestamp: now.date_time(),
        })?;

        if let WriteOutcome::Applied(_) = self.client.create_item(&id, body.clone(), &options).await? {
            return Ok(true);
        }

        let Some(existing) = self.client.read_item(&id, &options).await? else {
            return Ok(false);
        };
        let lock: LockDocument = serde_json::from_value(existing.body)?;
        if now < Time::from_datetime(lock.timestamp) + ttl {
            return Ok(false);
        }

        warn!(owner = %lock.owner, "Taking over expired initialization lock");
        let options = options.with_if_match(existing.etag);
        match self.client.replace_item(&id, body, &options).await {
            Ok(WriteOutcome::Applied(_)) => Ok(true),
            Ok(WriteOutcome::Conflict) => Ok(false),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(e.into()),
        }
    }

    /// Drop the initialization lock if this host holds it.
    pub async fn release_initialization_lock(&self) -> Result<bool, LeaseError> {
        let id = self.lock_id();
        let options = self.options_factory.create_item_request_options(&id);
        let Some(existing) = self.client.read_item(&id, &options).await? else {
            return Ok(false);
        };
        let lock: LockDocument = serde_json::from_value(existing.body)?;
        if !lock.owner.eq_ignore_ascii_case(&self.host_name) {
            return Ok(false);
        }
        match self.client.delete_item(&id, &options).await {
            Ok(()) => Ok(true),
            Err(e) if e.is_not_found() => Ok(false),
            Err(e) => Err(LeaseError::Store(e)),
        }
    }
}

impl Display for LeaseStoreManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "lease_store({}, {})", self.store_prefix, self.client)
    }
}
