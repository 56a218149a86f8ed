//! The balancing loop: periodically decides which leases to take and hands them to the
//! partition controller.

use std::{sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::{
    balancing::PartitionLoadBalancingStrategy,
    lease::{LeaseError, LeaseStoreManager},
    partition::PartitionController,
};

#[derive(Debug)]
pub struct PartitionLoadBalancer<T>
where
    T: Send + 'static,
{
    controller: Arc<PartitionController<T>>,
    store: Arc<LeaseStoreManager>,
    strategy: Arc<dyn PartitionLoadBalancingStrategy>,
    interval: Duration,
}

impl<T> PartitionLoadBalancer<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        controller: Arc<PartitionController<T>>,
        store: Arc<LeaseStoreManager>,
        strategy: Arc<dyn PartitionLoadBalancingStrategy>,
        interval: Duration,
    ) -> Self {
        Self {
            controller,
            store,
            strategy,
            interval,
        }
    }

    /// Run a cycle right away and then every `interval` until `shutdown` fires.
    ///
    /// A failed cycle is logged and retried on the next tick.
    pub async fn run(&self, shutdown: CancellationToken) {
        info!(strategy = %self.strategy, interval = ?self.interval, "Starting load balancer");
        loop {
            if let Err(e) = self.run_cycle(&shutdown).await {
                warn!(%e, "Load balancing cycle failed");
            }

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(self.interval) => {}
            }
        }
        info!("Load balancer stopped");
    }

    async fn run_cycle(&self, shutdown: &CancellationToken) -> Result<(), LeaseError> {
        let all_leases = self.store.read_all_leases().await?;
        let to_take = self.strategy.select_leases_to_take(&all_leases);
        debug!(
            leases = all_leases.len(),
            to_take = to_take.len(),
            "Load balancing cycle"
        );

        for lease in to_take {
            if shutdown.is_cancelled() {
                break;
            }
            let lease_token = lease.lease_token.clone();
            if let Err(e) = self.controller.add_or_update_lease(lease).await {
                warn!(%lease_token, %e, "Failed to take lease");
            }
        }
        Ok(())
    }
}
