//! The public entry point: a host's membership in the fleet processing one change feed.

use std::sync::{
    Arc,
    atomic::{AtomicBool, Ordering},
};

use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{sync::Mutex, task::JoinHandle};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use crate::{
    balancing::EqualPartitionsBalancingStrategy,
    client::ChangeFeedContextClient,
    error::StoreError,
    item::document_lsn,
    lease::{Lease, LeaseError, LeaseStoreManager},
    load_balancer::PartitionLoadBalancer,
    observer::{ChangeFeedObserverFactory, CheckpointerObserverFactory},
    options::{ChangeFeedProcessorOptions, ConfigError},
    partition::{Bootstrapper, PartitionController, PartitionSynchronizer},
    request::ChangeFeedRequest,
    request_options::PartitionedByIdCollectionRequestOptionsFactory,
    time::{SystemProvider, TimeProvider},
};

#[derive(Debug, thiserror::Error)]
pub enum ProcessorError {
    #[error("invalid processor configuration: {0}")]
    Config(#[from] ConfigError),

    #[error("a {0} is required")]
    MissingComponent(&'static str),

    #[error("the processor is already running")]
    AlreadyStarted,

    #[error("the processor was stopped while starting")]
    Stopped,

    #[error("cannot reach the monitored container: {0}")]
    Store(#[from] StoreError),

    #[error(transparent)]
    Lease(#[from] LeaseError),
}

/// Progress of one lease, as reported by [`ChangeFeedProcessor::current_state`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeFeedProcessorState {
    /// Host currently owning the lease, if any.
    pub host_name: Option<String>,
    pub lease_token: String,
    pub continuation_token: Option<String>,

    /// Changes not yet processed; `None` when the feed could not be read.
    pub estimated_lag: Option<u64>,
}

/// Assembles a [`ChangeFeedProcessor`].
#[derive(Debug)]
pub struct ChangeFeedProcessorBuilder<T>
where
    T: Send + 'static,
{
    host_name: Option<String>,
    feed_client: Option<Arc<dyn ChangeFeedContextClient>>,
    lease_client: Option<Arc<dyn ChangeFeedContextClient>>,
    observer_factory: Option<Arc<dyn ChangeFeedObserverFactory<T>>>,
    options: ChangeFeedProcessorOptions,
    time_provider: Arc<dyn TimeProvider>,
}

impl<T> Default for ChangeFeedProcessorBuilder<T>
where
    T: Send + 'static,
{
    fn default() -> Self {
        Self {
            host_name: None,
            feed_client: None,
            lease_client: None,
            observer_factory: None,
            options: ChangeFeedProcessorOptions::default(),
            time_provider: Arc::new(SystemProvider::new()),
        }
    }
}

impl<T> ChangeFeedProcessorBuilder<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new() -> Self {
        Self::default()
    }

    /// Name of this host; must be unique within the fleet.
    pub fn host_name(mut self, host_name: impl Into<String>) -> Self {
        self.host_name = Some(host_name.into());
        self
    }

    /// Client of the monitored container.
    pub fn feed_client(mut self, client: Arc<dyn ChangeFeedContextClient>) -> Self {
        self.feed_client = Some(client);
        self
    }

    /// Client of the container holding the leases.
    pub fn lease_client(mut self, client: Arc<dyn ChangeFeedContextClient>) -> Self {
        self.lease_client = Some(client);
        self
    }

    pub fn observer_factory(mut self, factory: Arc<dyn ChangeFeedObserverFactory<T>>) -> Self {
        self.observer_factory = Some(factory);
        self
    }

    pub fn options(mut self, options: ChangeFeedProcessorOptions) -> Self {
        self.options = options;
        self
    }

    pub fn time_provider(mut self, time_provider: Arc<dyn TimeProvider>) -> Self {
        self.time_provider = time_provider;
        self
    }

    pub fn build(self) -> Result<ChangeFeedProcessor<T>, ProcessorError> {
        let host_name = self
            .host_name
            .ok_or(ProcessorError::MissingComponent("host name"))?;
        if host_name.is_empty() {
            return Err(ConfigError::EmptyHostName.into());
        }
        let feed_client = self
            .feed_client
            .ok_or(ProcessorError::MissingComponent("feed client"))?;
        let lease_client = self
            .lease_client
            .ok_or(ProcessorError::MissingComponent("lease client"))?;
        let observer_factory = self
            .observer_factory
            .ok_or(ProcessorError::MissingComponent("observer factory"))?;
        self.options.validate()?;

        Ok(ChangeFeedProcessor {
            host_name,
            feed_client,
            lease_client,
            observer_factory,
            options: self.options,
            time_provider: self.time_provider,
            running: Mutex::new(None),
            starting: parking_lot::Mutex::new(CancellationToken::new()),
            started: AtomicBool::new(false),
        })
    }
}

#[derive(Debug)]
struct Running<T>
where
    T: Send + 'static,
{
    shutdown: CancellationToken,
    balancer: JoinHandle<()>,
    controller: Arc<PartitionController<T>>,
}

/// Distributes the partitions of a change feed over every host running a processor with the
/// same lease container and lease prefix, and feeds their changes to the observers.
#[derive(Debug)]
pub struct ChangeFeedProcessor<T>
where
    T: Send + 'static,
{
    host_name: String,
    feed_client: Arc<dyn ChangeFeedContextClient>,
    lease_client: Arc<dyn ChangeFeedContextClient>,
    observer_factory: Arc<dyn ChangeFeedObserverFactory<T>>,
    options: ChangeFeedProcessorOptions,
    time_provider: Arc<dyn TimeProvider>,
    running: Mutex<Option<Running<T>>>,
    /// Shutdown token of the most recent `start`, cancellable while it still holds `running`.
    starting: parking_lot::Mutex<CancellationToken>,
    started: AtomicBool,
}

impl<T> ChangeFeedProcessor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn builder() -> ChangeFeedProcessorBuilder<T> {
        ChangeFeedProcessorBuilder::new()
    }

    pub fn host_name(&self) -> &str {
        &self.host_name
    }

    fn lease_store(&self, container_rid: &str) -> LeaseStoreManager {
        LeaseStoreManager::new(
            &self.options.lease_prefix,
            container_rid,
            self.host_name.clone(),
            Arc::clone(&self.lease_client),
            Arc::new(PartitionedByIdCollectionRequestOptionsFactory),
            Arc::clone(&self.time_provider),
        )
    }

    /// Join the fleet: make sure every partition has a lease, then start balancing.
    ///
    /// Returns once balancing is running; partitions are picked up in the background.
    pub async fn start(&self) -> Result<(), ProcessorError> {
        let mut running = self.running.lock().await;
        if running.is_some() {
            return Err(ProcessorError::AlreadyStarted);
        }

        let shutdown = CancellationToken::new();
        *self.starting.lock() = shutdown.clone();

        let container_rid = self.feed_client.read_container_rid().await?;
        let store = Arc::new(self.lease_store(&container_rid));
        let synchronizer = Arc::new(PartitionSynchronizer::new(
            Arc::clone(&self.feed_client),
            Arc::clone(&store),
            container_rid.clone(),
        ));
        let initialized = Bootstrapper::new(
            Arc::clone(&synchronizer),
            Arc::clone(&store),
            self.options.lease_expiration_interval,
            self.options.lease_acquire_interval,
        )
        .initialize(&shutdown)
        .await?;
        if !initialized {
            return Err(ProcessorError::Stopped);
        }

        let strategy = EqualPartitionsBalancingStrategy::try_new(
            self.host_name.clone(),
            self.options.min_scale_count,
            self.options.max_scale_count,
            self.options.lease_expiration_interval,
            self.options.max_leases_to_acquire_per_cycle,
            Arc::clone(&self.time_provider),
        )?;
        let factory = CheckpointerObserverFactory::new(
            Arc::clone(&self.observer_factory),
            self.options.checkpoint_frequency,
            Arc::clone(&self.time_provider),
        );
        let controller = Arc::new(PartitionController::new(
            Arc::clone(&store),
            synchronizer,
            Arc::new(factory),
            Arc::clone(&self.feed_client),
            container_rid,
            self.options.clone(),
        ));
        let balancer = PartitionLoadBalancer::new(
            Arc::clone(&controller),
            store,
            Arc::new(strategy),
            self.options.lease_acquire_interval,
        );

        let balancer = tokio::spawn({
            let shutdown = shutdown.clone();
            async move { balancer.run(shutdown).await }
        });

        *running = Some(Running {
            shutdown,
            balancer,
            controller,
        });
        self.started.store(true, Ordering::SeqCst);
        info!(host_name = %self.host_name, "Change feed processor started");
        Ok(())
    }

    /// Leave the fleet: stop balancing, let every partition finish its in-flight work and
    /// release its lease. Does nothing if the processor is not running.
    pub async fn stop(&self) {
        // abandons a start still waiting for the lease store
        self.starting.lock().cancel();
        let mut running = self.running.lock().await;
        let Some(Running {
            shutdown,
            balancer,
            controller,
        }) = running.take()
        else {
            return;
        };

        shutdown.cancel();
        if let Err(e) = balancer.await {
            warn!(%e, "Load balancer task failed");
        }
        controller.shutdown().await;
        self.started.store(false, Ordering::SeqCst);
        info!(host_name = %self.host_name, "Change feed processor stopped");
    }

    pub fn is_started(&self) -> bool {
        self.started.load(Ordering::SeqCst)
    }

    /// Owner, progress and estimated backlog of every lease.
    pub async fn current_state(&self) -> Result<Vec<ChangeFeedProcessorState>, ProcessorError> {
        let container_rid = self.feed_client.read_container_rid().await?;
        let leases = self.lease_store(&container_rid).read_all_leases().await?;

        let mut states = Vec::with_capacity(leases.len());
        for lease in leases {
            let estimated_lag = self.estimate_lag(&container_rid, &lease).await;
            states.push(ChangeFeedProcessorState {
                host_name: lease.owner().map(ToString::to_string),
                lease_token: lease.lease_token,
                continuation_token: lease.continuation_token,
                estimated_lag,
            });
        }
        Ok(states)
    }

    /// Read one change past the lease's position: the distance from its LSN to the latest LSN
    /// is the backlog.
    async fn estimate_lag(&self, container_rid: &str, lease: &Lease) -> Option<u64> {
        let state = lease
            .read_state(container_rid, self.options.mode, &self.options.start_from)
            .inspect_err(|e| warn!(lease_token = %lease.lease_token, %e, "Cannot estimate lag"))
            .ok()?;
        let mut request = ChangeFeedRequest::new();
        state.populate_request(&mut request, 1);

        let response = self
            .feed_client
            .query_change_feed(&request)
            .await
            .inspect_err(|e| warn!(lease_token = %lease.lease_token, %e, "Cannot estimate lag"))
            .ok()?;
        let Some(first) = response.documents.first() else {
            return Some(0);
        };
        let first_lsn = serde_json::from_str::<Value>(first)
            .ok()
            .as_ref()
            .and_then(document_lsn)?;
        let latest_lsn = response.latest_lsn?;
        Some(latest_lsn.saturating_sub(first_lsn) + 1)
    }
}
