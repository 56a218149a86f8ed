//! User code that consumes changes, and the decorators the processor wraps it in.
//!
//! An observer is created per lease by a [`ChangeFeedObserverFactory`]. The processor wraps
//! every observer with [`ObserverExceptionWrapping`], so failures of user code always surface
//! as one [`ObserverException`], and (unless manual checkpointing was selected) with an
//! [`AutoCheckpointer`] that persists lease progress at the configured [`CheckpointFrequency`].
//!
//! Batches of one lease are delivered strictly one after the other, in LSN order.

use std::{
    fmt::{Debug, Display},
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
};

use async_trait::async_trait;

use crate::{
    error::DynError, lease::LeaseError, range::FeedRange, state::ChangeFeedStateV1,
};

pub mod auto_checkpoint;
pub mod checkpointer_factory;
pub mod exception_wrapping;
pub mod logging;
pub mod mock;

pub use auto_checkpoint::{AutoCheckpointer, CheckpointFrequency};
pub use checkpointer_factory::CheckpointerObserverFactory;
pub use exception_wrapping::{ObserverException, ObserverExceptionWrapping};
pub use logging::LoggingChangeFeedObserverWrapper;

/// Why an observer is being closed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CloseReason {
    Unknown,

    /// The processor is stopping.
    Shutdown,

    /// The monitored container or database went away.
    ResourceGone,

    /// Another host took the lease.
    LeaseLost,

    /// The observer failed.
    ObserverError,

    /// The lease's range was split or its partition no longer exists.
    LeaseGone,
}

impl Display for CloseReason {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Unknown => "unknown",
            Self::Shutdown => "shutdown",
            Self::ResourceGone => "resource_gone",
            Self::LeaseLost => "lease_lost",
            Self::ObserverError => "observer_error",
            Self::LeaseGone => "lease_gone",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("explicit checkpoints require manual checkpointing")]
    AutomaticCheckpointing,

    #[error("checkpoint is only possible while the batch is being processed")]
    NoActiveBatch,

    #[error("cannot persist checkpoint: {0}")]
    Lease(#[from] LeaseError),
}

/// Persists read progress of one lease.
#[async_trait]
pub trait PartitionCheckpointer: Debug + Send + Sync {
    async fn checkpoint(&self, state: &ChangeFeedStateV1) -> Result<(), CheckpointError>;
}

#[derive(Debug)]
struct Batch {
    state: ChangeFeedStateV1,
    active: AtomicBool,
}

/// What an observer knows about the lease it is serving.
///
/// The context handed to
/// [`process_changes`](ChangeFeedObserver::process_changes) is bound to that batch: its
/// [`checkpoint`](Self::checkpoint) persists the position right after the batch and stops
/// working once the call returns.
#[derive(Debug, Clone)]
pub struct ChangeFeedObserverContext {
    lease_token: String,
    feed_range: FeedRange,
    checkpointer: Arc<dyn PartitionCheckpointer>,
    manual_checkpoint: bool,
    batch: Option<Arc<Batch>>,
}

impl ChangeFeedObserverContext {
    pub fn new(
        lease_token: impl Into<String>,
        feed_range: FeedRange,
        checkpointer: Arc<dyn PartitionCheckpointer>,
        manual_checkpoint: bool,
    ) -> Self {
        Self {
            lease_token: lease_token.into(),
            feed_range,
            checkpointer,
            manual_checkpoint,
            batch: None,
        }
    }

    pub fn lease_token(&self) -> &str {
        &self.lease_token
    }

    pub fn feed_range(&self) -> &FeedRange {
        &self.feed_range
    }

    /// Position right after the current batch, if there is one.
    pub fn batch_state(&self) -> Option<&ChangeFeedStateV1> {
        self.batch.as_ref().map(|b| &b.state)
    }

    /// A context for delivering the batch that ends at `state`.
    pub fn with_batch(&self, state: ChangeFeedStateV1) -> Self {
        Self {
            batch: Some(Arc::new(Batch {
                state,
                active: AtomicBool::new(true),
            })),
            ..self.clone()
        }
    }

    /// Mark the batch as delivered; checkpoints through this context fail from now on.
    pub fn finish_batch(&self) {
        if let Some(batch) = &self.batch {
            batch.active.store(false, Ordering::SeqCst);
        }
    }

    /// Persist the position after the current batch.
    ///
    /// Only valid with manual checkpointing and only while the batch is being processed.
    pub async fn checkpoint(&self) -> Result<(), CheckpointError> {
        if !self.manual_checkpoint {
            return Err(CheckpointError::AutomaticCheckpointing);
        }
        self.checkpoint_batch().await
    }

    pub(crate) async fn checkpoint_batch(&self) -> Result<(), CheckpointError> {
        let batch = self
            .batch
            .as_ref()
            .filter(|b| b.active.load(Ordering::SeqCst))
            .ok_or(CheckpointError::NoActiveBatch)?;
        self.checkpointer.checkpoint(&batch.state).await
    }
}

/// Consumer of one lease's changes.
#[async_trait]
pub trait ChangeFeedObserver<T>: Debug + Display + Send
where
    T: Send + 'static,
{
    /// Called once before the first batch.
    async fn open(&mut self, _ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        Ok(())
    }

    /// Called once when the lease stops being processed.
    async fn close(
        &mut self,
        _ctx: &ChangeFeedObserverContext,
        _reason: CloseReason,
    ) -> Result<(), DynError> {
        Ok(())
    }

    /// Handle one non-empty batch.
    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError>;
}

#[async_trait]
impl<T, O> ChangeFeedObserver<T> for Box<O>
where
    T: Send + 'static,
    O: ChangeFeedObserver<T> + ?Sized,
{
    async fn open(&mut self, ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        self.as_mut().open(ctx).await
    }

    async fn close(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> Result<(), DynError> {
        self.as_mut().close(ctx, reason).await
    }

    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError> {
        self.as_mut().process_changes(ctx, changes).await
    }
}

/// Creates one observer per lease.
pub trait ChangeFeedObserverFactory<T>: Debug + Display + Send + Sync
where
    T: Send + 'static,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver<T>>;
}

impl<T, F> ChangeFeedObserverFactory<T> for Arc<F>
where
    T: Send + 'static,
    F: ChangeFeedObserverFactory<T> + ?Sized,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver<T>> {
        self.as_ref().create_observer()
    }
}
