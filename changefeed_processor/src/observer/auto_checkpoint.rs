use std::{fmt::Display, sync::Arc, time::Duration};

use async_trait::async_trait;
use tracing::debug;

use crate::{
    error::DynError,
    time::{Time, TimeProvider},
};

use super::{ChangeFeedObserver, ChangeFeedObserverContext, CloseReason};

/// When lease progress is persisted.
///
/// With `explicit_checkpoint` the observer checkpoints through its context. Otherwise the
/// processor checkpoints after a batch once `processed_document_count` documents were processed
/// or `time_interval` passed since the previous checkpoint, whichever comes first; with neither
/// set it checkpoints after every batch.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CheckpointFrequency {
    pub explicit_checkpoint: bool,
    pub processed_document_count: Option<u64>,
    pub time_interval: Option<Duration>,
}

impl CheckpointFrequency {
    pub fn explicit() -> Self {
        Self {
            explicit_checkpoint: true,
            ..Default::default()
        }
    }

    pub fn every_batch() -> Self {
        Self::default()
    }

    pub fn every_n_documents(n: u64) -> Self {
        Self {
            processed_document_count: Some(n),
            ..Default::default()
        }
    }

    pub fn every(interval: Duration) -> Self {
        Self {
            time_interval: Some(interval),
            ..Default::default()
        }
    }
}

/// Checkpoints after successfully processed batches according to a [`CheckpointFrequency`].
#[derive(Debug)]
pub struct AutoCheckpointer<O> {
    inner: O,
    frequency: CheckpointFrequency,
    time_provider: Arc<dyn TimeProvider>,
    processed_count: u64,
    last_checkpoint: Time,
}

impl<O> AutoCheckpointer<O> {
    pub fn new(
        inner: O,
        frequency: CheckpointFrequency,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        let last_checkpoint = time_provider.now();
        Self {
            inner,
            frequency,
            time_provider,
            processed_count: 0,
            last_checkpoint,
        }
    }

    fn is_checkpoint_needed(&self) -> bool {
        let CheckpointFrequency {
            processed_document_count,
            time_interval,
            ..
        } = self.frequency;

        if processed_document_count.is_none() && time_interval.is_none() {
            return true;
        }

        if processed_document_count.is_some_and(|n| self.processed_count >= n) {
            return true;
        }

        time_interval.is_some_and(|interval| {
            self.time_provider
                .now()
                .checked_duration_since(self.last_checkpoint)
                .is_some_and(|elapsed| elapsed >= interval)
        })
    }
}

impl<O> Display for AutoCheckpointer<O>
where
    O: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "auto_checkpoint({})", self.inner)
    }
}

#[async_trait]
impl<T, O> ChangeFeedObserver<T> for AutoCheckpointer<O>
where
    T: Send + 'static,
    O: ChangeFeedObserver<T>,
{
    async fn open(&mut self, ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        self.inner.open(ctx).await
    }

    async fn close(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> Result<(), DynError> {
        self.inner.close(ctx, reason).await
    }

    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError> {
        let n = changes.len() as u64;
        self.inner.process_changes(ctx, changes).await?;
        self.processed_count += n;

        if self.is_checkpoint_needed() {
            ctx.checkpoint_batch().await?;
            debug!(
                lease_token = ctx.lease_token(),
                processed = self.processed_count,
                "Automatic checkpoint"
            );
            self.processed_count = 0;
            self.last_checkpoint = self.time_provider.now();
        }
        Ok(())
    }
}
