use std::fmt::Display;

use async_trait::async_trait;
use tracing::{debug, info, warn};

use crate::error::DynError;

use super::{ChangeFeedObserver, ChangeFeedObserverContext, CloseReason};

#[derive(Debug)]
pub struct LoggingChangeFeedObserverWrapper<O> {
    inner: O,
}

impl<O> LoggingChangeFeedObserverWrapper<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O> Display for LoggingChangeFeedObserverWrapper<O>
where
    O: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "logging({})", self.inner)
    }
}

#[async_trait]
impl<T, O> ChangeFeedObserver<T> for LoggingChangeFeedObserverWrapper<O>
where
    T: Send + 'static,
    O: ChangeFeedObserver<T>,
{
    async fn open(&mut self, ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        let res = self.inner.open(ctx).await;
        match &res {
            Ok(()) => info!(lease_token = ctx.lease_token(), "Observer opened"),
            Err(e) => warn!(lease_token = ctx.lease_token(), %e, "Observer failed to open"),
        }
        res
    }

    async fn close(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> Result<(), DynError> {
        let res = self.inner.close(ctx, reason).await;
        match &res {
            Ok(()) => info!(lease_token = ctx.lease_token(), %reason, "Observer closed"),
            Err(e) => warn!(
                lease_token = ctx.lease_token(),
                %reason,
                %e,
                "Observer failed to close"
            ),
        }
        res
    }

    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError> {
        let n = changes.len();
        let res = self.inner.process_changes(ctx, changes).await;
        match &res {
            Ok(()) => debug!(lease_token = ctx.lease_token(), n, "Processed batch"),
            Err(e) => warn!(
                lease_token = ctx.lease_token(),
                n,
                %e,
                "Observer failed to process batch"
            ),
        }
        res
    }
}
