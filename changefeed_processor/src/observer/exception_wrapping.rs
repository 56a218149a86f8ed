use std::{fmt::Display, future::Future, panic::AssertUnwindSafe};

use async_trait::async_trait;
use futures::FutureExt;

use crate::error::DynError;

use super::{ChangeFeedObserver, ChangeFeedObserverContext, CloseReason};

/// Which observer callback failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ObserverStage {
    Open,
    ProcessChanges,
    Close,
}

impl Display for ObserverStage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Open => write!(f, "open"),
            Self::ProcessChanges => write!(f, "process_changes"),
            Self::Close => write!(f, "close"),
        }
    }
}

/// A failure of user observer code, with the original error as its source.
#[derive(Debug, thiserror::Error)]
#[error("observer failed in {stage}: {source}")]
pub struct ObserverException {
    stage: ObserverStage,
    source: DynError,
}

impl ObserverException {
    pub fn new(stage: ObserverStage, source: DynError) -> Self {
        Self { stage, source }
    }

    pub fn stage(&self) -> ObserverStage {
        self.stage
    }

    pub fn into_inner(self) -> DynError {
        self.source
    }
}

#[derive(Debug, thiserror::Error)]
#[error("observer panicked: {0}")]
struct ObserverPanic(String);

/// Turns every error returned and every panic raised by the wrapped observer into an
/// [`ObserverException`].
#[derive(Debug)]
pub struct ObserverExceptionWrapping<O> {
    inner: O,
}

impl<O> ObserverExceptionWrapping<O> {
    pub fn new(inner: O) -> Self {
        Self { inner }
    }
}

impl<O> Display for ObserverExceptionWrapping<O>
where
    O: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "exception_wrapping({})", self.inner)
    }
}

async fn guard<F>(stage: ObserverStage, fut: F) -> Result<(), DynError>
where
    F: Future<Output = Result<(), DynError>> + Send,
{
    let res = match AssertUnwindSafe(fut).catch_unwind().await {
        Ok(res) => res,
        Err(payload) => {
            let msg = payload
                .downcast_ref::<&str>()
                .map(|s| s.to_string())
                .or_else(|| payload.downcast_ref::<String>().cloned())
                .unwrap_or_else(|| "unknown panic".to_string());
            Err(Box::new(ObserverPanic(msg)) as DynError)
        }
    };

    res.map_err(|e| {
        if e.is::<ObserverException>() {
            e
        } else {
            Box::new(ObserverException::new(stage, e)) as DynError
        }
    })
}

#[async_trait]
impl<T, O> ChangeFeedObserver<T> for ObserverExceptionWrapping<O>
where
    T: Send + 'static,
    O: ChangeFeedObserver<T>,
{
    async fn open(&mut self, ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        guard(ObserverStage::Open, self.inner.open(ctx)).await
    }

    async fn close(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> Result<(), DynError> {
        guard(ObserverStage::Close, self.inner.close(ctx, reason)).await
    }

    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError> {
        guard(
            ObserverStage::ProcessChanges,
            self.inner.process_changes(ctx, changes),
        )
        .await
    }
}
