use std::{marker::PhantomData, sync::Arc, time::Duration};

use serde::de::DeserializeOwned;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, warn};

use crate::{
    backoff::{Backoff, BackoffConfig},
    classifier::StatusCodeErrorType,
    client::{ChangeFeedContextClient, FeedResponse},
    error::StoreError,
    observer::{ChangeFeedObserver, ChangeFeedObserverContext, exception_wrapping::ObserverStage},
    request::ChangeFeedRequest,
    state::ChangeFeedStateV1,
};

use super::{PartitionError, sleep_unless_cancelled};

/// Read settings of a [`PartitionProcessor`].
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ProcessorSettings {
    pub max_items_count: u32,
    pub feed_poll_delay: Duration,
    pub backoff: BackoffConfig,
}

/// The pump of one lease: reads pages of its change feed and hands them to the observer.
///
/// Pages are delivered strictly one after the other. The read position only advances once the
/// observer accepted a page, so a failed batch is read again by whoever processes the lease
/// next.
#[derive(Debug)]
pub struct PartitionProcessor<T> {
    client: Arc<dyn ChangeFeedContextClient>,
    ctx: ChangeFeedObserverContext,
    state: ChangeFeedStateV1,
    settings: ProcessorSettings,
    page_size: u32,
    backoff: Backoff,
    _items: PhantomData<fn() -> T>,
}

impl<T> PartitionProcessor<T>
where
    T: DeserializeOwned + Send + 'static,
{
    pub fn new(
        client: Arc<dyn ChangeFeedContextClient>,
        ctx: ChangeFeedObserverContext,
        state: ChangeFeedStateV1,
        settings: ProcessorSettings,
    ) -> Self {
        Self {
            client,
            ctx,
            state,
            page_size: settings.max_items_count.max(1),
            backoff: Backoff::new(&settings.backoff),
            settings,
            _items: PhantomData,
        }
    }

    /// Position after the last page the observer accepted.
    pub fn state(&self) -> &ChangeFeedStateV1 {
        &self.state
    }

    /// Current page size; smaller than configured after oversized or undecodable pages.
    pub fn page_size(&self) -> u32 {
        self.page_size
    }

    /// Pump until `shutdown` fires or the lease cannot be processed any further.
    ///
    /// A page that is being read or delivered when `shutdown` fires is finished first.
    pub async fn run(
        &mut self,
        observer: &mut dyn ChangeFeedObserver<T>,
        shutdown: &CancellationToken,
    ) -> Result<(), PartitionError> {
        while !shutdown.is_cancelled() {
            let mut request = ChangeFeedRequest::new();
            self.state.populate_request(&mut request, self.page_size);

            match self.read_page(&request).await {
                Ok((response, changes)) => {
                    self.backoff.reset();
                    self.restore_page_size();

                    if changes.is_empty() {
                        self.state.apply_server_response_continuation(
                            response.continuation.as_deref(),
                            &request,
                            true,
                        )?;
                        sleep_unless_cancelled(self.settings.feed_poll_delay, shutdown).await;
                    } else {
                        self.deliver(observer, &request, response, changes).await?;
                    }
                }
                Err(e) => self.handle_read_error(e, shutdown).await?,
            }
        }
        Ok(())
    }

    async fn read_page(
        &self,
        request: &ChangeFeedRequest,
    ) -> Result<(FeedResponse, Vec<T>), StoreError> {
        let response = self.client.query_change_feed(request).await?;
        let changes = response
            .documents
            .iter()
            .map(|doc| serde_json::from_str(doc))
            .collect::<Result<Vec<T>, _>>()?;
        Ok((response, changes))
    }

    async fn deliver(
        &mut self,
        observer: &mut dyn ChangeFeedObserver<T>,
        request: &ChangeFeedRequest,
        response: FeedResponse,
        changes: Vec<T>,
    ) -> Result<(), PartitionError> {
        let mut next = self.state.clone();
        next.apply_server_response_continuation(response.continuation.as_deref(), request, false)?;

        let n = changes.len();
        let ctx = self.ctx.with_batch(next.clone());
        let res = observer.process_changes(&ctx, changes).await;
        ctx.finish_batch();
        res.map_err(|e| PartitionError::from_observer(e, ObserverStage::ProcessChanges))?;

        debug!(lease_token = self.ctx.lease_token(), n, "Delivered changes");
        self.state = next;
        Ok(())
    }

    async fn handle_read_error(
        &mut self,
        e: StoreError,
        shutdown: &CancellationToken,
    ) -> Result<(), PartitionError> {
        let lease_token = self.ctx.lease_token().to_string();
        let kind = e.classify();
        match kind {
            StatusCodeErrorType::PartitionNotFound => {
                Err(PartitionError::PartitionNotFound { lease_token })
            }
            StatusCodeErrorType::PartitionSplitOrMerge => {
                Err(PartitionError::FeedRangeGone { lease_token })
            }
            StatusCodeErrorType::TransientError => {
                let delay = e.retry_after().unwrap_or_else(|| self.backoff.next());
                warn!(%lease_token, %e, ?delay, "Transient change feed read failure, retrying");
                sleep_unless_cancelled(delay, shutdown).await;
                Ok(())
            }
            kind if kind.is_page_size_related() => {
                if self.page_size <= 1 {
                    error!(%lease_token, %e, %kind, "Cannot read even a single change");
                    return Err(PartitionError::Read {
                        lease_token,
                        source: e,
                    });
                }
                self.page_size = (self.page_size / 2).max(1);
                warn!(
                    %lease_token,
                    %e,
                    %kind,
                    page_size = self.page_size,
                    "Reducing page size"
                );
                Ok(())
            }
            _ => {
                error!(%lease_token, %e, %kind, "Change feed read failed");
                Err(PartitionError::Read {
                    lease_token,
                    source: e,
                })
            }
        }
    }

    fn restore_page_size(&mut self) {
        let configured = self.settings.max_items_count.max(1);
        if self.page_size != configured {
            debug!(
                lease_token = self.ctx.lease_token(),
                page_size = configured,
                "Restoring page size"
            );
            self.page_size = configured;
        }
    }
}
