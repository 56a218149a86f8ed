//! Scriptable observers and checkpointers for tests.

use std::{
    collections::{BTreeMap, VecDeque},
    fmt::Display,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::{error::DynError, lease::LeaseError, state::ChangeFeedStateV1};

use super::{
    ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedObserverFactory, CheckpointError,
    CloseReason, PartitionCheckpointer,
};

/// What a mock observer does with the next batch.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MockStep {
    /// Accept the batch.
    Ok,

    /// Accept the batch and checkpoint explicitly.
    Checkpoint,

    /// Return an error with this message.
    Fail(String),

    /// Panic.
    Panic,

    /// Accept the batch after sleeping this long.
    Delay(Duration),
}

#[derive(Debug)]
struct LogInner<T> {
    opened: Vec<String>,
    closed: Vec<(String, CloseReason)>,
    batches: Vec<(String, Vec<T>)>,
}

impl<T> Default for LogInner<T> {
    fn default() -> Self {
        Self {
            opened: vec![],
            closed: vec![],
            batches: vec![],
        }
    }
}

/// Everything mock observers sharing this log have seen.
#[derive(Debug)]
pub struct MockObserverLog<T> {
    inner: Mutex<LogInner<T>>,
}

impl<T> Default for MockObserverLog<T> {
    fn default() -> Self {
        Self {
            inner: Mutex::new(LogInner::default()),
        }
    }
}

impl<T> MockObserverLog<T>
where
    T: Clone,
{
    /// Lease tokens of opened observers, in order.
    pub fn opened(&self) -> Vec<String> {
        self.inner.lock().opened.clone()
    }

    pub fn closed(&self) -> Vec<(String, CloseReason)> {
        self.inner.lock().closed.clone()
    }

    pub fn batches(&self) -> Vec<Vec<T>> {
        self.inner
            .lock()
            .batches
            .iter()
            .map(|(_, batch)| batch.clone())
            .collect()
    }

    /// Batches grouped by lease token, each group in delivery order.
    pub fn batches_by_lease(&self) -> BTreeMap<String, Vec<Vec<T>>> {
        let mut by_lease = BTreeMap::<String, Vec<Vec<T>>>::new();
        for (lease_token, batch) in &self.inner.lock().batches {
            by_lease
                .entry(lease_token.clone())
                .or_default()
                .push(batch.clone());
        }
        by_lease
    }

    /// Every delivered change, in delivery order.
    pub fn changes(&self) -> Vec<T> {
        self.inner
            .lock()
            .batches
            .iter()
            .flat_map(|(_, batch)| batch.iter().cloned())
            .collect()
    }
}

#[derive(Debug)]
pub struct MockChangeFeedObserver<T> {
    log: Arc<MockObserverLog<T>>,
    open_result: Option<Result<(), DynError>>,
    steps: Arc<Mutex<VecDeque<MockStep>>>,
    default_step: MockStep,
}

impl<T> MockChangeFeedObserver<T> {
    pub fn new() -> Self {
        Self {
            log: Arc::new(MockObserverLog::default()),
            open_result: None,
            steps: Default::default(),
            default_step: MockStep::Ok,
        }
    }

    pub fn with_open_result(mut self, res: Result<(), DynError>) -> Self {
        self.open_result = Some(res);
        self
    }

    pub fn with_steps(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        self.steps.lock().extend(steps);
        self
    }

    pub fn log(&self) -> Arc<MockObserverLog<T>> {
        Arc::clone(&self.log)
    }
}

impl<T> Default for MockChangeFeedObserver<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Display for MockChangeFeedObserver<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock")
    }
}

#[async_trait]
impl<T> ChangeFeedObserver<T> for MockChangeFeedObserver<T>
where
    T: std::fmt::Debug + Send + Sync + 'static,
{
    async fn open(&mut self, ctx: &ChangeFeedObserverContext) -> Result<(), DynError> {
        self.log
            .inner
            .lock()
            .opened
            .push(ctx.lease_token().to_string());
        self.open_result.take().unwrap_or(Ok(()))
    }

    async fn close(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        reason: CloseReason,
    ) -> Result<(), DynError> {
        self.log
            .inner
            .lock()
            .closed
            .push((ctx.lease_token().to_string(), reason));
        Ok(())
    }

    async fn process_changes(
        &mut self,
        ctx: &ChangeFeedObserverContext,
        changes: Vec<T>,
    ) -> Result<(), DynError> {
        self.log
            .inner
            .lock()
            .batches
            .push((ctx.lease_token().to_string(), changes));

        let step = self
            .steps
            .lock()
            .pop_front()
            .unwrap_or_else(|| self.default_step.clone());
        match step {
            MockStep::Ok => Ok(()),
            MockStep::Checkpoint => Ok(ctx.checkpoint().await?),
            MockStep::Fail(msg) => Err(msg.into()),
            MockStep::Panic => panic!("mock observer panic"),
            MockStep::Delay(d) => {
                tokio::time::sleep(d).await;
                Ok(())
            }
        }
    }
}

/// Creates [`MockChangeFeedObserver`]s that share one log and one script.
#[derive(Debug)]
pub struct MockObserverFactory<T> {
    log: Arc<MockObserverLog<T>>,
    steps: Arc<Mutex<VecDeque<MockStep>>>,
    default_step: MockStep,
}

impl<T> MockObserverFactory<T> {
    pub fn new() -> Self {
        Self {
            log: Arc::new(MockObserverLog::default()),
            steps: Default::default(),
            default_step: MockStep::Ok,
        }
    }

    /// Step used once the shared script is exhausted.
    pub fn with_default_step(mut self, step: MockStep) -> Self {
        self.default_step = step;
        self
    }

    /// Steps consumed, across all observers, before falling back to the default.
    pub fn with_steps(self, steps: impl IntoIterator<Item = MockStep>) -> Self {
        self.steps.lock().extend(steps);
        self
    }

    pub fn log(&self) -> Arc<MockObserverLog<T>> {
        Arc::clone(&self.log)
    }
}

impl<T> Default for MockObserverFactory<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> Display for MockObserverFactory<T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "mock")
    }
}

impl<T> ChangeFeedObserverFactory<T> for MockObserverFactory<T>
where
    T: std::fmt::Debug + Send + Sync + 'static,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver<T>> {
        Box::new(MockChangeFeedObserver {
            log: Arc::clone(&self.log),
            open_result: None,
            steps: Arc::clone(&self.steps),
            default_step: self.default_step.clone(),
        })
    }
}

/// Records checkpointed states instead of persisting them.
#[derive(Debug, Default)]
pub struct MockPartitionCheckpointer {
    checkpoints: Mutex<Vec<ChangeFeedStateV1>>,
    lease_lost: AtomicBool,
}

impl MockPartitionCheckpointer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn checkpoints(&self) -> Vec<ChangeFeedStateV1> {
        self.checkpoints.lock().clone()
    }

    /// Fail every following checkpoint as if another host took the lease.
    pub fn lose_lease(&self) {
        self.lease_lost.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl PartitionCheckpointer for MockPartitionCheckpointer {
    async fn checkpoint(&self, state: &ChangeFeedStateV1) -> Result<(), CheckpointError> {
        if self.lease_lost.load(Ordering::SeqCst) {
            return Err(LeaseError::LeaseLost {
                lease_token: state.feed_range().lease_token(),
                owner: None,
            }
            .into());
        }
        self.checkpoints.lock().push(state.clone());
        Ok(())
    }
}
