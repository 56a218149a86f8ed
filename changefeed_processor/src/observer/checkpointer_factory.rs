use std::{fmt::Display, sync::Arc};

use crate::time::TimeProvider;

use super::{
    AutoCheckpointer, ChangeFeedObserver, ChangeFeedObserverFactory, CheckpointFrequency,
    LoggingChangeFeedObserverWrapper, ObserverExceptionWrapping,
};

/// Wraps every observer created by the inner factory in the processor's decorators:
/// logging, then exception wrapping, then automatic checkpointing unless checkpoints are
/// explicit.
#[derive(Debug)]
pub struct CheckpointerObserverFactory<F> {
    inner: F,
    frequency: CheckpointFrequency,
    time_provider: Arc<dyn TimeProvider>,
}

impl<F> CheckpointerObserverFactory<F> {
    pub fn new(
        inner: F,
        frequency: CheckpointFrequency,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Self {
        Self {
            inner,
            frequency,
            time_provider,
        }
    }

    pub fn frequency(&self) -> CheckpointFrequency {
        self.frequency
    }
}

impl<F> Display for CheckpointerObserverFactory<F>
where
    F: Display,
{
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "checkpointer({})", self.inner)
    }
}

impl<T, F> ChangeFeedObserverFactory<T> for CheckpointerObserverFactory<F>
where
    T: Send + 'static,
    F: ChangeFeedObserverFactory<T>,
{
    fn create_observer(&self) -> Box<dyn ChangeFeedObserver<T>> {
        let observer = ObserverExceptionWrapping::new(LoggingChangeFeedObserverWrapper::new(
            self.inner.create_observer(),
        ));
        if self.frequency.explicit_checkpoint {
            Box::new(observer)
        } else {
            Box::new(AutoCheckpointer::new(
                observer,
                self.frequency,
                Arc::clone(&self.time_provider),
            ))
        }
    }
}

#[cfg(test)]
mod tests {
    use crate::{
        observer::mock::MockObserverFactory,
        time::{SystemProvider, TimeProvider},
    };

    use super::*;

    fn time() -> Arc<dyn TimeProvider> {
        Arc::new(SystemProvider::new())
    }

    #[test]
    fn test_decorator_chain() {
        let factory = CheckpointerObserverFactory::new(
            MockObserverFactory::<u32>::new(),
            CheckpointFrequency::every_batch(),
            time(),
        );
        assert_eq!(factory.to_string(), "checkpointer(mock)");
        assert_eq!(
            factory.create_observer().to_string(),
            "auto_checkpoint(exception_wrapping(logging(mock)))"
        );

        let factory = CheckpointerObserverFactory::new(
            MockObserverFactory::<u32>::new(),
            CheckpointFrequency::explicit(),
            time(),
        );
        assert_eq!(
            factory.create_observer().to_string(),
            "exception_wrapping(logging(mock))"
        );
        assert!(factory.frequency().explicit_checkpoint);
    }
}
