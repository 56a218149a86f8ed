//! Bounded waiting for asynchronous test conditions.

use std::{future::Future, time::Duration};

/// How long [`wait_until`] waits before failing the test.
pub const DEFAULT_WAIT: Duration = Duration::from_secs(10);

/// Poll `condition` until it holds, panicking with `what` after [`DEFAULT_WAIT`].
pub async fn wait_until<F>(what: &str, mut condition: F)
where
    F: FnMut() -> bool + Send,
{
    let res = tokio::time::timeout(DEFAULT_WAIT, async {
        while !condition() {
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(res.is_ok(), "timed out waiting for {what}");
}

pub trait FutureTimeout: Future + Sized {
    /// Await the future, panicking if it takes longer than `d`.
    fn with_timeout_panic(self, d: Duration) -> impl Future<Output = Self::Output> {
        async move {
            match tokio::time::timeout(d, self).await {
                Ok(v) => v,
                Err(_) => panic!("future did not complete within {d:?}"),
            }
        }
    }
}

impl<F> FutureTimeout for F where F: Future + Sized {}
