//! Jittered exponential backoff for retrying transient store failures.

use std::time::Duration;

use rand::Rng;

/// Exponential backoff with jitter.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct BackoffConfig {
    /// Initial backoff.
    pub init_backoff: Duration,

    /// Maximum backoff.
    pub max_backoff: Duration,

    /// Multiplier for each backoff round.
    pub base: f64,
}

impl Default for BackoffConfig {
    fn default() -> Self {
        Self {
            init_backoff: Duration::from_millis(100),
            max_backoff: Duration::from_secs(30),
            base: 3.,
        }
    }
}

/// Stateful generator of successive backoff durations.
///
/// The upper bound of each draw grows by `base` until it saturates at `max_backoff`; the
/// returned value is drawn uniformly between `init_backoff` and that bound.
#[derive(Debug)]
#[allow(missing_copy_implementations)]
pub struct Backoff {
    init_backoff: f64,
    next_backoff_secs: f64,
    max_backoff_secs: f64,
    base: f64,
}

impl Backoff {
    pub fn new(config: &BackoffConfig) -> Self {
        let init_backoff = config.init_backoff.as_secs_f64();
        Self {
            init_backoff,
            next_backoff_secs: init_backoff,
            max_backoff_secs: config.max_backoff.as_secs_f64(),
            base: config.base,
        }
    }

    /// Returns the next backoff duration to wait for.
    pub fn next(&mut self) -> Duration {
        let range = self.init_backoff..=(self.next_backoff_secs * self.base).max(self.init_backoff);
        let rand_backoff = rand::thread_rng().gen_range(range);

        let next_backoff = self.max_backoff_secs.min(rand_backoff);
        self.next_backoff_secs = next_backoff;
        Duration::from_secs_f64(next_backoff)
    }

    /// Forget accumulated growth after a success.
    pub fn reset(&mut self) {
        self.next_backoff_secs = self.init_backoff;
    }
}
