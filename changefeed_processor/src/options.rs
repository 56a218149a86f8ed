//! Processor settings.

use std::time::Duration;

use changefeed_clap_blocks::processor::{
    CheckpointModeArg, FeedModeArg, ProcessorConfig, StartFromArg,
};
use chrono::{DateTime, Utc};

use crate::{
    backoff::BackoffConfig,
    observer::CheckpointFrequency,
    state::{ChangeFeedMode, ChangeFeedStartFrom},
};

#[derive(Debug, thiserror::Error, PartialEq, Eq)]
pub enum ConfigError {
    #[error("host name must not be empty")]
    EmptyHostName,

    #[error("{0} must be greater than zero")]
    ZeroInterval(&'static str),

    #[error(
        "lease renew interval ({renew:?}) must be shorter than the lease expiration interval ({expiration:?})"
    )]
    RenewIntervalTooLong {
        renew: Duration,
        expiration: Duration,
    },

    #[error("max leases to acquire per cycle must not be negative, got {0}")]
    NegativeLeaseAcquireCap(i32),

    #[error("min scale count {min} is larger than max scale count {max}")]
    ScaleCountRange { min: usize, max: usize },

    #[error("max items count must be greater than zero")]
    ZeroMaxItems,

    #[error("full fidelity change feed cannot start from {0:?}")]
    FullFidelityStartFrom(ChangeFeedStartFrom),
}

/// Settings of a [`ChangeFeedProcessor`](crate::processor::ChangeFeedProcessor).
#[derive(Debug, Clone, PartialEq)]
pub struct ChangeFeedProcessorOptions {
    /// How often owned leases are renewed.
    pub lease_renew_interval: Duration,

    /// How often the load balancing cycle runs.
    pub lease_acquire_interval: Duration,

    /// How long a lease may go without renewal before other hosts may take it.
    pub lease_expiration_interval: Duration,

    /// Wait before polling a partition again after an empty page.
    pub feed_poll_delay: Duration,

    /// Prefix of every lease document id.
    pub lease_prefix: String,

    /// Maximum number of changes per batch.
    pub max_items_count: u32,

    /// Where partitions without a checkpoint start reading.
    pub start_from: ChangeFeedStartFrom,

    /// Lower bound of leases this host aims for; 0 means none.
    pub min_scale_count: usize,

    /// Upper bound of leases this host takes; 0 means none.
    pub max_scale_count: usize,

    /// Cap on expired leases claimed per balancing cycle; 0 means no cap.
    pub max_leases_to_acquire_per_cycle: i32,

    pub mode: ChangeFeedMode,

    pub checkpoint_frequency: CheckpointFrequency,

    /// Backoff for transient read failures.
    pub backoff: BackoffConfig,
}

impl Default for ChangeFeedProcessorOptions {
    fn default() -> Self {
        Self {
            lease_renew_interval: Duration::from_secs(17),
            lease_acquire_interval: Duration::from_secs(13),
            lease_expiration_interval: Duration::from_secs(60),
            feed_poll_delay: Duration::from_secs(5),
            lease_prefix: String::new(),
            max_items_count: 100,
            start_from: ChangeFeedStartFrom::Now,
            min_scale_count: 0,
            max_scale_count: 0,
            max_leases_to_acquire_per_cycle: 0,
            mode: ChangeFeedMode::Incremental,
            checkpoint_frequency: CheckpointFrequency::default(),
            backoff: BackoffConfig::default(),
        }
    }
}

impl ChangeFeedProcessorOptions {
    pub fn validate(&self) -> Result<(), ConfigError> {
        for (name, interval) in [
            ("lease renew interval", self.lease_renew_interval),
            ("lease acquire interval", self.lease_acquire_interval),
            ("lease expiration interval", self.lease_expiration_interval),
        ] {
            if interval.is_zero() {
                return Err(ConfigError::ZeroInterval(name));
            }
        }

        if self.lease_renew_interval >= self.lease_expiration_interval {
            return Err(ConfigError::RenewIntervalTooLong {
                renew: self.lease_renew_interval,
                expiration: self.lease_expiration_interval,
            });
        }

        if self.max_leases_to_acquire_per_cycle < 0 {
            return Err(ConfigError::NegativeLeaseAcquireCap(
                self.max_leases_to_acquire_per_cycle,
            ));
        }

        if self.min_scale_count > 0
            && self.max_scale_count > 0
            && self.min_scale_count > self.max_scale_count
        {
            return Err(ConfigError::ScaleCountRange {
                min: self.min_scale_count,
                max: self.max_scale_count,
            });
        }

        if self.max_items_count == 0 {
            return Err(ConfigError::ZeroMaxItems);
        }

        if self.mode == ChangeFeedMode::FullFidelity
            && !self.start_from.supports_full_fidelity_retention()
        {
            return Err(ConfigError::FullFidelityStartFrom(self.start_from.clone()));
        }

        Ok(())
    }
}

impl TryFrom<&ProcessorConfig> for ChangeFeedProcessorOptions {
    type Error = ConfigError;

    fn try_from(config: &ProcessorConfig) -> Result<Self, Self::Error> {
        let start_from = match (&config.start_time, config.start_from) {
            (Some(start_time), _) => {
                ChangeFeedStartFrom::point_in_time(DateTime::<Utc>::from(**start_time))
            }
            (None, StartFromArg::Now) => ChangeFeedStartFrom::Now,
            (None, StartFromArg::Beginning) => ChangeFeedStartFrom::Beginning,
        };

        let mode = match config.mode {
            FeedModeArg::Incremental => ChangeFeedMode::Incremental,
            FeedModeArg::FullFidelity => ChangeFeedMode::FullFidelity,
        };

        let checkpoint_frequency = match config.checkpoint_mode {
            CheckpointModeArg::Manual => CheckpointFrequency::explicit(),
            CheckpointModeArg::Auto => CheckpointFrequency {
                explicit_checkpoint: false,
                processed_document_count: config.checkpoint_item_count,
                time_interval: config.checkpoint_interval.map(|d| *d),
            },
        };

        let options = Self {
            lease_renew_interval: *config.lease_renew_interval,
            lease_acquire_interval: *config.lease_acquire_interval,
            lease_expiration_interval: *config.lease_expiration_interval,
            feed_poll_delay: *config.feed_poll_delay,
            lease_prefix: config.lease_prefix.clone(),
            max_items_count: config.max_items_count.get(),
            start_from,
            min_scale_count: config.min_scale_count,
            max_scale_count: config.max_scale_count,
            max_leases_to_acquire_per_cycle: config.max_leases_to_acquire_per_cycle,
            mode,
            checkpoint_frequency,
            backoff: BackoffConfig::default(),
        };
        options.validate()?;
        Ok(options)
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;
    use clap::Parser;

    use super::*;

    fn parse(args: &[&str]) -> ProcessorConfig {
        let mut argv = vec!["cfp", "--host-name", "w1"];
        argv.extend_from_slice(args);
        ProcessorConfig::try_parse_from(argv).unwrap()
    }

    #[test]
    fn test_defaults_are_valid() {
        let options = ChangeFeedProcessorOptions::default();
        options.validate().unwrap();

        let from_config = ChangeFeedProcessorOptions::try_from(&parse(&[])).unwrap();
        assert_eq!(from_config, options);
    }

    #[test]
    fn test_validation() {
        let valid = ChangeFeedProcessorOptions::default();

        let options = ChangeFeedProcessorOptions {
            lease_acquire_interval: Duration::ZERO,
            ..valid.clone()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::ZeroInterval("lease acquire interval"))
        );

        let options = ChangeFeedProcessorOptions {
            lease_renew_interval: Duration::from_secs(60),
            ..valid.clone()
        };
        assert_matches!(
            options.validate(),
            Err(ConfigError::RenewIntervalTooLong { .. })
        );

        let options = ChangeFeedProcessorOptions {
            max_leases_to_acquire_per_cycle: -1,
            ..valid.clone()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::NegativeLeaseAcquireCap(-1))
        );

        let options = ChangeFeedProcessorOptions {
            min_scale_count: 5,
            max_scale_count: 2,
            ..valid.clone()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::ScaleCountRange { min: 5, max: 2 })
        );

        // only one bound set is fine
        let options = ChangeFeedProcessorOptions {
            min_scale_count: 5,
            ..valid.clone()
        };
        options.validate().unwrap();

        let options = ChangeFeedProcessorOptions {
            max_items_count: 0,
            ..valid.clone()
        };
        assert_eq!(options.validate(), Err(ConfigError::ZeroMaxItems));

        let options = ChangeFeedProcessorOptions {
            mode: ChangeFeedMode::FullFidelity,
            start_from: ChangeFeedStartFrom::Beginning,
            ..valid.clone()
        };
        assert_eq!(
            options.validate(),
            Err(ConfigError::FullFidelityStartFrom(
                ChangeFeedStartFrom::Beginning
            ))
        );

        let options = ChangeFeedProcessorOptions {
            mode: ChangeFeedMode::FullFidelity,
            ..valid
        };
        options.validate().unwrap();
    }

    #[test]
    fn test_from_config() {
        let config = parse(&[
            "--lease-prefix",
            "orders.",
            "--start-from",
            "beginning",
            "--checkpoint-item-count",
            "50",
            "--checkpoint-interval",
            "30s",
            "--max-leases-to-acquire-per-cycle",
            "2",
        ]);
        let options = ChangeFeedProcessorOptions::try_from(&config).unwrap();
        assert_eq!(options.lease_prefix, "orders.");
        assert_eq!(options.start_from, ChangeFeedStartFrom::Beginning);
        assert_eq!(options.max_leases_to_acquire_per_cycle, 2);
        assert_eq!(
            options.checkpoint_frequency,
            CheckpointFrequency {
                explicit_checkpoint: false,
                processed_document_count: Some(50),
                time_interval: Some(Duration::from_secs(30)),
            }
        );

        let config = parse(&[
            "--start-time",
            "2024-01-02T03:04:05Z",
            "--checkpoint-mode",
            "manual",
        ]);
        let options = ChangeFeedProcessorOptions::try_from(&config).unwrap();
        assert_eq!(
            options.start_from,
            ChangeFeedStartFrom::point_in_time(
                "2024-01-02T03:04:05Z".parse::<DateTime<Utc>>().unwrap()
            )
        );
        assert!(options.checkpoint_frequency.explicit_checkpoint);
    }

    #[test]
    fn test_invalid_config() {
        let config = parse(&["--max-leases-to-acquire-per-cycle", "-3"]);
        assert_eq!(
            ChangeFeedProcessorOptions::try_from(&config),
            Err(ConfigError::NegativeLeaseAcquireCap(-3))
        );

        let config = parse(&["--mode", "full-fidelity", "--start-from", "beginning"]);
        assert_matches!(
            ChangeFeedProcessorOptions::try_from(&config),
            Err(ConfigError::FullFidelityStartFrom(_))
        );
    }
}
