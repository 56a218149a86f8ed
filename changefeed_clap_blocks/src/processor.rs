//! Config for a change feed processor worker.

use std::num::NonZeroU32;

/// Where a worker starts reading partitions that have no checkpoint yet.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum StartFromArg {
    /// Only changes made after the lease was first created.
    #[default]
    Now,

    /// Every change still retained by the store.
    Beginning,
}

/// Which change feed is read.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum FeedModeArg {
    /// Latest version of every changed item.
    #[default]
    Incremental,

    /// Every intermediate version, including deletes, wrapped in a metadata envelope.
    FullFidelity,
}

/// Who decides when lease progress is persisted.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, clap::ValueEnum)]
pub enum CheckpointModeArg {
    /// The processor checkpoints according to the item count / interval settings.
    #[default]
    Auto,

    /// The observer checkpoints explicitly through its context.
    Manual,
}

/// CLI config for a change feed processor worker.
#[derive(Debug, Clone, clap::Parser)]
pub struct ProcessorConfig {
    /// Identity of this worker. Must be unique among workers sharing a lease container.
    #[clap(long = "host-name", env = "CHANGEFEED_HOST_NAME", action)]
    pub host_name: String,

    /// Prefix prepended to every lease document id, allowing several processors to share one
    /// lease container.
    #[clap(
        long = "lease-prefix",
        env = "CHANGEFEED_LEASE_PREFIX",
        default_value = "",
        action
    )]
    pub lease_prefix: String,

    /// How often an owned lease is renewed, e.g. "17s".
    #[clap(
        long = "lease-renew-interval",
        env = "CHANGEFEED_LEASE_RENEW_INTERVAL",
        default_value = "17s",
        action
    )]
    pub lease_renew_interval: humantime::Duration,

    /// How often the load balancing cycle runs, e.g. "13s".
    #[clap(
        long = "lease-acquire-interval",
        env = "CHANGEFEED_LEASE_ACQUIRE_INTERVAL",
        default_value = "13s",
        action
    )]
    pub lease_acquire_interval: humantime::Duration,

    /// A lease that has not been renewed for this long is considered abandoned and may be
    /// taken by any worker.
    #[clap(
        long = "lease-expiration-interval",
        env = "CHANGEFEED_LEASE_EXPIRATION_INTERVAL",
        default_value = "60s",
        action
    )]
    pub lease_expiration_interval: humantime::Duration,

    /// Delay before polling a partition again after it returned no changes.
    #[clap(
        long = "feed-poll-delay",
        env = "CHANGEFEED_FEED_POLL_DELAY",
        default_value = "5s",
        action
    )]
    pub feed_poll_delay: humantime::Duration,

    /// Maximum number of items delivered to the observer per batch.
    #[clap(
        long = "max-items-count",
        env = "CHANGEFEED_MAX_ITEMS_COUNT",
        default_value = "100",
        action
    )]
    pub max_items_count: NonZeroU32,

    /// Start position for partitions without a checkpoint.
    #[clap(
        long = "start-from",
        env = "CHANGEFEED_START_FROM",
        default_value_t = StartFromArg::default(),
        value_enum,
        action
    )]
    pub start_from: StartFromArg,

    /// Start from the first change made at or after this RFC 3339 time. Overrides
    /// `--start-from`.
    #[clap(long = "start-time", env = "CHANGEFEED_START_TIME", action)]
    pub start_time: Option<humantime::Timestamp>,

    /// Minimum number of leases this worker aims to own; 0 means no lower bound.
    #[clap(
        long = "min-scale-count",
        env = "CHANGEFEED_MIN_SCALE_COUNT",
        default_value = "0",
        action
    )]
    pub min_scale_count: usize,

    /// Maximum number of leases this worker will own; 0 means no upper bound.
    #[clap(
        long = "max-scale-count",
        env = "CHANGEFEED_MAX_SCALE_COUNT",
        default_value = "0",
        action
    )]
    pub max_scale_count: usize,

    /// Cap on expired leases claimed in a single balancing cycle; 0 means no cap.
    #[clap(
        long = "max-leases-to-acquire-per-cycle",
        env = "CHANGEFEED_MAX_LEASES_TO_ACQUIRE_PER_CYCLE",
        default_value = "0",
        allow_negative_numbers = true,
        action
    )]
    pub max_leases_to_acquire_per_cycle: i32,

    /// Change feed mode.
    #[clap(
        long = "mode",
        env = "CHANGEFEED_MODE",
        default_value_t = FeedModeArg::default(),
        value_enum,
        action
    )]
    pub mode: FeedModeArg,

    /// Checkpointing mode.
    #[clap(
        long = "checkpoint-mode",
        env = "CHANGEFEED_CHECKPOINT_MODE",
        default_value_t = CheckpointModeArg::default(),
        value_enum,
        action
    )]
    pub checkpoint_mode: CheckpointModeArg,

    /// With automatic checkpointing, checkpoint once this many items were processed.
    #[clap(
        long = "checkpoint-item-count",
        env = "CHANGEFEED_CHECKPOINT_ITEM_COUNT",
        action
    )]
    pub checkpoint_item_count: Option<u64>,

    /// With automatic checkpointing, checkpoint once this much time has passed since the
    /// previous checkpoint.
    #[clap(
        long = "checkpoint-interval",
        env = "CHANGEFEED_CHECKPOINT_INTERVAL",
        action
    )]
    pub checkpoint_interval: Option<humantime::Duration>,
}
