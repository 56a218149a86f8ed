//! A change feed processor: distributes the change feed of a partitioned document container
//! over a fleet of hosts and delivers every change, in order per feed range, to user observers.
//!
//! Coordination happens through lease documents kept in a second container. Each lease covers
//! one feed range; a host owns a lease by renewing it, checkpoints its read position into it,
//! and gives it up on shutdown so another host can take over. Hosts never talk to each other.
//!
//! The usual entry point is [`ChangeFeedProcessor::builder`]:
//!
//! ```no_run
//! # use std::sync::Arc;
//! # use changefeed_processor::{
//! #     ChangeFeedProcessor, client::mem::InMemoryContextClient, observer::mock::MockObserverFactory,
//! # };
//! # async fn run() -> Result<(), changefeed_processor::ProcessorError> {
//! let store = Arc::new(InMemoryContextClient::new("rid", 4));
//! let processor = ChangeFeedProcessor::<serde_json::Value>::builder()
//!     .host_name("worker-0")
//!     .feed_client(Arc::clone(&store) as _)
//!     .lease_client(store)
//!     .observer_factory(Arc::new(MockObserverFactory::new()))
//!     .build()?;
//!
//! processor.start().await?;
//! // ...
//! processor.stop().await;
//! # Ok(())
//! # }
//! ```

pub mod backoff;
pub mod balancing;
pub mod classifier;
pub mod client;
pub mod error;
pub mod item;
pub mod lease;
pub mod load_balancer;
pub mod observer;
pub mod options;
pub mod partition;
pub mod processor;
pub mod range;
pub mod request;
pub mod request_options;
pub mod state;
pub mod time;

pub use error::{DynError, StoreError};
pub use item::ChangeFeedProcessorItem;
pub use observer::{
    ChangeFeedObserver, ChangeFeedObserverContext, ChangeFeedObserverFactory, CloseReason,
};
pub use options::{ChangeFeedProcessorOptions, ConfigError};
pub use processor::{
    ChangeFeedProcessor, ChangeFeedProcessorBuilder, ChangeFeedProcessorState, ProcessorError,
};
