//! Building blocks for [`clap`]-driven configuration of a change feed processor.
//!
//! Each block can be flattened into a host application's own argument parser. Every argument
//! can also be supplied through a `CHANGEFEED_*` environment variable.

pub mod processor;
