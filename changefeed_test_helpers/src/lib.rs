//! Shared helpers for testing the change feed processor crates.
#![deny(rust_2018_idioms)]
#![warn(
    missing_copy_implementations,
    missing_debug_implementations,
    clippy::explicit_iter_loop,
    clippy::use_self
)]

pub mod timeout;
pub mod tracing;

pub type Error = Box<dyn std::error::Error + Send + Sync + 'static>;
pub type Result<T = (), E = Error> = std::result::Result<T, E>;

/// Host names `worker-0`, `worker-1`, ... for multi-worker scenarios.
pub fn worker_names(n: usize) -> Vec<String> {
    (0..n).map(|i| format!("worker-{i}")).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_worker_names() {
        assert_eq!(worker_names(0), Vec::<String>::new());
        assert_eq!(worker_names(2), vec!["worker-0", "worker-1"]);
    }
}
