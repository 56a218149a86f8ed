//! Processing of one lease: reading its change feed, renewing it and reacting to topology
//! changes.
//!
//! A [`PartitionController`] owns one [`PartitionSupervisor`] task per acquired lease. The
//! supervisor runs the [`PartitionProcessor`] pump and the [`LeaseRenewer`] side by side until
//! either stops, then reports back so the controller can hand split ranges to the
//! [`PartitionSynchronizer`], delete leases of vanished partitions, or release the lease.

use std::{sync::Arc, time::Duration};

use parking_lot::Mutex;
use tokio_util::sync::CancellationToken;

use crate::{
    error::{DynError, StoreError},
    lease::{Lease, LeaseError},
    observer::{CheckpointError, CloseReason, ObserverException, exception_wrapping::ObserverStage},
    state::StateError,
};

pub mod bootstrapper;
pub mod checkpointer;
pub mod controller;
pub mod processor;
pub mod renewer;
pub mod supervisor;
pub mod synchronizer;

pub use bootstrapper::Bootstrapper;
pub use checkpointer::LeaseCheckpointer;
pub use controller::PartitionController;
pub use processor::PartitionProcessor;
pub use renewer::LeaseRenewer;
pub use supervisor::PartitionSupervisor;
pub use synchronizer::PartitionSynchronizer;

#[derive(Debug, thiserror::Error)]
pub enum PartitionError {
    #[error("feed range of lease {lease_token} was split or merged")]
    FeedRangeGone { lease_token: String },

    #[error("partition of lease {lease_token} no longer exists")]
    PartitionNotFound { lease_token: String },

    #[error("reading the change feed of lease {lease_token} failed: {source}")]
    Read {
        lease_token: String,
        source: StoreError,
    },

    #[error(transparent)]
    Observer(#[from] ObserverException),

    #[error(transparent)]
    Lease(#[from] LeaseError),

    #[error("cannot checkpoint: {0}")]
    Checkpoint(CheckpointError),

    #[error("cannot advance read position: {0}")]
    State(#[from] StateError),

    #[error("store request failed: {0}")]
    Store(#[from] StoreError),
}

impl PartitionError {
    /// Why the observer of a lease that stopped with this error is closed.
    pub fn close_reason(&self) -> CloseReason {
        match self {
            Self::FeedRangeGone { .. } => CloseReason::LeaseGone,
            Self::PartitionNotFound { .. } => CloseReason::ResourceGone,
            Self::Lease(LeaseError::LeaseLost { .. }) => CloseReason::LeaseLost,
            Self::Observer(_) => CloseReason::ObserverError,
            _ => CloseReason::Unknown,
        }
    }

    /// Sort an error returned by a wrapped observer.
    ///
    /// Checkpoint failures raised by the processor's own decorators keep their meaning, so that
    /// a lost lease is not mistaken for a user error.
    pub(crate) fn from_observer(e: DynError, stage: ObserverStage) -> Self {
        let e = match e.downcast::<CheckpointError>() {
            Ok(e) => {
                return match *e {
                    CheckpointError::Lease(e) => Self::Lease(e),
                    e => Self::Checkpoint(e),
                };
            }
            Err(e) => e,
        };
        match e.downcast::<ObserverException>() {
            Ok(e) => Self::Observer(*e),
            Err(e) => Self::Observer(ObserverException::new(stage, e)),
        }
    }
}

/// The current version of a lease, shared between the pump, its checkpointer and the renewer.
///
/// Every successful write returns a new etag; whoever wrote last stores the lease here so the
/// next conditional write starts from it.
#[derive(Debug, Clone)]
pub struct SharedLease(Arc<Mutex<Lease>>);

impl SharedLease {
    pub fn new(lease: Lease) -> Self {
        Self(Arc::new(Mutex::new(lease)))
    }

    pub fn get(&self) -> Lease {
        self.0.lock().clone()
    }

    pub fn set(&self, lease: Lease) {
        *self.0.lock() = lease;
    }

    pub fn lease_token(&self) -> String {
        self.0.lock().lease_token.clone()
    }
}

/// Sleep for `d` unless `shutdown` fires first. Returns `false` when cancelled.
pub(crate) async fn sleep_unless_cancelled(d: Duration, shutdown: &CancellationToken) -> bool {
    tokio::select! {
        _ = shutdown.cancelled() => false,
        _ = tokio::time::sleep(d) => true,
    }
}

#[cfg(test)]
mod tests {
    use assert_matches::assert_matches;

    use super::*;

    #[test]
    fn test_close_reason() {
        let cases = [
            (
                PartitionError::FeedRangeGone {
                    lease_token: "-FF".into(),
                },
                CloseReason::LeaseGone,
            ),
            (
                PartitionError::PartitionNotFound {
                    lease_token: "-FF".into(),
                },
                CloseReason::ResourceGone,
            ),
            (
                PartitionError::Lease(LeaseError::LeaseLost {
                    lease_token: "-FF".into(),
                    owner: Some("w2".into()),
                }),
                CloseReason::LeaseLost,
            ),
            (
                PartitionError::Lease(LeaseError::Contended {
                    lease_token: "-FF".into(),
                }),
                CloseReason::Unknown,
            ),
            (
                PartitionError::Observer(ObserverException::new(
                    ObserverStage::ProcessChanges,
                    "boom".into(),
                )),
                CloseReason::ObserverError,
            ),
        ];
        for (e, reason) in cases {
            assert_eq!(e.close_reason(), reason, "{e}");
        }
    }

    #[test]
    fn test_from_observer() {
        let lost: DynError = Box::new(CheckpointError::Lease(LeaseError::LeaseLost {
            lease_token: "-FF".into(),
            owner: None,
        }));
        assert_matches!(
            PartitionError::from_observer(lost, ObserverStage::ProcessChanges),
            PartitionError::Lease(LeaseError::LeaseLost { .. })
        );

        let wrapped: DynError = Box::new(ObserverException::new(
            ObserverStage::Open,
            "bad config".into(),
        ));
        assert_matches!(
            PartitionError::from_observer(wrapped, ObserverStage::ProcessChanges),
            PartitionError::Observer(e) if e.stage() == ObserverStage::Open
        );

        let plain: DynError = "plain".into();
        assert_matches!(
            PartitionError::from_observer(plain, ObserverStage::Close),
            PartitionError::Observer(e) if e.stage() == ObserverStage::Close
        );
    }

    #[test]
    fn test_shared_lease() {
        let lease = Lease::new(
            "p.rid..-FF",
            crate::range::FeedRange::full(),
            None,
            crate::time::Time::from_timestamp_millis(0).unwrap(),
        );
        let shared = SharedLease::new(lease.clone());
        let other = shared.clone();

        let mut updated = lease;
        updated.etag = "\"2\"".into();
        other.set(updated);

        assert_eq!(shared.get().etag, "\"2\"");
        assert_eq!(shared.lease_token(), "-FF");
    }
}
