//! Which leases this host should try to take in a balancing cycle.

use std::fmt::{Debug, Display};

use crate::lease::Lease;

pub mod equal_partitions;

pub use equal_partitions::EqualPartitionsBalancingStrategy;

pub trait PartitionLoadBalancingStrategy: Debug + Display + Send + Sync {
    /// Pick leases to acquire, given every lease currently known to exist.
    ///
    /// The result is only a proposal: acquisition is a conditional write, and losing the race
    /// for a lease just means it is skipped this cycle.
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease>;
}

impl<T> PartitionLoadBalancingStrategy for std::sync::Arc<T>
where
    T: PartitionLoadBalancingStrategy + ?Sized,
{
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        (**self).select_leases_to_take(all_leases)
    }
}
