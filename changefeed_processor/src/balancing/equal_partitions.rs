use std::{
    collections::{BTreeMap, BTreeSet},
    fmt::Display,
    sync::Arc,
    time::Duration,
};

use rand::seq::SliceRandom;
use tracing::debug;

use crate::{lease::Lease, options::ConfigError, time::TimeProvider};

use super::PartitionLoadBalancingStrategy;

/// Spreads leases evenly over every host that currently holds a live lease.
///
/// Each host runs this independently against the shared lease set. Expired leases are claimed
/// before anything is stolen, and at most one lease is stolen per cycle, so concurrent hosts
/// converge on an even split without coordinating.
#[derive(Debug)]
pub struct EqualPartitionsBalancingStrategy {
    host_name: String,
    min_partition_count: usize,
    max_partition_count: usize,
    lease_expiration_interval: Duration,
    max_leases_to_acquire_per_cycle: usize,
    time_provider: Arc<dyn TimeProvider>,
}

impl EqualPartitionsBalancingStrategy {
    /// `min_partition_count` and `max_partition_count` bound the per-host target, 0 disables a
    /// bound. `max_leases_to_acquire_per_cycle` caps how many expired leases are claimed at once,
    /// 0 disables the cap.
    pub fn try_new(
        host_name: impl Into<String>,
        min_partition_count: usize,
        max_partition_count: usize,
        lease_expiration_interval: Duration,
        max_leases_to_acquire_per_cycle: i32,
        time_provider: Arc<dyn TimeProvider>,
    ) -> Result<Self, ConfigError> {
        let max_leases_to_acquire_per_cycle = usize::try_from(max_leases_to_acquire_per_cycle)
            .map_err(|_| ConfigError::NegativeLeaseAcquireCap(max_leases_to_acquire_per_cycle))?;

        Ok(Self {
            host_name: host_name.into(),
            min_partition_count,
            max_partition_count,
            lease_expiration_interval,
            max_leases_to_acquire_per_cycle,
            time_provider,
        })
    }

    fn is_self(&self, owner: &str) -> bool {
        owner.eq_ignore_ascii_case(&self.host_name)
    }

    fn target_partition_count(&self, partition_count: usize, worker_count: usize) -> usize {
        let mut target = if partition_count > worker_count {
            partition_count.div_ceil(worker_count)
        } else {
            1
        };

        if self.max_partition_count > 0 && target > self.max_partition_count {
            target = self.max_partition_count;
        }
        if self.min_partition_count > 0 && target < self.min_partition_count {
            target = self.min_partition_count;
        }
        target
    }

    /// One live lease of the host holding the most leases, if taking it leaves that host at or
    /// above the target.
    fn lease_to_steal<'a>(
        &self,
        all_leases: &'a [Lease],
        workers: &BTreeMap<&str, usize>,
        target: usize,
        needed: i64,
    ) -> Option<&'a Lease> {
        let (victim, victim_count) = workers
            .iter()
            .filter(|(worker, _)| !self.is_self(worker))
            .max_by(|(a_name, a_count), (b_name, b_count)| {
                a_count.cmp(b_count).then_with(|| b_name.cmp(a_name))
            })?;

        let threshold = target as i64 - i64::from(needed > 1);
        if (*victim_count as i64) <= threshold {
            return None;
        }

        let now = self.time_provider.now();
        all_leases.iter().find(|lease| {
            lease.is_owned_by(victim) && !lease.is_expired(now, self.lease_expiration_interval)
        })
    }
}

impl Display for EqualPartitionsBalancingStrategy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "equal_partitions")
    }
}

impl PartitionLoadBalancingStrategy for EqualPartitionsBalancingStrategy {
    fn select_leases_to_take(&self, all_leases: &[Lease]) -> Vec<Lease> {
        let now = self.time_provider.now();

        let mut partitions = BTreeSet::new();
        let mut expired = vec![];
        let mut workers = BTreeMap::<&str, usize>::new();
        workers.insert(self.host_name.as_str(), 0);

        for lease in all_leases {
            partitions.insert(lease.lease_token.as_str());
            match lease.owner() {
                Some(owner) if !lease.is_expired(now, self.lease_expiration_interval) => {
                    let owner = if self.is_self(owner) {
                        self.host_name.as_str()
                    } else {
                        owner
                    };
                    *workers.entry(owner).or_default() += 1;
                }
                _ => expired.push(lease),
            }
        }

        let partition_count = partitions.len();
        if partition_count == 0 {
            return vec![];
        }

        let target = self.target_partition_count(partition_count, workers.len());
        let my_count = workers.get(self.host_name.as_str()).copied().unwrap_or_default();
        let mut needed = target as i64 - my_count as i64;

        if !expired.is_empty() {
            if self.max_partition_count == 0 && needed <= 0 {
                needed = 1;
            } else if workers.len() > 1 && self.max_leases_to_acquire_per_cycle == 0 {
                needed = needed.min(1);
            }
            if self.max_leases_to_acquire_per_cycle > 0 {
                needed = needed.min(self.max_leases_to_acquire_per_cycle as i64);
            }
            if needed <= 0 {
                return vec![];
            }

            debug!(
                host_name = %self.host_name,
                target,
                my_count,
                needed,
                expired = expired.len(),
                "Taking expired leases"
            );
            expired.shuffle(&mut rand::thread_rng());
            return expired
                .into_iter()
                .take(needed as usize)
                .cloned()
                .collect();
        }

        if needed <= 0 {
            return vec![];
        }

        match self.lease_to_steal(all_leases, &workers, target, needed) {
            Some(lease) => {
                debug!(
                    host_name = %self.host_name,
                    lease_token = %lease.lease_token,
                    owner = lease.owner().unwrap_or_default(),
                    target,
                    my_count,
                    "Stealing lease"
                );
                vec![lease.clone()]
            }
            None => vec![],
        }
    }
}
