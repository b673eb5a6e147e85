//! Operational gauges.
//!
//! Persistent failures only surface as stalled progress, so these counters
//! are the main thing an operator watches. They are refreshed and logged on
//! the metrics interval.

use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};

use keeper_types::peer::PeerRole;
use tracing::info;

use crate::service::Keeper;

#[derive(Debug, Default)]
pub struct Metrics {
    users: AtomicU64,
    groups: AtomicU64,
    providers: AtomicU64,
    keepers: AtomicU64,
    storage_used: AtomicU64,
    faults: AtomicU64,
    /// Cumulative successful repairs.
    repairs: AtomicU64,
}

/// Point-in-time copy of [`Metrics`].
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub struct MetricsSnapshot {
    pub users: u64,
    pub groups: u64,
    pub providers: u64,
    pub keepers: u64,
    pub storage_used: u64,
    pub faults: u64,
    pub repairs: u64,
}

impl Metrics {
    pub fn record_repair(&self) {
        self.repairs.fetch_add(1, Ordering::Relaxed);
    }

    /// Recompute the gauges from the keeper's state.
    pub fn refresh(&self, keeper: &Keeper) {
        let groups = keeper.groups.all();
        let users: BTreeSet<&str> = groups.iter().map(|g| g.user_id.as_str()).collect();

        let mut storage_used = 0u64;
        let mut faults = 0u64;
        for group in &groups {
            for entry in group.ledgers() {
                storage_used = storage_used.saturating_add(entry.stored_bytes(&group.buckets));
                faults = faults.saturating_add(entry.fault_count() as u64);
            }
        }

        self.users.store(users.len() as u64, Ordering::Relaxed);
        self.groups.store(groups.len() as u64, Ordering::Relaxed);
        self.providers
            .store(keeper.peers.count(PeerRole::Provider) as u64, Ordering::Relaxed);
        self.keepers
            .store(keeper.peers.count(PeerRole::Keeper) as u64, Ordering::Relaxed);
        self.storage_used.store(storage_used, Ordering::Relaxed);
        self.faults.store(faults, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> MetricsSnapshot {
        MetricsSnapshot {
            users: self.users.load(Ordering::Relaxed),
            groups: self.groups.load(Ordering::Relaxed),
            providers: self.providers.load(Ordering::Relaxed),
            keepers: self.keepers.load(Ordering::Relaxed),
            storage_used: self.storage_used.load(Ordering::Relaxed),
            faults: self.faults.load(Ordering::Relaxed),
            repairs: self.repairs.load(Ordering::Relaxed),
        }
    }

    pub fn log(&self) {
        let s = self.snapshot();
        info!(
            users = s.users,
            groups = s.groups,
            providers = s.providers,
            keepers = s.keepers,
            storage_used = s.storage_used,
            faults = s.faults,
            repairs = s.repairs,
            "keeper metrics"
        );
    }
}
