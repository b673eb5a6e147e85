//! Groups: one per (user, query) storage contract.
//!
//! A group owns its membership snapshot, its buckets and one ledger entry per
//! provider. Groups, buckets and ledger entries are created lazily through
//! atomic insert-if-absent so concurrent first accesses agree on one instance.

use std::collections::HashMap;
use std::sync::Arc;

use dashmap::DashMap;
use keeper_types::contract::{RootInfo, UpKeepingInfo};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketTracker;
use crate::ledger::LedgerEntry;

/// Median of the sorted, de-duplicated keeper IDs.
///
/// Depends only on the set of IDs, never on their input order.
pub fn elect_master(keepers: &[String]) -> Option<String> {
    let mut sorted: Vec<&String> = keepers.iter().collect();
    sorted.sort();
    sorted.dedup();
    sorted.get(sorted.len() / 2).map(|k| (*k).clone())
}

/// Membership and contract snapshot of a group.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Membership {
    pub keepers: Vec<String>,
    pub providers: Vec<String>,
    pub master: Option<String>,
    /// Keepers that manage each provider, when known.
    pub provider_managers: HashMap<String, Vec<String>>,
    pub contract: Option<UpKeepingInfo>,
    pub root: Option<RootInfo>,
    /// The user's proof-verification key.
    pub public_key: Option<Vec<u8>>,
    pub session_id: Option<String>,
    pub last_session: u64,
}

impl Membership {
    fn set_members(&mut self, keepers: Vec<String>, providers: Vec<String>) {
        self.master = elect_master(&keepers);
        self.keepers = keepers;
        self.providers = providers;
        let keepers = &self.keepers;
        for managers in self.provider_managers.values_mut() {
            managers.retain(|k| keepers.contains(k));
        }
    }
}

pub struct Group {
    pub user_id: String,
    pub group_id: String,
    membership: RwLock<Membership>,
    pub buckets: BucketTracker,
    ledgers: DashMap<String, Arc<LedgerEntry>>,
}

impl Group {
    pub fn new(user_id: impl Into<String>, group_id: impl Into<String>) -> Self {
        Self {
            user_id: user_id.into(),
            group_id: group_id.into(),
            membership: RwLock::new(Membership::default()),
            buckets: BucketTracker::new(),
            ledgers: DashMap::new(),
        }
    }

    /// A group the user owns alone; it never triggers payment.
    pub fn is_self_owned(&self) -> bool {
        self.group_id == self.user_id
    }

    pub fn membership(&self) -> Membership {
        self.membership.read().clone()
    }

    pub fn keepers(&self) -> Vec<String> {
        self.membership.read().keepers.clone()
    }

    pub fn providers(&self) -> Vec<String> {
        self.membership.read().providers.clone()
    }

    pub fn contract(&self) -> Option<UpKeepingInfo> {
        self.membership.read().contract.clone()
    }

    pub fn master(&self) -> Option<String> {
        self.membership.read().master.clone()
    }

    pub fn public_key(&self) -> Option<Vec<u8>> {
        self.membership.read().public_key.clone()
    }

    pub fn has_keeper(&self, keeper: &str) -> bool {
        self.membership.read().keepers.iter().any(|k| k == keeper)
    }

    pub fn has_provider(&self, provider: &str) -> bool {
        self.membership.read().providers.iter().any(|p| p == provider)
    }

    /// Replace keepers and providers and re-elect the master.
    pub fn set_members(&self, keepers: Vec<String>, providers: Vec<String>) {
        self.membership.write().set_members(keepers, providers);
    }

    /// Adopt a contract snapshot, taking membership from it.
    ///
    /// Readers see either the old membership and contract or both new ones.
    pub fn apply_contract(&self, contract: UpKeepingInfo) {
        let mut m = self.membership.write();
        m.set_members(contract.keepers.clone(), contract.providers.clone());
        m.contract = Some(contract);
    }

    /// Record which group keepers manage `provider`.
    pub fn set_provider_managers(&self, provider: &str, managers: Vec<String>) {
        let mut m = self.membership.write();
        let managers: Vec<String> = managers
            .into_iter()
            .filter(|k| m.keepers.contains(k))
            .collect();
        if managers.is_empty() {
            m.provider_managers.remove(provider);
        } else {
            m.provider_managers.insert(provider.to_string(), managers);
        }
    }

    /// Master for one provider, falling back to the group master.
    pub fn master_for(&self, provider: &str) -> Option<String> {
        let m = self.membership.read();
        m.provider_managers
            .get(provider)
            .and_then(|managers| elect_master(managers))
            .or_else(|| m.master.clone())
    }

    pub fn set_root(&self, root: Option<RootInfo>) {
        self.membership.write().root = root;
    }

    pub fn set_public_key(&self, key: Vec<u8>) {
        self.membership.write().public_key = Some(key);
    }

    pub fn record_session(&self, session_id: String, at: u64) {
        let mut m = self.membership.write();
        m.session_id = Some(session_id);
        m.last_session = m.last_session.max(at);
    }

    /// Restore a persisted membership snapshot.
    pub fn restore_membership(&self, membership: Membership) {
        *self.membership.write() = membership;
    }

    /// Ledger entry for `provider`, created if absent.
    pub fn ledger(&self, provider: &str) -> Arc<LedgerEntry> {
        self.ledgers
            .entry(provider.to_string())
            .or_insert_with(|| Arc::new(LedgerEntry::new(self.group_id.clone(), provider)))
            .clone()
    }

    pub fn existing_ledger(&self, provider: &str) -> Option<Arc<LedgerEntry>> {
        self.ledgers.get(provider).map(|l| l.clone())
    }

    /// All ledger entries, sorted by provider.
    pub fn ledgers(&self) -> Vec<Arc<LedgerEntry>> {
        let mut all: Vec<Arc<LedgerEntry>> = self.ledgers.iter().map(|l| l.clone()).collect();
        all.sort_by(|a, b| a.provider.cmp(&b.provider));
        all
    }
}

/// All groups this keeper serves.
#[derive(Default)]
pub struct GroupRegistry {
    groups: DashMap<String, Arc<Group>>,
}

impl GroupRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, group_id: &str) -> Option<Arc<Group>> {
        self.groups.get(group_id).map(|g| g.clone())
    }

    /// The group for `group_id`, created for `user_id` if absent.
    ///
    /// Returns the group and whether this call created it.
    pub fn get_or_create(&self, user_id: &str, group_id: &str) -> (Arc<Group>, bool) {
        let mut created = false;
        let group = self
            .groups
            .entry(group_id.to_string())
            .or_insert_with(|| {
                created = true;
                Arc::new(Group::new(user_id, group_id))
            })
            .clone();
        (group, created)
    }

    pub fn remove(&self, group_id: &str) -> Option<Arc<Group>> {
        self.groups.remove(group_id).map(|(_, g)| g)
    }

    /// All groups, sorted by ID.
    pub fn all(&self) -> Vec<Arc<Group>> {
        let mut all: Vec<Arc<Group>> = self.groups.iter().map(|g| g.clone()).collect();
        all.sort_by(|a, b| a.group_id.cmp(&b.group_id));
        all
    }

    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }
}
