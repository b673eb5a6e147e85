//! Peer directory.
//!
//! Known keepers, providers and users with their online state, credit and
//! public keys. Shared by every scheduler; all access goes through the
//! concurrent map so no scheduler holds a lock across an await.

use dashmap::DashMap;
use keeper_types::contract::PeerRecord;
use keeper_types::peer::{PeerInfo, PeerRole};
use rand::seq::SliceRandom;
use rand::Rng;
use tracing::debug;

/// Credit granted for each accepted proof.
pub const PROOF_CREDIT: i32 = 2;

/// Credit lost per liveness pass while offline.
pub const OFFLINE_PENALTY: i32 = -1;

#[derive(Default)]
pub struct PeerDirectory {
    peers: DashMap<String, PeerInfo>,
}

impl PeerDirectory {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self, id: &str) -> Option<PeerInfo> {
        self.peers.get(id).map(|p| p.clone())
    }

    pub fn role(&self, id: &str) -> Option<PeerRole> {
        self.peers.get(id).map(|p| p.role)
    }

    /// Insert a never-probed peer unless one is already known.
    pub fn ensure(&self, id: &str, role: PeerRole) {
        self.peers
            .entry(id.to_string())
            .or_insert_with(|| PeerInfo::new(id, role));
    }

    /// Insert or update a peer from its ledger registration.
    pub fn upsert_record(&self, record: &PeerRecord) {
        let mut entry = self
            .peers
            .entry(record.id.clone())
            .or_insert_with(|| PeerInfo::new(record.id.clone(), record.role));
        entry.capacity = record.capacity;
        entry.public_key = Some(record.public_key);
        if record.address.is_some() {
            entry.address = record.address.clone();
        }
    }

    pub fn public_key(&self, id: &str) -> Option<[u8; 32]> {
        self.peers.get(id).and_then(|p| p.public_key)
    }

    /// Record a successful probe.
    pub fn mark_seen(&self, id: &str, now: u64, address: Option<String>) {
        if let Some(mut peer) = self.peers.get_mut(id) {
            peer.mark_seen(now, address);
        }
    }

    /// Apply a credit delta. Returns the new credit, `None` for unknown peers.
    pub fn adjust_credit(&self, id: &str, delta: i32) -> Option<i32> {
        self.peers.get_mut(id).map(|mut p| p.adjust_credit(delta))
    }

    pub fn credit(&self, id: &str) -> Option<i32> {
        self.peers.get(id).map(|p| p.credit)
    }

    /// Online with non-negative credit.
    pub fn is_eligible(&self, id: &str) -> bool {
        self.peers.get(id).is_some_and(|p| p.is_eligible())
    }

    /// IDs of every peer with `role`, sorted.
    pub fn ids(&self, role: PeerRole) -> Vec<String> {
        let mut ids: Vec<String> = self
            .peers
            .iter()
            .filter(|p| p.role == role)
            .map(|p| p.id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn count(&self, role: PeerRole) -> usize {
        self.peers.iter().filter(|p| p.role == role).count()
    }

    /// Mark peers unseen for longer than `expire_window` offline and charge
    /// offline providers. Returns the IDs that are offline after the pass.
    pub fn expire(&self, now: u64, expire_window: u64) -> Vec<String> {
        let mut offline = Vec::new();
        for mut peer in self.peers.iter_mut() {
            if peer.role == PeerRole::User {
                continue;
            }
            if now.saturating_sub(peer.last_seen) > expire_window {
                if peer.online {
                    debug!(peer = %peer.id, "peer went offline");
                }
                peer.online = false;
            }
            if !peer.online {
                if peer.role == PeerRole::Provider {
                    peer.adjust_credit(OFFLINE_PENALTY);
                }
                offline.push(peer.id.clone());
            }
        }
        offline
    }

    /// Up to `count` eligible providers, best credit first, ties broken at random.
    pub fn select_providers<R: Rng + ?Sized>(&self, count: usize, rng: &mut R) -> Vec<String> {
        let mut candidates: Vec<(String, i32)> = self
            .peers
            .iter()
            .filter(|p| p.role == PeerRole::Provider && p.is_eligible())
            .map(|p| (p.id.clone(), p.credit))
            .collect();
        candidates.shuffle(rng);
        // Stable sort keeps the shuffled order among equal credits.
        candidates.sort_by(|a, b| b.1.cmp(&a.1));
        candidates
            .into_iter()
            .take(count)
            .map(|(id, _)| id)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_types::{CREDIT_MAX, CREDIT_MIN};
    use rand::rngs::StdRng;
    use rand::SeedableRng;

    fn online_provider(dir: &PeerDirectory, id: &str, credit: i32) {
        dir.ensure(id, PeerRole::Provider);
        dir.mark_seen(id, 100, None);
        let current = dir.credit(id).expect("credit");
        dir.adjust_credit(id, credit - current);
    }

    #[test]
    fn test_ensure_does_not_reset() {
        let dir = PeerDirectory::new();
        dir.ensure("p1", PeerRole::Provider);
        dir.adjust_credit("p1", 10);
        dir.ensure("p1", PeerRole::Provider);
        assert_eq!(dir.credit("p1"), Some(60));
    }

    #[test]
    fn test_credit_bounded_over_long_runs() {
        let dir = PeerDirectory::new();
        dir.ensure("p1", PeerRole::Provider);
        for _ in 0..500 {
            dir.adjust_credit("p1", PROOF_CREDIT);
        }
        assert_eq!(dir.credit("p1"), Some(CREDIT_MAX));
        for _ in 0..500 {
            dir.expire(10_000, 60);
        }
        assert_eq!(dir.credit("p1"), Some(CREDIT_MIN));
    }

    #[test]
    fn test_expire_marks_offline_and_charges_providers_only() {
        let dir = PeerDirectory::new();
        dir.ensure("p1", PeerRole::Provider);
        dir.ensure("k1", PeerRole::Keeper);
        dir.mark_seen("p1", 100, None);
        dir.mark_seen("k1", 100, None);

        // Still within the window.
        assert!(dir.expire(150, 60).is_empty());
        assert_eq!(dir.credit("p1"), Some(50));

        let offline = dir.expire(200, 60);
        assert_eq!(offline.len(), 2);
        assert_eq!(dir.credit("p1"), Some(49));
        assert_eq!(dir.credit("k1"), Some(0));
        assert!(!dir.is_eligible("p1"));
    }

    #[test]
    fn test_upsert_record_fills_key_and_keeps_credit() {
        let dir = PeerDirectory::new();
        dir.ensure("p1", PeerRole::Provider);
        dir.adjust_credit("p1", -20);
        dir.upsert_record(&PeerRecord {
            id: "p1".to_string(),
            role: PeerRole::Provider,
            public_key: [3u8; 32],
            capacity: 1 << 30,
            address: Some("10.0.0.3:4000".to_string()),
        });
        let peer = dir.get("p1").expect("peer");
        assert_eq!(peer.credit, 30);
        assert_eq!(peer.capacity, 1 << 30);
        assert_eq!(dir.public_key("p1"), Some([3u8; 32]));
    }

    #[test]
    fn test_select_providers_orders_by_credit_and_filters() {
        let dir = PeerDirectory::new();
        online_provider(&dir, "p1", 10);
        online_provider(&dir, "p2", 90);
        online_provider(&dir, "p3", -5);
        online_provider(&dir, "p4", 40);
        dir.ensure("p5", PeerRole::Provider); // never seen

        let mut rng = StdRng::seed_from_u64(7);
        let picked = dir.select_providers(10, &mut rng);
        assert_eq!(picked, vec!["p2", "p4", "p1"]);
        assert_eq!(dir.select_providers(1, &mut rng), vec!["p2"]);
    }

    #[test]
    fn test_select_providers_ties_are_all_reachable() {
        let dir = PeerDirectory::new();
        online_provider(&dir, "p1", 50);
        online_provider(&dir, "p2", 50);

        let mut rng = StdRng::seed_from_u64(1);
        let mut firsts = std::collections::HashSet::new();
        for _ in 0..64 {
            firsts.insert(dir.select_providers(1, &mut rng).remove(0));
        }
        assert_eq!(firsts.len(), 2);
    }
}
