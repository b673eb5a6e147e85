//! Checkpoint and restore through [`KvStore`].
//!
//! Every key lives under the local keeper ID, so several keepers can share
//! one database file. Values are JSON.

use std::sync::Arc;

use keeper_db::KvStore;
use keeper_transport::key::{KeyType, MetaKey};
use keeper_types::block::BlockId;
use keeper_types::challenge::ChallengeOutcome;
use keeper_types::payment::PaymentRecord;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::bucket::BucketInfo;
use crate::group::{Group, Membership};
use crate::ledger::{BlockMeta, LedgerEntry};
use crate::service::Keeper;
use crate::Result;

/// Stored form of a group.
#[derive(Debug, Serialize, Deserialize)]
struct GroupRecord {
    user_id: String,
    membership: Membership,
}

fn put_json<T: Serialize>(store: &dyn KvStore, key: &MetaKey, value: &T) -> Result<()> {
    let bytes = serde_json::to_vec(value)?;
    store.put(&key.to_string(), &bytes)?;
    Ok(())
}

impl Keeper {
    fn state_key(&self, key_type: KeyType, group_id: &str) -> MetaKey {
        MetaKey::new(self.id.clone(), key_type).with(group_id)
    }

    fn state_prefix(&self, key_type: KeyType) -> String {
        MetaKey::type_prefix(&self.id, key_type)
    }

    pub(crate) fn persist_group(&self, group: &Group) -> Result<()> {
        let record = GroupRecord {
            user_id: group.user_id.clone(),
            membership: group.membership(),
        };
        put_json(
            self.store.as_ref(),
            &self.state_key(KeyType::Group, &group.group_id),
            &record,
        )
    }

    pub(crate) fn persist_bucket(&self, group_id: &str, bucket_id: i64, info: &BucketInfo) -> Result<()> {
        put_json(
            self.store.as_ref(),
            &self.state_key(KeyType::Bucket, group_id).with(bucket_id),
            info,
        )
    }

    fn block_pos_key(&self, group_id: &str, provider: &str, block: &BlockId) -> MetaKey {
        self.state_key(KeyType::BlockPos, group_id)
            .with(provider)
            .with(block)
    }

    pub(crate) fn persist_block_pos(&self, group_id: &str, block: &BlockId, meta: &BlockMeta) -> Result<()> {
        put_json(
            self.store.as_ref(),
            &self.block_pos_key(group_id, &meta.provider, block),
            meta,
        )
    }

    pub(crate) fn delete_block_pos(&self, group_id: &str, provider: &str, block: &BlockId) -> Result<()> {
        self.store
            .delete(&self.block_pos_key(group_id, provider, block).to_string())?;
        Ok(())
    }

    pub(crate) fn persist_history(&self, group: &Group, entry: &LedgerEntry) -> Result<()> {
        let history: Vec<ChallengeOutcome> = entry.history().into_values().collect();
        put_json(
            self.store.as_ref(),
            &self
                .state_key(KeyType::ChalHistory, &group.group_id)
                .with(&entry.provider),
            &history,
        )
    }

    pub(crate) fn persist_last_payment(&self, group: &Group, entry: &LedgerEntry, payment: &PaymentRecord) -> Result<()> {
        put_json(
            self.store.as_ref(),
            &self
                .state_key(KeyType::LastPay, &group.group_id)
                .with(&entry.provider),
            payment,
        )
    }

    pub(crate) fn persist_history_logged(&self, group: &Group, entry: &LedgerEntry) {
        if let Err(e) = self.persist_history(group, entry) {
            warn!(group = %group.group_id, provider = %entry.provider, error = %e, "history not persisted");
        }
    }

    pub(crate) fn persist_last_payment_logged(&self, group: &Group, entry: &LedgerEntry, payment: &PaymentRecord) {
        if let Err(e) = self.persist_last_payment(group, entry, payment) {
            warn!(group = %group.group_id, provider = %entry.provider, error = %e, "last payment not persisted");
        }
    }

    pub(crate) fn persist_block_pos_logged(&self, group_id: &str, block: &BlockId, meta: &BlockMeta) {
        if let Err(e) = self.persist_block_pos(group_id, block, meta) {
            warn!(block = %block, error = %e, "block position not persisted");
        }
    }

    pub(crate) fn delete_block_pos_logged(&self, group_id: &str, provider: &str, block: &BlockId) {
        if let Err(e) = self.delete_block_pos(group_id, provider, block) {
            warn!(block = %block, error = %e, "block position not deleted");
        }
    }

    pub(crate) fn persist_group_logged(&self, group: &Group) {
        if let Err(e) = self.persist_group(group) {
            warn!(group = %group.group_id, error = %e, "group not persisted");
        }
    }

    /// Checkpoint every group.
    pub fn persist_all(&self) -> Result<()> {
        let groups = self.groups.all();
        for group in &groups {
            self.persist_group(group)?;
            for (bucket_id, info) in group.buckets.snapshot() {
                self.persist_bucket(&group.group_id, bucket_id, &info)?;
            }
            for entry in group.ledgers() {
                let blocks: Vec<(BlockId, BlockMeta)> = entry
                    .blocks
                    .iter()
                    .map(|b| (b.key().clone(), b.value().clone()))
                    .collect();
                for (block, meta) in &blocks {
                    self.persist_block_pos(&group.group_id, block, meta)?;
                }
                self.persist_history(group, &entry)?;
                if let Some(last) = entry.last_payment() {
                    self.persist_last_payment(group, &entry, &last)?;
                }
            }
        }
        debug!(groups = groups.len(), "state checkpointed");
        Ok(())
    }

    /// Reload persisted state, returning the number of groups restored.
    ///
    /// Entries whose key or value no longer parses are skipped.
    pub fn restore(&self) -> Result<usize> {
        let mut restored = 0;
        for (key, value) in self.store.iterate(&self.state_prefix(KeyType::Group))? {
            let Some(group_id) = parse_key(&key).and_then(|k| k.option(0).map(str::to_string)) else {
                continue;
            };
            let record: GroupRecord = match serde_json::from_slice(&value) {
                Ok(record) => record,
                Err(e) => {
                    warn!(key = %key, error = %e, "skipping unreadable group");
                    continue;
                }
            };
            let (group, _) = self.groups.get_or_create(&record.user_id, &group_id);
            group.restore_membership(record.membership);
            restored += 1;
        }

        for (key, value) in self.store.iterate(&self.state_prefix(KeyType::Bucket))? {
            let Some((group, k)) = self.restored_group(&key) else {
                continue;
            };
            let (Some(bucket_id), Ok(info)) = (
                k.option(1).and_then(|b| b.parse::<i64>().ok()),
                serde_json::from_slice::<BucketInfo>(&value),
            ) else {
                continue;
            };
            group.buckets.record(bucket_id, info.layout, info.stripes);
        }

        for (key, value) in self.store.iterate(&self.state_prefix(KeyType::BlockPos))? {
            let Some((group, k)) = self.restored_group(&key) else {
                continue;
            };
            let (Some(provider), Some(Ok(block)), Ok(meta)) = (
                k.option(1),
                k.option(2).map(str::parse::<BlockId>),
                serde_json::from_slice::<BlockMeta>(&value),
            ) else {
                continue;
            };
            group.ledger(provider).blocks.insert(block, meta);
        }

        for (key, value) in self.store.iterate(&self.state_prefix(KeyType::ChalHistory))? {
            let Some((group, k)) = self.restored_group(&key) else {
                continue;
            };
            let (Some(provider), Ok(history)) = (
                k.option(1),
                serde_json::from_slice::<Vec<ChallengeOutcome>>(&value),
            ) else {
                continue;
            };
            let entry = group.ledger(provider);
            entry
                .challenge
                .lock()
                .history
                .extend(history.into_iter().map(|o| (o.issued_at, o)));
        }

        for (key, value) in self.store.iterate(&self.state_prefix(KeyType::LastPay))? {
            let Some((group, k)) = self.restored_group(&key) else {
                continue;
            };
            let (Some(provider), Ok(payment)) = (
                k.option(1),
                serde_json::from_slice::<PaymentRecord>(&value),
            ) else {
                continue;
            };
            group.ledger(provider).payment.lock().last = Some(payment);
        }

        Ok(restored)
    }

    fn restored_group(&self, key: &str) -> Option<(Arc<Group>, MetaKey)> {
        let k = parse_key(key)?;
        let group = self.groups.get(k.option(0)?)?;
        Some((group, k))
    }

    /// Delete everything persisted for a group.
    pub(crate) fn delete_group_state(&self, group_id: &str) -> Result<usize> {
        self.store
            .delete(&self.state_key(KeyType::Group, group_id).to_string())?;
        let mut deleted = 1;
        for key_type in [
            KeyType::Bucket,
            KeyType::BlockPos,
            KeyType::ChalHistory,
            KeyType::LastPay,
        ] {
            let prefix = format!("{}{group_id}/", self.state_prefix(key_type));
            deleted += self.store.delete_prefix(&prefix)?;
        }
        Ok(deleted)
    }
}

fn parse_key(key: &str) -> Option<MetaKey> {
    match key.parse::<MetaKey>() {
        Ok(k) => Some(k),
        Err(e) => {
            debug!(key = %key, error = %e, "skipping malformed key");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::CoreConfig;
    use crate::testutil::{contract, keeper_with, Harness};
    use keeper_types::challenge::ChallengeKind;
    use keeper_types::layout::BucketLayout;
    use keeper_types::payment::equal_shares;

    fn payment(provider: &str) -> PaymentRecord {
        let keepers = vec!["k1".to_string()];
        PaymentRecord {
            upkeeping_address: "0xup-q1".to_string(),
            user_id: "u1".to_string(),
            group_id: "q1".to_string(),
            provider: provider.to_string(),
            start: 100,
            length: 900,
            value: u128::from(u64::MAX) + 7,
            root: [9u8; 32],
            share_weights: equal_shares(&keepers),
            signatures: vec![Some([3u8; 64])],
            needed: 0,
            signers: keepers,
        }
    }

    fn populated(harness: &Harness) -> Arc<Keeper> {
        let keeper = keeper_with(harness, CoreConfig::default());
        let (group, _) = keeper.groups.get_or_create("u1", "q1");
        group.apply_contract(contract("q1", &[keeper.id.clone()], &["p1", "p2"], 5, 0, 1000));
        group.set_public_key(vec![1, 2, 3]);
        group.buckets.record(2, BucketLayout::new(3, 2, 4096).expect("layout"), 9);
        group.buckets.observe_stripe(-1, 4);

        let entry = group.ledger("p1");
        let block = BlockId::new("q1", 2, 0, 1);
        let mut meta = entry.put_block(block.clone(), 3, 50);
        meta.repair = 2;
        entry.blocks.insert(block, meta);
        entry.challenge.lock().history.insert(
            60,
            ChallengeOutcome {
                issued_at: 60,
                kind: ChallengeKind::Data,
                sampled_len: 10,
                verified_len: 10,
                success: true,
            },
        );
        entry.payment.lock().last = Some(payment("p1"));
        keeper
    }

    #[test]
    fn test_persist_and_restore() {
        let harness = Harness::new();
        let keeper = populated(&harness);
        keeper.persist_all().expect("persist");

        // Same key, same store: a restarted keeper.
        let restarted = keeper_with(&harness, CoreConfig::default());
        assert_eq!(restarted.restore().expect("restore"), 1);

        let group = restarted.groups.get("q1").expect("group");
        assert_eq!(group.user_id, "u1");
        assert_eq!(group.membership(), keeper.groups.get("q1").expect("q1").membership());
        assert_eq!(group.buckets.get(2).map(|b| b.stripes), Some(9));
        assert_eq!(group.buckets.get(-1).map(|b| b.stripes), Some(5));

        let entry = group.existing_ledger("p1").expect("p1");
        let meta = entry.block(&BlockId::new("q1", 2, 0, 1)).expect("block");
        assert_eq!((meta.offset, meta.repair, meta.last_verified), (3, 2, 50));
        assert_eq!(entry.history().len(), 1);
        assert_eq!(entry.last_payment(), Some(payment("p1")));
    }

    #[test]
    fn test_keys_are_namespaced_by_keeper() {
        let harness = Harness::new();
        let keeper = populated(&harness);
        keeper.persist_all().expect("persist");

        let other = Harness::new();
        let stranger = keeper_with(
            &Harness {
                store: harness.store.clone(),
                ..other
            },
            CoreConfig::default(),
        );
        assert_eq!(stranger.restore().expect("restore"), 0);
        assert!(stranger.groups.is_empty());
    }

    #[test]
    fn test_delete_group_state() {
        let harness = Harness::new();
        let keeper = populated(&harness);
        keeper.persist_all().expect("persist");
        let (other, _) = keeper.groups.get_or_create("u1", "q10");
        keeper.persist_group(&other).expect("persist q10");

        assert!(keeper.delete_group_state("q1").expect("delete") >= 5);
        let prefix = format!("{}/", keeper.id);
        let left: Vec<String> = harness
            .store
            .iterate(&prefix)
            .expect("iterate")
            .into_iter()
            .map(|(k, _)| k)
            .collect();
        assert_eq!(left, vec![format!("{}/group/q10", keeper.id)]);
    }

    #[test]
    fn test_block_pos_delete() {
        let harness = Harness::new();
        let keeper = keeper_with(&harness, CoreConfig::default());
        let block = BlockId::new("q1", 1, 0, 0);
        let meta = BlockMeta::new("p1", 0, 10);
        keeper.persist_block_pos("q1", &block, &meta).expect("put");
        let key = format!("{}/blockpos/q1/p1/q1_1_0_0", keeper.id);
        assert!(harness.store.get(&key).expect("get").is_some());
        keeper.delete_block_pos("q1", "p1", &block).expect("delete");
        assert!(harness.store.get(&key).expect("get").is_none());
    }

    #[test]
    fn test_unreadable_entries_are_skipped() {
        let harness = Harness::new();
        let keeper = keeper_with(&harness, CoreConfig::default());
        harness
            .store
            .put(&format!("{}/group/q1", keeper.id), b"not json")
            .expect("put");
        harness
            .store
            .put(&format!("{}/chalhistory/q9/p1", keeper.id), b"[]")
            .expect("put");
        assert_eq!(keeper.restore().expect("restore"), 0);
    }
}
