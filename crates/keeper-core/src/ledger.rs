//! Per (group, provider) bookkeeping.
//!
//! A [`LedgerEntry`] holds the blocks a provider stores for one group, the
//! provider's challenge history and fault set, the outstanding challenge, and
//! the payment state. Challenge and payment state sit behind separate locks
//! so the challenge path never waits on settlement.

use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;

use dashmap::DashMap;
use keeper_types::block::BlockId;
use keeper_types::challenge::{ChallengeKind, ChallengeOutcome, ChallengeRecord};
use keeper_types::payment::PaymentRecord;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};

use crate::bucket::BucketTracker;

/// Where a block lives and how healthy it is.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockMeta {
    pub provider: String,
    /// Highest segment index stored.
    pub offset: u64,
    /// Unix seconds of the last proof covering this block.
    pub last_verified: u64,
    /// Repair attempts since the last successful verification.
    pub repair: u32,
}

impl BlockMeta {
    pub fn new(provider: impl Into<String>, offset: u64, now: u64) -> Self {
        Self {
            provider: provider.into(),
            offset,
            last_verified: now,
            repair: 0,
        }
    }
}

/// Proof-of-storage state.
#[derive(Debug)]
pub struct ChallengeState {
    /// Outcomes keyed by issue time.
    pub history: BTreeMap<u64, ChallengeOutcome>,
    pub in_flight: Option<ChallengeRecord>,
    pub faults: BTreeSet<BlockId>,
    pub next_kind: ChallengeKind,
}

impl Default for ChallengeState {
    fn default() -> Self {
        Self {
            history: BTreeMap::new(),
            in_flight: None,
            faults: BTreeSet::new(),
            next_kind: ChallengeKind::Data,
        }
    }
}

/// Settlement state.
#[derive(Debug, Default)]
pub struct PaymentState {
    /// The last submitted payment; its end starts the next cycle.
    pub last: Option<PaymentRecord>,
    /// Payment collecting signatures, locked per payment.
    pub pending: Option<Arc<Mutex<PaymentRecord>>>,
    /// The latest payment co-signed for the master.
    pub cosigned: Option<PaymentRecord>,
    /// Set once the upkeeping window has elapsed.
    pub stopped: bool,
}

pub struct LedgerEntry {
    pub group_id: String,
    pub provider: String,
    pub blocks: DashMap<BlockId, BlockMeta>,
    pub challenge: Mutex<ChallengeState>,
    pub payment: Mutex<PaymentState>,
}

impl LedgerEntry {
    pub fn new(group_id: impl Into<String>, provider: impl Into<String>) -> Self {
        Self {
            group_id: group_id.into(),
            provider: provider.into(),
            blocks: DashMap::new(),
            challenge: Mutex::new(ChallengeState::default()),
            payment: Mutex::new(PaymentState::default()),
        }
    }

    /// Record (or move) a block to this provider.
    pub fn put_block(&self, block: BlockId, offset: u64, now: u64) -> BlockMeta {
        let meta = BlockMeta::new(self.provider.clone(), offset, now);
        self.blocks.insert(block, meta.clone());
        meta
    }

    pub fn remove_block(&self, block: &BlockId) -> Option<BlockMeta> {
        self.blocks.remove(block).map(|(_, meta)| meta)
    }

    pub fn block(&self, block: &BlockId) -> Option<BlockMeta> {
        self.blocks.get(block).map(|b| b.clone())
    }

    /// Stored length of one block, if known.
    pub fn block_len(&self, block: &BlockId, buckets: &BucketTracker) -> Option<u64> {
        let offset = self.blocks.get(block)?.offset;
        Some(buckets.layout(block.bucket_id)?.block_len(offset))
    }

    /// Bytes this provider holds for the group.
    pub fn stored_bytes(&self, buckets: &BucketTracker) -> u64 {
        self.blocks
            .iter()
            .filter_map(|b| {
                buckets
                    .layout(b.key().bucket_id)
                    .map(|layout| layout.block_len(b.offset))
            })
            .sum()
    }

    pub fn fault_count(&self) -> usize {
        self.challenge.lock().faults.len()
    }

    /// Copy of the challenge history.
    pub fn history(&self) -> BTreeMap<u64, ChallengeOutcome> {
        self.challenge.lock().history.clone()
    }

    /// Drop history that no future payment can use.
    pub fn prune_history(&self, before: u64) -> usize {
        let mut state = self.challenge.lock();
        let kept = state.history.split_off(&before);
        let dropped = state.history.len();
        state.history = kept;
        dropped
    }

    pub fn pending_payment(&self) -> Option<Arc<Mutex<PaymentRecord>>> {
        self.payment.lock().pending.clone()
    }

    pub fn last_payment(&self) -> Option<PaymentRecord> {
        self.payment.lock().last.clone()
    }

    pub fn is_stopped(&self) -> bool {
        self.payment.lock().stopped
    }
}
