//! Block repair.
//!
//! The scanner walks every block this keeper is master for and applies the
//! staged retry policy in [`repair_decision`]. Blocks due for repair go onto a
//! bounded queue; when it is full the scanner waits. A single worker drains
//! the queue through [`Keeper::repair_block`], so at most one stripe is being
//! reconstructed at a time.

use std::collections::BTreeSet;

use keeper_transport::cbor;
use keeper_transport::key::{KeyType, MetaKey, Opcode};
use keeper_transport::messages::{RepairReply, RepairRequest, RepairSource};
use keeper_types::block::BlockId;
use rand::seq::SliceRandom;
use tokio::sync::mpsc;
use tracing::{debug, info, warn};

use crate::service::Keeper;
use crate::{KeeperError, Result};

/// Elapsed expire windows after which a block is given up.
pub const GIVE_UP_WINDOWS: u64 = 480;

/// What the scanner does with one block.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RepairDecision {
    /// Not due yet.
    Wait,
    /// Enqueue and move the attempt counter to `next_attempt`.
    Enqueue { next_attempt: u32 },
    /// Too long without verification; never retried.
    GiveUp,
}

/// Staged retry policy.
///
/// `elapsed` is the time since the block was last verified. Attempts 0, 1
/// and 2 fire after 1, 4 and 16 expire windows; attempt `a >= 3` fires after
/// `64a - 2` windows. Nothing fires past [`GIVE_UP_WINDOWS`].
pub fn repair_decision(attempt: u32, elapsed: u64, expire_window: u64) -> RepairDecision {
    let windows = |n: u64| n.saturating_mul(expire_window);
    if elapsed > windows(GIVE_UP_WINDOWS) {
        return RepairDecision::GiveUp;
    }
    let threshold = match attempt {
        0 => 1,
        1 => 4,
        2 => 16,
        a => (64 * u64::from(a)).saturating_sub(2),
    };
    if elapsed >= windows(threshold) {
        RepairDecision::Enqueue {
            next_attempt: attempt.saturating_add(1),
        }
    } else {
        RepairDecision::Wait
    }
}

/// Counts from one scan.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ScanReport {
    pub scanned: usize,
    pub enqueued: usize,
    pub given_up: usize,
}

/// Result of one repair attempt.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum RepairOutcome {
    /// The block now lives at `provider`.
    Repaired { provider: String, offset: u64 },
    /// A proof reset the counter while the item was queued.
    Skipped,
    /// The destination answered with something other than success.
    Failed { provider: String, status: String },
}

impl Keeper {
    /// Reuse `current` while it is eligible, else pick uniformly among eligible
    /// group providers holding no chunk of the stripe.
    fn pick_destination(
        &self,
        current: &str,
        providers: &[String],
        holders: &BTreeSet<String>,
    ) -> Option<String> {
        if self.peers.is_eligible(current) {
            return Some(current.to_string());
        }
        let candidates: Vec<&String> = providers
            .iter()
            .filter(|p| !holders.contains(*p) && self.peers.is_eligible(p))
            .collect();
        candidates.choose(&mut rand::thread_rng()).map(|p| (*p).clone())
    }

    /// Enqueue every block that is due for repair.
    ///
    /// Only blocks whose provider this keeper is master for are considered.
    /// Waits when the queue is full; stops early if the worker has gone.
    pub async fn repair_scan(&self, now: u64, queue: &mpsc::Sender<BlockId>) -> ScanReport {
        let mut report = ScanReport::default();
        let expire = self.config.expire_window;

        for group in self.groups.all() {
            if group.contract().is_some_and(|c| c.is_expired(now)) {
                continue;
            }
            for entry in group.ledgers() {
                if group.master_for(&entry.provider).as_deref() != Some(self.id.as_str()) {
                    continue;
                }

                // Decide and bump counters before awaiting on the queue.
                let mut due = Vec::new();
                for mut meta in entry.blocks.iter_mut() {
                    report.scanned += 1;
                    let elapsed = now.saturating_sub(meta.last_verified);
                    match repair_decision(meta.repair, elapsed, expire) {
                        RepairDecision::Wait => {}
                        RepairDecision::GiveUp => report.given_up += 1,
                        RepairDecision::Enqueue { next_attempt } => {
                            meta.repair = next_attempt;
                            due.push(meta.key().clone());
                        }
                    }
                }

                for block in due {
                    if queue.send(block).await.is_err() {
                        debug!("repair queue closed, scan stopped");
                        return report;
                    }
                    report.enqueued += 1;
                }
            }
        }

        if report.enqueued > 0 || report.given_up > 0 {
            info!(
                scanned = report.scanned,
                enqueued = report.enqueued,
                given_up = report.given_up,
                "repair scan"
            );
        }
        report
    }

    /// Reconstruct one block at a healthy provider.
    pub async fn repair_block(&self, block: &BlockId, now: u64) -> Result<RepairOutcome> {
        let group = self
            .groups
            .get(&block.group_id)
            .ok_or_else(|| KeeperError::NotMyUser(block.group_id.clone()))?;
        let layout = group
            .buckets
            .layout(block.bucket_id)
            .ok_or_else(|| KeeperError::NoBlock(block.to_string()))?;

        // Who holds which chunk of this stripe.
        let stripe = block.stripe_id();
        let mut sources = Vec::new();
        let mut holders = BTreeSet::new();
        let mut current = None;
        for entry in group.ledgers() {
            for chunk in 0..layout.chunk_count() {
                let chunk_id = stripe.chunk(chunk);
                let Some(meta) = entry.block(&chunk_id) else {
                    continue;
                };
                holders.insert(entry.provider.clone());
                if chunk_id == *block {
                    current = Some((entry.clone(), meta));
                } else {
                    sources.push(RepairSource {
                        block: chunk_id,
                        provider: entry.provider.clone(),
                    });
                }
            }
        }
        let Some((current_entry, current_meta)) = current else {
            return Err(KeeperError::NoBlock(block.to_string()));
        };
        if current_meta.repair == 0 {
            debug!(block = %block, "repair skipped, block verified meanwhile");
            return Ok(RepairOutcome::Skipped);
        }

        let destination = self
            .pick_destination(&current_entry.provider, &group.providers(), &holders)
            .ok_or_else(|| KeeperError::NoProvider(block.to_string()))?;

        let request = RepairRequest {
            block: block.clone(),
            sources,
            keeper: self.id.clone(),
        };
        let key = MetaKey::new(block.group_id.clone(), KeyType::Repair).with(block);
        let raw = self
            .send(Opcode::Put, &key, cbor::to_vec(&request)?, &destination)
            .await?;
        let reply: RepairReply = match cbor::from_slice(&raw) {
            Ok(reply) => reply,
            Err(e) => {
                return Ok(RepairOutcome::Failed {
                    provider: destination,
                    status: e.to_string(),
                })
            }
        };
        if !reply.is_ok() || reply.block != *block {
            warn!(block = %block, provider = %destination, status = %reply.status, "repair refused");
            return Ok(RepairOutcome::Failed {
                provider: destination,
                status: reply.status,
            });
        }
        if reply.provider != destination {
            warn!(block = %block, provider = %destination, claimed = %reply.provider, "repair reply names another provider");
            return Ok(RepairOutcome::Failed {
                provider: destination.clone(),
                status: format!("reply from {destination} names {}", reply.provider),
            });
        }

        current_entry.remove_block(block);
        self.delete_block_pos_logged(&group.group_id, &current_entry.provider, block);
        let new_entry = group.ledger(&reply.provider);
        let meta = new_entry.put_block(block.clone(), reply.offset, now);
        self.persist_block_pos_logged(&group.group_id, block, &meta);
        self.metrics.record_repair();

        info!(
            block = %block,
            from = %current_entry.provider,
            to = %reply.provider,
            offset = reply.offset,
            "block repaired"
        );
        Ok(RepairOutcome::Repaired {
            provider: reply.provider,
            offset: reply.offset,
        })
    }
}
