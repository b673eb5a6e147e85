//! Proof-of-storage challenges.
//!
//! Issuing and answering are two independent paths. The scheduler builds a
//! challenge, records it as in flight and sends it without waiting. The proof
//! arrives later through the inbound dispatcher and is matched against the
//! in-flight record by its issue time. The only shared state is the ledger
//! entry, so a crash between the two loses at most one challenge.

use std::collections::{BTreeMap, HashMap, HashSet};

use keeper_crypto::blake3::{self, contexts};
use keeper_transport::cbor;
use keeper_transport::key::{KeyType, MetaKey, Opcode};
use keeper_transport::messages::ProofReply;
use keeper_types::block::BlockId;
use keeper_types::challenge::{
    BucketSpan, ChallengeKind, ChallengeOutcome, ChallengeRecord, SampleSet,
};
use keeper_types::layout::is_super_bucket;
use keeper_types::peer::PeerRole;
use tracing::{debug, info, warn};

use crate::external::ProofVerdict;
use crate::group::Group;
use crate::ledger::LedgerEntry;
use crate::peers::PROOF_CREDIT;
use crate::service::Keeper;
use crate::{KeeperError, Result};

/// Counts from one challenge tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ChallengeReport {
    pub issued: usize,
    pub empty: usize,
    /// In-flight challenges that never got a proof.
    pub abandoned: usize,
}

fn challenge_seed(group_id: &str, provider: &str, keeper: &str, issued_at: u64) -> [u8; 32] {
    let input = blake3::encode_multi_field(&[
        group_id.as_bytes(),
        provider.as_bytes(),
        keeper.as_bytes(),
        &issued_at.to_le_bytes(),
    ]);
    blake3::derive_key(contexts::CHALLENGE_SEED, &input)
}

/// Build a sparse challenge of `kind` against the blocks `entry` holds.
///
/// Buckets are laid out in ascending ID order. Each stripe the provider holds
/// contributes one sample: the lowest chunk it is on record for. Work is
/// proportional to the blocks held, not to the declared stripe counts.
/// Returns `None` when no position is sampled or the bitset would be too large.
pub fn build_challenge(
    group: &Group,
    entry: &LedgerEntry,
    keeper: &str,
    kind: ChallengeKind,
    issued_at: u64,
) -> Option<ChallengeRecord> {
    let spans: Vec<BucketSpan> = group
        .buckets
        .snapshot()
        .into_iter()
        .filter(|(id, _)| match kind {
            ChallengeKind::Data => !is_super_bucket(*id),
            ChallengeKind::Meta => is_super_bucket(*id),
        })
        .map(|(bucket_id, info)| BucketSpan {
            bucket_id,
            stripes: info.stripes,
            chunks: info.layout.chunk_count(),
        })
        .collect();

    // Bit offset of each span.
    let mut offsets = HashMap::with_capacity(spans.len());
    let mut total = 0u64;
    for span in &spans {
        offsets.insert(span.bucket_id, (total, span.stripes, span.chunks));
        total = total.checked_add(span.checked_width()?)?;
    }

    let mut lowest: BTreeMap<(i64, u64), u32> = BTreeMap::new();
    for block in entry.blocks.iter() {
        let id = block.key();
        let Some(&(_, stripes, chunks)) = offsets.get(&id.bucket_id) else {
            continue;
        };
        if id.stripe >= stripes || id.chunk >= chunks {
            continue;
        }
        lowest
            .entry((id.bucket_id, id.stripe))
            .and_modify(|c| *c = (*c).min(id.chunk))
            .or_insert(id.chunk);
    }
    if lowest.is_empty() {
        return None;
    }

    let Some(mut samples) = SampleSet::with_len(total) else {
        warn!(group = %group.group_id, provider = %entry.provider, positions = total, "challenge bitset too large");
        return None;
    };
    for ((bucket_id, stripe), chunk) in lowest {
        let Some(&(offset, _, chunks)) = offsets.get(&bucket_id) else {
            continue;
        };
        let index = stripe
            .checked_mul(u64::from(chunks))
            .and_then(|i| i.checked_add(u64::from(chunk)))
            .and_then(|i| i.checked_add(offset))?;
        samples.insert(index);
    }

    Some(ChallengeRecord {
        user_id: group.user_id.clone(),
        group_id: group.group_id.clone(),
        provider: entry.provider.clone(),
        keeper: keeper.to_string(),
        issued_at,
        kind,
        seed: challenge_seed(&group.group_id, &entry.provider, keeper, issued_at),
        spans,
        samples,
    })
}

/// Total stored length of `blocks` at this provider.
fn blocks_len<'a>(group: &Group, entry: &LedgerEntry, blocks: impl Iterator<Item = &'a BlockId>) -> u64 {
    blocks
        .filter_map(|b| entry.block_len(b, &group.buckets))
        .sum()
}

fn failed_outcome(group: &Group, entry: &LedgerEntry, record: &ChallengeRecord) -> ChallengeOutcome {
    ChallengeOutcome {
        issued_at: record.issued_at,
        kind: record.kind,
        sampled_len: blocks_len(group, entry, record.sampled_blocks().iter()),
        verified_len: 0,
        success: false,
    }
}

impl Keeper {
    /// Challenge every provider of every live group once.
    pub async fn challenge_tick(&self, now: u64) -> ChallengeReport {
        let mut report = ChallengeReport::default();
        for group in self.groups.all() {
            let Some(contract) = group.contract() else {
                continue;
            };
            if !contract.is_live(now) {
                continue;
            }
            if group.public_key().is_none() {
                self.fetch_user_key(&group);
            }

            for provider in group.providers() {
                let entry = group.ledger(&provider);
                let (record, abandoned) = self.issue_challenge(&group, &entry, now);
                if abandoned {
                    report.abandoned += 1;
                    self.persist_history_logged(&group, &entry);
                }
                let Some(record) = record else {
                    debug!(group = %group.group_id, provider = %provider, "nothing to challenge");
                    report.empty += 1;
                    continue;
                };
                match cbor::to_vec(&record) {
                    Ok(value) => {
                        let key = MetaKey::new(group.group_id.clone(), KeyType::Challenge)
                            .with(&provider)
                            .with(record.issued_at);
                        self.send_detached(Opcode::Put, key, value, provider.clone());
                        report.issued += 1;
                    }
                    Err(e) => warn!(provider = %provider, error = %e, "challenge encoding failed"),
                }
            }
        }
        if report.issued > 0 || report.abandoned > 0 {
            info!(
                issued = report.issued,
                empty = report.empty,
                abandoned = report.abandoned,
                "challenge tick"
            );
        }
        report
    }

    /// Abandon any in-flight challenge and record the next one.
    ///
    /// Returns the new challenge, if any, and whether one was abandoned.
    fn issue_challenge(
        &self,
        group: &Group,
        entry: &LedgerEntry,
        now: u64,
    ) -> (Option<ChallengeRecord>, bool) {
        let (stale, kind) = {
            let mut state = entry.challenge.lock();
            let kind = state.next_kind;
            state.next_kind = kind.next();
            (state.in_flight.take(), kind)
        };
        let abandoned = stale.map(|stale| {
            debug!(provider = %entry.provider, issued_at = stale.issued_at, "challenge abandoned");
            failed_outcome(group, entry, &stale)
        });

        let record = build_challenge(group, entry, &self.id, kind, now);

        let mut state = entry.challenge.lock();
        let was_abandoned = abandoned.is_some();
        if let Some(outcome) = abandoned {
            state.history.insert(outcome.issued_at, outcome);
        }
        state.in_flight.clone_from(&record);
        (record, was_abandoned)
    }

    /// Ask the user for its proof-verification key in the background.
    fn fetch_user_key(&self, group: &std::sync::Arc<Group>) {
        let key = MetaKey::new(group.group_id.clone(), KeyType::PublicKey);
        let request = keeper_transport::wire::MetaRequest::signed(
            Opcode::Get,
            &key,
            Vec::new(),
            &self.signing_key,
        );
        let messenger = self.messenger.clone();
        let group = group.clone();
        tokio::spawn(async move {
            match messenger.send_meta_request(request, &group.user_id).await {
                Ok(bytes) if !bytes.is_empty() => group.set_public_key(bytes),
                Ok(_) => debug!(user = %group.user_id, "user returned no key"),
                Err(e) => debug!(user = %group.user_id, error = %e, "key fetch failed"),
            }
        });
    }

    /// Accept a provider's proof for its outstanding challenge.
    ///
    /// Rejected when no in-flight challenge matches `reply.issued_at`, or when
    /// the challenge has outlived its lifetime. A failed verification is
    /// recorded in the history and nothing else changes.
    pub async fn handle_proof(
        &self,
        provider: &str,
        group_id: &str,
        reply: &ProofReply,
        now: u64,
    ) -> Result<ChallengeOutcome> {
        let group = self
            .groups
            .get(group_id)
            .ok_or_else(|| KeeperError::NotMyUser(group_id.to_string()))?;
        if group.contract().is_some_and(|c| c.is_expired(now)) {
            return Err(KeeperError::UpkeepingExpired(group_id.to_string()));
        }
        let entry = group
            .existing_ledger(provider)
            .ok_or_else(|| KeeperError::NotMyProvider(provider.to_string()))?;
        let public_key = group
            .public_key()
            .ok_or_else(|| KeeperError::WrongKey(format!("no verification key for {group_id}")))?;

        let lifetime = self.config.challenge_lifetime.as_secs();
        let record = {
            let mut state = entry.challenge.lock();
            let matches = state
                .in_flight
                .as_ref()
                .is_some_and(|r| r.issued_at == reply.issued_at);
            if !matches {
                return Err(KeeperError::WrongValue(format!(
                    "no outstanding challenge at {}",
                    reply.issued_at
                )));
            }
            let Some(record) = state.in_flight.take() else {
                return Err(KeeperError::EmptyData);
            };
            if now > record.issued_at.saturating_add(lifetime) {
                let outcome = failed_outcome(&group, &entry, &record);
                state.history.insert(outcome.issued_at, outcome);
                drop(state);
                self.persist_history_logged(&group, &entry);
                return Err(KeeperError::WrongValue(format!(
                    "challenge at {} expired",
                    record.issued_at
                )));
            }
            record
        };

        let verdict = match self
            .verifier
            .verify_challenge(&record, &reply.proof, &public_key)
        {
            Ok(verdict) => verdict,
            Err(e) => {
                warn!(provider = %provider, error = %e, "proof verification errored");
                ProofVerdict::default()
            }
        };

        let sampled = record.sampled_blocks();
        let outcome = if verdict.ok {
            let faulted: HashSet<&BlockId> = verdict.faulted.iter().collect();
            let healthy: Vec<&BlockId> = sampled.iter().filter(|b| !faulted.contains(b)).collect();
            for block in &healthy {
                if let Some(mut meta) = entry.blocks.get_mut(*block) {
                    meta.repair = 0;
                    meta.last_verified = meta.last_verified.max(now);
                }
            }
            self.peers.ensure(provider, PeerRole::Provider);
            let credit = self.peers.adjust_credit(provider, PROOF_CREDIT);
            debug!(provider = %provider, ?credit, faulted = faulted.len(), "proof accepted");
            ChallengeOutcome {
                issued_at: record.issued_at,
                kind: record.kind,
                sampled_len: blocks_len(&group, &entry, sampled.iter()),
                verified_len: blocks_len(&group, &entry, healthy.into_iter()),
                success: true,
            }
        } else {
            info!(provider = %provider, issued_at = record.issued_at, "proof rejected");
            failed_outcome(&group, &entry, &record)
        };

        {
            let mut state = entry.challenge.lock();
            if verdict.ok {
                for block in &verdict.proved {
                    state.faults.remove(block);
                }
                state.faults.extend(verdict.faulted.iter().cloned());
            }
            state.history.insert(outcome.issued_at, outcome.clone());
        }
        self.persist_history_logged(&group, &entry);
        Ok(outcome)
    }
}
