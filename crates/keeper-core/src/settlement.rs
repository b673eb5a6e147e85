//! Space-time settlement.
//!
//! Verified challenge history is integrated with the trapezoid rule into
//! byte-seconds, priced per MB-hour, committed to with a merkle root and
//! co-signed by at least ⌈2/3⌉ of the group's keepers before submission.

use std::collections::BTreeMap;
use std::sync::Arc;

use keeper_crypto::blake3::{self, contexts};
use keeper_crypto::ed25519::{Signature, VerifyingKey};
use keeper_transport::cbor;
use keeper_transport::key::{KeyType, MetaKey, Opcode};
use keeper_transport::messages::{SignReply, SignRequest};
use keeper_types::challenge::ChallengeOutcome;
use keeper_types::contract::UpKeepingInfo;
use keeper_types::payment::{equal_shares, required_signatures, PaymentRecord, SlotOutcome};
use keeper_types::{Hash, BYTES_PER_MB, SECS_PER_HOUR};
use parking_lot::Mutex;
use tracing::{debug, info, warn};

use crate::group::Group;
use crate::ledger::LedgerEntry;
use crate::service::Keeper;
use crate::{KeeperError, Result};

/// Space-time owed over one window.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ResultSummary {
    /// Time of the first data point.
    pub start: u64,
    /// Span from the first to the last data point.
    pub length: u64,
    /// Byte-seconds under the trapezoid curve.
    pub area: u128,
    /// Currency units owed.
    pub value: u128,
    /// Merkle root over the `(time, length)` points, `None` below two points.
    pub root: Option<Hash>,
    pub points: usize,
}

fn point_leaf(time: u64, length: u64) -> Hash {
    let mut bytes = [0u8; 16];
    bytes[..8].copy_from_slice(&time.to_le_bytes());
    bytes[8..].copy_from_slice(&length.to_le_bytes());
    blake3::merkle_leaf(&bytes)
}

/// Summarize payable history inside `[window_start, window_end)`.
///
/// Only successful data challenges count. Fewer than two points yield a
/// zero value and no root.
pub fn result_summary(
    history: &BTreeMap<u64, ChallengeOutcome>,
    window_start: u64,
    window_end: u64,
    price: u64,
) -> ResultSummary {
    if window_start >= window_end {
        return ResultSummary::default();
    }
    let points: Vec<(u64, u64)> = history
        .range(window_start..window_end)
        .filter(|(_, o)| o.is_payable())
        .map(|(t, o)| (*t, o.verified_len))
        .collect();
    let (Some(first), Some(last)) = (points.first(), points.last()) else {
        return ResultSummary::default();
    };
    if points.len() < 2 {
        return ResultSummary {
            points: points.len(),
            ..ResultSummary::default()
        };
    }

    // Sum (dt * (l0 + l1)) and halve once to keep integer precision.
    let doubled: u128 = points
        .windows(2)
        .map(|w| {
            let (t0, l0) = w[0];
            let (t1, l1) = w[1];
            u128::from(t1 - t0) * (u128::from(l0) + u128::from(l1))
        })
        .sum();
    let area = doubled / 2;
    let value = area * u128::from(price) / (BYTES_PER_MB * SECS_PER_HOUR);

    let leaves: Vec<Hash> = points.iter().map(|(t, l)| point_leaf(*t, *l)).collect();

    ResultSummary {
        start: first.0,
        length: last.0 - first.0,
        area,
        value,
        root: blake3::merkle_root(&leaves),
        points: points.len(),
    }
}

/// Digest every keeper signs for a payment.
///
/// Covers group, provider, start, length, value, root and share weights.
pub fn payment_digest(payment: &PaymentRecord) -> Hash {
    let mut shares = Vec::new();
    for share in &payment.share_weights {
        shares.extend(blake3::encode_multi_field(&[
            share.keeper.as_bytes(),
            &share.weight.to_le_bytes(),
        ]));
    }
    let input = blake3::encode_multi_field(&[
        payment.group_id.as_bytes(),
        payment.provider.as_bytes(),
        &payment.start.to_le_bytes(),
        &payment.length.to_le_bytes(),
        &payment.value.to_le_bytes(),
        &payment.root,
        &shares,
    ]);
    blake3::derive_key(contexts::PAYMENT_DIGEST, &input)
}

/// Counts from one settlement tick.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SettleReport {
    pub proposed: usize,
    pub submitted: usize,
    pub rerequested: usize,
    pub stopped: usize,
    pub dropped_groups: usize,
}

impl Keeper {
    /// One settlement pass over every group this keeper serves.
    pub async fn settle_tick(self: &Arc<Self>, now: u64) -> SettleReport {
        let mut report = SettleReport::default();
        for group in self.groups.all() {
            if group.is_self_owned() {
                continue;
            }
            let Some(contract) = group.contract() else {
                continue;
            };
            let providers = group.providers();
            for provider in &providers {
                let entry = group.ledger(provider);
                if let Err(e) = self.settle_provider(&group, &entry, &contract, now, &mut report).await {
                    if e.is_transient() {
                        debug!(group = %group.group_id, provider = %provider, error = %e, "settlement deferred");
                    } else {
                        warn!(group = %group.group_id, provider = %provider, error = %e, "settlement failed");
                    }
                }
            }

            let all_stopped = !providers.is_empty()
                && providers
                    .iter()
                    .all(|p| group.existing_ledger(p).is_some_and(|e| e.is_stopped()));
            if all_stopped {
                info!(group = %group.group_id, "upkeeping finished, dropping group");
                self.drop_group(&group.group_id);
                report.dropped_groups += 1;
            }
        }
        report
    }

    async fn settle_provider(
        self: &Arc<Self>,
        group: &Group,
        entry: &LedgerEntry,
        contract: &UpKeepingInfo,
        now: u64,
        report: &mut SettleReport,
    ) -> Result<()> {
        if entry.is_stopped() {
            return Ok(());
        }
        let last_end = entry
            .last_payment()
            .map_or(contract.start_time, |p| p.end());
        entry.prune_history(last_end.max(now.saturating_sub(self.config.pay_window)));

        let is_master = group.master_for(&entry.provider).as_deref() == Some(self.id.as_str());
        let pending = entry.pending_payment();

        if is_master {
            if let Some(pending) = &pending {
                let payment = pending.lock().clone();
                if payment.is_final() {
                    self.submit_payment(group, entry, payment).await?;
                    report.submitted += 1;
                    return Ok(());
                }
            }
        }

        if contract.is_expired(now) {
            let mut state = entry.payment.lock();
            state.stopped = true;
            state.pending = None;
            report.stopped += 1;
            debug!(group = %group.group_id, provider = %entry.provider, "settlement stopped");
            return Ok(());
        }

        if !is_master {
            return Ok(());
        }

        match pending {
            Some(pending) => {
                let payment = pending.lock().clone();
                let missing: Vec<String> = payment
                    .missing_signers()
                    .into_iter()
                    .filter(|k| *k != self.id)
                    .collect();
                self.request_signatures(&payment, missing);
                report.rerequested += 1;
            }
            None => {
                if self.propose_payment(group, entry, contract, last_end, now)?.is_some() {
                    report.proposed += 1;
                }
            }
        }
        Ok(())
    }

    /// Build, self-sign and broadcast a payment for the current window.
    fn propose_payment(
        self: &Arc<Self>,
        group: &Group,
        entry: &LedgerEntry,
        contract: &UpKeepingInfo,
        last_end: u64,
        now: u64,
    ) -> Result<Option<PaymentRecord>> {
        let window_start = last_end.max(now.saturating_sub(self.config.pay_window));
        let summary = result_summary(&entry.history(), window_start, now, contract.price);
        let Some(root) = summary.root else {
            return Ok(None);
        };
        if summary.value == 0 {
            debug!(provider = %entry.provider, area = %summary.area, "nothing owed yet");
            return Ok(None);
        }

        let keepers = group.keepers();
        let mut payment = PaymentRecord {
            upkeeping_address: contract.address.clone(),
            user_id: group.user_id.clone(),
            group_id: group.group_id.clone(),
            provider: entry.provider.clone(),
            start: summary.start,
            length: summary.length,
            value: summary.value,
            root,
            share_weights: equal_shares(&keepers),
            signatures: vec![None; keepers.len()],
            needed: required_signatures(keepers.len()),
            signers: keepers,
        };
        let signature = self.signing_key.sign(&payment_digest(&payment)).to_bytes();
        if payment.fill_slot(&self.id, signature) == SlotOutcome::NotMember {
            return Err(KeeperError::NotMyKeeper(self.id.clone()));
        }

        let others: Vec<String> = payment
            .signers
            .iter()
            .filter(|k| **k != self.id)
            .cloned()
            .collect();
        entry.payment.lock().pending = Some(Arc::new(Mutex::new(payment.clone())));
        info!(
            group = %payment.group_id,
            provider = %payment.provider,
            start = payment.start,
            length = payment.length,
            value = %payment.value,
            needed = payment.needed,
            "payment proposed"
        );
        self.request_signatures(&payment, others);
        Ok(Some(payment))
    }

    /// Send sign requests; replies are slotted as they arrive.
    fn request_signatures(self: &Arc<Self>, payment: &PaymentRecord, keepers: Vec<String>) {
        if keepers.is_empty() {
            return;
        }
        let request = SignRequest {
            payment: payment.clone(),
            master: self.id.clone(),
        };
        let value = match cbor::to_vec(&request) {
            Ok(value) => value,
            Err(e) => {
                warn!(error = %e, "sign request encoding failed");
                return;
            }
        };
        let key = MetaKey::new(payment.group_id.clone(), KeyType::Sign)
            .with(&payment.provider)
            .with(payment.start);

        for keeper in keepers {
            let this = self.clone();
            let key = key.clone();
            let value = value.clone();
            tokio::spawn(async move {
                let raw = match this.send(Opcode::Put, &key, value, &keeper).await {
                    Ok(raw) => raw,
                    Err(e) => {
                        debug!(keeper = %keeper, error = %e, "sign request failed");
                        return;
                    }
                };
                // An empty reply means the signature comes back as its own put.
                if raw.is_empty() {
                    return;
                }
                match cbor::from_slice::<SignReply>(&raw) {
                    Ok(reply) => {
                        if let Err(e) = this.handle_get_sign(&reply).await {
                            debug!(keeper = %keeper, error = %e, "signature dropped");
                        }
                    }
                    Err(e) => debug!(keeper = %keeper, error = %e, "bad sign reply"),
                }
            });
        }
    }

    async fn submit_payment(
        &self,
        group: &Group,
        entry: &LedgerEntry,
        payment: PaymentRecord,
    ) -> Result<()> {
        self.chain.space_time_pay(&payment).await?;
        info!(
            group = %payment.group_id,
            provider = %payment.provider,
            start = payment.start,
            length = payment.length,
            value = %payment.value,
            "payment submitted"
        );
        {
            let mut state = entry.payment.lock();
            state.last = Some(payment.clone());
            state.pending = None;
        }
        entry.prune_history(payment.end());
        self.persist_last_payment_logged(group, entry, &payment);
        self.persist_history_logged(group, entry);
        Ok(())
    }

    /// Co-sign a payment proposed by the master.
    pub fn handle_put_sign(&self, from: &str, request: &SignRequest) -> Result<SignReply> {
        let payment = &request.payment;
        if from != request.master {
            return Err(KeeperError::WrongKey(format!("{from} is not the proposing master")));
        }
        let group = self
            .groups
            .get(&payment.group_id)
            .ok_or_else(|| KeeperError::NotMyUser(payment.group_id.clone()))?;
        if !group.has_keeper(&self.id) || payment.slot_of(&self.id).is_none() {
            return Err(KeeperError::NotMyKeeper(self.id.clone()));
        }
        if !group.has_keeper(from) {
            return Err(KeeperError::NotMyKeeper(from.to_string()));
        }
        if !group.has_provider(&payment.provider) {
            return Err(KeeperError::NotMyProvider(payment.provider.clone()));
        }
        if group.master_for(&payment.provider).as_deref() != Some(from) {
            return Err(KeeperError::WrongKey(format!(
                "{from} is not the master for {}",
                payment.provider
            )));
        }
        let contract = group
            .contract()
            .ok_or_else(|| KeeperError::NotMyUser(payment.group_id.clone()))?;
        let entry = group
            .existing_ledger(&payment.provider)
            .ok_or_else(|| KeeperError::WrongValue(format!("no history for {}", payment.provider)))?;

        let local = result_summary(
            &entry.history(),
            payment.start,
            payment.end().saturating_add(1),
            contract.price,
        );
        let digest = payment_digest(payment);
        let mut state = entry.payment.lock();
        let resigning = state
            .cosigned
            .as_ref()
            .is_some_and(|c| payment_digest(c) == digest);
        if !resigning {
            let paid_end = state
                .last
                .as_ref()
                .map_or(contract.start_time, PaymentRecord::end);
            let covered_end = state
                .cosigned
                .as_ref()
                .map_or(paid_end, |c| c.end().max(paid_end));
            if payment.start < covered_end {
                return Err(KeeperError::WrongValue(format!(
                    "payment from {} overlaps space-time settled up to {covered_end}",
                    payment.start
                )));
            }
            // Members never vouch for more than their own history shows.
            if payment.value > local.value {
                return Err(KeeperError::WrongValue(format!(
                    "payment of {} exceeds the {} this keeper can attest",
                    payment.value, local.value
                )));
            }
            state.cosigned = Some(payment.clone());
        }
        drop(state);

        let signature = self.signing_key.sign(&digest).to_bytes();
        debug!(group = %payment.group_id, provider = %payment.provider, start = payment.start, "payment co-signed");
        Ok(SignReply {
            keeper: self.id.clone(),
            group_id: payment.group_id.clone(),
            provider: payment.provider.clone(),
            start: payment.start,
            signature,
        })
    }

    /// Slot a returned signature into the pending payment.
    ///
    /// Non-members and duplicates leave the payment unchanged; a signature that
    /// does not verify is an error.
    pub async fn handle_get_sign(&self, reply: &SignReply) -> Result<SlotOutcome> {
        let group = self
            .groups
            .get(&reply.group_id)
            .ok_or_else(|| KeeperError::NotMyUser(reply.group_id.clone()))?;
        let entry = group
            .existing_ledger(&reply.provider)
            .ok_or_else(|| KeeperError::NotMyProvider(reply.provider.clone()))?;
        let pending = entry
            .pending_payment()
            .ok_or_else(|| KeeperError::WrongValue("no pending payment".to_string()))?;
        if !group.has_keeper(&reply.keeper) {
            debug!(keeper = %reply.keeper, "signature from non-member ignored");
            return Ok(SlotOutcome::NotMember);
        }
        let public_key = self.keeper_public_key(&reply.keeper).await?;

        let mut payment = pending.lock();
        if payment.start != reply.start {
            return Err(KeeperError::WrongValue(format!(
                "signature for {} but pending payment starts at {}",
                reply.start, payment.start
            )));
        }
        public_key
            .verify(&payment_digest(&payment), &Signature::from_bytes(&reply.signature))
            .map_err(|_| KeeperError::WrongSign(reply.keeper.clone()))?;

        let outcome = payment.fill_slot(&reply.keeper, reply.signature);
        debug!(keeper = %reply.keeper, ?outcome, needed = payment.needed, "signature slotted");
        Ok(outcome)
    }

    /// A keeper's verifying key from the directory, else from the ledger.
    pub(crate) async fn keeper_public_key(&self, keeper: &str) -> Result<VerifyingKey> {
        if let Some(bytes) = self.peers.public_key(keeper) {
            return Ok(VerifyingKey::from_bytes(&bytes)?);
        }
        let info = self
            .chain
            .get_keeper_info(keeper)
            .await?
            .ok_or_else(|| KeeperError::WrongSign(format!("unknown keeper {keeper}")))?;
        self.peers.upsert_record(&info.record);
        Ok(VerifyingKey::from_bytes(&info.record.public_key)?)
    }
}
