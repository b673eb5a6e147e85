//! Space-time payment records.
//!
//! A payment covers `[start, start + length)` for one provider of one group.
//! It carries one signature slot per group keeper and becomes final once
//! `needed` reaches zero.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::Hash;

/// A keeper's share of the settlement fee.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShareWeight {
    pub keeper: String,
    pub weight: u32,
}

/// Result of slotting a signature into a payment.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum SlotOutcome {
    /// Signature stored; `remaining` more are needed.
    Filled { remaining: usize },
    /// The keeper already signed; nothing changed.
    Duplicate,
    /// The signer is not one of the payment's keepers.
    NotMember,
}

/// A proposed or settled payment.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PaymentRecord {
    pub upkeeping_address: String,
    pub user_id: String,
    pub group_id: String,
    pub provider: String,
    pub start: u64,
    pub length: u64,
    pub value: u128,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub root: Hash,
    pub share_weights: Vec<ShareWeight>,
    /// Keeper IDs in slot order.
    pub signers: Vec<String>,
    #[serde_as(as = "Vec<Option<serde_with::Bytes>>")]
    pub signatures: Vec<Option<[u8; 64]>>,
    /// Signatures still required before submission.
    pub needed: usize,
}

/// Signatures required from `keepers` cooperating keepers: ⌈2/3 × keepers⌉.
pub fn required_signatures(keepers: usize) -> usize {
    (2 * keepers).div_ceil(3)
}

/// Equal fee shares for every keeper, in keeper order.
pub fn equal_shares(keepers: &[String]) -> Vec<ShareWeight> {
    keepers
        .iter()
        .map(|k| ShareWeight {
            keeper: k.clone(),
            weight: 1,
        })
        .collect()
}

impl PaymentRecord {
    /// The start time of the cycle after this payment.
    pub fn end(&self) -> u64 {
        self.start.saturating_add(self.length)
    }

    /// Whether enough signatures have been collected.
    pub fn is_final(&self) -> bool {
        self.needed == 0
    }

    /// Slot index of a keeper.
    pub fn slot_of(&self, keeper: &str) -> Option<usize> {
        self.signers.iter().position(|k| k == keeper)
    }

    /// Keepers whose slot is still empty.
    pub fn missing_signers(&self) -> Vec<String> {
        self.signers
            .iter()
            .zip(&self.signatures)
            .filter(|(_, sig)| sig.is_none())
            .map(|(k, _)| k.clone())
            .collect()
    }

    /// Store a signature for `keeper`, decrementing `needed`.
    ///
    /// The caller must have verified the signature already.
    pub fn fill_slot(&mut self, keeper: &str, signature: [u8; 64]) -> SlotOutcome {
        let Some(index) = self.slot_of(keeper) else {
            return SlotOutcome::NotMember;
        };
        match self.signatures.get_mut(index) {
            Some(Some(_)) => SlotOutcome::Duplicate,
            Some(slot) => {
                *slot = Some(signature);
                self.needed = self.needed.saturating_sub(1);
                SlotOutcome::Filled {
                    remaining: self.needed,
                }
            }
            None => SlotOutcome::NotMember,
        }
    }

    /// Collected signatures in slot order, skipping empty slots.
    pub fn collected(&self) -> Vec<(String, [u8; 64])> {
        self.signers
            .iter()
            .zip(&self.signatures)
            .filter_map(|(k, sig)| sig.map(|s| (k.clone(), s)))
            .collect()
    }
}
