//! Peer records held in the peer directory.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::{CREDIT_MAX, CREDIT_MIN, DEFAULT_PROVIDER_CREDIT};

/// Role a peer plays in the network.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum PeerRole {
    Keeper,
    Provider,
    User,
}

/// Local view of a keeper or provider.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerInfo {
    pub id: String,
    pub role: PeerRole,
    pub online: bool,
    /// Unix seconds of the last successful probe.
    pub last_seen: u64,
    /// Reputation, always within [`CREDIT_MIN`, `CREDIT_MAX`].
    pub credit: i32,
    /// Advertised capacity in bytes.
    pub capacity: u64,
    pub address: Option<String>,
    #[serde_as(as = "Option<serde_with::hex::Hex>")]
    pub public_key: Option<[u8; 32]>,
}

impl PeerInfo {
    /// A peer that has never been probed.
    pub fn new(id: impl Into<String>, role: PeerRole) -> Self {
        let credit = match role {
            PeerRole::Provider => DEFAULT_PROVIDER_CREDIT,
            PeerRole::Keeper | PeerRole::User => 0,
        };
        Self {
            id: id.into(),
            role,
            online: false,
            last_seen: 0,
            credit,
            capacity: 0,
            address: None,
            public_key: None,
        }
    }

    /// Apply a credit delta, clamped to the allowed range.
    ///
    /// Returns the new credit.
    pub fn adjust_credit(&mut self, delta: i32) -> i32 {
        self.credit = clamp_credit(self.credit.saturating_add(delta));
        self.credit
    }

    /// Record a successful probe.
    pub fn mark_seen(&mut self, now: u64, address: Option<String>) {
        self.online = true;
        self.last_seen = now;
        if let Some(addr) = address {
            self.address = Some(addr);
        }
    }

    /// Whether this peer may receive new data: online with non-negative credit.
    pub fn is_eligible(&self) -> bool {
        self.online && self.credit >= 0
    }
}

/// Clamp a raw credit value into the allowed range.
pub fn clamp_credit(credit: i32) -> i32 {
    credit.clamp(CREDIT_MIN, CREDIT_MAX)
}
