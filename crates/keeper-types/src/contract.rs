//! Ledger views of contracts and registered peers.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::peer::PeerRole;
use crate::Hash;

/// Snapshot of a user's upkeeping contract.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpKeepingInfo {
    /// Contract address on the ledger.
    pub address: String,
    pub user_id: String,
    pub query_id: String,
    pub keepers: Vec<String>,
    pub providers: Vec<String>,
    /// Price per MB-hour in currency units.
    pub price: u64,
    pub start_time: u64,
    pub end_time: u64,
}

impl UpKeepingInfo {
    /// Whether the contract is in force at `now`.
    pub fn is_live(&self, now: u64) -> bool {
        self.start_time <= now && now < self.end_time
    }

    /// Whether the contract window has fully elapsed at `now`.
    pub fn is_expired(&self, now: u64) -> bool {
        now >= self.end_time
    }
}

/// The user's storage query as recorded on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct QueryInfo {
    pub query_id: String,
    pub user_id: String,
    pub capacity: u64,
    pub duration: u64,
    pub price: u64,
    pub keeper_count: u32,
    pub provider_count: u32,
    pub completed: bool,
}

/// A peer as registered on the ledger.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct PeerRecord {
    pub id: String,
    pub role: PeerRole,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub public_key: [u8; 32],
    pub capacity: u64,
    pub address: Option<String>,
}

/// Registered keeper details.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct KeeperInfo {
    pub record: PeerRecord,
    pub deposit: u64,
    pub banned: bool,
}

/// Root commitment the user registered for a query.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RootInfo {
    pub query_id: String,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub root: Hash,
    pub updated_at: u64,
}
