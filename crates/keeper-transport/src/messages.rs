//! Request and reply payloads.
//!
//! Each type here is the CBOR value of one structured key. Challenges travel as
//! [`ChallengeRecord`](keeper_types::challenge::ChallengeRecord) directly.

use keeper_types::block::BlockId;
use keeper_types::layout::BucketLayout;
use keeper_types::payment::PaymentRecord;
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

/// Status string of a successful repair.
pub const REPAIR_STATUS_OK: &str = "ok";

/// A provider's answer to a challenge, sent as `Put <groupID>/proof/<provider>/<issuedAt>`.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProofReply {
    pub issued_at: u64,
    #[serde_as(as = "serde_with::Bytes")]
    pub proof: Vec<u8>,
}

/// A surviving chunk the repairing provider may fetch from.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairSource {
    pub block: BlockId,
    pub provider: String,
}

/// Ask a provider to reconstruct `block` from `sources`.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairRequest {
    pub block: BlockId,
    pub sources: Vec<RepairSource>,
    pub keeper: String,
}

/// Outcome of a repair.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct RepairReply {
    pub status: String,
    pub block: BlockId,
    /// Provider now holding the block.
    pub provider: String,
    /// Highest segment index stored.
    pub offset: u64,
}

impl RepairReply {
    pub fn ok(block: BlockId, provider: impl Into<String>, offset: u64) -> Self {
        Self {
            status: REPAIR_STATUS_OK.to_string(),
            block,
            provider: provider.into(),
            offset,
        }
    }

    pub fn is_ok(&self) -> bool {
        self.status == REPAIR_STATUS_OK
    }
}

/// Master to member: co-sign this payment.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignRequest {
    pub payment: PaymentRecord,
    pub master: String,
}

/// Member to master: a signature over a payment digest.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignReply {
    pub keeper: String,
    pub group_id: String,
    pub provider: String,
    pub start: u64,
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: [u8; 64],
}

/// User to keeper: where a block was stored.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockPosUpdate {
    pub provider: String,
    pub offset: u64,
}

/// User to keeper: layout and stripe count of a bucket.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketUpdate {
    pub layout: BucketLayout,
    pub stripes: u64,
}

/// User to keeper: the user's session is alive.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionHeartbeat {
    pub session_id: String,
    pub at: u64,
}

/// Storage usage for a group, or one provider within it.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct StorageStats {
    pub group_id: String,
    pub provider: Option<String>,
    pub used_bytes: u64,
    pub blocks: u64,
    pub faults: u64,
}

/// User to keeper: how many providers to admit.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderQuery {
    pub count: usize,
}

/// Admitted providers, best first.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProviderList {
    pub providers: Vec<String>,
}

/// Answer to a liveness probe.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProbeReply {
    /// The peer's current address when it has been re-mapped.
    pub address: Option<String>,
}
