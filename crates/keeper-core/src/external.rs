//! Seams to the proof system and the ledger.

use async_trait::async_trait;
use keeper_types::block::BlockId;
use keeper_types::challenge::ChallengeRecord;
use keeper_types::contract::{KeeperInfo, PeerRecord, QueryInfo, RootInfo, UpKeepingInfo};
use keeper_types::payment::PaymentRecord;

use crate::Result;

/// Result of verifying one proof.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct ProofVerdict {
    pub ok: bool,
    /// Sampled blocks the proof covers.
    pub proved: Vec<BlockId>,
    /// Sampled blocks the provider admitted or was shown to have lost.
    pub faulted: Vec<BlockId>,
}

/// The external proof-of-storage library.
///
/// Verification is CPU-bound and synchronous.
pub trait ProofVerifier: Send + Sync {
    fn verify_challenge(
        &self,
        record: &ChallengeRecord,
        proof: &[u8],
        public_key: &[u8],
    ) -> Result<ProofVerdict>;
}

/// Read and payment access to the ledger.
///
/// `Ok(None)` means the ledger confirmed the entity is absent; errors mean the
/// ledger could not be asked.
#[async_trait]
pub trait ChainClient: Send + Sync {
    async fn get_upkeeping(&self, user_id: &str, query_id: &str) -> Result<Option<UpKeepingInfo>>;

    async fn get_query_info(&self, user_id: &str, query_id: &str) -> Result<Option<QueryInfo>>;

    async fn get_all_keepers(&self) -> Result<Vec<PeerRecord>>;

    async fn get_all_providers(&self) -> Result<Vec<PeerRecord>>;

    async fn get_keeper_info(&self, keeper_id: &str) -> Result<Option<KeeperInfo>>;

    async fn get_root(&self, query_id: &str) -> Result<Option<RootInfo>>;

    /// A registered user and its envelope key.
    async fn get_user(&self, user_id: &str) -> Result<Option<PeerRecord>>;

    /// Keepers that manage `provider`, when the ledger tracks it.
    async fn get_provider_keepers(&self, _provider: &str) -> Result<Option<Vec<String>>> {
        Ok(None)
    }

    /// Submit a final payment.
    async fn space_time_pay(&self, payment: &PaymentRecord) -> Result<()>;
}
