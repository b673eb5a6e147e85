//! Collaborators for a keeper running without a peer network or proof library.
//!
//! Outbound requests fail as unreachable and every proof is refused, so a
//! standalone keeper never pays for storage it could not check.

use async_trait::async_trait;
use keeper_core::external::{ProofVerdict, ProofVerifier};
use keeper_core::Result;
use keeper_crypto::ed25519::SigningKey;
use keeper_db::KvStore;
use keeper_transport::key::{KeyType, MetaKey};
use keeper_transport::messages::ProbeReply;
use keeper_transport::wire::MetaRequest;
use keeper_transport::{Messenger, TransportError};
use keeper_types::challenge::ChallengeRecord;
use tracing::{debug, info};

/// A messenger with no network attached.
pub struct Unattached;

#[async_trait]
impl Messenger for Unattached {
    async fn send_meta_request(
        &self,
        request: MetaRequest,
        peer: &str,
    ) -> keeper_transport::Result<Vec<u8>> {
        debug!(peer = %peer, key = %request.key, "no network attached");
        Err(TransportError::Unreachable(peer.to_string()))
    }

    async fn probe(&self, peer: &str) -> keeper_transport::Result<ProbeReply> {
        Err(TransportError::Unreachable(peer.to_string()))
    }
}

/// Refuses every proof.
pub struct RejectAll;

impl ProofVerifier for RejectAll {
    fn verify_challenge(
        &self,
        record: &ChallengeRecord,
        _proof: &[u8],
        _public_key: &[u8],
    ) -> Result<ProofVerdict> {
        debug!(provider = %record.provider, issued_at = record.issued_at, "no proof library, refusing proof");
        Ok(ProofVerdict::default())
    }
}

/// Load the keeper's signing key from the store, creating it on first start.
pub fn load_or_create_identity(store: &dyn KvStore) -> anyhow::Result<SigningKey> {
    let key = MetaKey::new("local", KeyType::Identity).to_string();
    if let Some(raw) = store.get(&key)? {
        let bytes: [u8; 32] = raw
            .as_slice()
            .try_into()
            .map_err(|_| anyhow::anyhow!("stored identity has {} bytes, expected 32", raw.len()))?;
        return Ok(SigningKey::from_bytes(&bytes));
    }
    let signing_key = SigningKey::generate();
    store.put(&key, &signing_key.to_bytes())?;
    info!("generated new keeper identity");
    Ok(signing_key)
}

#[cfg(test)]
mod tests {
    use super::*;
    use keeper_db::MemoryStore;

    #[test]
    fn test_identity_is_stable() {
        let store = MemoryStore::new();
        let first = load_or_create_identity(&store).expect("create");
        let second = load_or_create_identity(&store).expect("load");
        assert_eq!(first.to_bytes(), second.to_bytes());
    }

    #[test]
    fn test_truncated_identity_is_rejected() {
        let store = MemoryStore::new();
        store.put("local/identity", &[1, 2, 3]).expect("put");
        assert!(load_or_create_identity(&store).is_err());
    }

    #[tokio::test]
    async fn test_unattached_is_unreachable() {
        assert!(matches!(
            Unattached.probe("p1").await,
            Err(TransportError::Unreachable(_))
        ));
    }
}
