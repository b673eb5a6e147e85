//! Shared fixtures: an in-process network, a scripted ledger and verifier.

#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use keeper_core::external::{ChainClient, ProofVerdict, ProofVerifier};
use keeper_core::service::Collaborators;
use keeper_core::{now_secs, CoreConfig, Keeper, KeeperError, Result};
use keeper_crypto::ed25519::{derive_node_id, KeyPair, SigningKey};
use keeper_db::MemoryStore;
use keeper_transport::key::MetaKey;
use keeper_transport::messages::ProbeReply;
use keeper_transport::wire::MetaRequest;
use keeper_transport::{Messenger, TransportError};
use keeper_types::challenge::ChallengeRecord;
use keeper_types::contract::{KeeperInfo, PeerRecord, QueryInfo, RootInfo, UpKeepingInfo};
use keeper_types::payment::PaymentRecord;
use keeper_types::peer::PeerRole;
use parking_lot::Mutex;

type PeerScript = Box<dyn Fn(&MetaRequest) -> Option<Vec<u8>> + Send + Sync>;

/// Routes requests between keepers and scripted non-keeper peers.
#[derive(Default)]
pub struct LocalNet {
    keepers: Mutex<HashMap<String, Arc<Keeper>>>,
    scripts: Mutex<HashMap<String, PeerScript>>,
    sent: Mutex<Vec<(String, String, MetaRequest)>>,
}

impl LocalNet {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn attach(&self, keeper: Arc<Keeper>) {
        self.keepers.lock().insert(keeper.id().to_string(), keeper);
    }

    /// Answer requests to `peer` with `script`.
    pub fn script<F>(&self, peer: &str, script: F)
    where
        F: Fn(&MetaRequest) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        self.scripts.lock().insert(peer.to_string(), Box::new(script));
    }

    /// `(from, to, request)` for every delivered request.
    pub fn sent(&self) -> Vec<(String, String, MetaRequest)> {
        self.sent.lock().clone()
    }

    pub fn sent_to(&self, peer: &str, tag: &str) -> Vec<MetaRequest> {
        self.sent()
            .into_iter()
            .filter(|(_, to, r)| {
                to == peer
                    && r
                        .key
                        .parse::<MetaKey>()
                        .map(|k| k.key_type.as_str() == tag)
                        .unwrap_or(false)
            })
            .map(|(_, _, r)| r)
            .collect()
    }

    async fn deliver(&self, from: &str, request: MetaRequest, peer: &str) -> keeper_transport::Result<Vec<u8>> {
        self.sent
            .lock()
            .push((from.to_string(), peer.to_string(), request.clone()));
        let keeper = self.keepers.lock().get(peer).cloned();
        if let Some(keeper) = keeper {
            return keeper
                .handle_request(from, &request, now_secs())
                .await
                .map_err(|e| TransportError::Rejected {
                    peer: peer.to_string(),
                    reason: e.to_string(),
                });
        }
        let scripts = self.scripts.lock();
        match scripts.get(peer) {
            Some(script) => Ok(script(&request).unwrap_or_default()),
            None => Err(TransportError::Unreachable(peer.to_string())),
        }
    }
}

/// One keeper's view of the network.
pub struct Endpoint {
    net: Arc<LocalNet>,
    from: String,
}

#[async_trait]
impl Messenger for Endpoint {
    async fn send_meta_request(&self, request: MetaRequest, peer: &str) -> keeper_transport::Result<Vec<u8>> {
        self.net.deliver(&self.from, request, peer).await
    }

    async fn probe(&self, peer: &str) -> keeper_transport::Result<ProbeReply> {
        let known = self.net.keepers.lock().contains_key(peer) || self.net.scripts.lock().contains_key(peer);
        if known {
            Ok(ProbeReply::default())
        } else {
            Err(TransportError::Unreachable(peer.to_string()))
        }
    }
}

/// The ledger every keeper in a test shares.
#[derive(Default)]
pub struct SharedChain {
    upkeeping: Mutex<HashMap<String, UpKeepingInfo>>,
    queries: Mutex<HashMap<String, QueryInfo>>,
    peers: Mutex<Vec<PeerRecord>>,
    paid: Mutex<Vec<PaymentRecord>>,
}

impl SharedChain {
    pub fn new() -> Arc<Self> {
        Arc::new(Self::default())
    }

    pub fn set_upkeeping(&self, info: UpKeepingInfo) {
        self.upkeeping.lock().insert(info.query_id.clone(), info);
    }

    pub fn register(&self, id: &str, role: PeerRole, public_key: [u8; 32]) {
        self.peers.lock().push(PeerRecord {
            id: id.to_string(),
            role,
            public_key,
            capacity: 1 << 40,
            address: None,
        });
    }

    pub fn paid(&self) -> Vec<PaymentRecord> {
        self.paid.lock().clone()
    }
}

#[async_trait]
impl ChainClient for SharedChain {
    async fn get_upkeeping(&self, _user_id: &str, query_id: &str) -> Result<Option<UpKeepingInfo>> {
        Ok(self.upkeeping.lock().get(query_id).cloned())
    }

    async fn get_query_info(&self, _user_id: &str, query_id: &str) -> Result<Option<QueryInfo>> {
        Ok(self.queries.lock().get(query_id).cloned())
    }

    async fn get_all_keepers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.by_role(PeerRole::Keeper))
    }

    async fn get_all_providers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.by_role(PeerRole::Provider))
    }

    async fn get_keeper_info(&self, keeper_id: &str) -> Result<Option<KeeperInfo>> {
        Ok(self
            .by_role(PeerRole::Keeper)
            .into_iter()
            .find(|p| p.id == keeper_id)
            .map(|record| KeeperInfo {
                record,
                deposit: 0,
                banned: false,
            }))
    }

    async fn get_root(&self, _query_id: &str) -> Result<Option<RootInfo>> {
        Ok(None)
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self.by_role(PeerRole::User).into_iter().find(|p| p.id == user_id))
    }

    async fn space_time_pay(&self, payment: &PaymentRecord) -> Result<()> {
        if !payment.is_final() {
            return Err(KeeperError::Chain("payment is not final".to_string()));
        }
        self.paid.lock().push(payment.clone());
        Ok(())
    }
}

impl SharedChain {
    fn by_role(&self, role: PeerRole) -> Vec<PeerRecord> {
        self.peers
            .lock()
            .iter()
            .filter(|p| p.role == role)
            .cloned()
            .collect()
    }
}

/// Accepts exactly the proof bytes `b"good"`.
pub struct ExactProof;

impl ProofVerifier for ExactProof {
    fn verify_challenge(&self, record: &ChallengeRecord, proof: &[u8], _public_key: &[u8]) -> Result<ProofVerdict> {
        if proof != b"good" {
            return Ok(ProofVerdict::default());
        }
        Ok(ProofVerdict {
            ok: true,
            proved: record.sampled_blocks(),
            faulted: Vec::new(),
        })
    }
}

/// A keeper attached to `net`, registered on `chain` and ready for requests.
pub fn spawn_keeper(net: &Arc<LocalNet>, chain: &Arc<SharedChain>, config: CoreConfig) -> Arc<Keeper> {
    let signing_key = SigningKey::generate();
    let id = derive_node_id(&signing_key.verifying_key());
    chain.register(&id, PeerRole::Keeper, signing_key.verifying_key().to_bytes());
    let keeper = Keeper::new(
        signing_key,
        config,
        Collaborators {
            store: Arc::new(MemoryStore::new()),
            messenger: Arc::new(Endpoint {
                net: net.clone(),
                from: id,
            }),
            chain: chain.clone(),
            verifier: Arc::new(ExactProof),
        },
    );
    keeper.set_ready();
    net.attach(keeper.clone());
    keeper
}

/// A provider or user identity.
pub struct Actor {
    pub id: String,
    pub keys: KeyPair,
}

impl Actor {
    pub fn new(id: &str) -> Self {
        Self {
            id: id.to_string(),
            keys: KeyPair::generate(),
        }
    }

    /// A user known to the ledger.
    pub fn user(id: &str, chain: &SharedChain) -> Self {
        let actor = Self::new(id);
        chain.register(id, PeerRole::User, actor.keys.verifying_key.to_bytes());
        actor
    }

    /// A provider known to the ledger.
    pub fn provider(id: &str, chain: &SharedChain) -> Self {
        let actor = Self::new(id);
        chain.register(id, PeerRole::Provider, actor.keys.verifying_key.to_bytes());
        actor
    }

    pub fn request(&self, op: keeper_transport::key::Opcode, key: &str, value: Vec<u8>) -> MetaRequest {
        let key: MetaKey = key.parse().expect("key");
        MetaRequest::signed(op, &key, value, &self.keys.signing_key)
    }
}

/// A contract for user `u1`.
pub fn contract(query_id: &str, keepers: &[String], providers: &[&str], price: u64, end: u64) -> UpKeepingInfo {
    UpKeepingInfo {
        address: format!("0xup-{query_id}"),
        user_id: "u1".to_string(),
        query_id: query_id.to_string(),
        keepers: keepers.to_vec(),
        providers: providers.iter().map(|p| p.to_string()).collect(),
        price,
        start_time: 0,
        end_time: end,
    }
}
