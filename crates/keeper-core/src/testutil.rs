//! In-memory collaborators for unit tests.

use std::collections::{HashMap, HashSet};
use std::sync::Arc;

use async_trait::async_trait;
use keeper_crypto::ed25519::SigningKey;
use keeper_db::MemoryStore;
use keeper_transport::key::{KeyType, MetaKey};
use keeper_transport::messages::ProbeReply;
use keeper_transport::wire::MetaRequest;
use keeper_transport::{Messenger, TransportError};
use keeper_types::block::BlockId;
use keeper_types::challenge::ChallengeRecord;
use keeper_types::contract::{KeeperInfo, PeerRecord, QueryInfo, RootInfo, UpKeepingInfo};
use keeper_types::payment::PaymentRecord;
use parking_lot::Mutex;

use crate::config::CoreConfig;
use crate::external::{ChainClient, ProofVerdict, ProofVerifier};
use crate::service::{Collaborators, Keeper};
use crate::{KeeperError, Result};

type Responder = Box<dyn Fn(&MetaRequest, &str) -> Option<Vec<u8>> + Send + Sync>;

#[derive(Default)]
pub struct MockMessenger {
    sent: Mutex<Vec<(String, MetaRequest)>>,
    unreachable: Mutex<HashSet<String>>,
    silent: Mutex<HashSet<String>>,
    addresses: Mutex<HashMap<String, String>>,
    responder: Mutex<Option<Responder>>,
}

impl MockMessenger {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_unreachable(&self, peer: &str) {
        self.unreachable.lock().insert(peer.to_string());
    }

    /// Probes of `peer` never answer.
    pub fn set_silent(&self, peer: &str) {
        self.silent.lock().insert(peer.to_string());
    }

    pub fn set_address(&self, peer: &str, address: &str) {
        self.addresses
            .lock()
            .insert(peer.to_string(), address.to_string());
    }

    /// Answer requests with `f`; `None` answers with an empty value.
    pub fn set_responder<F>(&self, f: F)
    where
        F: Fn(&MetaRequest, &str) -> Option<Vec<u8>> + Send + Sync + 'static,
    {
        *self.responder.lock() = Some(Box::new(f));
    }

    pub fn sent(&self) -> Vec<(String, MetaRequest)> {
        self.sent.lock().clone()
    }

    pub fn sent_of(&self, key_type: KeyType) -> Vec<(String, MetaRequest)> {
        self.sent()
            .into_iter()
            .filter(|(_, r)| {
                r.key
                    .parse::<MetaKey>()
                    .map(|k| k.key_type == key_type)
                    .unwrap_or(false)
            })
            .collect()
    }
}

#[async_trait]
impl Messenger for MockMessenger {
    async fn send_meta_request(
        &self,
        request: MetaRequest,
        peer: &str,
    ) -> keeper_transport::Result<Vec<u8>> {
        if self.unreachable.lock().contains(peer) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        let reply = self
            .responder
            .lock()
            .as_ref()
            .and_then(|f| f(&request, peer))
            .unwrap_or_default();
        self.sent.lock().push((peer.to_string(), request));
        Ok(reply)
    }

    async fn probe(&self, peer: &str) -> keeper_transport::Result<ProbeReply> {
        let silent = self.silent.lock().contains(peer);
        if silent {
            std::future::pending::<()>().await;
        }
        if self.unreachable.lock().contains(peer) {
            return Err(TransportError::Unreachable(peer.to_string()));
        }
        Ok(ProbeReply {
            address: self.addresses.lock().get(peer).cloned(),
        })
    }
}

#[derive(Default)]
pub struct MockChain {
    upkeeping: Mutex<HashMap<String, UpKeepingInfo>>,
    queries: Mutex<HashMap<String, QueryInfo>>,
    peers: Mutex<Vec<PeerRecord>>,
    managers: Mutex<HashMap<String, Vec<String>>>,
    roots: Mutex<HashMap<String, RootInfo>>,
    paid: Mutex<Vec<PaymentRecord>>,
    fail_pay: Mutex<bool>,
}

impl MockChain {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn set_upkeeping(&self, info: UpKeepingInfo) {
        self.upkeeping.lock().insert(info.query_id.clone(), info);
    }

    pub fn remove_upkeeping(&self, query_id: &str) {
        self.upkeeping.lock().remove(query_id);
    }

    pub fn set_query(&self, info: QueryInfo) {
        self.queries.lock().insert(info.query_id.clone(), info);
    }

    pub fn add_peer(&self, record: PeerRecord) {
        self.peers.lock().push(record);
    }

    pub fn set_managers(&self, provider: &str, keepers: Vec<String>) {
        self.managers.lock().insert(provider.to_string(), keepers);
    }

    pub fn set_root(&self, root: RootInfo) {
        self.roots.lock().insert(root.query_id.clone(), root);
    }

    pub fn set_fail_pay(&self, fail: bool) {
        *self.fail_pay.lock() = fail;
    }

    pub fn paid(&self) -> Vec<PaymentRecord> {
        self.paid.lock().clone()
    }
}

#[async_trait]
impl ChainClient for MockChain {
    async fn get_upkeeping(&self, _user_id: &str, query_id: &str) -> Result<Option<UpKeepingInfo>> {
        Ok(self.upkeeping.lock().get(query_id).cloned())
    }

    async fn get_query_info(&self, _user_id: &str, query_id: &str) -> Result<Option<QueryInfo>> {
        Ok(self.queries.lock().get(query_id).cloned())
    }

    async fn get_all_keepers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .peers
            .lock()
            .iter()
            .filter(|p| p.role == keeper_types::peer::PeerRole::Keeper)
            .cloned()
            .collect())
    }

    async fn get_all_providers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .peers
            .lock()
            .iter()
            .filter(|p| p.role == keeper_types::peer::PeerRole::Provider)
            .cloned()
            .collect())
    }

    async fn get_keeper_info(&self, keeper_id: &str) -> Result<Option<KeeperInfo>> {
        Ok(self
            .peers
            .lock()
            .iter()
            .find(|p| p.id == keeper_id)
            .map(|record| KeeperInfo {
                record: record.clone(),
                deposit: 0,
                banned: false,
            }))
    }

    async fn get_root(&self, query_id: &str) -> Result<Option<RootInfo>> {
        Ok(self.roots.lock().get(query_id).cloned())
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self
            .peers
            .lock()
            .iter()
            .find(|p| p.id == user_id && p.role == keeper_types::peer::PeerRole::User)
            .cloned())
    }

    async fn get_provider_keepers(&self, provider: &str) -> Result<Option<Vec<String>>> {
        Ok(self.managers.lock().get(provider).cloned())
    }

    async fn space_time_pay(&self, payment: &PaymentRecord) -> Result<()> {
        if *self.fail_pay.lock() {
            return Err(KeeperError::Chain("payment contract unavailable".to_string()));
        }
        self.paid.lock().push(payment.clone());
        Ok(())
    }
}

/// How [`ScriptedVerifier`] answers.
#[derive(Clone, Debug)]
pub enum Verdict {
    /// Every sampled block proven.
    Accept,
    Reject,
    /// Accepted, with these blocks faulted.
    Fault(Vec<BlockId>),
}

pub struct ScriptedVerifier {
    verdict: Mutex<Verdict>,
}

impl ScriptedVerifier {
    pub fn new(verdict: Verdict) -> Self {
        Self {
            verdict: Mutex::new(verdict),
        }
    }

    pub fn set(&self, verdict: Verdict) {
        *self.verdict.lock() = verdict;
    }
}

impl ProofVerifier for ScriptedVerifier {
    fn verify_challenge(
        &self,
        record: &ChallengeRecord,
        _proof: &[u8],
        _public_key: &[u8],
    ) -> Result<ProofVerdict> {
        let sampled = record.sampled_blocks();
        let verdict = match &*self.verdict.lock() {
            Verdict::Accept => ProofVerdict {
                ok: true,
                proved: sampled,
                faulted: Vec::new(),
            },
            Verdict::Reject => ProofVerdict::default(),
            Verdict::Fault(faulted) => ProofVerdict {
                ok: true,
                proved: sampled
                    .into_iter()
                    .filter(|b| !faulted.contains(b))
                    .collect(),
                faulted: faulted.clone(),
            },
        };
        Ok(verdict)
    }
}

pub struct Harness {
    pub signing_key: SigningKey,
    pub store: Arc<MemoryStore>,
    pub messenger: Arc<MockMessenger>,
    pub chain: Arc<MockChain>,
    pub verifier: Arc<ScriptedVerifier>,
}

impl Harness {
    pub fn new() -> Self {
        Self {
            signing_key: SigningKey::generate(),
            store: Arc::new(MemoryStore::new()),
            messenger: Arc::new(MockMessenger::new()),
            chain: Arc::new(MockChain::new()),
            verifier: Arc::new(ScriptedVerifier::new(Verdict::Accept)),
        }
    }
}

pub fn keeper_with(harness: &Harness, config: CoreConfig) -> Arc<Keeper> {
    Keeper::new(
        harness.signing_key.clone(),
        config,
        Collaborators {
            store: harness.store.clone(),
            messenger: harness.messenger.clone(),
            chain: harness.chain.clone(),
            verifier: harness.verifier.clone(),
        },
    )
}

/// A contract for `query_id` valid over `[start, end)`.
pub fn contract(
    query_id: &str,
    keepers: &[String],
    providers: &[&str],
    price: u64,
    start: u64,
    end: u64,
) -> UpKeepingInfo {
    UpKeepingInfo {
        address: format!("0xup-{query_id}"),
        user_id: "u1".to_string(),
        query_id: query_id.to_string(),
        keepers: keepers.to_vec(),
        providers: providers.iter().map(|p| p.to_string()).collect(),
        price,
        start_time: start,
        end_time: end,
    }
}
