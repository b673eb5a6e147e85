//! Inbound request dispatch.
//!
//! Requests are routed purely on the key's type tag and the opcode. Every
//! sender signs the envelope with its ledger-registered key. Senders the
//! directory does not list as keepers or providers are users, and user
//! requests must also come from the group's user.

use keeper_crypto::ed25519::VerifyingKey;
use keeper_transport::cbor;
use keeper_transport::key::{KeyType, MetaKey, Opcode};
use keeper_transport::messages::{
    BlockPosUpdate, BucketUpdate, ProofReply, ProviderList, ProviderQuery, SessionHeartbeat,
    SignReply, SignRequest, StorageStats,
};
use keeper_transport::wire::MetaRequest;
use keeper_types::block::BlockId;
use keeper_types::layout::MAX_STRIPES_PER_BUCKET;
use keeper_types::peer::PeerRole;
use serde::de::DeserializeOwned;
use tracing::{debug, info};

use crate::group::Group;
use crate::service::Keeper;
use crate::{KeeperError, Result};

fn decode<T: DeserializeOwned>(value: &[u8]) -> Result<T> {
    cbor::from_slice(value).map_err(|e| KeeperError::WrongValue(e.to_string()))
}

fn required_option<'a>(key: &'a MetaKey, index: usize) -> Result<&'a str> {
    key.option(index)
        .ok_or_else(|| KeeperError::WrongKey(format!("{key}: missing option {index}")))
}

fn require_role(role: Option<PeerRole>, expected: PeerRole, from: &str) -> Result<()> {
    if role == Some(expected) {
        Ok(())
    } else {
        Err(KeeperError::WrongKey(format!("{from} is not a {expected:?}")))
    }
}

impl Keeper {
    /// Handle one inbound request from `from`, returning the reply value.
    pub async fn handle_request(&self, from: &str, request: &MetaRequest, now: u64) -> Result<Vec<u8>> {
        self.ensure_ready()?;
        let key: MetaKey = request
            .key
            .parse()
            .map_err(|_| KeeperError::WrongKey(request.key.clone()))?;
        let role = self.authenticate(from, request, now).await?;
        let group_id = key.main_id.as_str();

        match (key.key_type, request.op) {
            (KeyType::Proof, Opcode::Put) => {
                require_role(role, PeerRole::Provider, from)?;
                if required_option(&key, 0)? != from {
                    return Err(KeeperError::WrongKey(format!("{from} cannot prove for {key}")));
                }
                let reply: ProofReply = decode(&request.value)?;
                self.handle_proof(from, group_id, &reply, now).await?;
                Ok(Vec::new())
            }
            (KeyType::BlockPos, Opcode::Put) => {
                let group = self.load_group(from, group_id).await?;
                let block = parse_block(&key, group_id)?;
                let update: BlockPosUpdate = decode(&request.value)?;
                self.record_block_pos(&group, block, update, now)?;
                Ok(Vec::new())
            }
            (KeyType::BlockPos, Opcode::Delete) => {
                let group = self.load_group(from, group_id).await?;
                let block = parse_block(&key, group_id)?;
                self.forget_block_pos(&group, &block)?;
                Ok(Vec::new())
            }
            (KeyType::Bucket, Opcode::Put) => {
                let group = self.load_group(from, group_id).await?;
                let bucket_id: i64 = required_option(&key, 0)?
                    .parse()
                    .map_err(|_| KeeperError::WrongKey(key.to_string()))?;
                let update: BucketUpdate = decode(&request.value)?;
                update
                    .layout
                    .validate()
                    .map_err(|e| KeeperError::WrongValue(e.to_string()))?;
                if update.stripes > MAX_STRIPES_PER_BUCKET {
                    return Err(KeeperError::WrongValue(format!(
                        "{} stripes beyond bucket capacity",
                        update.stripes
                    )));
                }
                let info = group.buckets.record(bucket_id, update.layout, update.stripes);
                self.persist_bucket(&group.group_id, bucket_id, &info)?;
                Ok(Vec::new())
            }
            (KeyType::Sign, Opcode::Put) => {
                require_role(role, PeerRole::Keeper, from)?;
                let sign: SignRequest = decode(&request.value)?;
                let reply = self.handle_put_sign(from, &sign)?;
                Ok(cbor::to_vec(&reply)?)
            }
            (KeyType::Signature, Opcode::Put) => {
                require_role(role, PeerRole::Keeper, from)?;
                let reply: SignReply = decode(&request.value)?;
                if reply.keeper != from {
                    return Err(KeeperError::WrongKey(format!("{from} sent a signature for {}", reply.keeper)));
                }
                self.handle_get_sign(&reply).await?;
                Ok(Vec::new())
            }
            (KeyType::Storage, Opcode::Get) => {
                let group = self
                    .groups
                    .get(group_id)
                    .ok_or_else(|| KeeperError::NotMyUser(group_id.to_string()))?;
                if role.is_none() && group.user_id != from {
                    return Err(KeeperError::WrongKey(format!("{from} does not own {group_id}")));
                }
                let stats = storage_stats(&group, key.option(0))?;
                Ok(cbor::to_vec(&stats)?)
            }
            (KeyType::Session, Opcode::Put) => {
                let group = self.load_group(from, group_id).await?;
                let heartbeat: SessionHeartbeat = decode(&request.value)?;
                group.record_session(heartbeat.session_id, heartbeat.at.min(now));
                self.peers.ensure(from, PeerRole::User);
                self.peers.mark_seen(from, now, None);
                Ok(Vec::new())
            }
            (KeyType::Providers, Opcode::Get) => {
                let query: ProviderQuery = decode(&request.value)?;
                let providers = self.admit_providers(query.count);
                if providers.is_empty() {
                    return Err(KeeperError::NoProvider(format!("{from} asked for {}", query.count)));
                }
                Ok(cbor::to_vec(&ProviderList { providers })?)
            }
            (KeyType::PublicKey, Opcode::Put) => {
                let group = self.load_group(from, group_id).await?;
                if request.value.is_empty() {
                    return Err(KeeperError::WrongValue("empty verification key".to_string()));
                }
                group.set_public_key(request.value.clone());
                self.persist_group(&group)?;
                info!(group = %group_id, "verification key updated");
                Ok(Vec::new())
            }
            (key_type, op) => Err(KeeperError::WrongKey(format!(
                "unsupported {op:?} on {}",
                key_type.as_str()
            ))),
        }
    }

    /// Verify the envelope of every request against the sender's ledger key.
    ///
    /// Returns the sender's directory role; `None` marks a user request.
    async fn authenticate(&self, from: &str, request: &MetaRequest, now: u64) -> Result<Option<PeerRole>> {
        let role = match self.peers.role(from) {
            Some(PeerRole::User) | None => None,
            Some(role) => Some(role),
        };
        let public_key = match role {
            Some(PeerRole::Keeper) => self.keeper_public_key(from).await?,
            Some(_) => {
                let bytes = self
                    .peers
                    .public_key(from)
                    .ok_or_else(|| KeeperError::WrongSign(format!("no key for {from}")))?;
                VerifyingKey::from_bytes(&bytes)?
            }
            None => self.user_public_key(from).await?,
        };
        if !request.verify(&public_key) {
            return Err(KeeperError::WrongSign(from.to_string()));
        }
        if role.is_some() {
            self.peers.mark_seen(from, now, None);
        }
        Ok(role)
    }

    /// A user's envelope key: the directory copy, else the ledger's record.
    async fn user_public_key(&self, user: &str) -> Result<VerifyingKey> {
        if let Some(bytes) = self.peers.public_key(user) {
            return Ok(VerifyingKey::from_bytes(&bytes)?);
        }
        let record = self
            .chain
            .get_user(user)
            .await?
            .filter(|r| r.role == PeerRole::User)
            .ok_or_else(|| KeeperError::WrongSign(format!("unknown user {user}")))?;
        let key = VerifyingKey::from_bytes(&record.public_key)?;
        self.peers.upsert_record(&record);
        Ok(key)
    }

    /// Record where a block now lives, moving it between providers if needed.
    fn record_block_pos(&self, group: &Group, block: BlockId, update: BlockPosUpdate, now: u64) -> Result<()> {
        if group.contract().is_some_and(|c| c.is_expired(now)) {
            return Err(KeeperError::UpkeepingExpired(group.group_id.clone()));
        }
        if block.stripe >= MAX_STRIPES_PER_BUCKET {
            return Err(KeeperError::WrongValue(format!("stripe {} beyond bucket capacity", block.stripe)));
        }
        let layout = group
            .buckets
            .layout(block.bucket_id)
            .ok_or_else(|| KeeperError::WrongValue(format!("bucket {} not declared", block.bucket_id)))?;
        if block.chunk >= layout.chunk_count() {
            return Err(KeeperError::WrongValue(format!("chunk {} beyond stripe width", block.chunk)));
        }
        if !group.buckets.observe_stripe(block.bucket_id, block.stripe) {
            return Err(KeeperError::WrongValue(format!("bucket {} not declared", block.bucket_id)));
        }
        if group.contract().is_some() && !group.has_provider(&update.provider) {
            return Err(KeeperError::NotMyProvider(update.provider));
        }
        for entry in group.ledgers() {
            if entry.provider != update.provider && entry.remove_block(&block).is_some() {
                self.delete_block_pos(&group.group_id, &entry.provider, &block)?;
            }
        }
        let meta = group
            .ledger(&update.provider)
            .put_block(block.clone(), update.offset, now);
        self.persist_block_pos(&group.group_id, &block, &meta)?;
        debug!(block = %block, provider = %update.provider, offset = update.offset, "block position recorded");
        Ok(())
    }

    fn forget_block_pos(&self, group: &Group, block: &BlockId) -> Result<()> {
        let mut found = false;
        for entry in group.ledgers() {
            if entry.remove_block(block).is_some() {
                self.delete_block_pos(&group.group_id, &entry.provider, block)?;
                found = true;
            }
        }
        if found {
            Ok(())
        } else {
            Err(KeeperError::NoBlock(block.to_string()))
        }
    }

    fn admit_providers(&self, count: usize) -> Vec<String> {
        let mut rng = rand::thread_rng();
        self.peers.select_providers(count, &mut rng)
    }
}

fn parse_block(key: &MetaKey, group_id: &str) -> Result<BlockId> {
    let block: BlockId = required_option(key, 0)?.parse()?;
    if block.group_id != group_id {
        return Err(KeeperError::WrongKey(format!("{block} is not in {group_id}")));
    }
    Ok(block)
}

fn storage_stats(group: &Group, provider: Option<&str>) -> Result<StorageStats> {
    let entries = match provider {
        Some(provider) => vec![group
            .existing_ledger(provider)
            .ok_or_else(|| KeeperError::NotMyProvider(provider.to_string()))?],
        None => group.ledgers(),
    };
    let mut stats = StorageStats {
        group_id: group.group_id.clone(),
        provider: provider.map(str::to_string),
        ..StorageStats::default()
    };
    for entry in entries {
        stats.used_bytes = stats
            .used_bytes
            .saturating_add(entry.stored_bytes(&group.buckets));
        stats.blocks += entry.blocks.len() as u64;
        stats.faults += entry.fault_count() as u64;
    }
    Ok(stats)
}
