//! Development ledger backed by a JSON snapshot file.
//!
//! The snapshot is re-read on every query so an operator can edit it while
//! the daemon runs. Submitted payments are appended to `payments.jsonl` next
//! to the snapshot.

use std::collections::HashMap;
use std::io::Write;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use keeper_core::external::ChainClient;
use keeper_core::{KeeperError, Result};
use keeper_types::contract::{KeeperInfo, PeerRecord, QueryInfo, RootInfo, UpKeepingInfo};
use keeper_types::payment::PaymentRecord;
use serde::{Deserialize, Serialize};
use tracing::info;

/// Everything the ledger knows, as stored on disk.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerSnapshot {
    #[serde(default)]
    pub upkeepings: Vec<UpKeepingInfo>,
    #[serde(default)]
    pub queries: Vec<QueryInfo>,
    #[serde(default)]
    pub keepers: Vec<KeeperInfo>,
    #[serde(default)]
    pub providers: Vec<PeerRecord>,
    #[serde(default)]
    pub users: Vec<PeerRecord>,
    #[serde(default)]
    pub roots: Vec<RootInfo>,
    /// Provider ID to the keepers managing it.
    #[serde(default)]
    pub provider_keepers: HashMap<String, Vec<String>>,
}

pub struct FileLedger {
    snapshot_path: PathBuf,
    payments_path: PathBuf,
}

fn chain_err(path: &Path, e: impl std::fmt::Display) -> KeeperError {
    KeeperError::Chain(format!("{}: {e}", path.display()))
}

impl FileLedger {
    pub fn new(snapshot_path: impl Into<PathBuf>) -> Self {
        let snapshot_path = snapshot_path.into();
        let payments_path = snapshot_path.with_file_name("payments.jsonl");
        Self {
            snapshot_path,
            payments_path,
        }
    }

    /// Read the snapshot. A missing file is an empty ledger.
    pub fn snapshot(&self) -> Result<LedgerSnapshot> {
        if !self.snapshot_path.exists() {
            return Ok(LedgerSnapshot::default());
        }
        let raw = std::fs::read(&self.snapshot_path).map_err(|e| chain_err(&self.snapshot_path, e))?;
        serde_json::from_slice(&raw).map_err(|e| chain_err(&self.snapshot_path, e))
    }
}

#[async_trait]
impl ChainClient for FileLedger {
    async fn get_upkeeping(&self, user_id: &str, query_id: &str) -> Result<Option<UpKeepingInfo>> {
        Ok(self
            .snapshot()?
            .upkeepings
            .into_iter()
            .find(|u| u.user_id == user_id && u.query_id == query_id))
    }

    async fn get_query_info(&self, user_id: &str, query_id: &str) -> Result<Option<QueryInfo>> {
        Ok(self
            .snapshot()?
            .queries
            .into_iter()
            .find(|q| q.user_id == user_id && q.query_id == query_id))
    }

    async fn get_all_keepers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self
            .snapshot()?
            .keepers
            .into_iter()
            .filter(|k| !k.banned)
            .map(|k| k.record)
            .collect())
    }

    async fn get_all_providers(&self) -> Result<Vec<PeerRecord>> {
        Ok(self.snapshot()?.providers)
    }

    async fn get_keeper_info(&self, keeper_id: &str) -> Result<Option<KeeperInfo>> {
        Ok(self
            .snapshot()?
            .keepers
            .into_iter()
            .find(|k| k.record.id == keeper_id))
    }

    async fn get_root(&self, query_id: &str) -> Result<Option<RootInfo>> {
        Ok(self
            .snapshot()?
            .roots
            .into_iter()
            .filter(|r| r.query_id == query_id)
            .max_by_key(|r| r.updated_at))
    }

    async fn get_user(&self, user_id: &str) -> Result<Option<PeerRecord>> {
        Ok(self.snapshot()?.users.into_iter().find(|u| u.id == user_id))
    }

    async fn get_provider_keepers(&self, provider: &str) -> Result<Option<Vec<String>>> {
        Ok(self.snapshot()?.provider_keepers.remove(provider))
    }

    async fn space_time_pay(&self, payment: &PaymentRecord) -> Result<()> {
        let mut line = serde_json::to_vec(payment)?;
        line.push(b'\n');
        let mut file = std::fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.payments_path)
            .map_err(|e| chain_err(&self.payments_path, e))?;
        file.write_all(&line)
            .map_err(|e| chain_err(&self.payments_path, e))?;
        info!(
            group = %payment.group_id,
            provider = %payment.provider,
            value = %payment.value,
            "payment recorded"
        );
        Ok(())
    }
}
