//! Configuration file management.

use std::path::PathBuf;
use std::time::Duration;

use keeper_core::CoreConfig;
use serde::{Deserialize, Serialize};

/// Complete daemon configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct DaemonConfig {
    #[serde(default)]
    pub node: NodeConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub policy: PolicyConfig,
    #[serde(default)]
    pub ledger: LedgerConfig,
}

/// Node configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct NodeConfig {
    /// Data directory. Empty = platform default.
    #[serde(default)]
    pub data_dir: String,
    /// Log level: "debug" | "info" | "warn" | "error".
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

/// Task intervals, in seconds.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    #[serde(default = "default_challenge_secs")]
    pub challenge_secs: u64,
    #[serde(default = "default_repair_secs")]
    pub repair_secs: u64,
    #[serde(default = "default_settle_secs")]
    pub settle_secs: u64,
    #[serde(default = "default_liveness_secs")]
    pub liveness_secs: u64,
    #[serde(default = "default_refresh_secs")]
    pub peer_refresh_secs: u64,
    #[serde(default = "default_refresh_secs")]
    pub group_refresh_secs: u64,
    #[serde(default = "default_persist_secs")]
    pub persist_secs: u64,
    #[serde(default = "default_liveness_secs")]
    pub metrics_secs: u64,
    /// 0 = same as `challenge_secs`.
    #[serde(default)]
    pub challenge_lifetime_secs: u64,
}

/// Policy configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PolicyConfig {
    #[serde(default = "default_expire_window")]
    pub expire_window_secs: u64,
    #[serde(default = "default_pay_window")]
    pub pay_window_secs: u64,
    #[serde(default = "default_repair_queue")]
    pub repair_queue_capacity: usize,
}

/// Development ledger configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct LedgerConfig {
    /// JSON ledger snapshot. Empty = `$data_dir/ledger.json`.
    #[serde(default)]
    pub snapshot_path: String,
}

// Default value functions

fn default_log_level() -> String {
    "info".to_string()
}

fn default_challenge_secs() -> u64 {
    10 * 60
}

fn default_repair_secs() -> u64 {
    60
}

fn default_settle_secs() -> u64 {
    60 * 60
}

fn default_liveness_secs() -> u64 {
    60
}

fn default_refresh_secs() -> u64 {
    10 * 60
}

fn default_persist_secs() -> u64 {
    5 * 60
}

fn default_expire_window() -> u64 {
    30 * 60
}

fn default_pay_window() -> u64 {
    24 * 60 * 60
}

fn default_repair_queue() -> usize {
    1024
}

impl Default for NodeConfig {
    fn default() -> Self {
        Self {
            data_dir: String::new(),
            log_level: default_log_level(),
        }
    }
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            challenge_secs: default_challenge_secs(),
            repair_secs: default_repair_secs(),
            settle_secs: default_settle_secs(),
            liveness_secs: default_liveness_secs(),
            peer_refresh_secs: default_refresh_secs(),
            group_refresh_secs: default_refresh_secs(),
            persist_secs: default_persist_secs(),
            metrics_secs: default_liveness_secs(),
            challenge_lifetime_secs: 0,
        }
    }
}

impl Default for PolicyConfig {
    fn default() -> Self {
        Self {
            expire_window_secs: default_expire_window(),
            pay_window_secs: default_pay_window(),
            repair_queue_capacity: default_repair_queue(),
        }
    }
}

impl DaemonConfig {
    /// Load configuration from the default config file location.
    ///
    /// Falls back to defaults if file does not exist.
    pub fn load() -> anyhow::Result<Self> {
        let config_path = Self::config_path();
        if config_path.exists() {
            let content = std::fs::read_to_string(&config_path)?;
            let config: DaemonConfig = toml::from_str(&content)?;
            Ok(config)
        } else {
            Ok(Self::default())
        }
    }

    /// Get the data directory path.
    pub fn data_dir(&self) -> PathBuf {
        if self.node.data_dir.is_empty() {
            Self::default_data_dir()
        } else {
            PathBuf::from(&self.node.data_dir)
        }
    }

    /// Path of the development ledger snapshot.
    pub fn ledger_path(&self) -> PathBuf {
        if self.ledger.snapshot_path.is_empty() {
            self.data_dir().join("ledger.json")
        } else {
            PathBuf::from(&self.ledger.snapshot_path)
        }
    }

    /// Engine configuration. Zero intervals are raised to one second.
    pub fn to_core(&self) -> CoreConfig {
        let secs = |s: u64| Duration::from_secs(s.max(1));
        let s = &self.schedule;
        let challenge_interval = secs(s.challenge_secs);
        CoreConfig {
            challenge_interval,
            repair_interval: secs(s.repair_secs),
            settle_interval: secs(s.settle_secs),
            liveness_interval: secs(s.liveness_secs),
            peer_refresh_interval: secs(s.peer_refresh_secs),
            group_refresh_interval: secs(s.group_refresh_secs),
            persist_interval: secs(s.persist_secs),
            metrics_interval: secs(s.metrics_secs),
            challenge_lifetime: if s.challenge_lifetime_secs == 0 {
                challenge_interval
            } else {
                Duration::from_secs(s.challenge_lifetime_secs)
            },
            expire_window: self.policy.expire_window_secs,
            pay_window: self.policy.pay_window_secs,
            repair_queue_capacity: self.policy.repair_queue_capacity.max(1),
        }
    }

    /// Get the config file path.
    fn config_path() -> PathBuf {
        // Check env var override first
        if let Ok(dir) = std::env::var("KEEPER_DATA_DIR") {
            return PathBuf::from(dir).join("config.toml");
        }
        Self::default_data_dir().join("config.toml")
    }

    /// Platform-specific default data directory.
    fn default_data_dir() -> PathBuf {
        if let Ok(dir) = std::env::var("KEEPER_DATA_DIR") {
            return PathBuf::from(dir);
        }
        #[cfg(target_os = "macos")]
        {
            dirs_fallback("Library/Application Support/Keeper")
        }
        #[cfg(not(target_os = "macos"))]
        {
            dirs_fallback(".keeper")
        }
    }
}

/// Fallback home directory resolution.
fn dirs_fallback(subpath: &str) -> PathBuf {
    std::env::var("HOME")
        .map(|h| PathBuf::from(h).join(subpath))
        .unwrap_or_else(|_| PathBuf::from("/tmp/keeper"))
}
