//! # keeper-core
//!
//! The Keeper's challenge–repair–settlement engine.
//!
//! A Keeper stores no user data. It proves that providers still hold what they
//! promised, repairs what has gone missing, and settles payment for storage
//! delivered over time.
//!
//! ## Modules
//!
//! - [`peers`] / [`liveness`]: peer directory, credit and connectivity
//! - [`group`] / [`bucket`] / [`ledger`]: per-group aggregate state
//! - [`challenge`]: sparse-sampling proof-of-storage challenges
//! - [`repair`]: staged retry policy and the serial repair worker
//! - [`settlement`]: trapezoidal space-time accounting and threshold signing
//! - [`lifecycle`]: group creation, refresh and cleanup
//! - [`handlers`]: inbound request dispatch
//! - [`persist`]: checkpoint and restore through [`keeper_db::KvStore`]
//! - [`service`]: the [`Keeper`] and its periodic tasks
//!
//! External collaborators (proof system, ledger, transport) are reached only
//! through the traits in [`external`] and [`keeper_transport::Messenger`].

pub mod bucket;
pub mod challenge;
pub mod config;
pub mod external;
pub mod group;
pub mod handlers;
pub mod ledger;
pub mod lifecycle;
pub mod liveness;
pub mod metrics;
pub mod peers;
pub mod persist;
pub mod repair;
pub mod service;
pub mod settlement;

#[cfg(test)]
pub(crate) mod testutil;

pub use config::CoreConfig;
pub use service::{Keeper, KeeperService};

use keeper_crypto::CryptoError;
use keeper_db::DbError;
use keeper_transport::TransportError;
use keeper_types::TypeError;

/// Error kinds raised by the engine.
///
/// Nothing here is fatal to the process: schedulers log and continue on the
/// next tick, handlers log and drop the request.
#[derive(Debug, thiserror::Error)]
pub enum KeeperError {
    /// The user or group is not managed by this keeper.
    #[error("not my user: {0}")]
    NotMyUser(String),

    /// The provider is not part of the group.
    #[error("not my provider: {0}")]
    NotMyProvider(String),

    /// The keeper is not part of the group.
    #[error("not my keeper: {0}")]
    NotMyKeeper(String),

    /// The upkeeping contract has ended.
    #[error("upkeeping expired: {0}")]
    UpkeepingExpired(String),

    /// Nothing to do this cycle.
    #[error("empty data")]
    EmptyData,

    /// The block is unknown.
    #[error("no block: {0}")]
    NoBlock(String),

    /// The sender is not allowed to touch this key.
    #[error("wrong key: {0}")]
    WrongKey(String),

    /// The request value is malformed or stale.
    #[error("wrong value: {0}")]
    WrongValue(String),

    /// A signature did not verify.
    #[error("wrong signature: {0}")]
    WrongSign(String),

    /// The keeper has not finished initializing.
    #[error("service not ready")]
    ServiceNotReady,

    /// No provider can take a repaired block.
    #[error("no provider available: {0}")]
    NoProvider(String),

    /// The ledger client failed.
    #[error("chain error: {0}")]
    Chain(String),

    #[error("crypto error: {0}")]
    Crypto(#[from] CryptoError),

    #[error("database error: {0}")]
    Db(#[from] DbError),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("type error: {0}")]
    Type(#[from] TypeError),

    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeeperError {
    /// Whether the same operation may succeed on a later attempt.
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::EmptyData
                | Self::NoBlock(_)
                | Self::ServiceNotReady
                | Self::NoProvider(_)
                | Self::Chain(_)
                | Self::Db(_)
                | Self::Transport(_)
        )
    }
}

pub type Result<T> = std::result::Result<T, KeeperError>;

/// Current Unix time in seconds.
pub fn now_secs() -> u64 {
    std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .unwrap_or_default()
        .as_secs()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_transient_classification() {
        assert!(KeeperError::EmptyData.is_transient());
        assert!(KeeperError::ServiceNotReady.is_transient());
        assert!(KeeperError::Chain("timeout".into()).is_transient());
        assert!(KeeperError::Transport(TransportError::Unreachable("p1".into())).is_transient());
        assert!(!KeeperError::WrongSign("k2".into()).is_transient());
        assert!(!KeeperError::NotMyUser("u1".into()).is_transient());
        assert!(!KeeperError::UpkeepingExpired("q1".into()).is_transient());
    }
}
