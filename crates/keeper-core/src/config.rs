//! Engine timing and policy knobs.

use std::time::Duration;

/// Runtime configuration of the engine.
///
/// The daemon builds this from its TOML file; tests build it directly.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct CoreConfig {
    pub challenge_interval: Duration,
    pub repair_interval: Duration,
    pub settle_interval: Duration,
    pub liveness_interval: Duration,
    pub peer_refresh_interval: Duration,
    pub group_refresh_interval: Duration,
    pub persist_interval: Duration,
    pub metrics_interval: Duration,
    /// A proof arriving later than this after its challenge is refused.
    pub challenge_lifetime: Duration,
    /// Seconds without verification or probe before a block or peer is stale.
    pub expire_window: u64,
    /// Challenge history older than this many seconds is never paid.
    pub pay_window: u64,
    pub repair_queue_capacity: usize,
}

impl Default for CoreConfig {
    fn default() -> Self {
        let challenge_interval = Duration::from_secs(10 * 60);
        Self {
            challenge_interval,
            repair_interval: Duration::from_secs(60),
            settle_interval: Duration::from_secs(60 * 60),
            liveness_interval: Duration::from_secs(60),
            peer_refresh_interval: Duration::from_secs(10 * 60),
            group_refresh_interval: Duration::from_secs(10 * 60),
            persist_interval: Duration::from_secs(5 * 60),
            metrics_interval: Duration::from_secs(60),
            challenge_lifetime: challenge_interval,
            expire_window: 30 * 60,
            pay_window: 24 * 60 * 60,
            repair_queue_capacity: 1024,
        }
    }
}
