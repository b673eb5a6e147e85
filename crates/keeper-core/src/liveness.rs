//! Connectivity probing and ledger refresh of the peer directory.

use std::time::Duration;

use futures::stream::{self, StreamExt};
use keeper_transport::Messenger;
use keeper_types::peer::PeerRole;
use tracing::{debug, info};

use crate::external::ChainClient;
use crate::peers::PeerDirectory;
use crate::Result;

/// Upper bound on a single probe.
pub const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Probes in flight at once.
pub const PROBE_CONCURRENCY: usize = 32;

/// Outcome of one liveness pass.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LivenessReport {
    pub probed: usize,
    pub reachable: usize,
    pub offline: Vec<String>,
}

/// Probe every keeper and provider except `self_id`, then expire stale peers.
///
/// Up to [`PROBE_CONCURRENCY`] probes run at once, so a pass over silent
/// peers takes about one [`PROBE_TIMEOUT`] per batch rather than per peer.
pub async fn probe_peers(
    directory: &PeerDirectory,
    messenger: &dyn Messenger,
    self_id: &str,
    now: u64,
    expire_window: u64,
) -> LivenessReport {
    let mut report = LivenessReport::default();
    let mut targets = Vec::new();
    for peer in directory
        .ids(PeerRole::Keeper)
        .into_iter()
        .chain(directory.ids(PeerRole::Provider))
    {
        if peer == self_id {
            directory.mark_seen(&peer, now, None);
        } else {
            targets.push(peer);
        }
    }
    report.probed = targets.len();

    let results: Vec<_> = stream::iter(targets)
        .map(|peer| async move {
            let outcome = tokio::time::timeout(PROBE_TIMEOUT, messenger.probe(&peer)).await;
            (peer, outcome)
        })
        .buffer_unordered(PROBE_CONCURRENCY)
        .collect()
        .await;

    for (peer, outcome) in results {
        match outcome {
            Ok(Ok(reply)) => {
                directory.mark_seen(&peer, now, reply.address);
                report.reachable += 1;
            }
            Ok(Err(e)) => debug!(peer = %peer, error = %e, "probe failed"),
            Err(_) => debug!(peer = %peer, "probe timed out"),
        }
    }

    report.offline = directory.expire(now, expire_window);
    report
}

/// Insert unknown peers from the ledger and refresh key, capacity and address.
pub async fn refresh_from_ledger(directory: &PeerDirectory, chain: &dyn ChainClient) -> Result<usize> {
    let keepers = chain.get_all_keepers().await?;
    let providers = chain.get_all_providers().await?;
    let total = keepers.len() + providers.len();
    for record in keepers.iter().chain(providers.iter()) {
        directory.upsert_record(record);
    }
    info!(keepers = keepers.len(), providers = providers.len(), "peer directory refreshed");
    Ok(total)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::testutil::{MockChain, MockMessenger};
    use keeper_types::contract::PeerRecord;

    #[tokio::test]
    async fn test_probe_marks_reachable_and_expires_rest() {
        let dir = PeerDirectory::new();
        dir.ensure("k0", PeerRole::Keeper);
        dir.ensure("p1", PeerRole::Provider);
        dir.ensure("p2", PeerRole::Provider);

        let messenger = MockMessenger::new();
        messenger.set_unreachable("p2");
        messenger.set_address("p1", "10.1.1.1:9000");

        let report = probe_peers(&dir, &messenger, "k0", 1_000, 60).await;
        assert_eq!(report.probed, 2);
        assert_eq!(report.reachable, 1);
        assert_eq!(report.offline, vec!["p2".to_string()]);

        let p1 = dir.get("p1").expect("p1");
        assert!(p1.online);
        assert_eq!(p1.address.as_deref(), Some("10.1.1.1:9000"));
        assert_eq!(dir.credit("p2"), Some(49));
        assert!(dir.get("k0").expect("self").online);
    }

    #[tokio::test(start_paused = true)]
    async fn test_silent_peers_are_probed_concurrently() {
        let dir = PeerDirectory::new();
        let messenger = MockMessenger::new();
        for i in 0..8 {
            let id = format!("p{i}");
            dir.ensure(&id, PeerRole::Provider);
            messenger.set_silent(&id);
        }
        dir.ensure("p-live", PeerRole::Provider);

        let started = tokio::time::Instant::now();
        let report = probe_peers(&dir, &messenger, "k0", 1_000, 60).await;
        let elapsed = started.elapsed();

        assert_eq!(report.probed, 9);
        assert_eq!(report.reachable, 1);
        assert_eq!(report.offline.len(), 8);
        assert!(elapsed >= PROBE_TIMEOUT);
        assert!(elapsed < PROBE_TIMEOUT * 2, "took {elapsed:?}");
    }

    #[tokio::test]
    async fn test_refresh_from_ledger_inserts_peers() {
        let dir = PeerDirectory::new();
        let chain = MockChain::new();
        chain.add_peer(PeerRecord {
            id: "k1".to_string(),
            role: PeerRole::Keeper,
            public_key: [1u8; 32],
            capacity: 0,
            address: None,
        });
        chain.add_peer(PeerRecord {
            id: "p1".to_string(),
            role: PeerRole::Provider,
            public_key: [2u8; 32],
            capacity: 4096,
            address: None,
        });

        let count = refresh_from_ledger(&dir, &chain).await.expect("refresh");
        assert_eq!(count, 2);
        assert_eq!(dir.role("k1"), Some(PeerRole::Keeper));
        assert_eq!(dir.credit("p1"), Some(50));
        assert_eq!(dir.public_key("p1"), Some([2u8; 32]));
    }
}
