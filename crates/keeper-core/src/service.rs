//! The Keeper and its task supervisor.
//!
//! [`Keeper`] owns the shared state and the collaborators. The engine's
//! operations live in `impl Keeper` blocks next to the state they touch
//! (`challenge.rs`, `repair.rs`, `settlement.rs`, ...). [`KeeperService`]
//! spawns one task per periodic job, all bound to a single
//! [`CancellationToken`], plus the serial repair worker.

use std::future::Future;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use keeper_crypto::ed25519::{derive_node_id, SigningKey, VerifyingKey};
use keeper_db::KvStore;
use keeper_transport::key::{MetaKey, Opcode};
use keeper_transport::wire::MetaRequest;
use keeper_transport::Messenger;
use keeper_types::block::BlockId;
use keeper_types::peer::PeerRole;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::{Instant, MissedTickBehavior};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::CoreConfig;
use crate::external::{ChainClient, ProofVerifier};
use crate::group::GroupRegistry;
use crate::liveness;
use crate::metrics::Metrics;
use crate::peers::PeerDirectory;
use crate::{now_secs, KeeperError, Result};

/// External capabilities the engine consumes.
pub struct Collaborators {
    pub store: Arc<dyn KvStore>,
    pub messenger: Arc<dyn Messenger>,
    pub chain: Arc<dyn ChainClient>,
    pub verifier: Arc<dyn ProofVerifier>,
}

pub struct Keeper {
    pub(crate) id: String,
    pub(crate) signing_key: SigningKey,
    pub(crate) config: CoreConfig,
    pub(crate) peers: PeerDirectory,
    pub(crate) groups: GroupRegistry,
    pub(crate) store: Arc<dyn KvStore>,
    pub(crate) messenger: Arc<dyn Messenger>,
    pub(crate) chain: Arc<dyn ChainClient>,
    pub(crate) verifier: Arc<dyn ProofVerifier>,
    pub(crate) metrics: Metrics,
    ready: AtomicBool,
}

impl Keeper {
    pub fn new(signing_key: SigningKey, config: CoreConfig, deps: Collaborators) -> Arc<Self> {
        let verifying_key = signing_key.verifying_key();
        let id = derive_node_id(&verifying_key);
        let peers = PeerDirectory::new();
        peers.ensure(&id, PeerRole::Keeper);
        peers.upsert_record(&keeper_types::contract::PeerRecord {
            id: id.clone(),
            role: PeerRole::Keeper,
            public_key: verifying_key.to_bytes(),
            capacity: 0,
            address: None,
        });
        Arc::new(Self {
            id,
            signing_key,
            config,
            peers,
            groups: GroupRegistry::new(),
            store: deps.store,
            messenger: deps.messenger,
            chain: deps.chain,
            verifier: deps.verifier,
            metrics: Metrics::default(),
            ready: AtomicBool::new(false),
        })
    }

    pub fn id(&self) -> &str {
        &self.id
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        self.signing_key.verifying_key()
    }

    pub fn config(&self) -> &CoreConfig {
        &self.config
    }

    pub fn peers(&self) -> &PeerDirectory {
        &self.peers
    }

    pub fn groups(&self) -> &GroupRegistry {
        &self.groups
    }

    pub fn metrics(&self) -> &Metrics {
        &self.metrics
    }

    pub fn is_ready(&self) -> bool {
        self.ready.load(Ordering::Acquire)
    }

    /// Accept inbound requests from now on.
    pub fn set_ready(&self) {
        self.ready.store(true, Ordering::Release);
    }

    pub(crate) fn ensure_ready(&self) -> Result<()> {
        if self.is_ready() {
            Ok(())
        } else {
            Err(KeeperError::ServiceNotReady)
        }
    }

    /// Sign and send a request, returning the raw reply.
    pub(crate) async fn send(
        &self,
        op: Opcode,
        key: &MetaKey,
        value: Vec<u8>,
        peer: &str,
    ) -> Result<Vec<u8>> {
        let request = MetaRequest::signed(op, key, value, &self.signing_key);
        Ok(self.messenger.send_meta_request(request, peer).await?)
    }

    /// Sign a request and send it from a detached task, ignoring the reply.
    pub(crate) fn send_detached(&self, op: Opcode, key: MetaKey, value: Vec<u8>, peer: String) {
        let request = MetaRequest::signed(op, &key, value, &self.signing_key);
        let messenger = self.messenger.clone();
        tokio::spawn(async move {
            if let Err(e) = messenger.send_meta_request(request, &peer).await {
                debug!(peer = %peer, key = %key, error = %e, "detached request failed");
            }
        });
    }

    /// One liveness pass over the peer directory.
    pub async fn liveness_tick(&self, now: u64) -> liveness::LivenessReport {
        let report = liveness::probe_peers(
            &self.peers,
            self.messenger.as_ref(),
            &self.id,
            now,
            self.config.expire_window,
        )
        .await;
        debug!(
            probed = report.probed,
            reachable = report.reachable,
            offline = report.offline.len(),
            "liveness pass complete"
        );
        report
    }

    /// Refresh the peer directory from the ledger.
    pub async fn refresh_peers(&self) {
        if let Err(e) = liveness::refresh_from_ledger(&self.peers, self.chain.as_ref()).await {
            warn!(error = %e, "peer refresh failed");
        }
    }
}

/// Running keeper with its background tasks.
pub struct KeeperService {
    keeper: Arc<Keeper>,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl KeeperService {
    /// Restore state, mark the keeper ready and spawn every periodic job.
    pub async fn start(keeper: Arc<Keeper>) -> Result<Self> {
        let restored = keeper.restore()?;
        info!(keeper = %keeper.id, groups = restored, "state restored");

        keeper.refresh_peers().await;
        keeper.refresh_groups().await;
        keeper.set_ready();

        let cancel = CancellationToken::new();
        let config = keeper.config.clone();
        let (repair_tx, repair_rx) = mpsc::channel(config.repair_queue_capacity.max(1));

        let mut tasks = Vec::new();
        tasks.push(spawn_repair_worker(keeper.clone(), repair_rx, cancel.clone()));

        let k = keeper.clone();
        tasks.push(spawn_periodic("challenge", config.challenge_interval, cancel.clone(), move || {
            let k = k.clone();
            async move {
                k.challenge_tick(now_secs()).await;
            }
        }));

        let k = keeper.clone();
        // The first scan runs only after the first challenge round.
        let first_scan = config.challenge_interval + config.repair_interval;
        tasks.push(spawn_periodic_after(
            "repair-scan",
            first_scan,
            config.repair_interval,
            cancel.clone(),
            move || {
                let k = k.clone();
                let tx = repair_tx.clone();
                async move {
                    k.repair_scan(now_secs(), &tx).await;
                }
            },
        ));

        let k = keeper.clone();
        tasks.push(spawn_periodic("settlement", config.settle_interval, cancel.clone(), move || {
            let k = k.clone();
            async move {
                k.settle_tick(now_secs()).await;
            }
        }));

        let k = keeper.clone();
        tasks.push(spawn_periodic("liveness", config.liveness_interval, cancel.clone(), move || {
            let k = k.clone();
            async move {
                k.liveness_tick(now_secs()).await;
            }
        }));

        let k = keeper.clone();
        tasks.push(spawn_periodic(
            "peer-refresh",
            config.peer_refresh_interval,
            cancel.clone(),
            move || {
                let k = k.clone();
                async move { k.refresh_peers().await }
            },
        ));

        let k = keeper.clone();
        tasks.push(spawn_periodic(
            "group-refresh",
            config.group_refresh_interval,
            cancel.clone(),
            move || {
                let k = k.clone();
                async move {
                    let report = k.refresh_groups().await;
                    debug!(?report, "group refresh complete");
                }
            },
        ));

        let k = keeper.clone();
        tasks.push(spawn_periodic("persist", config.persist_interval, cancel.clone(), move || {
            let k = k.clone();
            async move {
                if let Err(e) = k.persist_all() {
                    warn!(error = %e, "checkpoint failed");
                }
            }
        }));

        let k = keeper.clone();
        tasks.push(spawn_periodic("metrics", config.metrics_interval, cancel.clone(), move || {
            let k = k.clone();
            async move {
                k.metrics.refresh(&k);
                k.metrics.log();
            }
        }));

        info!(keeper = %keeper.id, tasks = tasks.len(), "keeper service started");
        Ok(Self {
            keeper,
            cancel,
            tasks,
        })
    }

    pub fn keeper(&self) -> &Arc<Keeper> {
        &self.keeper
    }

    /// A token that stops the service when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Cancel every task, wait for them and write a final checkpoint.
    pub async fn shutdown(self) -> Result<()> {
        self.cancel.cancel();
        for task in self.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "task ended abnormally");
            }
        }
        self.keeper.persist_all()?;
        info!(keeper = %self.keeper.id, "keeper service stopped");
        Ok(())
    }
}

fn spawn_periodic<F, Fut>(
    name: &'static str,
    period: Duration,
    cancel: CancellationToken,
    job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    spawn_periodic_after(name, period, period, cancel, job)
}

/// Run `job` every `period`, the first time `first` from now.
fn spawn_periodic_after<F, Fut>(
    name: &'static str,
    first: Duration,
    period: Duration,
    cancel: CancellationToken,
    mut job: F,
) -> JoinHandle<()>
where
    F: FnMut() -> Fut + Send + 'static,
    Fut: Future<Output = ()> + Send + 'static,
{
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval_at(Instant::now() + first, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => job().await,
            }
        }
        debug!(task = name, "periodic task stopped");
    })
}

fn spawn_repair_worker(
    keeper: Arc<Keeper>,
    mut queue: mpsc::Receiver<BlockId>,
    cancel: CancellationToken,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                item = queue.recv() => {
                    let Some(block) = item else { break };
                    match keeper.repair_block(&block, now_secs()).await {
                        Ok(outcome) => debug!(block = %block, ?outcome, "repair finished"),
                        Err(e) if e.is_transient() => debug!(block = %block, error = %e, "repair deferred"),
                        Err(e) => warn!(block = %block, error = %e, "repair failed"),
                    }
                }
            }
        }
        debug!("repair worker stopped");
    })
}
