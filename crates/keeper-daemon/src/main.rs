//! keeperd: the Keeper node daemon.
//!
//! Single OS process running a Tokio async runtime. It opens the local store,
//! loads or creates the keeper identity, starts the engine's periodic tasks
//! and runs until Ctrl-C.

mod config;
mod ledger;
mod standalone;

use std::sync::Arc;

use keeper_core::service::Collaborators;
use keeper_core::{Keeper, KeeperService};
use keeper_db::SqliteStore;
use tracing::{info, warn};

use crate::config::DaemonConfig;
use crate::ledger::FileLedger;
use crate::standalone::{load_or_create_identity, RejectAll, Unattached};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // 1. Load config
    let config = DaemonConfig::load()?;

    // Covers every keeper_* crate and the keeperd binary.
    let directive = format!("keeper={}", config.node.log_level);
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env().add_directive(directive.parse()?),
        )
        .init();

    info!("Keeper daemon starting");

    let data_dir = config.data_dir();
    std::fs::create_dir_all(&data_dir)?;

    // 2. Open the local store
    let store = Arc::new(SqliteStore::open(&data_dir.join("keeper.db"))?);

    // 3. Identity
    let signing_key = load_or_create_identity(store.as_ref())?;

    // 4. Collaborators
    let ledger_path = config.ledger_path();
    info!(path = %ledger_path.display(), "using file ledger");
    warn!("no peer network or proof library attached; proofs will be refused");
    let keeper = Keeper::new(
        signing_key,
        config.to_core(),
        Collaborators {
            store,
            messenger: Arc::new(Unattached),
            chain: Arc::new(FileLedger::new(ledger_path)),
            verifier: Arc::new(RejectAll),
        },
    );
    info!(keeper = %keeper.id(), "identity loaded");

    // 5. Start the engine
    let service = KeeperService::start(keeper).await?;

    // 6. Run until shutdown
    let cancel = service.cancellation_token();
    tokio::select! {
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl-C received, shutting down");
        }
        _ = cancel.cancelled() => {
            info!("Shutdown requested");
        }
    }

    // Graceful shutdown
    service.shutdown().await?;
    info!("Daemon stopped");
    Ok(())
}
