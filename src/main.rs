use std::path::{Path, PathBuf};
use std::sync::Arc;

use thiserror::Error;
use tracing::{error, info, warn};

use bitcoind_ledger_sync::daemon::config::{ConfigError, DaemonConfig};
use bitcoind_ledger_sync::daemon::registry::GatewayRegistry;
use bitcoind_ledger_sync::daemon::rpc::RpcError;
use bitcoind_ledger_sync::ledger::store::{LedgerStore, StoreError};
use bitcoind_ledger_sync::sync::engine::ReconcileEngine;
use bitcoind_ledger_sync::sync::events::LogSink;
use bitcoind_ledger_sync::sync::subscriber::{EventSubscriber, ZmqFeed};
use bitcoind_ledger_sync::sync::{FeedError, SyncError};

#[derive(Debug, Error)]
enum ServiceError {
    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error(transparent)]
    Rpc(#[from] RpcError),

    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Feed(#[from] FeedError),

    #[error(transparent)]
    Sync(#[from] SyncError),
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("bitcoind_ledger_sync=debug".parse().unwrap())
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_target(false)
        .with_thread_ids(false)
        .with_thread_names(false)
        .with_file(false)
        .with_line_number(false)
        .with_timer(tracing_subscriber::fmt::time::time())
        .init();

    info!("Starting ledger sync service");

    let conf_dir = std::env::var("BITCOIND_CONF_DIR").unwrap_or_else(|_| "./conf".to_string());
    let data_dir =
        PathBuf::from(std::env::var("LEDGER_DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

    let confs = match DaemonConfig::enumerate(Path::new(&conf_dir)) {
        Ok(confs) => confs,
        Err(e) => {
            error!("Failed to read daemon configurations from {conf_dir}: {e}");
            return;
        }
    };
    if confs.is_empty() {
        error!("No daemon configurations found in {conf_dir}");
        return;
    }

    if let Err(e) = std::fs::create_dir_all(&data_dir) {
        error!("Failed to create data directory {}: {e}", data_dir.display());
        return;
    }

    let registry = Arc::new(GatewayRegistry::new());

    let mut tasks = Vec::new();
    for conf in confs {
        let instance = conf.instance.clone();
        let registry = registry.clone();
        let data_dir = data_dir.clone();
        info!(%instance, "starting instance task");
        tasks.push(tokio::spawn(async move {
            if let Err(e) = run_instance(conf, registry, &data_dir).await {
                error!(%instance, "instance task failed: {e}");
            }
        }));
    }

    match tokio::signal::ctrl_c().await {
        Ok(()) => info!("Shutdown signal received"),
        Err(e) => error!("Failed to listen for shutdown signal: {e}"),
    }

    for task in tasks {
        task.abort();
    }
    info!("Ledger sync service stopped");
}

/// Run one daemon instance to completion: open its ledger, reconcile once
/// against current wallet state, then follow notifications for as long as
/// the feed stays up.
async fn run_instance(
    conf: DaemonConfig,
    registry: Arc<GatewayRegistry>,
    data_dir: &Path,
) -> Result<(), ServiceError> {
    let gateway = registry.gateway(&conf)?;

    let info = gateway.get_blockchain_info().await?;
    info!(
        instance = %conf.instance,
        chain = %info.chain,
        blocks = info.blocks,
        "connected to daemon"
    );

    let db_path = data_dir.join(format!("{}.db", conf.instance));
    let store = LedgerStore::open(&db_path).await?;

    let engine = ReconcileEngine::new(gateway, store, Arc::new(LogSink));

    // Catch up on anything that moved while we were down.
    engine.rescan().await?;

    let Some(endpoint) = conf.notification_endpoint() else {
        warn!(
            instance = %conf.instance,
            "no notification endpoint configured, initial reconciliation only"
        );
        return Ok(());
    };

    let mut feed = ZmqFeed::connect(endpoint)?;
    let mut subscriber = EventSubscriber::new(engine);
    subscriber.run(&mut feed).await?;
    Ok(())
}
