mod api;
mod constants;

use std::{net::SocketAddr, path::PathBuf, sync::Arc, time::Duration};

use anyhow::Context;
use api::{AppState, SharedLedger};
use camledger_core::{BlockchainConfig, BlockchainManager};
use camledger_storage::{open_backend, Backend};
use clap::Parser;
use constants::{DEFAULT_DATA_DIR, DEFAULT_LISTEN, UPDATE_PERIOD_MS};
use tokio::{sync::Mutex, task::JoinHandle, time::MissedTickBehavior};
use tracing::{info, warn};

#[derive(Parser, Debug)]
#[command(name = "camledger-node", version, about = "Camera integrity ledger node")]
struct Args {
    /// Address to listen on, e.g. 127.0.0.1:8080
    #[arg(long, default_value = DEFAULT_LISTEN)]
    listen: String,

    /// Data directory for chain.json and the block files
    #[arg(long, default_value = DEFAULT_DATA_DIR)]
    data_dir: PathBuf,

    /// Ledger config as JSON; missing fields take their defaults
    #[arg(long)]
    config: Option<PathBuf>,

    /// Storage backend: fs or sled
    #[arg(long, default_value_t = Backend::Fs)]
    backend: Backend,

    /// Override node_id from the config
    #[arg(long)]
    node_id: Option<String>,

    /// Directory that `path` payloads may read from; without it, producers
    /// must send a digest or inline text
    #[arg(long)]
    capture_dir: Option<PathBuf>,

    /// Milliseconds between ledger update passes
    #[arg(long, default_value_t = UPDATE_PERIOD_MS)]
    update_ms: u64,
}

fn load_config(args: &Args) -> anyhow::Result<BlockchainConfig> {
    let mut config = match &args.config {
        Some(path) => BlockchainConfig::from_file(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => BlockchainConfig::default(),
    };
    if let Some(node_id) = &args.node_id {
        config.node_id = node_id.clone();
    }
    Ok(config)
}

/// Drive `update()` on a fixed period. A slow pass delays the next one
/// instead of bursting to catch up.
fn spawn_update_loop(ledger: SharedLedger, period: Duration) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);
        loop {
            ticker.tick().await;
            if let Err(e) = ledger.lock().await.update() {
                warn!("ledger update failed: {e}");
            }
        }
    })
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        warn!("failed to listen for ctrl-c: {e}");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .init();

    let args = Args::parse();
    let config = load_config(&args)?;
    let storage = open_backend(args.backend, &args.data_dir)
        .with_context(|| format!("open {} storage at {}", args.backend, args.data_dir.display()))?;

    let mut manager = BlockchainManager::with_system_clock(storage);
    manager.initialize(config).context("initialize ledger")?;
    let ledger: SharedLedger = Arc::new(Mutex::new(manager));

    let updater = spawn_update_loop(ledger.clone(), Duration::from_millis(args.update_ms.max(10)));
    let capture_dir = match &args.capture_dir {
        Some(dir) => {
            let dir = dir
                .canonicalize()
                .with_context(|| format!("capture directory {}", dir.display()))?;
            info!(capture_dir = %dir.display(), "path payloads enabled");
            Some(Arc::new(dir))
        }
        None => None,
    };
    let app = api::router(AppState {
        ledger: ledger.clone(),
        capture_dir,
    });

    let addr: SocketAddr = args
        .listen
        .parse()
        .with_context(|| format!("invalid listen address {}", args.listen))?;
    info!("camledger-node listening on http://{addr}");
    axum::serve(tokio::net::TcpListener::bind(addr).await?, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    updater.abort();
    if let Err(e) = ledger.lock().await.save_chain() {
        warn!("final chain save failed: {e}");
    }
    info!("camledger-node stopped");
    Ok(())
}
