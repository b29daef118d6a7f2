use std::fs::OpenOptions;
use std::path::Path;

use quorum_engine::Error;
use quorum_engine::NetworkError;
use quorum_engine::PeerBuilder;
use quorum_engine::PeerId;
use quorum_engine::QuorumNodeConfig;
use quorum_engine::Result;
use quorum_engine::StorageError;
use tokio::signal::unix::signal;
use tokio::signal::unix::SignalKind;
use tokio::sync::watch;
use tracing::error;
use tracing::info;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::layer::SubscriberExt;
use tracing_subscriber::util::SubscriberInitExt;
use tracing_subscriber::EnvFilter;
use tracing_subscriber::Layer;

#[tokio::main(flavor = "multi_thread", worker_threads = 2)]
async fn main() -> Result<()> {
    // Initializing Shutdown Signal
    let (graceful_tx, graceful_rx) = watch::channel(());

    let cluster_path = std::env::args().nth(1);
    let config = QuorumNodeConfig::load(cluster_path.as_deref())?;
    let _guard = init_observability(config.cluster.my_id()?, &config.cluster.log_dir)?;
    if let Some(path) = &cluster_path {
        info!("with_override_config from: {}", path);
    }

    // Build Peer
    let peer = PeerBuilder::init(config, graceful_rx.clone())
        .start_metrics_server(graceful_rx.clone())
        .build()?;

    info!("Peer {} started. Waiting for CTRL+C signal...", peer.my_id());
    // Listen on Shutdown Signal
    tokio::spawn(async {
        if let Err(e) = graceful_shutdown(graceful_tx).await {
            error!("Failed to shutdown: {:?}", e);
        }
    });

    // Start Peer
    if let Err(e) = peer.run().await {
        error!("peer stops: {:?}", e);
        return Err(e);
    }

    println!("Exiting program.");
    Ok(())
}

async fn graceful_shutdown(graceful_tx: watch::Sender<()>) -> Result<()> {
    let mut sigint = signal(SignalKind::interrupt()).map_err(NetworkError::Io)?;
    let mut sigterm = signal(SignalKind::terminate()).map_err(NetworkError::Io)?;
    tokio::select! {
        _ = sigint.recv() => {
            info!("SIGINT detected.");
        },
        _ = sigterm.recv() => {
            info!("SIGTERM detected.");
        },
        _ = tokio::signal::ctrl_c() => {
            info!("Ctrl+C detected.");
        },
    }

    info!("Shutdown peer..");
    graceful_tx.send(()).map_err(|e| {
        error!("Failed to send shutdown signal: {}", e);
        Error::from(NetworkError::SignalSendFailed(format!(
            "Failed to send shutdown signal: {}",
            e
        )))
    })?;

    info!("Shutdown completed");
    Ok(())
}

pub fn init_observability(
    my_id: PeerId,
    log_dir: &Path,
) -> Result<WorkerGuard> {
    let dir = log_dir.join(my_id.to_string());
    std::fs::create_dir_all(&dir).map_err(|source| StorageError::PathError {
        path: dir.clone(),
        source,
    })?;
    let path = dir.join("quorum.log");
    let log_file = OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .map_err(|source| StorageError::PathError { path, source })?;

    let (non_blocking, guard) = tracing_appender::non_blocking(log_file);
    let base_subscriber = tracing_subscriber::fmt::layer()
        .with_writer(non_blocking)
        .with_filter(EnvFilter::from_default_env());
    tracing_subscriber::registry().with(base_subscriber).init();

    Ok(guard)
}
