use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use tollgate::admission::Admission;
use tollgate::config::{StoreKind, TollgateConfig};
use tollgate::http::HttpServer;
use tollgate::mesh::Cluster;
use tollgate::ratelimit::{
    spawn_sweeper, Clock, MemoryWindowStore, MeshWindowStore, PolicyRegistry, PolicyTable,
    RateLimiter, SystemClock, WindowStore,
};

/// Request admission (rate limiting) service.
#[derive(Debug, Parser)]
#[command(name = "tollgate", version, about)]
struct Args {
    /// Configuration file (YAML, TOML or JSON)
    #[arg(short, long, env = "TOLLGATE_CONFIG")]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(long)]
    http_addr: Option<SocketAddr>,

    /// Emit logs as JSON
    #[arg(long)]
    log_json: bool,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();
    init_tracing(args.log_json);

    info!("Starting Tollgate admission service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));

    let mut config = TollgateConfig::load(args.config.as_deref())?;
    if let Some(addr) = args.http_addr {
        config.server.http_addr = addr;
    }
    info!(
        http_addr = %config.server.http_addr,
        store = ?config.rate_limiting.store,
        "Configuration loaded"
    );

    let registry = match &config.rate_limiting.policies_path {
        Some(path) => PolicyRegistry::with_table(&PolicyTable::from_file(path)?)?,
        None => PolicyRegistry::new(),
    };
    for policy in registry.iter() {
        info!(
            policy = %policy.name,
            limit = policy.limit,
            window = ?policy.window,
            on_store_failure = ?policy.on_store_failure,
            "Policy registered"
        );
    }

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let (store, cluster): (Arc<dyn WindowStore>, Option<Arc<Cluster>>) =
        match config.rate_limiting.store {
            StoreKind::Memory => {
                let store: Arc<dyn WindowStore> = Arc::new(MemoryWindowStore::new(clock.clone()));
                (store, None)
            }
            StoreKind::Mesh => {
                let cluster = Arc::new(Cluster::start(config.mesh.cluster_config()).await?);
                let store: Arc<dyn WindowStore> = Arc::new(
                    MeshWindowStore::new(cluster.clone(), clock.clone())
                        .with_timeout(config.rate_limiting.store_timeout()),
                );
                (store, Some(cluster))
            }
        };

    let sweeper = spawn_sweeper(
        store.clone(),
        config.rate_limiting.sweep_interval(),
        config.rate_limiting.sweep_grace_multiple,
    );

    let limiter = Arc::new(RateLimiter::with_store(registry, store, clock));
    info!("Rate limiter initialized");

    let server = HttpServer::new(config.server.http_addr, Admission::new(limiter));
    server.serve_with_shutdown(shutdown_signal()).await?;

    sweeper.abort();
    let _ = sweeper.await;

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still referenced at shutdown, skipping graceful leave"),
        }
    }

    info!("Tollgate admission service stopped");
    Ok(())
}

fn init_tracing(json: bool) {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info"));
    let builder = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if json {
        builder.json().init();
    } else {
        builder.init();
    }
}

/// Wait for a shutdown signal (Ctrl+C or SIGTERM).
async fn shutdown_signal() {
    let ctrl_c = async {
        signal::ctrl_c()
            .await
            .expect("Failed to install Ctrl+C handler");
    };

    #[cfg(unix)]
    let terminate = async {
        signal::unix::signal(signal::unix::SignalKind::terminate())
            .expect("Failed to install SIGTERM handler")
            .recv()
            .await;
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, initiating graceful shutdown");
        }
        _ = terminate => {
            info!("Received SIGTERM, initiating graceful shutdown");
        }
    }
}
