use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;

use anyhow::Context;
use clap::Parser;
use tokio::signal;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

use floodgate::config::{FloodgateConfig, LoggingConfig, StoreBackend};
use floodgate::mesh::Cluster;
use floodgate::throttle::{
    Clock, CounterStore, MemoryStore, MeshStore, RuleSet, RulesConfig, SystemClock, Throttler,
};
use floodgate::web::HttpServer;

/// Fixed-window request throttling server.
#[derive(Debug, Parser)]
#[command(name = "floodgate", version, about)]
struct Args {
    /// Path to a YAML configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Override the HTTP listen address
    #[arg(short, long)]
    listen: Option<SocketAddr>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let args = Args::parse();

    let mut config = FloodgateConfig::load(args.config.as_deref())
        .context("Failed to load configuration")?;
    if let Some(listen) = args.listen {
        config.server.listen_addr = listen;
    }

    init_tracing(&config.logging);

    info!("Starting Floodgate Throttling Service");
    info!("Version: {}", env!("CARGO_PKG_VERSION"));
    info!(
        listen_addr = %config.server.listen_addr,
        store = ?config.throttling.store,
        failure_policy = ?config.throttling.failure_policy,
        "Configuration loaded"
    );

    let rules = match &config.throttling.rules_path {
        Some(path) => RulesConfig::from_file(path)?.into_rule_set()?,
        None => {
            warn!("No rules configured; every request will be allowed");
            RuleSet::default()
        }
    };
    info!(rules = rules.len(), "Throttle rules loaded");

    let clock: Arc<dyn Clock> = Arc::new(SystemClock::new());
    let sweep_interval = config.throttling.sweep_interval();

    let (store, cluster): (Arc<dyn CounterStore>, Option<Arc<Cluster>>) =
        match config.throttling.store {
            StoreBackend::Memory => {
                let store = Arc::new(MemoryStore::with_clock(clock.clone()));
                store.spawn_sweeper(sweep_interval);
                (store, None)
            }
            StoreBackend::Mesh => {
                let cluster = Arc::new(Cluster::start(config.mesh.to_cluster_config()).await?);
                let store = Arc::new(MeshStore::new(cluster.clone(), clock.clone()));
                store.spawn_sweeper(sweep_interval);
                (store, Some(cluster))
            }
        };

    let throttler = Throttler::new(rules, store, clock)
        .with_failure_policy(config.throttling.failure_policy);
    info!("Throttler initialized");

    let server = HttpServer::new(config.server.listen_addr, Arc::new(throttler))
        .with_trusted_proxies(config.server.trusted_proxies.clone());

    // Run the server with graceful shutdown on Ctrl+C
    server.serve_with_shutdown(shutdown_signal()).await?;

    if let Some(cluster) = cluster {
        match Arc::try_unwrap(cluster) {
            Ok(cluster) => cluster.shutdown().await?,
            Err(_) => warn!("Cluster still in use; skipping graceful leave"),
        }
    }

    info!("Floodgate Throttling Service stopped");
    Ok(())
}

fn init_tracing(logging: &LoggingConfig) {
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    let subscriber = tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_target(false)
        .with_thread_ids(true);

    if logging.json {
        subscriber.json().init();
    } else {
        subscriber.init();
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
