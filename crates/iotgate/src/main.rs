//! IoT Gateway Server
//!
//! Serves device-management commands over TCP, UDP and HTTP, with commands
//! extensible through plugins.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use anyhow::{Context, Result};
use clap::Parser;
use tokio::net::TcpListener;
use tracing::{info, warn};
use tracing_subscriber::{EnvFilter, layer::SubscriberExt, util::SubscriberInitExt};

use iotgate::command::{CommandRegistry, CommandRouter, Dependencies, register_builtins};
use iotgate::config::GatewayConfig;
use iotgate::net::{NetworkServer, create_router};
use iotgate::plugin::{PluginLoader, PluginWatcher};
use iotgate::pool::WorkerPool;
use iotgate::store::MemoryStore;

/// How long in-flight requests get to finish on shutdown
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// IoT Device-Management Gateway
#[derive(Parser, Debug)]
#[command(name = "iotgate")]
#[command(about = "IoT Device-Management Gateway", long_about = None)]
struct Args {
    /// Path to the configuration file
    #[arg(short, long)]
    config: Option<PathBuf>,

    /// Listen address, overrides the config file
    #[arg(long)]
    host: Option<String>,

    /// Worker thread count, overrides the config file
    #[arg(long)]
    workers: Option<usize>,

    /// Plugin directory, overrides the config file
    #[arg(long)]
    plugin_dir: Option<PathBuf>,

    /// Don't watch the plugin directory for new archives
    #[arg(long)]
    no_watch: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    // Initialize tracing
    tracing_subscriber::registry()
        .with(
            EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| EnvFilter::new("iotgate=info,plugin=info,tower_http=debug")),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();

    // Parse command line arguments
    let args = Args::parse();

    info!("Starting IoT gateway v{}", env!("CARGO_PKG_VERSION"));

    let mut config = match &args.config {
        Some(path) => GatewayConfig::load(path)
            .with_context(|| format!("Failed to load config from {}", path.display()))?,
        None => GatewayConfig::default(),
    };
    if let Some(host) = args.host {
        config.server.host = host;
    }
    if let Some(workers) = args.workers {
        config.pool.workers = workers;
    }
    if let Some(dir) = args.plugin_dir {
        config.plugins.directory = dir;
    }
    if args.no_watch {
        config.plugins.watch = false;
    }

    // Create core components
    let dependencies = Dependencies::new(Arc::new(MemoryStore::new()));
    let registry = Arc::new(CommandRegistry::new(dependencies));
    register_builtins(&registry);

    let pool = WorkerPool::with_name(&config.pool.name, config.pool.workers)
        .context("Failed to start worker pool")?;
    let router = CommandRouter::new(Arc::clone(&registry), pool.clone());

    // Plugins
    std::fs::create_dir_all(&config.plugins.directory).with_context(|| {
        format!(
            "Failed to create plugin directory {}",
            config.plugins.directory.display()
        )
    })?;
    let loader = Arc::new(PluginLoader::new(
        Arc::clone(&registry),
        config.plugins.clone(),
        tokio::runtime::Handle::current(),
    ));
    loader.scan().await;

    if config.plugins.watch {
        match PluginWatcher::new(Arc::clone(&loader)) {
            Ok(watcher) => {
                tokio::spawn(watcher.run());
            }
            Err(e) => warn!("Plugin hot-loading disabled: {}", e),
        }
    }
    info!("Commands available: {}", registry.names().join(", "));

    // TCP/UDP event loop
    let network = NetworkServer::bind(&config.server)
        .context("Failed to bind TCP/UDP listeners")?
        .start(Arc::new(router.clone()))
        .context("Failed to start network event loop")?;

    // HTTP
    match config.server.http_port {
        Some(port) => {
            let app = create_router(
                router.clone(),
                &config.server.http_route,
                config.server.http_response_timeout(),
            );
            let listener = TcpListener::bind((config.server.host.as_str(), port))
                .await
                .with_context(|| {
                    format!("Failed to bind HTTP listener on {}:{}", config.server.host, port)
                })?;
            let addr = listener.local_addr()?;
            info!(
                "HTTP listening on http://{}{}",
                addr, config.server.http_route
            );

            axum::serve(listener, app)
                .with_graceful_shutdown(shutdown_signal())
                .await?;
        }
        None => shutdown_signal().await,
    }

    // Stop taking requests, then let queued ones finish
    info!("Shutting down...");
    tokio::task::spawn_blocking(move || network.shutdown()).await?;

    pool.shutdown();
    let drain_pool = pool.clone();
    let drained = tokio::task::spawn_blocking(move || drain_pool.await_termination(DRAIN_TIMEOUT))
        .await?;
    if !drained {
        warn!(
            "Worker pool still busy after {:?}, {} task(s) abandoned",
            DRAIN_TIMEOUT,
            pool.status().queued_tasks
        );
    }

    loader.stop_all().await;
    info!("Server shutdown complete");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!("Failed to listen for Ctrl+C: {}", e);
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                warn!("Failed to install SIGTERM handler: {}", e);
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {
            info!("Received Ctrl+C, shutting down...");
        },
        _ = terminate => {
            info!("Received terminate signal, shutting down...");
        },
    }
}
