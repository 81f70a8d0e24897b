use previewgate::api::{PKG_NAME, VERSION};
use previewgate::config::Config;
use previewgate::manager::PreviewManager;
use previewgate::pool::PoolConfig;
use previewgate::proxy::{ProxyServer, ServerSettings};
use previewgate::render::ScaffoldRenderer;
use previewgate::store::{AppStore, MemoryStore, SqliteStore};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive("previewgate=debug".parse().expect("valid log directive")),
        )
        .init();

    // Load configuration
    let config_path = std::env::args()
        .nth(1)
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("config.toml"));

    let config = Config::load(&config_path).map_err(|e| {
        error!(path = %config_path.display(), error = %e, "Failed to load configuration");
        e
    })?;

    info!(path = %config_path.display(), "Configuration loaded");

    print_startup_banner(&config);

    let store: Arc<dyn AppStore> = match config.storage.path {
        Some(ref path) => Arc::new(SqliteStore::open(path)?),
        None => {
            warn!("No storage path configured, app definitions are kept in memory");
            Arc::new(MemoryStore::new())
        }
    };

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let manager = PreviewManager::new(&config, store, Arc::new(ScaffoldRenderer));

    // Generate or use configured admin token
    let admin_token = config.server.admin_token.clone().unwrap_or_else(|| {
        let token = uuid::Uuid::new_v4().to_string();
        info!(token = %token, "Generated admin API token (configure admin_token to set a fixed value)");
        token
    });

    let bind_addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;

    let settings = ServerSettings {
        admin_token,
        request_timeout: config.server.request_timeout(),
        max_request_body_bytes: config.server.max_request_body_bytes,
        max_payload_bytes: config.server.max_payload_bytes,
        pool: PoolConfig {
            upstream_host: config.preview.listen_host.clone(),
            max_idle_per_host: config.server.pool_max_idle_per_host,
            idle_timeout: Duration::from_secs(config.server.pool_idle_timeout_secs),
        },
    };

    let server = ProxyServer::new(bind_addr, Arc::clone(&manager), settings, shutdown_rx.clone());
    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Preview server error");
        }
    });

    // Spawn sweep task
    let sweep_manager = Arc::clone(&manager);
    let sweep_interval = config.preview.sweep_interval();
    let sweep_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        sweep_loop(sweep_manager, sweep_interval, sweep_shutdown_rx).await;
    });

    // Wait for shutdown signal (Ctrl+C or SIGTERM)
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            _ = tokio::signal::ctrl_c() => {
                info!("Received SIGINT (Ctrl+C), shutting down...");
            }
            _ = sigterm.recv() => {
                info!("Received SIGTERM, shutting down...");
            }
        }
    }

    #[cfg(not(unix))]
    {
        tokio::signal::ctrl_c().await?;
        info!("Received Ctrl+C, shutting down...");
    }

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    // Wait for the server to stop accepting (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Reclaiming all instances...");
    manager.shutdown().await;

    info!("Shutdown complete");
    Ok(())
}

async fn sweep_loop(manager: Arc<PreviewManager>, interval: Duration, mut shutdown_rx: watch::Receiver<bool>) {
    loop {
        tokio::select! {
            _ = tokio::time::sleep(interval) => {
                manager.reap_overdue().await;
                manager.sweep();
            }
            _ = shutdown_rx.changed() => {
                if *shutdown_rx.borrow() {
                    break;
                }
            }
        }
    }
}

fn print_startup_banner(config: &Config) {
    info!(name = PKG_NAME, version = VERSION, "Starting preview host");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        public_url = %config.server.public_base_url(),
        request_timeout_secs = config.server.request_timeout_secs,
        "Server configuration"
    );
    info!(
        pool_max_idle = config.server.pool_max_idle_per_host,
        pool_idle_timeout_secs = config.server.pool_idle_timeout_secs,
        "Connection pool settings"
    );
    info!(
        max_instances = config.preview.max_concurrent_instances,
        port_range_start = config.preview.port_range_start,
        port_range_end = config.preview.port_range_end,
        ttl_secs = config.preview.default_ttl_secs,
        "Capacity settings"
    );
    info!(
        startup_timeout_secs = config.preview.startup_timeout_secs,
        shutdown_grace_period_secs = config.preview.shutdown_grace_period_secs,
        backend = ?config.preview.backend.as_ref().map(|b| b.command.as_str()),
        "Instance settings"
    );
    info!(
        storage = config.storage.path.as_deref().unwrap_or("memory"),
        "Storage settings"
    );
}
