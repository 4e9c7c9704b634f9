use proofgate::api::{PKG_NAME, VERSION};
use proofgate::config::Config;
use proofgate::coordinator::{GrpcCoordinator, SharedCoordinator};
use proofgate::inspector::SystemInspector;
use proofgate::ratelimit::RateLimiter;
use proofgate::server::{Gateway, GatewayServer};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{error, info, warn};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Load configuration before logging so the debug flag can raise the level
    let config_path = std::env::args().nth(1).map(PathBuf::from);
    let loaded = Config::load(config_path.as_deref());
    init_tracing(loaded.as_ref().map(|c| c.debug).unwrap_or(false))?;

    let config = loaded.map_err(|e| {
        error!(path = ?config_path, error = %e, "Failed to load configuration");
        e
    })?;

    print_startup_banner(&config, config_path.as_ref());

    // Create shutdown channel
    let (shutdown_tx, shutdown_rx) = watch::channel(false);

    let coordinator: SharedCoordinator = Arc::new(GrpcCoordinator::new(&config.coordinator, config.debug)?);
    let gateway = Gateway::new(&config, coordinator, Arc::new(SystemInspector));

    let addr: SocketAddr = format!("{}:{}", config.server.bind, config.server.port)
        .parse()
        .map_err(|e| {
            error!(bind = %config.server.bind, port = config.server.port, error = %e, "Invalid bind address");
            anyhow::anyhow!("Invalid bind address: {}", e)
        })?;
    let server = GatewayServer::bind(addr, Arc::clone(&gateway.api), shutdown_rx.clone()).await?;

    // Spawn rate limit sweeper
    let sweeper: Arc<RateLimiter> = Arc::clone(&gateway.limiter);
    let sweep_interval = config.rate_limit.sweep_interval();
    let sweeper_shutdown_rx = shutdown_rx.clone();
    tokio::spawn(async move {
        sweeper.run_sweeper(sweep_interval, sweeper_shutdown_rx).await;
    });

    let server_handle = tokio::spawn(async move {
        if let Err(e) = server.run().await {
            error!(error = %e, "Gateway server error");
        }
    });

    wait_for_shutdown_signal().await?;

    // Signal shutdown
    let _ = shutdown_tx.send(true);

    if config.processes.stop_on_exit {
        info!("Stopping managed processes...");
        gateway.supervisor.stop_all_managed().await;
    } else {
        warn!("Leaving managed processes running (stop_on_exit disabled)");
    }

    // Wait for the server to stop (with timeout)
    let _ = tokio::time::timeout(Duration::from_secs(5), server_handle).await;

    info!("Shutdown complete");
    Ok(())
}

fn init_tracing(debug: bool) -> anyhow::Result<()> {
    let level = if debug { "proofgate=debug" } else { "proofgate=info" };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(level.parse()?)
                .add_directive("audit=info".parse()?),
        )
        .init();
    Ok(())
}

/// Wait for Ctrl+C or SIGTERM
async fn wait_for_shutdown_signal() -> anyhow::Result<()> {
    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;

        tokio::select! {
            result = tokio::signal::ctrl_c() => {
                result?;
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

    Ok(())
}

fn print_startup_banner(config: &Config, config_path: Option<&PathBuf>) {
    info!(name = PKG_NAME, version = VERSION, config = ?config_path, "Starting gateway");
    info!(
        bind = %config.server.bind,
        port = config.server.port,
        cors_origins = ?config.server.cors_origins,
        trust_proxy = config.server.trust_proxy,
        "Server configuration"
    );
    info!(
        url = %config.coordinator.url,
        rpc_timeout_ms = config.coordinator.rpc_timeout_ms,
        connect_timeout_ms = config.coordinator.connect_timeout_ms,
        "Coordinator settings"
    );
    info!(
        window_ms = config.rate_limit.window_ms,
        max_requests = config.rate_limit.max_requests,
        max_compute_capacity = config.limits.max_compute_capacity,
        allowed_input_roots = ?config.limits.allowed_input_roots,
        "Admission control"
    );
    info!(
        coordinator = %config.processes.coordinator_name,
        worker = %config.processes.worker_name,
        repo_root = ?config.processes.repo_root,
        stop_on_exit = config.processes.stop_on_exit,
        "Process supervision"
    );
    if config.debug {
        warn!("Debug mode: raw coordinator errors are written to the local log");
    }
}
