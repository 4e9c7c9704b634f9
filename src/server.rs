use crate::api::GatewayApi;
use crate::audit::AuditLogger;
use crate::config::Config;
use crate::coordinator::SharedCoordinator;
use crate::inspector::ProcessInspector;
use crate::launch::ProofLauncher;
use crate::ratelimit::{RateLimitStore, RateLimiter};
use crate::supervisor::{ProcessSupervisor, SupervisorSettings, SupervisorState};
use crate::validate::PathPolicy;
use hyper::service::service_fn;
use hyper_util::rt::{TokioExecutor, TokioIo};
use hyper_util::server::conn::auto::Builder as AutoBuilder;
use std::net::SocketAddr;
use std::sync::Arc;
use tokio::net::{TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{debug, error, info};

/// Components of a running gateway, wired from configuration
pub struct Gateway {
    pub api: Arc<GatewayApi>,
    pub limiter: Arc<RateLimiter>,
    pub supervisor: Arc<ProcessSupervisor>,
}

impl Gateway {
    pub fn new(config: &Config, coordinator: SharedCoordinator, inspector: Arc<dyn ProcessInspector>) -> Self {
        Self::with_settings(config, coordinator, inspector, SupervisorSettings::from_config(config))
    }

    /// Like [`Gateway::new`] with explicit supervisor settings
    pub fn with_settings(
        config: &Config,
        coordinator: SharedCoordinator,
        inspector: Arc<dyn ProcessInspector>,
        settings: SupervisorSettings,
    ) -> Self {
        let audit = AuditLogger::new(config.audit.enabled);
        let limiter = Arc::new(RateLimiter::from_config(RateLimitStore::new(), &config.rate_limit));
        let launcher = ProofLauncher::new(
            Arc::clone(&coordinator),
            Arc::clone(&limiter),
            audit.clone(),
            config.limits.max_compute_capacity,
            PathPolicy {
                allowed_input_roots: config.limits.allowed_input_roots.clone(),
                base_dir: None,
            },
        );
        let supervisor = ProcessSupervisor::new(settings, SupervisorState::new(), inspector, audit);
        let api = GatewayApi::new(coordinator, launcher, Arc::clone(&supervisor), &config.server);

        Self {
            api,
            limiter,
            supervisor,
        }
    }
}

/// HTTP listener for the gateway API
pub struct GatewayServer {
    listener: TcpListener,
    api: Arc<GatewayApi>,
    shutdown_rx: watch::Receiver<bool>,
}

impl GatewayServer {
    pub async fn bind(
        addr: SocketAddr,
        api: Arc<GatewayApi>,
        shutdown_rx: watch::Receiver<bool>,
    ) -> anyhow::Result<Self> {
        let listener = TcpListener::bind(addr)
            .await
            .map_err(|e| anyhow::anyhow!("Failed to bind {}: {}", addr, e))?;
        Ok(Self {
            listener,
            api,
            shutdown_rx,
        })
    }

    pub fn local_addr(&self) -> std::io::Result<SocketAddr> {
        self.listener.local_addr()
    }

    pub async fn run(self) -> anyhow::Result<()> {
        let addr = self.local_addr()?;
        info!(addr = %addr, "Gateway listening (HTTP/1.1 and HTTP/2)");

        let mut shutdown_rx = self.shutdown_rx.clone();

        loop {
            tokio::select! {
                result = self.listener.accept() => {
                    match result {
                        Ok((stream, peer)) => {
                            let api = Arc::clone(&self.api);
                            tokio::spawn(async move {
                                if let Err(e) = serve_connection(stream, peer, api).await {
                                    debug!(peer = %peer, error = %e, "Connection error");
                                }
                            });
                        }
                        Err(e) => {
                            error!(error = %e, "Failed to accept connection");
                        }
                    }
                }
                _ = shutdown_rx.changed() => {
                    if *shutdown_rx.borrow() {
                        info!("Gateway server shutting down");
                        break;
                    }
                }
            }
        }

        Ok(())
    }
}

async fn serve_connection(stream: TcpStream, peer: SocketAddr, api: Arc<GatewayApi>) -> anyhow::Result<()> {
    let _ = stream.set_nodelay(true);
    let io = TokioIo::new(stream);
    let service = service_fn(move |req| {
        let api = Arc::clone(&api);
        async move { api.handle(req, peer).await }
    });

    AutoBuilder::new(TokioExecutor::new())
        .serve_connection(io, service)
        .await
        .map_err(|e| anyhow::anyhow!("Connection error: {}", e))?;

    Ok(())
}
