//! Gateway server

use std::net::SocketAddr;
use std::sync::Arc;

use tokio::net::TcpListener;
use tokio::signal;
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use super::router::{AppState, create_router};
use crate::audit::{AuditLog, AuditLogger};
use crate::auth::{JwtVerifier, provider_for};
use crate::config::Config;
use crate::mirror::MirrorEngine;
use crate::peer::StaticPeerRouter;
use crate::ports::{DynamicPortManager, PortConfigClient};
use crate::proxy::{ProxyEngine, ProxySettings};
use crate::{Error, Result, firewall};

/// Headend server
pub struct Gateway {
    /// Configuration
    config: Config,
}

/// Everything `serve` wires together, kept for teardown
struct Components {
    state: Arc<AppState>,
    mirror: Option<Arc<MirrorEngine>>,
}

impl Gateway {
    /// Create a new gateway. Configuration errors are fatal here.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        Ok(Self { config })
    }

    /// Configuration in use
    #[must_use]
    pub fn config(&self) -> &Config {
        &self.config
    }

    /// Run until SIGINT/SIGTERM
    pub async fn run(self) -> Result<()> {
        let shutdown = CancellationToken::new();
        tokio::spawn(shutdown_signal(shutdown.clone()));
        self.run_until(shutdown).await
    }

    /// Bind the HTTP port and run until `shutdown` fires
    pub async fn run_until(self, shutdown: CancellationToken) -> Result<()> {
        let addr = SocketAddr::new(
            self.config
                .server
                .host
                .parse()
                .map_err(|e| Error::Config(format!("Invalid host: {e}")))?,
            self.config.server.http_port,
        );
        let listener = TcpListener::bind(addr).await?;
        self.serve(listener, shutdown).await
    }

    /// Serve HTTP on `listener` and the relay ports until `shutdown` fires
    pub async fn serve(self, listener: TcpListener, shutdown: CancellationToken) -> Result<()> {
        let components = self.start_components(&shutdown).await?;
        let app = create_router(Arc::clone(&components.state));

        info!("============================================================");
        info!("ZTNA HEADEND v{}", env!("CARGO_PKG_VERSION"));
        info!("============================================================");
        info!(addr = %listener.local_addr()?, "HTTP proxy listening");
        info!(
            mode = self.config.auth.mode.as_str(),
            firewall = self.config.firewall.enabled,
            mirror = self.config.mirror.enabled,
            dynamic_ports = self.config.dynamic_ports.enabled,
            "Components"
        );
        if let Some(ports) = &components.state.static_ports {
            info!(listeners = ports.listener_count(), "Static relay ports open");
        }
        info!("============================================================");

        let served = axum::serve(listener, app.into_make_service_with_connect_info::<SocketAddr>())
            .with_graceful_shutdown(shutdown.clone().cancelled_owned())
            .await
            .map_err(|e| Error::Internal(e.to_string()));

        // Background tasks watch the same token
        shutdown.cancel();
        info!("Shutting down listeners...");
        let teardown = async {
            if let Some(ports) = &components.state.dynamic_ports {
                ports.stop().await;
            }
            if let Some(ports) = &components.state.static_ports {
                ports.stop().await;
            }
            if let Some(mirror) = &components.mirror {
                mirror.stop().await;
            }
        };
        if tokio::time::timeout(self.config.server.shutdown_timeout, teardown)
            .await
            .is_err()
        {
            warn!("Shutdown timed out, abandoning remaining tasks");
        }

        served
    }

    async fn start_components(&self, shutdown: &CancellationToken) -> Result<Components> {
        let config = &self.config;

        #[cfg(feature = "metrics")]
        let prometheus = match metrics_exporter_prometheus::PrometheusBuilder::new().install_recorder() {
            Ok(handle) => Some(handle),
            Err(e) => {
                warn!(error = %e, "Metrics recorder unavailable");
                None
            }
        };

        let verifier = Arc::new(JwtVerifier::new(&config.auth)?);
        if let Err(e) = verifier.refresh(true).await {
            warn!(error = %e, "Initial verification key fetch failed, retrying on demand");
        }
        verifier.spawn_refresh(shutdown.clone());
        let auth = provider_for(config.auth.mode, &config.auth.backend_url, verifier);

        let audit: Arc<dyn AuditLog> = match config.audit.collector_addr() {
            Some(addr) => Arc::new(AuditLogger::with_collector(
                addr,
                config.audit.queue_size,
                shutdown.clone(),
            )),
            None => Arc::new(AuditLogger::tracing_only()),
        };

        let mut engine = ProxyEngine::new(auth, ProxySettings::from(&config.server))
            .with_firewall(firewall::from_config(&config.firewall)?)
            .with_audit(audit)
            .with_peers(Arc::new(StaticPeerRouter::new(config.routing.peers.clone())));

        let mirror = if config.mirror.enabled {
            let mirror = Arc::new(MirrorEngine::new(
                config.mirror.clone(),
                config.server.gateway_id.clone(),
            ));
            mirror.start().await?;
            engine = engine.with_mirror(Arc::clone(&mirror));
            Some(mirror)
        } else {
            None
        };
        let engine = Arc::new(engine);

        let static_ports = self.start_static_ports(&engine).await?;
        let dynamic_ports = self.start_dynamic_ports(&engine, shutdown).await?;

        let state = Arc::new(AppState {
            engine,
            static_ports,
            dynamic_ports,
            firewall_enabled: config.firewall.enabled,
            metrics_token: config.metrics.resolve_token(),
            #[cfg(feature = "metrics")]
            prometheus,
        });
        Ok(Components { state, mirror })
    }

    /// The fixed `tcp_port`/`udp_port` relays run on their own manager
    async fn start_static_ports(&self, engine: &Arc<ProxyEngine>) -> Result<Option<Arc<DynamicPortManager>>> {
        let server = &self.config.server;
        let expr = |port: u16| if port == 0 { String::new() } else { port.to_string() };
        let (tcp, udp) = (expr(server.tcp_port), expr(server.udp_port));
        if tcp.is_empty() && udp.is_empty() {
            return Ok(None);
        }

        let manager = Arc::new(DynamicPortManager::new(server.host.clone()));
        manager.set_tcp_handler(engine.tcp_handler());
        manager.set_udp_handler(engine.udp_handler());
        manager.parse_port_ranges(&tcp, &udp)?;
        manager.start_listening().await?;
        Ok(Some(manager))
    }

    async fn start_dynamic_ports(
        &self,
        engine: &Arc<ProxyEngine>,
        shutdown: &CancellationToken,
    ) -> Result<Option<Arc<DynamicPortManager>>> {
        let config = &self.config.dynamic_ports;
        if !config.enabled {
            return Ok(None);
        }

        let manager = Arc::new(DynamicPortManager::new(config.bind_host.clone()));
        manager.set_tcp_handler(engine.tcp_handler());
        manager.set_udp_handler(engine.udp_handler());
        manager.parse_port_ranges(&config.tcp_ranges, &config.udp_ranges)?;
        match manager.start_listening().await {
            Ok(opened) => info!(listeners = opened, "Dynamic ports started from initial ranges"),
            // The first poll gets another chance to open them
            Err(e) => warn!(error = %e, "Initial dynamic ports failed to bind"),
        }

        PortConfigClient::new(config)?.spawn(Arc::clone(&manager), shutdown.clone());
        Ok(Some(manager))
    }
}

/// Cancel `shutdown` on Ctrl+C or SIGTERM
async fn shutdown_signal(shutdown: CancellationToken) {
    let ctrl_c = async {
        if let Err(e) = signal::ctrl_c().await {
            warn!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match signal::unix::signal(signal::unix::SignalKind::terminate()) {
            Ok(mut sigterm) => {
                sigterm.recv().await;
            }
            Err(e) => {
                warn!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
        () = shutdown.cancelled() => return,
    }

    info!("Shutdown signal received");
    shutdown.cancel();
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_invalid_config() {
        assert!(matches!(Gateway::new(Config::default()), Err(Error::Config(_))));
    }

    #[tokio::test]
    async fn serves_health_and_stops_on_cancel() {
        let mut config = Config::default();
        config.auth.backend_url = "http://127.0.0.1:1".to_string();
        config.server.host = "127.0.0.1".to_string();
        config.server.tcp_port = 0;
        config.server.udp_port = 0;
        let gateway = Gateway::new(config).unwrap();

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let shutdown = CancellationToken::new();
        let server = tokio::spawn(gateway.serve(listener, shutdown.clone()));

        let body: serde_json::Value = reqwest::get(format!("http://{addr}/health"))
            .await
            .unwrap()
            .json()
            .await
            .unwrap();
        assert_eq!(body["status"], "healthy");
        assert_eq!(body["components"]["auth"], "jwt");

        shutdown.cancel();
        server.await.unwrap().unwrap();
    }
}
