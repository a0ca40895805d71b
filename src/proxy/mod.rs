//! Authenticated multi-protocol proxy.
//!
//! Every unit of traffic moves through the same states:
//!
//! ```text
//! received -> authenticated -> authorized -> relayed -> (mirrored | logged)
//!     \______________\______________-> rejected (logged, nothing forwarded)
//! ```
//!
//! Nothing is written toward a target until both authentication and
//! authorization have succeeded. Mirroring and audit logging run off the
//! relay path and never fail it.

pub mod http;
pub mod tcp;
pub mod udp;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use bytes::Bytes;
use headend_wire::PortProtocol;
use tokio::net::{TcpStream, UdpSocket};
use tracing::debug;

use crate::audit::{AuditLog, AuditLogger};
use crate::auth::{AuthProvider, User};
use crate::config::ServerConfig;
use crate::firewall::{AllowAll, Firewall};
use crate::mirror::MirrorEngine;
use crate::peer::{PeerRouter, StaticPeerRouter};
use crate::ports::{TcpHandler, UdpHandler};
use crate::{Error, Result};

pub use http::ClientCache;

/// Timeouts and upstream settings.
#[derive(Debug, Clone)]
pub struct ProxySettings {
    /// Scheme used to reach HTTP targets
    pub target_scheme: String,
    /// Overall upstream HTTP exchange timeout
    pub request_timeout: Duration,
    /// Pooled upstream connection idle timeout
    pub idle_timeout: Duration,
    /// Largest request body forwarded
    pub max_body_size: usize,
    /// Response bytes kept for the mirror copy; the client gets everything
    pub mirror_body_limit: usize,
    /// Time allowed for a stream preamble
    pub preamble_timeout: Duration,
    /// TCP dial timeout
    pub connect_timeout: Duration,
    /// Wait for the single UDP reply
    pub udp_response_timeout: Duration,
}

impl From<&ServerConfig> for ProxySettings {
    fn from(config: &ServerConfig) -> Self {
        Self {
            target_scheme: config.target_scheme.clone(),
            request_timeout: config.request_timeout,
            idle_timeout: config.idle_timeout,
            max_body_size: config.max_body_size,
            mirror_body_limit: config.mirror_body_limit,
            preamble_timeout: config.preamble_timeout,
            connect_timeout: config.connect_timeout,
            udp_response_timeout: config.udp_response_timeout,
        }
    }
}

impl Default for ProxySettings {
    fn default() -> Self {
        Self::from(&ServerConfig::default())
    }
}

/// The proxy engine and its collaborators.
pub struct ProxyEngine {
    auth: Arc<dyn AuthProvider>,
    firewall: Arc<dyn Firewall>,
    audit: Arc<dyn AuditLog>,
    peers: Arc<dyn PeerRouter>,
    mirror: Option<Arc<MirrorEngine>>,
    clients: ClientCache,
    settings: ProxySettings,
}

impl ProxyEngine {
    /// Engine with an allow-all firewall, tracing-only audit, no peers and
    /// no mirroring.
    #[must_use]
    pub fn new(auth: Arc<dyn AuthProvider>, settings: ProxySettings) -> Self {
        Self {
            auth,
            firewall: Arc::new(AllowAll),
            audit: Arc::new(AuditLogger::tracing_only()),
            peers: Arc::new(StaticPeerRouter::default()),
            mirror: None,
            clients: ClientCache::new(settings.request_timeout, settings.idle_timeout),
            settings,
        }
    }

    /// Use a firewall collaborator
    #[must_use]
    pub fn with_firewall(mut self, firewall: Arc<dyn Firewall>) -> Self {
        self.firewall = firewall;
        self
    }

    /// Use an audit sink
    #[must_use]
    pub fn with_audit(mut self, audit: Arc<dyn AuditLog>) -> Self {
        self.audit = audit;
        self
    }

    /// Use a peer router
    #[must_use]
    pub fn with_peers(mut self, peers: Arc<dyn PeerRouter>) -> Self {
        self.peers = peers;
        self
    }

    /// Mirror relayed traffic
    #[must_use]
    pub fn with_mirror(mut self, mirror: Arc<MirrorEngine>) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Auth provider
    #[must_use]
    pub fn auth(&self) -> &Arc<dyn AuthProvider> {
        &self.auth
    }

    /// Audit sink
    #[must_use]
    pub fn audit(&self) -> &Arc<dyn AuditLog> {
        &self.audit
    }

    /// Mirror engine, when mirroring is on
    #[must_use]
    pub fn mirror(&self) -> Option<&Arc<MirrorEngine>> {
        self.mirror.as_ref()
    }

    /// Per-host upstream client cache
    #[must_use]
    pub fn clients(&self) -> &ClientCache {
        &self.clients
    }

    /// Settings
    #[must_use]
    pub fn settings(&self) -> &ProxySettings {
        &self.settings
    }

    /// Authenticate `token`.
    pub async fn authenticate(&self, token: &str) -> Result<User> {
        Ok(self.auth.validate(token).await?)
    }

    /// Ask the firewall whether `user` may reach `target`.
    pub async fn authorize(&self, user: &User, target: &str) -> Result<()> {
        if self.firewall.check_access(user, target).await {
            Ok(())
        } else {
            Err(Error::Authorization {
                user_id: user.id.clone(),
                target: target.to_string(),
            })
        }
    }

    /// Authenticate then authorize. The user is returned alongside the
    /// error when authentication succeeded but authorization did not.
    pub async fn admit(&self, token: &str, target: &str) -> std::result::Result<User, (Option<User>, Error)> {
        let user = self.authenticate(token).await.map_err(|e| (None, e))?;
        match self.authorize(&user, target).await {
            Ok(()) => Ok(user),
            Err(e) => Err((Some(user), e)),
        }
    }

    /// Address to dial for a stream/datagram target.
    #[must_use]
    pub fn dial_addr(&self, target: &str) -> String {
        match self.peers.route(target) {
            Some(peer) => {
                debug!(target = %target, peer = %peer, "Routing through peer");
                peer
            }
            None => target.to_string(),
        }
    }

    /// Listener callback that relays each accepted stream in its own task
    #[must_use]
    pub fn tcp_handler(self: &Arc<Self>) -> TcpHandler {
        let engine = Arc::clone(self);
        Arc::new(move |stream: TcpStream, peer: SocketAddr, _port: u16, _protocol: PortProtocol| {
            tokio::spawn(Arc::clone(&engine).handle_tcp(stream, peer));
        })
    }

    /// Listener callback that relays each datagram in its own task
    #[must_use]
    pub fn udp_handler(self: &Arc<Self>) -> UdpHandler {
        let engine = Arc::clone(self);
        Arc::new(move |datagram: Bytes, source: SocketAddr, _port: u16, reply: Arc<UdpSocket>| {
            tokio::spawn(Arc::clone(&engine).handle_udp(datagram, source, reply));
        })
    }

    fn mirror_tcp(&self, source: &str, dest: &str, data: &[u8]) {
        if let Some(mirror) = &self.mirror {
            mirror.mirror_tcp(source, dest, data);
        }
    }

    fn mirror_udp(&self, source: &str, dest: &str, data: &[u8]) {
        if let Some(mirror) = &self.mirror {
            mirror.mirror_udp(source, dest, data);
        }
    }
}
