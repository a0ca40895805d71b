//! Dynamic port listeners.
//!
//! The manager owns the active set of TCP/UDP listeners opened from a pair of
//! port-range expressions. Each listener runs its own accept/receive loop and
//! hands traffic to the registered handler. All loops observe one
//! [`CancellationToken`]; `stop` cancels it and waits for every loop to exit,
//! which drops (closes) every socket.
//!
//! Reconfiguration replaces the whole set: stop all, then start all. Relays
//! already handed to a handler run in their own tasks and are not interrupted.

pub mod poller;

use std::net::SocketAddr;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use bytes::Bytes;
use headend_wire::{PortProtocol, PortRangeSet};
use parking_lot::{Mutex, RwLock};
use tokio::net::{TcpListener, TcpStream, UdpSocket};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

pub use poller::PortConfigClient;

use crate::{Error, Result};

/// Receives accepted streams: `(stream, peer, local port, protocol)`
pub type TcpHandler = Arc<dyn Fn(TcpStream, SocketAddr, u16, PortProtocol) + Send + Sync>;

/// Receives datagrams: `(payload, source, local port, reply socket)`
pub type UdpHandler = Arc<dyn Fn(Bytes, SocketAddr, u16, Arc<UdpSocket>) + Send + Sync>;

/// Largest datagram accepted
const MAX_DATAGRAM: usize = 65_535;

/// Pause after a failed accept/receive (e.g. EMFILE) before retrying
const ERROR_BACKOFF: Duration = Duration::from_millis(50);

/// Snapshot of one open listener.
#[derive(Debug, Clone)]
pub struct PortListener {
    /// Port
    pub port: u16,
    /// Protocol
    pub protocol: PortProtocol,
    /// Bound address
    pub local_addr: SocketAddr,
    active: Arc<AtomicBool>,
}

impl PortListener {
    /// `false` once the loop has exited
    #[must_use]
    pub fn is_active(&self) -> bool {
        self.active.load(Ordering::Acquire)
    }
}

struct ActiveSet {
    listeners: Vec<PortListener>,
    tasks: Vec<JoinHandle<()>>,
    shutdown: CancellationToken,
}

/// Opens, tracks and closes the dynamic listener set.
pub struct DynamicPortManager {
    bind_host: String,
    ranges: Mutex<PortRangeSet>,
    tcp_handler: Arc<RwLock<Option<TcpHandler>>>,
    udp_handler: Arc<RwLock<Option<UdpHandler>>>,
    active: Mutex<Option<ActiveSet>>,
    /// Serializes start/stop/reconfigure
    lifecycle: tokio::sync::Mutex<()>,
}

impl DynamicPortManager {
    /// Create a manager binding on `bind_host`
    #[must_use]
    pub fn new(bind_host: impl Into<String>) -> Self {
        Self {
            bind_host: bind_host.into(),
            ranges: Mutex::new(PortRangeSet::default()),
            tcp_handler: Arc::new(RwLock::new(None)),
            udp_handler: Arc::new(RwLock::new(None)),
            active: Mutex::new(None),
            lifecycle: tokio::sync::Mutex::new(()),
        }
    }

    /// Register the stream handler (applies to running loops too)
    pub fn set_tcp_handler(&self, handler: TcpHandler) {
        *self.tcp_handler.write() = Some(handler);
    }

    /// Register the datagram handler (applies to running loops too)
    pub fn set_udp_handler(&self, handler: UdpHandler) {
        *self.udp_handler.write() = Some(handler);
    }

    /// Parse and store the range expressions. Malformed tokens, reversed
    /// bounds and ports outside 1..=65535 are rejected; the previous ranges
    /// stay in place on error.
    pub fn parse_port_ranges(&self, tcp_expr: &str, udp_expr: &str) -> Result<()> {
        let parsed = PortRangeSet::parse(tcp_expr, udp_expr)?;
        *self.ranges.lock() = parsed;
        Ok(())
    }

    /// Reject duplicate `(protocol, port)` pairs in the stored ranges.
    pub fn validate_port_ranges(&self) -> Result<()> {
        self.ranges.lock().validate()?;
        Ok(())
    }

    /// Stored ranges
    #[must_use]
    pub fn ranges(&self) -> PortRangeSet {
        self.ranges.lock().clone()
    }

    /// Every concrete `(protocol, port)` the stored ranges cover
    #[must_use]
    pub fn configured_ports(&self) -> Vec<(PortProtocol, u16)> {
        self.ranges.lock().expand()
    }

    /// Number of open listeners
    #[must_use]
    pub fn listener_count(&self) -> usize {
        self.active.lock().as_ref().map_or(0, |set| set.listeners.len())
    }

    /// Snapshot of the open listeners
    #[must_use]
    pub fn listeners(&self) -> Vec<PortListener> {
        self.active
            .lock()
            .as_ref()
            .map(|set| set.listeners.clone())
            .unwrap_or_default()
    }

    /// Open one listener per configured port.
    ///
    /// Individual bind failures are logged and skipped. Fails only when ports
    /// were configured and none could be bound. Returns the number opened.
    pub async fn start_listening(&self) -> Result<usize> {
        let _lifecycle = self.lifecycle.lock().await;
        self.start_locked().await
    }

    async fn start_locked(&self) -> Result<usize> {
        if self.active.lock().is_some() {
            return Err(Error::Internal("listeners already running".to_string()));
        }
        self.validate_port_ranges()?;
        let ports = self.configured_ports();

        let shutdown = CancellationToken::new();
        let mut listeners = Vec::with_capacity(ports.len());
        let mut tasks = Vec::with_capacity(ports.len());
        let mut first_error = None;

        for (protocol, port) in &ports {
            match self.open(*protocol, *port, &shutdown).await {
                Ok((listener, task)) => {
                    listeners.push(listener);
                    tasks.push(task);
                }
                Err(e) => {
                    warn!(error = %e, "Skipping port");
                    first_error.get_or_insert(e);
                }
            }
        }

        let opened = listeners.len();
        if opened == 0 {
            if let Some(e) = first_error {
                return Err(e);
            }
        }

        info!(
            opened,
            configured = ports.len(),
            bind_host = %self.bind_host,
            "Dynamic listeners started"
        );
        *self.active.lock() = Some(ActiveSet {
            listeners,
            tasks,
            shutdown,
        });
        Ok(opened)
    }

    async fn open(
        &self,
        protocol: PortProtocol,
        port: u16,
        shutdown: &CancellationToken,
    ) -> Result<(PortListener, JoinHandle<()>)> {
        let bind_err = |source| Error::ListenerBind { protocol, port, source };
        let addr = (self.bind_host.as_str(), port);
        let active = Arc::new(AtomicBool::new(true));

        let (local_addr, task) = match protocol {
            PortProtocol::Tcp => {
                let listener = TcpListener::bind(addr).await.map_err(bind_err)?;
                let local_addr = listener.local_addr().map_err(bind_err)?;
                let task = tokio::spawn(tcp_loop(
                    listener,
                    port,
                    Arc::clone(&self.tcp_handler),
                    shutdown.clone(),
                    Arc::clone(&active),
                ));
                (local_addr, task)
            }
            PortProtocol::Udp => {
                let socket = UdpSocket::bind(addr).await.map_err(bind_err)?;
                let local_addr = socket.local_addr().map_err(bind_err)?;
                let task = tokio::spawn(udp_loop(
                    Arc::new(socket),
                    port,
                    Arc::clone(&self.udp_handler),
                    shutdown.clone(),
                    Arc::clone(&active),
                ));
                (local_addr, task)
            }
        };
        debug!(%protocol, port, %local_addr, "Listener opened");

        Ok((
            PortListener {
                port,
                protocol,
                local_addr,
                active,
            },
            task,
        ))
    }

    /// Close every listener and wait for the loops to exit.
    pub async fn stop(&self) {
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
    }

    async fn stop_locked(&self) {
        let Some(set) = self.active.lock().take() else {
            return;
        };
        set.shutdown.cancel();
        for result in futures::future::join_all(set.tasks).await {
            if let Err(e) = result {
                warn!(error = %e, "Listener task ended abnormally");
            }
        }
        info!(closed = set.listeners.len(), "Dynamic listeners stopped");
    }

    /// Replace the listener set with new ranges.
    ///
    /// The new expressions are parsed and validated first; on error the
    /// current set keeps running untouched.
    pub async fn reconfigure(&self, tcp_expr: &str, udp_expr: &str) -> Result<usize> {
        let parsed = PortRangeSet::parse_validated(tcp_expr, udp_expr)?;
        let _lifecycle = self.lifecycle.lock().await;
        self.stop_locked().await;
        *self.ranges.lock() = parsed;
        let opened = self.start_locked().await?;
        info!(tcp = %tcp_expr, udp = %udp_expr, opened, "Dynamic ports reconfigured");
        Ok(opened)
    }
}

async fn tcp_loop(
    listener: TcpListener,
    port: u16,
    handler: Arc<RwLock<Option<TcpHandler>>>,
    shutdown: CancellationToken,
    active: Arc<AtomicBool>,
) {
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    let handler = handler.read().clone();
                    match handler {
                        Some(handle) => handle(stream, peer, port, PortProtocol::Tcp),
                        None => debug!(port, %peer, "No TCP handler, closing connection"),
                    }
                }
                Err(e) => {
                    warn!(port, error = %e, "Accept failed");
                    if !pause_after_error(&shutdown).await {
                        break;
                    }
                }
            },
        }
    }
    active.store(false, Ordering::Release);
    debug!(port, "TCP listener closed");
}

async fn udp_loop(
    socket: Arc<UdpSocket>,
    port: u16,
    handler: Arc<RwLock<Option<UdpHandler>>>,
    shutdown: CancellationToken,
    active: Arc<AtomicBool>,
) {
    let mut buf = vec![0u8; MAX_DATAGRAM];
    loop {
        tokio::select! {
            () = shutdown.cancelled() => break,
            received = socket.recv_from(&mut buf) => match received {
                Ok((n, source)) => {
                    let handler = handler.read().clone();
                    match handler {
                        Some(handle) => handle(
                            Bytes::copy_from_slice(&buf[..n]),
                            source,
                            port,
                            Arc::clone(&socket),
                        ),
                        None => debug!(port, %source, "No UDP handler, dropping datagram"),
                    }
                }
                Err(e) => {
                    debug!(port, error = %e, "Receive failed");
                    if !pause_after_error(&shutdown).await {
                        break;
                    }
                }
            },
        }
    }
    active.store(false, Ordering::Release);
    debug!(port, "UDP listener closed");
}

/// Back off after a socket error. `false` when shutdown arrived meanwhile.
async fn pause_after_error(shutdown: &CancellationToken) -> bool {
    tokio::select! {
        () = shutdown.cancelled() => false,
        () = tokio::time::sleep(ERROR_BACKOFF) => true,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn error_backoff_waits_unless_shutting_down() {
        let shutdown = CancellationToken::new();
        let started = std::time::Instant::now();
        assert!(pause_after_error(&shutdown).await);
        assert!(started.elapsed() >= ERROR_BACKOFF);

        shutdown.cancel();
        let started = std::time::Instant::now();
        assert!(!pause_after_error(&shutdown).await);
        assert!(started.elapsed() < ERROR_BACKOFF);
    }

    #[test]
    fn parse_rejects_and_keeps_previous() {
        let manager = DynamicPortManager::new("127.0.0.1");
        manager.parse_port_ranges("9000-9001", "53").unwrap();
        assert!(manager.parse_port_ranges("9002-9000", "").is_err());
        assert!(manager.parse_port_ranges("70000", "").is_err());
        assert!(manager.parse_port_ranges("abc", "").is_err());
        assert_eq!(manager.configured_ports().len(), 3);
    }

    #[test]
    fn validate_catches_duplicates() {
        let manager = DynamicPortManager::new("127.0.0.1");
        manager.parse_port_ranges("9000-9005,9003", "").unwrap();
        assert!(matches!(manager.validate_port_ranges(), Err(Error::PortRange(_))));
    }

    #[tokio::test]
    async fn empty_configuration_starts_nothing() {
        let manager = DynamicPortManager::new("127.0.0.1");
        assert_eq!(manager.start_listening().await.unwrap(), 0);
        assert_eq!(manager.listener_count(), 0);
        manager.stop().await;
    }

    #[tokio::test]
    async fn all_binds_failing_is_an_error() {
        // Hold the port so the manager cannot bind it.
        let held = std::net::TcpListener::bind("127.0.0.1:0").unwrap();
        let port = held.local_addr().unwrap().port();

        let manager = DynamicPortManager::new("127.0.0.1");
        manager.parse_port_ranges(&port.to_string(), "").unwrap();
        let err = manager.start_listening().await.unwrap_err();
        assert!(matches!(err, Error::ListenerBind { port: p, .. } if p == port));
        assert_eq!(manager.listener_count(), 0);
    }

    #[tokio::test]
    async fn invalid_reconfigure_keeps_current_set() {
        let socket = std::net::UdpSocket::bind("127.0.0.1:0").unwrap();
        let port = socket.local_addr().unwrap().port();
        drop(socket);

        let manager = DynamicPortManager::new("127.0.0.1");
        manager.parse_port_ranges("", &port.to_string()).unwrap();
        assert_eq!(manager.start_listening().await.unwrap(), 1);

        assert!(manager.reconfigure("1-2,2", "").await.is_err());
        assert_eq!(manager.listener_count(), 1);
        assert!(manager.listeners()[0].is_active());

        manager.stop().await;
        assert_eq!(manager.listener_count(), 0);
    }
}
