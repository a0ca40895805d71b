//! Access audit log.
//!
//! Every unit of traffic (HTTP request, TCP stream, UDP datagram) produces one
//! [`AccessEntry`], allowed or not. Entries are always emitted via
//! `tracing::info!` with the serialized entry in the `audit` field:
//!
//! ```text
//! INFO ztna_headend::audit audit={"kind":"tcp","user_id":"u1","allowed":true,...}
//! ```
//!
//! When a collector is configured, the same JSON line is also shipped over a
//! persistent TCP connection through a bounded queue. A full queue drops the
//! line; shipping never blocks the relay path.

use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::auth::User;

/// Delay before reconnecting to the collector
const RECONNECT_DELAY: Duration = Duration::from_secs(5);

/// Traffic kind of an entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum AccessKind {
    /// Proxied HTTP request
    Http,
    /// Relayed TCP stream
    Tcp,
    /// Relayed UDP datagram
    Udp,
}

/// Result of the authn/authz decision for one unit of traffic.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    /// Relayed
    Allowed,
    /// Rejected with a reason
    Denied(String),
}

impl Outcome {
    /// Denial with a reason
    pub fn denied(reason: impl Into<String>) -> Self {
        Self::Denied(reason.into())
    }
}

/// HTTP-specific fields
#[derive(Debug, Clone, Default)]
pub struct HttpSummary {
    /// Request method
    pub method: String,
    /// Request path
    pub path: String,
    /// Response status (0 when no response was produced)
    pub status: u16,
}

/// Byte counts for stream/datagram relays
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Transfer {
    /// Client to target
    pub bytes_up: u64,
    /// Target to client
    pub bytes_down: u64,
}

/// One audit record.
#[derive(Debug, Clone, Serialize)]
pub struct AccessEntry {
    /// When the decision was made
    pub timestamp: DateTime<Utc>,
    /// Traffic kind
    pub kind: AccessKind,
    /// Authenticated user id (empty when authentication failed)
    pub user_id: String,
    /// User display name
    pub user_name: String,
    /// Client address
    pub source_addr: String,
    /// Requested target
    pub target: String,
    /// HTTP method
    #[serde(skip_serializing_if = "Option::is_none")]
    pub method: Option<String>,
    /// HTTP path
    #[serde(skip_serializing_if = "Option::is_none")]
    pub path: Option<String>,
    /// HTTP status
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<u16>,
    /// Client to target bytes
    pub bytes_up: u64,
    /// Target to client bytes
    pub bytes_down: u64,
    /// Whether the traffic was relayed
    pub allowed: bool,
    /// Denial reason
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
}

impl AccessEntry {
    fn new(kind: AccessKind, user: Option<&User>, source: &str, target: &str, outcome: Outcome) -> Self {
        let (allowed, reason) = match outcome {
            Outcome::Allowed => (true, None),
            Outcome::Denied(reason) => (false, Some(reason)),
        };
        Self {
            timestamp: Utc::now(),
            kind,
            user_id: user.map(|u| u.id.clone()).unwrap_or_default(),
            user_name: user.map(|u| u.display_name.clone()).unwrap_or_default(),
            source_addr: source.to_string(),
            target: target.to_string(),
            method: None,
            path: None,
            status: None,
            bytes_up: 0,
            bytes_down: 0,
            allowed,
            reason,
        }
    }
}

/// Sink for access entries. Implementations must not block.
pub trait AuditLog: Send + Sync {
    /// Record one entry
    fn record(&self, entry: AccessEntry);

    /// Record a proxied HTTP request
    fn log_http_access(&self, user: Option<&User>, source: &str, target: &str, http: HttpSummary, outcome: Outcome) {
        let mut entry = AccessEntry::new(AccessKind::Http, user, source, target, outcome);
        entry.method = Some(http.method);
        entry.path = Some(http.path);
        entry.status = (http.status != 0).then_some(http.status);
        self.record(entry);
    }

    /// Record a relayed TCP stream
    fn log_tcp_access(&self, user: Option<&User>, source: &str, target: &str, transfer: Transfer, outcome: Outcome) {
        let mut entry = AccessEntry::new(AccessKind::Tcp, user, source, target, outcome);
        entry.bytes_up = transfer.bytes_up;
        entry.bytes_down = transfer.bytes_down;
        self.record(entry);
    }

    /// Record a relayed UDP datagram
    fn log_udp_access(&self, user: Option<&User>, source: &str, target: &str, transfer: Transfer, outcome: Outcome) {
        let mut entry = AccessEntry::new(AccessKind::Udp, user, source, target, outcome);
        entry.bytes_up = transfer.bytes_up;
        entry.bytes_down = transfer.bytes_down;
        self.record(entry);
    }
}

/// Default audit log: structured tracing plus optional TCP shipping.
#[derive(Default)]
pub struct AuditLogger {
    shipper: Option<mpsc::Sender<String>>,
}

impl AuditLogger {
    /// Tracing-only logger
    #[must_use]
    pub fn tracing_only() -> Self {
        Self::default()
    }

    /// Logger that also ships JSON lines to `addr` until `shutdown` fires.
    #[must_use]
    pub fn with_collector(addr: String, queue_size: usize, shutdown: CancellationToken) -> Self {
        let (tx, rx) = mpsc::channel(queue_size.max(1));
        tokio::spawn(ship_lines(addr, rx, shutdown));
        Self { shipper: Some(tx) }
    }
}

impl AuditLog for AuditLogger {
    fn record(&self, entry: AccessEntry) {
        let json = match serde_json::to_string(&entry) {
            Ok(json) => json,
            Err(e) => {
                warn!(error = %e, "Failed to serialize audit entry");
                return;
            }
        };
        info!(audit = %json, allowed = entry.allowed, "access");
        telemetry_metrics::counter!(
            "headend_access_total",
            "kind" => format!("{:?}", entry.kind).to_lowercase(),
            "allowed" => entry.allowed.to_string()
        )
        .increment(1);

        if let Some(tx) = &self.shipper {
            if tx.try_send(json).is_err() {
                debug!("Audit shipping queue full, entry not shipped");
            }
        }
    }
}

async fn ship_lines(addr: String, mut rx: mpsc::Receiver<String>, shutdown: CancellationToken) {
    let mut conn: Option<TcpStream> = None;
    loop {
        let line = tokio::select! {
            line = rx.recv() => match line {
                Some(line) => line,
                None => break,
            },
            () = shutdown.cancelled() => break,
        };

        if conn.is_none() {
            match TcpStream::connect(&addr).await {
                Ok(stream) => {
                    info!(collector = %addr, "Connected to audit collector");
                    conn = Some(stream);
                }
                Err(e) => {
                    warn!(collector = %addr, error = %e, "Audit collector unreachable, dropping entry");
                    tokio::select! {
                        () = tokio::time::sleep(RECONNECT_DELAY) => {}
                        () = shutdown.cancelled() => break,
                    }
                    continue;
                }
            }
        }

        if let Some(stream) = conn.as_mut() {
            let mut bytes = line.into_bytes();
            bytes.push(b'\n');
            if let Err(e) = stream.write_all(&bytes).await {
                warn!(collector = %addr, error = %e, "Audit collector write failed, reconnecting");
                conn = None;
            }
        }
    }
    debug!("Audit shipper stopped");
}

#[cfg(test)]
mod tests {
    use super::*;
    use parking_lot::Mutex;
    use tokio::io::{AsyncBufReadExt, BufReader};
    use tokio::net::TcpListener;

    #[derive(Default)]
    struct Recording(Mutex<Vec<AccessEntry>>);

    impl AuditLog for Recording {
        fn record(&self, entry: AccessEntry) {
            self.0.lock().push(entry);
        }
    }

    fn user() -> User {
        User {
            id: "u-1".into(),
            display_name: "Alice".into(),
            email: "alice@corp.example".into(),
            groups: vec![],
            role: "user".into(),
            permissions: serde_json::Map::new(),
        }
    }

    #[test]
    fn http_entry_carries_request_fields() {
        // GIVEN: a recording sink
        let sink = Recording::default();

        // WHEN: an allowed HTTP request is logged
        sink.log_http_access(
            Some(&user()),
            "10.0.0.2:51000",
            "api.internal",
            HttpSummary {
                method: "GET".into(),
                path: "/v1/items".into(),
                status: 200,
            },
            Outcome::Allowed,
        );

        // THEN: the entry is allowed and populated
        let entries = sink.0.lock();
        let entry = &entries[0];
        assert_eq!(entry.kind, AccessKind::Http);
        assert!(entry.allowed);
        assert_eq!(entry.user_name, "Alice");
        assert_eq!(entry.status, Some(200));
        assert!(entry.reason.is_none());
    }

    #[test]
    fn denied_entry_without_user() {
        let sink = Recording::default();
        sink.log_tcp_access(
            None,
            "10.0.0.2:51000",
            "db.internal:5432",
            Transfer::default(),
            Outcome::denied("authentication failed: token expired"),
        );

        let entries = sink.0.lock();
        assert!(!entries[0].allowed);
        assert_eq!(entries[0].user_id, "");
        assert_eq!(
            entries[0].reason.as_deref(),
            Some("authentication failed: token expired")
        );
    }

    #[test]
    fn entry_serializes_without_empty_http_fields() {
        let entry = AccessEntry::new(AccessKind::Udp, Some(&user()), "s", "dns.internal:53", Outcome::Allowed);
        let json = serde_json::to_value(&entry).unwrap();
        assert_eq!(json["kind"], "udp");
        assert!(json.get("method").is_none());
        assert!(json.get("reason").is_none());
    }

    #[tokio::test]
    async fn ships_json_lines_to_collector() {
        // GIVEN: a collector listening locally
        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap().to_string();
        let shutdown = CancellationToken::new();
        let logger = AuditLogger::with_collector(addr, 16, shutdown.clone());

        // WHEN: an entry is recorded
        logger.log_udp_access(
            Some(&user()),
            "10.0.0.2:5353",
            "dns.internal:53",
            Transfer { bytes_up: 40, bytes_down: 120 },
            Outcome::Allowed,
        );

        // THEN: the collector receives one JSON line
        let (stream, _) = listener.accept().await.unwrap();
        let mut lines = BufReader::new(stream).lines();
        let line = tokio::time::timeout(Duration::from_secs(5), lines.next_line())
            .await
            .unwrap()
            .unwrap()
            .unwrap();
        let json: serde_json::Value = serde_json::from_str(&line).unwrap();
        assert_eq!(json["target"], "dns.internal:53");
        assert_eq!(json["bytes_down"], 120);
        shutdown.cancel();
    }
}
