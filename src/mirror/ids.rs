//! EVE-JSON feed to an intrusion-detection sink.

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use serde::Serialize;
use tokio::io::AsyncWriteExt;
use tokio::net::TcpStream;
use tokio::sync::Mutex;
use tracing::{debug, info, warn};

use super::{MirrorPacket, TrafficProtocol};
use crate::peer::split_host_port;

/// Reported as `platform` in every event
pub const PLATFORM: &str = "ztna-headend";

const RECONNECT_DELAY: Duration = Duration::from_secs(2);

/// One EVE line.
#[derive(Debug, Serialize)]
pub struct EveEvent<'a> {
    /// RFC 3339 with microseconds
    pub timestamp: String,
    /// Derived from the packet timestamp
    pub flow_id: u64,
    /// Always `mirror`
    pub event_type: &'static str,
    /// Source IP or host
    pub src_ip: &'a str,
    /// Source port (0 when unknown)
    pub src_port: u16,
    /// Destination IP or host
    pub dest_ip: &'a str,
    /// Destination port (0 when unknown)
    pub dest_port: u16,
    /// Transport protocol
    pub proto: &'static str,
    /// Application protocol, when known
    #[serde(skip_serializing_if = "Option::is_none")]
    pub app_proto: Option<&'static str>,
    /// Payload bytes
    pub payload_size: usize,
    /// Packet metadata
    pub metadata: &'a serde_json::Map<String, serde_json::Value>,
    /// Gateway id
    pub host: &'a str,
    /// Product tag
    pub platform: &'static str,
}

impl<'a> EveEvent<'a> {
    /// Build the event for a packet
    #[must_use]
    pub fn from_packet(packet: &'a MirrorPacket, gateway_id: &'a str) -> Self {
        let (src_ip, src_port) = split_endpoint(&packet.source_addr);
        let (dest_ip, dest_port) = split_endpoint(&packet.dest_addr);
        let (proto, app_proto) = match packet.protocol {
            TrafficProtocol::Http => ("TCP", Some("http")),
            TrafficProtocol::Tcp => ("TCP", None),
            TrafficProtocol::Udp => ("UDP", None),
        };
        let micros = packet.timestamp.timestamp_micros();
        Self {
            timestamp: packet.timestamp.format("%Y-%m-%dT%H:%M:%S%.6f%z").to_string(),
            flow_id: u64::try_from(micros).unwrap_or_default(),
            event_type: "mirror",
            src_ip,
            src_port,
            dest_ip,
            dest_port,
            proto,
            app_proto,
            payload_size: packet.payload.len(),
            metadata: &packet.metadata,
            host: gateway_id,
            platform: PLATFORM,
        }
    }
}

fn split_endpoint(addr: &str) -> (&str, u16) {
    split_host_port(addr).unwrap_or((addr, 0))
}

/// Persistent TCP connection to the IDS collector.
pub struct IdsSink {
    addr: String,
    gateway_id: String,
    conn: Mutex<Option<TcpStream>>,
    reconnecting: AtomicBool,
}

impl IdsSink {
    /// Create and attempt the first connect
    pub async fn open(addr: String, gateway_id: String) -> Arc<Self> {
        let sink = Arc::new(Self {
            addr,
            gateway_id,
            conn: Mutex::new(None),
            reconnecting: AtomicBool::new(false),
        });
        match TcpStream::connect(&sink.addr).await {
            Ok(stream) => {
                info!(collector = %sink.addr, "Connected to IDS collector");
                *sink.conn.lock().await = Some(stream);
            }
            Err(e) => {
                warn!(collector = %sink.addr, error = %e, "IDS collector unavailable");
                sink.schedule_reconnect();
            }
        }
        sink
    }

    /// Write one packet as an EVE line. Failures mark the sink dead.
    pub async fn send(self: &Arc<Self>, packet: &MirrorPacket) -> std::io::Result<()> {
        let event = EveEvent::from_packet(packet, &self.gateway_id);
        let mut line = serde_json::to_vec(&event)?;
        line.push(b'\n');

        let mut conn = self.conn.lock().await;
        let result = match conn.as_mut() {
            Some(stream) => stream.write_all(&line).await,
            None => Err(std::io::Error::new(
                std::io::ErrorKind::NotConnected,
                "IDS collector is down",
            )),
        };
        if result.is_err() {
            *conn = None;
            drop(conn);
            self.schedule_reconnect();
        }
        result
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let sink = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match TcpStream::connect(&sink.addr).await {
                Ok(stream) => {
                    info!(collector = %sink.addr, "Reconnected to IDS collector");
                    *sink.conn.lock().await = Some(stream);
                }
                Err(e) => debug!(collector = %sink.addr, error = %e, "IDS reconnect failed"),
            }
            sink.reconnecting.store(false, Ordering::Release);
        });
    }
}

#[cfg(test)]
mod tests {
    use bytes::Bytes;
    use chrono::{TimeZone, Utc};

    use super::*;

    #[test]
    fn eve_event_fields() {
        let packet = MirrorPacket {
            timestamp: Utc.with_ymd_and_hms(2026, 3, 1, 12, 0, 0).unwrap(),
            source_addr: "10.0.0.2:51000".into(),
            dest_addr: "db.internal:5432".into(),
            protocol: TrafficProtocol::Tcp,
            payload: Bytes::from_static(b"SELECT 1"),
            metadata: serde_json::Map::new(),
        };
        let json = serde_json::to_value(EveEvent::from_packet(&packet, "gw-1")).unwrap();
        assert_eq!(json["event_type"], "mirror");
        assert_eq!(json["src_ip"], "10.0.0.2");
        assert_eq!(json["src_port"], 51000);
        assert_eq!(json["dest_ip"], "db.internal");
        assert_eq!(json["dest_port"], 5432);
        assert_eq!(json["proto"], "TCP");
        assert_eq!(json["payload_size"], 8);
        assert_eq!(json["host"], "gw-1");
        assert_eq!(json["platform"], "ztna-headend");
        assert_eq!(json["timestamp"], "2026-03-01T12:00:00.000000+0000");
        assert!(json.get("app_proto").is_none());
    }

    #[test]
    fn http_packets_are_tagged() {
        let packet = MirrorPacket {
            timestamp: Utc::now(),
            source_addr: "10.0.0.2:51000".into(),
            dest_addr: "api.internal".into(),
            protocol: TrafficProtocol::Http,
            payload: Bytes::new(),
            metadata: serde_json::Map::new(),
        };
        let event = EveEvent::from_packet(&packet, "gw-1");
        assert_eq!(event.app_proto, Some("http"));
        assert_eq!(event.dest_ip, "api.internal");
        assert_eq!(event.dest_port, 0);
    }
}
