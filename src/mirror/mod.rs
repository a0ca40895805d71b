//! Best-effort traffic mirroring.
//!
//! Observed traffic is copied into a bounded queue and drained by a fixed
//! worker pool that encapsulates each packet and writes it to every
//! collector (and, optionally, the IDS sink as EVE JSON).
//!
//! Enqueueing never blocks: a full queue, or an engine that is not running,
//! drops the packet and counts it in [`MirrorStats::packets_dropped`].

pub mod destination;
pub mod ids;

use std::sync::Arc;
use std::time::{SystemTime, UNIX_EPOCH};

use bytes::Bytes;
use chrono::{DateTime, Utc};
use headend_wire::Encapsulation;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use serde_json::json;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::MirrorConfig;
use crate::{Error, Result};
use destination::{Destination, Transport};
use ids::IdsSink;

/// Protocol of the mirrored traffic
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrafficProtocol {
    /// Proxied HTTP exchange
    Http,
    /// Relayed TCP chunk
    Tcp,
    /// Relayed UDP datagram
    Udp,
}

/// One observed unit of traffic.
#[derive(Debug, Clone)]
pub struct MirrorPacket {
    /// Observation time
    pub timestamp: DateTime<Utc>,
    /// Sender
    pub source_addr: String,
    /// Receiver
    pub dest_addr: String,
    /// Traffic protocol
    pub protocol: TrafficProtocol,
    /// Raw bytes
    pub payload: Bytes,
    /// Free-form annotations
    pub metadata: serde_json::Map<String, serde_json::Value>,
}

impl MirrorPacket {
    fn new(protocol: TrafficProtocol, source: &str, dest: &str, payload: Bytes) -> Self {
        Self {
            timestamp: Utc::now(),
            source_addr: source.to_string(),
            dest_addr: dest.to_string(),
            protocol,
            payload,
            metadata: serde_json::Map::new(),
        }
    }
}

/// Monotonic mirror counters.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct MirrorStats {
    /// Frames written to a destination
    pub packets_sent: u64,
    /// Packets dropped before delivery (queue full or engine stopped)
    pub packets_dropped: u64,
    /// Encapsulated bytes written
    pub bytes_sent: u64,
    /// Destination write failures
    pub errors: u64,
}

#[derive(Default)]
struct Counters(Mutex<MirrorStats>);

impl Counters {
    fn sent(&self, bytes: usize) {
        {
            let mut stats = self.0.lock();
            stats.packets_sent += 1;
            stats.bytes_sent += bytes as u64;
        }
        telemetry_metrics::counter!("headend_mirror_packets_sent_total").increment(1);
        telemetry_metrics::counter!("headend_mirror_bytes_sent_total").increment(bytes as u64);
    }

    fn dropped(&self) {
        self.0.lock().packets_dropped += 1;
        telemetry_metrics::counter!("headend_mirror_packets_dropped_total").increment(1);
    }

    fn error(&self) {
        self.0.lock().errors += 1;
        telemetry_metrics::counter!("headend_mirror_errors_total").increment(1);
    }

    fn snapshot(&self) -> MirrorStats {
        *self.0.lock()
    }
}

/// Worker-side state shared by every task.
struct Pipeline {
    encapsulation: Encapsulation,
    destinations: Vec<Arc<Destination>>,
    ids: Option<Arc<IdsSink>>,
    counters: Arc<Counters>,
}

impl Pipeline {
    async fn deliver(&self, packet: MirrorPacket) {
        if !self.destinations.is_empty() {
            let frame = self.encapsulation.encapsulate(&packet.payload, unix_secs());
            for dest in &self.destinations {
                match dest.send(&frame).await {
                    Ok(n) => self.counters.sent(n),
                    Err(e) => {
                        debug!(destination = %dest.addr(), error = %e, "Mirror write failed");
                        self.counters.error();
                    }
                }
            }
        }
        if let Some(ids) = &self.ids {
            if let Err(e) = ids.send(&packet).await {
                debug!(error = %e, "IDS write failed");
                self.counters.error();
            }
        }
    }
}

struct Running {
    tx: mpsc::Sender<MirrorPacket>,
    shutdown: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

/// Mirror engine.
pub struct MirrorEngine {
    config: MirrorConfig,
    gateway_id: String,
    counters: Arc<Counters>,
    running: RwLock<Option<Running>>,
}

impl MirrorEngine {
    /// Create a stopped engine
    #[must_use]
    pub fn new(config: MirrorConfig, gateway_id: impl Into<String>) -> Self {
        Self {
            config,
            gateway_id: gateway_id.into(),
            counters: Arc::new(Counters::default()),
            running: RwLock::new(None),
        }
    }

    /// Configured encapsulation
    #[must_use]
    pub fn encapsulation(&self) -> Encapsulation {
        self.config.encapsulation()
    }

    /// `true` between `start` and `stop`
    #[must_use]
    pub fn is_running(&self) -> bool {
        self.running.read().is_some()
    }

    /// Open destinations and spawn the workers and reporter.
    pub async fn start(&self) -> Result<()> {
        if self.is_running() {
            return Err(Error::Internal("mirror engine already running".to_string()));
        }
        if self.config.queue_size == 0 || self.config.workers == 0 {
            return Err(Error::Config(
                "mirror.queue_size and mirror.workers must be positive".to_string(),
            ));
        }

        let encapsulation = self.config.encapsulation();
        let transport = if encapsulation == Encapsulation::Gre {
            Transport::RawGre
        } else {
            Transport::Udp
        };
        let mut destinations = Vec::with_capacity(self.config.destinations.len());
        for addr in &self.config.destinations {
            destinations.push(Destination::open(addr, transport).await);
        }
        let ids = match self.config.ids_addr() {
            Some(addr) => Some(IdsSink::open(addr, self.gateway_id.clone()).await),
            None => None,
        };

        let pipeline = Arc::new(Pipeline {
            encapsulation,
            destinations,
            ids,
            counters: Arc::clone(&self.counters),
        });
        let (tx, rx) = mpsc::channel(self.config.queue_size);
        let rx = Arc::new(tokio::sync::Mutex::new(rx));
        let shutdown = CancellationToken::new();

        let mut tasks = Vec::with_capacity(self.config.workers + 1);
        for id in 0..self.config.workers {
            tasks.push(tokio::spawn(worker(
                id,
                Arc::clone(&rx),
                Arc::clone(&pipeline),
                shutdown.clone(),
            )));
        }
        tasks.push(tokio::spawn(reporter(
            Arc::clone(&self.counters),
            self.config.stats_interval,
            shutdown.clone(),
        )));

        info!(
            protocol = encapsulation.tag(),
            destinations = self.config.destinations.len(),
            ids = self.config.ids_addr().is_some(),
            workers = self.config.workers,
            queue_size = self.config.queue_size,
            "Mirror engine started"
        );
        *self.running.write() = Some(Running { tx, shutdown, tasks });
        Ok(())
    }

    /// Stop the workers. Queued packets are discarded.
    pub async fn stop(&self) {
        let Some(running) = self.running.write().take() else {
            return;
        };
        running.shutdown.cancel();
        drop(running.tx);
        for task in running.tasks {
            if let Err(e) = task.await {
                warn!(error = %e, "Mirror task ended abnormally");
            }
        }
        let stats = self.stats();
        info!(
            packets_sent = stats.packets_sent,
            packets_dropped = stats.packets_dropped,
            bytes_sent = stats.bytes_sent,
            errors = stats.errors,
            "Mirror engine stopped"
        );
    }

    /// Current counters
    #[must_use]
    pub fn stats(&self) -> MirrorStats {
        self.counters.snapshot()
    }

    /// Mirror a proxied HTTP exchange.
    pub fn mirror_http(&self, source: &str, target: &str, summary: &str, status: u16, body: &[u8]) {
        let mut payload = Vec::with_capacity(summary.len() + body.len() + 16);
        payload.extend_from_slice(format!("{summary} {status}\r\n\r\n").as_bytes());
        payload.extend_from_slice(body);

        let mut packet = MirrorPacket::new(TrafficProtocol::Http, source, target, payload.into());
        packet.metadata.insert("summary".into(), json!(summary));
        packet.metadata.insert("http_status".into(), json!(status));
        self.enqueue(packet);
    }

    /// Mirror a relayed TCP chunk.
    pub fn mirror_tcp(&self, source: &str, dest: &str, data: &[u8]) {
        self.enqueue(MirrorPacket::new(
            TrafficProtocol::Tcp,
            source,
            dest,
            Bytes::copy_from_slice(data),
        ));
    }

    /// Mirror a relayed UDP datagram.
    pub fn mirror_udp(&self, source: &str, dest: &str, data: &[u8]) {
        self.enqueue(MirrorPacket::new(
            TrafficProtocol::Udp,
            source,
            dest,
            Bytes::copy_from_slice(data),
        ));
    }

    /// Non-blocking enqueue.
    pub fn enqueue(&self, packet: MirrorPacket) {
        let accepted = self
            .running
            .read()
            .as_ref()
            .is_some_and(|running| running.tx.try_send(packet).is_ok());
        if !accepted {
            self.counters.dropped();
        }
    }
}

async fn worker(
    id: usize,
    rx: Arc<tokio::sync::Mutex<mpsc::Receiver<MirrorPacket>>>,
    pipeline: Arc<Pipeline>,
    shutdown: CancellationToken,
) {
    loop {
        let packet = {
            let mut rx = rx.lock().await;
            tokio::select! {
                packet = rx.recv() => packet,
                () = shutdown.cancelled() => None,
            }
        };
        let Some(packet) = packet else { break };
        pipeline.deliver(packet).await;
    }
    debug!(worker = id, "Mirror worker stopped");
}

async fn reporter(counters: Arc<Counters>, interval: std::time::Duration, shutdown: CancellationToken) {
    let mut ticker = tokio::time::interval(interval.max(std::time::Duration::from_secs(1)));
    ticker.tick().await;
    loop {
        tokio::select! {
            _ = ticker.tick() => {
                let stats = counters.snapshot();
                info!(
                    packets_sent = stats.packets_sent,
                    packets_dropped = stats.packets_dropped,
                    bytes_sent = stats.bytes_sent,
                    errors = stats.errors,
                    "Mirror stats"
                );
            }
            () = shutdown.cancelled() => break,
        }
    }
}

fn unix_secs() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs())
        .unwrap_or_default()
}
