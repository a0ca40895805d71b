//! Outbound collector sockets.

use std::io;
use std::net::{SocketAddr, SocketAddrV4};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use parking_lot::RwLock;
use socket2::{Domain, Protocol, SockAddr, Socket, Type};
use tokio::net::UdpSocket;
use tracing::{debug, info, warn};

/// IP protocol number for GRE
const IPPROTO_GRE: i32 = 47;

/// Collector port assumed when a destination has none
pub const DEFAULT_COLLECTOR_PORT: u16 = 4789;

/// Delay before a dead destination is redialed
const RECONNECT_DELAY: Duration = Duration::from_secs(1);

/// Socket family a destination needs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Transport {
    /// Connected UDP socket (VXLAN, ERSPAN, pass-through)
    Udp,
    /// Raw IPv4 protocol-47 socket (GRE)
    RawGre,
}

enum Conn {
    Udp(UdpSocket),
    Gre { socket: Socket, peer: SockAddr },
}

impl Conn {
    async fn send(&self, frame: &[u8]) -> io::Result<usize> {
        match self {
            Self::Udp(socket) => socket.send(frame).await,
            // Non-blocking; a full send buffer surfaces as WouldBlock and
            // counts as a failed write.
            Self::Gre { socket, peer } => socket.send_to(frame, peer),
        }
    }
}

/// A persistent outbound socket to one collector.
pub struct Destination {
    addr: String,
    transport: Transport,
    conn: RwLock<Option<Arc<Conn>>>,
    reconnecting: AtomicBool,
}

impl Destination {
    /// Create and attempt the first connect. A failed connect leaves the
    /// destination dead with a reconnect scheduled.
    pub async fn open(addr: &str, transport: Transport) -> Arc<Self> {
        let dest = Arc::new(Self {
            addr: addr.to_string(),
            transport,
            conn: RwLock::new(None),
            reconnecting: AtomicBool::new(false),
        });
        match connect(&dest.addr, transport).await {
            Ok(conn) => {
                info!(destination = %dest.addr, transport = ?transport, "Mirror destination connected");
                *dest.conn.write() = Some(Arc::new(conn));
            }
            Err(e) => {
                warn!(destination = %dest.addr, error = %e, "Mirror destination unavailable");
                dest.schedule_reconnect();
            }
        }
        dest
    }

    /// Collector address
    #[must_use]
    pub fn addr(&self) -> &str {
        &self.addr
    }

    /// `true` while a socket is held
    #[must_use]
    pub fn is_connected(&self) -> bool {
        self.conn.read().is_some()
    }

    /// Write one frame. On failure the destination is marked dead and a
    /// single reconnect is scheduled; the frame is not retried.
    pub async fn send(self: &Arc<Self>, frame: &[u8]) -> io::Result<usize> {
        let conn = self.conn.read().clone();
        let Some(conn) = conn else {
            self.schedule_reconnect();
            return Err(io::Error::new(io::ErrorKind::NotConnected, "destination is down"));
        };
        match conn.send(frame).await {
            Ok(n) => Ok(n),
            Err(e) => {
                *self.conn.write() = None;
                self.schedule_reconnect();
                Err(e)
            }
        }
    }

    fn schedule_reconnect(self: &Arc<Self>) {
        if self.reconnecting.swap(true, Ordering::AcqRel) {
            return;
        }
        let dest = Arc::clone(self);
        tokio::spawn(async move {
            tokio::time::sleep(RECONNECT_DELAY).await;
            match connect(&dest.addr, dest.transport).await {
                Ok(conn) => {
                    info!(destination = %dest.addr, "Mirror destination reconnected");
                    *dest.conn.write() = Some(Arc::new(conn));
                }
                Err(e) => debug!(destination = %dest.addr, error = %e, "Mirror reconnect failed"),
            }
            dest.reconnecting.store(false, Ordering::Release);
        });
    }
}

async fn connect(addr: &str, transport: Transport) -> io::Result<Conn> {
    let target = resolve(addr, transport).await?;
    match transport {
        Transport::Udp => {
            let bind: SocketAddr = if target.is_ipv4() {
                ([0u8, 0, 0, 0], 0).into()
            } else {
                ([0u16; 8], 0).into()
            };
            let socket = UdpSocket::bind(bind).await?;
            socket.connect(target).await?;
            Ok(Conn::Udp(socket))
        }
        Transport::RawGre => {
            let SocketAddr::V4(v4) = target else {
                return Err(io::Error::new(
                    io::ErrorKind::InvalidInput,
                    "GRE destinations must be IPv4",
                ));
            };
            let socket = Socket::new(Domain::IPV4, Type::RAW, Some(Protocol::from(IPPROTO_GRE)))?;
            socket.set_nonblocking(true)?;
            Ok(Conn::Gre {
                socket,
                peer: SockAddr::from(SocketAddrV4::new(*v4.ip(), 0)),
            })
        }
    }
}

/// Resolve `host[:port]`. GRE ignores the port; UDP defaults it.
async fn resolve(addr: &str, transport: Transport) -> io::Result<SocketAddr> {
    let with_port = if crate::peer::split_host_port(addr).is_some() {
        addr.to_string()
    } else {
        format!("{addr}:{DEFAULT_COLLECTOR_PORT}")
    };
    let mut candidates = tokio::net::lookup_host(&with_port).await?;
    let found = match transport {
        Transport::RawGre => candidates.find(SocketAddr::is_ipv4),
        Transport::Udp => candidates.next(),
    };
    found.ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("no address for {addr}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn udp_destination_delivers_frames() {
        let collector = UdpSocket::bind("127.0.0.1:0").await.unwrap();
        let addr = collector.local_addr().unwrap().to_string();

        let dest = Destination::open(&addr, Transport::Udp).await;
        assert!(dest.is_connected());
        dest.send(b"frame").await.unwrap();

        let mut buf = [0u8; 16];
        let n = collector.recv(&mut buf).await.unwrap();
        assert_eq!(&buf[..n], b"frame");
    }

    #[tokio::test]
    async fn unresolvable_destination_is_dead_not_fatal() {
        let dest = Destination::open("collector.invalid:4789", Transport::Udp).await;
        assert!(!dest.is_connected());
        assert!(dest.send(b"x").await.is_err());
    }

    #[tokio::test]
    async fn missing_port_defaults_to_vxlan_port() {
        let addr = resolve("127.0.0.1", Transport::Udp).await.unwrap();
        assert_eq!(addr.port(), DEFAULT_COLLECTOR_PORT);
    }
}
