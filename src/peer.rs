//! Peer routing: which tunnel peer, if any, fronts a target.

use std::collections::HashMap;

/// Resolves targets that must be reached through a tunnel peer.
pub trait PeerRouter: Send + Sync {
    /// Address to dial instead of `target`, or `None` to dial directly
    fn route(&self, target: &str) -> Option<String>;
}

/// Router backed by a fixed `target host -> peer address` table.
///
/// Keys match either the full `host:port` target or just its host. A peer
/// address without a port inherits the target's port.
#[derive(Debug, Default, Clone)]
pub struct StaticPeerRouter {
    peers: HashMap<String, String>,
}

impl StaticPeerRouter {
    /// Create from a routing table
    #[must_use]
    pub fn new(peers: HashMap<String, String>) -> Self {
        Self { peers }
    }

    /// Number of routed targets
    #[must_use]
    pub fn len(&self) -> usize {
        self.peers.len()
    }

    /// `true` when nothing is routed
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.peers.is_empty()
    }
}

impl PeerRouter for StaticPeerRouter {
    fn route(&self, target: &str) -> Option<String> {
        if let Some(peer) = self.peers.get(target) {
            return Some(peer.clone());
        }
        let (host, port) = split_host_port(target)?;
        let peer = self.peers.get(host)?;
        if split_host_port(peer).is_some() {
            Some(peer.clone())
        } else {
            Some(format!("{peer}:{port}"))
        }
    }
}

/// Split `host:port` (bracketed IPv6 allowed).
pub(crate) fn split_host_port(target: &str) -> Option<(&str, u16)> {
    let (host, port) = target.rsplit_once(':')?;
    let port = port.parse().ok()?;
    let host = host.strip_prefix('[').and_then(|h| h.strip_suffix(']')).unwrap_or(host);
    if host.is_empty() || (host.contains(':') && !target.starts_with('[')) {
        return None;
    }
    Some((host, port))
}
