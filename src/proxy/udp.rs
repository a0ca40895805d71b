//! Raw UDP relay path: one datagram in, at most one reply out.

use std::net::SocketAddr;
use std::sync::Arc;

use bytes::Bytes;
use headend_wire::Preamble;
use tokio::net::UdpSocket;
use tracing::{debug, warn};

use super::ProxyEngine;
use crate::audit::{Outcome, Transfer};
use crate::{Error, Result};

const MAX_DATAGRAM: usize = 65_535;

impl ProxyEngine {
    /// Handle one datagram received on `reply`.
    pub async fn handle_udp(self: Arc<Self>, datagram: Bytes, source: SocketAddr, reply: Arc<UdpSocket>) {
        let source_str = source.to_string();

        let preamble = match Preamble::parse_complete(&datagram) {
            Ok(p) => p,
            Err(e) => {
                let e = Error::from(e);
                debug!(source = %source_str, error = %e, "Rejecting datagram");
                self.audit
                    .log_udp_access(None, &source_str, "", Transfer::default(), Outcome::denied(e.audit_reason()));
                return;
            }
        };
        let target = preamble.target.as_str();
        let payload = &datagram[preamble.header_len..];

        let user = match self.admit(&preamble.token, target).await {
            Ok(user) => user,
            Err((user, e)) => {
                warn!(source = %source_str, target = %target, error = %e, "Datagram rejected");
                self.audit.log_udp_access(
                    user.as_ref(),
                    &source_str,
                    target,
                    Transfer::default(),
                    Outcome::denied(e.audit_reason()),
                );
                return;
            }
        };

        let transfer = match self.exchange(&source_str, target, payload, source, &reply).await {
            Ok(transfer) => transfer,
            Err(e) => {
                warn!(target = %target, error = %e, "UDP relay failed");
                Transfer::default()
            }
        };
        self.audit
            .log_udp_access(Some(&user), &source_str, target, transfer, Outcome::Allowed);
    }

    async fn exchange(
        &self,
        source_str: &str,
        target: &str,
        payload: &[u8],
        source: SocketAddr,
        reply: &UdpSocket,
    ) -> Result<Transfer> {
        let addr = self.dial_addr(target);
        let remote = tokio::net::lookup_host(&addr)
            .await?
            .next()
            .ok_or_else(|| Error::UpstreamUnavailable {
                target: target.to_string(),
                reason: "no address".to_string(),
            })?;
        let bind: SocketAddr = if remote.is_ipv4() {
            ([0u8, 0, 0, 0], 0).into()
        } else {
            ([0u16; 8], 0).into()
        };
        let upstream = UdpSocket::bind(bind).await?;
        upstream.connect(remote).await?;

        upstream.send(payload).await?;
        self.mirror_udp(source_str, target, payload);
        let mut transfer = Transfer {
            bytes_up: payload.len() as u64,
            bytes_down: 0,
        };

        let mut buf = vec![0u8; MAX_DATAGRAM];
        match tokio::time::timeout(self.settings.udp_response_timeout, upstream.recv(&mut buf)).await {
            Ok(Ok(n)) => {
                reply.send_to(&buf[..n], source).await?;
                self.mirror_udp(target, source_str, &buf[..n]);
                transfer.bytes_down = n as u64;
            }
            Ok(Err(e)) => return Err(e.into()),
            Err(_) => debug!(target = %target, "No UDP reply before timeout"),
        }
        Ok(transfer)
    }
}
