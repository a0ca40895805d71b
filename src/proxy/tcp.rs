//! Raw TCP relay path.

use std::net::SocketAddr;
use std::sync::Arc;

use headend_wire::{MAX_PREAMBLE_LEN, Preamble, PreambleError};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::ProxyEngine;
use crate::audit::{Outcome, Transfer};
use crate::{Error, Result};

const CHUNK: usize = 16 * 1024;

/// Read the preamble from the start of `stream`.
///
/// Returns the preamble and the payload bytes that arrived with it.
pub async fn read_preamble<R>(stream: &mut R) -> Result<(Preamble, Vec<u8>)>
where
    R: AsyncRead + Unpin,
{
    let mut buf = Vec::with_capacity(512);
    let mut chunk = [0u8; 1024];
    loop {
        if let Some(preamble) = Preamble::parse(&buf)? {
            let rest = buf.split_off(preamble.header_len);
            return Ok((preamble, rest));
        }
        // Never read past the cap while still looking for the preamble.
        let room = (MAX_PREAMBLE_LEN + 1).saturating_sub(buf.len()).min(chunk.len());
        let n = stream.read(&mut chunk[..room]).await?;
        if n == 0 {
            return Err(PreambleError::Incomplete.into());
        }
        buf.extend_from_slice(&chunk[..n]);
    }
}

impl ProxyEngine {
    /// Handle one accepted stream until both directions finish.
    pub async fn handle_tcp(self: Arc<Self>, mut client: TcpStream, peer: SocketAddr) {
        let source = peer.to_string();

        let framing = tokio::time::timeout(self.settings.preamble_timeout, read_preamble(&mut client)).await;
        let (preamble, early) = match framing {
            Ok(Ok(parsed)) => parsed,
            Ok(Err(e)) => {
                debug!(source = %source, error = %e, "Rejecting stream");
                self.audit
                    .log_tcp_access(None, &source, "", Transfer::default(), Outcome::denied(e.audit_reason()));
                return;
            }
            Err(_) => {
                debug!(source = %source, "Preamble timed out");
                return;
            }
        };
        let target = preamble.target;

        let user = match self.admit(&preamble.token, &target).await {
            Ok(user) => user,
            Err((user, e)) => {
                warn!(source = %source, target = %target, error = %e, "Stream rejected");
                self.audit.log_tcp_access(
                    user.as_ref(),
                    &source,
                    &target,
                    Transfer::default(),
                    Outcome::denied(e.audit_reason()),
                );
                return;
            }
        };

        let upstream = match self.dial(&target).await {
            Ok(stream) => stream,
            Err(e) => {
                warn!(target = %target, error = %e, "Dial failed");
                self.audit
                    .log_tcp_access(Some(&user), &source, &target, Transfer::default(), Outcome::Allowed);
                return;
            }
        };

        info!(user = %user.id, source = %source, target = %target, "Relaying stream");
        let transfer = match self.relay(client, upstream, &source, &target, &early).await {
            Ok(transfer) => transfer,
            Err((transfer, e)) => {
                debug!(target = %target, error = %e, "Relay ended with error");
                transfer
            }
        };
        debug!(
            target = %target,
            bytes_up = transfer.bytes_up,
            bytes_down = transfer.bytes_down,
            "Stream closed"
        );
        self.audit
            .log_tcp_access(Some(&user), &source, &target, transfer, Outcome::Allowed);
    }

    async fn dial(&self, target: &str) -> Result<TcpStream> {
        let addr = self.dial_addr(target);
        let unavailable = |reason: String| Error::UpstreamUnavailable {
            target: target.to_string(),
            reason,
        };
        tokio::time::timeout(self.settings.connect_timeout, TcpStream::connect(&addr))
            .await
            .map_err(|_| unavailable("connect timed out".to_string()))?
            .map_err(|e| unavailable(e.to_string()))
    }

    /// Pump both directions; an error on either side closes both.
    async fn relay(
        &self,
        client: TcpStream,
        mut upstream: TcpStream,
        source: &str,
        target: &str,
        early: &[u8],
    ) -> std::result::Result<Transfer, (Transfer, Error)> {
        let mut transfer = Transfer::default();
        if !early.is_empty() {
            upstream
                .write_all(early)
                .await
                .map_err(|e| (transfer, e.into()))?;
            self.mirror_tcp(source, target, early);
            transfer.bytes_up = early.len() as u64;
        }

        let (client_read, client_write) = client.into_split();
        let (upstream_read, upstream_write) = upstream.into_split();
        let abort = CancellationToken::new();

        let (up, down) = tokio::join!(
            pump(client_read, upstream_write, &abort, |chunk| self.mirror_tcp(source, target, chunk)),
            pump(upstream_read, client_write, &abort, |chunk| self.mirror_tcp(target, source, chunk)),
        );

        let (up, up_err) = split_outcome(up);
        let (down, down_err) = split_outcome(down);
        transfer.bytes_up += up;
        transfer.bytes_down += down;
        match up_err.or(down_err) {
            Some(e) => Err((transfer, e.into())),
            None => Ok(transfer),
        }
    }
}

fn split_outcome(outcome: std::result::Result<u64, (u64, std::io::Error)>) -> (u64, Option<std::io::Error>) {
    match outcome {
        Ok(n) => (n, None),
        Err((n, e)) => (n, Some(e)),
    }
}

/// Copy `reader` to `writer` until EOF, mirroring each chunk. EOF half-closes
/// the writer; an error cancels the opposite direction too.
async fn pump<R, W, F>(
    mut reader: R,
    mut writer: W,
    abort: &CancellationToken,
    mirror: F,
) -> std::result::Result<u64, (u64, std::io::Error)>
where
    R: AsyncRead + Unpin,
    W: AsyncWrite + Unpin,
    F: Fn(&[u8]),
{
    let mut buf = vec![0u8; CHUNK];
    let mut total = 0u64;
    loop {
        let read = tokio::select! {
            read = reader.read(&mut buf) => read,
            () = abort.cancelled() => return Ok(total),
        };
        let n = match read {
            Ok(0) => {
                let _ = writer.shutdown().await;
                return Ok(total);
            }
            Ok(n) => n,
            Err(e) => {
                abort.cancel();
                return Err((total, e));
            }
        };
        if let Err(e) = writer.write_all(&buf[..n]).await {
            abort.cancel();
            return Err((total, e));
        }
        mirror(&buf[..n]);
        total += n as u64;
    }
}
