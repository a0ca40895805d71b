//! HTTP reverse-proxy path.

use std::collections::HashMap;
use std::net::SocketAddr;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;

use axum::body::{Body, to_bytes};
use axum::http::uri::Authority;
use axum::http::{HeaderMap, HeaderName, HeaderValue, Request, StatusCode, header};
use axum::response::{IntoResponse, Response};
use futures::StreamExt;
use parking_lot::RwLock;
use tracing::{debug, warn};

use super::ProxyEngine;
use crate::audit::{HttpSummary, Outcome};
use crate::auth::User;
use crate::peer::split_host_port;
use crate::{Error, Result};

/// Request header naming the upstream host
pub const TARGET_HOST_HEADER: &str = "x-target-host";

/// Headers that describe one hop and are never forwarded
const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Security headers set on every proxied response
const SECURITY_HEADERS: &[(&str, &str)] = &[
    ("x-frame-options", "DENY"),
    ("x-content-type-options", "nosniff"),
    ("x-xss-protection", "1; mode=block"),
];

/// One upstream client per distinct target host, created lazily and kept
/// for the life of the engine.
pub struct ClientCache {
    clients: RwLock<HashMap<String, reqwest::Client>>,
    request_timeout: Duration,
    idle_timeout: Duration,
}

impl ClientCache {
    /// Empty cache
    #[must_use]
    pub fn new(request_timeout: Duration, idle_timeout: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            request_timeout,
            idle_timeout,
        }
    }

    /// Client for `host`, creating it on first use. `resolved` pins the
    /// host's address (peer-routed targets).
    pub fn get(&self, host: &str, resolved: Option<SocketAddr>) -> Result<reqwest::Client> {
        if let Some(client) = self.clients.read().get(host) {
            return Ok(client.clone());
        }

        let mut clients = self.clients.write();
        if let Some(client) = clients.get(host) {
            return Ok(client.clone());
        }
        let client = self.build(host, resolved)?;
        clients.insert(host.to_string(), client.clone());
        debug!(host = %host, cached = clients.len(), "Created upstream client");
        Ok(client)
    }

    /// Number of cached clients
    #[must_use]
    pub fn len(&self) -> usize {
        self.clients.read().len()
    }

    /// `true` when no client has been created
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.clients.read().is_empty()
    }

    fn build(&self, host: &str, resolved: Option<SocketAddr>) -> Result<reqwest::Client> {
        let mut builder = reqwest::Client::builder()
            .timeout(self.request_timeout)
            .pool_idle_timeout(self.idle_timeout)
            .redirect(reqwest::redirect::Policy::none())
            .no_gzip();
        if let Some(addr) = resolved {
            let name = split_host_port(host).map_or(host, |(name, _)| name);
            builder = builder.resolve(name, addr);
        }
        builder
            .build()
            .map_err(|e| Error::Internal(format!("upstream client for {host}: {e}")))
    }
}

/// Proxy one authenticated request.
///
/// The caller has already authenticated `user`; this performs the target
/// lookup, authorization and forwarding. The upstream body is streamed to
/// the caller while a bounded copy is kept for mirroring; mirror and audit
/// records are emitted once the body is finished or dropped.
pub async fn forward(engine: Arc<ProxyEngine>, user: User, source: String, request: Request<Body>) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let summary = |status: u16| HttpSummary {
        method: method.clone(),
        path: path.clone(),
        status,
    };

    let host = match target_host(request.headers()) {
        Ok(host) => host,
        Err(e) => {
            if let Error::InvalidTarget(raw) = &e {
                warn!(user = %user.id, target = %raw, "Rejected malformed target host");
                let status = e.status_code().as_u16();
                engine
                    .audit()
                    .log_http_access(Some(&user), &source, raw, summary(status), Outcome::denied(e.audit_reason()));
            }
            return error_response(&e);
        }
    };

    if let Err(e) = engine.authorize(&user, &host).await {
        warn!(user = %user.id, target = %host, "Request denied by firewall");
        let status = e.status_code().as_u16();
        engine
            .audit()
            .log_http_access(Some(&user), &source, &host, summary(status), Outcome::denied(e.audit_reason()));
        return error_response(&e);
    }

    match relay(&engine, &host, request).await {
        Ok(upstream) => {
            let status = upstream.status();
            let headers = upstream.headers().clone();
            let tap = ResponseTap {
                limit: engine.settings().mirror_body_limit,
                engine: Arc::clone(&engine),
                user,
                source,
                request_line: format!("{method} {path} {host}"),
                host,
                summary: summary(status.as_u16()),
                captured: Vec::new(),
                streamed: 0,
            };
            build_response(status, &headers, tapped_body(upstream, tap))
        }
        Err(e) => {
            warn!(target = %host, error = %e, "Upstream request failed");
            let status = e.status_code().as_u16();
            engine
                .audit()
                .log_http_access(Some(&user), &source, &host, summary(status), Outcome::Allowed);
            error_response(&e)
        }
    }
}

async fn relay(engine: &ProxyEngine, host: &str, request: Request<Body>) -> Result<reqwest::Response> {
    let resolved = engine
        .peers
        .route(host)
        .and_then(|peer| peer.parse::<SocketAddr>().ok());
    let client = engine.clients().get(host, resolved)?;

    let (parts, body) = request.into_parts();
    let path_and_query = parts.uri.path_and_query().map_or("/", |pq| pq.as_str());
    let url = format!("{}://{host}{path_and_query}", engine.settings().target_scheme);
    let body = to_bytes(body, engine.settings().max_body_size)
        .await
        .map_err(|e| Error::Internal(format!("request body: {e}")))?;

    let upstream = client
        .request(parts.method, &url)
        .headers(forwardable(&parts.headers))
        .body(body)
        .send()
        .await
        .map_err(|e| Error::UpstreamUnavailable {
            target: host.to_string(),
            reason: e.to_string(),
        })?;
    debug!(url = %url, status = upstream.status().as_u16(), "Upstream responded");
    Ok(upstream)
}

/// Observes a streamed response body. Keeps at most `limit` bytes for the
/// mirror copy; the caller always receives the full body.
struct ResponseTap {
    engine: Arc<ProxyEngine>,
    user: User,
    source: String,
    request_line: String,
    host: String,
    summary: HttpSummary,
    captured: Vec<u8>,
    limit: usize,
    streamed: u64,
}

impl ResponseTap {
    fn observe(&mut self, chunk: &[u8]) {
        self.streamed += chunk.len() as u64;
        keep_prefix(&mut self.captured, chunk, self.limit);
    }
}

/// Append as much of `chunk` as fits under `limit` total bytes
fn keep_prefix(buf: &mut Vec<u8>, chunk: &[u8], limit: usize) {
    let room = limit.saturating_sub(buf.len());
    buf.extend_from_slice(&chunk[..chunk.len().min(room)]);
}

impl Drop for ResponseTap {
    fn drop(&mut self) {
        debug!(
            target = %self.host,
            streamed = self.streamed,
            mirrored = self.captured.len(),
            "Response body finished"
        );
        if let Some(mirror) = self.engine.mirror() {
            mirror.mirror_http(&self.source, &self.host, &self.request_line, self.summary.status, &self.captured);
        }
        self.engine.audit().log_http_access(
            Some(&self.user),
            &self.source,
            &self.host,
            std::mem::take(&mut self.summary),
            Outcome::Allowed,
        );
    }
}

fn tapped_body(upstream: reqwest::Response, mut tap: ResponseTap) -> Body {
    Body::from_stream(upstream.bytes_stream().map(move |chunk| {
        match &chunk {
            Ok(bytes) => tap.observe(bytes),
            Err(e) => warn!(target = %tap.host, error = %e, "Upstream body failed mid-stream"),
        }
        chunk
    }))
}

/// Target from the target-host header, normalized to `host[:port]`.
///
/// Only a bare authority is accepted: no userinfo, path, query or fragment,
/// so the name the firewall approves is the name that gets dialed.
pub fn target_host(headers: &HeaderMap) -> Result<String> {
    let Some(value) = headers.get(TARGET_HOST_HEADER) else {
        return Err(Error::MissingTarget);
    };
    let raw = value
        .to_str()
        .map_err(|_| Error::InvalidTarget(String::from_utf8_lossy(value.as_bytes()).into_owned()))?
        .trim();
    if raw.is_empty() {
        return Err(Error::MissingTarget);
    }
    let invalid = || Error::InvalidTarget(raw.to_string());
    if raw.contains(['/', '?', '#', '@', '\\']) || raw.contains(char::is_whitespace) {
        return Err(invalid());
    }

    let authority = Authority::from_str(raw).map_err(|_| invalid())?;
    let host = authority.host();
    if host.is_empty() {
        return Err(invalid());
    }
    let host_name = host.to_ascii_lowercase();
    match raw.get(host.len()..) {
        Some("") => Ok(host_name),
        Some(rest) => {
            let port = rest
                .strip_prefix(':')
                .filter(|p| !p.is_empty() && p.bytes().all(|b| b.is_ascii_digit()))
                .and_then(|p| p.parse::<u16>().ok())
                .filter(|&p| p != 0)
                .ok_or_else(invalid)?;
            Ok(format!("{host_name}:{port}"))
        }
        None => Err(invalid()),
    }
}

fn forwardable(headers: &HeaderMap) -> HeaderMap {
    let mut out = HeaderMap::with_capacity(headers.len());
    for (name, value) in headers {
        let n = name.as_str();
        if HOP_BY_HOP.contains(&n)
            || name == header::HOST
            || name == header::AUTHORIZATION
            || name == header::CONTENT_LENGTH
            || n == TARGET_HOST_HEADER
        {
            continue;
        }
        out.append(name.clone(), value.clone());
    }
    out
}

fn build_response(status: StatusCode, upstream: &HeaderMap, body: Body) -> Response {
    let mut response = Response::new(body);
    *response.status_mut() = status;
    let headers = response.headers_mut();
    for (name, value) in upstream {
        if HOP_BY_HOP.contains(&name.as_str()) || name == header::CONTENT_LENGTH {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    for &(name, value) in SECURITY_HEADERS {
        headers.insert(HeaderName::from_static(name), HeaderValue::from_static(value));
    }
    response
}

/// JSON error body with the error's status
pub fn error_response(error: &Error) -> Response {
    (
        error.status_code(),
        axum::Json(serde_json::json!({ "error": error.to_string() })),
    )
        .into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn cache_reuses_clients_per_host() {
        let cache = ClientCache::new(Duration::from_secs(5), Duration::from_secs(5));
        cache.get("a.internal", None).unwrap();
        cache.get("a.internal", None).unwrap();
        cache.get("b.internal:8080", None).unwrap();
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn hop_by_hop_and_credentials_are_stripped() {
        let mut headers = HeaderMap::new();
        headers.insert(header::AUTHORIZATION, HeaderValue::from_static("Bearer t"));
        headers.insert(header::CONNECTION, HeaderValue::from_static("keep-alive"));
        headers.insert(TARGET_HOST_HEADER, HeaderValue::from_static("api.internal"));
        headers.insert(header::ACCEPT, HeaderValue::from_static("application/json"));

        let out = forwardable(&headers);
        assert_eq!(out.len(), 1);
        assert_eq!(out[header::ACCEPT], "application/json");
    }

    #[test]
    fn responses_carry_security_headers() {
        let mut upstream = HeaderMap::new();
        upstream.insert(header::CONTENT_TYPE, HeaderValue::from_static("text/plain"));
        upstream.insert(header::TRANSFER_ENCODING, HeaderValue::from_static("chunked"));

        let response = build_response(StatusCode::OK, &upstream, Body::from("ok"));
        let headers = response.headers();
        assert_eq!(headers["x-frame-options"], "DENY");
        assert_eq!(headers["x-content-type-options"], "nosniff");
        assert_eq!(headers["x-xss-protection"], "1; mode=block");
        assert_eq!(headers[header::CONTENT_TYPE], "text/plain");
        assert!(headers.get(header::TRANSFER_ENCODING).is_none());
    }

    fn target(value: &'static str) -> Result<String> {
        let mut headers = HeaderMap::new();
        headers.insert(TARGET_HOST_HEADER, HeaderValue::from_static(value));
        target_host(&headers)
    }

    #[test]
    fn blank_target_header_is_missing() {
        assert!(matches!(target_host(&HeaderMap::new()), Err(Error::MissingTarget)));
        assert!(matches!(target("  "), Err(Error::MissingTarget)));
        assert_eq!(target("api.internal").unwrap(), "api.internal");
    }

    #[test]
    fn target_is_normalized_authority() {
        assert_eq!(target("API.Internal:8443").unwrap(), "api.internal:8443");
        assert_eq!(target(" db.internal ").unwrap(), "db.internal");
        assert_eq!(target("[::1]:9000").unwrap(), "[::1]:9000");
    }

    #[test]
    fn target_smuggling_another_host_is_rejected() {
        for raw in [
            "api.internal@127.0.0.1:8080",
            "user:pw@api.internal",
            "api.internal/../admin",
            "evil.internal/api.internal",
            "api.internal#@evil",
            "api.internal?x=1",
            "api.internal:",
            "api.internal:0",
            "api.internal:99999",
            "api internal",
            ":8080",
        ] {
            assert!(
                matches!(target(raw), Err(Error::InvalidTarget(_))),
                "{raw} should be rejected"
            );
        }
    }

    #[test]
    fn mirror_copy_is_truncated_at_limit() {
        let mut captured = Vec::new();
        for chunk in [&b"abc"[..], b"defg", b"hij"] {
            keep_prefix(&mut captured, chunk, 5);
        }
        assert_eq!(captured, b"abcde");

        let mut unbounded = Vec::new();
        keep_prefix(&mut unbounded, b"abc", 0);
        assert!(unbounded.is_empty());
    }
}
