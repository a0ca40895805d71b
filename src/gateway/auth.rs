//! Authentication middleware for the proxied HTTP path
//!
//! - Bearer token validation through the configured [`AuthProvider`]
//! - Public paths that bypass authentication
//! - Failed attempts are audited with `allowed=false`

use std::net::SocketAddr;
use std::sync::Arc;

use axum::{
    Json,
    body::Body,
    extract::{ConnectInfo, State},
    http::{HeaderMap, Request, StatusCode},
    middleware::Next,
    response::{IntoResponse, Response},
};
use serde_json::json;
use tracing::{debug, warn};

use crate::Error;
use crate::audit::{AuditLog, HttpSummary, Outcome};
use crate::auth::{AuthError, AuthProvider};
use crate::proxy::http::target_host;

/// Paths served without a bearer token
pub const PUBLIC_PATHS: &[&str] = &["/health", "/metrics", "/auth/login", "/auth/logout"];

/// State for [`auth_middleware`]
pub struct AuthState {
    /// Token validation
    pub provider: Arc<dyn AuthProvider>,
    /// Sink for rejected attempts
    pub audit: Arc<dyn AuditLog>,
    /// Paths that bypass authentication
    pub public_paths: Vec<String>,
}

impl AuthState {
    /// State with the default public paths
    #[must_use]
    pub fn new(provider: Arc<dyn AuthProvider>, audit: Arc<dyn AuditLog>) -> Self {
        Self {
            provider,
            audit,
            public_paths: PUBLIC_PATHS.iter().map(ToString::to_string).collect(),
        }
    }

    /// Check if a path is public (bypasses auth)
    #[must_use]
    pub fn is_public_path(&self, path: &str) -> bool {
        self.public_paths.iter().any(|p| path == p)
    }
}

/// Extract the bearer token from an `Authorization` header
#[must_use]
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get("authorization")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.strip_prefix("Bearer ").or_else(|| v.strip_prefix("bearer ")))
        .map(str::trim)
        .filter(|t| !t.is_empty())
}

/// Client address from the connection, when the server recorded it
#[must_use]
pub fn client_addr<B>(request: &Request<B>) -> String {
    request
        .extensions()
        .get::<ConnectInfo<SocketAddr>>()
        .map(|ConnectInfo(addr)| addr.to_string())
        .unwrap_or_default()
}

/// Authentication middleware
pub async fn auth_middleware(State(state): State<Arc<AuthState>>, mut request: Request<Body>, next: Next) -> Response {
    let path = request.uri().path().to_string();

    if state.is_public_path(&path) {
        debug!(path = %path, "Public path, skipping auth");
        return next.run(request).await;
    }

    let result = match bearer_token(request.headers()) {
        Some(token) => state.provider.validate(token).await,
        None => Err(AuthError::MissingToken),
    };

    match result {
        Ok(user) => {
            debug!(user = %user.id, path = %path, "Authenticated request");
            request.extensions_mut().insert(user);
            next.run(request).await
        }
        Err(e) => {
            warn!(path = %path, error = %e, "Authentication failed");
            let target = target_host(request.headers()).unwrap_or_default();
            let error = Error::Authentication(e);
            state.audit.log_http_access(
                None,
                &client_addr(&request),
                &target,
                HttpSummary {
                    method: request.method().to_string(),
                    path,
                    status: StatusCode::UNAUTHORIZED.as_u16(),
                },
                Outcome::denied(error.audit_reason()),
            );
            unauthorized_response(&error)
        }
    }
}

/// Create a 401 Unauthorized response
fn unauthorized_response(error: &Error) -> Response {
    (
        StatusCode::UNAUTHORIZED,
        [("WWW-Authenticate", "Bearer")],
        Json(json!({ "error": error.to_string() })),
    )
        .into_response()
}
