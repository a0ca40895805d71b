//! HTTP router and handlers

use std::sync::Arc;

use axum::{
    Json, Router,
    body::Body,
    extract::{Query, State},
    http::{HeaderMap, HeaderValue, Request, StatusCode, header},
    middleware,
    response::{IntoResponse, Redirect, Response},
    routing::get,
};
use serde::Deserialize;
use serde_json::json;
use tower_http::{
    catch_panic::CatchPanicLayer,
    request_id::{MakeRequestId, PropagateRequestIdLayer, RequestId, SetRequestIdLayer},
    trace::TraceLayer,
};
use tracing::debug;

use super::auth::{AuthState, auth_middleware, bearer_token, client_addr};
use crate::auth::User;
use crate::ports::DynamicPortManager;
use crate::proxy::{ProxyEngine, http};

/// Shared application state
pub struct AppState {
    /// Proxy engine (auth, firewall, audit, mirror, client cache)
    pub engine: Arc<ProxyEngine>,
    /// Static TCP/UDP relay listeners
    pub static_ports: Option<Arc<DynamicPortManager>>,
    /// Dynamic port manager, when enabled
    pub dynamic_ports: Option<Arc<DynamicPortManager>>,
    /// Whether the firewall collaborator is consulted
    pub firewall_enabled: bool,
    /// Bearer token guarding `/metrics`
    pub metrics_token: Option<String>,
    /// Prometheus renderer
    #[cfg(feature = "metrics")]
    pub prometheus: Option<metrics_exporter_prometheus::PrometheusHandle>,
}

/// Create the router
pub fn create_router(state: Arc<AppState>) -> Router {
    let auth_state = Arc::new(AuthState::new(
        Arc::clone(state.engine.auth()),
        Arc::clone(state.engine.audit()),
    ));

    Router::new()
        .route("/health", get(health_handler))
        .route("/metrics", get(metrics_handler))
        .route("/auth/login", get(login_handler))
        .route("/auth/logout", get(logout_handler))
        .fallback(proxy_handler)
        // Authentication middleware (applied before other layers)
        .layer(middleware::from_fn_with_state(auth_state, auth_middleware))
        .layer(CatchPanicLayer::new())
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(TraceLayer::new_for_http())
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .with_state(state)
}

/// Tags each request with a v4 UUID unless the client already sent one
#[derive(Debug, Clone, Copy, Default)]
struct MakeRequestUuid;

impl MakeRequestId for MakeRequestUuid {
    fn make_request_id<B>(&mut self, _request: &Request<B>) -> Option<RequestId> {
        HeaderValue::from_str(&uuid::Uuid::new_v4().to_string())
            .ok()
            .map(RequestId::new)
    }
}

/// Health check handler
async fn health_handler(State(state): State<Arc<AppState>>) -> impl IntoResponse {
    let engine = &state.engine;
    let mirror = engine.mirror().map(|m| {
        json!({
            "running": m.is_running(),
            "protocol": m.encapsulation().tag(),
            "stats": m.stats(),
        })
    });
    let listeners = |manager: &Option<Arc<DynamicPortManager>>| {
        manager.as_ref().map(|m| {
            json!({
                "listeners": m.listener_count(),
                "configured": m.configured_ports().len(),
            })
        })
    };

    Json(json!({
        "status": "healthy",
        "version": env!("CARGO_PKG_VERSION"),
        "components": {
            "auth": engine.auth().mode().as_str(),
            "firewall": state.firewall_enabled,
            "mirror": mirror,
            "static_ports": listeners(&state.static_ports),
            "dynamic_ports": listeners(&state.dynamic_ports),
            "upstream_clients": engine.clients().len(),
        }
    }))
}

/// Prometheus metrics, bearer-gated
async fn metrics_handler(State(state): State<Arc<AppState>>, headers: HeaderMap) -> Response {
    use subtle::ConstantTimeEq;

    let Some(expected) = state.metrics_token.as_deref() else {
        return StatusCode::NOT_FOUND.into_response();
    };

    // Constant-time comparison to prevent timing side-channels
    let authorized = bearer_token(&headers).is_some_and(|p| p.as_bytes().ct_eq(expected.as_bytes()).into());
    if !authorized {
        return (StatusCode::UNAUTHORIZED, [(header::WWW_AUTHENTICATE, "Bearer")]).into_response();
    }

    render_metrics(&state)
}

#[cfg(feature = "metrics")]
fn render_metrics(state: &AppState) -> Response {
    match &state.prometheus {
        Some(handle) => (
            [(header::CONTENT_TYPE, "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}

#[cfg(not(feature = "metrics"))]
fn render_metrics(_state: &AppState) -> Response {
    StatusCode::NOT_FOUND.into_response()
}

#[derive(Debug, Deserialize)]
struct LoginQuery {
    return_to: Option<String>,
}

/// Redirect to the identity collaborator's login hook
async fn login_handler(State(state): State<Arc<AppState>>, Query(query): Query<LoginQuery>) -> Response {
    match state.engine.auth().login_url(query.return_to.as_deref()) {
        Some(url) => Redirect::temporary(&url).into_response(),
        None => no_login_hooks(),
    }
}

/// Redirect to the identity collaborator's logout hook
async fn logout_handler(State(state): State<Arc<AppState>>) -> Response {
    match state.engine.auth().logout_url() {
        Some(url) => Redirect::temporary(&url).into_response(),
        None => no_login_hooks(),
    }
}

fn no_login_hooks() -> Response {
    (
        StatusCode::NOT_FOUND,
        Json(json!({ "error": "interactive login is not available in this auth mode" })),
    )
        .into_response()
}

/// Everything else is proxied
async fn proxy_handler(State(state): State<Arc<AppState>>, request: Request<Body>) -> Response {
    let Some(user) = request.extensions().get::<User>().cloned() else {
        debug!("Request reached proxy without an authenticated user");
        return http::error_response(&crate::Error::Authentication(crate::auth::AuthError::MissingToken));
    };
    let source = client_addr(&request);
    http::forward(Arc::clone(&state.engine), user, source, request).await
}

#[cfg(test)]
mod tests {
    use axum::http::header::LOCATION;
    use tower::ServiceExt;

    use super::*;
    use crate::auth::{JwtVerifier, provider_for};
    use crate::config::{AuthConfig, AuthMode};
    use crate::proxy::ProxySettings;

    fn app(mode: AuthMode) -> Router {
        let verifier = Arc::new(
            JwtVerifier::new(&AuthConfig {
                backend_url: "http://127.0.0.1:1".to_string(),
                ..Default::default()
            })
            .unwrap(),
        );
        let auth = provider_for(mode, "https://manager.internal", verifier);
        create_router(Arc::new(AppState {
            engine: Arc::new(ProxyEngine::new(auth, ProxySettings::default())),
            static_ports: None,
            dynamic_ports: None,
            firewall_enabled: false,
            metrics_token: None,
            #[cfg(feature = "metrics")]
            prometheus: None,
        }))
    }

    fn get(uri: &str) -> Request<Body> {
        Request::builder().uri(uri).body(Body::empty()).unwrap()
    }

    #[tokio::test]
    async fn federated_login_redirects_to_identity_collaborator() {
        let response = app(AuthMode::Oauth2)
            .oneshot(get("/auth/login?return_to=/console"))
            .await
            .unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(
            response.headers()[LOCATION],
            "https://manager.internal/auth/oauth2/login?return_to=%2Fconsole"
        );
    }

    #[tokio::test]
    async fn federated_logout_redirects() {
        let response = app(AuthMode::Saml2).oneshot(get("/auth/logout")).await.unwrap();

        assert_eq!(response.status(), StatusCode::TEMPORARY_REDIRECT);
        assert_eq!(response.headers()[LOCATION], "https://manager.internal/auth/saml2/logout");
    }

    #[tokio::test]
    async fn metrics_disabled_without_token() {
        let response = app(AuthMode::Jwt).oneshot(get("/metrics")).await.unwrap();
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn proxied_path_requires_bearer_and_tags_request_id() {
        let response = app(AuthMode::Jwt).oneshot(get("/anything")).await.unwrap();

        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(response.headers()[header::WWW_AUTHENTICATE], "Bearer");
        assert!(response.headers().contains_key("x-request-id"));
    }
}
