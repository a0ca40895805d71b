//! Authentication: bearer-token verification behind a pluggable provider.
//!
//! Every provider validates the same bearer-token format issued by the
//! orchestration backend. The federated modes (`oauth2`, `saml2`) differ only
//! in where the interactive login and logout hooks point; the handshakes
//! themselves are run by the external identity collaborator.

pub mod jwt;

use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use thiserror::Error;

pub use jwt::JwtVerifier;

use crate::config::AuthMode;

/// Authentication failures.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AuthError {
    /// No bearer token was presented
    #[error("missing bearer token")]
    MissingToken,
    /// Malformed token, bad signature, wrong algorithm or wrong token kind
    #[error("invalid token: {0}")]
    InvalidToken(String),
    /// Token `exp` has passed
    #[error("token expired")]
    Expired,
    /// No verification key could be obtained
    #[error("verification key unavailable: {0}")]
    KeyUnavailable(String),
}

/// Principal derived from a verified access token. Never persisted.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct User {
    /// Token subject
    pub id: String,
    /// Display name (derived from the id when the token has none)
    pub display_name: String,
    /// Contact address (placeholder when the token has none)
    pub email: String,
    /// Group tags
    #[serde(default)]
    pub groups: Vec<String>,
    /// Role / user-type tag
    pub role: String,
    /// Opaque permission set
    #[serde(default)]
    pub permissions: serde_json::Map<String, serde_json::Value>,
}

impl User {
    /// Placeholder domain for synthesized addresses
    pub const PLACEHOLDER_DOMAIN: &'static str = "users.headend.invalid";

    /// `user-<first 8 chars of id>`
    #[must_use]
    pub fn derived_display_name(id: &str) -> String {
        let short: String = id.chars().take(8).collect();
        format!("user-{short}")
    }

    /// `<id>@users.headend.invalid`
    #[must_use]
    pub fn placeholder_email(id: &str) -> String {
        format!("{id}@{}", Self::PLACEHOLDER_DOMAIN)
    }

    /// Whether the permission set grants `permission`
    #[must_use]
    pub fn has_permission(&self, permission: &str) -> bool {
        self.permissions
            .get(permission)
            .is_some_and(|v| v.as_bool().unwrap_or(true))
    }
}

/// A bearer-token authentication backend.
#[async_trait]
pub trait AuthProvider: Send + Sync {
    /// Mode this provider serves
    fn mode(&self) -> AuthMode;

    /// Validate a bearer token
    async fn validate(&self, token: &str) -> Result<User, AuthError>;

    /// Where to send a browser to start an interactive login
    fn login_url(&self, _return_to: Option<&str>) -> Option<String> {
        None
    }

    /// Where to send a browser to end its session
    fn logout_url(&self) -> Option<String> {
        None
    }
}

#[async_trait]
impl AuthProvider for JwtVerifier {
    fn mode(&self) -> AuthMode {
        AuthMode::Jwt
    }

    async fn validate(&self, token: &str) -> Result<User, AuthError> {
        JwtVerifier::validate(self, token).await
    }
}

/// OAuth2 / SAML2 provider. Validation is the shared JWT path; login and
/// logout are delegated to the identity collaborator.
pub struct FederatedAuth {
    mode: AuthMode,
    backend_url: String,
    verifier: Arc<JwtVerifier>,
}

impl FederatedAuth {
    /// Wrap a verifier for a federated mode
    #[must_use]
    pub fn new(mode: AuthMode, backend_url: &str, verifier: Arc<JwtVerifier>) -> Self {
        Self {
            mode,
            backend_url: backend_url.trim_end_matches('/').to_string(),
            verifier,
        }
    }

    fn hook_url(&self, hook: &str) -> String {
        format!("{}/auth/{}/{hook}", self.backend_url, self.mode.as_str())
    }
}

#[async_trait]
impl AuthProvider for FederatedAuth {
    fn mode(&self) -> AuthMode {
        self.mode
    }

    async fn validate(&self, token: &str) -> Result<User, AuthError> {
        self.verifier.validate(token).await
    }

    fn login_url(&self, return_to: Option<&str>) -> Option<String> {
        let base = self.hook_url("login");
        match return_to {
            Some(rt) => url::Url::parse_with_params(&base, &[("return_to", rt)])
                .ok()
                .map(String::from),
            None => Some(base),
        }
    }

    fn logout_url(&self) -> Option<String> {
        Some(self.hook_url("logout"))
    }
}

/// Build the provider for a mode around a shared verifier.
#[must_use]
pub fn provider_for(mode: AuthMode, backend_url: &str, verifier: Arc<JwtVerifier>) -> Arc<dyn AuthProvider> {
    match mode {
        AuthMode::Jwt => verifier as Arc<dyn AuthProvider>,
        AuthMode::Oauth2 | AuthMode::Saml2 => Arc::new(FederatedAuth::new(mode, backend_url, verifier)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AuthConfig;

    fn verifier() -> Arc<JwtVerifier> {
        let config = AuthConfig {
            backend_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        Arc::new(JwtVerifier::new(&config).unwrap())
    }

    #[test]
    fn jwt_mode_has_no_login_hooks() {
        let provider = provider_for(AuthMode::Jwt, "https://m.internal", verifier());
        assert_eq!(provider.mode(), AuthMode::Jwt);
        assert!(provider.login_url(None).is_none());
        assert!(provider.logout_url().is_none());
    }

    #[test]
    fn federated_modes_point_at_identity_collaborator() {
        let provider = provider_for(AuthMode::Saml2, "https://m.internal/", verifier());
        assert_eq!(provider.mode(), AuthMode::Saml2);
        assert_eq!(
            provider.login_url(None).as_deref(),
            Some("https://m.internal/auth/saml2/login")
        );
        assert_eq!(
            provider.login_url(Some("https://app/x?y=1")).as_deref(),
            Some("https://m.internal/auth/saml2/login?return_to=https%3A%2F%2Fapp%2Fx%3Fy%3D1")
        );
        assert_eq!(
            provider.logout_url().as_deref(),
            Some("https://m.internal/auth/saml2/logout")
        );
    }

    #[test]
    fn permission_lookup() {
        let mut permissions = serde_json::Map::new();
        permissions.insert("ssh".into(), serde_json::Value::Bool(true));
        permissions.insert("rdp".into(), serde_json::Value::Bool(false));
        let user = User {
            id: "u1".into(),
            display_name: User::derived_display_name("u1"),
            email: User::placeholder_email("u1"),
            groups: vec![],
            role: "user".into(),
            permissions,
        };
        assert_eq!(user.display_name, "user-u1");
        assert!(user.has_permission("ssh"));
        assert!(!user.has_permission("rdp"));
        assert!(!user.has_permission("db"));
    }
}
