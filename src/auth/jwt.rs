//! Access-token verification against the orchestration backend's signing key.
//!
//! # Verification flow
//!
//! 1. Decode the JWT header (no verification) and reject any `alg` other than
//!    the configured asymmetric algorithm.
//! 2. Obtain the verification key: cached, refreshed on `key_refresh_interval`
//!    (at least one hour), fetched from `GET {backend}/verification-key`.
//! 3. Verify signature and `exp` (60 s leeway).
//! 4. On a signature mismatch, refetch the key once (the issuer may have
//!    rotated it) and retry; on-demand refetches are rate limited.
//! 5. Require `type == "access"` and build a [`User`] from the claims.
//!
//! A failed refresh never discards the last-known-good key.

use std::str::FromStr;
use std::sync::Arc;
use std::time::{Duration, Instant};

use jsonwebtoken::{Algorithm, DecodingKey, Validation, errors::ErrorKind};
use parking_lot::RwLock;
use serde::Deserialize;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{AuthError, User};
use crate::config::AuthConfig;
use crate::{Error, Result};

/// Lower bound for the periodic key refresh
pub const MIN_KEY_REFRESH_INTERVAL: Duration = Duration::from_secs(3600);

/// Minimum spacing between key fetch attempts
const MIN_REFETCH_INTERVAL: Duration = Duration::from_secs(60);

/// Upper bound for one verification-key request
const KEY_FETCH_TIMEOUT: Duration = Duration::from_secs(10);

/// Token kind accepted on the data plane
const ACCESS_TOKEN_TYPE: &str = "access";

/// Body of `GET /verification-key` when the backend answers in JSON.
#[derive(Debug, Deserialize)]
struct KeyResponse {
    public_key: String,
    #[serde(default)]
    algorithm: Option<String>,
}

/// Claims carried by an access token.
#[derive(Debug, Deserialize)]
struct AccessClaims {
    sub: String,
    #[serde(rename = "type", default)]
    token_type: Option<String>,
    #[serde(default)]
    role: Option<String>,
    #[serde(default)]
    user_type: Option<String>,
    #[serde(default)]
    permissions: Option<Vec<String>>,
    #[serde(default)]
    email: Option<String>,
    #[serde(default)]
    name: Option<String>,
    #[serde(default)]
    groups: Option<Vec<String>>,
}

#[derive(Default)]
struct KeyState {
    key: Option<DecodingKey>,
    fetched_at: Option<Instant>,
    last_attempt: Option<Instant>,
}

/// Bearer-token verifier with a cached, periodically refreshed key.
pub struct JwtVerifier {
    /// `None` for a pinned key that is never refetched
    key_url: Option<String>,
    algorithm: Algorithm,
    http: reqwest::Client,
    refresh_interval: Duration,
    min_refetch_interval: Duration,
    state: RwLock<KeyState>,
    /// Serializes fetches so concurrent misses trigger a single request
    fetch_lock: tokio::sync::Mutex<()>,
}

impl JwtVerifier {
    /// Create a verifier that fetches its key from the orchestration backend.
    pub fn new(config: &AuthConfig) -> Result<Self> {
        let algorithm = parse_algorithm(&config.algorithm)?;
        let base = config.backend_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::Config("auth.backend_url is required".to_string()));
        }

        let refresh_interval = config.key_refresh_interval.max(MIN_KEY_REFRESH_INTERVAL);
        if refresh_interval != config.key_refresh_interval {
            warn!(
                configured = ?config.key_refresh_interval,
                "Key refresh interval below one hour, clamping"
            );
        }

        Ok(Self {
            key_url: Some(format!("{base}/verification-key")),
            algorithm,
            http: key_client(KEY_FETCH_TIMEOUT)?,
            refresh_interval,
            min_refetch_interval: MIN_REFETCH_INTERVAL,
            state: RwLock::new(KeyState::default()),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Create a verifier pinned to a PEM public key (no backend fetches).
    pub fn from_pem(pem: &[u8], algorithm: &str) -> Result<Self> {
        let algorithm = parse_algorithm(algorithm)?;
        let key = decoding_key(pem, algorithm).map_err(|e| Error::Config(e.to_string()))?;
        Ok(Self {
            key_url: None,
            algorithm,
            http: reqwest::Client::new(),
            refresh_interval: MIN_KEY_REFRESH_INTERVAL,
            min_refetch_interval: MIN_REFETCH_INTERVAL,
            state: RwLock::new(KeyState {
                key: Some(key),
                fetched_at: Some(Instant::now()),
                last_attempt: None,
            }),
            fetch_lock: tokio::sync::Mutex::new(()),
        })
    }

    /// Override the on-demand refetch spacing (tests use zero).
    #[must_use]
    pub fn with_min_refetch_interval(mut self, interval: Duration) -> Self {
        self.min_refetch_interval = interval;
        self
    }

    /// Effective periodic refresh interval
    #[must_use]
    pub fn refresh_interval(&self) -> Duration {
        self.refresh_interval
    }

    /// `true` once a key has been loaded
    #[must_use]
    pub fn has_key(&self) -> bool {
        self.state.read().key.is_some()
    }

    /// Validate a bearer token and build the user it identifies.
    pub async fn validate(&self, token: &str) -> std::result::Result<User, AuthError> {
        let header = jsonwebtoken::decode_header(token)
            .map_err(|e| AuthError::InvalidToken(format!("malformed token: {e}")))?;
        if header.alg != self.algorithm {
            return Err(AuthError::InvalidToken(format!(
                "unexpected signing algorithm {:?}",
                header.alg
            )));
        }

        let key = self.current_key().await?;
        let claims = match self.decode(token, &key) {
            Err(AuthError::InvalidToken(reason)) if reason == SIGNATURE_MISMATCH => {
                // Possibly rotated: refetch once, then give up.
                match self.refresh(true).await {
                    Ok(fresh) => self.decode(token, &fresh)?,
                    Err(_) => return Err(AuthError::InvalidToken(reason)),
                }
            }
            other => other?,
        };

        if claims.token_type.as_deref() != Some(ACCESS_TOKEN_TYPE) {
            return Err(AuthError::InvalidToken(format!(
                "token type {:?} is not an access token",
                claims.token_type.as_deref().unwrap_or("<none>")
            )));
        }

        Ok(user_from_claims(claims))
    }

    fn decode(&self, token: &str, key: &DecodingKey) -> std::result::Result<AccessClaims, AuthError> {
        let mut validation = Validation::new(self.algorithm);
        validation.leeway = 60;
        validation.validate_aud = false;

        jsonwebtoken::decode::<AccessClaims>(token, key, &validation)
            .map(|data| data.claims)
            .map_err(|e| match e.kind() {
                ErrorKind::ExpiredSignature => AuthError::Expired,
                ErrorKind::InvalidSignature => AuthError::InvalidToken(SIGNATURE_MISMATCH.to_string()),
                ErrorKind::InvalidAlgorithm => {
                    AuthError::InvalidToken("unexpected signing algorithm".to_string())
                }
                _ => AuthError::InvalidToken(e.to_string()),
            })
    }

    /// Cached key if fresh, otherwise a (rate limited) refresh.
    async fn current_key(&self) -> std::result::Result<DecodingKey, AuthError> {
        {
            let state = self.state.read();
            if let (Some(key), Some(at)) = (&state.key, state.fetched_at) {
                if at.elapsed() < self.refresh_interval || self.key_url.is_none() {
                    return Ok(key.clone());
                }
            }
        }
        self.refresh(false).await
    }

    /// Fetch the key from the backend.
    ///
    /// When `force` is false a fresh cached key short-circuits the fetch.
    /// Attempts closer together than the minimum refetch interval return the
    /// cached key (or `KeyUnavailable`) without contacting the backend.
    pub async fn refresh(&self, force: bool) -> std::result::Result<DecodingKey, AuthError> {
        let Some(url) = self.key_url.as_deref() else {
            return self.cached_or_unavailable("key is pinned");
        };

        let _guard = self.fetch_lock.lock().await;
        {
            let state = self.state.read();
            let fresh = state
                .fetched_at
                .is_some_and(|at| at.elapsed() < self.refresh_interval);
            let recently_tried = state
                .last_attempt
                .is_some_and(|at| at.elapsed() < self.min_refetch_interval);
            if let Some(key) = &state.key {
                if (!force && fresh) || recently_tried {
                    return Ok(key.clone());
                }
            } else if recently_tried {
                return Err(AuthError::KeyUnavailable(
                    "verification key fetch failed recently".to_string(),
                ));
            }
        }

        self.state.write().last_attempt = Some(Instant::now());
        match self.fetch(url).await {
            Ok(key) => {
                let mut state = self.state.write();
                state.key = Some(key.clone());
                state.fetched_at = Some(Instant::now());
                info!(url = %url, "Verification key refreshed");
                Ok(key)
            }
            Err(reason) => {
                warn!(url = %url, error = %reason, "Verification key refresh failed");
                self.cached_or_unavailable(&reason)
            }
        }
    }

    fn cached_or_unavailable(&self, reason: &str) -> std::result::Result<DecodingKey, AuthError> {
        self.state
            .read()
            .key
            .clone()
            .ok_or_else(|| AuthError::KeyUnavailable(reason.to_string()))
    }

    async fn fetch(&self, url: &str) -> std::result::Result<DecodingKey, String> {
        debug!(url = %url, "Fetching verification key");
        let response = self
            .http
            .get(url)
            .send()
            .await
            .and_then(reqwest::Response::error_for_status)
            .map_err(|e| e.to_string())?;
        let body = response.text().await.map_err(|e| e.to_string())?;

        let pem = if body.trim_start().starts_with("-----BEGIN") {
            body
        } else {
            let parsed: KeyResponse = serde_json::from_str(&body).map_err(|e| e.to_string())?;
            if let Some(alg) = parsed.algorithm.as_deref() {
                if Algorithm::from_str(alg).ok() != Some(self.algorithm) {
                    warn!(advertised = %alg, expected = ?self.algorithm, "Backend advertises a different algorithm");
                }
            }
            parsed.public_key
        };

        decoding_key(pem.as_bytes(), self.algorithm).map_err(|e| e.to_string())
    }

    /// Spawn the periodic refresh task.
    pub fn spawn_refresh(self: &Arc<Self>, shutdown: CancellationToken) {
        if self.key_url.is_none() {
            return;
        }
        let verifier = Arc::clone(self);
        tokio::spawn(async move {
            let mut interval = tokio::time::interval(verifier.refresh_interval);
            loop {
                tokio::select! {
                    _ = interval.tick() => {
                        if let Err(e) = verifier.refresh(true).await {
                            warn!(error = %e, "Periodic key refresh failed");
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("Key refresh task stopped");
        });
    }
}

const SIGNATURE_MISMATCH: &str = "signature mismatch";

fn parse_algorithm(name: &str) -> Result<Algorithm> {
    let alg = Algorithm::from_str(name.trim())
        .map_err(|_| Error::Config(format!("Unknown JWT algorithm '{name}'")))?;
    match alg {
        Algorithm::HS256 | Algorithm::HS384 | Algorithm::HS512 => Err(Error::Config(format!(
            "JWT algorithm {name} is symmetric; an asymmetric algorithm is required"
        ))),
        other => Ok(other),
    }
}

fn decoding_key(pem: &[u8], alg: Algorithm) -> jsonwebtoken::errors::Result<DecodingKey> {
    match alg {
        Algorithm::ES256 | Algorithm::ES384 => DecodingKey::from_ec_pem(pem),
        Algorithm::EdDSA => DecodingKey::from_ed_pem(pem),
        _ => DecodingKey::from_rsa_pem(pem),
    }
}

fn user_from_claims(claims: AccessClaims) -> User {
    let role = claims
        .role
        .or(claims.user_type)
        .unwrap_or_else(|| "user".to_string());

    let mut permissions = serde_json::Map::new();
    for permission in claims.permissions.unwrap_or_default() {
        permissions.insert(permission, serde_json::Value::Bool(true));
    }

    let display_name = claims
        .name
        .filter(|n| !n.trim().is_empty())
        .unwrap_or_else(|| User::derived_display_name(&claims.sub));
    let email = claims
        .email
        .filter(|e| !e.trim().is_empty())
        .unwrap_or_else(|| User::placeholder_email(&claims.sub));

    User {
        id: claims.sub,
        display_name,
        email,
        groups: claims.groups.unwrap_or_default(),
        role,
        permissions,
    }
}

fn key_client(timeout: Duration) -> Result<reqwest::Client> {
    reqwest::Client::builder()
        .timeout(timeout)
        .build()
        .map_err(|e| Error::Config(format!("verification key client: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn key_fetch_gives_up_on_a_silent_backend() {
        // Accepts connections but never answers
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            let mut held = Vec::new();
            while let Ok((stream, _)) = listener.accept().await {
                held.push(stream);
            }
        });

        let client = key_client(Duration::from_millis(200)).unwrap();
        let err = tokio::time::timeout(
            Duration::from_secs(5),
            client.get(format!("http://{addr}/verification-key")).send(),
        )
        .await
        .expect("client timeout not applied")
        .unwrap_err();
        assert!(err.is_timeout());
    }

    #[test]
    fn symmetric_algorithms_are_rejected() {
        assert!(matches!(parse_algorithm("HS256"), Err(Error::Config(_))));
        assert!(matches!(parse_algorithm("none"), Err(Error::Config(_))));
        assert_eq!(parse_algorithm("RS256").unwrap(), Algorithm::RS256);
        assert_eq!(parse_algorithm(" ES256 ").unwrap(), Algorithm::ES256);
    }

    #[test]
    fn refresh_interval_is_clamped_to_an_hour() {
        let config = AuthConfig {
            backend_url: "http://127.0.0.1:1".to_string(),
            key_refresh_interval: Duration::from_secs(5),
            ..Default::default()
        };
        let verifier = JwtVerifier::new(&config).unwrap();
        assert_eq!(verifier.refresh_interval(), MIN_KEY_REFRESH_INTERVAL);
        assert!(!verifier.has_key());
    }

    #[test]
    fn user_synthesizes_missing_contact_fields() {
        let user = user_from_claims(AccessClaims {
            sub: "7f3a9c21-aaaa-bbbb".to_string(),
            token_type: Some("access".to_string()),
            role: None,
            user_type: Some("admin".to_string()),
            permissions: Some(vec!["ssh".to_string(), "db".to_string()]),
            email: None,
            name: None,
            groups: None,
        });
        assert_eq!(user.display_name, "user-7f3a9c21");
        assert_eq!(user.email, "7f3a9c21-aaaa-bbbb@users.headend.invalid");
        assert_eq!(user.role, "admin");
        assert!(user.has_permission("ssh"));
        assert!(!user.has_permission("rdp"));
    }

    #[tokio::test]
    async fn malformed_token_is_invalid() {
        let config = AuthConfig {
            backend_url: "http://127.0.0.1:1".to_string(),
            ..Default::default()
        };
        let verifier = JwtVerifier::new(&config).unwrap();
        let err = verifier.validate("not-a-jwt").await.unwrap_err();
        assert!(matches!(err, AuthError::InvalidToken(_)));
    }
}
