//! Firewall-policy collaborator.
//!
//! The policy engine answers allow/deny per `(user, target)`. Any failure to
//! obtain an answer is a denial.

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::auth::User;
use crate::config::FirewallConfig;
use crate::{Error, Result};

/// Authorization decision point.
#[async_trait]
pub trait Firewall: Send + Sync {
    /// `true` when `user` may reach `target`
    async fn check_access(&self, user: &User, target: &str) -> bool;
}

/// Used when the firewall is disabled.
pub struct AllowAll;

#[async_trait]
impl Firewall for AllowAll {
    async fn check_access(&self, _user: &User, _target: &str) -> bool {
        true
    }
}

#[derive(Serialize)]
struct CheckAccessRequest<'a> {
    user_id: &'a str,
    target: &'a str,
}

#[derive(Deserialize)]
struct CheckAccessResponse {
    allowed: bool,
}

/// Policy service reached over HTTP (`POST {url}/check-access`).
pub struct HttpFirewall {
    client: reqwest::Client,
    endpoint: String,
    token: Option<String>,
}

impl HttpFirewall {
    /// Create from config
    pub fn new(config: &FirewallConfig) -> Result<Self> {
        let base = config.url.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::Config("firewall.url is required".to_string()));
        }
        let client = reqwest::Client::builder()
            .timeout(config.timeout)
            .build()
            .map_err(|e| Error::Config(format!("firewall client: {e}")))?;
        Ok(Self {
            client,
            endpoint: format!("{base}/check-access"),
            token: config.resolve_token(),
        })
    }

    async fn query(&self, user: &User, target: &str) -> Result<bool> {
        let mut request = self.client.post(&self.endpoint).json(&CheckAccessRequest {
            user_id: &user.id,
            target,
        });
        if let Some(token) = &self.token {
            request = request.bearer_auth(token);
        }
        let response = request.send().await?.error_for_status()?;
        Ok(response.json::<CheckAccessResponse>().await?.allowed)
    }
}

#[async_trait]
impl Firewall for HttpFirewall {
    async fn check_access(&self, user: &User, target: &str) -> bool {
        match self.query(user, target).await {
            Ok(allowed) => {
                debug!(user = %user.id, target = %target, allowed, "Firewall decision");
                allowed
            }
            Err(e) => {
                warn!(user = %user.id, target = %target, error = %e, "Firewall check failed, denying");
                false
            }
        }
    }
}

/// Build the firewall for a config.
pub fn from_config(config: &FirewallConfig) -> Result<std::sync::Arc<dyn Firewall>> {
    if config.enabled {
        Ok(std::sync::Arc::new(HttpFirewall::new(config)?))
    } else {
        Ok(std::sync::Arc::new(AllowAll))
    }
}
