//! Port-configuration polling against the orchestration backend.

use std::sync::Arc;
use std::time::Duration;

use headend_wire::PortRangeSet;
use serde::Deserialize;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::DynamicPortManager;
use crate::config::DynamicPortsConfig;
use crate::{Error, Result};

/// Body of `GET /port-config`.
#[derive(Debug, Clone, Default, Deserialize)]
pub struct PortConfigResponse {
    /// Gateway the config is addressed to (absent means "whoever asked")
    #[serde(default)]
    pub gateway_id: Option<String>,
    /// TCP range expression
    #[serde(default)]
    pub tcp_ranges: String,
    /// UDP range expression
    #[serde(default)]
    pub udp_ranges: String,
    /// Per-port descriptions, informational only
    #[serde(default)]
    pub detail: Vec<serde_json::Value>,
}

/// Polls the backend and reconfigures the manager on change.
pub struct PortConfigClient {
    http: reqwest::Client,
    url: String,
    gateway_id: String,
    cluster_id: String,
    interval: Duration,
}

impl PortConfigClient {
    /// Create from config
    pub fn new(config: &DynamicPortsConfig) -> Result<Self> {
        let base = config.backend_url.trim_end_matches('/');
        if base.is_empty() {
            return Err(Error::Config("dynamic_ports.backend_url is required".to_string()));
        }
        let http = reqwest::Client::builder()
            .timeout(Duration::from_secs(10))
            .build()
            .map_err(|e| Error::Config(format!("port-config client: {e}")))?;
        Ok(Self {
            http,
            url: format!("{base}/port-config"),
            gateway_id: config.gateway_id.clone(),
            cluster_id: config.cluster_id.clone(),
            interval: config.refresh_interval.max(Duration::from_secs(1)),
        })
    }

    /// Fetch and validate the current configuration.
    pub async fn fetch(&self) -> Result<PortRangeSet> {
        let response: PortConfigResponse = self
            .http
            .get(&self.url)
            .query(&[
                ("gateway_id", self.gateway_id.as_str()),
                ("cluster_id", self.cluster_id.as_str()),
            ])
            .send()
            .await?
            .error_for_status()?
            .json()
            .await?;
        self.accept(response)
    }

    fn accept(&self, response: PortConfigResponse) -> Result<PortRangeSet> {
        if let Some(target) = response.gateway_id.as_deref().filter(|id| !id.is_empty()) {
            if target != self.gateway_id {
                return Err(Error::Config(format!(
                    "port config addressed to gateway '{target}', this is '{}'",
                    self.gateway_id
                )));
            }
        }
        if response.tcp_ranges.trim().is_empty() && response.udp_ranges.trim().is_empty() {
            return Err(Error::Config("port config has no ranges".to_string()));
        }
        debug!(entries = response.detail.len(), "Port config detail");
        Ok(PortRangeSet::parse_validated(
            &response.tcp_ranges,
            &response.udp_ranges,
        )?)
    }

    /// One poll: reconfigure when the fetched ranges differ from the active
    /// ones. Returns whether a reconfiguration happened.
    pub async fn poll_once(&self, manager: &DynamicPortManager) -> Result<bool> {
        let ranges = self.fetch().await?;
        if ranges == manager.ranges() && manager.listener_count() > 0 {
            return Ok(false);
        }
        manager
            .reconfigure(&ranges.tcp_expr(), &ranges.udp_expr())
            .await?;
        Ok(true)
    }

    /// Poll on the configured interval until `shutdown` fires.
    pub fn spawn(self, manager: Arc<DynamicPortManager>, shutdown: CancellationToken) -> JoinHandle<()> {
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(self.interval);
            info!(url = %self.url, interval = ?self.interval, "Port config polling started");
            loop {
                tokio::select! {
                    _ = ticker.tick() => {
                        match self.poll_once(&manager).await {
                            Ok(true) => info!("Applied new port configuration"),
                            Ok(false) => debug!("Port configuration unchanged"),
                            Err(e) => warn!(error = %e, "Port config poll failed, keeping current listeners"),
                        }
                    }
                    () = shutdown.cancelled() => break,
                }
            }
            debug!("Port config polling stopped");
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn client() -> PortConfigClient {
        PortConfigClient::new(&DynamicPortsConfig {
            enabled: true,
            backend_url: "http://127.0.0.1:1".into(),
            gateway_id: "gw-1".into(),
            ..Default::default()
        })
        .unwrap()
    }

    #[test]
    fn rejects_config_for_another_gateway() {
        let response = PortConfigResponse {
            gateway_id: Some("gw-2".into()),
            tcp_ranges: "9000".into(),
            ..Default::default()
        };
        assert!(matches!(client().accept(response), Err(Error::Config(_))));
    }

    #[test]
    fn rejects_empty_config() {
        let response = PortConfigResponse {
            gateway_id: Some("gw-1".into()),
            ..Default::default()
        };
        assert!(client().accept(response).is_err());
    }

    #[test]
    fn accepts_unaddressed_config() {
        let response = PortConfigResponse {
            gateway_id: None,
            tcp_ranges: "9000-9002".into(),
            udp_ranges: "5353".into(),
            detail: vec![],
        };
        let ranges = client().accept(response).unwrap();
        assert_eq!(ranges.port_count(), 4);
    }

    #[test]
    fn rejects_duplicate_ports() {
        let response = PortConfigResponse {
            tcp_ranges: "9000-9002,9001".into(),
            ..Default::default()
        };
        assert!(matches!(client().accept(response), Err(Error::PortRange(_))));
    }

    #[tokio::test]
    async fn unreachable_backend_is_an_error() {
        let manager = DynamicPortManager::new("127.0.0.1");
        assert!(client().poll_once(&manager).await.is_err());
        assert_eq!(manager.listener_count(), 0);
    }
}
