//! Configuration management

use std::{collections::HashMap, env, path::Path, time::Duration};

use figment::{
    Figment,
    providers::{Env, Format, Yaml},
};
use headend_wire::{Encapsulation, ErspanParams, PortRangeSet};
use regex::Regex;
use serde::{Deserialize, Serialize};

use crate::{Error, Result};

/// Main configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct Config {
    /// Environment files to load before processing config.
    /// Paths support ~ expansion. Loaded in order, later files override earlier.
    #[serde(default)]
    pub env_files: Vec<String>,
    /// Listener and proxy settings
    pub server: ServerConfig,
    /// Token verification
    pub auth: AuthConfig,
    /// Traffic mirroring
    pub mirror: MirrorConfig,
    /// Firewall collaborator
    pub firewall: FirewallConfig,
    /// Audit-log collaborator
    pub audit: AuditConfig,
    /// Dynamic port management
    pub dynamic_ports: DynamicPortsConfig,
    /// Metrics endpoint
    pub metrics: MetricsConfig,
    /// Peer routing overrides
    pub routing: RoutingConfig,
}

/// Listener and proxy settings
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ServerConfig {
    /// Host to bind every listener to
    pub host: String,
    /// HTTP proxy / API port
    pub http_port: u16,
    /// Static TCP relay port (0 disables)
    pub tcp_port: u16,
    /// Static UDP relay port (0 disables)
    pub udp_port: u16,
    /// Overall timeout for one proxied HTTP exchange
    #[serde(with = "humantime_serde")]
    pub request_timeout: Duration,
    /// Idle timeout for pooled upstream HTTP connections
    #[serde(with = "humantime_serde")]
    pub idle_timeout: Duration,
    /// Graceful shutdown timeout
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
    /// Maximum request body size (bytes)
    pub max_body_size: usize,
    /// Bytes of each HTTP response body kept for the mirror copy
    pub mirror_body_limit: usize,
    /// Scheme used to reach HTTP targets
    pub target_scheme: String,
    /// How long a UDP relay waits for the single response datagram
    #[serde(with = "humantime_serde")]
    pub udp_response_timeout: Duration,
    /// How long a TCP client has to deliver its preamble
    #[serde(with = "humantime_serde")]
    pub preamble_timeout: Duration,
    /// Timeout for dialing TCP targets
    #[serde(with = "humantime_serde")]
    pub connect_timeout: Duration,
    /// This gateway's identity, reported in mirror/IDS records
    pub gateway_id: String,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: "0.0.0.0".to_string(),
            http_port: 8443,
            tcp_port: 8444,
            udp_port: 8445,
            request_timeout: Duration::from_secs(30),
            idle_timeout: Duration::from_secs(90),
            shutdown_timeout: Duration::from_secs(30),
            max_body_size: 10 * 1024 * 1024, // 10MB
            mirror_body_limit: 60 * 1024,
            target_scheme: "https".to_string(),
            udp_response_timeout: Duration::from_secs(30),
            preamble_timeout: Duration::from_secs(10),
            connect_timeout: Duration::from_secs(10),
            gateway_id: "headend".to_string(),
        }
    }
}

/// Authentication backend selection
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum AuthMode {
    /// Bearer JWT issued by the orchestration backend
    #[default]
    Jwt,
    /// OAuth2 login handled by the identity collaborator, same bearer format
    Oauth2,
    /// SAML2 login handled by the identity collaborator, same bearer format
    Saml2,
}

impl AuthMode {
    /// Lowercase tag
    #[must_use]
    pub fn as_str(self) -> &'static str {
        match self {
            Self::Jwt => "jwt",
            Self::Oauth2 => "oauth2",
            Self::Saml2 => "saml2",
        }
    }
}

/// Token verification configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuthConfig {
    /// Provider mode
    pub mode: AuthMode,
    /// Orchestration backend base URL (serves `/verification-key`)
    pub backend_url: String,
    /// Expected signing algorithm (RS256, RS384, RS512, PS256, ES256, ES384)
    pub algorithm: String,
    /// Verification key refresh interval (clamped to at least one hour)
    #[serde(with = "humantime_serde")]
    pub key_refresh_interval: Duration,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            mode: AuthMode::Jwt,
            backend_url: String::new(),
            algorithm: "RS256".to_string(),
            key_refresh_interval: Duration::from_secs(3600),
        }
    }
}

/// Traffic mirroring configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MirrorConfig {
    /// Enable mirroring
    pub enabled: bool,
    /// Collector addresses (`host:port`; the port is ignored for GRE)
    pub destinations: Vec<String>,
    /// Encapsulation tag: vxlan, gre, erspan; anything else is raw
    pub protocol: String,
    /// Bounded queue capacity
    pub queue_size: usize,
    /// Worker pool size
    pub workers: usize,
    /// VXLAN network id
    pub vni: u32,
    /// ERSPAN session id
    pub erspan_session_id: u16,
    /// ERSPAN VLAN
    pub erspan_vlan: u16,
    /// Optional IDS collector host (EVE JSON over TCP)
    pub ids_host: Option<String>,
    /// IDS collector port
    pub ids_port: u16,
    /// Counter report interval
    #[serde(with = "humantime_serde")]
    pub stats_interval: Duration,
}

impl Default for MirrorConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            destinations: Vec::new(),
            protocol: "vxlan".to_string(),
            queue_size: 10_000,
            workers: 4,
            vni: headend_wire::encap::DEFAULT_VNI,
            erspan_session_id: 1,
            erspan_vlan: 0,
            ids_host: None,
            ids_port: 9555,
            stats_interval: Duration::from_secs(60),
        }
    }
}

impl MirrorConfig {
    /// Resolve the configured tag and parameters into an encapsulation
    #[must_use]
    pub fn encapsulation(&self) -> Encapsulation {
        match self.protocol.parse::<Encapsulation>() {
            Ok(Encapsulation::Vxlan { .. }) => Encapsulation::Vxlan { vni: self.vni },
            Ok(Encapsulation::Erspan(_)) => Encapsulation::Erspan(ErspanParams {
                vlan: self.erspan_vlan,
                session_id: self.erspan_session_id,
            }),
            Ok(other) => other,
            Err(never) => match never {},
        }
    }

    /// IDS collector address when configured
    #[must_use]
    pub fn ids_addr(&self) -> Option<String> {
        self.ids_host
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(|h| format!("{h}:{}", self.ids_port))
    }
}

/// Firewall collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct FirewallConfig {
    /// When disabled every authenticated user may reach every target
    pub enabled: bool,
    /// Policy service base URL
    pub url: String,
    /// Bearer token for the policy service (supports `env:VAR`)
    pub token: Option<String>,
    /// Per-check timeout
    #[serde(with = "humantime_serde")]
    pub timeout: Duration,
}

impl Default for FirewallConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            url: String::new(),
            token: None,
            timeout: Duration::from_secs(5),
        }
    }
}

impl FirewallConfig {
    /// Resolve the service token (expand `env:VAR`)
    #[must_use]
    pub fn resolve_token(&self) -> Option<String> {
        self.token.as_deref().map(resolve_secret)
    }
}

/// Audit-log collaborator configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AuditConfig {
    /// Collector host; entries are only traced locally when unset
    pub host: Option<String>,
    /// Collector port
    pub port: u16,
    /// Bounded shipping queue
    pub queue_size: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            host: None,
            port: 5170,
            queue_size: 4096,
        }
    }
}

impl AuditConfig {
    /// Collector address when configured
    #[must_use]
    pub fn collector_addr(&self) -> Option<String> {
        self.host
            .as_deref()
            .filter(|h| !h.is_empty())
            .map(|h| format!("{h}:{}", self.port))
    }
}

/// Dynamic port management configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct DynamicPortsConfig {
    /// Enable the dynamic port manager
    pub enabled: bool,
    /// Orchestration backend base URL (serves `/port-config`)
    pub backend_url: String,
    /// This gateway's identity as known to the backend
    pub gateway_id: String,
    /// Cluster id
    pub cluster_id: String,
    /// Poll interval
    #[serde(with = "humantime_serde")]
    pub refresh_interval: Duration,
    /// Host to bind dynamic listeners to
    pub bind_host: String,
    /// Initial TCP ranges, used until the first successful poll
    pub tcp_ranges: String,
    /// Initial UDP ranges
    pub udp_ranges: String,
}

impl Default for DynamicPortsConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            backend_url: String::new(),
            gateway_id: String::new(),
            cluster_id: String::new(),
            refresh_interval: Duration::from_secs(30),
            bind_host: "0.0.0.0".to_string(),
            tcp_ranges: String::new(),
            udp_ranges: String::new(),
        }
    }
}

/// Metrics endpoint configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct MetricsConfig {
    /// Bearer token guarding `/metrics` (supports `env:VAR`); endpoint is
    /// disabled when unset
    pub token: Option<String>,
}

impl MetricsConfig {
    /// Resolve the metrics token
    #[must_use]
    pub fn resolve_token(&self) -> Option<String> {
        self.token.as_deref().map(resolve_secret).filter(|t| !t.is_empty())
    }
}

/// Peer routing configuration
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
#[serde(default)]
pub struct RoutingConfig {
    /// Target host (or `host:port`) to tunnel peer address
    pub peers: HashMap<String, String>,
}

fn resolve_secret(value: &str) -> String {
    if let Some(var_name) = value.strip_prefix("env:") {
        env::var(var_name).unwrap_or_else(|_| value.to_string())
    } else {
        value.to_string()
    }
}

impl Config {
    /// Load configuration from file and environment
    ///
    /// # Errors
    ///
    /// Returns an error if the config file does not exist or cannot be parsed.
    pub fn load(path: Option<&Path>) -> Result<Self> {
        let mut figment = Figment::new();

        if let Some(p) = path {
            if !p.exists() {
                return Err(Error::Config(format!(
                    "Config file not found: {}",
                    p.display()
                )));
            }
            figment = figment.merge(Yaml::file(p));
        }

        // Merge environment variables (HEADEND_ prefix)
        figment = figment.merge(Env::prefixed("HEADEND_").split("__"));

        let mut config: Self = figment
            .extract()
            .map_err(|e| Error::Config(e.to_string()))?;

        config.load_env_files();
        config.expand_env_vars();

        Ok(config)
    }

    /// Check cross-field requirements. Failures are fatal at startup.
    pub fn validate(&self) -> Result<()> {
        if self.auth.backend_url.trim().is_empty() {
            return Err(Error::Config("auth.backend_url is required".to_string()));
        }
        if self.mirror.enabled {
            if self.mirror.destinations.is_empty() && self.mirror.ids_addr().is_none() {
                return Err(Error::Config(
                    "mirror.enabled requires at least one destination or an IDS collector".to_string(),
                ));
            }
            if self.mirror.queue_size == 0 || self.mirror.workers == 0 {
                return Err(Error::Config(
                    "mirror.queue_size and mirror.workers must be positive".to_string(),
                ));
            }
        }
        if self.firewall.enabled && self.firewall.url.trim().is_empty() {
            return Err(Error::Config("firewall.enabled requires firewall.url".to_string()));
        }
        if self.dynamic_ports.enabled {
            if self.dynamic_ports.backend_url.trim().is_empty() {
                return Err(Error::Config(
                    "dynamic_ports.enabled requires dynamic_ports.backend_url".to_string(),
                ));
            }
            if self.dynamic_ports.gateway_id.trim().is_empty() {
                return Err(Error::Config(
                    "dynamic_ports.enabled requires dynamic_ports.gateway_id".to_string(),
                ));
            }
            PortRangeSet::parse_validated(&self.dynamic_ports.tcp_ranges, &self.dynamic_ports.udp_ranges)?;
        }
        Ok(())
    }

    /// Load environment files into the process environment.
    /// Supports ~ expansion. Files that don't exist are silently skipped.
    fn load_env_files(&self) {
        for path_str in &self.env_files {
            let expanded = if path_str.starts_with('~') {
                if let Some(home) = dirs::home_dir() {
                    path_str.replacen('~', &home.display().to_string(), 1)
                } else {
                    path_str.clone()
                }
            } else {
                path_str.clone()
            };

            let path = Path::new(&expanded);
            if path.exists() {
                match dotenvy::from_path(path) {
                    Ok(()) => {
                        tracing::info!("Loaded env file: {expanded}");
                    }
                    Err(e) => {
                        tracing::warn!("Failed to load env file {expanded}: {e}");
                    }
                }
            } else {
                tracing::debug!("Env file not found (skipped): {expanded}");
            }
        }
    }

    /// Expand ${VAR} and ${VAR:-default} patterns in URL and secret fields
    fn expand_env_vars(&mut self) {
        let Ok(re) = Regex::new(r"\$\{([A-Z_][A-Z0-9_]*)(?::-([^}]*))?\}") else {
            return;
        };

        for value in [
            &mut self.auth.backend_url,
            &mut self.firewall.url,
            &mut self.dynamic_ports.backend_url,
            &mut self.dynamic_ports.gateway_id,
            &mut self.dynamic_ports.cluster_id,
        ] {
            *value = Self::expand_string(&re, value);
        }
        for value in [&mut self.firewall.token, &mut self.metrics.token]
            .into_iter()
            .flatten()
        {
            *value = Self::expand_string(&re, value);
        }
        for dest in &mut self.mirror.destinations {
            *dest = Self::expand_string(&re, dest);
        }
    }

    /// Expand environment variables in a string
    fn expand_string(re: &Regex, value: &str) -> String {
        re.replace_all(value, |caps: &regex::Captures| {
            let var_name = &caps[1];
            let default = caps.get(2).map_or("", |m| m.as_str());
            env::var(var_name).unwrap_or_else(|_| default.to_string())
        })
        .into_owned()
    }
}

/// Custom humantime serde module for Duration
pub mod humantime_serde {
    use std::time::Duration;

    use serde::{self, Deserialize, Deserializer, Serializer};

    /// Serialize Duration to human-readable string (e.g., "30s")
    ///
    /// # Errors
    ///
    /// Returns a serialization error if the serializer fails.
    pub fn serialize<S>(duration: &Duration, serializer: S) -> Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        if duration.subsec_millis() != 0 && duration.as_secs() == 0 {
            serializer.serialize_str(&format!("{}ms", duration.as_millis()))
        } else {
            serializer.serialize_str(&format!("{}s", duration.as_secs()))
        }
    }

    /// Deserialize human-readable duration string (e.g., "30s", "5m", "1h", "100ms")
    ///
    /// # Errors
    ///
    /// Returns a deserialization error if the string cannot be parsed as a duration.
    pub fn deserialize<'de, D>(deserializer: D) -> Result<Duration, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;

        // "ms" must be checked before "s" and "m"
        if let Some(ms) = s.strip_suffix("ms") {
            ms.parse::<u64>()
                .map(Duration::from_millis)
                .map_err(serde::de::Error::custom)
        } else if let Some(secs) = s.strip_suffix('s') {
            secs.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        } else if let Some(mins) = s.strip_suffix('m') {
            mins.parse::<u64>()
                .map(|m| Duration::from_secs(m * 60))
                .map_err(serde::de::Error::custom)
        } else if let Some(hours) = s.strip_suffix('h') {
            hours
                .parse::<u64>()
                .map(|h| Duration::from_secs(h * 3600))
                .map_err(serde::de::Error::custom)
        } else {
            // Assume seconds
            s.parse::<u64>()
                .map(Duration::from_secs)
                .map_err(serde::de::Error::custom)
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    fn valid() -> Config {
        let mut config = Config::default();
        config.auth.backend_url = "https://manager.internal".to_string();
        config
    }

    #[test]
    fn test_load_env_files_sets_env_vars() {
        let dir = tempfile::tempdir().unwrap();
        let env_path = dir.path().join("test.env");
        let mut f = std::fs::File::create(&env_path).unwrap();
        writeln!(f, "HEADEND_TEST_KEY_A=hello_from_env_file").unwrap();
        drop(f);

        let config = Config {
            env_files: vec![env_path.to_string_lossy().to_string()],
            ..Default::default()
        };
        config.load_env_files();

        assert_eq!(env::var("HEADEND_TEST_KEY_A").unwrap(), "hello_from_env_file");
    }

    #[test]
    fn test_load_env_files_skips_missing() {
        let config = Config {
            env_files: vec!["/nonexistent/path/.env".to_string()],
            ..Default::default()
        };
        config.load_env_files();
    }

    #[test]
    fn test_yaml_sections_deserialize() {
        let yaml = r#"
server:
  http_port: 9443
  udp_response_timeout: 500ms
  mirror_body_limit: 4096
auth:
  mode: saml2
  backend_url: "https://manager.internal"
  key_refresh_interval: 2h
mirror:
  enabled: true
  destinations: ["10.0.0.5:4789"]
  protocol: erspan
  erspan_session_id: 7
dynamic_ports:
  tcp_ranges: "9000-9002"
"#;
        let config: Config = serde_yaml::from_str(yaml).unwrap();
        assert_eq!(config.server.http_port, 9443);
        assert_eq!(config.server.udp_response_timeout, Duration::from_millis(500));
        assert_eq!(config.server.mirror_body_limit, 4096);
        assert_eq!(config.auth.mode, AuthMode::Saml2);
        assert_eq!(config.auth.key_refresh_interval, Duration::from_secs(7200));
        assert_eq!(
            config.mirror.encapsulation(),
            Encapsulation::Erspan(ErspanParams { vlan: 0, session_id: 7 })
        );
        assert_eq!(config.dynamic_ports.tcp_ranges, "9000-9002");
        // untouched sections keep defaults
        assert_eq!(config.server.tcp_port, 8444);
    }

    #[test]
    fn test_load_from_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("headend.yaml");
        std::fs::write(&path, "auth:\n  backend_url: https://m.internal\nserver:\n  gateway_id: gw-7\n").unwrap();

        let config = Config::load(Some(&path)).unwrap();
        assert_eq!(config.auth.backend_url, "https://m.internal");
        assert_eq!(config.server.gateway_id, "gw-7");
    }

    #[test]
    fn test_load_missing_file_is_config_error() {
        let err = Config::load(Some(Path::new("/nonexistent/headend.yaml"))).unwrap_err();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn test_validate_requires_auth_backend() {
        assert!(matches!(Config::default().validate(), Err(Error::Config(_))));
        assert!(valid().validate().is_ok());
    }

    #[test]
    fn test_validate_mirror_and_firewall() {
        let mut config = valid();
        config.mirror.enabled = true;
        assert!(config.validate().is_err());
        config.mirror.destinations.push("127.0.0.1:4789".to_string());
        assert!(config.validate().is_ok());

        config.firewall.enabled = true;
        assert!(config.validate().is_err());
        config.firewall.url = "http://policy.internal".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_dynamic_ports() {
        let mut config = valid();
        config.dynamic_ports.enabled = true;
        config.dynamic_ports.backend_url = "https://m.internal".to_string();
        config.dynamic_ports.gateway_id = "gw-1".to_string();
        config.dynamic_ports.tcp_ranges = "9000-9002,9001".to_string();
        assert!(matches!(config.validate(), Err(Error::PortRange(_))));
        config.dynamic_ports.tcp_ranges = "9000-9002".to_string();
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_unknown_mirror_protocol_is_raw() {
        let config = MirrorConfig {
            protocol: "netflow".to_string(),
            ..Default::default()
        };
        assert_eq!(config.encapsulation(), Encapsulation::Raw);
    }

    #[test]
    fn test_env_secret_resolution() {
        let config = MetricsConfig {
            token: Some("literal".to_string()),
        };
        assert_eq!(config.resolve_token().as_deref(), Some("literal"));
        assert_eq!(MetricsConfig::default().resolve_token(), None);
    }
}
