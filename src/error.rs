//! Error types for the headend

use std::io;

use axum::http::StatusCode;
use headend_wire::{PortProtocol, PortRangeError, PreambleError};
use thiserror::Error;

use crate::auth::AuthError;

/// Result type alias for the headend
pub type Result<T> = std::result::Result<T, Error>;

/// Headend errors
#[derive(Error, Debug)]
pub enum Error {
    /// Configuration error (fatal at startup)
    #[error("Configuration error: {0}")]
    Config(String),

    /// Token missing, malformed, expired or not verifiable
    #[error("Authentication failed: {0}")]
    Authentication(#[from] AuthError),

    /// Firewall collaborator denied the user access to the target
    #[error("Access to {target} denied for user {user_id}")]
    Authorization {
        /// User that was denied
        user_id: String,
        /// Requested target
        target: String,
    },

    /// Dial/connect to the target failed
    #[error("Upstream unavailable: {target}: {reason}")]
    UpstreamUnavailable {
        /// Target that could not be reached
        target: String,
        /// Underlying failure
        reason: String,
    },

    /// Mirror destination write failed (never surfaced to the relay path)
    #[error("Mirror delivery failed to {destination}: {reason}")]
    MirrorDelivery {
        /// Destination address
        destination: String,
        /// Underlying failure
        reason: String,
    },

    /// A single port could not be bound
    #[error("Failed to bind {protocol} port {port}: {source}")]
    ListenerBind {
        /// Listener protocol
        protocol: PortProtocol,
        /// Port that failed
        port: u16,
        /// Bind error
        #[source]
        source: io::Error,
    },

    /// Port-range expression rejected
    #[error("Invalid port ranges: {0}")]
    PortRange(#[from] PortRangeError),

    /// Stream/datagram preamble rejected
    #[error("Invalid preamble: {0}")]
    Framing(#[from] PreambleError),

    /// Request is missing the target-host designator
    #[error("Missing target host header")]
    MissingTarget,

    /// Target-host designator is not a plain `host[:port]`
    #[error("Invalid target host: {0}")]
    InvalidTarget(String),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] io::Error),

    /// JSON error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    /// Server shutdown
    #[error("Server shutdown")]
    Shutdown,

    /// Internal error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl Error {
    /// HTTP status for errors surfaced on the proxied HTTP path
    #[must_use]
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::Authentication(_) => StatusCode::UNAUTHORIZED,
            Self::Authorization { .. } => StatusCode::FORBIDDEN,
            Self::MissingTarget | Self::InvalidTarget(_) | Self::Framing(_) | Self::PortRange(_) => StatusCode::BAD_REQUEST,
            Self::UpstreamUnavailable { .. } | Self::Http(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// Short reason recorded in audit entries
    #[must_use]
    pub fn audit_reason(&self) -> String {
        match self {
            Self::Authentication(e) => format!("authentication failed: {e}"),
            Self::Authorization { .. } => "denied by firewall policy".to_string(),
            Self::UpstreamUnavailable { reason, .. } => format!("upstream unavailable: {reason}"),
            Self::Framing(e) => format!("invalid preamble: {e}"),
            other => other.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn maps_to_http_status() {
        assert_eq!(
            Error::Authentication(AuthError::InvalidToken("bad".into())).status_code(),
            StatusCode::UNAUTHORIZED
        );
        assert_eq!(
            Error::Authorization {
                user_id: "u".into(),
                target: "t".into()
            }
            .status_code(),
            StatusCode::FORBIDDEN
        );
        assert_eq!(Error::MissingTarget.status_code(), StatusCode::BAD_REQUEST);
        assert_eq!(
            Error::UpstreamUnavailable {
                target: "t".into(),
                reason: "refused".into()
            }
            .status_code(),
            StatusCode::BAD_GATEWAY
        );
    }

    #[test]
    fn audit_reasons_distinguish_authn_and_authz() {
        let authn = Error::Authentication(AuthError::Expired).audit_reason();
        let authz = Error::Authorization {
            user_id: "u".into(),
            target: "t".into(),
        }
        .audit_reason();
        assert!(authn.starts_with("authentication failed"));
        assert_eq!(authz, "denied by firewall policy");
    }
}
