//! ZTNA Headend Library
//!
//! Traffic-termination gateway for a zero-trust access platform: every HTTP
//! request, TCP stream and UDP datagram is authenticated, authorized and
//! relayed to its internal target.
//!
//! # Features
//!
//! - **Auth Verifier**: bearer JWT verification against a refreshed public key
//! - **Proxy Engine**: header-routed HTTP proxy plus preamble-framed TCP/UDP relays
//! - **Mirror Engine**: VXLAN, GRE and ERSPAN copies of relayed traffic, with an
//!   optional EVE JSON feed for IDS collectors
//! - **Dynamic Ports**: TCP/UDP listener sets reconfigured from the backend at runtime
//! - **Production Ready**: audit log, Prometheus metrics, graceful shutdown

#![forbid(unsafe_code)]
#![warn(missing_docs)]

pub mod audit;
pub mod auth;
pub mod cli;
pub mod config;
pub mod error;
pub mod firewall;
pub mod gateway;
pub mod mirror;
pub mod peer;
pub mod ports;
pub mod proxy;

pub use error::{Error, Result};

use tracing_subscriber::{EnvFilter, fmt, layer::SubscriberExt, util::SubscriberInitExt};

/// Setup tracing/logging
pub fn setup_tracing(level: &str, format: Option<&str>) -> Result<()> {
    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(level));

    let subscriber = tracing_subscriber::registry().with(filter);

    let installed = match format {
        Some("json") => subscriber.with(fmt::layer().json()).try_init(),
        _ => subscriber.with(fmt::layer()).try_init(),
    };
    installed.map_err(|e| Error::Internal(format!("tracing already initialized: {e}")))
}
