//! Shared helpers for integration tests
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use jsonwebtoken::{Algorithm, EncodingKey, Header};
use parking_lot::Mutex;
use serde_json::json;
use ztna_headend::audit::{AccessEntry, AuditLog};
use ztna_headend::auth::{JwtVerifier, User};
use ztna_headend::firewall::Firewall;
use ztna_headend::peer::StaticPeerRouter;
use ztna_headend::proxy::{ProxyEngine, ProxySettings};

pub const PRIVATE: &str = include_str!("../fixtures/rsa_private.pem");
pub const PUBLIC: &str = include_str!("../fixtures/rsa_public.pem");

pub const USER_ID: &str = "5d1e2f3a-0000-4000-8000-00000000beef";

/// Audit sink that keeps every entry
#[derive(Default)]
pub struct Recording(Mutex<Vec<AccessEntry>>);

impl Recording {
    pub fn entries(&self) -> Vec<AccessEntry> {
        self.0.lock().clone()
    }

    /// Wait until at least `n` entries were recorded
    pub async fn wait_for(&self, n: usize) -> Vec<AccessEntry> {
        tokio::time::timeout(Duration::from_secs(5), async {
            loop {
                let entries = self.entries();
                if entries.len() >= n {
                    return entries;
                }
                tokio::time::sleep(Duration::from_millis(10)).await;
            }
        })
        .await
        .expect("audit entries not recorded in time")
    }
}

impl AuditLog for Recording {
    fn record(&self, entry: AccessEntry) {
        self.0.lock().push(entry);
    }
}

/// Firewall that denies everything
pub struct DenyAll;

#[async_trait]
impl Firewall for DenyAll {
    async fn check_access(&self, _user: &User, _target: &str) -> bool {
        false
    }
}

fn mint(exp_offset: i64) -> String {
    let claims = json!({
        "sub": USER_ID,
        "type": "access",
        "role": "user",
        "name": "Dana",
        "exp": chrono::Utc::now().timestamp() + exp_offset,
    });
    let key = EncodingKey::from_rsa_pem(PRIVATE.as_bytes()).unwrap();
    jsonwebtoken::encode(&Header::new(Algorithm::RS256), &claims, &key).unwrap()
}

pub fn valid_token() -> String {
    mint(300)
}

pub fn expired_token() -> String {
    mint(-600)
}

pub fn settings() -> ProxySettings {
    ProxySettings {
        target_scheme: "http".to_string(),
        preamble_timeout: Duration::from_secs(2),
        udp_response_timeout: Duration::from_secs(2),
        ..Default::default()
    }
}

/// Engine with a pinned verification key, the given peers and audit sink
pub fn engine(audit: &Arc<Recording>, peers: &[(&str, String)]) -> ProxyEngine {
    let verifier = Arc::new(JwtVerifier::from_pem(PUBLIC.as_bytes(), "RS256").unwrap());
    let peers: HashMap<String, String> = peers
        .iter()
        .map(|(host, peer)| ((*host).to_string(), peer.clone()))
        .collect();
    ProxyEngine::new(verifier, settings())
        .with_audit(Arc::clone(audit) as Arc<dyn AuditLog>)
        .with_peers(Arc::new(StaticPeerRouter::new(peers)))
}
