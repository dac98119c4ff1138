//! Relay information document (NIP-11).
//!
//! Served on the relay route when a plain HTTP client asks for
//! `application/nostr+json` instead of upgrading the connection.

use serde::Serialize;
use starling_common::config::AppConfig;

#[derive(Debug, Clone, Serialize)]
pub struct RelayInfo {
    pub name: String,
    pub description: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pubkey: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub contact: Option<String>,
    pub supported_nips: Vec<u16>,
    pub software: String,
    pub version: String,
    pub limitation: Limitation,
}

#[derive(Debug, Clone, Serialize)]
pub struct Limitation {
    pub max_subscriptions: usize,
    pub max_limit: u64,
    pub auth_required: bool,
    pub payment_required: bool,
}

impl RelayInfo {
    pub fn from_config(config: &AppConfig) -> Self {
        let optional = |s: &str| (!s.is_empty()).then(|| s.to_string());
        Self {
            name: config.server.name.clone(),
            description: config.server.description.clone(),
            pubkey: optional(&config.server.pubkey),
            contact: optional(&config.server.contact),
            supported_nips: vec![1, 2, 9, 11, 25, 45, 50, 65],
            software: "https://github.com/starling-relay/starling".to_string(),
            version: env!("CARGO_PKG_VERSION").to_string(),
            limitation: Limitation {
                max_subscriptions: config.limits.max_subscriptions,
                max_limit: config.limits.max_filter_limit,
                auth_required: false,
                payment_required: false,
            },
        }
    }
}
