//! Relay-list events (NIP-65).
//!
//! A kind-10002 event advertises where its author writes and reads:
//! `["r", url]` counts for both directions, `["r", url, "read"]` and
//! `["r", url, "write"]` for one. Malformed or non-secure URLs are
//! discarded during parsing and never propagate further.

use starling_common::Event;
use starling_common::event::KIND_RELAY_LIST;

/// An identity's advertised relay set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RelayList {
    pub pubkey: String,
    pub created_at: u64,
    /// Relays the identity reads from, normalized, in tag order.
    pub read: Vec<String>,
    /// Relays the identity writes to, normalized, in tag order.
    pub write: Vec<String>,
}

impl RelayList {
    /// Parse a relay-list event. Returns `None` for other kinds.
    pub fn from_event(event: &Event) -> Option<Self> {
        if event.kind != KIND_RELAY_LIST {
            return None;
        }

        let mut list = RelayList {
            pubkey: event.pubkey.clone(),
            created_at: event.created_at,
            ..Default::default()
        };

        for tag in &event.tags {
            if tag.len() < 2 || tag[0] != "r" {
                continue;
            }
            let Some(url) = normalize_relay_url(&tag[1]) else {
                continue;
            };
            match tag.get(2).map(String::as_str) {
                Some("read") => push_unique(&mut list.read, url),
                Some("write") => push_unique(&mut list.write, url),
                // No marker (or an unknown one): both directions.
                _ => {
                    push_unique(&mut list.read, url.clone());
                    push_unique(&mut list.write, url);
                }
            }
        }

        Some(list)
    }

    /// The newest list authored by `pubkey` among candidate events. An
    /// identity's own list always beats any fallback.
    pub fn best_for(pubkey: &str, events: &[Event]) -> Option<Self> {
        events
            .iter()
            .filter(|e| e.pubkey == pubkey)
            .max_by_key(|e| e.created_at)
            .and_then(Self::from_event)
    }

    /// Build an operator fallback list; every URL counts for both
    /// directions.
    pub fn fallback(urls: &[String]) -> Self {
        let mut list = RelayList::default();
        for url in urls {
            if let Some(url) = normalize_relay_url(url) {
                push_unique(&mut list.read, url.clone());
                push_unique(&mut list.write, url);
            }
        }
        list
    }

    pub fn is_empty(&self) -> bool {
        self.read.is_empty() && self.write.is_empty()
    }
}

fn push_unique(urls: &mut Vec<String>, url: String) {
    if !urls.contains(&url) {
        urls.push(url);
    }
}

/// Parse and normalize a relay URL; only secure websockets survive.
pub fn normalize_relay_url(input: &str) -> Option<String> {
    let url = url::Url::parse(input.trim()).ok()?;
    if url.scheme() != "wss" || url.host_str().is_none() {
        return None;
    }
    Some(url.to_string())
}
