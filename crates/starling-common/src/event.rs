//! The Nostr event model.
//!
//! Events are immutable once constructed; identity is the lowercase-hex
//! sha256 of the canonical serialization. "Deletion" is a new event (kind 5)
//! referencing old ids, never a mutation.

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

/// Kind of a plain text note.
pub const KIND_NOTE: u16 = 1;
/// Kind of a follow list (NIP-02).
pub const KIND_FOLLOWS: u16 = 3;
/// Kind of a deletion request (NIP-09).
pub const KIND_DELETION: u16 = 5;
/// Kind of a repost (NIP-18).
pub const KIND_REPOST: u16 = 6;
/// Kind of a reaction (NIP-25).
pub const KIND_REACTION: u16 = 7;
/// Kind of a relay list (NIP-65).
pub const KIND_RELAY_LIST: u16 = 10002;

/// A signed, content-addressed record submitted to a relay.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Event {
    /// Lowercase hex sha256 of the canonical serialization.
    pub id: String,
    /// Author public key, lowercase hex.
    pub pubkey: String,
    /// Unix timestamp (seconds) claimed by the author.
    pub created_at: u64,
    /// Event kind.
    pub kind: u16,
    /// Ordered tag list; each tag is an ordered list of strings.
    pub tags: Vec<Vec<String>>,
    /// Arbitrary content, interpretation depends on kind.
    pub content: String,
    /// Schnorr signature over the id, lowercase hex.
    pub sig: String,
}

impl Event {
    /// Compute the content hash this event's `id` must equal:
    /// sha256 over the canonical array `[0, pubkey, created_at, kind, tags, content]`.
    pub fn compute_id(&self) -> String {
        let canonical = serde_json::json!([
            0,
            self.pubkey,
            self.created_at,
            self.kind,
            self.tags,
            self.content,
        ]);
        // Serializing a Value built from owned data cannot fail.
        let bytes = serde_json::to_vec(&canonical).unwrap_or_default();
        hex::encode(Sha256::digest(&bytes))
    }

    /// Ephemeral kinds (20000..30000) are relayed live but never stored.
    pub fn is_ephemeral(&self) -> bool {
        (20000..30000).contains(&self.kind)
    }

    /// Replaceable kinds keep only the newest event per (pubkey, kind).
    pub fn is_replaceable(&self) -> bool {
        self.kind == 0 || self.kind == 3 || (10000..20000).contains(&self.kind)
    }

    /// Addressable kinds keep the newest per (pubkey, kind, d-tag).
    pub fn is_addressable(&self) -> bool {
        (30000..40000).contains(&self.kind)
    }

    /// First value of the first tag named `name`, if any.
    pub fn tag_value(&self, name: &str) -> Option<&str> {
        self.tags
            .iter()
            .find(|t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// All first values across tags named `name`, in tag order.
    pub fn tag_values<'a>(&'a self, name: &'a str) -> impl Iterator<Item = &'a str> + 'a {
        self.tags
            .iter()
            .filter(move |t| t.len() >= 2 && t[0] == name)
            .map(|t| t[1].as_str())
    }

    /// Age of the event in seconds relative to `now`; zero for future-dated
    /// events.
    pub fn age_secs(&self, now: u64) -> u64 {
        now.saturating_sub(self.created_at)
    }
}
