//! Fire-and-forget counters backed by durable storage.
//!
//! All operations are upsert/increment and must tolerate concurrent
//! writers; the pipeline calls them as isolated side effects and only logs
//! failures.

use async_trait::async_trait;

use crate::storage::StorageError;

/// Per-author statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AuthorStat {
    Notes,
    Followers,
    Following,
}

/// Per-event statistics.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EventStat {
    Replies,
    Reposts,
    Reactions,
}

#[async_trait]
pub trait Tally: Send + Sync {
    /// Adjust an author counter by a signed delta (floored at zero).
    async fn bump_author_stat(
        &self,
        pubkey: &str,
        stat: AuthorStat,
        delta: i64,
    ) -> Result<(), StorageError>;

    /// Overwrite an author counter with an absolute value (follow lists are
    /// absolute, not incremental).
    async fn set_author_stat(
        &self,
        pubkey: &str,
        stat: AuthorStat,
        value: u64,
    ) -> Result<(), StorageError>;

    /// Adjust an event counter by a signed delta (floored at zero).
    async fn bump_event_stat(
        &self,
        event_id: &str,
        stat: EventStat,
        delta: i64,
    ) -> Result<(), StorageError>;

    /// Record one use of a hashtag for trend aggregation.
    async fn record_hashtag(&self, hashtag: &str, seen_at: u64) -> Result<(), StorageError>;

    /// Record a relay URL observed in the wild for the outbox routing table.
    async fn record_relay(&self, url: &str) -> Result<(), StorageError>;
}
