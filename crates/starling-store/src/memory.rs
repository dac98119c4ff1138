//! In-memory reference backend.
//!
//! Implements [`Storage`] and [`Tally`] over `RwLock`ed maps. Used by every
//! test in the workspace and by single-node deployments that can afford to
//! lose events on restart.

use crate::storage::{
    EventStream, QueryOptions, ReqOptions, Storage, StorageError, StreamItem,
};
use crate::tally::{AuthorStat, EventStat, Tally};
use async_trait::async_trait;
use starling_common::{Event, Filter};
use std::collections::{HashMap, HashSet};
use tokio::sync::RwLock;

#[derive(Default)]
struct Counters {
    author_stats: HashMap<(String, AuthorStat), u64>,
    event_stats: HashMap<(String, EventStat), u64>,
    hashtag_uses: HashMap<String, u64>,
    relays: HashSet<String>,
}

/// Map-backed storage. Cheap to construct per test.
#[derive(Default)]
pub struct MemoryStorage {
    events: RwLock<HashMap<String, Event>>,
    counters: RwLock<Counters>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    /// Events matching any filter, newest first, per-filter limits applied.
    async fn select(&self, filters: &[Filter]) -> Vec<Event> {
        let events = self.events.read().await;
        let mut picked: Vec<&Event> = Vec::new();
        let mut seen: HashSet<&str> = HashSet::new();

        for filter in filters {
            let mut matched: Vec<&Event> =
                events.values().filter(|e| filter.matches(e)).collect();
            matched.sort_by(|a, b| {
                b.created_at
                    .cmp(&a.created_at)
                    .then_with(|| a.id.cmp(&b.id))
            });
            if let Some(limit) = filter.limit {
                matched.truncate(limit as usize);
            }
            for event in matched {
                if seen.insert(event.id.as_str()) {
                    picked.push(event);
                }
            }
        }

        picked.sort_by(|a, b| {
            b.created_at
                .cmp(&a.created_at)
                .then_with(|| a.id.cmp(&b.id))
        });
        picked.into_iter().cloned().collect()
    }

    /// Test accessor for an author counter.
    pub async fn author_stat(&self, pubkey: &str, stat: AuthorStat) -> u64 {
        self.counters
            .read()
            .await
            .author_stats
            .get(&(pubkey.to_string(), stat))
            .copied()
            .unwrap_or(0)
    }

    /// Test accessor for an event counter.
    pub async fn event_stat(&self, event_id: &str, stat: EventStat) -> u64 {
        self.counters
            .read()
            .await
            .event_stats
            .get(&(event_id.to_string(), stat))
            .copied()
            .unwrap_or(0)
    }

    /// Test accessor for hashtag usage.
    pub async fn hashtag_uses(&self, hashtag: &str) -> u64 {
        self.counters
            .read()
            .await
            .hashtag_uses
            .get(hashtag)
            .copied()
            .unwrap_or(0)
    }

    /// Test accessor for observed relay URLs.
    pub async fn known_relays(&self) -> Vec<String> {
        let mut relays: Vec<String> =
            self.counters.read().await.relays.iter().cloned().collect();
        relays.sort();
        relays
    }
}

#[async_trait]
impl Storage for MemoryStorage {
    async fn event(&self, event: &Event) -> Result<(), StorageError> {
        let mut events = self.events.write().await;
        if events.contains_key(&event.id) {
            return Ok(());
        }

        // Replaceable kinds keep only the newest per (pubkey, kind);
        // addressable kinds per (pubkey, kind, d-tag). An older arrival is
        // dropped outright.
        if event.is_replaceable() || event.is_addressable() {
            let d_tag = event.tag_value("d").map(str::to_owned);
            let same_slot = |old: &Event| {
                old.pubkey == event.pubkey
                    && old.kind == event.kind
                    && (!event.is_addressable()
                        || old.tag_value("d").map(str::to_owned) == d_tag)
            };
            if events
                .values()
                .any(|old| same_slot(old) && old.created_at > event.created_at)
            {
                return Ok(());
            }
            let superseded: Vec<String> = events
                .values()
                .filter(|old| same_slot(old))
                .map(|old| old.id.clone())
                .collect();
            for id in superseded {
                events.remove(&id);
            }
        }

        events.insert(event.id.clone(), event.clone());
        Ok(())
    }

    async fn query(
        &self,
        filters: &[Filter],
        _opts: QueryOptions,
    ) -> Result<Vec<Event>, StorageError> {
        Ok(self.select(filters).await)
    }

    async fn req(&self, filters: &[Filter], opts: ReqOptions) -> EventStream {
        let (tx, stream) = EventStream::channel(64);
        let matched = self.select(filters).await;

        tokio::spawn(async move {
            let produce = async {
                for event in matched {
                    if tx.send(Ok(StreamItem::Event(event))).await.is_err() {
                        return;
                    }
                }
                let _ = tx.send(Ok(StreamItem::EndOfStored)).await;
            };

            tokio::select! {
                _ = opts.cancel.cancelled() => {}
                result = tokio::time::timeout(opts.timeout, produce) => {
                    if result.is_err() {
                        let _ = tx.send(Err(StorageError::Timeout)).await;
                    }
                }
            }
        });

        stream
    }

    async fn count(&self, filters: &[Filter]) -> Result<u64, StorageError> {
        // Counts ignore per-filter limits; a limit caps replay, not totals.
        let events = self.events.read().await;
        let mut seen: HashSet<&str> = HashSet::new();
        for filter in filters {
            for event in events.values().filter(|e| filter.matches(e)) {
                seen.insert(event.id.as_str());
            }
        }
        Ok(seen.len() as u64)
    }

    async fn delete(&self, filters: &[Filter]) -> Result<u64, StorageError> {
        let doomed: Vec<String> = self
            .select(filters)
            .await
            .into_iter()
            .map(|e| e.id)
            .collect();
        let mut events = self.events.write().await;
        let mut removed = 0;
        for id in doomed {
            if events.remove(&id).is_some() {
                removed += 1;
            }
        }
        Ok(removed)
    }
}

#[async_trait]
impl Tally for MemoryStorage {
    async fn bump_author_stat(
        &self,
        pubkey: &str,
        stat: AuthorStat,
        delta: i64,
    ) -> Result<(), StorageError> {
        let mut counters = self.counters.write().await;
        let slot = counters
            .author_stats
            .entry((pubkey.to_string(), stat))
            .or_insert(0);
        *slot = slot.saturating_add_signed(delta);
        Ok(())
    }

    async fn set_author_stat(
        &self,
        pubkey: &str,
        stat: AuthorStat,
        value: u64,
    ) -> Result<(), StorageError> {
        self.counters
            .write()
            .await
            .author_stats
            .insert((pubkey.to_string(), stat), value);
        Ok(())
    }

    async fn bump_event_stat(
        &self,
        event_id: &str,
        stat: EventStat,
        delta: i64,
    ) -> Result<(), StorageError> {
        let mut counters = self.counters.write().await;
        let slot = counters
            .event_stats
            .entry((event_id.to_string(), stat))
            .or_insert(0);
        *slot = slot.saturating_add_signed(delta);
        Ok(())
    }

    async fn record_hashtag(&self, hashtag: &str, _seen_at: u64) -> Result<(), StorageError> {
        let mut counters = self.counters.write().await;
        *counters
            .hashtag_uses
            .entry(hashtag.to_ascii_lowercase())
            .or_insert(0) += 1;
        Ok(())
    }

    async fn record_relay(&self, url: &str) -> Result<(), StorageError> {
        self.counters.write().await.relays.insert(url.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;
    use tokio_util::sync::CancellationToken;

    fn event(id: &str, pubkey: &str, kind: u16, created_at: u64) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at,
            kind,
            tags: vec![],
            content: format!("content {id}"),
            sig: "sig".into(),
        }
    }

    #[tokio::test]
    async fn insert_is_idempotent() {
        let store = MemoryStorage::new();
        let e = event("e1", "pk", 1, 100);
        store.event(&e).await.unwrap();
        store.event(&e).await.unwrap();
        assert_eq!(store.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn query_orders_newest_first_and_limits() {
        let store = MemoryStorage::new();
        for i in 0..5 {
            store.event(&event(&format!("e{i}"), "pk", 1, 100 + i)).await.unwrap();
        }
        let got = store
            .query(&[Filter::new().kinds([1]).limit(2)], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(got.len(), 2);
        assert_eq!(got[0].created_at, 104);
        assert_eq!(got[1].created_at, 103);
    }

    #[tokio::test]
    async fn replaceable_kinds_keep_newest() {
        let store = MemoryStorage::new();
        store.event(&event("old", "pk", 10002, 100)).await.unwrap();
        store.event(&event("new", "pk", 10002, 200)).await.unwrap();
        let got = store
            .query(&[Filter::new().kinds([10002])], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(got.len(), 1);
        assert_eq!(got[0].id, "new");
    }

    #[tokio::test]
    async fn req_streams_events_then_end_of_stored() {
        let store = MemoryStorage::new();
        store.event(&event("e1", "pk", 1, 100)).await.unwrap();
        let mut stream = store
            .req(
                &[Filter::new().kinds([1]).limit(10)],
                ReqOptions {
                    timeout: Duration::from_secs(5),
                    cancel: CancellationToken::new(),
                },
            )
            .await;

        assert!(matches!(
            stream.next().await,
            Some(Ok(StreamItem::Event(_)))
        ));
        assert!(matches!(
            stream.next().await,
            Some(Ok(StreamItem::EndOfStored))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn cancelled_req_unwinds() {
        let store = MemoryStorage::new();
        store.event(&event("e1", "pk", 1, 100)).await.unwrap();
        let cancel = CancellationToken::new();
        cancel.cancel();
        let mut stream = store
            .req(
                &[Filter::new()],
                ReqOptions {
                    timeout: Duration::from_secs(5),
                    cancel,
                },
            )
            .await;
        // The producer may emit nothing at all once cancelled.
        while let Some(item) = stream.next().await {
            assert!(item.is_ok());
        }
    }

    #[tokio::test]
    async fn delete_removes_matching() {
        let store = MemoryStorage::new();
        store.event(&event("e1", "pk1", 1, 100)).await.unwrap();
        store.event(&event("e2", "pk2", 1, 100)).await.unwrap();
        let removed = store
            .delete(&[Filter::new().authors(["pk1"])])
            .await
            .unwrap();
        assert_eq!(removed, 1);
        assert_eq!(store.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn tallies_accumulate() {
        let store = MemoryStorage::new();
        store
            .bump_author_stat("pk", AuthorStat::Notes, 1)
            .await
            .unwrap();
        store
            .bump_author_stat("pk", AuthorStat::Notes, 1)
            .await
            .unwrap();
        assert_eq!(store.author_stat("pk", AuthorStat::Notes).await, 2);

        store.record_hashtag("Nostr", 100).await.unwrap();
        store.record_hashtag("nostr", 101).await.unwrap();
        assert_eq!(store.hashtag_uses("nostr").await, 2);

        store.record_relay("wss://r.example").await.unwrap();
        store.record_relay("wss://r.example").await.unwrap();
        assert_eq!(store.known_relays().await.len(), 1);
    }
}
