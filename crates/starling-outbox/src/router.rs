//! Routing decisions.
//!
//! Subscription routing buckets each requested author under a handful of
//! their write relays and splits the filter set so a relay is only asked
//! about the authors routed to it. Publish routing resolves the author's
//! write set, drops our own relay, and caps the fan-out. Routes are
//! ephemeral; nothing here is persisted.

use crate::relay_list::{RelayList, normalize_relay_url};
use starling_common::event::KIND_RELAY_LIST;
use starling_common::{Event, Filter};
use starling_store::{QueryOptions, Storage, StorageError};
use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::Arc;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum OutboxError {
    #[error(transparent)]
    Storage(#[from] StorageError),
}

/// Tunables owned by the application context.
#[derive(Debug, Clone)]
pub struct RouterConfig {
    /// Write relays considered per author when routing subscriptions.
    pub max_subscribe_relays: usize,
    /// Relays targeted per event when routing publishes.
    pub max_publish_relays: usize,
    /// Our own public URL, excluded from publish targets.
    pub self_url: Option<String>,
    /// Operator relay list used when an identity has none.
    pub fallback_relays: Vec<String>,
}

/// Resolves relay subsets for subscribe and publish fan-out.
pub struct OutboxRouter {
    storage: Arc<dyn Storage>,
    fallback: RelayList,
    self_url: Option<String>,
    max_subscribe_relays: usize,
    max_publish_relays: usize,
}

impl OutboxRouter {
    pub fn new(storage: Arc<dyn Storage>, cfg: RouterConfig) -> Self {
        Self {
            storage,
            fallback: RelayList::fallback(&cfg.fallback_relays),
            self_url: cfg.self_url.as_deref().and_then(normalize_relay_url),
            max_subscribe_relays: cfg.max_subscribe_relays.max(1),
            max_publish_relays: cfg.max_publish_relays.max(1),
        }
    }

    /// Resolve relay lists for a set of identities in one storage query.
    /// Identities without a list of their own get the operator fallback.
    async fn relay_lists(
        &self,
        pubkeys: &HashSet<String>,
    ) -> Result<HashMap<String, RelayList>, OutboxError> {
        let mut lists = HashMap::new();
        if pubkeys.is_empty() {
            return Ok(lists);
        }

        let events: Vec<Event> = self
            .storage
            .query(
                &[Filter::new()
                    .kinds([KIND_RELAY_LIST])
                    .authors(pubkeys.iter().cloned())],
                QueryOptions::default(),
            )
            .await?;

        for pubkey in pubkeys {
            let list = RelayList::best_for(pubkey, &events)
                .filter(|l| !l.is_empty())
                .unwrap_or_else(|| self.fallback.clone());
            lists.insert(pubkey.clone(), list);
        }
        Ok(lists)
    }

    /// Map each relay to the filters it should be asked, per the outbox
    /// model. The caller opens one subscription per relay and merges the
    /// results.
    pub async fn route_subscription(
        &self,
        filters: &[Filter],
        viewer: Option<&str>,
    ) -> Result<HashMap<String, Vec<Filter>>, OutboxError> {
        let mut wanted: HashSet<String> = filters
            .iter()
            .flat_map(|f| f.authors.iter().flatten().cloned())
            .collect();
        if let Some(viewer) = viewer {
            wanted.insert(viewer.to_string());
        }
        let lists = self.relay_lists(&wanted).await?;

        let mut routes: HashMap<String, Vec<Filter>> = HashMap::new();

        for filter in filters {
            match &filter.authors {
                Some(authors) => {
                    // Bucket authors under their write relays so a relay is
                    // never queried for an author it wasn't chosen for.
                    // BTreeMap keeps route emission deterministic.
                    let mut buckets: BTreeMap<String, Vec<String>> = BTreeMap::new();
                    for author in authors {
                        let Some(list) = lists.get(author) else {
                            continue;
                        };
                        for relay in list.write.iter().take(self.max_subscribe_relays) {
                            buckets.entry(relay.clone()).or_default().push(author.clone());
                        }
                    }
                    for (relay, routed_authors) in buckets {
                        let mut split = filter.clone();
                        split.authors = Some(routed_authors);
                        routes.entry(relay).or_default().push(split);
                    }
                }
                None => {
                    // No author constraint: ask the viewer's own read set.
                    let read_relays = viewer
                        .and_then(|v| lists.get(v))
                        .map(|l| l.read.clone())
                        .unwrap_or_else(|| self.fallback.read.clone());
                    for relay in read_relays {
                        routes.entry(relay).or_default().push(filter.clone());
                    }
                }
            }
        }

        Ok(routes)
    }

    /// Relays to publish this author's event to: their write set (or the
    /// fallback), minus ourselves, capped.
    pub async fn route_publish(&self, event: &Event) -> Result<Vec<String>, OutboxError> {
        let mut wanted = HashSet::new();
        wanted.insert(event.pubkey.clone());
        let lists = self.relay_lists(&wanted).await?;

        let write = lists
            .get(&event.pubkey)
            .map(|l| l.write.clone())
            .unwrap_or_default();

        Ok(write
            .into_iter()
            .filter(|relay| Some(relay) != self.self_url.as_ref())
            .take(self.max_publish_relays)
            .collect())
    }
}
