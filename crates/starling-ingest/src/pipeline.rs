//! The event-ingestion pipeline.
//!
//! Every inbound event passes through here exactly once, whatever its
//! origin: relay socket, authenticated REST write, or firehose. Order of
//! operations: dedupe → policy → eligibility → deletion check → durable
//! write → side effects. Side effects are isolated per effect and can never
//! change the ingestion verdict.

use crate::eligibility::{Eligibility, EligibilityPolicy};
use crate::pubsub::PubSub;
use starling_common::error::{Reject, RelayError};
use starling_common::event::{
    KIND_DELETION, KIND_FOLLOWS, KIND_NOTE, KIND_REACTION, KIND_RELAY_LIST, KIND_REPOST,
};
use starling_common::config::PipelineConfig;
use starling_common::metrics::{SharedMetrics, names};
use starling_common::{Event, Filter};
use starling_store::policy::Policy;
use starling_store::tally::{AuthorStat, EventStat, Tally};
use starling_store::{QueryOptions, Storage, StorageError};
use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;

/// Per-invocation options.
#[derive(Debug, Clone, Default)]
pub struct IngestOptions {
    /// Deadline for the whole invocation. Relay connections leave this
    /// unset; REST and firehose callers bound it (≈1s) so a slow side
    /// effect cannot stall them.
    pub timeout: Option<Duration>,
}

/// Outcome of one dedupe-cache claim.
enum Claim {
    /// The id completed earlier within the tracked window.
    Cached(Result<(), Reject>),
    /// Another task is processing this id right now.
    InFlight,
    /// Ours to process.
    Claimed,
}

/// Bounded recency cache of event ids and their verdicts.
struct DedupeCache {
    capacity: usize,
    order: VecDeque<String>,
    verdicts: HashMap<String, Result<(), Reject>>,
    in_flight: HashSet<String>,
}

impl DedupeCache {
    fn new(capacity: usize) -> Self {
        Self {
            capacity: capacity.max(1),
            order: VecDeque::new(),
            verdicts: HashMap::new(),
            in_flight: HashSet::new(),
        }
    }

    fn claim(&mut self, id: &str) -> Claim {
        if let Some(verdict) = self.verdicts.get(id) {
            return Claim::Cached(verdict.clone());
        }
        if !self.in_flight.insert(id.to_string()) {
            return Claim::InFlight;
        }
        Claim::Claimed
    }

    /// Record the final verdict, or just release the claim when the outcome
    /// was an unclassified error (those may be retried).
    fn settle(&mut self, id: &str, verdict: Option<Result<(), Reject>>) {
        self.in_flight.remove(id);
        let Some(verdict) = verdict else { return };
        if self.verdicts.insert(id.to_string(), verdict).is_none() {
            self.order.push_back(id.to_string());
            while self.order.len() > self.capacity {
                if let Some(evicted) = self.order.pop_front() {
                    self.verdicts.remove(&evicted);
                }
            }
        }
    }
}

/// Closed discriminator over the kinds the pipeline treats specially.
/// Adding a kind means adding a variant and a table entry, nothing else.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum KindHandler {
    Note,
    Follows,
    Deletion,
    Repost,
    Reaction,
    RelayList,
}

/// The single ingestion gate.
pub struct Pipeline {
    storage: Arc<dyn Storage>,
    tally: Arc<dyn Tally>,
    policy: Arc<dyn Policy>,
    eligibility: Arc<dyn EligibilityPolicy>,
    pubsub: Arc<PubSub>,
    outbox_tx: Option<mpsc::Sender<Event>>,
    metrics: SharedMetrics,
    dedupe: Mutex<DedupeCache>,
    /// Kind dispatch table, built once at construction. New kinds are
    /// additive entries here.
    handlers: HashMap<u16, KindHandler>,
    fresh_max_age_secs: u64,
    local_authors: HashSet<String>,
}

impl Pipeline {
    pub fn new(
        storage: Arc<dyn Storage>,
        tally: Arc<dyn Tally>,
        policy: Arc<dyn Policy>,
        eligibility: Arc<dyn EligibilityPolicy>,
        pubsub: Arc<PubSub>,
        metrics: SharedMetrics,
        cfg: &PipelineConfig,
    ) -> Self {
        Self {
            storage,
            tally,
            policy,
            eligibility,
            pubsub,
            outbox_tx: None,
            metrics,
            dedupe: Mutex::new(DedupeCache::new(cfg.dedupe_cache_size)),
            handlers: Self::build_handlers(),
            fresh_max_age_secs: cfg.fresh_event_max_age_secs,
            local_authors: cfg.local_pubkeys.iter().cloned().collect(),
        }
    }

    /// Attach the outbox broadcast channel; fresh events from local authors
    /// are queued onto it.
    pub fn with_outbox(mut self, tx: mpsc::Sender<Event>) -> Self {
        self.outbox_tx = Some(tx);
        self
    }

    fn build_handlers() -> HashMap<u16, KindHandler> {
        HashMap::from([
            (KIND_NOTE, KindHandler::Note),
            (KIND_FOLLOWS, KindHandler::Follows),
            (KIND_DELETION, KindHandler::Deletion),
            (KIND_REPOST, KindHandler::Repost),
            (KIND_REACTION, KindHandler::Reaction),
            (KIND_RELAY_LIST, KindHandler::RelayList),
        ])
    }

    async fn dispatch(&self, handler: KindHandler, event: &Event) -> anyhow::Result<()> {
        match handler {
            KindHandler::Note => self.on_note(event).await,
            KindHandler::Follows => self.on_follows(event).await,
            KindHandler::Deletion => self.on_deletion(event).await,
            KindHandler::Repost => self.on_repost(event).await,
            KindHandler::Reaction => self.on_reaction(event).await,
            KindHandler::RelayList => self.on_relay_list(event).await,
        }
    }

    /// The single entry point offered to every caller. Shape validation is
    /// the caller's duty; events reaching here parsed cleanly.
    pub async fn handle_event(
        &self,
        event: Event,
        opts: IngestOptions,
    ) -> Result<(), RelayError> {
        match opts.timeout {
            Some(deadline) => tokio::time::timeout(deadline, self.ingest(event))
                .await
                .map_err(|_| RelayError::Timeout)?,
            None => self.ingest(event).await,
        }
    }

    async fn ingest(&self, event: Event) -> Result<(), RelayError> {
        let id = event.id.clone();

        match self.dedupe.lock().expect("dedupe poisoned").claim(&id) {
            Claim::Cached(verdict) => {
                return verdict.map_err(RelayError::Reject);
            }
            Claim::InFlight => {
                return Err(Reject::duplicate("event is already being processed").into());
            }
            Claim::Claimed => {}
        }

        // The guard releases the in-flight claim even if this future is
        // dropped by a caller's deadline mid-processing.
        let guard = ClaimGuard {
            dedupe: &self.dedupe,
            id: id.clone(),
            armed: true,
        };

        let outcome = self.process(&event).await;

        let settled = match &outcome {
            Ok(()) => Some(Ok(())),
            Err(RelayError::Reject(reject)) => Some(Err(reject.clone())),
            // Unclassified failures are not cached; a retry may succeed.
            Err(_) => None,
        };
        guard.finish(settled);

        match &outcome {
            Ok(()) => self.metrics.counter(names::EVENTS_ACCEPTED, 1),
            Err(_) => self.metrics.counter(names::EVENTS_REJECTED, 1),
        }
        outcome
    }

    async fn process(&self, event: &Event) -> Result<(), RelayError> {
        let verdict = self.policy.call(event).await.map_err(|e| {
            tracing::error!(event = %event.id, error = %e, "policy evaluation failed");
            RelayError::Unknown(anyhow::anyhow!("policy unavailable"))
        })?;

        if !verdict.allowed {
            let reason = if verdict.reason.is_empty() {
                "rejected by relay policy".to_string()
            } else {
                verdict.reason.clone()
            };
            return Err(Reject::blocked(reason).into());
        }

        let shared = Arc::new(event.clone());

        // Ephemeral kinds never touch storage; they only ride the live bus.
        if event.is_ephemeral() {
            self.fan_out_live(&shared);
            return Ok(());
        }

        match self
            .eligibility
            .check(event, &verdict, self.storage.as_ref())
            .await
            .map_err(map_storage)?
        {
            Eligibility::Eligible => {}
            Eligibility::Ineligible(reason) => {
                return Err(Reject::blocked(reason).into());
            }
        }

        if self.already_deleted(event).await? {
            return Err(Reject::blocked("event was deleted").into());
        }

        self.storage.event(event).await.map_err(map_storage)?;

        self.side_effects(&shared).await;

        Ok(())
    }

    /// A deletion by the same author that names this id revokes it.
    async fn already_deleted(&self, event: &Event) -> Result<bool, RelayError> {
        let filter = Filter::new()
            .kinds([KIND_DELETION])
            .authors([event.pubkey.clone()])
            .tag("e", [event.id.clone()])
            .limit(1);
        let found = self
            .storage
            .query(&[filter], QueryOptions::default())
            .await
            .map_err(map_storage)?;
        Ok(!found.is_empty())
    }

    /// Fire-and-forget work after the durable write. Effects run
    /// concurrently, each caught and logged on its own; none escalates.
    async fn side_effects(&self, event: &Arc<Event>) {
        let dispatch = async {
            if let Some(handler) = self.handlers.get(&event.kind).copied() {
                if let Err(e) = self.dispatch(handler, event).await {
                    tracing::warn!(event = %event.id, kind = event.kind, error = %e, "kind handler failed");
                }
            }
        };

        let hashtags = async {
            for hashtag in event.tag_values("t") {
                if let Err(e) = self.tally.record_hashtag(hashtag, event.created_at).await {
                    tracing::warn!(event = %event.id, error = %e, "hashtag tracking failed");
                }
            }
        };

        let relay_hints = async {
            for url in relay_hints(event) {
                if let Err(e) = self.tally.record_relay(&url).await {
                    tracing::warn!(event = %event.id, error = %e, "relay tracking failed");
                }
            }
        };

        let live = async {
            self.fan_out_live(event);
        };

        tokio::join!(dispatch, hashtags, relay_hints, live);
    }

    /// Publish to the in-process bus and, for local authors, queue for the
    /// outbox broadcast. Backfill (stale events) stays off the live path.
    fn fan_out_live(&self, event: &Arc<Event>) {
        let now = chrono::Utc::now().timestamp().max(0) as u64;
        if event.age_secs(now) > self.fresh_max_age_secs {
            return;
        }

        self.pubsub.publish(event);

        if self.local_authors.contains(&event.pubkey) {
            if let Some(tx) = &self.outbox_tx {
                if tx.try_send((**event).clone()).is_err() {
                    tracing::warn!(event = %event.id, "outbox queue full, broadcast dropped");
                }
            }
        }
    }

    // ── Kind handlers ────────────────────────────────────────────────────

    async fn on_note(&self, event: &Event) -> anyhow::Result<()> {
        self.tally
            .bump_author_stat(&event.pubkey, AuthorStat::Notes, 1)
            .await?;
        // A note replying to another bumps that event's reply count.
        if let Some(parent) = event.tag_value("e") {
            self.tally
                .bump_event_stat(parent, EventStat::Replies, 1)
                .await?;
        }
        Ok(())
    }

    async fn on_follows(&self, event: &Event) -> anyhow::Result<()> {
        let following = event.tag_values("p").count() as u64;
        self.tally
            .set_author_stat(&event.pubkey, AuthorStat::Following, following)
            .await?;
        Ok(())
    }

    async fn on_repost(&self, event: &Event) -> anyhow::Result<()> {
        if let Some(reposted) = event.tag_value("e") {
            self.tally
                .bump_event_stat(reposted, EventStat::Reposts, 1)
                .await?;
        }
        Ok(())
    }

    async fn on_reaction(&self, event: &Event) -> anyhow::Result<()> {
        // NIP-25: the reacted-to event is the last e tag.
        if let Some(reacted) = event.tag_values("e").last() {
            self.tally
                .bump_event_stat(reacted, EventStat::Reactions, 1)
                .await?;
        }
        Ok(())
    }

    async fn on_relay_list(&self, event: &Event) -> anyhow::Result<()> {
        for url in event.tag_values("r") {
            if is_secure_relay_url(url) {
                self.tally.record_relay(url).await?;
            }
        }
        Ok(())
    }

    /// Resolve the ids a deletion names, verify authorship, erase matches.
    async fn on_deletion(&self, event: &Event) -> anyhow::Result<()> {
        let named: Vec<String> = event.tag_values("e").map(str::to_owned).collect();
        if named.is_empty() {
            return Ok(());
        }

        let targets = self
            .storage
            .query(
                &[Filter::new().ids(named)],
                QueryOptions::default(),
            )
            .await?;

        let owned: Vec<String> = targets
            .into_iter()
            .filter(|t| t.pubkey == event.pubkey)
            .map(|t| t.id)
            .collect();

        if owned.is_empty() {
            return Ok(());
        }

        let erased = self.storage.delete(&[Filter::new().ids(owned)]).await?;
        tracing::debug!(event = %event.id, erased, "processed deletion");
        Ok(())
    }
}

struct ClaimGuard<'a> {
    dedupe: &'a Mutex<DedupeCache>,
    id: String,
    armed: bool,
}

impl ClaimGuard<'_> {
    fn finish(mut self, verdict: Option<Result<(), Reject>>) {
        self.dedupe
            .lock()
            .expect("dedupe poisoned")
            .settle(&self.id, verdict);
        self.armed = false;
    }
}

impl Drop for ClaimGuard<'_> {
    fn drop(&mut self) {
        if self.armed {
            if let Ok(mut cache) = self.dedupe.lock() {
                cache.settle(&self.id, None);
            }
        }
    }
}

/// Relay URLs hinted in tag position three (`["e", id, url]` and friends).
/// Only secure websocket URLs are worth recording.
fn relay_hints(event: &Event) -> Vec<String> {
    let mut urls: Vec<String> = event
        .tags
        .iter()
        .filter(|t| t.len() >= 3)
        .map(|t| t[2].as_str())
        .filter(|u| is_secure_relay_url(u))
        .map(str::to_owned)
        .collect();
    if event.kind == KIND_RELAY_LIST {
        urls.extend(
            event
                .tag_values("r")
                .filter(|u| is_secure_relay_url(u))
                .map(str::to_owned),
        );
    }
    urls.sort();
    urls.dedup();
    urls
}

/// True for well-formed `wss://` URLs; anything else is silently dropped.
pub fn is_secure_relay_url(input: &str) -> bool {
    match url::Url::parse(input) {
        Ok(url) => url.scheme() == "wss" && url.host_str().is_some(),
        Err(_) => false,
    }
}

fn map_storage(e: StorageError) -> RelayError {
    match e {
        StorageError::Timeout => RelayError::Timeout,
        StorageError::Rejected(reason) => RelayError::Reject(Reject::Blocked(reason)),
        StorageError::Backend(msg) => RelayError::Unknown(anyhow::anyhow!(msg)),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::eligibility::PolicyGate;
    use starling_common::metrics::NullMetrics;
    use starling_store::policy::{PolicyError, PolicyVerdict};
    use starling_store::{AllowAll, MemoryStorage};

    fn test_config() -> PipelineConfig {
        PipelineConfig {
            dedupe_cache_size: 16,
            fresh_event_max_age_secs: 300,
            ingest_timeout_ms: 1000,
            eligibility: "policy-gate".into(),
            admin_pubkeys: vec![],
            local_pubkeys: vec![],
        }
    }

    fn pipeline(storage: Arc<MemoryStorage>) -> Pipeline {
        Pipeline::new(
            storage.clone(),
            storage,
            Arc::new(AllowAll),
            Arc::new(PolicyGate),
            Arc::new(PubSub::new()),
            Arc::new(NullMetrics),
            &test_config(),
        )
    }

    fn note(id: &str, pubkey: &str) -> Event {
        Event {
            id: id.to_string(),
            pubkey: pubkey.to_string(),
            created_at: chrono::Utc::now().timestamp() as u64,
            kind: KIND_NOTE,
            tags: vec![],
            content: "a note".into(),
            sig: "sig".into(),
        }
    }

    struct DenyAll;

    #[async_trait::async_trait]
    impl Policy for DenyAll {
        async fn call(&self, event: &Event) -> Result<PolicyVerdict, PolicyError> {
            Ok(PolicyVerdict {
                event_id: event.id.clone(),
                allowed: false,
                reason: "not welcome here".into(),
            })
        }
    }

    #[tokio::test]
    async fn accepted_events_are_stored() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());
        p.handle_event(note("e1", "pk"), IngestOptions::default())
            .await
            .unwrap();
        assert_eq!(storage.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn duplicate_ingestion_returns_prior_verdict_and_counts_once() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());
        let e = note("e1", "pk");

        p.handle_event(e.clone(), IngestOptions::default())
            .await
            .unwrap();
        p.handle_event(e, IngestOptions::default()).await.unwrap();

        // The notes counter moved exactly once.
        assert_eq!(storage.author_stat("pk", AuthorStat::Notes).await, 1);
        assert_eq!(storage.count(&[Filter::new()]).await.unwrap(), 1);
    }

    #[tokio::test]
    async fn rejections_are_classified_and_replayed_from_cache() {
        let storage = Arc::new(MemoryStorage::new());
        let p = Pipeline::new(
            storage.clone(),
            storage.clone(),
            Arc::new(DenyAll),
            Arc::new(PolicyGate),
            Arc::new(PubSub::new()),
            Arc::new(NullMetrics),
            &test_config(),
        );

        let e = note("e1", "pk");
        for _ in 0..2 {
            let err = p
                .handle_event(e.clone(), IngestOptions::default())
                .await
                .unwrap_err();
            assert_eq!(err.client_message(), "blocked: not welcome here");
        }
        assert_eq!(storage.count(&[Filter::new()]).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn deleted_events_cannot_be_reingested() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());

        let mut deletion = note("del1", "pk");
        deletion.kind = KIND_DELETION;
        deletion.tags = vec![vec!["e".into(), "e1".into()]];
        p.handle_event(deletion, IngestOptions::default())
            .await
            .unwrap();

        let err = p
            .handle_event(note("e1", "pk"), IngestOptions::default())
            .await
            .unwrap_err();
        assert_eq!(err.client_message(), "blocked: event was deleted");
    }

    #[tokio::test]
    async fn deletion_erases_only_the_authors_own_events() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());

        p.handle_event(note("mine", "pk"), IngestOptions::default())
            .await
            .unwrap();
        p.handle_event(note("theirs", "other"), IngestOptions::default())
            .await
            .unwrap();

        let mut deletion = note("del1", "pk");
        deletion.kind = KIND_DELETION;
        deletion.tags = vec![
            vec!["e".into(), "mine".into()],
            vec!["e".into(), "theirs".into()],
        ];
        p.handle_event(deletion, IngestOptions::default())
            .await
            .unwrap();

        let remaining = storage
            .query(&[Filter::new().kinds([KIND_NOTE])], QueryOptions::default())
            .await
            .unwrap();
        assert_eq!(remaining.len(), 1);
        assert_eq!(remaining[0].id, "theirs");
    }

    #[tokio::test]
    async fn ephemeral_events_skip_storage_but_hit_the_bus() {
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(PubSub::new());
        let p = Pipeline::new(
            storage.clone(),
            storage.clone(),
            Arc::new(AllowAll),
            Arc::new(PolicyGate),
            bus.clone(),
            Arc::new(NullMetrics),
            &test_config(),
        );

        let mut sub = bus.subscribe(vec![Filter::new()]);
        assert!(matches!(
            sub.recv().await,
            Some(crate::pubsub::LiveMessage::EndOfStored)
        ));

        let mut e = note("eph", "pk");
        e.kind = 20001;
        p.handle_event(e, IngestOptions::default()).await.unwrap();

        assert_eq!(storage.count(&[Filter::new()]).await.unwrap(), 0);
        assert!(matches!(
            sub.recv().await,
            Some(crate::pubsub::LiveMessage::Event(_))
        ));
    }

    #[tokio::test]
    async fn stale_events_stay_off_the_live_bus() {
        let storage = Arc::new(MemoryStorage::new());
        let bus = Arc::new(PubSub::new());
        let p = Pipeline::new(
            storage.clone(),
            storage.clone(),
            Arc::new(AllowAll),
            Arc::new(PolicyGate),
            bus.clone(),
            Arc::new(NullMetrics),
            &test_config(),
        );

        let mut sub = bus.subscribe(vec![Filter::new()]);
        let _ = sub.recv().await;

        let mut backfill = note("old", "pk");
        backfill.created_at = 1_000_000; // far in the past
        p.handle_event(backfill, IngestOptions::default())
            .await
            .unwrap();

        assert_eq!(storage.count(&[Filter::new()]).await.unwrap(), 1);
        assert!(
            tokio::time::timeout(Duration::from_millis(20), sub.recv())
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn reaction_and_repost_counters() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());

        p.handle_event(note("target", "author"), IngestOptions::default())
            .await
            .unwrap();

        let mut reaction = note("r1", "fan");
        reaction.kind = KIND_REACTION;
        reaction.tags = vec![vec!["e".into(), "target".into()]];
        reaction.content = "+".into();
        p.handle_event(reaction, IngestOptions::default())
            .await
            .unwrap();

        let mut repost = note("r2", "fan");
        repost.kind = KIND_REPOST;
        repost.tags = vec![vec!["e".into(), "target".into()]];
        p.handle_event(repost, IngestOptions::default())
            .await
            .unwrap();

        assert_eq!(storage.event_stat("target", EventStat::Reactions).await, 1);
        assert_eq!(storage.event_stat("target", EventStat::Reposts).await, 1);
    }

    #[tokio::test]
    async fn hashtags_and_relay_hints_are_recorded() {
        let storage = Arc::new(MemoryStorage::new());
        let p = pipeline(storage.clone());

        let mut e = note("e1", "pk");
        e.tags = vec![
            vec!["t".into(), "Nostr".into()],
            vec!["e".into(), "x".into(), "wss://hint.example".into()],
            vec!["e".into(), "y".into(), "http://insecure.example".into()],
        ];
        p.handle_event(e, IngestOptions::default()).await.unwrap();

        assert_eq!(storage.hashtag_uses("nostr").await, 1);
        assert_eq!(storage.known_relays().await, vec!["wss://hint.example"]);
    }

    struct SlowPolicy;

    #[async_trait::async_trait]
    impl Policy for SlowPolicy {
        async fn call(&self, event: &Event) -> Result<PolicyVerdict, PolicyError> {
            tokio::time::sleep(Duration::from_secs(5)).await;
            Ok(PolicyVerdict {
                event_id: event.id.clone(),
                allowed: true,
                reason: String::new(),
            })
        }
    }

    #[tokio::test]
    async fn bounded_invocations_time_out_and_release_the_claim() {
        let storage = Arc::new(MemoryStorage::new());
        let p = Pipeline::new(
            storage.clone(),
            storage.clone(),
            Arc::new(SlowPolicy),
            Arc::new(PolicyGate),
            Arc::new(PubSub::new()),
            Arc::new(NullMetrics),
            &test_config(),
        );

        let e = note("e1", "pk");
        let err = p
            .handle_event(
                e.clone(),
                IngestOptions {
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));

        // The claim was released; a retry is not treated as in flight.
        let err = p
            .handle_event(
                e,
                IngestOptions {
                    timeout: Some(Duration::from_millis(20)),
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Timeout));
    }

    #[test]
    fn secure_relay_url_validation() {
        assert!(is_secure_relay_url("wss://relay.example.com"));
        assert!(!is_secure_relay_url("ws://relay.example.com"));
        assert!(!is_secure_relay_url("https://relay.example.com"));
        assert!(!is_secure_relay_url("not a url"));
    }
}
