//! # Starling Server
//!
//! Builds the application context once at boot (storage, policy,
//! eligibility strategy, pipeline, pub/sub, outbox router, rate limiters,
//! metrics) and serves the relay, health, and metrics routes from one
//! process. There are no module-level singletons; everything flows down
//! from here.

mod metrics;

use crate::metrics::PrometheusMetrics;
use axum::Router;
use axum::extract::State;
use axum::routing::get;
use starling_common::metrics::SharedMetrics;
use starling_ingest::eligibility::{EligibilityPolicy, KnownAuthors, PolicyGate};
use starling_ingest::pipeline::Pipeline;
use starling_ingest::pubsub::PubSub;
use starling_outbox::router::RouterConfig;
use starling_outbox::{OutboxRouter, Publisher, broadcast_worker};
use starling_relay::{RelayInfo, RelayLimiters, RelayState, build_router};
use starling_store::policy::Policy;
use starling_store::{AllowAll, ExternalPolicy, MemoryStorage, Storage, Tally};
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let config = Arc::new(starling_common::config::load()?);

    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "starling=debug,tower_http=info".into()),
        )
        .with_target(true)
        .init();

    tracing::info!("🐦 Starting Starling v{}", env!("CARGO_PKG_VERSION"));

    let storage = Arc::new(MemoryStorage::new());
    let storage_dyn: Arc<dyn Storage> = storage.clone();
    let tally: Arc<dyn Tally> = storage.clone();
    let pubsub = Arc::new(PubSub::new());
    let prometheus = Arc::new(PrometheusMetrics::new()?);
    let metrics: SharedMetrics = prometheus.clone();

    // === Policy ===
    // A configured executable runs out of process; a missing or broken one
    // degrades to allow-all instead of failing startup.
    let policy_timeout = Duration::from_millis(config.policy.timeout_ms);
    let policy: Arc<dyn Policy> = match &config.policy.command {
        Some(command) => match ExternalPolicy::spawn(command, policy_timeout) {
            Ok(external) => {
                tracing::info!(%command, "🛡️  External policy ready");
                Arc::new(external)
            }
            Err(e) => {
                tracing::warn!(%command, error = %e, "policy unavailable, allowing all events");
                Arc::new(AllowAll)
            }
        },
        None => Arc::new(AllowAll),
    };

    // === Eligibility strategy ===
    let eligibility: Arc<dyn EligibilityPolicy> = match config.pipeline.eligibility.as_str() {
        "known-authors" => Arc::new(KnownAuthors::new(
            config.pipeline.admin_pubkeys.iter().cloned(),
        )),
        _ => Arc::new(PolicyGate),
    };

    // === Outbox ===
    // The pipeline queues fresh local events onto this channel; the worker
    // routes and publishes them best-effort.
    let (outbox_tx, outbox_rx) = tokio::sync::mpsc::channel(1024);
    if config.outbox.enabled {
        let router = Arc::new(OutboxRouter::new(
            storage_dyn.clone(),
            RouterConfig {
                max_subscribe_relays: config.outbox.max_subscribe_relays,
                max_publish_relays: config.outbox.max_publish_relays,
                self_url: (!config.server.relay_url.is_empty())
                    .then(|| config.server.relay_url.clone()),
                fallback_relays: config.outbox.fallback_relays.clone(),
            },
        ));
        let publisher = Publisher::new(Duration::from_secs(config.outbox.connect_timeout_secs));
        tokio::spawn(broadcast_worker(outbox_rx, router, publisher));
        tracing::info!("📤 Outbox broadcast worker running");
    } else {
        drop(outbox_rx);
    }

    // === Pipeline ===
    let mut pipeline = Pipeline::new(
        storage_dyn.clone(),
        tally,
        policy,
        eligibility,
        pubsub.clone(),
        metrics.clone(),
        &config.pipeline,
    );
    if config.outbox.enabled {
        pipeline = pipeline.with_outbox(outbox_tx);
    }

    // === Relay ===
    let state = Arc::new(RelayState {
        info: RelayInfo::from_config(&config),
        limiters: RelayLimiters::new(&config.limits),
        config: config.clone(),
        storage: storage_dyn,
        pipeline: Arc::new(pipeline),
        pubsub,
        metrics,
    });

    let app = build_router(state)
        .merge(
            Router::new()
                .route("/metrics", get(metrics_handler))
                .with_state(prometheus),
        )
        .route("/healthz", get(|| async { "ok" }))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive());

    let addr = SocketAddr::new(config.server.host.parse()?, config.server.port);
    tracing::info!("📡 Relay listening on ws://{addr}");

    let listener = tokio::net::TcpListener::bind(addr).await?;
    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .await?;

    Ok(())
}

async fn metrics_handler(State(metrics): State<Arc<PrometheusMetrics>>) -> String {
    metrics.render()
}
