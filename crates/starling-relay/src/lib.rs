//! # starling-relay
//!
//! The WebSocket face of the relay:
//! - upgrade handling and the per-connection protocol state machine
//! - REQ/EVENT/CLOSE/COUNT dispatch with per-operation rate limiting
//! - subscription lifecycle with prompt cancellation
//! - the NIP-11 information document on the same route

pub mod connection;
pub mod info;
pub mod subscription;

use axum::Router;
use axum::extract::connect_info::ConnectInfo;
use axum::extract::{FromRequestParts, Request, State, WebSocketUpgrade};
use axum::http::header;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use starling_common::config::{AppConfig, LimitsConfig};
use starling_common::metrics::SharedMetrics;
use starling_ingest::limiter::MultiTierLimiter;
use starling_ingest::pipeline::Pipeline;
use starling_ingest::pubsub::PubSub;
use starling_store::Storage;
use std::net::SocketAddr;
use std::sync::Arc;

pub use info::RelayInfo;

/// The four limiter instances the protocol consults. Separate instances so
/// one noisy operation type cannot starve another.
pub struct RelayLimiters {
    pub message: MultiTierLimiter,
    pub req: MultiTierLimiter,
    pub event: MultiTierLimiter,
    pub ephemeral: MultiTierLimiter,
}

impl RelayLimiters {
    pub fn new(limits: &LimitsConfig) -> Self {
        Self {
            message: MultiTierLimiter::new("message", &limits.message_tiers),
            req: MultiTierLimiter::new("req", &limits.req_tiers),
            event: MultiTierLimiter::new("event", &limits.event_tiers),
            ephemeral: MultiTierLimiter::new("ephemeral", &limits.ephemeral_tiers),
        }
    }
}

/// Everything a connection needs, built once at boot and shared.
pub struct RelayState {
    pub config: Arc<AppConfig>,
    pub storage: Arc<dyn Storage>,
    pub pipeline: Arc<Pipeline>,
    pub pubsub: Arc<PubSub>,
    pub limiters: RelayLimiters,
    pub metrics: SharedMetrics,
    pub info: RelayInfo,
}

/// Build the relay router. Serve it with
/// `into_make_service_with_connect_info::<SocketAddr>()` so connections can
/// be rate-limited by source address.
pub fn build_router(state: Arc<RelayState>) -> Router {
    Router::new()
        .route("/", get(relay_handler))
        .with_state(state)
}

/// One route, two personalities: a WebSocket upgrade starts the protocol
/// state machine; plain HTTP gets the information document or a banner.
async fn relay_handler(
    State(state): State<Arc<RelayState>>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    request: Request,
) -> Response {
    let (mut parts, _body) = request.into_parts();

    let wants_upgrade = parts
        .headers
        .get(header::UPGRADE)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|v| v.eq_ignore_ascii_case("websocket"));

    if wants_upgrade {
        return match WebSocketUpgrade::from_request_parts(&mut parts, &()).await {
            Ok(ws) => ws.on_upgrade(move |socket| {
                connection::handle_socket(socket, addr.ip().to_string(), state)
            }),
            Err(rejection) => rejection.into_response(),
        };
    }

    let wants_info = parts
        .headers
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .is_some_and(|accept| accept.contains("application/nostr+json"));

    if wants_info {
        (
            [
                (header::CONTENT_TYPE, "application/nostr+json"),
                (header::ACCESS_CONTROL_ALLOW_ORIGIN, "*"),
            ],
            axum::Json(state.info.clone()),
        )
            .into_response()
    } else {
        format!(
            "{} is a Nostr relay. Connect with a WebSocket client.\n",
            state.info.name
        )
        .into_response()
    }
}
