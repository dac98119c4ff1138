//! Per-socket protocol state machine.
//!
//! One task runs the receive loop, one task owns the sink; they talk over a
//! bounded channel. Frames are text-only JSON arrays. Invalid payloads get a
//! NOTICE and the connection stays open; transport violations (binary
//! frames, message-rate overflow) close it with 1003/1008.

use crate::RelayState;
use crate::subscription::SubscriptionTable;
use axum::extract::ws::{CloseFrame, Message as WsMessage, WebSocket};
use futures_util::{SinkExt, StreamExt};
use starling_common::error::RelayError;
use starling_common::message::{ClientMessage, RelayMessage};
use starling_common::metrics::names;
use starling_common::{Event, Filter};
use starling_ingest::pipeline::IngestOptions;
use starling_ingest::pubsub::LiveMessage;
use starling_store::{ReqOptions, StorageError, StreamItem};
use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// Close code for unacceptable payloads (binary frames).
const CLOSE_UNSUPPORTED: u16 = 1003;
/// Close code for rate-limit violations.
const CLOSE_POLICY: u16 = 1008;

/// What the receive loop asks the sender task to do.
enum Outbound {
    Frame(RelayMessage),
    Close(u16, &'static str),
}

/// Lifecycle of one socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum ConnState {
    Open,
    Closed,
}

pub(crate) async fn handle_socket(socket: WebSocket, ip: String, state: Arc<RelayState>) {
    let conn_id = Uuid::new_v4();
    state.metrics.gauge(names::CONNECTIONS_OPEN, 1);
    tracing::debug!(conn = %conn_id, %ip, "connection open");

    let (mut sink, mut stream) = socket.split();
    let (out_tx, mut out_rx) = mpsc::channel::<Outbound>(256);

    // ── Sender task ─────────────────────────────────────────────────────
    // Single owner of the sink; subscription tasks and the receive loop
    // both enqueue through the channel.
    let send_task = tokio::spawn(async move {
        while let Some(outbound) = out_rx.recv().await {
            match outbound {
                Outbound::Frame(msg) => {
                    if sink
                        .send(WsMessage::Text(msg.to_json().into()))
                        .await
                        .is_err()
                    {
                        break;
                    }
                }
                Outbound::Close(code, reason) => {
                    let _ = sink
                        .send(WsMessage::Close(Some(CloseFrame {
                            code,
                            reason: reason.into(),
                        })))
                        .await;
                    break;
                }
            }
        }
    });

    let mut conn = Connection {
        id: conn_id,
        ip,
        state: Arc::clone(&state),
        subscriptions: SubscriptionTable::new(),
        out_tx,
        lifecycle: ConnState::Open,
    };

    // ── Receive loop ────────────────────────────────────────────────────
    // Messages on one connection are processed strictly in arrival order.
    while let Some(Ok(frame)) = stream.next().await {
        match frame {
            WsMessage::Text(text) => {
                conn.handle_frame(text.as_str()).await;
            }
            WsMessage::Binary(_) => {
                tracing::debug!(conn = %conn.id, "binary frame, closing");
                conn.close(CLOSE_UNSUPPORTED, "binary frames are not accepted")
                    .await;
            }
            WsMessage::Close(_) => break,
            // axum answers pings itself.
            WsMessage::Ping(_) | WsMessage::Pong(_) => {}
        }
        if conn.lifecycle == ConnState::Closed {
            break;
        }
    }

    // ── Cleanup ─────────────────────────────────────────────────────────
    conn.subscriptions.cancel_all();
    state.metrics.gauge(names::CONNECTIONS_OPEN, -1);
    tracing::debug!(conn = %conn.id, "connection closed");

    // Dropping the last sender ends the sender task; closing frames queued
    // above still flush first.
    drop(conn);
    let _ = send_task.await;
}

struct Connection {
    id: Uuid,
    ip: String,
    state: Arc<RelayState>,
    subscriptions: SubscriptionTable,
    out_tx: mpsc::Sender<Outbound>,
    lifecycle: ConnState,
}

impl Connection {
    async fn send(&self, msg: RelayMessage) {
        let _ = self.out_tx.send(Outbound::Frame(msg)).await;
    }

    async fn close(&mut self, code: u16, reason: &'static str) {
        let _ = self.out_tx.send(Outbound::Close(code, reason)).await;
        self.lifecycle = ConnState::Closed;
    }

    async fn handle_frame(&mut self, text: &str) {
        self.state.metrics.counter(names::MESSAGES_RECEIVED, 1);

        // Every frame pays the message limiter; overflow is a transport
        // violation.
        if let Err(e) = self.state.limiters.message.hit(&self.ip, 1) {
            self.state.metrics.counter(names::RATE_LIMIT_HITS, 1);
            tracing::warn!(conn = %self.id, ip = %self.ip, error = %e, "message rate exceeded");
            self.close(CLOSE_POLICY, "rate-limited: slow down").await;
            return;
        }

        let msg = match ClientMessage::parse(text) {
            Ok(msg) => msg,
            Err(e) => {
                self.send(RelayMessage::notice(e.client_message())).await;
                return;
            }
        };

        match msg {
            ClientMessage::Req { sub_id, filters } => self.on_req(sub_id, filters).await,
            ClientMessage::Event(event) => self.on_event(*event).await,
            ClientMessage::Close { sub_id } => self.on_close(&sub_id),
            ClientMessage::Count { sub_id, filters } => self.on_count(sub_id, filters).await,
        }
    }

    async fn on_req(&mut self, sub_id: String, filters: Vec<Filter>) {
        if self.state.limiters.req.hit(&self.ip, 1).is_err() {
            self.state.metrics.counter(names::RATE_LIMIT_HITS, 1);
            self.send(RelayMessage::Closed {
                sub_id,
                message: "rate-limited: too many requests".into(),
            })
            .await;
            return;
        }

        let filters = Filter::normalize(filters, self.state.config.limits.max_filter_limit);

        // A duplicate subId replaces the old subscription; cancel first.
        let replaced = self.subscriptions.cancel(&sub_id);
        if !replaced && self.subscriptions.len() >= self.state.config.limits.max_subscriptions {
            self.send(RelayMessage::Closed {
                sub_id,
                message: "rate-limited: too many open subscriptions".into(),
            })
            .await;
            return;
        }

        if filters.is_empty() {
            // Nothing can ever match; acknowledge the empty stored set and
            // hold no subscription.
            self.send(RelayMessage::Eose { sub_id }).await;
            return;
        }

        let (generation, cancel) = self.subscriptions.insert(&sub_id);
        self.state.metrics.gauge(names::SUBSCRIPTIONS_OPEN, 1);

        let state = Arc::clone(&self.state);
        let out_tx = self.out_tx.clone();
        let table = self.subscriptions.clone();
        let conn_id = self.id;
        tokio::spawn(async move {
            run_subscription(&state, &out_tx, conn_id, &sub_id, filters, cancel).await;
            table.remove_if(&sub_id, generation);
            state.metrics.gauge(names::SUBSCRIPTIONS_OPEN, -1);
        });
    }

    async fn on_event(&mut self, event: Event) {
        // Ephemeral kinds get their own bucket so a flood of them cannot
        // starve ordinary traffic, and vice versa.
        let limiter = if event.is_ephemeral() {
            &self.state.limiters.ephemeral
        } else {
            &self.state.limiters.event
        };
        if limiter.hit(&self.ip, 1).is_err() {
            self.state.metrics.counter(names::RATE_LIMIT_HITS, 1);
            tracing::debug!(conn = %self.id, event = %event.id, "event dropped by rate limiter");
            return;
        }

        // Shape validation happens before the pipeline: the id must be the
        // content hash. Signature proof is an upstream concern.
        if event.id != event.compute_id() {
            self.send(RelayMessage::Ok {
                event_id: event.id.clone(),
                accepted: false,
                message: "invalid: id does not match the event".into(),
            })
            .await;
            return;
        }

        let event_id = event.id.clone();
        let result = self
            .state
            .pipeline
            .handle_event(event, IngestOptions::default())
            .await;

        let (accepted, message) = match result {
            Ok(()) => (true, String::new()),
            Err(RelayError::Reject(reject)) => (false, reject.to_string()),
            Err(RelayError::Timeout) => (false, RelayError::Timeout.client_message()),
            Err(e) => {
                tracing::error!(conn = %self.id, event = %event_id, error = ?e, "event ingestion failed");
                (false, "error: something went wrong".into())
            }
        };
        self.send(RelayMessage::Ok {
            event_id,
            accepted,
            message,
        })
        .await;
    }

    fn on_close(&mut self, sub_id: &str) {
        if self.subscriptions.cancel(sub_id) {
            tracing::trace!(conn = %self.id, sub = %sub_id, "subscription closed by client");
        }
    }

    async fn on_count(&mut self, sub_id: String, filters: Vec<Filter>) {
        if self.state.limiters.req.hit(&self.ip, 1).is_err() {
            self.state.metrics.counter(names::RATE_LIMIT_HITS, 1);
            self.send(RelayMessage::Closed {
                sub_id,
                message: "rate-limited: too many requests".into(),
            })
            .await;
            return;
        }

        let filters = Filter::normalize(filters, self.state.config.limits.max_filter_limit);
        let count = if filters.is_empty() {
            Ok(0)
        } else {
            self.state.storage.count(&filters).await
        };

        match count {
            Ok(count) => {
                self.send(RelayMessage::Count {
                    sub_id,
                    count,
                    approximate: false,
                })
                .await;
            }
            Err(StorageError::Timeout) => {
                self.send(RelayMessage::Closed {
                    sub_id,
                    message: RelayError::Timeout.client_message(),
                })
                .await;
            }
            Err(StorageError::Rejected(reason)) => {
                self.send(RelayMessage::Closed {
                    sub_id,
                    message: format!("blocked: {reason}"),
                })
                .await;
            }
            Err(e) => {
                tracing::error!(conn = %self.id, error = %e, "count failed");
                self.send(RelayMessage::Closed {
                    sub_id,
                    message: "error: something went wrong".into(),
                })
                .await;
            }
        }
    }
}

/// Drive one subscription: register on the live bus, stream stored events,
/// send EOSE, then forward live matches until cancelled.
async fn run_subscription(
    state: &RelayState,
    out_tx: &mpsc::Sender<Outbound>,
    conn_id: Uuid,
    sub_id: &str,
    filters: Vec<Filter>,
    cancel: CancellationToken,
) {
    // Register for live events before reading storage so nothing falls in
    // the gap between the two phases.
    let mut live = state.pubsub.subscribe(filters.clone());

    let mut stream = state
        .storage
        .req(
            &filters,
            ReqOptions {
                timeout: Duration::from_secs(state.config.storage.req_timeout_secs),
                cancel: cancel.clone(),
            },
        )
        .await;

    // Ids delivered from storage; live duplicates of these are skipped.
    let mut delivered: HashSet<String> = HashSet::new();

    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            item = stream.next() => match item {
                Some(Ok(StreamItem::Event(event))) => {
                    delivered.insert(event.id.clone());
                    let frame = RelayMessage::Event { sub_id: sub_id.to_string(), event };
                    if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                Some(Ok(StreamItem::EndOfStored)) => {
                    let frame = RelayMessage::Eose { sub_id: sub_id.to_string() };
                    if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                        return;
                    }
                    break;
                }
                Some(Err(e)) => {
                    let message = match e {
                        StorageError::Timeout => RelayError::Timeout.client_message(),
                        StorageError::Rejected(reason) => format!("blocked: {reason}"),
                        StorageError::Backend(detail) => {
                            tracing::error!(conn = %conn_id, sub = %sub_id, error = %detail, "subscription stream failed");
                            "error: something went wrong".to_string()
                        }
                    };
                    let _ = out_tx
                        .send(Outbound::Frame(RelayMessage::Closed {
                            sub_id: sub_id.to_string(),
                            message,
                        }))
                        .await;
                    return;
                }
                // Producer unwound (cancellation); nothing more to say.
                None => return,
            },
        }
    }

    // ── Live phase ──────────────────────────────────────────────────────
    loop {
        tokio::select! {
            _ = cancel.cancelled() => return,
            msg = live.recv() => match msg {
                Some(LiveMessage::Event(event)) => {
                    if delivered.contains(&event.id) {
                        continue;
                    }
                    let frame = RelayMessage::Event {
                        sub_id: sub_id.to_string(),
                        event: (*event).clone(),
                    };
                    if out_tx.send(Outbound::Frame(frame)).await.is_err() {
                        return;
                    }
                }
                // The registration ack; EOSE already came from storage.
                Some(LiveMessage::EndOfStored) => {}
                None => return,
            },
        }
    }
}
