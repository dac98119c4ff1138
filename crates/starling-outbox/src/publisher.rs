//! Best-effort event fan-out to external relays.
//!
//! One outbound WebSocket per target relay, a bounded connect/send budget,
//! and no retries: a failure on one relay never rolls back or delays the
//! others.

use crate::router::OutboxRouter;
use futures_util::{SinkExt, StreamExt};
use starling_common::Event;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;

/// Outbound publisher.
#[derive(Debug, Clone)]
pub struct Publisher {
    /// Budget for connect + send + acknowledgment per relay.
    pub timeout: Duration,
}

impl Publisher {
    pub fn new(timeout: Duration) -> Self {
        Self { timeout }
    }

    /// Publish `event` to every relay, independently and concurrently.
    pub async fn publish(&self, relays: &[String], event: &Event) {
        let frame = serde_json::json!(["EVENT", event]).to_string();

        let attempts = relays.iter().map(|relay| {
            let frame = frame.clone();
            let event_id = event.id.clone();
            let timeout = self.timeout;
            async move {
                match tokio::time::timeout(timeout, send_once(relay, &frame)).await {
                    Ok(Ok(())) => {
                        tracing::debug!(%relay, event = %event_id, "published");
                    }
                    Ok(Err(e)) => {
                        tracing::warn!(%relay, event = %event_id, error = %e, "publish failed");
                    }
                    Err(_) => {
                        tracing::warn!(%relay, event = %event_id, "publish timed out");
                    }
                }
            }
        });

        futures_util::future::join_all(attempts).await;
    }
}

async fn send_once(relay: &str, frame: &str) -> anyhow::Result<()> {
    let (mut socket, _) = connect_async(relay.to_string()).await?;
    socket.send(Message::Text(frame.to_string().into())).await?;

    // Wait for the OK acknowledgment, but don't insist on it; some relays
    // just close.
    if let Some(Ok(Message::Text(reply))) = socket.next().await {
        tracing::trace!(%relay, %reply, "relay replied");
    }

    let _ = socket.close(None).await;
    Ok(())
}

/// Worker draining the pipeline's outbox queue: route each event to its
/// author's write relays and publish best-effort.
pub async fn broadcast_worker(
    mut rx: mpsc::Receiver<Event>,
    router: Arc<OutboxRouter>,
    publisher: Publisher,
) {
    while let Some(event) = rx.recv().await {
        match router.route_publish(&event).await {
            Ok(relays) if relays.is_empty() => {
                tracing::debug!(event = %event.id, "no outbox relays for author");
            }
            Ok(relays) => {
                publisher.publish(&relays, &event).await;
            }
            Err(e) => {
                tracing::warn!(event = %event.id, error = %e, "outbox routing failed");
            }
        }
    }
}
