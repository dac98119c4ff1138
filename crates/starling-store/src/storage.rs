//! The `Storage` capability and its cancellable stream handle.

use async_trait::async_trait;
use starling_common::{Event, Filter};
use std::time::Duration;
use thiserror::Error;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Errors a storage backend may surface to the core.
#[derive(Debug, Error)]
pub enum StorageError {
    /// The backend could not produce results within the deadline.
    #[error("storage deadline exceeded")]
    Timeout,

    /// The backend refused the request on policy grounds; the reason is
    /// safe to show to clients.
    #[error("{0}")]
    Rejected(String),

    /// Anything backend-specific; the text never reaches clients.
    #[error("storage backend error: {0}")]
    Backend(String),
}

/// Options for one-shot queries.
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Optional deadline; `None` leaves it to the backend.
    pub timeout: Option<Duration>,
}

/// Options for streaming REQ-style reads.
#[derive(Debug, Clone)]
pub struct ReqOptions {
    /// Deadline for the stored-event phase of the stream.
    pub timeout: Duration,
    /// Cancelling promptly unwinds the producer.
    pub cancel: CancellationToken,
}

/// One item on a streaming read.
#[derive(Debug, Clone)]
pub enum StreamItem {
    Event(Event),
    /// All stored events matching the filters have been delivered.
    EndOfStored,
}

/// Cancellable pull handle over a streaming read.
///
/// Producers push into the paired sender and stop when the consumer goes
/// away or the request's cancellation token fires; consumers call
/// [`EventStream::next`] until it returns `None`.
pub struct EventStream {
    rx: mpsc::Receiver<Result<StreamItem, StorageError>>,
}

impl EventStream {
    /// Create a stream with an attached producer handle.
    pub fn channel(capacity: usize) -> (mpsc::Sender<Result<StreamItem, StorageError>>, Self) {
        let (tx, rx) = mpsc::channel(capacity);
        (tx, Self { rx })
    }

    /// Next item, or `None` once the producer is done.
    pub async fn next(&mut self) -> Option<Result<StreamItem, StorageError>> {
        self.rx.recv().await
    }
}

/// The narrow storage capability the core consumes.
///
/// Filters arriving here are already normalized (impossible filters dropped,
/// limits clamped).
#[async_trait]
pub trait Storage: Send + Sync {
    /// Durably write one event. Re-inserting a stored id is a no-op.
    async fn event(&self, event: &Event) -> Result<(), StorageError>;

    /// One-shot query returning matching events, newest first.
    async fn query(&self, filters: &[Filter], opts: QueryOptions)
    -> Result<Vec<Event>, StorageError>;

    /// Streaming read: matching stored events, then
    /// [`StreamItem::EndOfStored`], then the stream closes.
    async fn req(&self, filters: &[Filter], opts: ReqOptions) -> EventStream;

    /// Count matching events.
    async fn count(&self, filters: &[Filter]) -> Result<u64, StorageError>;

    /// Erase matching events; returns how many were removed.
    async fn delete(&self, filters: &[Filter]) -> Result<u64, StorageError>;
}
