//! # starling-ingest
//!
//! Everything between "a frame arrived" and "an event exists":
//! - **Rate limiter** — sliding-window quota tracking, single- and
//!   multi-tier
//! - **PubSub** — the process-local live event bus
//! - **Pipeline** — the single idempotent ingestion gate shared by the
//!   relay socket, authenticated REST writes, and the firehose
//! - **Eligibility** — pluggable "may this event enter durable storage"
//!   strategies

pub mod eligibility;
pub mod limiter;
pub mod pipeline;
pub mod pubsub;

pub use eligibility::{Eligibility, EligibilityPolicy, KnownAuthors, PolicyGate};
pub use limiter::{MultiTierLimiter, RateLimitError, SlidingWindowLimiter};
pub use pipeline::{IngestOptions, Pipeline};
pub use pubsub::{LiveMessage, LiveSubscription, PubSub};
