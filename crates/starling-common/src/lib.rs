//! # starling-common
//!
//! Shared foundation for the Starling relay:
//! - **Event** — the immutable, content-addressed record every other crate
//!   passes around
//! - **Filter** — the query descriptor used by subscriptions, the pub/sub
//!   bus, and storage lookups alike
//! - **Wire protocol** — the JSON-array client/relay message codec
//! - **Errors** — the rejection taxonomy with client-safe reason strings
//! - **Config** — layered application configuration

pub mod config;
pub mod error;
pub mod event;
pub mod filter;
pub mod message;
pub mod metrics;

pub use error::{Reject, RelayError};
pub use event::Event;
pub use filter::Filter;
pub use message::{ClientMessage, RelayMessage};
