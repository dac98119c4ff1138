//! # starling-outbox
//!
//! Outbox-model (NIP-65) relay routing: when the server queries or
//! publishes on a user's behalf, it picks the small relay subset that
//! identity actually uses instead of broadcasting to every known relay.
//!
//! - **relay_list** — parse and rank kind-10002 relay-list events
//! - **router** — subscription and publish routing decisions
//! - **publisher** — best-effort fan-out over outbound WebSockets

pub mod publisher;
pub mod relay_list;
pub mod router;

pub use publisher::{Publisher, broadcast_worker};
pub use relay_list::RelayList;
pub use router::{OutboxError, OutboxRouter};
