//! # starling-store
//!
//! The narrow capabilities the relay core consumes from the durable world:
//! - **Storage** — insert/query/stream/count/delete over events
//! - **Policy** — approve or reject an event, possibly out of process
//! - **Tally** — fire-and-forget counters (stats, trends, relay urls)
//!
//! The engine behind these traits (its schema, SQL, indexes) is somebody
//! else's problem. [`MemoryStorage`] is the reference backend used by tests
//! and single-node deployments.

pub mod memory;
pub mod policy;
pub mod storage;
pub mod tally;

pub use memory::MemoryStorage;
pub use policy::{AllowAll, ExternalPolicy, Policy, PolicyVerdict};
pub use storage::{EventStream, QueryOptions, ReqOptions, Storage, StorageError, StreamItem};
pub use tally::{AuthorStat, EventStat, Tally};
