//! Per-connection subscription bookkeeping.
//!
//! At most one live subscription per `(connection, subId)`. Each entry owns
//! a cancellation token; cancelling promptly unwinds the storage stream and
//! the live forwarder. Entries carry a generation so a finished task never
//! removes its replacement.

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use tokio_util::sync::CancellationToken;

struct SubEntry {
    generation: u64,
    cancel: CancellationToken,
}

/// Shared between the connection's receive loop and its subscription tasks.
#[derive(Clone, Default)]
pub struct SubscriptionTable {
    inner: Arc<Mutex<Table>>,
}

#[derive(Default)]
struct Table {
    entries: HashMap<String, SubEntry>,
    next_generation: u64,
}

impl SubscriptionTable {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register `sub_id`, cancelling any previous holder first. Returns the
    /// new entry's generation and token.
    pub fn insert(&self, sub_id: &str) -> (u64, CancellationToken) {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        if let Some(old) = table.entries.remove(sub_id) {
            old.cancel.cancel();
        }
        table.next_generation += 1;
        let generation = table.next_generation;
        let cancel = CancellationToken::new();
        table.entries.insert(
            sub_id.to_string(),
            SubEntry {
                generation,
                cancel: cancel.clone(),
            },
        );
        (generation, cancel)
    }

    /// Cancel and remove; returns whether an entry existed.
    pub fn cancel(&self, sub_id: &str) -> bool {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        match table.entries.remove(sub_id) {
            Some(entry) => {
                entry.cancel.cancel();
                true
            }
            None => false,
        }
    }

    /// Drop the entry only if it is still generation `generation`; used by a
    /// subscription task cleaning up after itself.
    pub fn remove_if(&self, sub_id: &str, generation: u64) {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        if table
            .entries
            .get(sub_id)
            .is_some_and(|e| e.generation == generation)
        {
            table.entries.remove(sub_id);
        }
    }

    /// Cancel everything; used on socket close.
    pub fn cancel_all(&self) {
        let mut table = self.inner.lock().expect("subscription table poisoned");
        for (_, entry) in table.entries.drain() {
            entry.cancel.cancel();
        }
    }

    pub fn len(&self) -> usize {
        self.inner
            .lock()
            .expect("subscription table poisoned")
            .entries
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reusing_a_sub_id_cancels_the_old_entry() {
        let table = SubscriptionTable::new();
        let (_, first) = table.insert("s1");
        let (gen2, second) = table.insert("s1");

        assert!(first.is_cancelled());
        assert!(!second.is_cancelled());
        assert_eq!(table.len(), 1);

        // The replaced task's cleanup must not evict the live entry.
        table.remove_if("s1", gen2 - 1);
        assert_eq!(table.len(), 1);
        table.remove_if("s1", gen2);
        assert!(table.is_empty());
    }

    #[test]
    fn cancel_is_a_noop_without_an_entry() {
        let table = SubscriptionTable::new();
        assert!(!table.cancel("missing"));
        let (_, token) = table.insert("s1");
        assert!(table.cancel("s1"));
        assert!(token.is_cancelled());
    }

    #[test]
    fn cancel_all_unwinds_every_subscription() {
        let table = SubscriptionTable::new();
        let (_, a) = table.insert("a");
        let (_, b) = table.insert("b");
        table.cancel_all();
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        assert!(table.is_empty());
    }
}
