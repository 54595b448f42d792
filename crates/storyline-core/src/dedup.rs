// Per-session deduplication
// Decision: Dedup is per event. Log-backed messages are keyed by (table, event id),
// so the same event reached through a push and a catch-up scan is sent once, while
// two distinct events on the same entity are both sent. Messages without a log id
// fall back to a key synthesized from kind + related id + emission time.

use std::collections::{HashSet, VecDeque};
use std::hash::Hash;

use crate::event::{EventId, EventRef, RelatedTable};

/// Default number of identities remembered per session
pub const DEFAULT_DEDUP_CAPACITY: usize = 1000;

/// Identity of an outgoing update
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum DedupKey {
    Event {
        table: RelatedTable,
        id: EventId,
    },
    Synthesized {
        table: RelatedTable,
        kind: Option<String>,
        related_id: i64,
        emitted_at_micros: i64,
    },
}

impl DedupKey {
    pub fn for_ref(event_ref: &EventRef) -> Self {
        match event_ref.event_id {
            Some(id) => DedupKey::Event {
                table: event_ref.table,
                id,
            },
            None => DedupKey::Synthesized {
                table: event_ref.table,
                kind: event_ref.kind.clone(),
                related_id: event_ref.related_id,
                emitted_at_micros: event_ref.emitted_at.timestamp_micros(),
            },
        }
    }
}

/// Bounded set of recently seen keys.
///
/// Once the set grows past its capacity the oldest half is evicted, which keeps
/// memory flat while still covering the redelivery window of both transports.
#[derive(Debug, Clone)]
pub struct RecentSet<K> {
    capacity: usize,
    seen: HashSet<K>,
    order: VecDeque<K>,
}

impl<K: Clone + Eq + Hash> RecentSet<K> {
    pub fn new(capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            capacity,
            seen: HashSet::with_capacity(capacity + 1),
            order: VecDeque::with_capacity(capacity + 1),
        }
    }

    pub fn contains(&self, key: &K) -> bool {
        self.seen.contains(key)
    }

    /// Insert a key; returns false if it was already present
    pub fn insert(&mut self, key: K) -> bool {
        if !self.seen.insert(key.clone()) {
            return false;
        }
        self.order.push_back(key);

        if self.order.len() > self.capacity {
            let evict = self.order.len() / 2;
            for old in self.order.drain(..evict) {
                self.seen.remove(&old);
            }
        }
        true
    }

    pub fn len(&self) -> usize {
        self.order.len()
    }

    pub fn is_empty(&self) -> bool {
        self.order.is_empty()
    }

    pub fn capacity(&self) -> usize {
        self.capacity
    }
}

impl<K: Clone + Eq + Hash> Default for RecentSet<K> {
    fn default() -> Self {
        Self::new(DEFAULT_DEDUP_CAPACITY)
    }
}
