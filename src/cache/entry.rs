//! Cache Entry Module
//!
//! Defines a cached collection snapshot with its fetch and expiry metadata.

use chrono::Utc;

use crate::models::{sort_items, Entity};

// == Cache Entry ==
/// Snapshot of one (tenant, kind) collection.
///
/// Invariant: `expires_at == fetched_at + TTL(kind)`. An entry with no items
/// is a fetched, empty collection and is distinct from no entry at all.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    /// Items in comparator order, ids unique
    pub items: Vec<T>,
    /// When the snapshot was fetched (Unix milliseconds)
    pub fetched_at: u64,
    /// When the snapshot stops being fresh (Unix milliseconds)
    pub expires_at: u64,
}

impl<T: Entity> CacheEntry<T> {
    // == Constructor ==
    /// Builds an entry, ordering the items and dropping duplicate ids.
    ///
    /// When an id appears more than once the last occurrence wins.
    pub fn new(items: Vec<T>, fetched_at: u64, ttl_ms: u64) -> Self {
        let mut unique: Vec<T> = Vec::with_capacity(items.len());
        for item in items {
            match unique.iter().position(|existing| existing.id() == item.id()) {
                Some(index) => unique[index] = item,
                None => unique.push(item),
            }
        }
        sort_items(&mut unique);

        Self {
            items: unique,
            fetched_at,
            expires_at: fetched_at.saturating_add(ttl_ms),
        }
    }

    // == Is Expired ==
    /// An entry is expired once `now >= expires_at`; the boundary is stale.
    pub fn is_expired_at(&self, now_ms: u64) -> bool {
        now_ms >= self.expires_at
    }

    pub fn is_expired(&self) -> bool {
        self.is_expired_at(current_timestamp_ms())
    }

    // == Time To Live ==
    /// Remaining freshness in milliseconds, 0 once expired.
    pub fn ttl_remaining_ms(&self, now_ms: u64) -> u64 {
        self.expires_at.saturating_sub(now_ms)
    }

    pub fn get(&self, id: &str) -> Option<&T> {
        self.items.iter().find(|item| item.id() == id)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.get(id).is_some()
    }

    pub fn len(&self) -> usize {
        self.items.len()
    }

    pub fn is_empty(&self) -> bool {
        self.items.is_empty()
    }

    // == Targeted Mutation ==
    /// Inserts or replaces one item, keeping comparator order.
    pub(crate) fn upsert(&mut self, item: T) {
        match self.items.iter().position(|existing| existing.id() == item.id()) {
            Some(index) => self.items[index] = item,
            None => self.items.push(item),
        }
        sort_items(&mut self.items);
    }

    /// Removes one item by id. Returns true when something was removed.
    pub(crate) fn remove(&mut self, id: &str) -> bool {
        let before = self.items.len();
        self.items.retain(|item| item.id() != id);
        self.items.len() != before
    }
}

// == Utility Functions ==
/// Returns current Unix timestamp in milliseconds.
pub fn current_timestamp_ms() -> u64 {
    Utc::now().timestamp_millis().max(0) as u64
}
