//! Staleness Policy Module
//!
//! Decides whether a cached snapshot may be served without a remote round-trip.

use std::sync::Arc;

use crate::cache::{current_timestamp_ms, CacheEntry};
use crate::health::ConnectionHealthMonitor;

// == Staleness Policy ==
/// Freshness check shared by every collection service.
///
/// An entry is fresh while `now < expires_at` and the connection has not been
/// reported corrupted. Corruption makes every entry stale regardless of age.
#[derive(Debug, Clone)]
pub struct StalenessPolicy {
    health: Arc<ConnectionHealthMonitor>,
}

impl StalenessPolicy {
    pub fn new(health: Arc<ConnectionHealthMonitor>) -> Self {
        Self { health }
    }

    pub fn is_fresh<T>(&self, entry: Option<&CacheEntry<T>>) -> bool {
        self.is_fresh_at(entry, current_timestamp_ms())
    }

    /// Same as [`Self::is_fresh`] against an explicit clock reading.
    pub fn is_fresh_at<T>(&self, entry: Option<&CacheEntry<T>>, now_ms: u64) -> bool {
        match entry {
            Some(entry) => !self.health.is_corrupted() && now_ms < entry.expires_at,
            None => false,
        }
    }
}
