//! Cache Statistics Module
//!
//! Tracks how collection reads were answered.

use serde::Serialize;

// == Cache Stats ==
/// Read counters for one collection service.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct CacheStats {
    /// Reads answered from a fresh entry
    pub hits: u64,
    /// Reads that found no entry
    pub misses: u64,
    /// Reads that found an entry past its expiry
    pub stale: u64,
    /// Remote collection fetches issued, retries included
    pub remote_fetches: u64,
    /// Fetches that fell back to an unsorted query
    pub unsorted_fallbacks: u64,
    /// Reads answered with stale data because the remote fetch failed
    pub stale_served: u64,
}

impl CacheStats {
    // == Constructor ==
    /// Creates a new CacheStats with all counters at zero.
    pub fn new() -> Self {
        Self::default()
    }

    // == Hit Rate ==
    /// Calculates hits / (hits + misses + stale), or 0.0 with no reads.
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses + self.stale;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }

    pub fn record_hit(&mut self) {
        self.hits += 1;
    }

    pub fn record_miss(&mut self) {
        self.misses += 1;
    }

    pub fn record_stale(&mut self) {
        self.stale += 1;
    }

    pub fn record_remote_fetch(&mut self) {
        self.remote_fetches += 1;
    }

    pub fn record_unsorted_fallback(&mut self) {
        self.unsorted_fallbacks += 1;
    }

    pub fn record_stale_served(&mut self) {
        self.stale_served += 1;
    }

    /// Adds another service's counters into this one.
    pub fn merge(&mut self, other: &CacheStats) {
        self.hits += other.hits;
        self.misses += other.misses;
        self.stale += other.stale;
        self.remote_fetches += other.remote_fetches;
        self.unsorted_fallbacks += other.unsorted_fallbacks;
        self.stale_served += other.stale_served;
    }
}
