//! Cache Module
//!
//! Tenant-scoped collection snapshots with TTL metadata over pluggable
//! persistence.

mod entry;
pub mod persistence;
mod stats;
mod store;


// Re-export public types
pub use entry::{current_timestamp_ms, CacheEntry};
pub use persistence::{FilePersistence, MemoryPersistence, NoopPersistence, Persistence};
pub use stats::CacheStats;
pub use store::{CacheStore, SCHEMA_VERSION};
