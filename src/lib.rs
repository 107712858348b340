//! Dine Sync - tenant-scoped cache coherency and real-time sync
//!
//! Keeps a local, per-tenant cache of restaurant collections (tables, menu
//! items, categories, staff) consistent with a remote document store that
//! pushes changes asynchronously.

pub mod api;
pub mod cache;
pub mod config;
pub mod engine;
pub mod error;
pub mod health;
pub mod kind;
pub mod models;
pub mod mutation;
pub mod remote;
pub mod retry;
pub mod service;
pub mod staleness;
pub mod sync;
pub mod tasks;

pub use api::AppState;
pub use config::Config;
pub use engine::{DynCollection, SyncEngine};
pub use error::{ApiError, RemoteError, RemoteErrorCode, Result, SyncError};
pub use health::{ConnectionHealthMonitor, ConnectionState};
pub use kind::{CollectionKind, TenantId, TtlTable};
pub use service::{CollectionService, ServiceContext};
pub use sync::{Subscription, SubscriptionEvent};
