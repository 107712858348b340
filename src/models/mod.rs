//! Entity and Response models
//!
//! Entities are the tenant-scoped documents the engine caches; responses are
//! the DTOs returned by the HTTP surface.

pub mod entities;
pub mod responses;

// Re-export commonly used types
pub use entities::{natural_cmp, sort_items, Category, Entity, MenuItem, StaffMember, Table};
pub use responses::{
    DeleteResponse, ErrorResponse, HealthResponse, ListResponse, MessageResponse, StatsResponse,
};
