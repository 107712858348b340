//! API Module
//!
//! HTTP handlers and routing for the dashboard backend.
//!
//! # Endpoints
//! - `GET|POST /tenants/:tenant/:kind` - List or create collection items
//! - `PUT|DELETE /tenants/:tenant/:kind/:id` - Update or delete an item
//! - `POST /tenants/:tenant/:kind/invalidate` - Drop one cached collection
//! - `DELETE /tenants/:tenant/cache` - Drop a tenant's whole cache
//! - `GET /stats` - Read statistics
//! - `GET /health` - Remote connection state

pub mod handlers;
pub mod routes;

pub use handlers::*;
pub use routes::create_router;
