//! API Handlers
//!
//! HTTP request handlers for the dashboard endpoints. Every collection
//! endpoint resolves `:kind` to a collection service and goes through the
//! same cache-first read and confirmed-write paths the typed services use.

use std::sync::Arc;

use axum::{
    extract::{Path, State},
    http::StatusCode,
    Json,
};
use serde_json::Value;

use crate::engine::{DynCollection, SyncEngine};
use crate::error::ApiError;
use crate::kind::{CollectionKind, TenantId};
use crate::models::{DeleteResponse, HealthResponse, ListResponse, MessageResponse, StatsResponse};

type ApiResult<T> = std::result::Result<T, ApiError>;

/// Application state shared across all handlers.
#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<SyncEngine>,
}

impl AppState {
    pub fn new(engine: SyncEngine) -> Self {
        Self {
            engine: Arc::new(engine),
        }
    }

    fn collection(&self, kind: &str) -> ApiResult<&dyn DynCollection> {
        let kind: CollectionKind = kind
            .parse()
            .map_err(|_| ApiError::UnknownCollection(kind.to_string()))?;
        Ok(self.engine.collection(kind))
    }
}

fn require_object(collection: &dyn DynCollection, payload: &Value) -> ApiResult<()> {
    if !payload.is_object() {
        return Err(ApiError::InvalidRequest("body must be a JSON object".into()));
    }
    collection.validate(payload).map_err(ApiError::InvalidRequest)
}

/// Handler for GET /tenants/:tenant/:kind
pub async fn list_handler(
    State(state): State<AppState>,
    Path((tenant, kind)): Path<(String, String)>,
) -> ApiResult<Json<ListResponse>> {
    let collection = state.collection(&kind)?;
    let tenant = TenantId::new(tenant);
    let items = collection.list_json(&tenant).await?;

    Ok(Json(ListResponse::new(tenant, collection.kind(), items)))
}

/// Handler for POST /tenants/:tenant/:kind
///
/// Returns the server-confirmed item, including its assigned id.
pub async fn create_handler(
    State(state): State<AppState>,
    Path((tenant, kind)): Path<(String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<(StatusCode, Json<Value>)> {
    let collection = state.collection(&kind)?;
    require_object(collection, &payload)?;

    let created = collection.create_json(&TenantId::new(tenant), payload).await?;
    Ok((StatusCode::CREATED, Json(created)))
}

/// Handler for PUT /tenants/:tenant/:kind/:id
pub async fn update_handler(
    State(state): State<AppState>,
    Path((tenant, kind, id)): Path<(String, String, String)>,
    Json(payload): Json<Value>,
) -> ApiResult<Json<Value>> {
    let collection = state.collection(&kind)?;
    require_object(collection, &payload)?;

    let updated = collection
        .update_json(&TenantId::new(tenant), &id, payload)
        .await?;
    Ok(Json(updated))
}

/// Handler for DELETE /tenants/:tenant/:kind/:id
pub async fn delete_handler(
    State(state): State<AppState>,
    Path((tenant, kind, id)): Path<(String, String, String)>,
) -> ApiResult<Json<DeleteResponse>> {
    let collection = state.collection(&kind)?;
    let deleted = collection.delete_json(&TenantId::new(tenant), &id).await?;

    Ok(Json(DeleteResponse::new(id, deleted)))
}

/// Handler for POST /tenants/:tenant/:kind/invalidate
pub async fn invalidate_handler(
    State(state): State<AppState>,
    Path((tenant, kind)): Path<(String, String)>,
) -> ApiResult<Json<MessageResponse>> {
    let collection = state.collection(&kind)?;
    let tenant = TenantId::new(tenant);
    collection.invalidate(&tenant);

    Ok(Json(MessageResponse::new(format!(
        "Invalidated {} for tenant '{}'",
        collection.kind(),
        tenant
    ))))
}

/// Handler for DELETE /tenants/:tenant/cache
///
/// Evicts every cached collection of the tenant, as on logout.
pub async fn clear_tenant_handler(
    State(state): State<AppState>,
    Path(tenant): Path<String>,
) -> Json<MessageResponse> {
    let tenant = TenantId::new(tenant);
    state.engine.clear_tenant(&tenant);

    Json(MessageResponse::new(format!(
        "Cleared cache for tenant '{}'",
        tenant
    )))
}

/// Handler for GET /stats
pub async fn stats_handler(State(state): State<AppState>) -> Json<StatsResponse> {
    Json(StatsResponse::new(state.engine.stats()))
}

/// Handler for GET /health
///
/// Reports the remote connection state; `reset_required` is set once the
/// connection has been reported corrupted.
pub async fn health_handler(State(state): State<AppState>) -> Json<HealthResponse> {
    Json(HealthResponse::from_state(state.engine.health().state()))
}
