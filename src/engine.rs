//! Sync Engine
//!
//! Wires one [`CollectionService`] per entity kind around a shared remote
//! store, persistence backend and connection monitor. Constructed once per
//! process.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::info;

use crate::cache::{CacheStats, Persistence};
use crate::config::Config;
use crate::error::Result;
use crate::health::ConnectionHealthMonitor;
use crate::kind::{CollectionKind, TenantId};
use crate::models::{Category, Entity, MenuItem, StaffMember, Table};
use crate::remote::RemoteStore;
use crate::service::{CollectionService, ServiceContext};

// == Dynamic Collection ==
/// JSON view of a collection service, for callers that pick the kind at
/// runtime.
#[async_trait]
pub trait DynCollection: Send + Sync {
    fn kind(&self) -> CollectionKind;

    /// Checks that `payload` decodes into the kind's entity type.
    fn validate(&self, payload: &Value) -> std::result::Result<(), String>;

    async fn list_json(&self, tenant: &TenantId) -> Result<Vec<Value>>;

    async fn create_json(&self, tenant: &TenantId, payload: Value) -> Result<Value>;

    /// Updates the item `id`; an `"id"` field in the payload is overridden.
    async fn update_json(&self, tenant: &TenantId, id: &str, payload: Value) -> Result<Value>;

    async fn delete_json(&self, tenant: &TenantId, id: &str) -> Result<Value>;

    fn invalidate(&self, tenant: &TenantId);

    fn stats(&self) -> CacheStats;
}

#[async_trait]
impl<T: Entity> DynCollection for CollectionService<T> {
    fn kind(&self) -> CollectionKind {
        T::KIND
    }

    fn validate(&self, payload: &Value) -> std::result::Result<(), String> {
        serde_json::from_value::<T>(payload.clone())
            .map(|_| ())
            .map_err(|err| err.to_string())
    }

    async fn list_json(&self, tenant: &TenantId) -> Result<Vec<Value>> {
        let items = self.list(tenant).await?;
        let documents = items
            .iter()
            .map(serde_json::to_value)
            .collect::<std::result::Result<Vec<Value>, _>>()?;
        Ok(documents)
    }

    async fn create_json(&self, tenant: &TenantId, payload: Value) -> Result<Value> {
        let item: T = serde_json::from_value(payload)?;
        let created = self.create(tenant, item).await?;
        Ok(serde_json::to_value(created)?)
    }

    async fn update_json(&self, tenant: &TenantId, id: &str, payload: Value) -> Result<Value> {
        let mut fields = match payload {
            Value::Object(fields) => fields,
            _ => Map::new(),
        };
        fields.insert("id".to_string(), Value::String(id.to_string()));
        let item: T = serde_json::from_value(Value::Object(fields))?;
        let updated = self.update(tenant, item).await?;
        Ok(serde_json::to_value(updated)?)
    }

    async fn delete_json(&self, tenant: &TenantId, id: &str) -> Result<Value> {
        let deleted = self.delete(tenant, id).await?;
        Ok(serde_json::to_value(deleted)?)
    }

    fn invalidate(&self, tenant: &TenantId) {
        CollectionService::invalidate(self, tenant);
    }

    fn stats(&self) -> CacheStats {
        CollectionService::stats(self)
    }
}

// == Sync Engine ==
pub struct SyncEngine {
    tables: CollectionService<Table>,
    menu_items: CollectionService<MenuItem>,
    categories: CollectionService<Category>,
    staff: CollectionService<StaffMember>,
    persistence: Arc<dyn Persistence>,
    health: Arc<ConnectionHealthMonitor>,
}

impl fmt::Debug for SyncEngine {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncEngine")
            .field("persistence", &self.persistence)
            .field("health", &self.health.state())
            .finish()
    }
}

impl SyncEngine {
    /// Creates an engine from configuration with a fresh connection monitor.
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        persistence: Arc<dyn Persistence>,
        config: &Config,
    ) -> Self {
        let ctx = ServiceContext {
            ttls: config.ttl_table(),
            debounce: config.debounce(),
            retry: config.retry_config(),
            ..ServiceContext::new(remote, persistence)
        };
        Self::from_context(&ctx)
    }

    pub fn from_context(ctx: &ServiceContext) -> Self {
        Self {
            tables: CollectionService::new(ctx),
            menu_items: CollectionService::new(ctx),
            categories: CollectionService::new(ctx),
            staff: CollectionService::new(ctx),
            persistence: Arc::clone(&ctx.persistence),
            health: Arc::clone(&ctx.health),
        }
    }

    // == Typed Services ==
    pub fn tables(&self) -> &CollectionService<Table> {
        &self.tables
    }

    pub fn menu_items(&self) -> &CollectionService<MenuItem> {
        &self.menu_items
    }

    pub fn categories(&self) -> &CollectionService<Category> {
        &self.categories
    }

    pub fn staff(&self) -> &CollectionService<StaffMember> {
        &self.staff
    }

    /// The service for `kind`, as JSON.
    pub fn collection(&self, kind: CollectionKind) -> &dyn DynCollection {
        match kind {
            CollectionKind::Tables => &self.tables,
            CollectionKind::MenuItems => &self.menu_items,
            CollectionKind::Categories => &self.categories,
            CollectionKind::Staff => &self.staff,
        }
    }

    pub fn health(&self) -> &Arc<ConnectionHealthMonitor> {
        &self.health
    }

    // == Tenant Lifecycle ==
    /// Evicts every cached collection of the tenant (logout, tenant switch).
    ///
    /// Each kind is cleared through its own store, so fetches still in flight
    /// for the tenant are discarded when they return.
    pub fn clear_tenant(&self, tenant: &TenantId) {
        self.tables.evict(tenant);
        self.menu_items.evict(tenant);
        self.categories.evict(tenant);
        self.staff.evict(tenant);
        info!("Cleared all cached collections for tenant {}", tenant);
    }

    // == Statistics ==
    /// Read counters per kind, in [`CollectionKind::ALL`] order.
    pub fn stats(&self) -> Vec<(CollectionKind, CacheStats)> {
        CollectionKind::ALL
            .into_iter()
            .map(|kind| (kind, self.collection(kind).stats()))
            .collect()
    }

    pub fn total_stats(&self) -> CacheStats {
        self.stats()
            .iter()
            .fold(CacheStats::new(), |mut total, (_, stats)| {
                total.merge(stats);
                total
            })
    }

    /// Closes every push channel.
    pub fn shutdown(&self) {
        self.tables.shutdown();
        self.menu_items.shutdown();
        self.categories.shutdown();
        self.staff.shutdown();
        info!("Sync engine shut down");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPersistence;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn engine() -> (SyncEngine, Arc<MemoryRemote>) {
        let remote = Arc::new(MemoryRemote::new());
        let engine = SyncEngine::new(
            remote.clone(),
            Arc::new(MemoryPersistence::new()),
            &Config::default(),
        );
        (engine, remote)
    }

    #[tokio::test]
    async fn test_collection_dispatch() {
        let (engine, _) = engine();
        for kind in CollectionKind::ALL {
            assert_eq!(engine.collection(kind).kind(), kind);
        }
    }

    #[tokio::test]
    async fn test_clear_tenant_evicts_every_kind() {
        let (engine, _) = engine();
        let tenant = TenantId::new("r1");
        engine.tables().list(&tenant).await.unwrap();
        engine.menu_items().list(&tenant).await.unwrap();

        engine.clear_tenant(&tenant);

        assert!(engine.tables().cached(&tenant).is_none());
        assert!(engine.menu_items().cached(&tenant).is_none());
    }

    #[tokio::test]
    async fn test_clear_tenant_leaves_other_tenants() {
        let (engine, _) = engine();
        let r1 = TenantId::new("r1");
        let r2 = TenantId::new("r2");
        engine.tables().list(&r1).await.unwrap();
        engine.tables().list(&r2).await.unwrap();

        engine.clear_tenant(&r1);

        assert!(engine.tables().cached(&r1).is_none());
        assert!(engine.tables().cached(&r2).is_some());
    }

    #[tokio::test]
    async fn test_clear_tenant_discards_fetch_in_flight() {
        let (engine, remote) = engine();
        let tenant = TenantId::new("r1");
        remote.seed(
            &tenant,
            CollectionKind::Tables,
            vec![json!({"id": "t1", "number": "1", "area": "main"})],
        );
        let hold = remote.hold_next_fetch();

        let logout = async {
            hold.reached().await;
            engine.clear_tenant(&tenant);
            hold.release();
        };
        let (listed, _) = tokio::join!(engine.tables().list(&tenant), logout);

        assert_eq!(listed.unwrap().len(), 1);
        assert!(engine.tables().cached(&tenant).is_none());
    }

    #[tokio::test]
    async fn test_json_create_and_update() {
        let (engine, _) = engine();
        let tenant = TenantId::new("r1");
        let tables = engine.collection(CollectionKind::Tables);

        let created = tables
            .create_json(&tenant, json!({"number": "5", "area": "main"}))
            .await
            .unwrap();
        let id = created["id"].as_str().unwrap().to_string();

        let updated = tables
            .update_json(&tenant, &id, json!({"number": "6", "area": "main"}))
            .await
            .unwrap();
        assert_eq!(updated["id"], json!(id));
        assert_eq!(updated["number"], json!("6"));
    }

    #[tokio::test]
    async fn test_validate_rejects_wrong_shape() {
        let (engine, _) = engine();
        let tables = engine.collection(CollectionKind::Tables);
        assert!(tables.validate(&json!({"area": "main"})).is_err());
        assert!(tables.validate(&json!({"number": "1"})).is_ok());
    }

    #[tokio::test]
    async fn test_total_stats_merges_kinds() {
        let (engine, _) = engine();
        let tenant = TenantId::new("r1");
        engine.tables().list(&tenant).await.unwrap();
        engine.staff().list(&tenant).await.unwrap();
        engine.staff().list(&tenant).await.unwrap();

        let total = engine.total_stats();
        assert_eq!(total.misses, 2);
        assert_eq!(total.hits, 1);
    }
}
