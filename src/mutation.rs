//! Mutation Coordinator Module
//!
//! Writes go to the remote store first and reach the cache only once the
//! remote has confirmed them. A failed write leaves the cache untouched.

use std::fmt;
use std::sync::Arc;

use serde_json::json;
use tracing::{debug, info};

use crate::cache::CacheStore;
use crate::error::{Result, SyncError};
use crate::health::ConnectionHealthMonitor;
use crate::kind::TenantId;
use crate::models::Entity;
use crate::remote::{Document, RemoteStore, WriteOp};

// == Mutation Coordinator ==
/// Create/update/delete for one entity kind.
///
/// Writes are not retried: a transient failure is returned to the caller, who
/// still holds the payload and can resubmit.
pub struct MutationCoordinator<T> {
    remote: Arc<dyn RemoteStore>,
    cache: CacheStore<T>,
    health: Arc<ConnectionHealthMonitor>,
}

impl<T> Clone for MutationCoordinator<T> {
    fn clone(&self) -> Self {
        Self {
            remote: Arc::clone(&self.remote),
            cache: self.cache.clone(),
            health: Arc::clone(&self.health),
        }
    }
}

impl<T> fmt::Debug for MutationCoordinator<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MutationCoordinator")
            .field("cache", &self.cache)
            .finish()
    }
}

impl<T: Entity> MutationCoordinator<T> {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: CacheStore<T>,
        health: Arc<ConnectionHealthMonitor>,
    ) -> Self {
        Self {
            remote,
            cache,
            health,
        }
    }

    // == Create ==
    /// Creates `item` remotely and returns it with the server-assigned id and
    /// timestamps. The cached entry, if the collection has been fetched,
    /// contains the item before this returns.
    pub async fn create(&self, tenant: &TenantId, item: T) -> Result<T> {
        let payload = serde_json::to_value(&item)?;
        let confirmed = self.write(tenant, WriteOp::Create, payload).await?;
        self.cache.upsert_one(tenant, confirmed.clone());
        info!("Created {} {} for tenant {}", T::KIND, confirmed.id(), tenant);
        Ok(confirmed)
    }

    // == Update ==
    pub async fn update(&self, tenant: &TenantId, item: T) -> Result<T> {
        if item.id().is_empty() {
            return Err(SyncError::NotFound(format!("{} update without an id", T::KIND)));
        }
        let payload = serde_json::to_value(&item)?;
        let confirmed = self.write(tenant, WriteOp::Update, payload).await?;
        self.cache.upsert_one(tenant, confirmed.clone());
        info!("Updated {} {} for tenant {}", T::KIND, confirmed.id(), tenant);
        Ok(confirmed)
    }

    // == Delete ==
    /// Deletes the item and returns its last server-side representation.
    pub async fn delete(&self, tenant: &TenantId, id: &str) -> Result<T> {
        let confirmed = self.write(tenant, WriteOp::Delete, json!({ "id": id })).await?;
        self.cache.remove_one(tenant, id);
        info!("Deleted {} {} for tenant {}", T::KIND, id, tenant);
        Ok(confirmed)
    }

    async fn write(&self, tenant: &TenantId, op: WriteOp, payload: Document) -> Result<T> {
        debug!("Remote {:?} on {}/{}", op, tenant, T::KIND);
        let document = self
            .health
            .call("write", self.remote.write_item(tenant, T::KIND, op, payload))
            .await?;
        Ok(serde_json::from_value(document)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::{current_timestamp_ms, MemoryPersistence};
    use crate::error::{RemoteError, RemoteErrorCode};
    use crate::kind::TtlTable;
    use crate::models::Table;
    use crate::remote::MemoryRemote;

    struct Fixture {
        remote: Arc<MemoryRemote>,
        cache: CacheStore<Table>,
        health: Arc<ConnectionHealthMonitor>,
        mutations: MutationCoordinator<Table>,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let cache = CacheStore::new(Arc::new(MemoryPersistence::new()), TtlTable::new());
        let health = Arc::new(ConnectionHealthMonitor::new());
        let mutations = MutationCoordinator::new(remote.clone(), cache.clone(), health.clone());
        Fixture {
            remote,
            cache,
            health,
            mutations,
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("r1")
    }

    #[tokio::test]
    async fn test_create_returns_server_fields() {
        let f = fixture();
        let created = f.mutations.create(&tenant(), Table::new("5", "main")).await.unwrap();

        assert!(!created.id.is_empty());
        assert!(created.updated_at.is_some());
        assert_eq!(created.number, "5");
    }

    #[tokio::test]
    async fn test_create_visible_in_cache_before_return() {
        let f = fixture();
        f.cache.put(&tenant(), vec![], current_timestamp_ms());

        let created = f.mutations.create(&tenant(), Table::new("5", "main")).await.unwrap();

        let entry = f.cache.get(&tenant()).unwrap();
        assert!(entry.contains(&created.id));
    }

    #[tokio::test]
    async fn test_create_does_not_fake_a_fetch() {
        let f = fixture();
        f.mutations.create(&tenant(), Table::new("5", "main")).await.unwrap();
        assert!(f.cache.get(&tenant()).is_none());
    }

    #[tokio::test]
    async fn test_failed_write_leaves_cache_untouched() {
        let f = fixture();
        f.cache.put(&tenant(), vec![], current_timestamp_ms());
        f.remote.fail_next_write(RemoteError::unavailable("offline"));

        let result = f.mutations.create(&tenant(), Table::new("5", "main")).await;

        assert!(matches!(result, Err(SyncError::Transient(_))));
        assert!(f.cache.get(&tenant()).unwrap().is_empty());
        assert_eq!(f.remote.write_count(), 1);
    }

    #[tokio::test]
    async fn test_update_replaces_cached_item() {
        let f = fixture();
        f.cache.put(&tenant(), vec![], current_timestamp_ms());
        let mut table = f.mutations.create(&tenant(), Table::new("5", "main")).await.unwrap();

        table.capacity = 8;
        f.mutations.update(&tenant(), table.clone()).await.unwrap();

        let entry = f.cache.get(&tenant()).unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.get(&table.id).unwrap().capacity, 8);
    }

    #[tokio::test]
    async fn test_update_without_id_is_rejected_locally() {
        let f = fixture();
        let result = f.mutations.update(&tenant(), Table::new("5", "main")).await;

        assert!(matches!(result, Err(SyncError::NotFound(_))));
        assert_eq!(f.remote.write_count(), 0);
    }

    #[tokio::test]
    async fn test_update_missing_document_is_not_found() {
        let f = fixture();
        let table = Table {
            id: "ghost".into(),
            ..Table::new("1", "main")
        };
        let result = f.mutations.update(&tenant(), table).await;
        assert!(matches!(result, Err(SyncError::NotFound(_))));
    }

    #[tokio::test]
    async fn test_delete_removes_from_cache() {
        let f = fixture();
        f.cache.put(&tenant(), vec![], current_timestamp_ms());
        let created = f.mutations.create(&tenant(), Table::new("5", "main")).await.unwrap();

        let deleted = f.mutations.delete(&tenant(), &created.id).await.unwrap();

        assert_eq!(deleted.id, created.id);
        assert!(f.cache.get(&tenant()).unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_permission_denied_passes_through() {
        let f = fixture();
        f.remote.fail_next_write(RemoteError::new(
            RemoteErrorCode::PermissionDenied,
            "missing role",
        ));
        let result = f.mutations.create(&tenant(), Table::new("5", "main")).await;
        assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
    }

    #[tokio::test]
    async fn test_corrupted_connection_skips_remote() {
        let f = fixture();
        f.health.report_corrupted("test");

        let result = f.mutations.create(&tenant(), Table::new("5", "main")).await;

        assert!(matches!(result, Err(SyncError::Corrupted(_))));
        assert_eq!(f.remote.write_count(), 0);
    }
}
