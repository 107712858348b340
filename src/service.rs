//! Collection Service Module
//!
//! The read/write/subscribe surface collaborators call for one entity kind.
//! Reads are answered from the cache while fresh, and fall back to a remote
//! fetch otherwise.

use std::fmt;
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_ms, CacheEntry, CacheStats, CacheStore, Persistence};
use crate::error::{Result, SyncError};
use crate::health::ConnectionHealthMonitor;
use crate::kind::{CollectionKind, TenantId, TtlTable};
use crate::models::Entity;
use crate::mutation::MutationCoordinator;
use crate::remote::{decode_documents, RemoteStore};
use crate::retry::{retry_transient, RetryConfig};
use crate::staleness::StalenessPolicy;
use crate::sync::{Subscription, SubscriptionEvent, SyncSubscriptions};

// == Service Context ==
/// Shared collaborators every collection service is built from.
#[derive(Clone)]
pub struct ServiceContext {
    pub remote: Arc<dyn RemoteStore>,
    pub persistence: Arc<dyn Persistence>,
    pub health: Arc<ConnectionHealthMonitor>,
    pub ttls: TtlTable,
    /// Open/close debounce window for push channels
    pub debounce: Duration,
    pub retry: RetryConfig,
}

impl ServiceContext {
    pub fn new(remote: Arc<dyn RemoteStore>, persistence: Arc<dyn Persistence>) -> Self {
        Self {
            remote,
            persistence,
            health: Arc::new(ConnectionHealthMonitor::new()),
            ttls: TtlTable::new(),
            debounce: Duration::from_millis(50),
            retry: RetryConfig::default(),
        }
    }
}

impl fmt::Debug for ServiceContext {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("ServiceContext")
            .field("persistence", &self.persistence)
            .field("ttls", &self.ttls)
            .field("debounce", &self.debounce)
            .field("retry", &self.retry)
            .finish()
    }
}

// == Collection Service ==
pub struct CollectionService<T> {
    cache: CacheStore<T>,
    policy: StalenessPolicy,
    remote: Arc<dyn RemoteStore>,
    health: Arc<ConnectionHealthMonitor>,
    retry: RetryConfig,
    mutations: MutationCoordinator<T>,
    subscriptions: SyncSubscriptions<T>,
    stats: Mutex<CacheStats>,
}

impl<T> fmt::Debug for CollectionService<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CollectionService")
            .field("cache", &self.cache)
            .field("retry", &self.retry)
            .finish()
    }
}

impl<T: Entity> CollectionService<T> {
    pub fn new(ctx: &ServiceContext) -> Self {
        let cache = CacheStore::new(Arc::clone(&ctx.persistence), ctx.ttls.clone());
        let policy = StalenessPolicy::new(Arc::clone(&ctx.health));
        let mutations =
            MutationCoordinator::new(Arc::clone(&ctx.remote), cache.clone(), Arc::clone(&ctx.health));
        let subscriptions = SyncSubscriptions::new(
            Arc::clone(&ctx.remote),
            cache.clone(),
            policy.clone(),
            Arc::clone(&ctx.health),
            ctx.debounce,
            ctx.retry.clone(),
        );

        Self {
            cache,
            policy,
            remote: Arc::clone(&ctx.remote),
            health: Arc::clone(&ctx.health),
            retry: ctx.retry.clone(),
            mutations,
            subscriptions,
            stats: Mutex::new(CacheStats::new()),
        }
    }

    pub fn kind(&self) -> CollectionKind {
        T::KIND
    }

    // == List ==
    /// Returns the tenant's collection in the kind's order.
    ///
    /// A fresh entry is served without touching the remote. Otherwise the
    /// collection is fetched, retrying transient failures; if every attempt
    /// fails transiently and an older entry exists, that entry is served.
    pub async fn list(&self, tenant: &TenantId) -> Result<Vec<T>> {
        let cached = self.cache.get(tenant);
        if self.policy.is_fresh(cached.as_ref()) {
            self.record(CacheStats::record_hit);
            debug!("Cache hit for {}/{}", tenant, T::KIND);
            return Ok(cached.map(|entry| entry.items).unwrap_or_default());
        }

        if cached.is_some() {
            self.record(CacheStats::record_stale);
        } else {
            self.record(CacheStats::record_miss);
        }
        self.health.ensure_available()?;

        let generation = self.cache.generation(tenant);
        let fetched = retry_transient("fetch_collection", &self.retry, move || {
            self.fetch_once(tenant)
        })
        .await;

        match fetched {
            Ok(items) => {
                let now = current_timestamp_ms();
                let entry = CacheEntry::new(items, now, self.cache.ttl_ms());
                if self
                    .cache
                    .put_if_unchanged(tenant, entry.items.clone(), now, generation)
                {
                    return Ok(entry.items);
                }
                debug!(
                    "{} cache for {} changed during fetch, discarding fetched copy",
                    T::KIND,
                    tenant
                );
                Ok(self
                    .cache
                    .get(tenant)
                    .map(|current| current.items)
                    .unwrap_or(entry.items))
            }
            Err(err) if err.is_transient() => match cached {
                Some(entry) if !self.health.is_corrupted() => {
                    warn!(
                        "Serving stale {} for {} (fetched at {}): {}",
                        T::KIND,
                        tenant,
                        entry.fetched_at,
                        err
                    );
                    self.record(CacheStats::record_stale_served);
                    Ok(entry.items)
                }
                _ => Err(err),
            },
            Err(err) => Err(err),
        }
    }

    /// One fetch attempt: the ordered query, or an unsorted read while the
    /// remote index is still building.
    async fn fetch_once(&self, tenant: &TenantId) -> Result<Vec<T>> {
        self.record(CacheStats::record_remote_fetch);
        let ordered = self
            .health
            .call("fetch_collection", self.remote.fetch_collection(tenant, T::KIND, true))
            .await;

        let documents = match ordered {
            Ok(documents) => documents,
            Err(SyncError::NotReady(reason)) => {
                warn!(
                    "Ordered {} query not ready ({}), falling back to unsorted read",
                    T::KIND,
                    reason
                );
                self.record(CacheStats::record_unsorted_fallback);
                self.record(CacheStats::record_remote_fetch);
                self.health
                    .call("fetch_collection", self.remote.fetch_collection(tenant, T::KIND, false))
                    .await?
            }
            Err(err) => return Err(err),
        };

        Ok(decode_documents(documents))
    }

    // == Writes ==
    pub async fn create(&self, tenant: &TenantId, item: T) -> Result<T> {
        self.mutations.create(tenant, item).await
    }

    pub async fn update(&self, tenant: &TenantId, item: T) -> Result<T> {
        self.mutations.update(tenant, item).await
    }

    pub async fn delete(&self, tenant: &TenantId, id: &str) -> Result<T> {
        self.mutations.delete(tenant, id).await
    }

    // == Subscribe ==
    /// Registers a live reader. The returned guard unsubscribes when dropped.
    pub fn subscribe<F>(&self, tenant: &TenantId, callback: F) -> Result<Subscription<T>>
    where
        F: Fn(SubscriptionEvent<T>) + Send + Sync + 'static,
    {
        self.subscriptions.subscribe(tenant, callback)
    }

    pub fn subscriptions(&self) -> &SyncSubscriptions<T> {
        &self.subscriptions
    }

    // == Invalidate ==
    /// Drops the cached entry so the next read goes to the remote.
    pub fn invalidate(&self, tenant: &TenantId) {
        self.evict(tenant);
        info!("Invalidated {} cache for tenant {}", T::KIND, tenant);
    }

    /// Drops the cached entry without logging at info level.
    pub(crate) fn evict(&self, tenant: &TenantId) {
        self.cache.clear(tenant);
    }

    /// The cached entry as it stands, fresh or not.
    pub fn cached(&self, tenant: &TenantId) -> Option<CacheEntry<T>> {
        self.cache.get(tenant)
    }

    pub fn stats(&self) -> CacheStats {
        self.stats
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .clone()
    }

    /// Closes every push channel of this kind.
    pub fn shutdown(&self) {
        self.subscriptions.close_all();
    }

    fn record(&self, update: impl FnOnce(&mut CacheStats)) {
        update(&mut self.stats.lock().unwrap_or_else(PoisonError::into_inner));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPersistence;
    use crate::error::{RemoteError, RemoteErrorCode};
    use crate::health::ConnectionState;
    use crate::models::Table;
    use crate::remote::MemoryRemote;
    use serde_json::json;

    fn tenant() -> TenantId {
        TenantId::new("r1")
    }

    fn fast_retry() -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(4),
            ..RetryConfig::default()
        }
    }

    fn service(remote: Arc<dyn RemoteStore>) -> (CollectionService<Table>, ServiceContext) {
        let ctx = ServiceContext {
            retry: fast_retry(),
            ..ServiceContext::new(remote, Arc::new(MemoryPersistence::new()))
        };
        (CollectionService::new(&ctx), ctx)
    }

    fn seeded_remote() -> Arc<MemoryRemote> {
        let remote = Arc::new(MemoryRemote::new());
        remote.seed(
            &tenant(),
            CollectionKind::Tables,
            vec![
                json!({"id": "t3", "number": "10", "area": "main"}),
                json!({"id": "t1", "number": "1", "area": "terrace"}),
                json!({"id": "t2", "number": "2", "area": "main"}),
            ],
        );
        remote
    }

    fn ids(tables: &[Table]) -> Vec<&str> {
        tables.iter().map(|t| t.id.as_str()).collect()
    }

    #[tokio::test]
    async fn test_miss_fetches_and_sorts() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());

        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(ids(&tables), vec!["t2", "t3", "t1"]);
        assert_eq!(remote.fetch_count(), 1);
        assert_eq!(svc.stats().misses, 1);
    }

    #[tokio::test]
    async fn test_fresh_entry_skips_remote() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());

        svc.list(&tenant()).await.unwrap();
        svc.list(&tenant()).await.unwrap();

        assert_eq!(remote.fetch_count(), 1);
        assert_eq!(svc.stats().hits, 1);
    }

    #[tokio::test]
    async fn test_empty_collection_is_cached() {
        let remote = Arc::new(MemoryRemote::new());
        let (svc, _) = service(remote.clone());

        assert!(svc.list(&tenant()).await.unwrap().is_empty());
        assert!(svc.list(&tenant()).await.unwrap().is_empty());
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_stale_entry_refetches() {
        let remote = seeded_remote();
        let (svc, ctx) = service(remote.clone());
        let cache = CacheStore::<Table>::new(ctx.persistence.clone(), ctx.ttls.clone());
        cache.put(&tenant(), vec![Table::new("99", "old")], 0);

        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(tables.len(), 3);
        assert_eq!(svc.stats().stale, 1);
    }

    #[tokio::test]
    async fn test_transient_failure_serves_stale() {
        let remote = seeded_remote();
        let (svc, ctx) = service(remote.clone());
        let cache = CacheStore::<Table>::new(ctx.persistence.clone(), ctx.ttls.clone());
        let old = Table {
            id: "old".into(),
            ..Table::new("99", "old")
        };
        cache.put(&tenant(), vec![old], 0);
        for _ in 0..3 {
            remote.fail_next_fetch(RemoteError::unavailable("offline"));
        }

        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(ids(&tables), vec!["old"]);
        assert_eq!(svc.stats().stale_served, 1);
        assert_eq!(ctx.health.state(), ConnectionState::Degraded(3));
    }

    #[tokio::test]
    async fn test_transient_failure_without_cache_errors() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        for _ in 0..3 {
            remote.fail_next_fetch(RemoteError::unavailable("offline"));
        }

        let result = svc.list(&tenant()).await;
        assert!(matches!(result, Err(SyncError::Transient(_))));
    }

    #[tokio::test]
    async fn test_retry_recovers_within_attempts() {
        let remote = seeded_remote();
        let (svc, ctx) = service(remote.clone());
        remote.fail_next_fetch(RemoteError::unavailable("blip"));

        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(tables.len(), 3);
        assert_eq!(remote.fetch_count(), 2);
        assert_eq!(ctx.health.state(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_index_building_falls_back_to_unsorted() {
        let remote = seeded_remote();
        remote.set_index_building(true);
        let (svc, ctx) = service(remote.clone());

        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(ids(&tables), vec!["t2", "t3", "t1"]);
        assert_eq!(svc.stats().unsorted_fallbacks, 1);
        assert_eq!(ctx.health.state(), ConnectionState::Healthy);
    }

    #[tokio::test]
    async fn test_permission_denied_is_not_retried() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        remote.fail_next_fetch(RemoteError::new(RemoteErrorCode::PermissionDenied, "nope"));

        let result = svc.list(&tenant()).await;

        assert!(matches!(result, Err(SyncError::PermissionDenied(_))));
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_corrupted_refuses_reads() {
        let remote = seeded_remote();
        let (svc, ctx) = service(remote.clone());
        svc.list(&tenant()).await.unwrap();

        ctx.health.report_corrupted("test");
        let result = svc.list(&tenant()).await;

        assert!(matches!(result, Err(SyncError::Corrupted(_))));
        assert_eq!(remote.fetch_count(), 1);
    }

    #[tokio::test]
    async fn test_internal_assertion_during_fetch_corrupts() {
        let remote = seeded_remote();
        let (svc, ctx) = service(remote.clone());
        remote.fail_next_fetch(RemoteError::internal_assertion("ID: ca9"));

        let result = svc.list(&tenant()).await;

        assert!(matches!(result, Err(SyncError::Corrupted(_))));
        assert!(ctx.health.is_corrupted());
        assert_eq!(ctx.health.recovery_prompts(), 1);
    }

    #[tokio::test]
    async fn test_invalidate_forces_refetch() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        svc.list(&tenant()).await.unwrap();

        svc.invalidate(&tenant());
        assert!(svc.cached(&tenant()).is_none());

        svc.list(&tenant()).await.unwrap();
        assert_eq!(remote.fetch_count(), 2);
    }

    #[tokio::test]
    async fn test_create_then_list_without_refetch() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        svc.list(&tenant()).await.unwrap();

        let created = svc.create(&tenant(), Table::new("5", "main")).await.unwrap();
        let tables = svc.list(&tenant()).await.unwrap();

        assert_eq!(tables.len(), 4);
        assert!(tables.iter().any(|t| t.id == created.id));
        assert_eq!(remote.fetch_count(), 1);
    }

    fn stale_entry(svc: &CollectionService<Table>) {
        let old = Table {
            id: "old".into(),
            ..Table::new("99", "old")
        };
        svc.cache.put(&tenant(), vec![old], 0);
    }

    #[tokio::test]
    async fn test_write_during_fetch_survives_the_fetch() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        stale_entry(&svc);
        let hold = remote.hold_next_fetch();

        let writer = async {
            hold.reached().await;
            let created = svc.create(&tenant(), Table::new("5", "main")).await.unwrap();
            hold.release();
            created
        };
        let t = tenant();
        let (listed, created) = tokio::join!(svc.list(&t), writer);

        assert!(ids(&listed.unwrap()).contains(&created.id.as_str()));
        let cached = svc.cached(&tenant()).unwrap();
        assert!(cached.contains(&created.id));
        assert!(cached.contains("old"));

        let tables = svc.list(&tenant()).await.unwrap();
        assert!(tables.iter().any(|t| t.id == created.id));
    }

    #[tokio::test]
    async fn test_write_during_cold_fetch_is_not_lost() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        let hold = remote.hold_next_fetch();

        let writer = async {
            hold.reached().await;
            let created = svc.create(&tenant(), Table::new("5", "main")).await.unwrap();
            hold.release();
            created
        };
        let t = tenant();
        let (listed, created) = tokio::join!(svc.list(&t), writer);

        assert_eq!(listed.unwrap().len(), 3);
        assert!(svc.cached(&tenant()).is_none());

        let tables = svc.list(&tenant()).await.unwrap();
        assert_eq!(tables.len(), 4);
        assert!(tables.iter().any(|t| t.id == created.id));
    }

    #[tokio::test]
    async fn test_delete_during_fetch_survives_the_fetch() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        svc.cache.put(
            &tenant(),
            vec![Table {
                id: "t1".into(),
                ..Table::new("1", "terrace")
            }],
            0,
        );
        let hold = remote.hold_next_fetch();

        let writer = async {
            hold.reached().await;
            svc.delete(&tenant(), "t1").await.unwrap();
            hold.release();
        };
        let t = tenant();
        let (listed, _) = tokio::join!(svc.list(&t), writer);

        assert!(!ids(&listed.unwrap()).contains(&"t1"));
        assert!(!svc.cached(&tenant()).unwrap().contains("t1"));
    }

    #[tokio::test]
    async fn test_invalidate_during_fetch_discards_result() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        let hold = remote.hold_next_fetch();

        let clearer = async {
            hold.reached().await;
            svc.invalidate(&tenant());
            hold.release();
        };
        let t = tenant();
        let (listed, _) = tokio::join!(svc.list(&t), clearer);

        assert_eq!(listed.unwrap().len(), 3);
        assert!(svc.cached(&tenant()).is_none());
    }

    #[tokio::test]
    async fn test_snapshot_during_fetch_wins() {
        let remote = seeded_remote();
        let (svc, _) = service(remote.clone());
        let hold = remote.hold_next_fetch();
        let pushed = Table {
            id: "pushed".into(),
            ..Table::new("1", "main")
        };

        let pusher = async {
            hold.reached().await;
            svc.cache.put(&tenant(), vec![pushed.clone()], current_timestamp_ms());
            hold.release();
        };
        let t = tenant();
        let (listed, _) = tokio::join!(svc.list(&t), pusher);

        assert_eq!(ids(&listed.unwrap()), vec!["pushed"]);
        assert_eq!(ids(&svc.cached(&tenant()).unwrap().items), vec!["pushed"]);
    }
}
