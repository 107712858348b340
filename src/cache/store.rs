//! Cache Store Module
//!
//! Per-tenant collection snapshots for one entity kind, kept in a pluggable
//! [`Persistence`] backend.

use std::collections::HashMap;
use std::fmt;
use std::marker::PhantomData;
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use tracing::{debug, warn};

use crate::cache::persistence::{expiry_key, items_key, version_key, Persistence};
use crate::cache::CacheEntry;
use crate::kind::{CollectionKind, TenantId, TtlTable};
use crate::models::Entity;

/// Schema tag written next to every entry. Entries carrying another tag are
/// treated as absent.
pub const SCHEMA_VERSION: &str = "1";

// == Cache Store ==
/// Typed view over the persisted entries of kind `T::KIND`.
///
/// All operations are synchronous and total. Targeted mutations for the same
/// id are last-write-wins by call order.
///
/// Every change to a tenant's entry advances that tenant's write generation,
/// so a caller that read the generation before a remote fetch can tell
/// whether anything landed while the fetch was in flight.
pub struct CacheStore<T> {
    persistence: Arc<dyn Persistence>,
    ttls: TtlTable,
    /// Write generation per tenant. The lock also serializes every record
    /// read and write across clones.
    generations: Arc<Mutex<HashMap<TenantId, u64>>>,
    _marker: PhantomData<fn() -> T>,
}

type Generations<'a> = MutexGuard<'a, HashMap<TenantId, u64>>;

impl<T> Clone for CacheStore<T> {
    fn clone(&self) -> Self {
        Self {
            persistence: Arc::clone(&self.persistence),
            ttls: self.ttls.clone(),
            generations: Arc::clone(&self.generations),
            _marker: PhantomData,
        }
    }
}

impl<T> fmt::Debug for CacheStore<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("CacheStore")
            .field("persistence", &self.persistence)
            .field("ttls", &self.ttls)
            .finish()
    }
}

impl<T: Entity> CacheStore<T> {
    // == Constructor ==
    pub fn new(persistence: Arc<dyn Persistence>, ttls: TtlTable) -> Self {
        Self {
            persistence,
            ttls,
            generations: Arc::new(Mutex::new(HashMap::new())),
            _marker: PhantomData,
        }
    }

    pub fn kind(&self) -> CollectionKind {
        T::KIND
    }

    pub fn ttl_ms(&self) -> u64 {
        self.ttls.ttl_ms(T::KIND)
    }

    fn lock(&self) -> Generations<'_> {
        self.generations
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    // == Generation ==
    /// Current write generation of the tenant's entry.
    pub fn generation(&self, tenant: &TenantId) -> u64 {
        self.lock().get(tenant).copied().unwrap_or(0)
    }

    // == Get ==
    /// Pure lookup. Unreadable or foreign-schema records read as absent.
    pub fn get(&self, tenant: &TenantId) -> Option<CacheEntry<T>> {
        let _guard = self.lock();
        self.read(tenant)
    }

    // == Put ==
    /// Replaces the entry wholesale and recomputes its expiry.
    pub fn put(&self, tenant: &TenantId, items: Vec<T>, fetched_at: u64) {
        let mut generations = self.lock();
        self.replace(&mut generations, tenant, items, fetched_at);
    }

    /// Like [`put`](Self::put), but only while the tenant's generation is
    /// still `seen`. Returns false, leaving the entry alone, when another
    /// write or a clear landed in between.
    pub fn put_if_unchanged(
        &self,
        tenant: &TenantId,
        items: Vec<T>,
        fetched_at: u64,
        seen: u64,
    ) -> bool {
        let mut generations = self.lock();
        if generations.get(tenant).copied().unwrap_or(0) != seen {
            return false;
        }
        self.replace(&mut generations, tenant, items, fetched_at);
        true
    }

    // == Upsert One ==
    /// Inserts or replaces one item in an existing entry.
    ///
    /// Does nothing when the collection has never been fetched, and never
    /// moves the entry's expiry. Returns true when the entry changed.
    pub fn upsert_one(&self, tenant: &TenantId, item: T) -> bool {
        let mut generations = self.lock();
        bump(&mut generations, tenant);
        let Some(mut entry) = self.read(tenant) else {
            debug!("Skipping upsert into unfetched {}/{}", tenant, T::KIND);
            return false;
        };
        entry.upsert(item);
        self.write(tenant, &entry);
        true
    }

    // == Remove One ==
    /// Removes one item from an existing entry. Returns true when it was present.
    pub fn remove_one(&self, tenant: &TenantId, id: &str) -> bool {
        let mut generations = self.lock();
        bump(&mut generations, tenant);
        let Some(mut entry) = self.read(tenant) else {
            return false;
        };
        if !entry.remove(id) {
            return false;
        }
        self.write(tenant, &entry);
        true
    }

    // == Clear ==
    /// Evicts the entry for this kind.
    pub fn clear(&self, tenant: &TenantId) {
        let mut generations = self.lock();
        bump(&mut generations, tenant);
        remove_records(self.persistence.as_ref(), tenant, T::KIND);
        debug!("Cache cleared {}/{}", tenant, T::KIND);
    }

    fn replace(
        &self,
        generations: &mut Generations<'_>,
        tenant: &TenantId,
        items: Vec<T>,
        fetched_at: u64,
    ) {
        bump(generations, tenant);
        let entry = CacheEntry::new(items, fetched_at, self.ttl_ms());
        debug!(
            "Cache put {}/{}: {} items, expires at {}",
            tenant,
            T::KIND,
            entry.len(),
            entry.expires_at
        );
        self.write(tenant, &entry);
    }

    /// Reads the three records. Callers hold the lock.
    fn read(&self, tenant: &TenantId) -> Option<CacheEntry<T>> {
        let kind = T::KIND;

        if let Some(version) = self.persistence.read(&version_key(tenant, kind)) {
            if version != SCHEMA_VERSION {
                warn!(
                    "Ignoring {}/{} cache entry with schema version {}",
                    tenant, kind, version
                );
                return None;
            }
        }

        let raw = self.persistence.read(&items_key(tenant, kind))?;
        let expires_at = match self
            .persistence
            .read(&expiry_key(tenant, kind))
            .and_then(|value| value.trim().parse::<u64>().ok())
        {
            Some(expires_at) => expires_at,
            None => {
                warn!("Cache entry {}/{} has no readable expiry", tenant, kind);
                return None;
            }
        };

        let items: Vec<T> = match serde_json::from_str(&raw) {
            Ok(items) => items,
            Err(err) => {
                warn!("Failed to decode cache entry {}/{}: {}", tenant, kind, err);
                return None;
            }
        };

        let ttl_ms = self.ttl_ms();
        Some(CacheEntry::new(items, expires_at.saturating_sub(ttl_ms), ttl_ms))
    }

    /// Writes the three records. Callers hold the lock.
    fn write(&self, tenant: &TenantId, entry: &CacheEntry<T>) {
        let kind = T::KIND;
        let raw = match serde_json::to_string(&entry.items) {
            Ok(raw) => raw,
            Err(err) => {
                warn!("Failed to encode cache entry {}/{}: {}", tenant, kind, err);
                return;
            }
        };
        self.persistence.write(&items_key(tenant, kind), &raw);
        self.persistence
            .write(&expiry_key(tenant, kind), &entry.expires_at.to_string());
        self.persistence
            .write(&version_key(tenant, kind), SCHEMA_VERSION);
    }
}

fn bump(generations: &mut Generations<'_>, tenant: &TenantId) {
    *generations.entry(tenant.clone()).or_insert(0) += 1;
}

fn remove_records(persistence: &dyn Persistence, tenant: &TenantId, kind: CollectionKind) {
    persistence.remove(&items_key(tenant, kind));
    persistence.remove(&expiry_key(tenant, kind));
    persistence.remove(&version_key(tenant, kind));
}
