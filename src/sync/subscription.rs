//! Sync Subscription Module
//!
//! Keeps at most one push channel open per (tenant, kind) and reconciles the
//! pushed documents into the cache store.
//!
//! # Channel lifecycle
//! `Closed -> Opening -> Open -> Closed`. The first reader schedules the open
//! after a debounce window, and the last reader leaving schedules the close
//! after the same window, so mount/unmount/mount bursts collapse into a
//! single channel.

use std::collections::HashMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;

use serde::Serialize;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::cache::{current_timestamp_ms, CacheStore};
use crate::error::{Result, SyncError};
use crate::health::{ConnectionHealthMonitor, ConnectionState};
use crate::kind::TenantId;
use crate::models::{sort_items, Entity};
use crate::remote::{
    decode_documents, document_id, ChangeType, ChannelEvent, RemoteChannel, RemoteStore,
};
use crate::retry::RetryConfig;
use crate::staleness::StalenessPolicy;
use crate::tasks::DelayedTask;

/// Callback registered by a reader.
pub type Listener<T> = Arc<dyn Fn(SubscriptionEvent<T>) + Send + Sync>;

/// Delivered to readers after every reconciliation or terminal failure.
#[derive(Debug, Clone, PartialEq)]
pub enum SubscriptionEvent<T> {
    /// The collection as cached after applying a push
    Items(Vec<T>),
    /// The channel terminated; no retry will follow
    Error(SyncError),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelPhase {
    Closed,
    Opening,
    Open,
}

// == Subscription Handle ==
/// Owns the single open push channel of a pair. Dropping it stops the pump,
/// which drops the remote channel.
#[derive(Debug)]
pub struct SubscriptionHandle {
    generation: u64,
    pump: Option<JoinHandle<()>>,
}

impl SubscriptionHandle {
    fn new(generation: u64, pump: JoinHandle<()>) -> Self {
        Self {
            generation,
            pump: Some(pump),
        }
    }

    pub fn generation(&self) -> u64 {
        self.generation
    }

    /// Lets the pump finish on its own. Used by the pump itself.
    fn release(mut self) {
        self.pump.take();
    }
}

impl Drop for SubscriptionHandle {
    fn drop(&mut self) {
        if let Some(pump) = self.pump.take() {
            pump.abort();
        }
    }
}

// == Pair State ==
struct PairState<T> {
    phase: ChannelPhase,
    listeners: HashMap<u64, Listener<T>>,
    /// Pending open or close
    timer: Option<DelayedTask>,
    timer_token: u64,
    handle: Option<SubscriptionHandle>,
    /// Identifies the current open attempt; results from older ones are dropped
    generation: u64,
    open_attempts: u32,
    last_error: Option<SyncError>,
}

impl<T> Default for PairState<T> {
    fn default() -> Self {
        Self {
            phase: ChannelPhase::Closed,
            listeners: HashMap::new(),
            timer: None,
            timer_token: 0,
            handle: None,
            generation: 0,
            open_attempts: 0,
            last_error: None,
        }
    }
}

impl<T> PairState<T> {
    fn is_idle(&self) -> bool {
        self.listeners.is_empty()
            && self.phase == ChannelPhase::Closed
            && self.timer.is_none()
            && self.handle.is_none()
    }

    fn listeners(&self) -> Vec<Listener<T>> {
        self.listeners.values().cloned().collect()
    }
}

struct Inner<T> {
    remote: Arc<dyn RemoteStore>,
    cache: CacheStore<T>,
    policy: StalenessPolicy,
    health: Arc<ConnectionHealthMonitor>,
    debounce: Duration,
    retry: RetryConfig,
    pairs: Mutex<HashMap<TenantId, PairState<T>>>,
    next_id: AtomicU64,
}

// == Sync Subscriptions ==
/// Subscription manager for one entity kind.
pub struct SyncSubscriptions<T> {
    inner: Arc<Inner<T>>,
}

impl<T> Clone for SyncSubscriptions<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> fmt::Debug for SyncSubscriptions<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SyncSubscriptions")
            .field("debounce", &self.inner.debounce)
            .finish()
    }
}

impl<T: Entity> SyncSubscriptions<T> {
    pub fn new(
        remote: Arc<dyn RemoteStore>,
        cache: CacheStore<T>,
        policy: StalenessPolicy,
        health: Arc<ConnectionHealthMonitor>,
        debounce: Duration,
        retry: RetryConfig,
    ) -> Self {
        let inner = Arc::new(Inner {
            remote,
            cache,
            policy,
            health,
            debounce,
            retry,
            pairs: Mutex::new(HashMap::new()),
            next_id: AtomicU64::new(1),
        });
        if tokio::runtime::Handle::try_current().is_ok() {
            tokio::spawn(Inner::halt_on_corruption(Arc::downgrade(&inner)));
        }
        Self { inner }
    }

    // == Subscribe ==
    /// Registers a reader for the tenant's collection. Must be called within a
    /// tokio runtime.
    ///
    /// A reader joining an open channel immediately receives the cached items.
    pub fn subscribe<F>(&self, tenant: &TenantId, listener: F) -> Result<Subscription<T>>
    where
        F: Fn(SubscriptionEvent<T>) + Send + Sync + 'static,
    {
        self.inner.health.ensure_available()?;

        let listener: Listener<T> = Arc::new(listener);
        let id = self.inner.next_id.fetch_add(1, Ordering::SeqCst);

        let replay = {
            let mut pairs = self.inner.lock();
            let state = pairs.entry(tenant.clone()).or_default();
            state.listeners.insert(id, Arc::clone(&listener));

            match state.phase {
                ChannelPhase::Closed => {
                    state.phase = ChannelPhase::Opening;
                    state.open_attempts = 0;
                    state.last_error = None;
                    Inner::schedule_open(&self.inner, tenant, state, self.inner.debounce);
                    debug!("Scheduled {} channel open for {}", T::KIND, tenant);
                    false
                }
                ChannelPhase::Opening => false,
                ChannelPhase::Open => {
                    if let Some(timer) = state.timer.take() {
                        timer.cancel();
                        debug!("Reader returned to {}/{}, close cancelled", tenant, T::KIND);
                    }
                    true
                }
            }
        };

        if replay {
            if let Some(entry) = self.inner.cache.get(tenant) {
                listener(SubscriptionEvent::Items(entry.items));
            }
        }

        Ok(Subscription {
            tenant: tenant.clone(),
            id,
            inner: Arc::downgrade(&self.inner),
            active: true,
        })
    }

    // == Introspection ==
    pub fn phase(&self, tenant: &TenantId) -> ChannelPhase {
        self.inner
            .lock()
            .get(tenant)
            .map_or(ChannelPhase::Closed, |state| state.phase)
    }

    pub fn reader_count(&self, tenant: &TenantId) -> usize {
        self.inner
            .lock()
            .get(tenant)
            .map_or(0, |state| state.listeners.len())
    }

    /// Error that terminated the pair's last channel, if any.
    pub fn last_error(&self, tenant: &TenantId) -> Option<SyncError> {
        self.inner
            .lock()
            .get(tenant)
            .and_then(|state| state.last_error.clone())
    }

    /// Tears down every channel immediately, dropping all readers.
    pub fn close_all(&self) {
        let mut pairs = self.inner.lock();
        for (tenant, state) in pairs.iter_mut() {
            if let Some(timer) = state.timer.take() {
                timer.cancel();
            }
            state.listeners.clear();
            Inner::teardown(&self.inner, tenant, state);
        }
        pairs.clear();
    }
}

impl<T: Entity> Inner<T> {
    // == Corruption ==
    /// Waits for the monitor to report corruption, then halts every channel.
    /// Ends at the first state change after the subscriptions are dropped.
    async fn halt_on_corruption(this: Weak<Self>) {
        let mut state = match this.upgrade() {
            Some(inner) => inner.health.watch(),
            None => return,
        };
        loop {
            if *state.borrow_and_update() == ConnectionState::Corrupted {
                if let Some(inner) = this.upgrade() {
                    Inner::halt(&inner);
                }
                return;
            }
            if state.changed().await.is_err() || this.strong_count() == 0 {
                return;
            }
        }
    }

    /// Tears down every pair. Readers still waiting on a channel are told the
    /// connection is corrupted.
    fn halt(this: &Arc<Self>) {
        let mut waiting = Vec::new();
        {
            let mut pairs = this.lock();
            for (tenant, state) in pairs.iter_mut() {
                if let Some(timer) = state.timer.take() {
                    timer.cancel();
                }
                if state.phase != ChannelPhase::Closed {
                    waiting.extend(state.listeners());
                }
                state.listeners.clear();
                Inner::teardown(this, tenant, state);
            }
            pairs.clear();
        }
        if !waiting.is_empty() {
            warn!("Halted {} channels after connection corruption", T::KIND);
        }
        let err = SyncError::Corrupted("remote connection corrupted, channel halted".into());
        notify(&waiting, SubscriptionEvent::Error(err));
    }

    fn lock(&self) -> MutexGuard<'_, HashMap<TenantId, PairState<T>>> {
        self.pairs.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn schedule_open(this: &Arc<Self>, tenant: &TenantId, state: &mut PairState<T>, delay: Duration) {
        let token = this.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(this);
        let tenant = tenant.clone();
        state.timer_token = token;
        state.timer = Some(DelayedTask::schedule(delay, async move {
            Inner::open_channel(inner, tenant, token).await;
        }));
    }

    fn schedule_close(this: &Arc<Self>, tenant: &TenantId, state: &mut PairState<T>) {
        let token = this.next_id.fetch_add(1, Ordering::SeqCst);
        let inner = Arc::clone(this);
        let tenant = tenant.clone();
        state.timer_token = token;
        state.timer = Some(DelayedTask::schedule(this.debounce, async move {
            Inner::close_channel(&inner, &tenant, token);
        }));
    }

    // == Open ==
    async fn open_channel(this: Arc<Self>, tenant: TenantId, token: u64) {
        let generation = {
            let mut pairs = this.lock();
            let Some(state) = pairs.get_mut(&tenant) else {
                return;
            };
            if state.timer_token != token || state.phase != ChannelPhase::Opening {
                return;
            }
            if let Some(timer) = state.timer.take() {
                timer.detach();
            }
            state.generation = this.next_id.fetch_add(1, Ordering::SeqCst);
            state.generation
        };

        let result = this
            .health
            .call("subscribe", this.remote.subscribe(&tenant, T::KIND))
            .await;

        let failure = {
            let mut pairs = this.lock();
            let Some(state) = pairs.get_mut(&tenant) else {
                return;
            };
            if state.generation != generation || state.phase != ChannelPhase::Opening {
                debug!("Discarding superseded {} channel for {}", T::KIND, tenant);
                return;
            }
            if state.listeners.is_empty() {
                state.phase = ChannelPhase::Closed;
                debug!("Readers left {}/{} while opening, dropping channel", tenant, T::KIND);
                if state.is_idle() {
                    pairs.remove(&tenant);
                }
                return;
            }

            match result {
                Ok(channel) => {
                    let pump = tokio::spawn(Inner::pump(
                        Arc::clone(&this),
                        tenant.clone(),
                        generation,
                        channel,
                    ));
                    state.handle = Some(SubscriptionHandle::new(generation, pump));
                    state.phase = ChannelPhase::Open;
                    state.open_attempts = 0;
                    state.last_error = None;
                    info!("Opened {} channel for tenant {}", T::KIND, tenant);
                    None
                }
                Err(err) if err.is_transient() => {
                    state.open_attempts += 1;
                    let delay = this.debounce + this.retry.delay_for(state.open_attempts);
                    warn!(
                        "Opening {} channel for {} failed (attempt {}): {}. Retrying in {:?}",
                        T::KIND,
                        tenant,
                        state.open_attempts,
                        err,
                        delay
                    );
                    Inner::schedule_open(&this, &tenant, state, delay);
                    None
                }
                Err(err) => {
                    warn!("{} channel for {} terminated: {}", T::KIND, tenant, err);
                    state.phase = ChannelPhase::Closed;
                    state.last_error = Some(err.clone());
                    Some((state.listeners(), err))
                }
            }
        };

        if let Some((listeners, err)) = failure {
            notify(&listeners, SubscriptionEvent::Error(err));
        }
    }

    // == Pump ==
    /// Applies pushes in delivery order until the channel fails or the
    /// handle is dropped.
    async fn pump(this: Arc<Self>, tenant: TenantId, generation: u64, mut channel: RemoteChannel) {
        while let Some(message) = channel.next().await {
            if this.health.is_corrupted() {
                let err = SyncError::Corrupted("push received after connection corruption".into());
                Inner::channel_failed(&this, &tenant, generation, err);
                return;
            }
            match message {
                Ok(event) => {
                    this.health.record_success();
                    if !Inner::apply(&this, &tenant, generation, event) {
                        return;
                    }
                }
                Err(remote) => {
                    let err = SyncError::from(remote);
                    this.health.record_error(&err);
                    Inner::channel_failed(&this, &tenant, generation, err);
                    return;
                }
            }
        }

        let err = SyncError::Transient("push channel closed by remote".into());
        Inner::channel_failed(&this, &tenant, generation, err);
    }

    /// Reconciles one push into the cache. Returns false when the channel has
    /// been superseded and the pump should stop.
    fn apply(this: &Arc<Self>, tenant: &TenantId, generation: u64, event: ChannelEvent) -> bool {
        let (listeners, items) = {
            let mut pairs = this.lock();
            let Some(state) = pairs.get_mut(tenant) else {
                return false;
            };
            if state.generation != generation || state.phase != ChannelPhase::Open {
                return false;
            }

            let mut fallback = Vec::new();
            match event {
                ChannelEvent::Snapshot(documents) => {
                    let mut items = decode_documents::<T>(documents);
                    sort_items(&mut items);
                    debug!("Snapshot of {} {} for {}", items.len(), T::KIND, tenant);
                    this.cache.put(tenant, items.clone(), current_timestamp_ms());
                    fallback = items;
                }
                ChannelEvent::Changes(changes) => {
                    for change in changes {
                        apply_change(&this.cache, tenant, change.change, change.document);
                    }
                }
            }

            let items = this
                .cache
                .get(tenant)
                .map(|entry| entry.items)
                .unwrap_or(fallback);
            (state.listeners(), items)
        };

        notify(&listeners, SubscriptionEvent::Items(items));
        true
    }

    fn channel_failed(this: &Arc<Self>, tenant: &TenantId, generation: u64, err: SyncError) {
        let terminal = {
            let mut pairs = this.lock();
            let Some(state) = pairs.get_mut(tenant) else {
                return;
            };
            if state.generation != generation || state.phase != ChannelPhase::Open {
                return;
            }
            if let Some(handle) = state.handle.take() {
                handle.release();
            }

            if err.is_transient() && !state.listeners.is_empty() {
                state.phase = ChannelPhase::Opening;
                state.open_attempts += 1;
                let delay = this.debounce + this.retry.delay_for(state.open_attempts);
                warn!(
                    "{} channel for {} dropped: {}. Reopening in {:?}",
                    T::KIND,
                    tenant,
                    err,
                    delay
                );
                Inner::schedule_open(this, tenant, state, delay);
                None
            } else if err.is_transient() {
                state.phase = ChannelPhase::Closed;
                None
            } else {
                warn!("{} channel for {} terminated: {}", T::KIND, tenant, err);
                state.phase = ChannelPhase::Closed;
                state.last_error = Some(err.clone());
                Some((state.listeners(), err))
            }
        };

        if let Some((listeners, err)) = terminal {
            notify(&listeners, SubscriptionEvent::Error(err));
        }
    }

    // == Close ==
    fn close_channel(this: &Arc<Self>, tenant: &TenantId, token: u64) {
        let mut pairs = this.lock();
        let Some(state) = pairs.get_mut(tenant) else {
            return;
        };
        if state.timer_token != token || !state.listeners.is_empty() {
            return;
        }
        if let Some(timer) = state.timer.take() {
            timer.detach();
        }
        Inner::teardown(this, tenant, state);
        if state.is_idle() {
            pairs.remove(tenant);
        }
    }

    /// Drops the channel and evicts the entry if it is no longer fresh.
    fn teardown(this: &Arc<Self>, tenant: &TenantId, state: &mut PairState<T>) {
        let was_open = state.handle.take().is_some();
        state.phase = ChannelPhase::Closed;
        state.generation = this.next_id.fetch_add(1, Ordering::SeqCst);

        if !this.policy.is_fresh(this.cache.get(tenant).as_ref()) {
            this.cache.clear(tenant);
        }
        if was_open {
            info!("Closed {} channel for tenant {}", T::KIND, tenant);
        }
    }

    fn release(this: &Arc<Self>, tenant: &TenantId, id: u64) {
        let mut pairs = this.lock();
        let Some(state) = pairs.get_mut(tenant) else {
            return;
        };
        if state.listeners.remove(&id).is_none() || !state.listeners.is_empty() {
            return;
        }

        match state.phase {
            ChannelPhase::Opening => {
                if let Some(timer) = state.timer.take() {
                    timer.cancel();
                    state.phase = ChannelPhase::Closed;
                    debug!("Open of {}/{} abandoned before it started", tenant, T::KIND);
                }
            }
            ChannelPhase::Open => {
                if tokio::runtime::Handle::try_current().is_ok() {
                    Inner::schedule_close(this, tenant, state);
                } else {
                    Inner::teardown(this, tenant, state);
                }
            }
            ChannelPhase::Closed => {}
        }

        if state.is_idle() {
            pairs.remove(tenant);
        }
    }
}

fn apply_change<T: Entity>(
    cache: &CacheStore<T>,
    tenant: &TenantId,
    change: ChangeType,
    document: serde_json::Value,
) {
    match change {
        ChangeType::Added | ChangeType::Modified => match serde_json::from_value::<T>(document) {
            Ok(item) => {
                cache.upsert_one(tenant, item);
            }
            Err(err) => warn!("Skipping malformed {} change: {}", T::KIND, err),
        },
        ChangeType::Removed => {
            if let Some(id) = document_id(&document) {
                cache.remove_one(tenant, id);
            }
        }
    }
}

fn notify<T: Clone>(listeners: &[Listener<T>], event: SubscriptionEvent<T>) {
    for listener in listeners {
        listener(event.clone());
    }
}

// == Subscription ==
/// A reader's registration. Unsubscribing (or dropping) is immediate for the
/// reader; the channel itself closes after the debounce window.
pub struct Subscription<T: Entity> {
    tenant: TenantId,
    id: u64,
    inner: Weak<Inner<T>>,
    active: bool,
}

impl<T: Entity> Subscription<T> {
    pub fn tenant(&self) -> &TenantId {
        &self.tenant
    }

    pub fn unsubscribe(mut self) {
        self.release();
    }

    fn release(&mut self) {
        if !std::mem::take(&mut self.active) {
            return;
        }
        if let Some(inner) = self.inner.upgrade() {
            Inner::release(&inner, &self.tenant, self.id);
        }
    }
}

impl<T: Entity> fmt::Debug for Subscription<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Subscription")
            .field("tenant", &self.tenant)
            .field("kind", &T::KIND)
            .field("id", &self.id)
            .finish()
    }
}

impl<T: Entity> Drop for Subscription<T> {
    fn drop(&mut self) {
        self.release();
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::MemoryPersistence;
    use crate::error::{RemoteError, RemoteErrorCode};
    use crate::kind::TtlTable;
    use crate::models::Table;
    use crate::remote::{MemoryRemote, PushMode};
    use crate::kind::CollectionKind;
    use serde_json::json;

    const DEBOUNCE: Duration = Duration::from_millis(50);

    struct Fixture {
        remote: Arc<MemoryRemote>,
        cache: CacheStore<Table>,
        health: Arc<ConnectionHealthMonitor>,
        subs: SyncSubscriptions<Table>,
    }

    fn fixture() -> Fixture {
        let remote = Arc::new(MemoryRemote::new());
        let cache = CacheStore::new(Arc::new(MemoryPersistence::new()), TtlTable::new());
        let health = Arc::new(ConnectionHealthMonitor::new());
        let retry = RetryConfig {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(40),
            ..RetryConfig::default()
        };
        let subs = SyncSubscriptions::new(
            remote.clone(),
            cache.clone(),
            StalenessPolicy::new(health.clone()),
            health.clone(),
            DEBOUNCE,
            retry,
        );
        Fixture {
            remote,
            cache,
            health,
            subs,
        }
    }

    fn tenant() -> TenantId {
        TenantId::new("r1")
    }

    fn collect(events: &Arc<Mutex<Vec<SubscriptionEvent<Table>>>>) -> impl Fn(SubscriptionEvent<Table>) + Send + Sync + 'static {
        let events = Arc::clone(events);
        move |event| events.lock().unwrap().push(event)
    }

    async fn settle() {
        tokio::time::sleep(Duration::from_millis(200)).await;
    }

    #[tokio::test(start_paused = true)]
    async fn test_open_is_debounced() {
        let f = fixture();
        let _sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Opening);

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(f.remote.open_count(), 0);

        settle().await;
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Open);
        assert_eq!(f.remote.open_count(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_two_readers_share_one_channel() {
        let f = fixture();
        let _a = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        let _b = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        assert_eq!(f.remote.open_count(), 1);
        assert_eq!(f.remote.active_channels(&tenant(), CollectionKind::Tables), 1);
        assert_eq!(f.subs.reader_count(&tenant()), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_mount_unmount_mount_collapses() {
        let f = fixture();
        let first = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        first.unsubscribe();
        let second = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;
        assert_eq!(f.remote.open_count(), 1);

        second.unsubscribe();
        tokio::time::sleep(Duration::from_millis(10)).await;
        let _third = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        assert_eq!(f.remote.open_count(), 1);
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_unsubscribe_before_open_never_opens() {
        let f = fixture();
        let sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        drop(sub);
        settle().await;

        assert_eq!(f.remote.open_count(), 0);
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
    }

    #[tokio::test(start_paused = true)]
    async fn test_last_reader_closes_after_debounce() {
        let f = fixture();
        let sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        sub.unsubscribe();
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Open);
        settle().await;

        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
        assert_eq!(f.remote.active_channels(&tenant(), CollectionKind::Tables), 0);

        let _again = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;
        assert_eq!(f.remote.open_count(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_snapshot_replaces_cache() {
        let f = fixture();
        f.remote.seed(
            &tenant(),
            CollectionKind::Tables,
            vec![json!({"id": "t1", "number": "1", "area": "main"})],
        );
        f.cache.put(
            &tenant(),
            vec![Table {
                id: "local".into(),
                ..Table::new("9", "main")
            }],
            current_timestamp_ms(),
        );

        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = f.subs.subscribe(&tenant(), collect(&events)).unwrap();
        settle().await;

        let entry = f.cache.get(&tenant()).unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.items[0].id, "t1");
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(SubscriptionEvent::Items(items)) if items.len() == 1
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_changes_apply_in_order() {
        let f = fixture();
        f.remote.set_push_mode(PushMode::Changes);
        let _sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        f.remote.upsert_document(
            &tenant(),
            CollectionKind::Tables,
            json!({"id": "t1", "number": "1", "area": "main"}),
        );
        f.remote.upsert_document(
            &tenant(),
            CollectionKind::Tables,
            json!({"id": "t1", "number": "2", "area": "main"}),
        );
        f.remote.upsert_document(
            &tenant(),
            CollectionKind::Tables,
            json!({"id": "t2", "number": "3", "area": "main"}),
        );
        f.remote.remove_document(&tenant(), CollectionKind::Tables, "t2");
        settle().await;

        let entry = f.cache.get(&tenant()).unwrap();
        assert_eq!(entry.len(), 1);
        assert_eq!(entry.items[0].number, "2");
    }

    #[tokio::test(start_paused = true)]
    async fn test_late_reader_gets_cached_items() {
        let f = fixture();
        f.remote.seed(
            &tenant(),
            CollectionKind::Tables,
            vec![json!({"id": "t1", "number": "1", "area": "main"})],
        );
        let _first = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        let events = Arc::new(Mutex::new(Vec::new()));
        let _second = f.subs.subscribe(&tenant(), collect(&events)).unwrap();
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_transient_open_failure_retries() {
        let f = fixture();
        f.remote.fail_next_subscribe(RemoteError::unavailable("offline"));
        let _sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Open);
        assert_eq!(f.remote.open_count(), 1);
        assert_eq!(f.health.state(), crate::health::ConnectionState::Healthy);
    }

    #[tokio::test(start_paused = true)]
    async fn test_channel_drop_reopens() {
        let f = fixture();
        let _sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;

        f.remote.drop_channels(&tenant(), CollectionKind::Tables);
        settle().await;

        assert_eq!(f.remote.open_count(), 2);
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Open);
    }

    #[tokio::test(start_paused = true)]
    async fn test_permission_revoked_terminates() {
        let f = fixture();
        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = f.subs.subscribe(&tenant(), collect(&events)).unwrap();
        settle().await;

        f.remote.revoke(
            &tenant(),
            CollectionKind::Tables,
            RemoteError::new(RemoteErrorCode::PermissionDenied, "revoked"),
        );
        settle().await;

        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
        assert_eq!(f.remote.open_count(), 1);
        assert!(matches!(
            f.subs.last_error(&tenant()),
            Some(SyncError::PermissionDenied(_))
        ));
        assert!(matches!(
            events.lock().unwrap().last(),
            Some(SubscriptionEvent::Error(SyncError::PermissionDenied(_)))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_not_found_on_open_terminates() {
        let f = fixture();
        f.remote.fail_next_subscribe(RemoteError::new(RemoteErrorCode::NotFound, "gone"));
        let events = Arc::new(Mutex::new(Vec::new()));
        let _sub = f.subs.subscribe(&tenant(), collect(&events)).unwrap();
        settle().await;

        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
        assert_eq!(f.remote.open_count(), 0);
        assert_eq!(events.lock().unwrap().len(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_refused_when_corrupted() {
        let f = fixture();
        f.health.report_corrupted("test");
        assert!(matches!(
            f.subs.subscribe(&tenant(), |_| {}),
            Err(SyncError::Corrupted(_))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_close_evicts_stale_entry() {
        let f = fixture();
        let sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();
        settle().await;
        assert!(f.cache.get(&tenant()).is_some());

        f.health.report_corrupted("test");
        sub.unsubscribe();
        settle().await;
        assert!(f.cache.get(&tenant()).is_none());
    }

    #[tokio::test(start_paused = true)]
    async fn test_corruption_halts_every_open_channel() {
        let f = fixture();
        let r2 = TenantId::new("r2");
        let events = Arc::new(Mutex::new(Vec::new()));
        let _a = f.subs.subscribe(&tenant(), collect(&events)).unwrap();
        let _b = f.subs.subscribe(&r2, collect(&events)).unwrap();
        settle().await;
        assert_eq!(f.remote.active_channels(&r2, CollectionKind::Tables), 1);

        f.health.report_corrupted("fault on another collection");
        settle().await;

        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
        assert_eq!(f.subs.phase(&r2), ChannelPhase::Closed);
        assert_eq!(f.remote.active_channels(&tenant(), CollectionKind::Tables), 0);
        assert_eq!(f.remote.active_channels(&r2, CollectionKind::Tables), 0);
        let errors = events
            .lock()
            .unwrap()
            .iter()
            .filter(|event| matches!(event, SubscriptionEvent::Error(SyncError::Corrupted(_))))
            .count();
        assert_eq!(errors, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_corruption_cancels_pending_open() {
        let f = fixture();
        let _sub = f.subs.subscribe(&tenant(), |_| {}).unwrap();

        f.health.report_corrupted("test");
        settle().await;

        assert_eq!(f.remote.open_count(), 0);
        assert_eq!(f.subs.phase(&tenant()), ChannelPhase::Closed);
    }
}
