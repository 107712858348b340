//! In-process remote store.
//!
//! Keeps documents per (tenant, kind), assigns ids and `updated_at` on write,
//! and pushes to every open channel after each change. Faults can be queued
//! per operation to exercise the engine's failure handling.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};

use async_trait::async_trait;
use chrono::Utc;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Notify};
use tracing::debug;
use uuid::Uuid;

use super::{
    document_id, ChangeType, ChannelEvent, ChannelMessage, Document, DocumentChange,
    RemoteChannel, RemoteStore, WriteOp,
};
use crate::error::{RemoteError, RemoteErrorCode};
use crate::kind::{CollectionKind, TenantId};
use crate::models::Entity;

type PairKey = (TenantId, CollectionKind);

/// How writes are pushed to open channels.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PushMode {
    /// Full collection after every write
    #[default]
    Snapshots,
    /// Only the changed document
    Changes,
}

/// A fetch parked after reading its documents, until released.
#[derive(Debug, Default)]
pub struct FetchHold {
    reached: Notify,
    release: Notify,
}

impl FetchHold {
    /// Resolves once the held fetch has read the collection.
    pub async fn reached(&self) {
        self.reached.notified().await;
    }

    /// Lets the held fetch return what it read.
    pub fn release(&self) {
        self.release.notify_one();
    }
}

#[derive(Debug, Default)]
struct Inner {
    collections: HashMap<PairKey, Vec<Document>>,
    channels: HashMap<PairKey, Vec<mpsc::UnboundedSender<ChannelMessage>>>,
    /// Errors returned for every operation on a pair (revoked access, ...)
    pair_errors: HashMap<PairKey, RemoteError>,
    fetch_faults: VecDeque<RemoteError>,
    write_faults: VecDeque<RemoteError>,
    subscribe_faults: VecDeque<RemoteError>,
    held_fetch: Option<Arc<FetchHold>>,
    index_building: bool,
    push_mode: PushMode,
}

// == Memory Remote ==
#[derive(Debug, Default)]
pub struct MemoryRemote {
    inner: Mutex<Inner>,
    fetches: AtomicU64,
    writes: AtomicU64,
    opens: AtomicU64,
}

impl MemoryRemote {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    // == Seeding ==
    /// Replaces a collection without notifying channels.
    pub fn seed(&self, tenant: &TenantId, kind: CollectionKind, documents: Vec<Document>) {
        let documents = documents.into_iter().map(assign_id).collect();
        self.lock()
            .collections
            .insert((tenant.clone(), kind), documents);
    }

    pub fn seed_items<T: Entity>(&self, tenant: &TenantId, items: &[T]) {
        let documents = items
            .iter()
            .filter_map(|item| serde_json::to_value(item).ok())
            .collect();
        self.seed(tenant, T::KIND, documents);
    }

    pub fn documents(&self, tenant: &TenantId, kind: CollectionKind) -> Vec<Document> {
        self.lock()
            .collections
            .get(&(tenant.clone(), kind))
            .cloned()
            .unwrap_or_default()
    }

    // == Fault Injection ==
    pub fn fail_next_fetch(&self, err: RemoteError) {
        self.lock().fetch_faults.push_back(err);
    }

    /// Parks the next fetch between reading the collection and returning it.
    pub fn hold_next_fetch(&self) -> Arc<FetchHold> {
        let hold = Arc::new(FetchHold::default());
        self.lock().held_fetch = Some(Arc::clone(&hold));
        hold
    }

    pub fn fail_next_write(&self, err: RemoteError) {
        self.lock().write_faults.push_back(err);
    }

    pub fn fail_next_subscribe(&self, err: RemoteError) {
        self.lock().subscribe_faults.push_back(err);
    }

    /// While set, ordered fetches answer `FailedPrecondition`.
    pub fn set_index_building(&self, building: bool) {
        self.lock().index_building = building;
    }

    pub fn set_push_mode(&self, mode: PushMode) {
        self.lock().push_mode = mode;
    }

    /// Fails every later operation on the pair and terminates its channels
    /// with the same error.
    pub fn revoke(&self, tenant: &TenantId, kind: CollectionKind, err: RemoteError) {
        let mut inner = self.lock();
        let key = (tenant.clone(), kind);
        if let Some(channels) = inner.channels.remove(&key) {
            for channel in channels {
                let _ = channel.send(Err(err.clone()));
            }
        }
        inner.pair_errors.insert(key, err);
    }

    /// Delivers an error to every open channel of the pair.
    pub fn push_error(&self, tenant: &TenantId, kind: CollectionKind, err: RemoteError) {
        let mut inner = self.lock();
        if let Some(channels) = inner.channels.get_mut(&(tenant.clone(), kind)) {
            channels.retain(|channel| channel.send(Err(err.clone())).is_ok());
        }
    }

    /// Hangs up every open channel of the pair.
    pub fn drop_channels(&self, tenant: &TenantId, kind: CollectionKind) {
        self.lock().channels.remove(&(tenant.clone(), kind));
    }

    // == Writes From Other Clients ==
    /// Inserts or replaces a document as another client would, pushing the
    /// change to open channels.
    pub fn upsert_document(&self, tenant: &TenantId, kind: CollectionKind, document: Document) {
        let document = stamp(assign_id(document));
        let mut inner = self.lock();
        let key = (tenant.clone(), kind);
        let change = upsert_into(inner.collections.entry(key.clone()).or_default(), document.clone());
        broadcast(&mut inner, &key, change, document);
    }

    /// Removes a document as another client would.
    pub fn remove_document(&self, tenant: &TenantId, kind: CollectionKind, id: &str) {
        let mut inner = self.lock();
        let key = (tenant.clone(), kind);
        let removed = remove_from(inner.collections.entry(key.clone()).or_default(), id);
        if let Some(document) = removed {
            broadcast(&mut inner, &key, ChangeType::Removed, document);
        }
    }

    // == Counters ==
    pub fn fetch_count(&self) -> u64 {
        self.fetches.load(Ordering::SeqCst)
    }

    pub fn write_count(&self) -> u64 {
        self.writes.load(Ordering::SeqCst)
    }

    /// Successful channel opens across all pairs.
    pub fn open_count(&self) -> u64 {
        self.opens.load(Ordering::SeqCst)
    }

    /// Channels of the pair whose receiver is still alive.
    pub fn active_channels(&self, tenant: &TenantId, kind: CollectionKind) -> usize {
        self.lock()
            .channels
            .get(&(tenant.clone(), kind))
            .map(|channels| channels.iter().filter(|c| !c.is_closed()).count())
            .unwrap_or(0)
    }
}

#[async_trait]
impl RemoteStore for MemoryRemote {
    async fn fetch_collection(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
        ordered: bool,
    ) -> Result<Vec<Document>, RemoteError> {
        self.fetches.fetch_add(1, Ordering::SeqCst);
        let (documents, hold) = {
            let mut inner = self.lock();
            let key = (tenant.clone(), kind);

            if let Some(err) = inner.fetch_faults.pop_front() {
                return Err(err);
            }
            if let Some(err) = inner.pair_errors.get(&key) {
                return Err(err.clone());
            }
            if ordered && inner.index_building {
                return Err(RemoteError::new(
                    RemoteErrorCode::FailedPrecondition,
                    format!("the query requires an index on {}", kind),
                ));
            }

            let mut documents = inner.collections.get(&key).cloned().unwrap_or_default();
            if ordered {
                documents.sort_by(|a, b| document_id(a).cmp(&document_id(b)));
            } else {
                documents.reverse();
            }
            (documents, inner.held_fetch.take())
        };

        if let Some(hold) = hold {
            hold.reached.notify_one();
            hold.release.notified().await;
        }
        Ok(documents)
    }

    async fn write_item(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
        op: WriteOp,
        payload: Document,
    ) -> Result<Document, RemoteError> {
        self.writes.fetch_add(1, Ordering::SeqCst);
        let mut inner = self.lock();
        let key = (tenant.clone(), kind);

        if let Some(err) = inner.write_faults.pop_front() {
            return Err(err);
        }
        if let Some(err) = inner.pair_errors.get(&key) {
            return Err(err.clone());
        }

        let collection = inner.collections.entry(key.clone()).or_default();
        let (change, confirmed) = match op {
            WriteOp::Create => {
                let document = stamp(assign_id(payload));
                (upsert_into(collection, document.clone()), document)
            }
            WriteOp::Update => {
                let id = required_id(&payload)?;
                let existing = collection
                    .iter_mut()
                    .find(|document| document_id(document) == Some(id.as_str()))
                    .ok_or_else(|| not_found(kind, &id))?;
                merge(existing, payload);
                let stamped = stamp(existing.clone());
                *existing = stamped.clone();
                (ChangeType::Modified, stamped)
            }
            WriteOp::Delete => {
                let id = required_id(&payload)?;
                let removed = remove_from(collection, &id).ok_or_else(|| not_found(kind, &id))?;
                (ChangeType::Removed, removed)
            }
        };

        debug!("Remote {:?} on {}/{} applied", op, tenant, kind);
        broadcast(&mut inner, &key, change, confirmed.clone());
        Ok(confirmed)
    }

    async fn subscribe(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
    ) -> Result<RemoteChannel, RemoteError> {
        let mut inner = self.lock();
        let key = (tenant.clone(), kind);

        if let Some(err) = inner.subscribe_faults.pop_front() {
            return Err(err);
        }
        if let Some(err) = inner.pair_errors.get(&key) {
            return Err(err.clone());
        }

        let (sender, receiver) = mpsc::unbounded_channel();
        let snapshot = inner.collections.get(&key).cloned().unwrap_or_default();
        let _ = sender.send(Ok(ChannelEvent::Snapshot(snapshot)));
        inner.channels.entry(key).or_default().push(sender);
        self.opens.fetch_add(1, Ordering::SeqCst);

        Ok(RemoteChannel::new(receiver))
    }
}

// == Helpers ==
fn broadcast(inner: &mut Inner, key: &PairKey, change: ChangeType, document: Document) {
    let event = match inner.push_mode {
        PushMode::Snapshots => {
            ChannelEvent::Snapshot(inner.collections.get(key).cloned().unwrap_or_default())
        }
        PushMode::Changes => ChannelEvent::Changes(vec![DocumentChange { change, document }]),
    };
    if let Some(channels) = inner.channels.get_mut(key) {
        channels.retain(|channel| channel.send(Ok(event.clone())).is_ok());
    }
}

fn assign_id(mut document: Document) -> Document {
    let missing = document_id(&document).map_or(true, str::is_empty);
    if missing {
        if let Some(object) = document.as_object_mut() {
            object.insert("id".to_string(), json!(Uuid::new_v4().to_string()));
        }
    }
    document
}

fn stamp(mut document: Document) -> Document {
    if let Some(object) = document.as_object_mut() {
        object.insert("updated_at".to_string(), json!(Utc::now().to_rfc3339()));
    }
    document
}

fn merge(target: &mut Document, patch: Document) {
    match (target.as_object_mut(), patch) {
        (Some(object), Value::Object(fields)) => {
            for (field, value) in fields {
                object.insert(field, value);
            }
        }
        (_, patch) => *target = patch,
    }
}

fn upsert_into(collection: &mut Vec<Document>, document: Document) -> ChangeType {
    let id = document_id(&document).map(str::to_string);
    match collection
        .iter_mut()
        .find(|existing| document_id(existing).map(str::to_string) == id)
    {
        Some(existing) => {
            *existing = document;
            ChangeType::Modified
        }
        None => {
            collection.push(document);
            ChangeType::Added
        }
    }
}

fn remove_from(collection: &mut Vec<Document>, id: &str) -> Option<Document> {
    let index = collection
        .iter()
        .position(|document| document_id(document) == Some(id))?;
    Some(collection.remove(index))
}

fn required_id(payload: &Document) -> Result<String, RemoteError> {
    document_id(payload)
        .filter(|id| !id.is_empty())
        .map(str::to_string)
        .ok_or_else(|| RemoteError::new(RemoteErrorCode::NotFound, "document id is required"))
}

fn not_found(kind: CollectionKind, id: &str) -> RemoteError {
    RemoteError::new(
        RemoteErrorCode::NotFound,
        format!("no {} document with id {}", kind, id),
    )
}
