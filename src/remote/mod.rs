//! Remote Store Module
//!
//! The contract the engine consumes from a multi-tenant document store.
//! Documents travel as JSON objects carrying an `"id"` field; the engine
//! decodes them into typed entities and always re-sorts locally, so a store
//! without composite indexes can answer ordered fetches with an unordered read.

mod memory;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tracing::warn;

use crate::error::RemoteError;
use crate::kind::{CollectionKind, TenantId};
use crate::models::Entity;

pub use memory::{FetchHold, MemoryRemote, PushMode};

/// A remote document: a JSON object with an `"id"` field.
pub type Document = Value;

/// Returns the document's id, if it has a string one.
pub fn document_id(document: &Document) -> Option<&str> {
    document.get("id").and_then(Value::as_str)
}

// == Write Operations ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WriteOp {
    Create,
    Update,
    Delete,
}

// == Push Events ==
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeType {
    Added,
    Modified,
    Removed,
}

#[derive(Debug, Clone, PartialEq)]
pub struct DocumentChange {
    pub change: ChangeType,
    pub document: Document,
}

/// One push from the remote channel.
#[derive(Debug, Clone, PartialEq)]
pub enum ChannelEvent {
    /// The complete collection
    Snapshot(Vec<Document>),
    /// Incremental changes, applied in order
    Changes(Vec<DocumentChange>),
}

pub type ChannelMessage = Result<ChannelEvent, RemoteError>;

// == Remote Channel ==
/// Receiving end of a push subscription. Dropping it unsubscribes.
#[derive(Debug)]
pub struct RemoteChannel {
    events: mpsc::UnboundedReceiver<ChannelMessage>,
}

impl RemoteChannel {
    pub fn new(events: mpsc::UnboundedReceiver<ChannelMessage>) -> Self {
        Self { events }
    }

    /// Next push, or `None` once the remote side has hung up.
    pub async fn next(&mut self) -> Option<ChannelMessage> {
        self.events.recv().await
    }
}

// == Remote Store Trait ==
#[async_trait]
pub trait RemoteStore: Send + Sync {
    /// Reads a whole collection. `ordered` asks for the store's indexed sort;
    /// stores still building that index answer `FailedPrecondition`.
    async fn fetch_collection(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
        ordered: bool,
    ) -> Result<Vec<Document>, RemoteError>;

    /// Applies one write and returns the server-confirmed document. For
    /// deletes that is the removed document.
    async fn write_item(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
        op: WriteOp,
        payload: Document,
    ) -> Result<Document, RemoteError>;

    /// Opens a push channel. The first event is a full snapshot.
    async fn subscribe(
        &self,
        tenant: &TenantId,
        kind: CollectionKind,
    ) -> Result<RemoteChannel, RemoteError>;
}

// == Decoding ==
/// Decodes documents, skipping (and logging) any that do not fit `T`.
pub fn decode_documents<T: Entity>(documents: Vec<Document>) -> Vec<T> {
    documents
        .into_iter()
        .filter_map(|document| match serde_json::from_value::<T>(document) {
            Ok(item) => Some(item),
            Err(err) => {
                warn!("Skipping malformed {} document: {}", T::KIND, err);
                None
            }
        })
        .collect()
}
