use std::error::Error;
use std::fmt::{Display, Formatter};
use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};

use crate::query::QueryDescriptor;

mod memory;

pub use memory::MemoryBackend;

/// The decoded field map of one backend document.
pub type JsonFields = Map<String, Value>;

/// One raw document as delivered by a backend: the backend-assigned id plus
/// its field map. The id is kept separate; merging it into the payload is
/// the snapshot processor's job.
#[derive(Clone, Debug, PartialEq)]
pub struct RawDocument {
    pub id: String,
    pub fields: JsonFields,
}

impl RawDocument {
    pub fn new(id: impl Into<String>, fields: JsonFields) -> Self {
        Self {
            id: id.into(),
            fields,
        }
    }
}

/// An ordered backend query result.
pub type ResultSet = Vec<RawDocument>;

/// A backend-native error: an opaque status string plus a message.
///
/// Statuses are never shown to callers directly; the error classifier maps
/// them onto the crate's closed code taxonomy.
#[derive(Clone, Debug)]
pub struct BackendError {
    status: String,
    message: String,
}

impl BackendError {
    pub fn new(status: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            status: status.into(),
            message: message.into(),
        }
    }

    pub fn status(&self) -> &str {
        &self.status
    }

    pub fn message(&self) -> &str {
        &self.message
    }
}

impl Display for BackendError {
    fn fmt(&self, f: &mut Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} ({})", self.message, self.status)
    }
}

impl Error for BackendError {}

pub type BackendResult<T> = Result<T, BackendError>;

pub type SnapshotFn = Arc<dyn Fn(ResultSet) + Send + Sync + 'static>;
pub type DocumentFn = Arc<dyn Fn(Option<RawDocument>) + Send + Sync + 'static>;
pub type ErrorFn = Arc<dyn Fn(BackendError) + Send + Sync + 'static>;

/// Detaches a live listener. Dropping the handle without calling it leaves
/// the listener attached.
pub type Unsubscribe = Box<dyn FnOnce() + Send + 'static>;

/// Callback pair for a live query listener.
///
/// Backends must not hold internal locks while invoking either callback;
/// observers may re-enter the backend.
#[derive(Clone)]
pub struct SnapshotObserver {
    next: SnapshotFn,
    error: ErrorFn,
}

impl SnapshotObserver {
    pub fn new<N, E>(next: N, error: E) -> Self
    where
        N: Fn(ResultSet) + Send + Sync + 'static,
        E: Fn(BackendError) + Send + Sync + 'static,
    {
        Self {
            next: Arc::new(next),
            error: Arc::new(error),
        }
    }

    pub fn next(&self, result: ResultSet) {
        (self.next)(result);
    }

    pub fn error(&self, error: BackendError) {
        (self.error)(error);
    }
}

/// Callback pair for a live single-document listener. `None` means the
/// document does not exist.
#[derive(Clone)]
pub struct DocumentObserver {
    next: DocumentFn,
    error: ErrorFn,
}

impl DocumentObserver {
    pub fn new<N, E>(next: N, error: E) -> Self
    where
        N: Fn(Option<RawDocument>) + Send + Sync + 'static,
        E: Fn(BackendError) + Send + Sync + 'static,
    {
        Self {
            next: Arc::new(next),
            error: Arc::new(error),
        }
    }

    pub fn next(&self, document: Option<RawDocument>) {
        (self.next)(document);
    }

    pub fn error(&self, error: BackendError) {
        (self.error)(error);
    }
}

/// The injected backend collaborator.
///
/// One-shot reads are async; listener registration is synchronous and the
/// backend drives callbacks from its own dispatch, starting with an initial
/// snapshot. Implementations guarantee that callbacks for one listener are
/// delivered in commit order.
#[async_trait]
pub trait DocumentBackend: Send + Sync + 'static {
    async fn run_query(&self, query: &QueryDescriptor) -> BackendResult<ResultSet>;

    async fn get_document(&self, collection: &str, id: &str)
        -> BackendResult<Option<RawDocument>>;

    fn subscribe(
        &self,
        query: &QueryDescriptor,
        observer: SnapshotObserver,
    ) -> BackendResult<Unsubscribe>;

    fn subscribe_document(
        &self,
        collection: &str,
        id: &str,
        observer: DocumentObserver,
    ) -> BackendResult<Unsubscribe>;

    /// Creates a document with a backend-assigned id and returns it.
    async fn add_document(
        &self,
        collection: &str,
        fields: JsonFields,
    ) -> BackendResult<RawDocument>;

    /// Full overwrite of the document at `collection/id`.
    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()>;

    /// Partial update of an existing document; fails if it does not exist.
    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()>;

    /// Deletes the document; succeeds even if it does not exist.
    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()>;
}
