use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::{DocumentBackend, DocumentObserver, RawDocument, Unsubscribe};
use crate::collection::{DocumentRecord, SubscriptionPhase};
use crate::error::{self, classify, internal_error, LiveQueryError, LiveQueryResult};

/// Behavior knobs for a document handle.
#[derive(Clone, Copy, Debug)]
pub struct DocumentOptions {
    realtime: bool,
}

impl Default for DocumentOptions {
    fn default() -> Self {
        Self { realtime: true }
    }
}

impl DocumentOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn one_shot() -> Self {
        Self { realtime: false }
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    pub fn realtime(&self) -> bool {
        self.realtime
    }
}

type DocObserverFn<T> = Arc<dyn Fn(Option<&DocumentRecord<T>>) + Send + Sync + 'static>;

struct DocState<T> {
    record: Option<DocumentRecord<T>>,
    loading: bool,
    initialized: bool,
    error: Option<LiveQueryError>,
    last_updated: Option<DateTime<Utc>>,
    phase: SubscriptionPhase,
    listener: Option<Unsubscribe>,
    observers: Vec<(u64, DocObserverFn<T>)>,
    observer_seq: u64,
}

struct DocInner<T> {
    backend: Arc<dyn DocumentBackend>,
    collection: String,
    doc_id: String,
    disposed: AtomicBool,
    fetch_gate: async_lock::Mutex<()>,
    state: Mutex<DocState<T>>,
}

/// The single-document counterpart of a collection handle.
///
/// `data()` is `None` while loading and for documents that do not exist;
/// absence is not an error. Same lifecycle rules as the collection handle:
/// one listener at most, explicit `dispose`, `initialized` flips once.
pub struct DocumentHandle<T> {
    inner: Arc<DocInner<T>>,
}

impl<T> Clone for DocumentHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> DocumentHandle<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) async fn attach(
        backend: Arc<dyn DocumentBackend>,
        collection: String,
        doc_id: String,
        options: DocumentOptions,
    ) -> Self {
        let inner = Arc::new(DocInner {
            backend,
            collection,
            doc_id,
            disposed: AtomicBool::new(false),
            fetch_gate: async_lock::Mutex::new(()),
            state: Mutex::new(DocState {
                record: None,
                loading: true,
                initialized: false,
                error: None,
                last_updated: None,
                phase: SubscriptionPhase::Idle,
                listener: None,
                observers: Vec::new(),
                observer_seq: 0,
            }),
        });

        if options.realtime() {
            DocInner::attach_listener(&inner);
        } else {
            inner.state.lock().unwrap().phase = SubscriptionPhase::Attaching;
            if let Err(err) = inner.run_fetch().await {
                log::debug!("initial fetch for '{}' failed: {err}", inner.path());
            }
            let mut state = inner.state.lock().unwrap();
            if !state.phase.is_disposed() {
                state.phase = SubscriptionPhase::Resolved;
            }
        }

        Self { inner }
    }

    pub fn data(&self) -> Option<T> {
        self.inner
            .state
            .lock()
            .unwrap()
            .record
            .as_ref()
            .map(|record| record.data.clone())
    }

    pub fn exists(&self) -> bool {
        self.inner.state.lock().unwrap().record.is_some()
    }

    pub fn id(&self) -> &str {
        &self.inner.doc_id
    }

    pub fn collection(&self) -> &str {
        &self.inner.collection
    }

    pub fn path(&self) -> String {
        self.inner.path()
    }

    pub fn loading(&self) -> bool {
        self.inner.state.lock().unwrap().loading
    }

    pub fn initialized(&self) -> bool {
        self.inner.state.lock().unwrap().initialized
    }

    pub fn error(&self) -> Option<LiveQueryError> {
        self.inner.state.lock().unwrap().error.clone()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().unwrap().last_updated
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.inner.state.lock().unwrap().phase
    }

    /// Forces a fresh one-shot read; mode is left untouched.
    pub async fn refresh(&self) -> LiveQueryResult<()> {
        self.inner.run_fetch().await
    }

    pub fn set_realtime(&self, realtime: bool) {
        if self.inner.disposed.load(AtomicOrdering::Acquire) {
            return;
        }
        if realtime {
            DocInner::attach_listener(&self.inner);
        } else {
            let listener = {
                let mut state = self.inner.state.lock().unwrap();
                if state.phase.is_disposed() {
                    return;
                }
                state.phase = SubscriptionPhase::Resolved;
                state.listener.take()
            };
            if let Some(unsubscribe) = listener {
                unsubscribe();
            }
        }
    }

    /// Registers a callback invoked after every commit with the current
    /// record (or `None` when the document is absent).
    pub fn on_update<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(Option<&DocumentRecord<T>>) + Send + Sync + 'static,
    {
        let id = {
            let mut state = self.inner.state.lock().unwrap();
            let id = state.observer_seq;
            state.observer_seq += 1;
            state.observers.push((id, Arc::new(callback)));
            id
        };
        let weak = Arc::downgrade(&self.inner);
        Box::new(move || {
            if let Some(inner) = weak.upgrade() {
                inner
                    .state
                    .lock()
                    .unwrap()
                    .observers
                    .retain(|(observer_id, _)| *observer_id != id);
            }
        })
    }

    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let listener = {
            let mut state = self.inner.state.lock().unwrap();
            state.phase = SubscriptionPhase::Disposed;
            state.loading = false;
            state.observers.clear();
            state.listener.take()
        };
        if let Some(unsubscribe) = listener {
            unsubscribe();
        }
        log::debug!("handle disposed for '{}'", self.inner.path());
    }
}

impl<T> DocInner<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    fn path(&self) -> String {
        format!("{}/{}", self.collection, self.doc_id)
    }

    fn attach_listener(inner: &Arc<Self>) {
        if inner.disposed.load(AtomicOrdering::Acquire) {
            return;
        }
        let previous = {
            let mut state = inner.state.lock().unwrap();
            if state.phase.is_disposed() || state.phase.is_live() {
                return;
            }
            state.phase = SubscriptionPhase::Attaching;
            state.listener.take()
        };
        if let Some(unsubscribe) = previous {
            unsubscribe();
        }

        let weak = Arc::downgrade(inner);
        let weak_err = Weak::clone(&weak);
        let observer = DocumentObserver::new(
            move |document| {
                if let Some(inner) = weak.upgrade() {
                    if inner.disposed.load(AtomicOrdering::Acquire) {
                        return;
                    }
                    inner.apply_document(document);
                }
            },
            move |backend_error| {
                if let Some(inner) = weak_err.upgrade() {
                    if inner.disposed.load(AtomicOrdering::Acquire) {
                        return;
                    }
                    let path = inner.path();
                    log::warn!("live listener error on '{path}': {backend_error}");
                    inner.apply_error(classify(backend_error, path));
                }
            },
        );

        match inner
            .backend
            .subscribe_document(&inner.collection, &inner.doc_id, observer)
        {
            Ok(unsubscribe) => {
                let stale = {
                    let mut state = inner.state.lock().unwrap();
                    if state.phase.is_disposed() {
                        Some(unsubscribe)
                    } else {
                        state.phase = SubscriptionPhase::Live;
                        state.listener = Some(unsubscribe);
                        None
                    }
                };
                if let Some(unsubscribe) = stale {
                    unsubscribe();
                }
            }
            Err(backend_error) => {
                let path = inner.path();
                log::warn!("listener attach failed for '{path}': {backend_error}");
                let mut state = inner.state.lock().unwrap();
                if state.phase.is_disposed() {
                    return;
                }
                state.phase = SubscriptionPhase::Resolved;
                state.error = Some(classify(backend_error, path));
                state.loading = false;
                state.initialized = true;
            }
        }
    }

    async fn run_fetch(&self) -> LiveQueryResult<()> {
        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(error::failed_precondition("handle is disposed").with_path(self.path()));
        }
        let _gate = self.fetch_gate.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            if state.phase.is_disposed() {
                return Err(
                    error::failed_precondition("handle is disposed").with_path(self.path())
                );
            }
            state.loading = true;
        }

        let result = self
            .backend
            .get_document(&self.collection, &self.doc_id)
            .await;

        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(error::cancelled("handle disposed while a fetch was in flight")
                .with_path(self.path()));
        }

        match result {
            Ok(document) => {
                self.apply_document(document);
                Ok(())
            }
            Err(backend_error) => {
                let classified = classify(backend_error, self.path());
                let mut state = self.state.lock().unwrap();
                if state.phase.is_disposed() {
                    return Err(classified);
                }
                state.error = Some(classified.clone());
                state.loading = false;
                state.initialized = true;
                Err(classified)
            }
        }
    }

    fn apply_document(&self, document: Option<RawDocument>) {
        let decoded = document.map(|document| {
            let id = document.id;
            let mut fields = document.fields;
            fields.insert("id".to_string(), Value::String(id.clone()));
            serde_json::from_value::<T>(Value::Object(fields))
                .map(|data| DocumentRecord { id: id.clone(), data })
                .map_err(|err| {
                    internal_error(format!("failed to decode document '{id}': {err}"))
                        .with_path(self.path())
                })
        });

        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.phase.is_disposed() {
                return;
            }
            match decoded {
                Some(Err(err)) => {
                    log::warn!("document decoding failed for '{}': {err}", self.path());
                    state.error = Some(err);
                    state.loading = false;
                    state.initialized = true;
                    None
                }
                Some(Ok(record)) => {
                    state.record = Some(record);
                    state.error = None;
                    state.loading = false;
                    state.initialized = true;
                    state.last_updated = Some(Utc::now());
                    Some(state_snapshot(&state))
                }
                None => {
                    state.record = None;
                    state.error = None;
                    state.loading = false;
                    state.initialized = true;
                    state.last_updated = Some(Utc::now());
                    Some(state_snapshot(&state))
                }
            }
        };

        if let Some((record, observers)) = notify {
            for observer in &observers {
                observer(record.as_ref());
            }
        }
    }

    fn apply_error(&self, err: LiveQueryError) {
        let mut state = self.state.lock().unwrap();
        if state.phase.is_disposed() {
            return;
        }
        state.error = Some(err);
        state.loading = false;
        state.initialized = true;
    }
}

fn state_snapshot<T: Clone>(
    state: &DocState<T>,
) -> (Option<DocumentRecord<T>>, Vec<DocObserverFn<T>>) {
    (
        state.record.clone(),
        state
            .observers
            .iter()
            .map(|(_, observer)| Arc::clone(observer))
            .collect(),
    )
}
