use std::cmp::Ordering;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::atomic::{AtomicBool, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex, Weak};
use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;
use serde_json::Value;

use crate::backend::{DocumentBackend, JsonFields, ResultSet, SnapshotObserver, Unsubscribe};
use crate::cache::QueryCache;
use crate::error::{self, classify, LiveQueryError, LiveQueryResult};
use crate::query::QueryDescriptor;
use crate::stats::{CollectionStats, StatsRecorder};

use super::options::CollectionOptions;
use super::process::process_snapshot;
use super::state::{ChangeSet, DocumentRecord, SubscriptionPhase};

type ObserverFn<T> = Arc<dyn Fn(&ChangeSet<T>) + Send + Sync + 'static>;

struct HandleState<T> {
    records: Arc<Vec<DocumentRecord<T>>>,
    loading: bool,
    initialized: bool,
    error: Option<LiveQueryError>,
    last_updated: Option<DateTime<Utc>>,
    phase: SubscriptionPhase,
    listener: Option<Unsubscribe>,
    observers: Vec<(u64, ObserverFn<T>)>,
    senders: Vec<async_channel::Sender<ChangeSet<T>>>,
    observer_seq: u64,
}

struct HandleInner<T> {
    backend: Arc<dyn DocumentBackend>,
    cache: Arc<QueryCache>,
    descriptor: QueryDescriptor,
    options: CollectionOptions<T>,
    cache_key: String,
    ttl: Duration,
    stats: StatsRecorder,
    disposed: AtomicBool,
    // Serializes one-shot fetches so overlapping refresh calls cannot
    // interleave their commits.
    fetch_gate: async_lock::Mutex<()>,
    state: Mutex<HandleState<T>>,
}

/// A live, cached, reactive view of one query.
///
/// The handle owns at most one backend listener for its whole lifetime and
/// is the only writer of its own state. Cloning shares the same underlying
/// subscription. Tear-down is explicit via [`dispose`](Self::dispose); there
/// is no automatic garbage collection of subscriptions.
pub struct CollectionHandle<T> {
    inner: Arc<HandleInner<T>>,
}

impl<T> Clone for CollectionHandle<T> {
    fn clone(&self) -> Self {
        Self {
            inner: Arc::clone(&self.inner),
        }
    }
}

impl<T> CollectionHandle<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    pub(crate) async fn attach(
        backend: Arc<dyn DocumentBackend>,
        cache: Arc<QueryCache>,
        descriptor: QueryDescriptor,
        options: CollectionOptions<T>,
    ) -> Self {
        let cache_key = match options.cache_key_fn() {
            Some(key_fn) => key_fn(&descriptor),
            None => descriptor.cache_key(),
        };
        let ttl = options.cache_ttl().unwrap_or(cache.config().ttl);
        let realtime = options.realtime();
        let inner = Arc::new(HandleInner {
            backend,
            cache,
            descriptor,
            options,
            cache_key,
            ttl,
            stats: StatsRecorder::new(),
            disposed: AtomicBool::new(false),
            fetch_gate: async_lock::Mutex::new(()),
            state: Mutex::new(HandleState {
                records: Arc::new(Vec::new()),
                loading: true,
                initialized: false,
                error: None,
                last_updated: None,
                phase: SubscriptionPhase::Idle,
                listener: None,
                observers: Vec::new(),
                senders: Vec::new(),
                observer_seq: 0,
            }),
        });

        // Stale-while-revalidate: a fresh cache entry commits immediately,
        // before any backend round-trip.
        let served_from_cache = match inner.cache.get_valid(&inner.cache_key, inner.ttl) {
            Some(entry) => {
                inner.stats.record_cache_hit();
                inner.apply_raw(entry.into_documents(), false);
                true
            }
            None => {
                inner.stats.record_cache_miss();
                false
            }
        };

        if realtime {
            HandleInner::attach_listener(&inner);
        } else if served_from_cache {
            inner.state.lock().unwrap().phase = SubscriptionPhase::Resolved;
        } else {
            inner.state.lock().unwrap().phase = SubscriptionPhase::Attaching;
            if let Err(err) = inner.run_fetch().await {
                log::debug!(
                    "initial fetch for '{}' failed: {err}",
                    inner.descriptor.collection_path()
                );
            }
            let mut state = inner.state.lock().unwrap();
            if !state.phase.is_disposed() {
                state.phase = SubscriptionPhase::Resolved;
            }
        }

        Self { inner }
    }

    /// The current record array. Each commit replaces the whole array, so
    /// clones taken here are never mutated afterwards.
    pub fn data(&self) -> Vec<T> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .map(|record| record.data.clone())
            .collect()
    }

    /// The current records with their identity keys, without copying.
    pub fn records(&self) -> Arc<Vec<DocumentRecord<T>>> {
        Arc::clone(&self.inner.state.lock().unwrap().records)
    }

    /// True from construction until the first snapshot or error commits,
    /// and again for the duration of an explicit refresh.
    pub fn loading(&self) -> bool {
        self.inner.state.lock().unwrap().loading
    }

    /// Flips to true exactly once, on the first successful or failed
    /// resolution, and never reverts.
    pub fn initialized(&self) -> bool {
        self.inner.state.lock().unwrap().initialized
    }

    /// The most recent classified error. Stale data and a fresh error can
    /// coexist after a failed revalidation.
    pub fn error(&self) -> Option<LiveQueryError> {
        self.inner.state.lock().unwrap().error.clone()
    }

    pub fn is_empty(&self) -> bool {
        self.inner.state.lock().unwrap().records.is_empty()
    }

    pub fn size(&self) -> usize {
        self.inner.state.lock().unwrap().records.len()
    }

    pub fn last_updated(&self) -> Option<DateTime<Utc>> {
        self.inner.state.lock().unwrap().last_updated
    }

    pub fn phase(&self) -> SubscriptionPhase {
        self.inner.state.lock().unwrap().phase
    }

    pub fn descriptor(&self) -> &QueryDescriptor {
        &self.inner.descriptor
    }

    pub fn cache_key(&self) -> &str {
        &self.inner.cache_key
    }

    pub fn stats(&self) -> CollectionStats {
        self.inner.stats.snapshot()
    }

    /// Forces a fresh one-shot fetch regardless of the current mode.
    ///
    /// Sets `loading` for the duration of the operation and leaves the
    /// subscription state untouched: a `Live` handle stays `Live`. On
    /// failure the error is both stored on the handle and returned.
    pub async fn refresh(&self) -> LiveQueryResult<()> {
        self.inner.run_fetch().await
    }

    /// Bypasses the cache, fetches from the backend, commits, and returns
    /// the fresh records.
    pub async fn get_from_server(&self) -> LiveQueryResult<Vec<T>> {
        self.inner.run_fetch().await?;
        Ok(self.data())
    }

    /// Switches between live and one-shot mode.
    ///
    /// Enabling realtime on an already-`Live` handle is a no-op; there is
    /// never more than one active listener. Disabling detaches the listener
    /// and keeps the last-known data.
    pub fn set_realtime(&self, realtime: bool) {
        if self.inner.disposed.load(AtomicOrdering::Acquire) {
            return;
        }
        if realtime {
            HandleInner::attach_listener(&self.inner);
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
                log::debug!(
                    "live listener detached for '{}'",
                    self.inner.descriptor.collection_path()
                );
            }
        }
    }

    /// Drops this query's entry from the shared cache.
    pub fn clear_cache(&self) {
        self.inner.cache.clear(Some(&self.inner.cache_key));
    }

    /// Registers a callback invoked after every committed snapshot. The
    /// returned closure unregisters it.
    pub fn on_update<F>(&self, callback: F) -> Unsubscribe
    where
        F: Fn(&ChangeSet<T>) + Send + Sync + 'static,
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

    /// A stream of committed change sets. The channel closes when the handle
    /// is disposed.
    pub fn updates(&self) -> async_channel::Receiver<ChangeSet<T>> {
        let (sender, receiver) = async_channel::unbounded();
        let mut state = self.inner.state.lock().unwrap();
        if !state.phase.is_disposed() {
            state.senders.push(sender);
        }
        receiver
    }

    /// Detaches the listener and refuses all further callbacks. Terminal.
    /// The shared cache is left untouched.
    pub fn dispose(&self) {
        if self.inner.disposed.swap(true, AtomicOrdering::SeqCst) {
            return;
        }
        let (listener, senders) = {
            let mut state = self.inner.state.lock().unwrap();
            state.phase = SubscriptionPhase::Disposed;
            state.loading = false;
            state.observers.clear();
            (state.listener.take(), std::mem::take(&mut state.senders))
        };
        if let Some(unsubscribe) = listener {
            unsubscribe();
        }
        drop(senders);
        log::debug!(
            "handle disposed for '{}'",
            self.inner.descriptor.collection_path()
        );
    }

    /// Creates a document in this handle's collection with a
    /// backend-assigned id and returns that id.
    pub async fn add(&self, record: &T) -> LiveQueryResult<String> {
        let fields = self.encode(record)?;
        let path = self.inner.descriptor.collection_path();
        let document = self
            .inner
            .backend
            .add_document(path, fields)
            .await
            .map_err(|err| classify(err, path))?;
        self.inner.stats.record_write();
        Ok(document.id)
    }

    /// Full overwrite of `id` in this handle's collection.
    pub async fn set(&self, id: &str, record: &T) -> LiveQueryResult<()> {
        let fields = self.encode(record)?;
        let path = self.inner.descriptor.collection_path();
        self.inner
            .backend
            .set_document(path, id, fields)
            .await
            .map_err(|err| classify(err, format!("{path}/{id}")))?;
        self.inner.stats.record_write();
        Ok(())
    }

    /// Partial update of an existing document.
    pub async fn update(&self, id: &str, fields: JsonFields) -> LiveQueryResult<()> {
        let path = self.inner.descriptor.collection_path();
        self.inner
            .backend
            .update_document(path, id, fields)
            .await
            .map_err(|err| classify(err, format!("{path}/{id}")))?;
        self.inner.stats.record_write();
        Ok(())
    }

    pub async fn delete(&self, id: &str) -> LiveQueryResult<()> {
        let path = self.inner.descriptor.collection_path();
        self.inner
            .backend
            .delete_document(path, id)
            .await
            .map_err(|err| classify(err, format!("{path}/{id}")))?;
        self.inner.stats.record_write();
        Ok(())
    }

    fn encode(&self, record: &T) -> LiveQueryResult<JsonFields> {
        if self.inner.disposed.load(AtomicOrdering::Acquire) {
            return Err(error::failed_precondition("handle is disposed")
                .with_path(self.inner.descriptor.collection_path()));
        }
        match serde_json::to_value(record) {
            Ok(Value::Object(mut fields)) => {
                // The id is synthetic; the backend assigns identity.
                fields.remove("id");
                Ok(fields)
            }
            Ok(_) => Err(error::failed_precondition(
                "records must serialize to a JSON object",
            )
            .with_path(self.inner.descriptor.collection_path())),
            Err(err) => Err(error::internal_error(format!(
                "failed to serialize record: {err}"
            ))),
        }
    }

    // ---- client-side helpers over the current snapshot ----

    pub fn filter<F: Fn(&T) -> bool>(&self, predicate: F) -> Vec<T> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|record| predicate(&record.data))
            .map(|record| record.data.clone())
            .collect()
    }

    pub fn find<F: Fn(&T) -> bool>(&self, predicate: F) -> Option<T> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|record| predicate(&record.data))
            .map(|record| record.data.clone())
    }

    pub fn find_by_id(&self, id: &str) -> Option<T> {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .find(|record| record.id == id)
            .map(|record| record.data.clone())
    }

    pub fn sorted_by<F: Fn(&T, &T) -> Ordering>(&self, comparator: F) -> Vec<T> {
        let mut data = self.data();
        data.sort_by(comparator);
        data
    }

    /// One page of the current snapshot; pages are 1-based.
    pub fn paginate(&self, page: usize, per_page: usize) -> Vec<T> {
        if per_page == 0 {
            return Vec::new();
        }
        let start = page.saturating_sub(1) * per_page;
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .skip(start)
            .take(per_page)
            .map(|record| record.data.clone())
            .collect()
    }

    pub fn group_by<K, F>(&self, key: F) -> BTreeMap<K, Vec<T>>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let mut groups: BTreeMap<K, Vec<T>> = BTreeMap::new();
        for record in self.inner.state.lock().unwrap().records.iter() {
            groups
                .entry(key(&record.data))
                .or_default()
                .push(record.data.clone());
        }
        groups
    }

    /// Records deduplicated by `key`; the first occurrence wins.
    pub fn unique_by<K, F>(&self, key: F) -> Vec<T>
    where
        K: Ord,
        F: Fn(&T) -> K,
    {
        let mut seen = BTreeSet::new();
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|record| seen.insert(key(&record.data)))
            .map(|record| record.data.clone())
            .collect()
    }

    pub fn count_where<F: Fn(&T) -> bool>(&self, predicate: F) -> usize {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .filter(|record| predicate(&record.data))
            .count()
    }

    pub fn any_match<F: Fn(&T) -> bool>(&self, predicate: F) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .any(|record| predicate(&record.data))
    }

    pub fn all_match<F: Fn(&T) -> bool>(&self, predicate: F) -> bool {
        self.inner
            .state
            .lock()
            .unwrap()
            .records
            .iter()
            .all(|record| predicate(&record.data))
    }
}

impl<T> HandleInner<T>
where
    T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
{
    /// Attaches the live listener, releasing any previous handle first so
    /// at most one listener exists. A no-op when already `Live` or disposed.
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
        let observer = SnapshotObserver::new(
            move |result| {
                if let Some(inner) = weak.upgrade() {
                    if inner.disposed.load(AtomicOrdering::Acquire) {
                        return;
                    }
                    inner.apply_raw(result, true);
                }
            },
            move |backend_error| {
                if let Some(inner) = weak_err.upgrade() {
                    if inner.disposed.load(AtomicOrdering::Acquire) {
                        return;
                    }
                    let path = inner.descriptor.collection_path().to_string();
                    log::warn!("live listener error on '{path}': {backend_error}");
                    // The listener stays attached; the backend re-delivers
                    // once it recovers.
                    inner.apply_error(classify(backend_error, path));
                }
            },
        );

        match inner.backend.subscribe(&inner.descriptor, observer) {
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
                } else {
                    log::debug!(
                        "live listener attached for '{}'",
                        inner.descriptor.collection_path()
                    );
                }
            }
            Err(backend_error) => {
                let path = inner.descriptor.collection_path().to_string();
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

    /// The single one-shot fetch path, shared by initial one-shot loads,
    /// `refresh`, and `get_from_server`.
    async fn run_fetch(&self) -> LiveQueryResult<()> {
        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(error::failed_precondition("handle is disposed")
                .with_path(self.descriptor.collection_path()));
        }
        let _gate = self.fetch_gate.lock().await;
        {
            let mut state = self.state.lock().unwrap();
            if state.phase.is_disposed() {
                return Err(error::failed_precondition("handle is disposed")
                    .with_path(self.descriptor.collection_path()));
            }
            state.loading = true;
        }

        let started = Instant::now();
        let result = self.backend.run_query(&self.descriptor).await;
        self.stats.record_query_latency(started.elapsed());

        // The backend call cannot be aborted; a result that arrives after
        // dispose is discarded instead.
        if self.disposed.load(AtomicOrdering::Acquire) {
            return Err(error::cancelled("handle disposed while a fetch was in flight")
                .with_path(self.descriptor.collection_path()));
        }

        match result {
            Ok(raw) => {
                self.apply_raw(raw, true);
                Ok(())
            }
            Err(backend_error) => {
                let classified = classify(backend_error, self.descriptor.collection_path());
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

    /// The single commit point: processes a raw snapshot and, on success,
    /// replaces the record array, stamps `last_updated`, clears the error,
    /// refreshes the cache, and notifies observers. On failure the previous
    /// records are preserved and only the error state changes.
    fn apply_raw(&self, raw: ResultSet, update_cache: bool) {
        let notify = {
            let mut state = self.state.lock().unwrap();
            if state.phase.is_disposed() {
                return;
            }
            let raw_for_cache = if update_cache { Some(raw.clone()) } else { None };
            match process_snapshot(
                raw,
                &state.records,
                &self.options,
                self.descriptor.collection_path(),
            ) {
                Ok(processed) => {
                    let records = Arc::new(processed.records);
                    let at = Utc::now();
                    state.records = Arc::clone(&records);
                    state.error = None;
                    state.loading = false;
                    state.initialized = true;
                    state.last_updated = Some(at);
                    if let Some(raw) = raw_for_cache {
                        self.cache.set(&self.cache_key, raw);
                    }
                    self.stats.record_read();
                    state.senders.retain(|sender| !sender.is_closed());
                    let observers: Vec<ObserverFn<T>> = state
                        .observers
                        .iter()
                        .map(|(_, observer)| Arc::clone(observer))
                        .collect();
                    let senders = state.senders.clone();
                    Some((
                        ChangeSet {
                            records,
                            changes: processed.changes,
                            at,
                        },
                        observers,
                        senders,
                    ))
                }
                Err(err) => {
                    log::warn!(
                        "snapshot processing failed for '{}': {err}",
                        self.descriptor.collection_path()
                    );
                    state.error = Some(err);
                    state.loading = false;
                    state.initialized = true;
                    None
                }
            }
        };

        // Observers run outside the state lock; they are free to read the
        // handle's getters.
        if let Some((change_set, observers, senders)) = notify {
            for observer in &observers {
                observer(&change_set);
            }
            for sender in &senders {
                let _ = sender.try_send(change_set.clone());
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
