use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering as AtomicOrdering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use rand::distributions::Alphanumeric;
use rand::{thread_rng, Rng};
use serde_json::Value;

use crate::query::{CursorBound, FilterOperator, OrderDirection, QueryDescriptor};

use super::{
    BackendError, BackendResult, DocumentBackend, DocumentObserver, JsonFields, RawDocument,
    ResultSet, SnapshotObserver, Unsubscribe,
};

const AUTO_ID_LENGTH: usize = 20;

struct QueryListener {
    id: u64,
    query: QueryDescriptor,
    observer: SnapshotObserver,
}

struct DocListener {
    id: u64,
    collection: String,
    doc_id: String,
    observer: DocumentObserver,
}

#[derive(Default)]
struct MemoryInner {
    collections: Mutex<BTreeMap<String, BTreeMap<String, JsonFields>>>,
    query_listeners: Mutex<Vec<QueryListener>>,
    doc_listeners: Mutex<Vec<DocListener>>,
    listener_seq: AtomicU64,
    fail_next_query: Mutex<Option<BackendError>>,
}

/// A complete in-memory backend.
///
/// Documents live in nested ordered maps, queries are evaluated against the
/// current contents, and every write re-dispatches the affected listeners.
/// Listener registration synchronously delivers the initial snapshot, so a
/// subscriber always observes the current state before any change events.
///
/// Useful for tests and demos where no real backend is available; the error
/// injection hooks exist for failure-path tests.
#[derive(Clone, Default)]
pub struct MemoryBackend {
    inner: Arc<MemoryInner>,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Inserts a document without going through the async write path.
    /// Listeners are dispatched exactly as for a regular write.
    pub fn seed(&self, collection: &str, id: &str, value: Value) {
        let fields = match value {
            Value::Object(map) => map,
            other => {
                let mut map = JsonFields::new();
                map.insert("value".to_string(), other);
                map
            }
        };
        self.write_set(collection, id, fields);
    }

    /// Atomically replaces the entire contents of `collection` and emits a
    /// single snapshot to each of its listeners.
    pub fn replace_collection(&self, collection: &str, documents: Vec<(String, Value)>) {
        {
            let mut collections = self.inner.collections.lock().unwrap();
            let entries = collections.entry(collection.to_string()).or_default();
            entries.clear();
            for (id, value) in documents {
                if let Value::Object(map) = value {
                    entries.insert(id, map);
                }
            }
        }
        self.dispatch_collection(collection);
    }

    /// Makes the next `run_query` call fail with the given status.
    pub fn fail_next_query(&self, status: &str, message: &str) {
        *self.inner.fail_next_query.lock().unwrap() = Some(BackendError::new(status, message));
    }

    /// Pushes an error to every live query listener on `collection`.
    pub fn emit_query_error(&self, collection: &str, status: &str, message: &str) {
        let observers: Vec<SnapshotObserver> = {
            let listeners = self.inner.query_listeners.lock().unwrap();
            listeners
                .iter()
                .filter(|l| l.query.collection_path() == collection)
                .map(|l| l.observer.clone())
                .collect()
        };
        let error = BackendError::new(status, message);
        for observer in observers {
            observer.error(error.clone());
        }
    }

    pub fn active_listener_count(&self) -> usize {
        self.inner.query_listeners.lock().unwrap().len()
            + self.inner.doc_listeners.lock().unwrap().len()
    }

    pub fn document_count(&self, collection: &str) -> usize {
        self.inner
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .map(|docs| docs.len())
            .unwrap_or(0)
    }

    fn next_listener_id(&self) -> u64 {
        self.inner.listener_seq.fetch_add(1, AtomicOrdering::SeqCst)
    }

    fn evaluate(&self, query: &QueryDescriptor) -> ResultSet {
        let documents: Vec<RawDocument> = {
            let collections = self.inner.collections.lock().unwrap();
            collections
                .get(query.collection_path())
                .map(|docs| {
                    docs.iter()
                        .map(|(id, fields)| RawDocument::new(id.clone(), fields.clone()))
                        .collect()
                })
                .unwrap_or_default()
        };
        apply_query(documents, query)
    }

    fn current_document(&self, collection: &str, id: &str) -> Option<RawDocument> {
        self.inner
            .collections
            .lock()
            .unwrap()
            .get(collection)
            .and_then(|docs| docs.get(id))
            .map(|fields| RawDocument::new(id, fields.clone()))
    }

    fn write_set(&self, collection: &str, id: &str, fields: JsonFields) {
        {
            let mut collections = self.inner.collections.lock().unwrap();
            collections
                .entry(collection.to_string())
                .or_default()
                .insert(id.to_string(), fields);
        }
        self.dispatch_collection(collection);
        self.dispatch_document(collection, id);
    }

    fn dispatch_collection(&self, collection: &str) {
        let matching: Vec<(QueryDescriptor, SnapshotObserver)> = {
            let listeners = self.inner.query_listeners.lock().unwrap();
            listeners
                .iter()
                .filter(|l| l.query.collection_path() == collection)
                .map(|l| (l.query.clone(), l.observer.clone()))
                .collect()
        };
        for (query, observer) in matching {
            observer.next(self.evaluate(&query));
        }
    }

    fn dispatch_document(&self, collection: &str, id: &str) {
        let matching: Vec<DocumentObserver> = {
            let listeners = self.inner.doc_listeners.lock().unwrap();
            listeners
                .iter()
                .filter(|l| l.collection == collection && l.doc_id == id)
                .map(|l| l.observer.clone())
                .collect()
        };
        if matching.is_empty() {
            return;
        }
        let current = self.current_document(collection, id);
        for observer in matching {
            observer.next(current.clone());
        }
    }
}

#[async_trait]
impl DocumentBackend for MemoryBackend {
    async fn run_query(&self, query: &QueryDescriptor) -> BackendResult<ResultSet> {
        if let Some(error) = self.inner.fail_next_query.lock().unwrap().take() {
            return Err(error);
        }
        Ok(self.evaluate(query))
    }

    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> BackendResult<Option<RawDocument>> {
        Ok(self.current_document(collection, id))
    }

    fn subscribe(
        &self,
        query: &QueryDescriptor,
        observer: SnapshotObserver,
    ) -> BackendResult<Unsubscribe> {
        let id = self.next_listener_id();
        {
            let mut listeners = self.inner.query_listeners.lock().unwrap();
            listeners.push(QueryListener {
                id,
                query: query.clone(),
                observer: observer.clone(),
            });
        }
        observer.next(self.evaluate(query));

        let inner = Arc::clone(&self.inner);
        Ok(Box::new(move || {
            inner
                .query_listeners
                .lock()
                .unwrap()
                .retain(|l| l.id != id);
        }))
    }

    fn subscribe_document(
        &self,
        collection: &str,
        id: &str,
        observer: DocumentObserver,
    ) -> BackendResult<Unsubscribe> {
        let listener_id = self.next_listener_id();
        {
            let mut listeners = self.inner.doc_listeners.lock().unwrap();
            listeners.push(DocListener {
                id: listener_id,
                collection: collection.to_string(),
                doc_id: id.to_string(),
                observer: observer.clone(),
            });
        }
        observer.next(self.current_document(collection, id));

        let inner = Arc::clone(&self.inner);
        Ok(Box::new(move || {
            inner
                .doc_listeners
                .lock()
                .unwrap()
                .retain(|l| l.id != listener_id);
        }))
    }

    async fn add_document(
        &self,
        collection: &str,
        fields: JsonFields,
    ) -> BackendResult<RawDocument> {
        let id = generate_auto_id();
        self.write_set(collection, &id, fields.clone());
        Ok(RawDocument::new(id, fields))
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()> {
        self.write_set(collection, id, fields);
        Ok(())
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()> {
        {
            let mut collections = self.inner.collections.lock().unwrap();
            let existing = collections
                .get_mut(collection)
                .and_then(|docs| docs.get_mut(id));
            match existing {
                Some(current) => {
                    for (key, value) in fields {
                        current.insert(key, value);
                    }
                }
                None => {
                    return Err(BackendError::new(
                        "not-found",
                        format!("no document to update at '{collection}/{id}'"),
                    ));
                }
            }
        }
        self.dispatch_collection(collection);
        self.dispatch_document(collection, id);
        Ok(())
    }

    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()> {
        let removed = {
            let mut collections = self.inner.collections.lock().unwrap();
            collections
                .get_mut(collection)
                .map(|docs| docs.remove(id).is_some())
                .unwrap_or(false)
        };
        if removed {
            self.dispatch_collection(collection);
            self.dispatch_document(collection, id);
        }
        Ok(())
    }
}

fn generate_auto_id() -> String {
    thread_rng()
        .sample_iter(&Alphanumeric)
        .take(AUTO_ID_LENGTH)
        .map(char::from)
        .collect()
}

/// Applies a descriptor's filters, orderings, cursor bounds, and limit to a
/// candidate document list. Documents arrive in id order; the sort is stable,
/// so ties keep that order.
fn apply_query(documents: Vec<RawDocument>, query: &QueryDescriptor) -> Vec<RawDocument> {
    let mut filtered: Vec<RawDocument> = documents
        .into_iter()
        .filter(|doc| satisfies_filters(doc, query))
        .collect();

    let orderings = query.orderings();
    if !orderings.is_empty() {
        filtered.sort_by(|left, right| compare_documents(left, right, &orderings));
    }

    if let Some(bound) = query.start_bound() {
        filtered.retain(|doc| !before_start_bound(doc, &bound, &orderings));
    }
    if let Some(bound) = query.end_bound() {
        filtered.retain(|doc| !after_end_bound(doc, &bound, &orderings));
    }

    if let Some(limit) = query.limit() {
        filtered.truncate(limit as usize);
    }

    filtered
}

fn satisfies_filters(document: &RawDocument, query: &QueryDescriptor) -> bool {
    query.filters().all(|(field, op, expected)| {
        match field_value(document, field) {
            Some(actual) => evaluate_filter(op, actual, expected),
            // Missing fields only ever match a not-equal against a
            // non-null expectation.
            None => match op {
                FilterOperator::NotEqual => evaluate_filter(op, &Value::Null, expected),
                _ => false,
            },
        }
    })
}

fn evaluate_filter(op: FilterOperator, actual: &Value, expected: &Value) -> bool {
    match op {
        FilterOperator::Equal => actual == expected,
        FilterOperator::NotEqual => actual != expected,
        FilterOperator::LessThan => compare_values(actual, expected) == Some(Ordering::Less),
        FilterOperator::LessThanOrEqual => matches!(
            compare_values(actual, expected),
            Some(Ordering::Less | Ordering::Equal)
        ),
        FilterOperator::GreaterThan => {
            compare_values(actual, expected) == Some(Ordering::Greater)
        }
        FilterOperator::GreaterThanOrEqual => matches!(
            compare_values(actual, expected),
            Some(Ordering::Greater | Ordering::Equal)
        ),
        FilterOperator::ArrayContains => match actual {
            Value::Array(items) => items.contains(expected),
            _ => false,
        },
        FilterOperator::ArrayContainsAny => match (actual, expected) {
            (Value::Array(items), Value::Array(needles)) => {
                needles.iter().any(|needle| items.contains(needle))
            }
            _ => false,
        },
        FilterOperator::In => match expected {
            Value::Array(candidates) => candidates.contains(actual),
            _ => false,
        },
        FilterOperator::NotIn => match expected {
            Value::Array(candidates) => {
                !actual.is_null() && !candidates.contains(actual)
            }
            _ => false,
        },
    }
}

/// Dot-separated field lookup into nested objects.
fn field_value<'a>(document: &'a RawDocument, field: &str) -> Option<&'a Value> {
    let mut segments = field.split('.');
    let first = segments.next()?;
    let mut current = document.fields.get(first)?;
    for segment in segments {
        current = current.as_object()?.get(segment)?;
    }
    Some(current)
}

fn compare_documents(
    left: &RawDocument,
    right: &RawDocument,
    orderings: &[(&str, OrderDirection)],
) -> Ordering {
    for (field, direction) in orderings {
        let left_value = field_value(left, field).unwrap_or(&Value::Null);
        let right_value = field_value(right, field).unwrap_or(&Value::Null);
        let mut ordering = compare_values(left_value, right_value).unwrap_or(Ordering::Equal);
        if *direction == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}

fn compare_values(left: &Value, right: &Value) -> Option<Ordering> {
    match (left, right) {
        (Value::Null, Value::Null) => Some(Ordering::Equal),
        (Value::Bool(a), Value::Bool(b)) => Some(a.cmp(b)),
        (Value::Number(a), Value::Number(b)) => {
            a.as_f64().and_then(|a| b.as_f64().and_then(|b| a.partial_cmp(&b)))
        }
        (Value::String(a), Value::String(b)) => Some(a.cmp(b)),
        _ => None,
    }
}

fn before_start_bound(
    document: &RawDocument,
    bound: &CursorBound<'_>,
    orderings: &[(&str, OrderDirection)],
) -> bool {
    let ordering = compare_to_bound(document, bound.values, orderings);
    if bound.is_inclusive() {
        ordering == Ordering::Less
    } else {
        ordering != Ordering::Greater
    }
}

fn after_end_bound(
    document: &RawDocument,
    bound: &CursorBound<'_>,
    orderings: &[(&str, OrderDirection)],
) -> bool {
    let ordering = compare_to_bound(document, bound.values, orderings);
    if bound.is_inclusive() {
        ordering == Ordering::Greater
    } else {
        ordering != Ordering::Less
    }
}

fn compare_to_bound(
    document: &RawDocument,
    values: &[Value],
    orderings: &[(&str, OrderDirection)],
) -> Ordering {
    for (index, (field, direction)) in orderings.iter().enumerate() {
        let Some(bound_value) = values.get(index) else {
            break;
        };
        let document_value = field_value(document, field).unwrap_or(&Value::Null);
        let mut ordering = compare_values(document_value, bound_value).unwrap_or(Ordering::Equal);
        if *direction == OrderDirection::Descending {
            ordering = ordering.reverse();
        }
        if ordering != Ordering::Equal {
            return ordering;
        }
    }
    Ordering::Equal
}
