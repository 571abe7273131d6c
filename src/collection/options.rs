use std::cmp::Ordering;
use std::sync::Arc;
use std::time::Duration;

use crate::error::LiveQueryResult;
use crate::query::QueryDescriptor;

/// Per-record rewrite hook. A returned error aborts the whole snapshot
/// update; nothing is partially committed.
pub type TransformFn<T> = Arc<dyn Fn(T) -> LiveQueryResult<T> + Send + Sync + 'static>;

/// Client-side predicate applied after transform; records that fail it are
/// dropped from the committed array.
pub type FilterFn<T> = Arc<dyn Fn(&T) -> bool + Send + Sync + 'static>;

/// Client-side comparator applied after filtering; the sort is stable.
pub type SortFn<T> = Arc<dyn Fn(&T, &T) -> Ordering + Send + Sync + 'static>;

/// Overrides the default cache-key derivation for a query.
pub type CacheKeyFn = Arc<dyn Fn(&QueryDescriptor) -> String + Send + Sync + 'static>;

/// Behavior knobs for a collection handle.
pub struct CollectionOptions<T> {
    realtime: bool,
    cache_ttl: Option<Duration>,
    cache_key: Option<CacheKeyFn>,
    transform: Option<TransformFn<T>>,
    filter: Option<FilterFn<T>>,
    sort: Option<SortFn<T>>,
}

impl<T> Default for CollectionOptions<T> {
    fn default() -> Self {
        Self {
            realtime: true,
            cache_ttl: None,
            cache_key: None,
            transform: None,
            filter: None,
            sort: None,
        }
    }
}

impl<T> Clone for CollectionOptions<T> {
    fn clone(&self) -> Self {
        Self {
            realtime: self.realtime,
            cache_ttl: self.cache_ttl,
            cache_key: self.cache_key.clone(),
            transform: self.transform.clone(),
            filter: self.filter.clone(),
            sort: self.sort.clone(),
        }
    }
}

impl<T> CollectionOptions<T> {
    pub fn new() -> Self {
        Self::default()
    }

    /// Starts the handle in one-shot mode: a single fetch, no live listener.
    pub fn one_shot() -> Self {
        Self::default().with_realtime(false)
    }

    pub fn with_realtime(mut self, realtime: bool) -> Self {
        self.realtime = realtime;
        self
    }

    /// Overrides the shared cache's TTL for this handle's entries.
    pub fn with_cache_ttl(mut self, ttl: Duration) -> Self {
        self.cache_ttl = Some(ttl);
        self
    }

    pub fn with_cache_key<F>(mut self, key: F) -> Self
    where
        F: Fn(&QueryDescriptor) -> String + Send + Sync + 'static,
    {
        self.cache_key = Some(Arc::new(key));
        self
    }

    pub fn with_transform<F>(mut self, transform: F) -> Self
    where
        F: Fn(T) -> LiveQueryResult<T> + Send + Sync + 'static,
    {
        self.transform = Some(Arc::new(transform));
        self
    }

    pub fn with_filter<F>(mut self, filter: F) -> Self
    where
        F: Fn(&T) -> bool + Send + Sync + 'static,
    {
        self.filter = Some(Arc::new(filter));
        self
    }

    pub fn with_sort<F>(mut self, sort: F) -> Self
    where
        F: Fn(&T, &T) -> Ordering + Send + Sync + 'static,
    {
        self.sort = Some(Arc::new(sort));
        self
    }

    pub fn realtime(&self) -> bool {
        self.realtime
    }

    pub fn cache_ttl(&self) -> Option<Duration> {
        self.cache_ttl
    }

    pub(crate) fn cache_key_fn(&self) -> Option<&CacheKeyFn> {
        self.cache_key.as_ref()
    }

    pub(crate) fn transform(&self) -> Option<&TransformFn<T>> {
        self.transform.as_ref()
    }

    pub(crate) fn filter(&self) -> Option<&FilterFn<T>> {
        self.filter.as_ref()
    }

    pub(crate) fn sort(&self) -> Option<&SortFn<T>> {
        self.sort.as_ref()
    }
}
