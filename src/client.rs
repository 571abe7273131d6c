use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::backend::DocumentBackend;
use crate::cache::{CacheConfig, QueryCache};
use crate::collection::{CollectionHandle, CollectionOptions};
use crate::document::{DocumentHandle, DocumentOptions};
use crate::query::{Constraint, QueryDescriptor};

/// The entry point: a backend plus the query cache shared by every handle
/// it creates.
///
/// The backend is injected explicitly; there are no process-global service
/// instances. Cloning the client shares the backend and the cache, so
/// handles created from clones still share cache entries per logical query.
#[derive(Clone)]
pub struct LiveQueryClient {
    backend: Arc<dyn DocumentBackend>,
    cache: Arc<QueryCache>,
}

impl LiveQueryClient {
    pub fn new(backend: Arc<dyn DocumentBackend>) -> Self {
        Self::with_cache_config(backend, CacheConfig::default())
    }

    pub fn with_cache_config(backend: Arc<dyn DocumentBackend>, config: CacheConfig) -> Self {
        Self {
            backend,
            cache: Arc::new(QueryCache::new(config)),
        }
    }

    pub fn backend(&self) -> &Arc<dyn DocumentBackend> {
        &self.backend
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.cache
    }

    /// Opens a reactive handle over `path` with the given constraints.
    ///
    /// Returns once the handle is usable: a valid cache entry or one-shot
    /// fetch has committed, or the live listener is attached. Construction
    /// itself never fails; fetch and listener errors land on the handle's
    /// `error()` field.
    pub async fn collection<T>(
        &self,
        path: &str,
        constraints: Vec<Constraint>,
        options: CollectionOptions<T>,
    ) -> CollectionHandle<T>
    where
        T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
    {
        let descriptor = QueryDescriptor::new(path, constraints);
        CollectionHandle::attach(
            Arc::clone(&self.backend),
            Arc::clone(&self.cache),
            descriptor,
            options,
        )
        .await
    }

    /// Opens a reactive handle over the single document `collection/id`.
    pub async fn document<T>(
        &self,
        collection: &str,
        id: &str,
        options: DocumentOptions,
    ) -> DocumentHandle<T>
    where
        T: DeserializeOwned + Serialize + Clone + Send + Sync + 'static,
    {
        DocumentHandle::attach(
            Arc::clone(&self.backend),
            collection.to_string(),
            id.to_string(),
            options,
        )
        .await
    }
}
