//! Reactive live-query collection cache over pluggable document backends.
//!
//! `livequery` turns a collection path plus an ordered constraint list into
//! a live, cached, reactive array of typed records. A
//! [`CollectionHandle`] owns at most one backend listener, keeps
//! `data`/`loading`/`error`/`last_updated` state, diffs every snapshot into
//! added/modified/removed change records, and shares a TTL-bounded query
//! cache with every other handle created by the same [`LiveQueryClient`].
//!
//! The backend is a trait object ([`backend::DocumentBackend`]) injected at
//! client construction; [`backend::MemoryBackend`] is a complete in-memory
//! implementation for tests and demos.
//!
//! ```no_run
//! use std::sync::Arc;
//!
//! use livequery::backend::MemoryBackend;
//! use livequery::{CollectionOptions, FilterOperator, LiveQueryClient, QueryBuilder};
//! use serde::{Deserialize, Serialize};
//!
//! #[derive(Clone, Debug, Deserialize, Serialize)]
//! struct User {
//!     id: String,
//!     name: String,
//!     active: bool,
//! }
//!
//! # async fn run() {
//! let client = LiveQueryClient::new(Arc::new(MemoryBackend::new()));
//! let users = client
//!     .collection::<User>(
//!         "users",
//!         QueryBuilder::new()
//!             .where_field("active", FilterOperator::Equal, true)
//!             .build(),
//!         CollectionOptions::default(),
//!     )
//!     .await;
//!
//! println!("{} active users", users.size());
//! users.dispose();
//! # }
//! ```

pub mod backend;
pub mod cache;
pub mod client;
pub mod collection;
pub mod document;
pub mod error;
pub mod query;
pub mod stats;

pub use cache::{CacheConfig, QueryCache};
pub use client::LiveQueryClient;
pub use collection::{
    ChangeSet, ChangeType, CollectionHandle, CollectionOptions, DocumentChange, DocumentRecord,
    SubscriptionPhase,
};
pub use document::{DocumentHandle, DocumentOptions};
pub use error::{ErrorCode, LiveQueryError, LiveQueryResult};
pub use query::{
    Constraint, CursorKind, FilterOperator, OrderDirection, QueryBuilder, QueryDescriptor,
};
pub use stats::CollectionStats;
