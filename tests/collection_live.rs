use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use serde_json::json;

use livequery::backend::{
    BackendResult, DocumentBackend, DocumentObserver, JsonFields, MemoryBackend, RawDocument,
    ResultSet, SnapshotObserver, Unsubscribe,
};
use livequery::{
    CacheConfig, CollectionOptions, ErrorCode, FilterOperator, LiveQueryClient, OrderDirection,
    QueryBuilder, QueryCache, QueryDescriptor, SubscriptionPhase,
};

#[derive(Clone, Debug, Deserialize, PartialEq, Serialize)]
struct User {
    id: String,
    name: String,
    active: bool,
    #[serde(default)]
    age: u32,
}

fn seeded_backend() -> MemoryBackend {
    let backend = MemoryBackend::new();
    backend.seed("users", "ada", json!({"name": "Ada", "active": true, "age": 36}));
    backend.seed("users", "grace", json!({"name": "Grace", "active": true, "age": 45}));
    backend.seed("users", "alan", json!({"name": "Alan", "active": true, "age": 41}));
    backend.seed("users", "carl", json!({"name": "Carl", "active": false, "age": 52}));
    backend.seed("users", "rosa", json!({"name": "Rosa", "active": false, "age": 33}));
    backend
}

fn active_users_constraints() -> Vec<livequery::Constraint> {
    QueryBuilder::new()
        .where_field("active", FilterOperator::Equal, true)
        .build()
}

/// Wraps the in-memory backend with an artificial one-shot latency so tests
/// can observe in-flight state.
struct SlowBackend {
    inner: MemoryBackend,
    delay: Duration,
}

impl SlowBackend {
    fn new(inner: MemoryBackend, delay: Duration) -> Self {
        Self { inner, delay }
    }
}

#[async_trait]
impl DocumentBackend for SlowBackend {
    async fn run_query(&self, query: &QueryDescriptor) -> BackendResult<ResultSet> {
        tokio::time::sleep(self.delay).await;
        self.inner.run_query(query).await
    }

    async fn get_document(
        &self,
        collection: &str,
        id: &str,
    ) -> BackendResult<Option<RawDocument>> {
        tokio::time::sleep(self.delay).await;
        self.inner.get_document(collection, id).await
    }

    fn subscribe(
        &self,
        query: &QueryDescriptor,
        observer: SnapshotObserver,
    ) -> BackendResult<Unsubscribe> {
        self.inner.subscribe(query, observer)
    }

    fn subscribe_document(
        &self,
        collection: &str,
        id: &str,
        observer: DocumentObserver,
    ) -> BackendResult<Unsubscribe> {
        self.inner.subscribe_document(collection, id, observer)
    }

    async fn add_document(
        &self,
        collection: &str,
        fields: JsonFields,
    ) -> BackendResult<RawDocument> {
        self.inner.add_document(collection, fields).await
    }

    async fn set_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()> {
        self.inner.set_document(collection, id, fields).await
    }

    async fn update_document(
        &self,
        collection: &str,
        id: &str,
        fields: JsonFields,
    ) -> BackendResult<()> {
        self.inner.update_document(collection, id, fields).await
    }

    async fn delete_document(&self, collection: &str, id: &str) -> BackendResult<()> {
        self.inner.delete_document(collection, id).await
    }
}

#[tokio::test]
async fn filtered_query_returns_only_matching_records() {
    let client = LiveQueryClient::new(Arc::new(seeded_backend()));
    let users = client
        .collection::<User>("users", active_users_constraints(), CollectionOptions::default())
        .await;

    assert_eq!(users.size(), 3);
    assert!(users.error().is_none());
    assert!(users.all_match(|user| user.active));
    assert!(!users.loading());
    users.dispose();
}

#[tokio::test]
async fn identical_constraint_sequences_share_a_cache_entry() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));

    let first = client
        .collection::<User>("users", active_users_constraints(), CollectionOptions::one_shot())
        .await;
    assert_eq!(first.size(), 3);
    let key = first.cache_key().to_string();
    first.dispose();

    // Any backend round-trip would now fail; the second construction must be
    // served from the cache before one happens.
    backend.fail_next_query("unavailable", "backend offline");

    let second = client
        .collection::<User>("users", active_users_constraints(), CollectionOptions::one_shot())
        .await;
    assert_eq!(second.cache_key(), key);
    assert_eq!(second.size(), 3);
    assert!(second.error().is_none());
    assert_eq!(second.stats().cache_hits, 1);

    // The injected failure was never consumed.
    let err = second.refresh().await.expect_err("armed failure fires now");
    assert_eq!(err.code(), ErrorCode::Unavailable);
    second.dispose();
}

#[tokio::test]
async fn get_from_server_bypasses_the_cache() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::one_shot())
        .await;
    assert_eq!(users.size(), 5);

    // The cache entry written by the initial fetch is still valid, but the
    // server call must not be answered from it.
    backend.seed("users", "tim", json!({"name": "Tim", "active": true, "age": 28}));
    assert_eq!(users.size(), 5, "one-shot data is stale until asked");

    let fresh = users.get_from_server().await.expect("server fetch");
    assert_eq!(fresh.len(), 6);
    assert_eq!(users.size(), 6, "the fetch commits to the handle");
    users.dispose();
}

#[tokio::test]
async fn snapshot_diff_reports_exact_changes() {
    let backend = MemoryBackend::new();
    backend.seed("users", "a", json!({"name": "A", "active": true, "age": 1}));
    backend.seed("users", "b", json!({"name": "B", "active": true, "age": 2}));

    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    let changes = Arc::new(Mutex::new(Vec::new()));
    let sink = Arc::clone(&changes);
    let _unsubscribe = users.on_update(move |change_set| {
        sink.lock().unwrap().push(change_set.clone());
    });

    backend.replace_collection(
        "users",
        vec![
            ("a".to_string(), json!({"name": "A", "active": true, "age": 1})),
            ("c".to_string(), json!({"name": "C", "active": true, "age": 3})),
        ],
    );

    let recorded = changes.lock().unwrap();
    let last = recorded.last().expect("a change set was delivered");
    assert_eq!(last.changes.len(), 2);
    assert_eq!(last.added().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["c"]);
    assert_eq!(last.removed().map(|c| c.id.as_str()).collect::<Vec<_>>(), ["b"]);
    assert_eq!(last.modified().count(), 0);
    users.dispose();
}

#[tokio::test]
async fn enabling_realtime_twice_keeps_a_single_listener() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    assert_eq!(users.phase(), SubscriptionPhase::Live);
    assert_eq!(backend.active_listener_count(), 1);

    users.set_realtime(true);
    users.set_realtime(true);
    assert_eq!(backend.active_listener_count(), 1);

    users.set_realtime(false);
    assert_eq!(backend.active_listener_count(), 0);
    assert_eq!(users.phase(), SubscriptionPhase::Resolved);

    users.set_realtime(true);
    assert_eq!(backend.active_listener_count(), 1);
    users.dispose();
    assert_eq!(backend.active_listener_count(), 0);
}

#[tokio::test]
async fn initialized_flips_once_and_never_reverts() {
    let backend = seeded_backend();
    backend.fail_next_query("permission-denied", "denied by rules");
    let client = LiveQueryClient::new(Arc::new(backend.clone()));

    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::one_shot())
        .await;

    // First resolution failed, but it still counts as initialization.
    assert!(users.initialized());
    assert!(!users.loading());
    let err = users.error().expect("classified error");
    assert_eq!(err.code(), ErrorCode::PermissionDenied);
    assert!(!err.is_retryable());

    users.refresh().await.expect("second fetch succeeds");
    assert!(users.initialized());
    assert!(users.error().is_none());
    assert_eq!(users.size(), 5);
    users.dispose();
    assert!(users.initialized());
}

#[tokio::test]
async fn cache_eviction_keeps_the_most_recently_written_entries() {
    let cache = QueryCache::new(CacheConfig::default().with_max_size(4));
    for i in 0..7 {
        cache.set(&format!("users|{i}"), Vec::new());
    }
    assert_eq!(cache.len(), 4);
    for i in 3..7 {
        assert!(cache.get(&format!("users|{i}")).is_some());
    }
    for i in 0..3 {
        assert!(cache.get(&format!("users|{i}")).is_none());
    }
}

#[tokio::test]
async fn failing_transform_preserves_previous_data() {
    let backend = MemoryBackend::new();
    backend.seed("users", "a", json!({"name": "A", "active": true}));
    backend.seed("users", "b", json!({"name": "B", "active": true}));

    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let options = CollectionOptions::default().with_transform(|user: User| {
        if user.name == "Poison" {
            Err(livequery::error::internal_error("transform rejected record"))
        } else {
            Ok(user)
        }
    });
    let users = client.collection::<User>("users", Vec::new(), options).await;
    assert_eq!(users.size(), 2);
    assert!(users.error().is_none());
    let before = users.data();

    backend.seed("users", "p", json!({"name": "Poison", "active": true}));

    let err = users.error().expect("processing error is surfaced");
    assert_eq!(err.code(), ErrorCode::Internal);
    assert_eq!(users.data(), before, "no partial commit");
    assert_eq!(users.size(), 2);
    users.dispose();
}

#[tokio::test]
async fn dispose_discards_an_in_flight_fetch() {
    let backend = seeded_backend();
    let slow = Arc::new(SlowBackend::new(backend, Duration::from_millis(50)));
    let client = LiveQueryClient::new(slow);

    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::one_shot())
        .await;
    assert_eq!(users.size(), 5);
    let last_updated = users.last_updated();

    let refreshing = {
        let users = users.clone();
        tokio::spawn(async move { users.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    users.dispose();

    let result = refreshing.await.expect("task completes");
    let err = result.expect_err("in-flight fetch is discarded");
    assert_eq!(err.code(), ErrorCode::Cancelled);

    assert_eq!(users.size(), 5, "post-dispose reads keep pre-dispose values");
    assert_eq!(users.last_updated(), last_updated);
    assert!(!users.loading());
}

#[tokio::test]
async fn refresh_toggles_loading_and_keeps_the_listener_attached() {
    let backend = seeded_backend();
    let slow = Arc::new(SlowBackend::new(backend.clone(), Duration::from_millis(50)));
    let client = LiveQueryClient::new(slow);

    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;
    assert_eq!(users.phase(), SubscriptionPhase::Live);
    assert!(!users.loading());

    let refreshing = {
        let users = users.clone();
        tokio::spawn(async move { users.refresh().await })
    };
    tokio::time::sleep(Duration::from_millis(10)).await;
    assert!(users.loading(), "loading is set for the refresh duration");

    refreshing
        .await
        .expect("task completes")
        .expect("refresh succeeds");
    assert!(!users.loading());
    assert_eq!(users.phase(), SubscriptionPhase::Live);

    // A native push still lands, so the listener survived the refresh.
    backend.seed("users", "chi", json!({"name": "Chi", "active": true, "age": 20}));
    assert_eq!(users.size(), 6);
    users.dispose();
}

#[tokio::test]
async fn retryable_listener_error_recovers_on_the_next_push() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    backend.emit_query_error("users", "unavailable", "transient outage");
    let err = users.error().expect("listener error is surfaced");
    assert_eq!(err.code(), ErrorCode::Unavailable);
    assert!(err.is_retryable());
    assert_eq!(users.size(), 5, "stale data survives the error");
    assert_eq!(backend.active_listener_count(), 1);

    // The backend recovers and pushes again without caller action.
    backend.seed("users", "tim", json!({"name": "Tim", "active": true, "age": 28}));
    assert!(users.error().is_none());
    assert_eq!(users.size(), 6);
    users.dispose();
}

#[tokio::test]
async fn updates_channel_delivers_change_sets_and_closes_on_dispose() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    let updates = users.updates();
    backend.seed("users", "tim", json!({"name": "Tim", "active": true, "age": 28}));

    let change_set = updates.recv().await.expect("change set delivered");
    assert_eq!(change_set.added().count(), 1);
    assert_eq!(change_set.records.len(), 6);

    users.dispose();
    assert!(updates.recv().await.is_err(), "channel closes on dispose");
}

#[tokio::test]
async fn on_update_unsubscribe_stops_notifications() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    let seen = Arc::new(AtomicUsize::new(0));
    let counter = Arc::clone(&seen);
    let unsubscribe = users.on_update(move |_| {
        counter.fetch_add(1, Ordering::SeqCst);
    });

    backend.seed("users", "x", json!({"name": "X", "active": true}));
    assert_eq!(seen.load(Ordering::SeqCst), 1);

    unsubscribe();
    backend.seed("users", "y", json!({"name": "Y", "active": true}));
    assert_eq!(seen.load(Ordering::SeqCst), 1);
    users.dispose();
}

#[tokio::test]
async fn mutations_pass_through_and_count_as_writes() {
    let backend = seeded_backend();
    let client = LiveQueryClient::new(Arc::new(backend.clone()));
    let users = client
        .collection::<User>("users", Vec::new(), CollectionOptions::default())
        .await;

    let id = users
        .add(&User {
            id: String::new(),
            name: "New".into(),
            active: true,
            age: 1,
        })
        .await
        .expect("add");
    assert_eq!(users.size(), 6, "live listener saw the insert");
    assert!(users.find_by_id(&id).is_some());

    users
        .update(&id, JsonFields::from_iter([("age".to_string(), json!(2))]))
        .await
        .expect("update");
    assert_eq!(users.find_by_id(&id).map(|u| u.age), Some(2));

    users.delete(&id).await.expect("delete");
    assert_eq!(users.size(), 5);

    let err = users
        .update("missing", JsonFields::new())
        .await
        .expect_err("update of a missing document");
    assert_eq!(err.code(), ErrorCode::NotFound);

    let stats = users.stats();
    assert_eq!(stats.writes, 3);
    assert!(stats.reads >= 1);
    assert!(stats.last_activity.is_some());
    users.dispose();
}

#[tokio::test]
async fn client_side_helpers_operate_on_the_current_snapshot() {
    let client = LiveQueryClient::new(Arc::new(seeded_backend()));
    let users = client
        .collection::<User>(
            "users",
            QueryBuilder::new()
                .order_by("age", OrderDirection::Ascending)
                .build(),
            CollectionOptions::default(),
        )
        .await;

    assert_eq!(users.count_where(|user| user.active), 3);
    assert!(users.any_match(|user| user.age > 50));
    assert!(!users.all_match(|user| user.active));

    let by_activity = users.group_by(|user| user.active);
    assert_eq!(by_activity[&true].len(), 3);
    assert_eq!(by_activity[&false].len(), 2);

    let youngest = users.find(|user| user.age < 35).expect("rosa");
    assert_eq!(youngest.name, "Rosa");

    let first_page = users.paginate(1, 2);
    let second_page = users.paginate(2, 2);
    assert_eq!(first_page.len(), 2);
    assert_eq!(second_page.len(), 2);
    assert_eq!(first_page[0].name, "Rosa");
    assert_eq!(users.paginate(4, 2).len(), 0);

    let sorted = users.sorted_by(|a, b| b.age.cmp(&a.age));
    assert_eq!(sorted[0].name, "Carl");
    users.dispose();
}

#[tokio::test]
async fn custom_cache_keys_override_the_derived_key() {
    let client = LiveQueryClient::new(Arc::new(seeded_backend()));
    let users = client
        .collection::<User>(
            "users",
            Vec::new(),
            CollectionOptions::<User>::default()
                .with_cache_key(|descriptor| format!("custom:{}", descriptor.collection_path())),
        )
        .await;
    assert_eq!(users.cache_key(), "custom:users");
    assert!(client.cache().get("custom:users").is_some());
    users.clear_cache();
    assert!(client.cache().get("custom:users").is_none());
    users.dispose();
}
