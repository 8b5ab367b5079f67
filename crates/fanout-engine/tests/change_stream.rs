//! End-to-end behavior of the manager, its workers and listeners over the
//! in-memory feed and store.

use async_trait::async_trait;
use fanout_core::prelude::*;
use fanout_core::{ClusterConfig, WatchOptions, WorkerCheckpoint};
use fanout_engine::{ChangeStreamManager, CollectingListener, MemoryChangeFeed, MemoryConfigStore, WorkerState};
use serde_json::{json, Map, Value};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};
use uuid::Uuid;

const WAIT: Duration = Duration::from_secs(5);
const SETTLE: Duration = Duration::from_millis(150);

fn config(collection: &str, partitions: u32) -> FanoutConfig {
    let mut config = FanoutConfig::for_collection(collection, partitions);
    config.max_await = Duration::from_millis(20);
    config.init_timeout = WAIT;
    config.shutdown_timeout = WAIT;
    config
}

async fn manager(config: FanoutConfig, feed: &MemoryChangeFeed, store: &Arc<MemoryConfigStore>) -> ChangeStreamManager {
    ChangeStreamManager::new(config, Arc::new(feed.clone()), store.clone())
        .await
        .unwrap()
}

/// One id per partition, index = partition
fn ids_for_partitions(router: &PartitionRouter) -> Vec<Value> {
    let mut found: Vec<Option<Value>> = vec![None; router.partitions() as usize];
    for i in 0.. {
        let id = json!(format!("doc-{}", i));
        let slot = &mut found[router.partition_of(&id) as usize];
        if slot.is_none() {
            *slot = Some(id);
        }
        if found.iter().all(Option::is_some) {
            break;
        }
    }
    found.into_iter().flatten().collect()
}

/// `count` ids that all route to `partition`
fn ids_in_partition(router: &PartitionRouter, partition: u32, count: usize) -> Vec<Value> {
    (0..)
        .map(|i| json!(format!("item-{}", i)))
        .filter(|id| router.partition_of(id) == partition)
        .take(count)
        .collect()
}

fn dyn_listener(listener: &Arc<CollectingListener>) -> Arc<dyn ChangeListener> {
    listener.clone()
}

async fn wait_for_checkpoints(store: &MemoryConfigStore, collection: &str, partitions: u32, token: &ResumeToken) {
    let deadline = Instant::now() + WAIT;
    loop {
        let mut all_caught_up = true;
        for p in 0..partitions {
            let persisted = store.checkpoint(collection, p).await.and_then(|c| c.resume_token);
            all_caught_up &= persisted.as_ref() == Some(token);
        }
        if all_caught_up {
            return;
        }
        assert!(Instant::now() < deadline, "checkpoints did not reach {}", token);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
}

// ============================================================================
// Scenarios
// ============================================================================

#[tokio::test]
async fn test_each_partition_receives_its_insert() {
    let feed = MemoryChangeFeed::new("scenario_a");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("scenario_a", 3), &feed, &store).await;

    let listeners: Vec<_> = (0..3)
        .map(|p| Arc::new(CollectingListener::new(format!("partition-{}", p))))
        .collect();
    for (p, listener) in listeners.iter().enumerate() {
        manager.register_listener(listener.clone(), &[p as u32]);
    }
    manager.start().await.unwrap();

    let ids = ids_for_partitions(manager.router());
    for (p, id) in ids.iter().enumerate() {
        feed.insert(json!({"_id": id, "partition": p})).await.unwrap();
    }

    for listener in &listeners {
        assert!(listener.wait_for(1, WAIT).await);
    }
    tokio::time::sleep(SETTLE).await;

    for (p, listener) in listeners.iter().enumerate() {
        let events = listener.events().await;
        assert_eq!(events.len(), 1, "partition {}", p);
        assert_eq!(events[0].operation_type, OperationType::Insert);
        assert_eq!(events[0].full_document, Some(json!({"_id": ids[p], "partition": p})));
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_insert_update_delete_in_order() {
    let feed = MemoryChangeFeed::new("scenario_b");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("scenario_b", 2), &feed, &store).await;

    let id = json!("the-document");
    let partition = manager.router().partition_of(&id);
    let listener = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(listener.clone(), &[partition]);
    manager.start().await.unwrap();

    feed.insert(json!({"_id": id, "qty": 1})).await.unwrap();
    let mut set = Map::new();
    set.insert("qty".to_string(), json!(2));
    feed.update(&id, set, vec![]).await.unwrap();
    feed.delete(&id).await.unwrap();

    assert!(listener.wait_for(3, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    let events = listener.events().await;
    let operations: Vec<_> = events.iter().map(|e| e.operation_type).collect();
    assert_eq!(
        operations,
        vec![OperationType::Insert, OperationType::Update, OperationType::Delete]
    );

    let update = events[1].update_description.as_ref().unwrap();
    assert!(!update.is_empty());
    assert_eq!(update.updated_fields["qty"], json!(2));

    assert_eq!(events[2].full_document, None);
    assert_eq!(events[2].document_key, json!({"_id": id}));

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_stop_right_after_start() {
    let feed = MemoryChangeFeed::new("scenario_c");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("scenario_c", 4), &feed, &store).await;

    manager.start().await.unwrap();
    let started = Instant::now();
    manager.stop().await.unwrap();

    assert!(started.elapsed() < WAIT);
    assert!(!manager.is_running());
    for p in 0..4 {
        assert_eq!(manager.worker(p).unwrap().state(), WorkerState::Stopped);
    }
}

// ============================================================================
// Routing and fan-out
// ============================================================================

#[tokio::test]
async fn test_events_route_to_their_partition_only() {
    let feed = MemoryChangeFeed::new("routing");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("routing", 4), &feed, &store).await;

    let listeners: Vec<_> = (0..4)
        .map(|p| Arc::new(CollectingListener::new(format!("partition-{}", p))))
        .collect();
    for (p, listener) in listeners.iter().enumerate() {
        manager.register_listener(listener.clone(), &[p as u32]);
    }
    manager.start().await.unwrap();

    let mut expected = [0usize; 4];
    for i in 0..40 {
        let id = json!(format!("doc-{}", i));
        expected[manager.router().partition_of(&id) as usize] += 1;
        feed.insert(json!({"_id": id})).await.unwrap();
    }

    for (p, listener) in listeners.iter().enumerate() {
        assert!(listener.wait_for(expected[p], WAIT).await);
    }
    tokio::time::sleep(SETTLE).await;

    for (p, listener) in listeners.iter().enumerate() {
        let events = listener.events().await;
        assert_eq!(events.len(), expected[p]);
        assert!(events.iter().all(|e| manager.router().route(e) == Some(p as u32)));
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_listeners_on_one_partition_see_the_same_sequence() {
    let feed = MemoryChangeFeed::new("fan_out");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("fan_out", 3), &feed, &store).await;

    let first = Arc::new(CollectingListener::new("first"));
    let second = Arc::new(CollectingListener::new("second"));
    manager.register_listener(first.clone(), &[2]);
    manager.register_listener(second.clone(), &[2]);
    manager.start().await.unwrap();

    for id in ids_in_partition(manager.router(), 2, 5) {
        feed.insert(json!({"_id": id})).await.unwrap();
    }

    assert!(first.wait_for(5, WAIT).await);
    assert!(second.wait_for(5, WAIT).await);
    assert_eq!(first.events().await, second.events().await);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_deregistered_listener_receives_nothing_more() {
    let feed = MemoryChangeFeed::new("deregistration");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("deregistration", 2), &feed, &store).await;

    let listener = Arc::new(CollectingListener::new("leaving"));
    let sentinel = Arc::new(CollectingListener::new("sentinel"));
    manager.register_listener_to_all_partitions(listener.clone());
    manager.start().await.unwrap();

    feed.insert(json!({"_id": "before"})).await.unwrap();
    assert!(listener.wait_for(1, WAIT).await);

    manager.deregister_listener_from_all_partitions(&dyn_listener(&listener));
    manager.register_listener_to_all_partitions(sentinel.clone());
    for i in 0..3 {
        feed.insert(json!({"_id": format!("after-{}", i)})).await.unwrap();
    }
    assert!(sentinel.wait_for(3, WAIT).await);

    let events = listener.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].document_id(), "before");
    for p in 0..2 {
        assert!(!manager.has_registered_listener(&dyn_listener(&listener), p));
    }

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_routing_on_a_domain_key() {
    let feed = MemoryChangeFeed::new("custom_key").with_shard_key(vec!["testId".to_string()]);
    let store = Arc::new(MemoryConfigStore::new());
    let mut config = config("custom_key", 3);
    config.key_name = "testId".to_string();
    let manager = manager(config, &feed, &store).await;

    let key = json!(4711);
    let listener = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(listener.clone(), &[manager.router().partition_of(&key)]);
    manager.start().await.unwrap();

    let id = feed.insert(json!({"testId": key, "name": "routed"})).await.unwrap();
    feed.delete(&id).await.unwrap();

    assert!(listener.wait_for(2, WAIT).await);
    let events = listener.events().await;
    assert_eq!(events[0].operation_type, OperationType::Insert);
    assert_eq!(events[1].operation_type, OperationType::Delete);
    assert_eq!(events[1].document_key["testId"], key);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_match_filter_limits_events() {
    let feed = MemoryChangeFeed::new("match_filter");
    let store = Arc::new(MemoryConfigStore::new());
    let mut config = config("match_filter", 2);
    config.match_filter = Some(Expr::eq(Expr::field("operationType"), Expr::lit("insert")));
    let manager = manager(config, &feed, &store).await;

    let listener = Arc::new(CollectingListener::new("inserts"));
    manager.register_listener_to_all_partitions(listener.clone());
    manager.start().await.unwrap();

    feed.insert(json!({"_id": 1})).await.unwrap();
    feed.update(&json!(1), Map::new(), vec![]).await.unwrap();
    feed.delete(&json!(1)).await.unwrap();
    feed.insert(json!({"_id": 2})).await.unwrap();

    assert!(listener.wait_for(2, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    let events = listener.events().await;
    assert_eq!(events.len(), 2);
    assert!(events.iter().all(|e| e.operation_type == OperationType::Insert));

    manager.stop().await.unwrap();
}

// ============================================================================
// Checkpoints and resumption
// ============================================================================

#[tokio::test]
async fn test_checkpoint_equals_last_event_position() {
    let feed = MemoryChangeFeed::new("checkpoint");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("checkpoint", 1), &feed, &store).await;

    let listener = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(listener.clone(), &[0]);
    manager.start().await.unwrap();

    feed.insert(json!({"_id": "a"})).await.unwrap();
    assert!(listener.wait_for(1, WAIT).await);
    let token = listener.events().await[0].resume_token.clone();

    wait_for_checkpoints(&store, "checkpoint", 1, &token).await;
    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_restart_resumes_after_checkpoint() {
    let feed = MemoryChangeFeed::new("restart");
    let store = Arc::new(MemoryConfigStore::new());

    let first = manager(config("restart", 2), &feed, &store).await;
    let before = Arc::new(CollectingListener::new("before"));
    first.register_listener_to_all_partitions(before.clone());
    first.start().await.unwrap();
    for id in ["a", "b", "c"] {
        feed.insert(json!({"_id": id})).await.unwrap();
    }
    assert!(before.wait_for(3, WAIT).await);
    wait_for_checkpoints(&store, "restart", 2, &feed.head_token().await).await;
    first.stop().await.unwrap();

    // written while nobody is watching
    for id in ["d", "e"] {
        feed.insert(json!({"_id": id})).await.unwrap();
    }

    let second = manager(config("restart", 2), &feed, &store).await;
    let after = Arc::new(CollectingListener::new("after"));
    second.register_listener_to_all_partitions(after.clone());
    second.start().await.unwrap();

    assert!(after.wait_for(2, WAIT).await);
    tokio::time::sleep(SETTLE).await;
    let ids: BTreeSet<String> = after.events().await.iter().map(|e| e.document_id()).collect();
    assert_eq!(ids, BTreeSet::from(["d".to_string(), "e".to_string()]));

    second.stop().await.unwrap();
}

#[tokio::test]
async fn test_expired_resume_token_falls_back_to_fresh_stream() {
    let feed = MemoryChangeFeed::new("expired");
    let store = Arc::new(MemoryConfigStore::new());

    let first = manager(config("expired", 1), &feed, &store).await;
    first.start().await.unwrap();
    feed.insert(json!({"_id": "seen"})).await.unwrap();
    wait_for_checkpoints(&store, "expired", 1, &feed.head_token().await).await;
    first.stop().await.unwrap();

    feed.insert(json!({"_id": "lost-1"})).await.unwrap();
    feed.insert(json!({"_id": "lost-2"})).await.unwrap();
    feed.truncate_history().await;

    let second = manager(config("expired", 1), &feed, &store).await;
    let listener = Arc::new(CollectingListener::new("collector"));
    second.register_listener(listener.clone(), &[0]);
    second.start().await.unwrap();

    feed.insert(json!({"_id": "fresh"})).await.unwrap();
    assert!(listener.wait_for(1, WAIT).await);
    let events = listener.events().await;
    assert_eq!(events.len(), 1);
    assert_eq!(events[0].document_id(), "fresh");
    wait_for_checkpoints(&store, "expired", 1, &feed.head_token().await).await;

    second.stop().await.unwrap();
}

// ============================================================================
// Configuration
// ============================================================================

#[tokio::test]
async fn test_partition_count_is_immutable() {
    let feed = MemoryChangeFeed::new("immutable");
    let store = Arc::new(MemoryConfigStore::new());

    let _first = manager(config("immutable", 3), &feed, &store).await;
    let _same = manager(config("immutable", 3), &feed, &store).await;

    let err = ChangeStreamManager::new(config("immutable", 2), Arc::new(feed.clone()), store.clone())
        .await
        .err()
        .unwrap();
    match &err {
        FanoutError::ConfigMismatch {
            feed,
            existing,
            requested,
        } => {
            assert_eq!(feed, "immutable");
            assert_eq!((*existing, *requested), (3, 2));
        }
        other => panic!("unexpected error: {}", other),
    }
    assert!(err
        .to_string()
        .starts_with("Found previous config for collection immutable with different number of partitions!"));
    assert_eq!(store.cluster_configs().await.len(), 1);
}

// ============================================================================
// Failures
// ============================================================================

/// Store whose checkpoint creation fails for one partition
struct FlakyStore {
    inner: MemoryConfigStore,
    broken_partition: u32,
}

#[async_trait]
impl ConfigStore for FlakyStore {
    async fn find_cluster_config(&self, collection: &str) -> Result<Option<ClusterConfig>> {
        self.inner.find_cluster_config(collection).await
    }

    async fn get_or_init_cluster_config(&self, collection: &str, partitions: u32) -> Result<ClusterConfig> {
        self.inner.get_or_init_cluster_config(collection, partitions).await
    }

    async fn get_or_init_checkpoint(&self, collection: &str, partition: u32) -> Result<WorkerCheckpoint> {
        if partition == self.broken_partition {
            return Err(FanoutError::store("connection reset"));
        }
        self.inner.get_or_init_checkpoint(collection, partition).await
    }

    async fn update_resume_token(&self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()> {
        self.inner.update_resume_token(checkpoint_id, token).await
    }

    fn name(&self) -> &'static str {
        "flaky_store"
    }
}

/// Feed whose cursors never open
struct HangingFeed;

#[async_trait]
impl ChangeFeed for HangingFeed {
    async fn open_cursor(&self, _options: &WatchOptions) -> Result<Box<dyn ChangeCursor>> {
        futures::future::pending::<Result<Box<dyn ChangeCursor>>>().await
    }

    fn name(&self) -> &'static str {
        "hanging_feed"
    }
}

#[tokio::test]
async fn test_start_failure_rolls_back() {
    let feed = MemoryChangeFeed::new("start_failure");
    let store = Arc::new(FlakyStore {
        inner: MemoryConfigStore::new(),
        broken_partition: 1,
    });
    let manager = ChangeStreamManager::new(config("start_failure", 3), Arc::new(feed), store)
        .await
        .unwrap();

    let err = manager.start().await.unwrap_err();
    assert!(matches!(err, FanoutError::StartFailure { .. }));
    let cause = std::error::Error::source(&err).map(|s| s.to_string());
    assert_eq!(cause.as_deref(), Some("Store error: connection reset"));

    assert!(!manager.is_running());
    assert_eq!(manager.worker(1).unwrap().state(), WorkerState::Failed);
    for p in [0, 2] {
        assert_eq!(manager.worker(p).unwrap().state(), WorkerState::Stopped);
    }
}

#[tokio::test]
async fn test_init_timeout_proceeds_by_default() {
    let store = Arc::new(MemoryConfigStore::new());
    let mut config = config("hanging", 2);
    config.init_timeout = Duration::from_millis(100);
    config.shutdown_timeout = Duration::from_millis(100);
    let manager = ChangeStreamManager::new(config, Arc::new(HangingFeed), store).await.unwrap();

    // the workers are in an unknown state, start still reports success
    manager.start().await.unwrap();
    assert_eq!(manager.worker(0).unwrap().state(), WorkerState::Initializing);

    // shutdown is not confirmed either, stop only warns
    manager.stop().await.unwrap();
    assert_eq!(manager.worker(0).unwrap().state(), WorkerState::Stopping);
}

#[tokio::test]
async fn test_init_timeout_can_fail_start() {
    let store = Arc::new(MemoryConfigStore::new());
    let mut config = config("hanging_strict", 1);
    config.init_timeout = Duration::from_millis(100);
    config.shutdown_timeout = Duration::from_millis(100);
    config.fail_on_init_timeout = true;
    let manager = ChangeStreamManager::new(config, Arc::new(HangingFeed), store).await.unwrap();

    let err = manager.start().await.unwrap_err();
    let cause = match &err {
        FanoutError::StartFailure { source } => source.as_ref(),
        other => panic!("unexpected error: {}", other),
    };
    assert!(matches!(cause, FanoutError::Timeout { .. }));
}

#[tokio::test]
async fn test_poll_failures_do_not_stop_the_worker() {
    let feed = MemoryChangeFeed::new("poll_failure");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("poll_failure", 1), &feed, &store).await;
    let listener = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(listener.clone(), &[0]);
    manager.start().await.unwrap();
    // the reopened cursor resumes from here
    wait_for_checkpoints(&store, "poll_failure", 1, &feed.head_token().await).await;

    feed.fail_next_polls(2);
    feed.insert(json!({"_id": "survivor"})).await.unwrap();

    assert!(listener.wait_for(1, WAIT).await);
    assert_eq!(listener.events().await[0].document_id(), "survivor");
    assert_eq!(manager.worker(0).unwrap().state(), WorkerState::Streaming);

    manager.stop().await.unwrap();
}

#[tokio::test]
async fn test_persist_failures_are_retried() {
    let feed = MemoryChangeFeed::new("persist_failure");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("persist_failure", 1), &feed, &store).await;
    let listener = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(listener.clone(), &[0]);
    manager.start().await.unwrap();

    store.fail_next_updates(3);
    feed.insert(json!({"_id": 1})).await.unwrap();
    feed.insert(json!({"_id": 2})).await.unwrap();

    assert!(listener.wait_for(2, WAIT).await);
    wait_for_checkpoints(&store, "persist_failure", 1, &feed.head_token().await).await;

    manager.stop().await.unwrap();
}

/// Panics on the first event only
struct PanicOnce {
    armed: AtomicBool,
}

#[async_trait]
impl ChangeListener for PanicOnce {
    async fn handle(&self, event: &ChangeEvent) {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("listener failure on {}", event.document_id());
        }
    }
}

#[tokio::test]
async fn test_listener_panic_does_not_stop_the_worker() {
    let feed = MemoryChangeFeed::new("listener_panic");
    let store = Arc::new(MemoryConfigStore::new());
    let manager = manager(config("listener_panic", 1), &feed, &store).await;

    let collector = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(
        Arc::new(PanicOnce {
            armed: AtomicBool::new(true),
        }),
        &[0],
    );
    manager.register_listener(collector.clone(), &[0]);
    manager.start().await.unwrap();

    feed.insert(json!({"_id": "first"})).await.unwrap();
    feed.insert(json!({"_id": "second"})).await.unwrap();

    assert!(collector.wait_for(1, WAIT).await);
    // delivery is not isolated: peers after the panicking listener miss that event
    assert_eq!(collector.events().await[0].document_id(), "second");
    wait_for_checkpoints(&store, "listener_panic", 1, &feed.head_token().await).await;

    manager.stop().await.unwrap();
}

/// Store that panics on one checkpoint write once armed
struct PanickingStore {
    inner: MemoryConfigStore,
    armed: AtomicBool,
}

#[async_trait]
impl ConfigStore for PanickingStore {
    async fn find_cluster_config(&self, collection: &str) -> Result<Option<ClusterConfig>> {
        self.inner.find_cluster_config(collection).await
    }

    async fn get_or_init_cluster_config(&self, collection: &str, partitions: u32) -> Result<ClusterConfig> {
        self.inner.get_or_init_cluster_config(collection, partitions).await
    }

    async fn get_or_init_checkpoint(&self, collection: &str, partition: u32) -> Result<WorkerCheckpoint> {
        self.inner.get_or_init_checkpoint(collection, partition).await
    }

    async fn update_resume_token(&self, checkpoint_id: Uuid, token: &ResumeToken) -> Result<()> {
        if self.armed.swap(false, Ordering::SeqCst) {
            panic!("store failure while persisting {}", token);
        }
        self.inner.update_resume_token(checkpoint_id, token).await
    }

    fn name(&self) -> &'static str {
        "panicking_store"
    }
}

#[tokio::test]
async fn test_store_panic_does_not_kill_the_worker() {
    let feed = MemoryChangeFeed::new("store_panic");
    let store = Arc::new(PanickingStore {
        inner: MemoryConfigStore::new(),
        armed: AtomicBool::new(false),
    });
    let manager = ChangeStreamManager::new(config("store_panic", 1), Arc::new(feed.clone()), store.clone())
        .await
        .unwrap();
    let collector = Arc::new(CollectingListener::new("collector"));
    manager.register_listener(collector.clone(), &[0]);
    manager.start().await.unwrap();
    wait_for_checkpoints(&store.inner, "store_panic", 1, &feed.head_token().await).await;

    store.armed.store(true, Ordering::SeqCst);
    feed.insert(json!({"_id": "first"})).await.unwrap();
    feed.insert(json!({"_id": "second"})).await.unwrap();

    // "first" may be delivered twice: its checkpoint write never completed
    let deadline = Instant::now() + WAIT;
    loop {
        let ids: Vec<String> = collector.events().await.iter().map(|e| e.document_id()).collect();
        if ids.iter().any(|id| id == "second") {
            break;
        }
        assert!(Instant::now() < deadline, "worker stopped delivering after the store panic: {:?}", ids);
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    wait_for_checkpoints(&store.inner, "store_panic", 1, &feed.head_token().await).await;
    assert_eq!(manager.worker(0).unwrap().state(), WorkerState::Streaming);

    let started = Instant::now();
    manager.stop().await.unwrap();
    assert!(started.elapsed() < WAIT);
    assert_eq!(manager.worker(0).unwrap().state(), WorkerState::Stopped);
}
