//! End-to-end scenarios: a store, a memory backend, and the engine between them.

use serde_json::json;
use std::sync::Arc;
use tidepool_core::{SyncState, TableSchema};
use tidepool_db::DbConfig;
use tidepool_sync::{LocalStore, MemoryBackend, RealtimeEvent, SyncConfig, SyncStrategy};

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("warn,tidepool_sync=debug")
        .with_test_writer()
        .try_init();
}

async fn store_with(backend: Arc<MemoryBackend>, config: SyncConfig) -> LocalStore {
    init_tracing();
    let db_config = DbConfig::in_memory()
        .table(TableSchema::new("users").timestamps())
        .table(TableSchema::new("todos").auto_increment().index("done"));

    LocalStore::builder(db_config)
        .with_remote(backend)
        .with_sync_config(config)
        .build()
        .await
        .unwrap()
}

fn default_config() -> SyncConfig {
    SyncConfig::new()
        .table("users", "app_users")
        .table("todos", "todos")
}

#[tokio::test]
async fn add_update_delete_then_push() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend.clone(), default_config()).await;
    let users = store.table("users").unwrap();

    let key = users.add(json!({"name": "John"})).await.unwrap();
    assert!(!key.is_empty());
    assert_eq!(users.get_all().await.unwrap().len(), 1);

    users.update(&key, json!({"name": "Jane"})).await.unwrap();
    assert_eq!(users.get(&key).await.unwrap().unwrap()["name"], "Jane");

    users.delete(&key).await.unwrap();
    assert!(users.get_all().await.unwrap().is_empty());

    let tracker = store.database().change_tracker();
    let pending = tracker.get_pending_changes(Some("users")).await.unwrap();
    assert_eq!(pending.len(), 3);
    assert!(pending.iter().all(|c| !c.synced));

    let report = store.engine().unwrap().push().await.unwrap();
    assert_eq!(report.pushed, 0);
    assert_eq!(report.deleted, 1);
    assert!(backend.records("app_users").is_empty());

    let changes = tracker.get_changes_by_table("users").await.unwrap();
    assert_eq!(changes.len(), 3);
    assert!(changes.iter().all(|c| c.synced));
}

#[tokio::test]
async fn second_push_is_silent() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend.clone(), default_config()).await;
    let todos = store.table("todos").unwrap();
    todos.add(json!({"title": "a", "done": false})).await.unwrap();
    todos.add(json!({"title": "b", "done": true})).await.unwrap();

    let engine = store.engine().unwrap();
    let first = engine.push().await.unwrap();
    assert_eq!(first.pushed, 2);
    assert_eq!(backend.records("todos").len(), 2);

    let calls = backend.calls();
    let second = engine.push().await.unwrap();
    assert_eq!(second.pushed, 0);
    assert_eq!(backend.calls(), calls);
}

#[tokio::test]
async fn failing_table_does_not_block_others() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend.clone(), default_config()).await;
    store.table("users").unwrap().put(json!({"id": "u1", "name": "Ada"})).await.unwrap();
    store.table("todos").unwrap().add(json!({"title": "t"})).await.unwrap();
    backend.fail_table("app_users");

    let engine = store.engine().unwrap();
    let report = engine.full().await.unwrap();
    assert_eq!(report.failed_tables, vec!["users".to_string()]);
    assert_eq!(backend.records("todos").len(), 1);

    let statuses = engine.statuses().await.unwrap();
    let users = statuses.iter().find(|s| s.table == "users").unwrap();
    let todos = statuses.iter().find(|s| s.table == "todos").unwrap();
    assert_eq!(users.sync_status, SyncState::Error);
    assert_eq!(users.last_sync_timestamp, 0);
    assert_eq!(users.pending_changes, 1);
    assert_eq!(todos.sync_status, SyncState::Idle);
    assert!(todos.last_sync_timestamp > 0);

    backend.recover_table("app_users");
    let retry = engine.push().await.unwrap();
    assert!(retry.is_clean());
    assert_eq!(backend.record("app_users", "u1").unwrap()["name"], "Ada");
}

#[tokio::test]
async fn pull_resolves_conflicts_with_last_write_wins() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend.clone(), default_config()).await;
    let users = store.table("users").unwrap();

    users
        .put(json!({"id": "u1", "name": "local"}))
        .await
        .unwrap();
    backend.set_record(
        "app_users",
        "u1",
        json!({"id": "u1", "name": "old remote", "updatedAt": "2020-01-01T00:00:00Z"}),
    );
    backend.set_record(
        "app_users",
        "u2",
        json!({"id": "u2", "name": "new remote", "updatedAt": "2020-01-01T00:00:00Z"}),
    );

    let report = store.engine().unwrap().pull().await.unwrap();
    assert_eq!(report.conflicts, 1);
    assert_eq!(report.pulled, 1);

    assert_eq!(users.get("u1").await.unwrap().unwrap()["name"], "local");
    assert_eq!(users.get("u2").await.unwrap().unwrap()["name"], "new remote");

    // the pulled record is not echoed back
    let pending = store.database().change_tracker().count_pending(Some("users")).await.unwrap();
    assert_eq!(pending, 1);
}

#[tokio::test]
async fn push_all_keeps_last_record_per_key() {
    let backend = Arc::new(MemoryBackend::new());
    let config = default_config().strategy(SyncStrategy::Push);
    let store = store_with(backend.clone(), config).await;
    let users = store.table("users").unwrap();
    users.put(json!({"id": "u1", "name": "first"})).await.unwrap();
    users.put(json!({"id": "u1", "name": "second"})).await.unwrap();
    users.put(json!({"id": "u2", "name": "other"})).await.unwrap();

    let report = store.engine().unwrap().push_all().await.unwrap();
    assert_eq!(report.pushed, 2);
    assert_eq!(backend.record("app_users", "u1").unwrap()["name"], "second");
    assert_eq!(
        store.database().change_tracker().count_pending(Some("users")).await.unwrap(),
        0
    );
}

#[tokio::test]
async fn realtime_events_reach_live_views() {
    let backend = Arc::new(MemoryBackend::new());
    let store = store_with(backend.clone(), default_config().realtime(true)).await;
    store.start().await.unwrap();

    let view = store.table("todos").unwrap().query().live();
    let (tx, mut rx) = tokio::sync::mpsc::unbounded_channel();
    let _sub = view
        .subscribe(move |rows: &Vec<serde_json::Value>| {
            let _ = tx.send(rows.len());
        })
        .await
        .unwrap();
    assert_eq!(rx.recv().await, Some(0));

    for _ in 0..300 {
        if backend.open_feeds() == 1 {
            break;
        }
        tokio::time::sleep(std::time::Duration::from_millis(10)).await;
    }
    backend.emit(RealtimeEvent::insert("todos", json!({"id": 7, "title": "from elsewhere"})));

    let seen = tokio::time::timeout(std::time::Duration::from_secs(5), async {
        loop {
            match rx.recv().await {
                Some(1) => return true,
                Some(_) => continue,
                None => return false,
            }
        }
    })
    .await
    .unwrap_or(false);
    assert!(seen);

    assert_eq!(
        store.database().change_tracker().count_pending(Some("todos")).await.unwrap(),
        0
    );
    store.close().await.unwrap();
}
