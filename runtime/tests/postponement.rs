#![allow(clippy::unwrap_used)]

//! Postponement lifecycle: resolve, postpone-with-reminder, cancel, and
//! restart recovery. Timers run under tokio's paused clock, so the
//! half-hour delays elapse instantly.

use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use pretty_assertions::assert_eq;
use uuid::Uuid;

use warden_config::ConfigManager;
use warden_persistence::AuditStore;
use warden_persistence::DbManager;
use warden_persistence::OutboxStore;
use warden_persistence::PostponementStore;
use warden_persistence::run_migrations;
use warden_protocol::PostponementStatus;
use warden_runtime::PostponementManager;

struct Fixture {
    _dir: tempfile::TempDir,
    manager: PostponementManager,
    store: PostponementStore,
    outbox: OutboxStore,
}

fn fixture() -> Fixture {
    let dir = tempfile::tempdir().unwrap();
    let db_path = dir.path().join("warden.db");
    let migrations = PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../migrations");
    run_migrations(&db_path, &migrations).unwrap();

    let db = Arc::new(DbManager::new(db_path));
    let store = PostponementStore::new(Arc::clone(&db));
    let outbox = OutboxStore::new(Arc::clone(&db));
    let audit = AuditStore::new(Arc::clone(&db));
    let config = Arc::new(ConfigManager::load(Some(dir.path().join("absent.toml"))).unwrap());
    let manager = PostponementManager::new(store.clone(), outbox.clone(), audit, config);

    Fixture {
        _dir: dir,
        manager,
        store,
        outbox,
    }
}

#[tokio::test(start_paused = true)]
async fn resolve_and_consume_round_trip() {
    let f = fixture();
    let op = Uuid::new_v4();
    f.manager.add_pending(
        op,
        "c1",
        "rename the module",
        ("rename in place".to_string(), "create a copy".to_string()),
    );
    assert!(f.manager.has_pending("c1"));

    let resolved = f.manager.resolve("c1", "  rename in place  ").unwrap();
    assert_eq!(resolved.operation_id, op);

    // The buffered notify permit means a late waiter still sees the answer.
    let waited = f.manager.wait_for_clarification("c1", 60).await.unwrap();
    assert_eq!(waited.response_text.as_deref(), Some("rename in place"));

    let consumed = f.manager.consume_resolved("c1").unwrap();
    assert_eq!(consumed.response_text.as_deref(), Some("rename in place"));
    assert!(!f.manager.has_pending("c1"));
    assert!(f.store.active_by_chat("c1").unwrap().is_none());

    let prompt = PostponementManager::build_clarified_prompt(
        &consumed.original_prompt,
        consumed.response_text.as_deref().unwrap(),
    );
    assert_eq!(
        prompt,
        "rename the module\n\nClarification provided by user: rename in place"
    );
}

#[tokio::test(start_paused = true)]
async fn wait_times_out_then_postpones_reminds_and_cancels() {
    let f = fixture();
    let op = Uuid::new_v4();
    f.manager.add_pending(
        op,
        "c2",
        "which config file?",
        ("the global one".to_string(), "the project one".to_string()),
    );

    // No answer arrives: the wait times out.
    assert!(f.manager.wait_for_clarification("c2", 60).await.is_none());

    f.manager.postpone_and_schedule("c2");
    let row = f.store.active_by_chat("c2").unwrap().unwrap();
    assert_eq!(row.status, PostponementStatus::Postponed);
    assert!(row.retry_at.is_some());
    assert!(row.cancel_at.is_some());

    // Past the retry delay (1800s) the reminder is enqueued once.
    tokio::time::sleep(Duration::from_secs(1801)).await;
    let pending = f.outbox.pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    assert!(pending[0].message_text.contains("the global one"));
    assert!(pending[0].message_text.contains("the project one"));
    assert!(f.store.active_by_chat("c2").unwrap().unwrap().retry_enqueued);

    // Past the cancellation delay the request is abandoned.
    tokio::time::sleep(Duration::from_secs(1801)).await;
    assert!(!f.manager.has_pending("c2"));
    let row = f.store.active_by_chat("c2").unwrap();
    // Cancelled rows are no longer active for the chat.
    assert!(row.is_none());
}

#[tokio::test(start_paused = true)]
async fn resolution_after_postponement_cancels_timers() {
    let f = fixture();
    let op = Uuid::new_v4();
    f.manager
        .add_pending(op, "c3", "prompt", ("A".to_string(), "B".to_string()));
    f.manager.postpone_and_schedule("c3");

    f.manager.resolve("c3", "A").unwrap();
    let consumed = f.manager.consume_resolved("c3").unwrap();
    assert_eq!(consumed.response_text.as_deref(), Some("A"));

    // With timers aborted, no reminder ever lands.
    tokio::time::sleep(Duration::from_secs(4000)).await;
    assert!(f.outbox.pending(10).unwrap().is_empty());
}

#[tokio::test(start_paused = true)]
async fn restart_recovery_re_postpones_waiting_rows() {
    let f = fixture();
    let op = Uuid::new_v4();
    f.manager
        .add_pending(op, "c4", "prompt", ("A".to_string(), "B".to_string()));

    // Simulate a restart: a fresh manager over the same stores, with only
    // the persisted `waiting` row surviving.
    let dir = f._dir.path().to_path_buf();
    let db = Arc::new(DbManager::new(dir.join("warden.db")));
    let config = Arc::new(ConfigManager::load(Some(dir.join("absent.toml"))).unwrap());
    let recovered = PostponementManager::new(
        PostponementStore::new(Arc::clone(&db)),
        OutboxStore::new(Arc::clone(&db)),
        AuditStore::new(db),
        config,
    );

    recovered.recover_pending();
    assert!(recovered.has_pending("c4"));
    let row = f.store.active_by_chat("c4").unwrap().unwrap();
    assert_eq!(row.status, PostponementStatus::Postponed);
    assert!(row.retry_at.is_some());

    // Recovered timers fire like freshly armed ones.
    tokio::time::sleep(Duration::from_secs(1801)).await;
    assert_eq!(f.outbox.pending(10).unwrap().len(), 1);
}
