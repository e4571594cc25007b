#![allow(clippy::unwrap_used)]

//! End-to-end broker scenarios: routing, scope enforcement, snapshotting,
//! audit bracketing, and outbox enqueueing against a real database and real
//! git repositories.

use std::path::Path;
use std::path::PathBuf;
use std::process::Command;
use std::sync::Arc;

use pretty_assertions::assert_eq;
use serde_json::json;

use warden_broker::BrokerRouter;
use warden_broker::ScopeValidator;
use warden_config::ConfigManager;
use warden_persistence::AuditStore;
use warden_persistence::DbManager;
use warden_persistence::OutboxStore;
use warden_persistence::run_migrations;
use warden_protocol::ErrorCode;
use warden_protocol::Tier;

struct Harness {
    _dir: tempfile::TempDir,
    root: PathBuf,
    router: BrokerRouter,
    audit: AuditStore,
    outbox: OutboxStore,
    db: Arc<DbManager>,
}

fn migrations_dir() -> PathBuf {
    PathBuf::from(env!("CARGO_MANIFEST_DIR")).join("../migrations")
}

fn harness() -> Harness {
    let dir = tempfile::tempdir().unwrap();
    let root = dir.path().join("Projects");
    std::fs::create_dir_all(&root).unwrap();

    let db_path = dir.path().join("warden.db");
    run_migrations(&db_path, &migrations_dir()).unwrap();
    let db = Arc::new(DbManager::new(db_path));
    let audit = AuditStore::new(Arc::clone(&db));
    let outbox = OutboxStore::new(Arc::clone(&db));

    let config =
        Arc::new(ConfigManager::load(Some(dir.path().join("no-config.toml"))).unwrap());
    let scope = ScopeValidator::new(&[root.display().to_string()]);
    let router = BrokerRouter::new(scope, config, audit.clone(), outbox.clone());

    Harness {
        _dir: dir,
        root,
        router,
        audit,
        outbox,
        db,
    }
}

fn git(repo: &Path, args: &[&str]) {
    let output = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .unwrap();
    assert!(
        output.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&output.stderr)
    );
}

fn init_repo(root: &Path) {
    git(root, &["init", "--initial-branch=main"]);
    git(root, &["config", "user.email", "warden@test.local"]);
    git(root, &["config", "user.name", "Warden Tests"]);
}

fn execution_log_count(db: &DbManager) -> i64 {
    db.with_conn(|conn| {
        conn.query_row("SELECT COUNT(*) FROM execution_log", [], |row| row.get(0))
    })
    .unwrap()
}

fn outbox_count(db: &DbManager) -> i64 {
    db.with_conn(|conn| {
        conn.query_row("SELECT COUNT(*) FROM notification_outbox", [], |row| row.get(0))
    })
    .unwrap()
}

#[tokio::test]
async fn tier0_read_happy_path() {
    let h = harness();
    let file = h.root.join("a.txt");
    std::fs::write(&file, "hello").unwrap();

    let result = h
        .router
        .route_operation(
            "fs",
            "read",
            &json!({"path": file.display().to_string()}),
            "c1",
        )
        .await;

    assert!(result.allowed, "read should be allowed: {:?}", result.error);
    assert_eq!(result.tier, Tier::ReadOnly);
    assert_eq!(result.snapshot_ref, None);
    let payload = result.result.unwrap();
    assert_eq!(payload["content"], "hello");
    assert_eq!(payload["size"], 5);

    let (status, snapshot, _) = h.audit.row_status(result.operation_id).unwrap().unwrap();
    assert_eq!(status, "completed");
    assert_eq!(snapshot, None);
    assert_eq!(execution_log_count(&h.db), 1);
}

#[tokio::test]
async fn scope_violation_leaves_no_rows() {
    let h = harness();
    std::fs::write(h.root.join("a.txt"), "hello").unwrap();
    let escape = format!("{}/../../etc/passwd", h.root.display());

    let result = h
        .router
        .route_operation("fs", "read", &json!({"path": escape}), "c1")
        .await;

    assert!(!result.allowed);
    assert_eq!(result.tier, Tier::ReadOnly);
    let error = result.error.unwrap();
    assert_eq!(error.code, ErrorCode::ScopeViolation);
    assert!(!error.retryable);
    let details = error.details.unwrap();
    assert_eq!(
        details["allowed_roots"],
        json!(h.router_allowed_roots_for_test())
    );

    assert_eq!(execution_log_count(&h.db), 0);
    assert_eq!(outbox_count(&h.db), 0);
}

impl Harness {
    fn router_allowed_roots_for_test(&self) -> Vec<String> {
        vec![std::fs::canonicalize(&self.root)
            .unwrap()
            .display()
            .to_string()]
    }
}

#[tokio::test]
async fn tier1_patch_snapshots_and_notifies() {
    let h = harness();
    init_repo(&h.root);
    let file = h.root.join("a.txt");
    std::fs::write(&file, "line1\nline2\nline3\n").unwrap();
    git(&h.root, &["add", "a.txt"]);
    git(&h.root, &["commit", "-m", "initial"]);

    let patch = "\
--- a.txt
+++ a.txt
@@ -1,3 +1,3 @@
 line1
-line2
+line2_modified
 line3
";
    let result = h
        .router
        .route_operation(
            "fs",
            "apply_patch",
            &json!({"path": file.display().to_string(), "patch": patch}),
            "c1",
        )
        .await;

    assert!(result.allowed, "patch should apply: {:?}", result.error);
    assert_eq!(result.tier, Tier::SingleFile);
    let snapshot_ref = result.snapshot_ref.clone().unwrap();
    assert!(snapshot_ref.starts_with("snapshot/edit-"));
    let payload = result.result.unwrap();
    assert_eq!(payload["lines_added"], 1);
    assert_eq!(payload["lines_removed"], 1);

    assert_eq!(
        std::fs::read_to_string(&file).unwrap(),
        "line1\nline2_modified\nline3\n"
    );

    // The snapshot branch actually exists at HEAD.
    let branches = Command::new("git")
        .arg("-C")
        .arg(&h.root)
        .args(["branch", "--list", "snapshot/*"])
        .output()
        .unwrap();
    assert!(String::from_utf8_lossy(&branches.stdout).contains(&snapshot_ref));

    let (status, stored_snapshot, _) = h.audit.row_status(result.operation_id).unwrap().unwrap();
    assert_eq!(status, "completed");
    assert_eq!(stored_snapshot.as_deref(), Some(snapshot_ref.as_str()));

    let pending = h.outbox.pending(10).unwrap();
    assert_eq!(pending.len(), 1);
    let text = &pending[0].message_text;
    assert!(text.contains("fs.apply_patch"), "got: {text}");
    assert!(text.contains("+1/-1"), "got: {text}");
    assert!(text.contains(&snapshot_ref), "got: {text}");
}

#[tokio::test]
async fn commit_path_and_empty_repeat() {
    let h = harness();
    init_repo(&h.root);
    std::fs::write(h.root.join("a.txt"), "line1\n").unwrap();
    git(&h.root, &["add", "a.txt"]);
    git(&h.root, &["commit", "-m", "initial"]);
    std::fs::write(h.root.join("a.txt"), "line1\nline2\n").unwrap();

    let result = h
        .router
        .route_operation(
            "git",
            "commit",
            &json!({
                "repo_path": h.root.display().to_string(),
                "message": "Fix: Add second line",
            }),
            "c1",
        )
        .await;
    assert!(result.allowed, "commit should succeed: {:?}", result.error);
    let payload = result.result.unwrap();
    assert!(payload["commit_hash"].is_string());

    let subject = Command::new("git")
        .arg("-C")
        .arg(&h.root)
        .args(["log", "-1", "--pretty=%s"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&subject.stdout).trim(),
        "Fix: Add second line"
    );

    // Identical second commit: success with a null hash.
    let repeat = h
        .router
        .route_operation(
            "git",
            "commit",
            &json!({
                "repo_path": h.root.display().to_string(),
                "message": "Fix: Add second line",
            }),
            "c1",
        )
        .await;
    assert!(repeat.allowed);
    let payload = repeat.result.unwrap();
    assert!(payload["commit_hash"].is_null());
    assert_eq!(payload["message"], "No changes to commit");
    assert_eq!(payload["files_changed"], 0);
}

#[tokio::test]
async fn invalid_request_writes_nothing() {
    let h = harness();

    // Unknown action.
    let result = h
        .router
        .route_operation("fs", "obliterate", &json!({"path": "/x"}), "c1")
        .await;
    assert!(!result.allowed);
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidRequest);

    // Missing required parameter.
    let result = h
        .router
        .route_operation("fs", "search", &json!({"path": h.root.display().to_string()}), "c1")
        .await;
    assert!(!result.allowed);
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidRequest);

    // Unimplemented capability, even a read-only one.
    let result = h
        .router
        .route_operation("web", "search", &json!({"query": "rust"}), "c1")
        .await;
    assert!(!result.allowed);
    assert_eq!(result.error.unwrap().code, ErrorCode::InvalidRequest);

    assert_eq!(execution_log_count(&h.db), 0);
    assert_eq!(outbox_count(&h.db), 0);
}

#[tokio::test]
async fn capability_failure_is_audited_and_notified() {
    let h = harness();
    let missing = h.root.join("nope.txt");

    let result = h
        .router
        .route_operation(
            "fs",
            "read",
            &json!({"path": missing.display().to_string()}),
            "c1",
        )
        .await;

    assert!(!result.allowed);
    assert_eq!(result.error.unwrap().code, ErrorCode::PathNotFound);

    let (status, _, _) = h.audit.row_status(result.operation_id).unwrap().unwrap();
    assert_eq!(status, "failed");
    assert_eq!(outbox_count(&h.db), 1);
    let pending = h.outbox.pending(10).unwrap();
    assert!(pending[0].message_text.starts_with("❌"));
}

#[tokio::test]
async fn disabled_notifications_skip_outbox() {
    let h = harness();
    std::fs::write(h.root.join("a.txt"), "hello").unwrap();
    h.outbox.set_notifications_enabled("c2", false).unwrap();

    let result = h
        .router
        .route_operation(
            "fs",
            "read",
            &json!({"path": h.root.join("a.txt").display().to_string()}),
            "c2",
        )
        .await;

    assert!(result.allowed);
    assert_eq!(outbox_count(&h.db), 0);
}

#[tokio::test]
async fn list_and_search_route_through_broker() {
    let h = harness();
    std::fs::write(h.root.join("a.txt"), "needle here\n").unwrap();
    std::fs::create_dir_all(h.root.join("node_modules")).unwrap();
    std::fs::write(h.root.join("node_modules/skip.txt"), "needle\n").unwrap();

    let listing = h
        .router
        .route_operation(
            "fs",
            "list",
            &json!({"path": h.root.display().to_string()}),
            "c1",
        )
        .await;
    assert!(listing.allowed);
    assert_eq!(listing.result.unwrap()["count"], 1);

    let search = h
        .router
        .route_operation(
            "fs",
            "search",
            &json!({"path": h.root.display().to_string(), "pattern": "needle"}),
            "c1",
        )
        .await;
    // Accept rg-less environments; anything else must succeed.
    if let Some(error) = &search.error {
        assert_eq!(error.code, ErrorCode::RgNotFound);
    } else {
        assert_eq!(search.result.unwrap()["count"], 1);
    }
}
