#![allow(clippy::unwrap_used)]

//! End-to-end git capability tests against throwaway repositories. Skipped
//! only if the `git` binary is unavailable.

use std::path::Path;
use std::process::Command;

use pretty_assertions::assert_eq;
use uuid::Uuid;

use warden_protocol::ErrorCode;

fn git(repo: &Path, args: &[&str]) {
    let status = Command::new("git")
        .arg("-C")
        .arg(repo)
        .args(args)
        .output()
        .unwrap();
    assert!(
        status.status.success(),
        "git {args:?} failed: {}",
        String::from_utf8_lossy(&status.stderr)
    );
}

fn init_repo() -> tempfile::TempDir {
    let dir = tempfile::tempdir().unwrap();
    let repo = dir.path();
    git(repo, &["init", "--initial-branch=main"]);
    git(repo, &["config", "user.email", "warden@test.local"]);
    git(repo, &["config", "user.name", "Warden Tests"]);
    std::fs::write(repo.join("a.txt"), "line1\nline2\nline3\n").unwrap();
    git(repo, &["add", "a.txt"]);
    git(repo, &["commit", "-m", "initial"]);
    dir
}

#[tokio::test]
async fn status_reports_branch_and_buckets() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "line1\nCHANGED\nline3\n").unwrap();
    std::fs::write(dir.path().join("new.txt"), "untracked\n").unwrap();

    let status = warden_git::status(dir.path(), 10).await.unwrap();
    assert_eq!(status.branch, "main");
    assert_eq!(status.modified, vec!["a.txt"]);
    assert_eq!(status.untracked, vec!["new.txt"]);
}

#[tokio::test]
async fn status_outside_repo_fails() {
    let dir = tempfile::tempdir().unwrap();
    let err = warden_git::status(dir.path(), 10).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::NotAGitRepo);
}

#[tokio::test]
async fn diff_modes() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "line1\nCHANGED\nline3\n").unwrap();

    let working = warden_git::diff(dir.path(), "working_tree", None, None, 10)
        .await
        .unwrap();
    assert!(working.diff.contains("+CHANGED"));

    git(dir.path(), &["add", "a.txt"]);
    let staged = warden_git::diff(dir.path(), "staged", None, None, 10)
        .await
        .unwrap();
    assert!(staged.diff.contains("+CHANGED"));

    let err = warden_git::diff(dir.path(), "commit", None, None, 10)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidDiffArgs);

    let err = warden_git::diff(dir.path(), "sideways", None, None, 10)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidDiffType);
}

#[tokio::test]
async fn commit_then_empty_commit() {
    let dir = init_repo();
    std::fs::write(dir.path().join("a.txt"), "line1\nline2\nline3\nline4\n").unwrap();

    let result = warden_git::commit(dir.path(), "Fix: Add second line", None, 10)
        .await
        .unwrap();
    assert!(result.commit_hash.is_some());
    assert_eq!(result.files_changed, 1);

    let subject = Command::new("git")
        .arg("-C")
        .arg(dir.path())
        .args(["log", "-1", "--pretty=%s"])
        .output()
        .unwrap();
    assert_eq!(
        String::from_utf8_lossy(&subject.stdout).trim(),
        "Fix: Add second line"
    );

    // The same commit again has nothing to stage.
    let repeat = warden_git::commit(dir.path(), "Fix: Add second line", None, 10)
        .await
        .unwrap();
    assert_eq!(repeat.commit_hash, None);
    assert_eq!(repeat.message, "No changes to commit");
    assert_eq!(repeat.files_changed, 0);
}

#[tokio::test]
async fn commit_with_explicit_paths_stages_untracked() {
    let dir = init_repo();
    std::fs::write(dir.path().join("brand_new.txt"), "fresh\n").unwrap();

    let result = warden_git::commit(
        dir.path(),
        "Feat: add brand new file",
        Some(&["brand_new.txt".to_string()]),
        10,
    )
    .await
    .unwrap();
    assert_eq!(result.files_changed, 1);
}

#[tokio::test]
async fn commit_rejects_bad_message_and_paths() {
    let dir = init_repo();
    let err = warden_git::commit(dir.path(), "just some words", None, 10)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidCommitMessage);

    let err = warden_git::commit(
        dir.path(),
        "Fix: ok",
        Some(&["../outside.txt".to_string()]),
        10,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidCommitFilePath);
}

#[tokio::test]
async fn snapshot_create_list_rollback() {
    let dir = init_repo();
    let op = Uuid::new_v4();

    let snapshot_ref = warden_git::create_snapshot(dir.path(), op, 10).await.unwrap();
    assert!(snapshot_ref.starts_with("snapshot/edit-"));

    // A second snapshot in the same minute takes the -<op4> suffix path;
    // across a minute boundary it simply gets a fresh stamp.
    let second = warden_git::create_snapshot(dir.path(), op, 10).await.unwrap();
    assert_ne!(second, snapshot_ref);

    let snapshots = warden_git::list_snapshots(dir.path(), 10).await.unwrap();
    let refs: Vec<&str> = snapshots.iter().map(|s| s.ref_name.as_str()).collect();
    assert!(refs.contains(&snapshot_ref.as_str()));
    assert!(refs.contains(&second.as_str()));

    // Mutate and commit, then roll back to the snapshot.
    std::fs::write(dir.path().join("a.txt"), "totally different\n").unwrap();
    warden_git::commit(dir.path(), "Chore: mutate file", None, 10)
        .await
        .unwrap();

    let rollback = warden_git::rollback_to_snapshot(dir.path(), &snapshot_ref, op, 30)
        .await
        .unwrap();
    assert_eq!(rollback.snapshot_ref, snapshot_ref);
    assert_eq!(rollback.files_restored, 1);
    assert_eq!(
        std::fs::read_to_string(dir.path().join("a.txt")).unwrap(),
        "line1\nline2\nline3\n"
    );

    // Rolling back again is a no-op with files_restored = 0.
    let repeat = warden_git::rollback_to_snapshot(dir.path(), &snapshot_ref, op, 30)
        .await
        .unwrap();
    assert_eq!(repeat.files_restored, 0);
}

#[tokio::test]
async fn rollback_unknown_snapshot() {
    let dir = init_repo();
    let err = warden_git::rollback_to_snapshot(
        dir.path(),
        "snapshot/edit-1999-01-01-0000",
        Uuid::new_v4(),
        10,
    )
    .await
    .unwrap_err();
    assert_eq!(err.code, ErrorCode::SnapshotNotFound);
}

#[tokio::test]
async fn prune_respects_retention_and_current_branch() {
    let dir = init_repo();

    // An old snapshot, a fresh snapshot, and an unparseable one.
    git(dir.path(), &["branch", "snapshot/edit-2020-01-01-0000"]);
    git(dir.path(), &["branch", "snapshot/edit-mystery"]);
    warden_git::create_snapshot(dir.path(), Uuid::new_v4(), 10)
        .await
        .unwrap();

    let result = warden_git::prune_snapshots(dir.path(), 7, 30).await.unwrap();
    assert_eq!(result.pruned_count, 1);
    assert_eq!(result.retained_count, 2);
    assert_eq!(result.current_branch, "main");

    let remaining = warden_git::list_snapshots(dir.path(), 10).await.unwrap();
    let refs: Vec<&str> = remaining.iter().map(|s| s.ref_name.as_str()).collect();
    assert!(!refs.contains(&"snapshot/edit-2020-01-01-0000"));
    assert!(refs.contains(&"snapshot/edit-mystery"));
}

#[tokio::test]
async fn prune_rejects_non_positive_retention() {
    let dir = init_repo();
    let err = warden_git::prune_snapshots(dir.path(), 0, 30).await.unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidRequest);
}

#[tokio::test]
async fn checkout_switches_and_reports_head() {
    let dir = init_repo();
    git(dir.path(), &["branch", "feature/topic"]);

    let result = warden_git::checkout(dir.path(), "feature/topic", 10).await.unwrap();
    assert_eq!(result.branch, "feature/topic");
    assert!(!result.commit_hash.is_empty());

    let err = warden_git::checkout(dir.path(), "no/such/branch", 10)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::CheckoutFailed);

    let err = warden_git::checkout(dir.path(), "origin/main", 10)
        .await
        .unwrap_err();
    assert_eq!(err.code, ErrorCode::InvalidBranch);
}
