use std::path::Path;
use std::path::PathBuf;
use std::time::Duration;
use std::time::Instant;

use chrono::NaiveDateTime;
use chrono::Utc;
use serde::Serialize;
use serde_json::json;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use warden_protocol::ErrorCode;
use warden_protocol::OpError;

use crate::exec::run_git;
use crate::exec::run_git_raw;

const SNAPSHOT_PREFIX: &str = "snapshot/edit-";
const STAMP_FORMAT: &str = "%Y-%m-%d-%H%M";

#[derive(Debug, Clone, Serialize)]
pub struct SnapshotInfo {
    #[serde(rename = "ref")]
    pub ref_name: String,
    /// Human-readable stamp, or `"Unknown"` for refs whose name does not
    /// parse. Unparseable refs are kept so pruning never silently drops
    /// them.
    pub timestamp: String,
    #[serde(skip)]
    pub parsed: Option<NaiveDateTime>,
}

#[derive(Debug, Clone, Serialize)]
pub struct PruneResult {
    pub pruned_count: u64,
    pub retained_count: u64,
    pub current_branch: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct RollbackResult {
    pub snapshot_ref: String,
    pub commit_hash: String,
    pub files_restored: u64,
}

/// Walk upward from `file_path` to the first directory containing `.git`.
pub fn find_repo_root(file_path: &Path) -> Result<PathBuf, OpError> {
    let mut current = std::fs::canonicalize(file_path).unwrap_or_else(|_| file_path.to_path_buf());
    if !current.is_dir() {
        current = current
            .parent()
            .map(Path::to_path_buf)
            .unwrap_or(current);
    }

    loop {
        if current.join(".git").exists() {
            return Ok(current);
        }
        match current.parent() {
            Some(parent) => current = parent.to_path_buf(),
            None => break,
        }
    }

    Err(OpError::new(
        ErrorCode::NotAGitRepo,
        "No git repository found for the given path",
    )
    .with_details(json!({"path": file_path.display().to_string()})))
}

/// Create a snapshot branch at HEAD without switching to it.
///
/// Branch name is `snapshot/edit-YYYY-MM-DD-HHMM` (UTC); a same-minute
/// collision retries once with a `-<op4>` suffix.
pub async fn create_snapshot(
    repo: &Path,
    operation_id: Uuid,
    timeout_seconds: u64,
) -> Result<String, OpError> {
    let timeout = Duration::from_secs(timeout_seconds);
    let stamp = Utc::now().format(STAMP_FORMAT);
    let mut branch_name = format!("{SNAPSHOT_PREFIX}{stamp}");

    let output = run_git_raw(
        repo,
        &["branch", &branch_name],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    if !output.success() {
        if !output.stderr.contains("already exists") {
            return Err(snapshot_creation_failed(repo, &branch_name, &output.stderr));
        }
        let op_hex = operation_id.simple().to_string();
        branch_name = format!("{branch_name}-{}", &op_hex[..4]);
        let retry = run_git_raw(
            repo,
            &["branch", &branch_name],
            timeout,
            ErrorCode::SnapshotTimeout,
        )
        .await?;
        if !retry.success() {
            return Err(snapshot_creation_failed(repo, &branch_name, &retry.stderr));
        }
    }

    info!(
        repo_path = %repo.display(),
        operation_id = %operation_id,
        snapshot_ref = %branch_name,
        "snapshot_created"
    );
    Ok(branch_name)
}

fn snapshot_creation_failed(repo: &Path, branch_name: &str, stderr: &str) -> OpError {
    OpError::new(
        ErrorCode::SnapshotCreationFailed,
        "Failed to create snapshot branch",
    )
    .with_details(json!({
        "repo_path": repo.display().to_string(),
        "branch_name": branch_name,
        "stderr": stderr,
    }))
}

/// Parse the `YYYY-MM-DD-HHMM` stamp out of a snapshot ref, ignoring any
/// collision suffix.
fn parse_snapshot_stamp(ref_name: &str) -> Option<NaiveDateTime> {
    let rest = ref_name.strip_prefix(SNAPSHOT_PREFIX)?;
    let mut parts = rest.splitn(5, '-');
    let (year, month, day, time) = (parts.next()?, parts.next()?, parts.next()?, parts.next()?);
    NaiveDateTime::parse_from_str(&format!("{year}-{month}-{day}-{time}"), STAMP_FORMAT).ok()
}

fn snapshot_info(ref_name: &str) -> SnapshotInfo {
    let parsed = parse_snapshot_stamp(ref_name);
    let timestamp = parsed
        .map(|dt| dt.format("%b %d, %Y %H:%M UTC").to_string())
        .unwrap_or_else(|| "Unknown".to_string());
    SnapshotInfo {
        ref_name: ref_name.to_string(),
        timestamp,
        parsed,
    }
}

/// List snapshot branches, newest first. Unparseable refs sort last but are
/// never dropped.
pub async fn list_snapshots(
    repo: &Path,
    timeout_seconds: u64,
) -> Result<Vec<SnapshotInfo>, OpError> {
    let output = run_git_raw(
        repo,
        &["branch", "--list", "snapshot/*"],
        Duration::from_secs(timeout_seconds),
        ErrorCode::ListSnapshotsFailed,
    )
    .await?;
    if !output.success() {
        return Err(OpError::new(
            ErrorCode::ListSnapshotsFailed,
            "Failed to list snapshot branches",
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "stderr": output.stderr,
        })));
    }

    let mut snapshots: Vec<SnapshotInfo> = output
        .stdout
        .lines()
        .map(|line| line.trim().trim_start_matches("* ").trim())
        .filter(|name| !name.is_empty())
        .map(snapshot_info)
        .collect();
    snapshots.sort_by(|a, b| b.parsed.cmp(&a.parsed));
    Ok(snapshots)
}

/// Delete snapshot branches older than `retention_days` under one global
/// deadline. The current branch and young or unparseable snapshots are
/// retained; per-branch failures are logged and counted as retained.
pub async fn prune_snapshots(
    repo: &Path,
    retention_days: i64,
    total_timeout_seconds: u64,
) -> Result<PruneResult, OpError> {
    if retention_days <= 0 {
        return Err(OpError::new(
            ErrorCode::InvalidRequest,
            "retention_days must be positive",
        )
        .with_details(json!({"retention_days": retention_days})));
    }

    let deadline = Instant::now() + Duration::from_secs(total_timeout_seconds);
    let remaining = |code: ErrorCode| -> Result<Duration, OpError> {
        let left = deadline.saturating_duration_since(Instant::now());
        if left.is_zero() {
            Err(OpError::new(
                code,
                format!("Snapshot prune exceeded {total_timeout_seconds}s deadline"),
            )
            .with_details(json!({"repo_path": repo.display().to_string()}))
            .retryable())
        } else {
            Ok(left)
        }
    };

    let snapshots = {
        let budget = remaining(ErrorCode::PruneTimeout)?;
        list_snapshots(repo, budget.as_secs().max(1)).await?
    };

    let current_branch = {
        let budget = remaining(ErrorCode::PruneTimeout)?;
        let output = run_git(
            repo,
            &["rev-parse", "--abbrev-ref", "HEAD"],
            budget,
            ErrorCode::PruneTimeout,
        )
        .await?;
        output.stdout.trim().to_string()
    };

    let now = Utc::now().naive_utc();
    let retention = chrono::Duration::days(retention_days);
    let mut pruned = 0u64;
    let mut retained = 0u64;

    for snapshot in snapshots {
        if snapshot.ref_name == current_branch {
            retained += 1;
            continue;
        }
        let old_enough = match snapshot.parsed {
            Some(stamp) => now.signed_duration_since(stamp) >= retention,
            // An unparseable stamp cannot be proven old; keep it.
            None => false,
        };
        if !old_enough {
            retained += 1;
            continue;
        }

        let budget = deadline.saturating_duration_since(Instant::now());
        if budget.is_zero() {
            warn!(
                snapshot_ref = %snapshot.ref_name,
                "prune deadline exhausted; remaining snapshots retained"
            );
            retained += 1;
            continue;
        }
        match run_git_raw(
            repo,
            &["branch", "-D", &snapshot.ref_name],
            budget,
            ErrorCode::PruneTimeout,
        )
        .await
        {
            Ok(output) if output.success() => pruned += 1,
            Ok(output) => {
                warn!(
                    snapshot_ref = %snapshot.ref_name,
                    stderr = %output.stderr,
                    "failed to delete snapshot branch; retained"
                );
                retained += 1;
            }
            Err(err) => {
                warn!(
                    snapshot_ref = %snapshot.ref_name,
                    error = %err,
                    "snapshot deletion errored; retained"
                );
                retained += 1;
            }
        }
    }

    info!(
        repo_path = %repo.display(),
        pruned_count = pruned,
        retained_count = retained,
        "snapshots_pruned"
    );
    Ok(PruneResult {
        pruned_count: pruned,
        retained_count: retained,
        current_branch,
    })
}

/// Restore files from a snapshot branch without rewriting history:
/// `git checkout <ref> -- .` followed by a rollback commit.
pub async fn rollback_to_snapshot(
    repo: &Path,
    snapshot_ref: &str,
    operation_id: Uuid,
    timeout_seconds: u64,
) -> Result<RollbackResult, OpError> {
    let timeout = Duration::from_secs(timeout_seconds);

    let verify = run_git_raw(
        repo,
        &["rev-parse", "--verify", snapshot_ref],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    if !verify.success() {
        return Err(OpError::new(
            ErrorCode::SnapshotNotFound,
            format!("Snapshot branch not found: {snapshot_ref}"),
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "snapshot_ref": snapshot_ref,
            "stderr": verify.stderr,
        })));
    }

    let restore = run_git_raw(
        repo,
        &["checkout", snapshot_ref, "--", "."],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    if !restore.success() {
        return Err(OpError::new(
            ErrorCode::RollbackFailed,
            "Failed to restore files from snapshot",
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "snapshot_ref": snapshot_ref,
            "stderr": restore.stderr,
        })));
    }

    let op_hex = operation_id.simple().to_string();
    let commit_message =
        format!("Rollback to snapshot: {snapshot_ref} (operation: {})", &op_hex[..8]);
    let commit = run_git_raw(
        repo,
        &["commit", "-a", "-m", &commit_message],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    if !commit.success() {
        let combined = format!("{}\n{}", commit.stdout, commit.stderr).to_lowercase();
        if combined.contains("nothing to commit") {
            // Already at the snapshot state.
            let head = run_git(
                repo,
                &["rev-parse", "--short", "HEAD"],
                timeout,
                ErrorCode::SnapshotTimeout,
            )
            .await?;
            info!(
                repo_path = %repo.display(),
                snapshot_ref,
                "rollback produced no changes"
            );
            return Ok(RollbackResult {
                snapshot_ref: snapshot_ref.to_string(),
                commit_hash: head.stdout.trim().to_string(),
                files_restored: 0,
            });
        }
        return Err(OpError::new(
            ErrorCode::CommitFailed,
            "Failed to create rollback commit",
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "snapshot_ref": snapshot_ref,
            "stderr": commit.stderr,
        })));
    }

    let head = run_git(
        repo,
        &["rev-parse", "--short", "HEAD"],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    let changed = run_git(
        repo,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"],
        timeout,
        ErrorCode::SnapshotTimeout,
    )
    .await?;
    let files_restored = changed
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count() as u64;

    let commit_hash = head.stdout.trim().to_string();
    info!(
        repo_path = %repo.display(),
        snapshot_ref,
        commit_hash = %commit_hash,
        files_restored,
        "rollback_complete"
    );
    Ok(RollbackResult {
        snapshot_ref: snapshot_ref.to_string(),
        commit_hash,
        files_restored,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn stamp_parses_with_and_without_suffix() {
        let plain = parse_snapshot_stamp("snapshot/edit-2026-02-26-1200").unwrap();
        assert_eq!(plain.format("%Y-%m-%d %H:%M").to_string(), "2026-02-26 12:00");

        let suffixed = parse_snapshot_stamp("snapshot/edit-2026-02-26-1200-ab12").unwrap();
        assert_eq!(suffixed, plain);

        assert!(parse_snapshot_stamp("snapshot/edit-garbage").is_none());
        assert!(parse_snapshot_stamp("feature/other").is_none());
    }

    #[test]
    fn snapshot_info_formats_or_marks_unknown() {
        let info = snapshot_info("snapshot/edit-2026-02-26-1200");
        assert_eq!(info.timestamp, "Feb 26, 2026 12:00 UTC");

        let info = snapshot_info("snapshot/edit-not-a-stamp");
        assert_eq!(info.timestamp, "Unknown");
        assert!(info.parsed.is_none());
    }

    #[test]
    fn snapshots_sort_newest_first_with_unknown_last() {
        let mut snapshots = vec![
            snapshot_info("snapshot/edit-2026-01-01-0900"),
            snapshot_info("snapshot/edit-weird"),
            snapshot_info("snapshot/edit-2026-02-26-1200"),
        ];
        snapshots.sort_by(|a, b| b.parsed.cmp(&a.parsed));
        assert_eq!(snapshots[0].ref_name, "snapshot/edit-2026-02-26-1200");
        assert_eq!(snapshots[1].ref_name, "snapshot/edit-2026-01-01-0900");
        assert_eq!(snapshots[2].ref_name, "snapshot/edit-weird");
    }

    #[test]
    fn find_repo_root_walks_upward() {
        let dir = tempfile::tempdir().unwrap();
        let repo = dir.path().join("repo");
        std::fs::create_dir_all(repo.join(".git")).unwrap();
        std::fs::create_dir_all(repo.join("src/deep")).unwrap();
        std::fs::write(repo.join("src/deep/file.rs"), "x").unwrap();

        let root = find_repo_root(&repo.join("src/deep/file.rs")).unwrap();
        assert_eq!(root, std::fs::canonicalize(&repo).unwrap());

        let err = find_repo_root(dir.path()).unwrap_err();
        assert_eq!(err.code, ErrorCode::NotAGitRepo);
    }
}
