use std::path::Component;
use std::path::Path;
use std::sync::LazyLock;
use std::time::Duration;

use regex_lite::Regex;
use serde::Serialize;
use serde_json::json;

use warden_protocol::ErrorCode;
use warden_protocol::OpError;

use crate::exec::run_git;
use crate::exec::run_git_raw;

static COMMIT_SUBJECT_RE: LazyLock<Regex> = LazyLock::new(|| {
    let pattern = r"^(?:\[(Fix|Feat|Refactor|Docs|Test|Chore|Style)\]|(Fix|Feat|Refactor|Docs|Test|Chore|Style)):\s+.+$";
    match Regex::new(pattern) {
        Ok(re) => re,
        Err(_) => unreachable!("commit subject regex is a valid constant"),
    }
});

static BRANCH_NAME_RE: LazyLock<Regex> = LazyLock::new(|| {
    match Regex::new(r"^[A-Za-z0-9_][A-Za-z0-9_/-]*$") {
        Ok(re) => re,
        Err(_) => unreachable!("branch name regex is a valid constant"),
    }
});

const MAX_SUBJECT_LEN: usize = 72;
const MAX_MESSAGE_LEN: usize = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct StatusResult {
    pub branch: String,
    pub ahead: i64,
    pub behind: i64,
    pub modified: Vec<String>,
    pub staged: Vec<String>,
    pub untracked: Vec<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct DiffResult {
    pub repo_path: String,
    pub diff_type: String,
    pub file_path: Option<String>,
    pub commit_refs: Option<Vec<String>>,
    pub diff: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CheckoutResult {
    pub branch: String,
    pub commit_hash: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct CommitResult {
    pub commit_hash: Option<String>,
    pub message: String,
    pub files_changed: u64,
}

/// Machine-parsed `git status --porcelain=v2 --branch`.
pub async fn status(repo: &Path, timeout_seconds: u64) -> Result<StatusResult, OpError> {
    let output = run_git(
        repo,
        &["status", "--porcelain=v2", "--branch"],
        Duration::from_secs(timeout_seconds),
        ErrorCode::GitStatusTimeout,
    )
    .await?;
    Ok(parse_porcelain_v2(&output.stdout))
}

/// Porcelain v2 record paths are tab-delimited after the metadata; rename
/// records carry `new\told` and the destination is what callers care about.
fn extract_path(line: &str) -> String {
    if let Some((_, path_block)) = line.split_once('\t') {
        return path_block
            .rsplit('\t')
            .next()
            .unwrap_or(path_block)
            .trim()
            .to_string();
    }

    // Fallback for space-only fixtures: "1 …" has the path as the 9th token,
    // "2 …" as the 10th.
    let tokens: Vec<&str> = line.split_whitespace().collect();
    match tokens.first() {
        Some(&"1") if tokens.len() >= 9 => tokens[8].to_string(),
        Some(&"2") if tokens.len() >= 10 => tokens[9].to_string(),
        _ => tokens.last().copied().unwrap_or("").to_string(),
    }
}

fn parse_porcelain_v2(output: &str) -> StatusResult {
    let mut result = StatusResult {
        branch: "HEAD".to_string(),
        ahead: 0,
        behind: 0,
        modified: Vec::new(),
        staged: Vec::new(),
        untracked: Vec::new(),
    };

    for raw_line in output.lines() {
        let line = raw_line.trim_end();
        if line.is_empty() {
            continue;
        }
        if let Some(head) = line.strip_prefix("# branch.head ") {
            result.branch = head.trim().to_string();
            continue;
        }
        if let Some(ab) = line.strip_prefix("# branch.ab ") {
            for part in ab.split_whitespace() {
                if let Some(ahead) = part.strip_prefix('+') {
                    result.ahead = ahead.parse().unwrap_or(0);
                } else if let Some(behind) = part.strip_prefix('-') {
                    result.behind = behind.parse().unwrap_or(0);
                }
            }
            continue;
        }
        if let Some(untracked) = line.strip_prefix("? ") {
            result.untracked.push(untracked.trim().to_string());
            continue;
        }
        if line.starts_with("1 ") || line.starts_with("2 ") {
            let xy = line.split(' ').nth(1).unwrap_or("..");
            let path = extract_path(line);
            let mut chars = xy.chars();
            let staged_flag = chars.next().unwrap_or('.');
            let modified_flag = chars.next().unwrap_or('.');
            if staged_flag != '.' && !result.staged.contains(&path) {
                result.staged.push(path.clone());
            }
            if modified_flag != '.' && !result.modified.contains(&path) {
                result.modified.push(path);
            }
        }
    }

    result
}

/// Unified diff for one of the three supported modes.
pub async fn diff(
    repo: &Path,
    diff_type: &str,
    file_path: Option<&str>,
    commit_refs: Option<&[String]>,
    timeout_seconds: u64,
) -> Result<DiffResult, OpError> {
    let mut args: Vec<String> = vec!["diff".to_string()];
    match diff_type {
        "working_tree" => {}
        "staged" => args.push("--cached".to_string()),
        "commit" => match commit_refs {
            Some(refs) if refs.len() == 2 => {
                args.push(refs[0].clone());
                args.push(refs[1].clone());
            }
            _ => {
                return Err(OpError::new(
                    ErrorCode::InvalidDiffArgs,
                    "commit diff requires commit_refs with exactly two commit refs",
                )
                .with_details(json!({
                    "diff_type": diff_type,
                    "commit_refs": commit_refs,
                })));
            }
        },
        other => {
            return Err(OpError::new(
                ErrorCode::InvalidDiffType,
                "diff_type must be one of: working_tree, staged, commit",
            )
            .with_details(json!({"diff_type": other})));
        }
    }
    if let Some(path) = file_path {
        args.push("--".to_string());
        args.push(path.to_string());
    }

    let arg_refs: Vec<&str> = args.iter().map(String::as_str).collect();
    let output = run_git(
        repo,
        &arg_refs,
        Duration::from_secs(timeout_seconds),
        ErrorCode::GitDiffTimeout,
    )
    .await?;

    Ok(DiffResult {
        repo_path: repo.display().to_string(),
        diff_type: diff_type.to_string(),
        file_path: file_path.map(str::to_string),
        commit_refs: commit_refs.map(<[String]>::to_vec),
        diff: output.stdout,
    })
}

/// Branch names the checkout capability accepts: local, boring, and free of
/// revision-syntax tricks.
fn validate_branch_name(branch: &str) -> Result<(), OpError> {
    let reject = |reason: &str| {
        Err(OpError::new(
            ErrorCode::InvalidBranch,
            format!("Invalid branch name: {reason}"),
        )
        .with_details(json!({"branch": branch})))
    };

    for prefix in ["origin/", "remotes/", "refs/remotes/"] {
        if branch.starts_with(prefix) {
            return reject("remote-tracking refs cannot be checked out");
        }
    }
    if branch.contains("../") || branch.contains("..\\") {
        return reject("path traversal sequences are not allowed");
    }
    if branch.contains('~') || branch.contains('^') || branch.contains("@{") {
        return reject("revision syntax is not allowed");
    }
    if branch.starts_with('/') || branch.starts_with('-') {
        return reject("leading '/' or '-' is not allowed");
    }
    if !BRANCH_NAME_RE.is_match(branch) {
        return reject("branch name contains unsupported characters");
    }
    Ok(())
}

/// Validated `git switch -- <branch>`, returning the resulting short HEAD.
pub async fn checkout(
    repo: &Path,
    branch: &str,
    timeout_seconds: u64,
) -> Result<CheckoutResult, OpError> {
    validate_branch_name(branch)?;

    let timeout = Duration::from_secs(timeout_seconds);
    let output = run_git_raw(
        repo,
        &["switch", "--", branch],
        timeout,
        ErrorCode::CheckoutTimeout,
    )
    .await?;
    if !output.success() {
        if output.stderr.to_lowercase().contains("not a git repository") {
            return Err(OpError::new(
                ErrorCode::NotAGitRepo,
                "Path is not a git repository",
            )
            .with_details(json!({"repo_path": repo.display().to_string()})));
        }
        // Covers `pathspec`, `did not match any file`, and `invalid
        // reference` stderr as well as any other switch failure.
        return Err(OpError::new(
            ErrorCode::CheckoutFailed,
            format!("Failed to check out branch `{branch}`"),
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "branch": branch,
            "stderr": output.stderr,
        })));
    }

    let head = run_git(
        repo,
        &["rev-parse", "--short", "HEAD"],
        timeout,
        ErrorCode::CheckoutTimeout,
    )
    .await?;

    Ok(CheckoutResult {
        branch: branch.to_string(),
        commit_hash: head.stdout.trim().to_string(),
    })
}

fn validate_commit_message(message: &str) -> Result<(), OpError> {
    let invalid = |reason: &str| {
        Err(OpError::new(
            ErrorCode::InvalidCommitMessage,
            format!("Invalid commit message: {reason}"),
        )
        .with_details(json!({"message_preview": message.chars().take(80).collect::<String>()})))
    };

    let trimmed = message.trim();
    if trimmed.is_empty() {
        return invalid("message must not be empty");
    }
    let subject = trimmed.lines().next().unwrap_or("");
    if !COMMIT_SUBJECT_RE.is_match(subject) {
        return invalid(
            "subject must start with one of [Fix] [Feat] [Refactor] [Docs] [Test] [Chore] [Style] or the bare prefix form `Fix: …`",
        );
    }
    if subject.len() > MAX_SUBJECT_LEN {
        return invalid("subject exceeds 72 characters");
    }
    if trimmed.len() > MAX_MESSAGE_LEN {
        return invalid("message exceeds 4096 characters");
    }
    Ok(())
}

/// Resolve `.` and `..` lexically; used for the containment check on
/// explicit commit paths (the file may be freshly deleted, so touching the
/// filesystem is not an option).
fn normalize_lexically(path: &Path) -> std::path::PathBuf {
    let mut out = std::path::PathBuf::new();
    for component in path.components() {
        match component {
            Component::ParentDir => {
                out.pop();
            }
            Component::CurDir => {}
            other => out.push(other.as_os_str()),
        }
    }
    out
}

fn validate_commit_paths(repo: &Path, file_paths: &[String]) -> Result<(), OpError> {
    let repo_root = normalize_lexically(repo);
    for raw in file_paths {
        let reject = |reason: &str| {
            Err(OpError::new(
                ErrorCode::InvalidCommitFilePath,
                format!("Invalid commit file path: {reason}"),
            )
            .with_details(json!({"path": raw})))
        };
        if raw.trim().is_empty() {
            return reject("path must not be empty");
        }
        if raw.starts_with('-') {
            return reject("leading '-' is not allowed");
        }
        let candidate = Path::new(raw);
        if candidate.components().any(|c| c == Component::ParentDir) {
            return reject("`..` segments are not allowed");
        }
        let absolute = if candidate.is_absolute() {
            normalize_lexically(candidate)
        } else {
            normalize_lexically(&repo_root.join(candidate))
        };
        if !absolute.starts_with(&repo_root) {
            return reject("path resolves outside the repository");
        }
    }
    Ok(())
}

/// Constrained commit: validated message, explicit-path or tracked-only
/// staging (`git add -u`, never `-A`), and a graceful empty-commit result.
pub async fn commit(
    repo: &Path,
    message: &str,
    file_paths: Option<&[String]>,
    timeout_seconds: u64,
) -> Result<CommitResult, OpError> {
    validate_commit_message(message)?;
    let timeout = Duration::from_secs(timeout_seconds);

    match file_paths {
        Some(paths) if !paths.is_empty() => {
            validate_commit_paths(repo, paths)?;
            for path in paths {
                run_git(
                    repo,
                    &["add", "--", path],
                    timeout,
                    ErrorCode::CommitTimeout,
                )
                .await?;
            }
        }
        _ => {
            run_git(repo, &["add", "-u"], timeout, ErrorCode::CommitTimeout).await?;
        }
    }

    let output = run_git_raw(
        repo,
        &["commit", "-m", message],
        timeout,
        ErrorCode::CommitTimeout,
    )
    .await?;
    if !output.success() {
        let combined = format!("{}\n{}", output.stdout, output.stderr).to_lowercase();
        if combined.contains("nothing to commit") || combined.contains("no changes added to commit")
        {
            return Ok(CommitResult {
                commit_hash: None,
                message: "No changes to commit".to_string(),
                files_changed: 0,
            });
        }
        return Err(OpError::new(ErrorCode::CommitFailed, "Failed to create commit")
            .with_details(json!({
                "repo_path": repo.display().to_string(),
                "stderr": output.stderr,
            })));
    }

    let head = run_git(
        repo,
        &["rev-parse", "--short", "HEAD"],
        timeout,
        ErrorCode::CommitTimeout,
    )
    .await?;
    let changed = run_git(
        repo,
        &["diff-tree", "--no-commit-id", "--name-only", "-r", "HEAD"],
        timeout,
        ErrorCode::CommitTimeout,
    )
    .await?;
    let files_changed = changed
        .stdout
        .lines()
        .filter(|line| !line.trim().is_empty())
        .count() as u64;

    Ok(CommitResult {
        commit_hash: Some(head.stdout.trim().to_string()),
        message: message.to_string(),
        files_changed,
    })
}

#[cfg(test)]
mod tests {
    #![allow(clippy::unwrap_used)]
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn porcelain_parse_extracts_branch_and_buckets() {
        let output = "\
# branch.oid 1234567
# branch.head main
# branch.ab +2 -1
1 .M N... 100644 100644 100644 aaa bbb\tsrc/lib.rs
1 M. N... 100644 100644 100644 aaa bbb\tsrc/staged.rs
1 MM N... 100644 100644 100644 aaa bbb\tsrc/both.rs
2 R. N... 100644 100644 100644 aaa bbb R100 src/old.rs\tsrc/renamed.rs
? notes.txt
";
        let status = parse_porcelain_v2(output);
        assert_eq!(status.branch, "main");
        assert_eq!(status.ahead, 2);
        assert_eq!(status.behind, 1);
        assert_eq!(status.modified, vec!["src/lib.rs", "src/both.rs"]);
        assert_eq!(
            status.staged,
            vec!["src/staged.rs", "src/both.rs", "src/renamed.rs"]
        );
        assert_eq!(status.untracked, vec!["notes.txt"]);
    }

    #[test]
    fn porcelain_parse_empty_output() {
        let status = parse_porcelain_v2("");
        assert_eq!(status.branch, "HEAD");
        assert!(status.modified.is_empty());
    }

    #[test]
    fn branch_validation_rejects_remote_and_revision_syntax() {
        for bad in [
            "origin/main",
            "remotes/origin/main",
            "refs/remotes/origin/main",
            "../escape",
            "a/..\\b",
            "HEAD~1",
            "main^",
            "main@{yesterday}",
            "/leading",
            "-flag",
            "spaces are bad",
            "",
        ] {
            assert!(
                validate_branch_name(bad).is_err(),
                "expected rejection of {bad:?}"
            );
        }
    }

    #[test]
    fn branch_validation_accepts_ordinary_names() {
        for good in ["main", "feature/add-parser", "snapshot/edit-2026-02-26-1200", "v1_2"] {
            assert!(validate_branch_name(good).is_ok(), "expected accept of {good:?}");
        }
    }

    #[test]
    fn commit_message_validation() {
        assert!(validate_commit_message("Fix: Add second line").is_ok());
        assert!(validate_commit_message("[Feat]: introduce parser").is_ok());
        assert!(validate_commit_message("Chore: bump deps\n\nLonger body here.").is_ok());

        assert!(validate_commit_message("").is_err());
        assert!(validate_commit_message("   ").is_err());
        assert!(validate_commit_message("fixing stuff").is_err());
        assert!(validate_commit_message("Fix:no space after colon").is_err());
        assert!(validate_commit_message("Bump: not a known prefix").is_err());
        let long_subject = format!("Fix: {}", "x".repeat(80));
        assert!(validate_commit_message(&long_subject).is_err());
        let long_body = format!("Fix: ok\n\n{}", "y".repeat(5000));
        assert!(validate_commit_message(&long_body).is_err());
    }

    #[test]
    fn commit_path_validation() {
        let repo = Path::new("/tmp/repo");
        assert!(validate_commit_paths(repo, &["src/lib.rs".into()]).is_ok());
        assert!(validate_commit_paths(repo, &["/tmp/repo/src/lib.rs".into()]).is_ok());

        assert!(validate_commit_paths(repo, &["".into()]).is_err());
        assert!(validate_commit_paths(repo, &["-rf".into()]).is_err());
        assert!(validate_commit_paths(repo, &["../outside.txt".into()]).is_err());
        assert!(validate_commit_paths(repo, &["/etc/passwd".into()]).is_err());
    }
}
