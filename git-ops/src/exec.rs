use std::path::Path;
use std::process::Stdio;
use std::time::Duration;

use serde_json::json;
use tokio::process::Command;

use warden_protocol::ErrorCode;
use warden_protocol::OpError;

#[derive(Debug)]
pub struct GitOutput {
    pub code: i32,
    pub stdout: String,
    pub stderr: String,
}

impl GitOutput {
    pub fn success(&self) -> bool {
        self.code == 0
    }
}

/// Run `git -C <repo> <args…>` under `timeout`, returning the raw output
/// whatever the exit code. Spawn failure with a missing binary maps to
/// `git_not_found`; deadline expiry kills the child and maps to
/// `timeout_code` with `retryable=true`.
pub(crate) async fn run_git_raw(
    repo: &Path,
    args: &[&str],
    timeout: Duration,
    timeout_code: ErrorCode,
) -> Result<GitOutput, OpError> {
    let mut cmd = Command::new("git");
    cmd.arg("-C")
        .arg(repo)
        .args(args)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);

    let output = match tokio::time::timeout(timeout, cmd.output()).await {
        // Dropping the in-flight future kills the child (kill_on_drop).
        Err(_) => {
            return Err(
                OpError::new(
                    timeout_code,
                    format!("Git command timed out after {}s", timeout.as_secs()),
                )
                .with_details(json!({
                    "repo_path": repo.display().to_string(),
                    "command": args,
                }))
                .retryable(),
            );
        }
        Ok(Err(e)) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(OpError::new(
                ErrorCode::GitNotFound,
                "git CLI is required for git operations",
            )
            .with_details(json!({"repo_path": repo.display().to_string()})));
        }
        Ok(Err(e)) => {
            return Err(
                OpError::new(
                    ErrorCode::GitCommandFailed,
                    format!("Failed to spawn git: {e}"),
                )
                .with_details(json!({"repo_path": repo.display().to_string()})),
            );
        }
        Ok(Ok(output)) => output,
    };

    Ok(GitOutput {
        code: output.status.code().unwrap_or(-1),
        stdout: String::from_utf8_lossy(&output.stdout).into_owned(),
        stderr: String::from_utf8_lossy(&output.stderr)
            .trim()
            .to_string(),
    })
}

/// Like [`run_git_raw`] but a non-zero exit becomes an error:
/// `not_a_git_repo` when stderr says so, `git_command_failed` otherwise.
pub(crate) async fn run_git(
    repo: &Path,
    args: &[&str],
    timeout: Duration,
    timeout_code: ErrorCode,
) -> Result<GitOutput, OpError> {
    let output = run_git_raw(repo, args, timeout, timeout_code).await?;
    if output.success() {
        return Ok(output);
    }
    if output.stderr.to_lowercase().contains("not a git repository") {
        return Err(OpError::new(
            ErrorCode::NotAGitRepo,
            "Path is not a git repository",
        )
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "stderr": output.stderr,
        })));
    }
    Err(OpError::new(ErrorCode::GitCommandFailed, "Git command failed")
        .with_details(json!({
            "repo_path": repo.display().to_string(),
            "command": args,
            "stderr": output.stderr,
        })))
}
