use std::collections::HashMap;
use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use serde_json::Value;
use serde_json::json;
use tracing::warn;
use uuid::Uuid;

use warden_config::ConfigManager;
use warden_persistence::AuditStore;
use warden_persistence::OutboxStore;
use warden_protocol::BrokerResult;
use warden_protocol::ErrorCode;
use warden_protocol::OpError;
use warden_protocol::OperationStatus;
use warden_protocol::Tier;

use crate::classifier::classify_tier;
use crate::scope::ScopeValidator;

/// Git actions that manage snapshots themselves; the broker must not stack
/// another snapshot on top of them.
const SNAPSHOT_MANAGEMENT_ACTIONS: [&str; 3] = ["rollback", "list_snapshots", "prune_snapshots"];

const KNOWN_OPERATIONS: [(&str, &str); 11] = [
    ("fs", "read"),
    ("fs", "list"),
    ("fs", "search"),
    ("fs", "apply_patch"),
    ("git", "status"),
    ("git", "diff"),
    ("git", "commit"),
    ("git", "checkout"),
    ("git", "list_snapshots"),
    ("git", "prune_snapshots"),
    ("git", "rollback"),
];

/// Terse denial line relayed back through the chat transport.
pub fn denial_text(error: &OpError) -> String {
    format!("❌ Operation denied: {}", error.message)
}

/// Central routing and policy enforcement for all capabilities. The only
/// permitted entry point from the agent side.
pub struct BrokerRouter {
    scope: ScopeValidator,
    config: Arc<ConfigManager>,
    audit: AuditStore,
    outbox: OutboxStore,
    operation_start_times: Mutex<HashMap<Uuid, Instant>>,
}

impl BrokerRouter {
    pub fn new(
        scope: ScopeValidator,
        config: Arc<ConfigManager>,
        audit: AuditStore,
        outbox: OutboxStore,
    ) -> Self {
        Self {
            scope,
            config,
            audit,
            outbox,
            operation_start_times: Mutex::new(HashMap::new()),
        }
    }

    /// Route one operation through the non-negotiable sequence: classify,
    /// validate params, validate scope, audit start, snapshot mutating
    /// tiers, execute under deadline, audit end, enqueue notification.
    pub async fn route_operation(
        &self,
        capability: &str,
        action: &str,
        params: &Value,
        chat_id: &str,
    ) -> BrokerResult {
        let operation_id = Uuid::new_v4();
        self.record_start(operation_id);

        let file_count = count_files(params);
        let tier = classify_tier(capability, action, file_count);

        // Parameter validation: no audit row is written for malformed
        // requests.
        if let Err(error) = validate_params(capability, action, params) {
            self.drop_start(operation_id);
            return BrokerResult::denied(operation_id, tier, error);
        }

        // Scope validation.
        if let Err(error) = self.validate_scope(operation_id, capability, action, params, chat_id) {
            self.drop_start(operation_id);
            return BrokerResult::denied(operation_id, tier, error);
        }

        // Audit start. A broken audit trail blocks execution.
        let affected = affected_paths(params);
        if let Err(store_err) = self.audit.insert_start(
            operation_id,
            capability,
            action,
            chat_id,
            tier,
            affected.as_deref(),
        ) {
            self.drop_start(operation_id);
            return BrokerResult::denied(
                operation_id,
                tier,
                OpError::new(
                    ErrorCode::ExecutionError,
                    format!("Failed to record operation start: {store_err}"),
                ),
            );
        }

        // Snapshot tier 1/2 operations, except snapshot management itself.
        let mut snapshot_ref: Option<String> = None;
        if tier.requires_snapshot()
            && !(capability == "git" && SNAPSHOT_MANAGEMENT_ACTIONS.contains(&action))
        {
            match self.create_snapshot(operation_id, capability, params).await {
                Ok(reference) => snapshot_ref = Some(reference),
                Err(error) => {
                    return self
                        .finish_operation(
                            operation_id,
                            capability,
                            action,
                            chat_id,
                            tier,
                            affected,
                            None,
                            Err(error),
                        )
                        .await;
                }
            }
        }

        // Deadline-bounded execution.
        let timeout_seconds = self.config.int("broker.operation_timeout_seconds").max(1) as u64;
        let outcome = match tokio::time::timeout(
            Duration::from_secs(timeout_seconds),
            self.execute(operation_id, capability, action, params),
        )
        .await
        {
            Ok(result) => result,
            Err(_) => Err(OpError::new(ErrorCode::Timeout, "Operation timed out").retryable()),
        };

        self.finish_operation(
            operation_id,
            capability,
            action,
            chat_id,
            tier,
            affected,
            snapshot_ref,
            outcome,
        )
        .await
    }

    fn record_start(&self, operation_id: Uuid) {
        let mut map = self
            .operation_start_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.insert(operation_id, Instant::now());
    }

    fn drop_start(&self, operation_id: Uuid) {
        let mut map = self
            .operation_start_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&operation_id);
    }

    fn take_duration_ms(&self, operation_id: Uuid) -> Option<i64> {
        let mut map = self
            .operation_start_times
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        map.remove(&operation_id)
            .map(|start| start.elapsed().as_millis() as i64)
    }

    fn validate_scope(
        &self,
        operation_id: Uuid,
        capability: &str,
        action: &str,
        params: &Value,
        chat_id: &str,
    ) -> Result<(), OpError> {
        let mut candidates: Vec<&str> = Vec::new();
        match capability {
            "fs" => {
                if let Some(path) = str_param(params, "path") {
                    candidates.push(path);
                }
                if let Some(paths) = params.get("paths").and_then(Value::as_array) {
                    for entry in paths {
                        if let Some(path) = entry.as_str() {
                            candidates.push(path);
                        }
                    }
                }
            }
            "git" => {
                if let Some(repo) = str_param(params, "repo_path") {
                    candidates.push(repo);
                }
            }
            _ => {}
        }

        for path in candidates {
            if let Err(reason) = self.scope.validate(path) {
                let normalized = self.scope.normalized(path);
                let allowed_roots = self.scope.allowed_roots();
                warn!(
                    operation_id = %operation_id,
                    chat_id,
                    capability,
                    action,
                    attempted_path = path,
                    normalized_path = normalized.as_deref().unwrap_or(""),
                    allowed_roots = ?allowed_roots,
                    "scope_violation_blocked"
                );
                return Err(OpError::new(ErrorCode::ScopeViolation, reason).with_details(json!({
                    "path": path,
                    "normalized_path": normalized,
                    "allowed_roots": allowed_roots,
                })));
            }
        }
        Ok(())
    }

    async fn create_snapshot(
        &self,
        operation_id: Uuid,
        capability: &str,
        params: &Value,
    ) -> Result<String, OpError> {
        let target = match capability {
            "git" => str_param(params, "repo_path"),
            _ => str_param(params, "path").or_else(|| {
                params
                    .get("paths")
                    .and_then(Value::as_array)
                    .and_then(|paths| paths.first())
                    .and_then(Value::as_str)
            }),
        }
        .ok_or_else(|| {
            OpError::new(
                ErrorCode::InvalidRequest,
                "Cannot determine snapshot target for mutating operation",
            )
        })?;

        let repo_root = warden_git::find_repo_root(Path::new(target))?;
        let timeout = self.config.int("git.operation_timeout_seconds").max(1) as u64;
        warden_git::create_snapshot(&repo_root, operation_id, timeout).await
    }

    #[allow(clippy::too_many_arguments)]
    async fn finish_operation(
        &self,
        operation_id: Uuid,
        capability: &str,
        action: &str,
        chat_id: &str,
        tier: Tier,
        affected: Option<Vec<String>>,
        snapshot_ref: Option<String>,
        outcome: Result<Value, OpError>,
    ) -> BrokerResult {
        let duration_ms = self.take_duration_ms(operation_id);
        let status = match &outcome {
            Ok(_) => OperationStatus::Completed,
            Err(error) if error.code == ErrorCode::Timeout => OperationStatus::Timeout,
            Err(_) => OperationStatus::Failed,
        };

        if let Err(store_err) = self.audit.finish(
            operation_id,
            status,
            snapshot_ref.as_deref(),
            duration_ms,
            outcome.as_ref().err(),
        ) {
            warn!(
                operation_id = %operation_id,
                error = %store_err,
                "failed to record operation end"
            );
        }

        // Outbox enqueue on every terminal status, when the chat wants it.
        // Enqueue failures never affect the operation's result.
        let wants_notification = self
            .outbox
            .notifications_enabled(chat_id)
            .unwrap_or(true);
        if wants_notification {
            let text = notification_text(
                capability,
                action,
                status,
                affected.as_deref().unwrap_or(&[]),
                snapshot_ref.as_deref(),
                outcome.as_ref().ok(),
            );
            if let Err(enqueue_err) =
                self.outbox
                    .enqueue(&operation_id.to_string(), chat_id, &text)
            {
                warn!(
                    operation_id = %operation_id,
                    error = %enqueue_err,
                    "failed to enqueue outcome notification"
                );
            }
        }

        match outcome {
            Ok(result) => BrokerResult {
                allowed: true,
                operation_id,
                tier,
                snapshot_ref,
                result: Some(result),
                error: None,
            },
            Err(error) => BrokerResult {
                allowed: false,
                operation_id,
                tier,
                snapshot_ref,
                result: None,
                error: Some(error),
            },
        }
    }

    /// Table dispatch to the capability implementations. Filesystem walks
    /// and patch I/O run on the blocking pool.
    async fn execute(
        &self,
        operation_id: Uuid,
        capability: &str,
        action: &str,
        params: &Value,
    ) -> Result<Value, OpError> {
        let git_timeout = self.config.int("git.operation_timeout_seconds").max(1) as u64;
        match (capability, action) {
            ("fs", "list") => {
                let path = required_path(params, "path")?;
                run_blocking(move || warden_fs::list_files(&path)).await
            }
            ("fs", "read") => {
                let path = required_path(params, "path")?;
                let max_mb = self.config.int("fs.max_read_mb").max(1) as u64;
                run_blocking(move || warden_fs::read_file(&path, max_mb)).await
            }
            ("fs", "search") => {
                let path = required_path(params, "path")?;
                let pattern = required_str(params, "pattern")?.to_string();
                let timeout = self.config.int("fs.search_timeout_seconds").max(1) as u64;
                to_value(warden_fs::search_files(&path, &pattern, timeout).await?)
            }
            ("fs", "apply_patch") => {
                let path = required_path(params, "path")?;
                let patch = required_str(params, "patch")?.to_string();
                let max_kb = self.config.int("fs.patch_max_kb").max(1) as u64;
                run_blocking(move || warden_fs::apply_patch(&path, &patch, max_kb)).await
            }
            ("git", "status") => {
                let repo = required_path(params, "repo_path")?;
                to_value(warden_git::status(&repo, git_timeout).await?)
            }
            ("git", "diff") => {
                let repo = required_path(params, "repo_path")?;
                let diff_type = str_param(params, "diff_type").unwrap_or("working_tree");
                let file_path = str_param(params, "file_path");
                let commit_refs: Option<Vec<String>> = params
                    .get("commit_refs")
                    .and_then(Value::as_array)
                    .map(|refs| {
                        refs.iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    });
                to_value(
                    warden_git::diff(
                        &repo,
                        diff_type,
                        file_path,
                        commit_refs.as_deref(),
                        git_timeout,
                    )
                    .await?,
                )
            }
            ("git", "commit") => {
                let repo = required_path(params, "repo_path")?;
                let message = required_str(params, "message")?;
                let file_paths: Option<Vec<String>> = params
                    .get("file_paths")
                    .and_then(Value::as_array)
                    .map(|paths| {
                        paths
                            .iter()
                            .filter_map(Value::as_str)
                            .map(str::to_string)
                            .collect()
                    });
                to_value(
                    warden_git::commit(&repo, message, file_paths.as_deref(), git_timeout).await?,
                )
            }
            ("git", "checkout") => {
                let repo = required_path(params, "repo_path")?;
                let branch = required_str(params, "branch")?;
                to_value(warden_git::checkout(&repo, branch, git_timeout).await?)
            }
            ("git", "list_snapshots") => {
                let repo = required_path(params, "repo_path")?;
                to_value(warden_git::list_snapshots(&repo, git_timeout).await?)
            }
            ("git", "prune_snapshots") => {
                let repo = required_path(params, "repo_path")?;
                let retention_days = params
                    .get("retention_days")
                    .and_then(Value::as_i64)
                    .unwrap_or_else(|| self.config.int("git.snapshot_retention_days"));
                to_value(
                    warden_git::prune_snapshots(&repo, retention_days, git_timeout).await?,
                )
            }
            ("git", "rollback") => {
                let repo = required_path(params, "repo_path")?;
                let snapshot_ref = required_str(params, "snapshot_ref")?;
                to_value(
                    warden_git::rollback_to_snapshot(
                        &repo,
                        snapshot_ref,
                        operation_id,
                        git_timeout,
                    )
                    .await?,
                )
            }
            _ => Err(unknown_operation(capability, action)),
        }
    }
}

fn unknown_operation(capability: &str, action: &str) -> OpError {
    OpError::new(
        ErrorCode::InvalidRequest,
        format!("Unknown operation: {capability}.{action}"),
    )
    .with_details(json!({"capability": capability, "action": action}))
}

fn count_files(params: &Value) -> usize {
    if params.get("path").is_some() {
        1
    } else if let Some(paths) = params.get("paths").and_then(Value::as_array) {
        paths.len()
    } else {
        0
    }
}

fn affected_paths(params: &Value) -> Option<Vec<String>> {
    let mut out = Vec::new();
    if let Some(path) = str_param(params, "path") {
        out.push(path.to_string());
    }
    if let Some(paths) = params.get("paths").and_then(Value::as_array) {
        for entry in paths {
            if let Some(path) = entry.as_str() {
                out.push(path.to_string());
            }
        }
    }
    if out.is_empty() { None } else { Some(out) }
}

fn str_param<'a>(params: &'a Value, key: &str) -> Option<&'a str> {
    params.get(key).and_then(Value::as_str)
}

fn missing_param(key: &str) -> OpError {
    OpError::new(
        ErrorCode::InvalidRequest,
        format!("Missing or invalid required parameter `{key}`"),
    )
    .with_details(json!({"missing": key}))
}

fn require_str_param(params: &Value, key: &str) -> Result<(), OpError> {
    match str_param(params, key) {
        Some(value) if !value.is_empty() => Ok(()),
        _ => Err(missing_param(key)),
    }
}

/// Required-parameter table, enforced before any audit row exists.
fn validate_params(capability: &str, action: &str, params: &Value) -> Result<(), OpError> {
    if !KNOWN_OPERATIONS.contains(&(capability, action)) {
        return Err(unknown_operation(capability, action));
    }

    match (capability, action) {
        ("fs", "read" | "list" | "search" | "apply_patch") => {
            require_str_param(params, "path")?;
            if action == "search" {
                require_str_param(params, "pattern")?;
            }
            if action == "apply_patch" {
                require_str_param(params, "patch")?;
            }
        }
        ("git", "status" | "diff" | "list_snapshots" | "prune_snapshots") => {
            require_str_param(params, "repo_path")?;
        }
        ("git", "commit") => {
            require_str_param(params, "repo_path")?;
            require_str_param(params, "message")?;
        }
        ("git", "checkout") => {
            require_str_param(params, "repo_path")?;
            require_str_param(params, "branch")?;
        }
        ("git", "rollback") => {
            require_str_param(params, "repo_path")?;
            require_str_param(params, "snapshot_ref")?;
        }
        _ => {}
    }
    Ok(())
}

fn required_path(params: &Value, key: &str) -> Result<PathBuf, OpError> {
    str_param(params, key)
        .map(PathBuf::from)
        .ok_or_else(|| missing_param(key))
}

fn required_str<'a>(params: &'a Value, key: &str) -> Result<&'a str, OpError> {
    str_param(params, key).ok_or_else(|| missing_param(key))
}

async fn run_blocking<T: serde::Serialize + Send + 'static>(
    f: impl FnOnce() -> Result<T, OpError> + Send + 'static,
) -> Result<Value, OpError> {
    match tokio::task::spawn_blocking(f).await {
        Ok(result) => to_value(result?),
        Err(join_err) => Err(OpError::new(
            ErrorCode::ExecutionError,
            format!("Capability task failed: {join_err}"),
        )),
    }
}

fn to_value<T: serde::Serialize>(value: T) -> Result<Value, OpError> {
    serde_json::to_value(value).map_err(|e| {
        OpError::new(
            ErrorCode::ExecutionError,
            format!("Failed to serialize capability result: {e}"),
        )
    })
}

/// Terse outcome line: emoji, `capability.action`, affected paths, status
/// word, patch line counts when present, and the snapshot ref.
fn notification_text(
    capability: &str,
    action: &str,
    status: OperationStatus,
    paths: &[String],
    snapshot_ref: Option<&str>,
    result: Option<&Value>,
) -> String {
    let emoji = match status {
        OperationStatus::Completed => "✅",
        OperationStatus::Timeout => "⏱️",
        _ => "❌",
    };
    let mut text = format!("{emoji} {capability}.{action} {status}");
    if !paths.is_empty() {
        text.push_str(&format!(" — {}", paths.join(", ")));
    }
    if let Some(result) = result {
        if let (Some(added), Some(removed)) = (
            result.get("lines_added").and_then(Value::as_u64),
            result.get("lines_removed").and_then(Value::as_u64),
        ) {
            text.push_str(&format!(" (+{added}/-{removed})"));
        }
    }
    if let Some(reference) = snapshot_ref {
        text.push_str(&format!(" [snapshot: {reference}]"));
    }
    text
}
