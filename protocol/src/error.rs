use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;
use thiserror::Error;

/// Canonical error codes produced by the broker and capability layer.
///
/// The wire form is the snake_case name (`"scope_violation"`); `Display`
/// matches it so log lines and serialized payloads agree.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum ErrorCode {
    // Validation
    InvalidRequest,
    InvalidPatchFormat,
    InvalidPattern,
    InvalidBranch,
    InvalidCommitMessage,
    InvalidCommitFilePath,
    InvalidDiffArgs,
    InvalidDiffType,
    // Scope/policy
    ScopeViolation,
    // Resource limits
    FileTooLarge,
    PatchTooLarge,
    BinaryNotSupported,
    // Existence
    PathNotFound,
    InvalidDirectory,
    InvalidFile,
    NotAGitRepo,
    SnapshotNotFound,
    // External prerequisites
    RgNotFound,
    GitNotFound,
    // Execution
    PatchApplyFailed,
    SearchError,
    GitCommandFailed,
    CommitFailed,
    CheckoutFailed,
    RollbackFailed,
    SnapshotCreationFailed,
    ListSnapshotsFailed,
    PruneFailed,
    ExecutionError,
    // Timing
    Timeout,
    SearchTimeout,
    GitStatusTimeout,
    GitDiffTimeout,
    CheckoutTimeout,
    CommitTimeout,
    SnapshotTimeout,
    PruneTimeout,
    // Integrity
    MigrationTampered,
    // Config
    StaticUpdateRefused,
    ValidationFailed,
}

/// Uniform structured error: `{code, message, details?, retryable}`.
///
/// Capability errors carry this shape unchanged through the broker; the
/// broker itself only ever adds `timeout` and `execution_error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize, Error)]
#[error("{code}: {message}")]
pub struct OpError {
    pub code: ErrorCode,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
    pub retryable: bool,
}

impl OpError {
    pub fn new(code: ErrorCode, message: impl Into<String>) -> Self {
        Self {
            code,
            message: message.into(),
            details: None,
            retryable: false,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }

    pub fn retryable(mut self) -> Self {
        self.retryable = true;
        self
    }
}
