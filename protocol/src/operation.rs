use serde::Deserialize;
use serde::Deserializer;
use serde::Serialize;
use serde::Serializer;
use serde_json::Value;
use uuid::Uuid;

use crate::OpError;

/// Risk classification of one operation. Determines whether the broker
/// creates a git snapshot before running the capability.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Tier {
    /// Read-only, no state changes.
    ReadOnly,
    /// Single-file modification, automatic snapshot.
    SingleFile,
    /// Multi-file modification, comprehensive snapshot.
    MultiFile,
    /// Destructive; reserved until a confirmation protocol exists.
    Destructive,
}

impl Tier {
    pub const fn as_u8(self) -> u8 {
        match self {
            Tier::ReadOnly => 0,
            Tier::SingleFile => 1,
            Tier::MultiFile => 2,
            Tier::Destructive => 3,
        }
    }

    pub const fn from_u8(value: u8) -> Option<Self> {
        match value {
            0 => Some(Tier::ReadOnly),
            1 => Some(Tier::SingleFile),
            2 => Some(Tier::MultiFile),
            3 => Some(Tier::Destructive),
            _ => None,
        }
    }

    /// Tier 1 and 2 operations get a pre-execution snapshot.
    pub const fn requires_snapshot(self) -> bool {
        matches!(self, Tier::SingleFile | Tier::MultiFile)
    }
}

// Tiers are numbers on the wire and in the database, not names.
impl Serialize for Tier {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_u8(self.as_u8())
    }
}

impl<'de> Deserialize<'de> for Tier {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let raw = u8::deserialize(deserializer)?;
        Tier::from_u8(raw)
            .ok_or_else(|| serde::de::Error::custom(format!("tier out of range: {raw}")))
    }
}

/// Terminal and in-flight states of an `execution_log` row.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OperationStatus {
    InProgress,
    Completed,
    Failed,
    Postponed,
    Cancelled,
    Timeout,
}

impl OperationStatus {
    pub const fn is_terminal(self) -> bool {
        !matches!(self, OperationStatus::InProgress)
    }
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum OutboxStatus {
    Pending,
    Sent,
    Failed,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum PostponementStatus {
    Waiting,
    Postponed,
    Resolved,
    Cancelled,
}

/// One agent-issued operation as submitted to the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OperationRequest {
    pub capability: String,
    pub action: String,
    pub params: Value,
    pub chat_id: String,
}

/// Outcome of routing one operation through the broker.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BrokerResult {
    pub allowed: bool,
    pub operation_id: Uuid,
    pub tier: Tier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_ref: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub result: Option<Value>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<OpError>,
}

impl BrokerResult {
    pub fn denied(operation_id: Uuid, tier: Tier, error: OpError) -> Self {
        Self {
            allowed: false,
            operation_id,
            tier,
            snapshot_ref: None,
            result: None,
            error: Some(error),
        }
    }
}

/// One row of `execution_log`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutionLogEntry {
    pub operation_id: Uuid,
    pub timestamp: i64,
    pub capability: String,
    pub action: String,
    pub chat_id: String,
    pub tier: Tier,
    pub status: OperationStatus,
    pub file_paths: Option<Vec<String>>,
    pub snapshot_ref: Option<String>,
    pub duration_ms: Option<i64>,
    pub error_details: Option<OpError>,
}

/// One row of `notification_outbox`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OutboxEntry {
    pub id: i64,
    pub operation_id: String,
    pub chat_id: String,
    pub status: OutboxStatus,
    pub message_text: String,
    pub created_at: i64,
    pub sent_at: Option<i64>,
    pub retry_count: i64,
    pub error_details: Option<String>,
}

/// One row of `postponed_operation`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PostponedOperation {
    pub operation_id: String,
    pub chat_id: String,
    pub original_prompt: String,
    pub option_a: String,
    pub option_b: String,
    pub status: PostponementStatus,
    pub clarification_response: Option<String>,
    pub retry_enqueued: bool,
    pub created_at: i64,
    pub updated_at: i64,
    pub clarification_deadline_at: Option<i64>,
    pub retry_at: Option<i64>,
    pub cancel_at: Option<i64>,
}
