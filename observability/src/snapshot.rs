use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;

use serde::Serialize;
use serde_json::Value;

#[derive(Debug, Clone, Serialize)]
pub struct ProcessInfo {
    pub pid: u32,
    pub uptime_seconds: i64,
    pub version: String,
    pub supervisor: Option<String>,
    pub supervisor_status: Option<String>,
    pub restart_count: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct InFlightOperation {
    pub operation_id: String,
    pub tool: String,
    pub tier: i64,
    pub elapsed_s: i64,
}

#[derive(Debug, Clone, Serialize)]
pub struct BrokerActivity {
    pub last_operation_timestamp: i64,
    pub in_flight_operations: Vec<InFlightOperation>,
    pub last_10_results: HashMap<String, i64>,
}

/// Placeholder until a scheduler exists; the lag health check treats a zero
/// tick timestamp as "not yet implemented".
#[derive(Debug, Clone, Serialize)]
pub struct SchedulerState {
    pub last_tick_timestamp: i64,
    pub last_tick_local: String,
    pub next_jobs: Vec<Value>,
    pub active_jobs_count: i64,
}

impl Default for SchedulerState {
    fn default() -> Self {
        Self {
            last_tick_timestamp: 0,
            last_tick_local: "N/A".to_string(),
            next_jobs: Vec::new(),
            active_jobs_count: 0,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct NotifierState {
    pub last_attempt_timestamp: i64,
    pub pending_count: i64,
    pub oldest_pending_age_seconds: Option<i64>,
}

#[derive(Debug, Clone, Serialize)]
pub struct ResourceUsage {
    pub cpu_percent: f32,
    pub cpu_1m_avg: Option<f32>,
    pub ram_mb: u64,
    pub db_size_mb: f64,
    pub log_size_mb: f64,
    pub snapshot_count: i64,
    pub event_loop_lag_ms: Option<f64>,
}

#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Serialize, strum_macros::Display,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum HealthStatus {
    Pass,
    Warn,
    Fail,
}

#[derive(Debug, Clone, Serialize)]
pub struct HealthCheckResult {
    pub name: String,
    pub status: HealthStatus,
    pub message: String,
    pub timestamp: i64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<Value>,
}

impl HealthCheckResult {
    pub fn new(name: &str, status: HealthStatus, message: impl Into<String>) -> Self {
        Self {
            name: name.to_string(),
            status,
            message: message.into(),
            timestamp: chrono::Utc::now().timestamp(),
            details: None,
        }
    }

    pub fn with_details(mut self, details: Value) -> Self {
        self.details = Some(details);
        self
    }
}

/// The latest full picture of the process, replaced atomically by the
/// collector.
#[derive(Debug, Clone, Serialize)]
pub struct StatusSnapshot {
    pub timestamp: i64,
    pub process: ProcessInfo,
    pub broker: BrokerActivity,
    pub scheduler: SchedulerState,
    pub notifier: NotifierState,
    pub resources: ResourceUsage,
    pub health: Vec<HealthCheckResult>,
    pub recent_operations: Vec<Value>,
}

/// Single-slot cache, last writer wins.
#[derive(Default)]
pub struct StatusCache {
    slot: RwLock<Option<Arc<StatusSnapshot>>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn get(&self) -> Option<Arc<StatusSnapshot>> {
        self.slot
            .read()
            .unwrap_or_else(|poisoned| poisoned.into_inner())
            .clone()
    }

    pub fn set(&self, snapshot: StatusSnapshot) {
        let mut slot = self
            .slot
            .write()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(Arc::new(snapshot));
    }
}
