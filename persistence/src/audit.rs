use std::collections::HashMap;
use std::sync::Arc;

use rusqlite::OptionalExtension;
use rusqlite::params;
use tracing::error;
use tracing::info;
use uuid::Uuid;

use warden_protocol::OpError;
use warden_protocol::OperationStatus;
use warden_protocol::Tier;

use crate::db::DbManager;
use crate::db::StoreError;
use crate::db::now_ts;

/// An `in_progress` row with its elapsed time, for the status snapshot.
#[derive(Debug, Clone)]
pub struct InFlightRow {
    pub operation_id: String,
    pub tool: String,
    pub tier: i64,
    pub elapsed_seconds: i64,
}

#[derive(Debug, Clone)]
pub struct RecentOperation {
    pub operation_id: String,
    pub capability: String,
    pub action: String,
    pub status: String,
    pub timestamp: i64,
    pub duration_ms: Option<i64>,
}

/// Insert-start / update-end access to `execution_log`. The broker is the
/// only writer of these rows (the postponement manager reuses `finish` for
/// its `postponed`/`cancelled` transitions).
#[derive(Clone)]
pub struct AuditStore {
    db: Arc<DbManager>,
}

impl AuditStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn insert_start(
        &self,
        operation_id: Uuid,
        capability: &str,
        action: &str,
        chat_id: &str,
        tier: Tier,
        file_paths: Option<&[String]>,
    ) -> Result<(), StoreError> {
        let file_paths_json = match file_paths {
            Some(paths) => Some(serde_json::to_string(paths).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?),
            None => None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO execution_log
                     (operation_id, timestamp, capability, action, chat_id, tier, status, file_paths)
                 VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8)",
                params![
                    operation_id.to_string(),
                    now_ts(),
                    capability,
                    action,
                    chat_id,
                    tier.as_u8(),
                    OperationStatus::InProgress.to_string(),
                    file_paths_json,
                ],
            )?;
            Ok(())
        })?;

        info!(
            operation_id = %operation_id,
            capability,
            action,
            tier = tier.as_u8(),
            chat_id,
            "operation_started"
        );
        Ok(())
    }

    /// Transition the row to its terminal status. Called exactly once per
    /// operation.
    pub fn finish(
        &self,
        operation_id: Uuid,
        status: OperationStatus,
        snapshot_ref: Option<&str>,
        duration_ms: Option<i64>,
        error_details: Option<&OpError>,
    ) -> Result<(), StoreError> {
        let error_json = match error_details {
            Some(err) => Some(serde_json::to_string(err).map_err(|e| {
                rusqlite::Error::ToSqlConversionFailure(Box::new(e))
            })?),
            None => None,
        };
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE execution_log
                 SET status = ?1, snapshot_ref = ?2, duration_ms = ?3, error_details = ?4
                 WHERE operation_id = ?5",
                params![
                    status.to_string(),
                    snapshot_ref,
                    duration_ms,
                    error_json,
                    operation_id.to_string(),
                ],
            )?;
            Ok(())
        })?;

        match status {
            OperationStatus::Completed => info!(
                operation_id = %operation_id,
                duration_ms,
                snapshot_ref,
                "operation_completed"
            ),
            _ => {
                let error_text = error_details.map(|e| e.to_string()).unwrap_or_default();
                error!(
                    operation_id = %operation_id,
                    status = %status,
                    duration_ms,
                    error = %error_text,
                    "operation_failed"
                );
            }
        }
        Ok(())
    }

    /// The N most recent in-progress rows, with elapsed seconds.
    pub fn in_flight(&self, limit: i64) -> Result<Vec<InFlightRow>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_id, capability, action, tier,
                        (unixepoch() - timestamp) AS elapsed_seconds
                 FROM execution_log
                 WHERE status = 'in_progress'
                 ORDER BY timestamp DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                let capability: String = row.get(1)?;
                let action: String = row.get(2)?;
                Ok(InFlightRow {
                    operation_id: row.get(0)?,
                    tool: format!("{capability}.{action}"),
                    tier: row.get(3)?,
                    elapsed_seconds: row.get(4)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Histogram of the last `limit` terminal rows grouped by status.
    pub fn terminal_histogram(&self, limit: i64) -> Result<HashMap<String, i64>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT status, COUNT(*) FROM (
                     SELECT status FROM execution_log
                     WHERE status != 'in_progress'
                     ORDER BY timestamp DESC
                     LIMIT ?1
                 )
                 GROUP BY status",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
            })?;
            rows.collect()
        })
    }

    pub fn last_operation_timestamp(&self) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row("SELECT MAX(timestamp) FROM execution_log", [], |row| {
                row.get::<_, Option<i64>>(0)
            })
        })
    }

    pub fn recent_operations(&self, limit: i64) -> Result<Vec<RecentOperation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT operation_id, capability, action, status, timestamp, duration_ms
                 FROM execution_log
                 ORDER BY timestamp DESC
                 LIMIT ?1",
            )?;
            let rows = stmt.query_map(params![limit], |row| {
                Ok(RecentOperation {
                    operation_id: row.get(0)?,
                    capability: row.get(1)?,
                    action: row.get(2)?,
                    status: row.get(3)?,
                    timestamp: row.get(4)?,
                    duration_ms: row.get(5)?,
                })
            })?;
            rows.collect()
        })
    }

    /// Fetch one row's (status, snapshot_ref, file_paths) for verification.
    pub fn row_status(
        &self,
        operation_id: Uuid,
    ) -> Result<Option<(String, Option<String>, Option<String>)>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT status, snapshot_ref, file_paths
                 FROM execution_log WHERE operation_id = ?1",
                params![operation_id.to_string()],
                |row| Ok((row.get(0)?, row.get(1)?, row.get(2)?)),
            )
            .optional()
        })
    }
}
