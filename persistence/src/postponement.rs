use std::sync::Arc;

use rusqlite::OptionalExtension;
use rusqlite::Row;
use rusqlite::params;

use warden_protocol::PostponedOperation;
use warden_protocol::PostponementStatus;

use crate::db::DbManager;
use crate::db::StoreError;
use crate::db::now_ts;

/// CRUD for the `postponed_operation` lifecycle. The postponement manager
/// is the only writer.
#[derive(Clone)]
pub struct PostponementStore {
    db: Arc<DbManager>,
}

fn row_to_operation(row: &Row<'_>) -> Result<PostponedOperation, rusqlite::Error> {
    let status: String = row.get(5)?;
    let status = match status.as_str() {
        "postponed" => PostponementStatus::Postponed,
        "resolved" => PostponementStatus::Resolved,
        "cancelled" => PostponementStatus::Cancelled,
        _ => PostponementStatus::Waiting,
    };
    Ok(PostponedOperation {
        operation_id: row.get(0)?,
        chat_id: row.get(1)?,
        original_prompt: row.get(2)?,
        option_a: row.get(3)?,
        option_b: row.get(4)?,
        status,
        clarification_response: row.get(6)?,
        retry_enqueued: row.get::<_, i64>(7)? != 0,
        created_at: row.get(8)?,
        updated_at: row.get(9)?,
        clarification_deadline_at: row.get(10)?,
        retry_at: row.get(11)?,
        cancel_at: row.get(12)?,
    })
}

const SELECT_COLUMNS: &str = "operation_id, chat_id, original_prompt, option_a, option_b, status,
    clarification_response, retry_enqueued, created_at, updated_at,
    clarification_deadline_at, retry_at, cancel_at";

impl PostponementStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn save_pending(
        &self,
        operation_id: &str,
        chat_id: &str,
        original_prompt: &str,
        option_a: &str,
        option_b: &str,
        clarification_deadline_at: i64,
    ) -> Result<(), StoreError> {
        let now = now_ts();
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO postponed_operation (
                     operation_id, chat_id, original_prompt, option_a, option_b, status,
                     clarification_response, retry_enqueued, created_at, updated_at,
                     clarification_deadline_at, retry_at, cancel_at
                 ) VALUES (?1, ?2, ?3, ?4, ?5, 'waiting', NULL, 0, ?6, ?6, ?7, NULL, NULL)
                 ON CONFLICT(operation_id) DO UPDATE SET
                     chat_id = excluded.chat_id,
                     original_prompt = excluded.original_prompt,
                     option_a = excluded.option_a,
                     option_b = excluded.option_b,
                     status = excluded.status,
                     clarification_response = NULL,
                     retry_enqueued = 0,
                     updated_at = excluded.updated_at,
                     clarification_deadline_at = excluded.clarification_deadline_at,
                     retry_at = NULL,
                     cancel_at = NULL",
                params![
                    operation_id,
                    chat_id,
                    original_prompt,
                    option_a,
                    option_b,
                    now,
                    clarification_deadline_at,
                ],
            )?;
            Ok(())
        })
    }

    pub fn mark_postponed(
        &self,
        operation_id: &str,
        retry_at: i64,
        cancel_at: i64,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE postponed_operation
                 SET status = 'postponed', retry_at = ?1, cancel_at = ?2, updated_at = ?3
                 WHERE operation_id = ?4",
                params![retry_at, cancel_at, now_ts(), operation_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_resolved(
        &self,
        operation_id: &str,
        clarification_response: &str,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE postponed_operation
                 SET status = 'resolved', clarification_response = ?1, updated_at = ?2
                 WHERE operation_id = ?3",
                params![clarification_response, now_ts(), operation_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_retry_enqueued(&self, operation_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE postponed_operation
                 SET retry_enqueued = 1, updated_at = ?1
                 WHERE operation_id = ?2",
                params![now_ts(), operation_id],
            )?;
            Ok(())
        })
    }

    pub fn mark_cancelled(&self, operation_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE postponed_operation
                 SET status = 'cancelled', updated_at = ?1
                 WHERE operation_id = ?2",
                params![now_ts(), operation_id],
            )?;
            Ok(())
        })
    }

    /// Latest non-cancelled row for the chat, if any.
    pub fn active_by_chat(&self, chat_id: &str) -> Result<Option<PostponedOperation>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                &format!(
                    "SELECT {SELECT_COLUMNS} FROM postponed_operation
                     WHERE chat_id = ?1 AND status IN ('waiting', 'postponed', 'resolved')
                     ORDER BY updated_at DESC
                     LIMIT 1"
                ),
                params![chat_id],
                row_to_operation,
            )
            .optional()
        })
    }

    /// Every row still awaiting resolution, oldest first (restart recovery).
    pub fn list_active(&self) -> Result<Vec<PostponedOperation>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(&format!(
                "SELECT {SELECT_COLUMNS} FROM postponed_operation
                 WHERE status IN ('waiting', 'postponed')
                 ORDER BY updated_at ASC"
            ))?;
            let rows = stmt.query_map([], row_to_operation)?;
            rows.collect()
        })
    }

    pub fn delete(&self, operation_id: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "DELETE FROM postponed_operation WHERE operation_id = ?1",
                params![operation_id],
            )?;
            Ok(())
        })
    }
}
