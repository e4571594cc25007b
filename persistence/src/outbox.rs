use std::sync::Arc;

use rusqlite::OptionalExtension;
use rusqlite::params;
use tracing::info;

use warden_protocol::OutboxEntry;
use warden_protocol::OutboxStatus;

use crate::db::DbManager;
use crate::db::StoreError;
use crate::db::now_ts;

const NOTIFY_KEY_PREFIX: &str = "notifications.";
const NOTIFY_KEY_SUFFIX: &str = ".enabled";

fn notify_config_key(chat_id: &str) -> String {
    format!("{NOTIFY_KEY_PREFIX}{chat_id}{NOTIFY_KEY_SUFFIX}")
}

/// Enqueue / fetch-due / transition access to `notification_outbox`, plus
/// the per-chat notifications toggle stored in the `config` table.
///
/// `created_at` doubles as the earliest-eligible-attempt time: a scheduled
/// retry pushes it into the future and `pending()` filters on it.
#[derive(Clone)]
pub struct OutboxStore {
    db: Arc<DbManager>,
}

impl OutboxStore {
    pub fn new(db: Arc<DbManager>) -> Self {
        Self { db }
    }

    pub fn enqueue(
        &self,
        operation_id: &str,
        chat_id: &str,
        message_text: &str,
    ) -> Result<i64, StoreError> {
        let id = self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO notification_outbox
                     (operation_id, chat_id, status, message_text, created_at, retry_count)
                 VALUES (?1, ?2, 'pending', ?3, ?4, 0)",
                params![operation_id, chat_id, message_text, now_ts()],
            )?;
            Ok(conn.last_insert_rowid())
        })?;
        info!(notification_id = id, operation_id, chat_id, "notification_enqueued");
        Ok(id)
    }

    /// Oldest pending rows whose `created_at` has passed.
    pub fn pending(&self, limit: i64) -> Result<Vec<OutboxEntry>, StoreError> {
        self.db.with_conn(|conn| {
            let mut stmt = conn.prepare(
                "SELECT id, operation_id, chat_id, message_text, created_at, sent_at,
                        retry_count, error_details
                 FROM notification_outbox
                 WHERE status = 'pending' AND created_at <= ?1
                 ORDER BY created_at ASC
                 LIMIT ?2",
            )?;
            let rows = stmt.query_map(params![now_ts(), limit], |row| {
                Ok(OutboxEntry {
                    id: row.get(0)?,
                    operation_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                    chat_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                    status: OutboxStatus::Pending,
                    message_text: row.get::<_, Option<String>>(3)?.unwrap_or_default(),
                    created_at: row.get(4)?,
                    sent_at: row.get(5)?,
                    retry_count: row.get(6)?,
                    error_details: row.get(7)?,
                })
            })?;
            rows.collect()
        })
    }

    pub fn mark_sent(&self, id: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE notification_outbox
                 SET status = 'sent', sent_at = ?1, error_details = NULL
                 WHERE id = ?2",
                params![now_ts(), id],
            )?;
            Ok(())
        })
    }

    pub fn mark_failed(&self, id: i64, error_details: &str) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE notification_outbox
                 SET status = 'failed', retry_count = retry_count + 1, error_details = ?1
                 WHERE id = ?2",
                params![error_details, id],
            )?;
            Ok(())
        })
    }

    /// Put the row back to pending, eligible again after `delay_seconds`.
    pub fn schedule_retry(&self, id: i64, delay_seconds: i64) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "UPDATE notification_outbox
                 SET status = 'pending', created_at = ?1
                 WHERE id = ?2",
                params![now_ts() + delay_seconds.max(0), id],
            )?;
            Ok(())
        })
    }

    /// Per-chat toggle, default true when no row exists.
    pub fn notifications_enabled(&self, chat_id: &str) -> Result<bool, StoreError> {
        let value: Option<String> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT value FROM config WHERE key = ?1",
                params![notify_config_key(chat_id)],
                |row| row.get(0),
            )
            .optional()
        })?;
        Ok(match value {
            None => true,
            Some(raw) => matches!(
                raw.trim().trim_matches('"').to_ascii_lowercase().as_str(),
                "1" | "true" | "yes" | "on"
            ),
        })
    }

    pub fn set_notifications_enabled(
        &self,
        chat_id: &str,
        enabled: bool,
    ) -> Result<(), StoreError> {
        self.db.with_conn(|conn| {
            conn.execute(
                "INSERT INTO config (key, value, updated_at, updated_by, tier)
                 VALUES (?1, ?2, ?3, ?4, 'dynamic')
                 ON CONFLICT(key) DO UPDATE SET
                     value = excluded.value,
                     updated_at = excluded.updated_at,
                     updated_by = excluded.updated_by,
                     tier = excluded.tier",
                params![
                    notify_config_key(chat_id),
                    enabled.to_string(),
                    now_ts(),
                    chat_id,
                ],
            )?;
            Ok(())
        })
    }

    pub fn pending_count(&self) -> Result<i64, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT COUNT(*) FROM notification_outbox WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Age in seconds of the oldest pending row, if any.
    pub fn oldest_pending_age(&self) -> Result<Option<i64>, StoreError> {
        let oldest: Option<i64> = self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MIN(created_at) FROM notification_outbox WHERE status = 'pending'",
                [],
                |row| row.get(0),
            )
        })?;
        Ok(oldest.map(|ts| (now_ts() - ts).max(0)))
    }

    /// `MAX(created_at)` across the outbox, a proxy for the last attempt.
    pub fn last_attempt_proxy(&self) -> Result<Option<i64>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT MAX(created_at) FROM notification_outbox",
                [],
                |row| row.get(0),
            )
        })
    }

    /// Fetch one row regardless of status, for tests and diagnostics.
    pub fn entry(&self, id: i64) -> Result<Option<OutboxEntry>, StoreError> {
        self.db.with_conn(|conn| {
            conn.query_row(
                "SELECT id, operation_id, chat_id, status, message_text, created_at,
                        sent_at, retry_count, error_details
                 FROM notification_outbox WHERE id = ?1",
                params![id],
                |row| {
                    let status: String = row.get(3)?;
                    let status = match status.as_str() {
                        "sent" => OutboxStatus::Sent,
                        "failed" => OutboxStatus::Failed,
                        _ => OutboxStatus::Pending,
                    };
                    Ok(OutboxEntry {
                        id: row.get(0)?,
                        operation_id: row.get::<_, Option<String>>(1)?.unwrap_or_default(),
                        chat_id: row.get::<_, Option<String>>(2)?.unwrap_or_default(),
                        status,
                        message_text: row.get::<_, Option<String>>(4)?.unwrap_or_default(),
                        created_at: row.get(5)?,
                        sent_at: row.get(6)?,
                        retry_count: row.get(7)?,
                        error_details: row.get(8)?,
                    })
                },
            )
            .optional()
        })
    }
}
