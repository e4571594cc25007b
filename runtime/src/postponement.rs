use std::collections::HashMap;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::info;
use tracing::warn;
use uuid::Uuid;

use warden_config::ConfigManager;
use warden_persistence::AuditStore;
use warden_persistence::OutboxStore;
use warden_persistence::PostponementStore;
use warden_persistence::now_ts;
use warden_protocol::OperationStatus;
use warden_protocol::PostponementStatus;

/// One ambiguous request awaiting (or having received) clarification.
#[derive(Clone)]
pub struct PendingClarification {
    pub operation_id: Uuid,
    pub chat_id: String,
    pub original_prompt: String,
    pub options: (String, String),
    pub response_text: Option<String>,
    pub postponed: bool,
    pub retry_message_sent: bool,
    pub retry_at: Option<i64>,
    pub cancel_at: Option<i64>,
    notify: Arc<Notify>,
}

struct Inner {
    store: PostponementStore,
    outbox: OutboxStore,
    audit: AuditStore,
    config: Arc<ConfigManager>,
    pending_by_chat: Mutex<HashMap<String, PendingClarification>>,
    retry_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
    cancel_tasks: Mutex<HashMap<Uuid, JoinHandle<()>>>,
}

/// Coordinates the clarification lifecycle: wait, resolve, postpone with a
/// reminder, cancel after the deadline, and rebuild all timers on restart.
/// Persistence failures are logged and the in-memory lifecycle continues.
#[derive(Clone)]
pub struct PostponementManager {
    inner: Arc<Inner>,
}

fn lock<'a, T>(mutex: &'a Mutex<T>) -> std::sync::MutexGuard<'a, T> {
    mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}

impl PostponementManager {
    pub fn new(
        store: PostponementStore,
        outbox: OutboxStore,
        audit: AuditStore,
        config: Arc<ConfigManager>,
    ) -> Self {
        Self {
            inner: Arc::new(Inner {
                store,
                outbox,
                audit,
                config,
                pending_by_chat: Mutex::new(HashMap::new()),
                retry_tasks: Mutex::new(HashMap::new()),
                cancel_tasks: Mutex::new(HashMap::new()),
            }),
        }
    }

    fn clarification_timeout(&self) -> i64 {
        self.inner
            .config
            .int("postponement.clarification_timeout_seconds")
    }

    fn retry_delay(&self) -> i64 {
        self.inner.config.int("postponement.retry_delay_seconds")
    }

    fn cancellation_delay(&self) -> i64 {
        self.inner
            .config
            .int("postponement.cancellation_delay_seconds")
    }

    /// Register a new ambiguous operation awaiting clarification. Only one
    /// active pending exists per chat; a newer one replaces it.
    pub fn add_pending(
        &self,
        operation_id: Uuid,
        chat_id: &str,
        original_prompt: &str,
        options: (String, String),
    ) {
        let pending = PendingClarification {
            operation_id,
            chat_id: chat_id.to_string(),
            original_prompt: original_prompt.to_string(),
            options: options.clone(),
            response_text: None,
            postponed: false,
            retry_message_sent: false,
            retry_at: None,
            cancel_at: None,
            notify: Arc::new(Notify::new()),
        };
        lock(&self.inner.pending_by_chat).insert(chat_id.to_string(), pending);

        let deadline = now_ts() + self.clarification_timeout();
        if let Err(err) = self.inner.store.save_pending(
            &operation_id.to_string(),
            chat_id,
            original_prompt,
            &options.0,
            &options.1,
            deadline,
        ) {
            warn!(error = %err, "postponement state not persisted");
        }
    }

    pub fn has_pending(&self, chat_id: &str) -> bool {
        if lock(&self.inner.pending_by_chat).contains_key(chat_id) {
            return true;
        }
        matches!(
            self.inner.store.active_by_chat(chat_id),
            Ok(Some(row)) if matches!(
                row.status,
                PostponementStatus::Waiting | PostponementStatus::Postponed
            )
        )
    }

    /// Resolve the chat's pending clarification with the user's response.
    pub fn resolve(&self, chat_id: &str, response_text: &str) -> Option<PendingClarification> {
        let response = response_text.trim().to_string();
        let pending = {
            let mut map = lock(&self.inner.pending_by_chat);
            let pending = map.get_mut(chat_id)?;
            pending.response_text = Some(response.clone());
            pending.clone()
        };
        pending.notify.notify_one();

        if let Err(err) = self
            .inner
            .store
            .mark_resolved(&pending.operation_id.to_string(), &response)
        {
            warn!(error = %err, "postponement resolution not persisted");
        }

        info!(
            operation_id = %pending.operation_id,
            chat_id,
            "clarification_resolved"
        );
        Some(pending)
    }

    /// Wait for the chat's clarification; `None` on timeout (the caller
    /// should then postpone).
    pub async fn wait_for_clarification(
        &self,
        chat_id: &str,
        timeout_seconds: u64,
    ) -> Option<PendingClarification> {
        let notify = {
            let map = lock(&self.inner.pending_by_chat);
            Arc::clone(&map.get(chat_id)?.notify)
        };

        match tokio::time::timeout(Duration::from_secs(timeout_seconds), notify.notified()).await {
            Ok(()) => lock(&self.inner.pending_by_chat).get(chat_id).cloned(),
            Err(_) => None,
        }
    }

    /// Mark the chat's pending as postponed and arm the retry and cancel
    /// timers.
    pub fn postpone_and_schedule(&self, chat_id: &str) {
        let retry_delay = self.retry_delay();
        let cancel_delay = self.cancellation_delay();
        let retry_at = now_ts() + retry_delay;
        let cancel_at = retry_at + cancel_delay;

        let pending = {
            let mut map = lock(&self.inner.pending_by_chat);
            let Some(pending) = map.get_mut(chat_id) else {
                return;
            };
            pending.postponed = true;
            pending.retry_at = Some(retry_at);
            pending.cancel_at = Some(cancel_at);
            pending.clone()
        };

        if let Err(err) = self.inner.audit.finish(
            pending.operation_id,
            OperationStatus::Postponed,
            None,
            None,
            None,
        ) {
            warn!(error = %err, "postponement audit row not updated");
        }
        if let Err(err) = self.inner.store.mark_postponed(
            &pending.operation_id.to_string(),
            retry_at,
            cancel_at,
        ) {
            warn!(error = %err, "postponement not persisted");
        }

        self.arm_timers(&pending, retry_delay, retry_delay + cancel_delay);
    }

    fn arm_timers(&self, pending: &PendingClarification, retry_in: i64, cancel_in: i64) {
        if !pending.retry_message_sent {
            let manager = self.clone();
            let chat_id = pending.chat_id.clone();
            let operation_id = pending.operation_id;
            let handle = tokio::spawn(async move {
                tokio::time::sleep(Duration::from_secs(retry_in.max(0) as u64)).await;
                manager.fire_retry(&chat_id, operation_id);
            });
            lock(&self.inner.retry_tasks).insert(pending.operation_id, handle);
        }

        let manager = self.clone();
        let chat_id = pending.chat_id.clone();
        let operation_id = pending.operation_id;
        let handle = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_secs(cancel_in.max(0) as u64)).await;
            manager.fire_cancel(&chat_id, operation_id);
        });
        lock(&self.inner.cancel_tasks).insert(pending.operation_id, handle);
    }

    /// Retry timer: remind the user of the two options, once.
    fn fire_retry(&self, chat_id: &str, operation_id: Uuid) {
        let pending = {
            let mut map = lock(&self.inner.pending_by_chat);
            match map.get_mut(chat_id) {
                Some(pending) if pending.operation_id == operation_id => {
                    pending.retry_message_sent = true;
                    pending.clone()
                }
                _ => return,
            }
        };

        let text = format!(
            "Your earlier request is still waiting for clarification. Reply with one option: '{}' or '{}'.",
            pending.options.0, pending.options.1
        );
        if let Err(err) = self
            .inner
            .outbox
            .enqueue(&operation_id.to_string(), chat_id, &text)
        {
            warn!(error = %err, "clarification reminder not enqueued");
        }
        if let Err(err) = self
            .inner
            .store
            .mark_retry_enqueued(&operation_id.to_string())
        {
            warn!(error = %err, "retry flag not persisted");
        }
        info!(operation_id = %operation_id, chat_id, "clarification_retry_enqueued");
    }

    /// Cancel timer: abandon the request if still unresolved.
    fn fire_cancel(&self, chat_id: &str, operation_id: Uuid) {
        let removed = {
            let mut map = lock(&self.inner.pending_by_chat);
            let still_unresolved = map.get(chat_id).is_some_and(|pending| {
                pending.operation_id == operation_id && pending.response_text.is_none()
            });
            if still_unresolved { map.remove(chat_id) } else { None }
        };
        let Some(pending) = removed else {
            return;
        };

        if let Err(err) = self.inner.audit.finish(
            pending.operation_id,
            OperationStatus::Cancelled,
            None,
            None,
            None,
        ) {
            warn!(error = %err, "cancellation audit row not updated");
        }
        if let Err(err) = self
            .inner
            .store
            .mark_cancelled(&operation_id.to_string())
        {
            warn!(error = %err, "cancellation not persisted");
        }
        self.abort_timers(operation_id);
        warn!(operation_id = %operation_id, chat_id, "clarification_cancelled");
    }

    /// Remove and return the resolved pending, cancelling its timers and
    /// deleting the persisted row. The caller composes the clarified prompt.
    pub fn consume_resolved(&self, chat_id: &str) -> Option<PendingClarification> {
        let pending = lock(&self.inner.pending_by_chat).remove(chat_id);
        let pending = match pending {
            Some(pending) => pending,
            None => {
                let row = self.inner.store.active_by_chat(chat_id).ok().flatten()?;
                if row.status != PostponementStatus::Resolved {
                    return None;
                }
                PendingClarification {
                    operation_id: Uuid::parse_str(&row.operation_id).unwrap_or_else(|_| Uuid::nil()),
                    chat_id: row.chat_id,
                    original_prompt: row.original_prompt,
                    options: (row.option_a, row.option_b),
                    response_text: row.clarification_response,
                    postponed: row.status == PostponementStatus::Postponed,
                    retry_message_sent: row.retry_enqueued,
                    retry_at: row.retry_at,
                    cancel_at: row.cancel_at,
                    notify: Arc::new(Notify::new()),
                }
            }
        };

        self.abort_timers(pending.operation_id);
        if let Err(err) = self.inner.store.delete(&pending.operation_id.to_string()) {
            warn!(error = %err, "resolved postponement row not deleted");
        }
        Some(pending)
    }

    fn abort_timers(&self, operation_id: Uuid) {
        if let Some(handle) = lock(&self.inner.retry_tasks).remove(&operation_id) {
            handle.abort();
        }
        if let Some(handle) = lock(&self.inner.cancel_tasks).remove(&operation_id) {
            handle.abort();
        }
    }

    /// Deterministic clarified prompt for the runtime to re-submit.
    pub fn build_clarified_prompt(original_prompt: &str, clarification_response: &str) -> String {
        format!(
            "{original_prompt}\n\nClarification provided by user: {}",
            clarification_response.trim()
        )
    }

    /// Rebuild in-memory state and timers after a restart. Rows still
    /// `waiting` lost their in-memory waiter, so they are re-postponed with
    /// deadlines relative to now.
    pub fn recover_pending(&self) {
        let rows = match self.inner.store.list_active() {
            Ok(rows) => rows,
            Err(err) => {
                warn!(error = %err, "postponement recovery query failed");
                return;
            }
        };

        let now = now_ts();
        for row in rows {
            let operation_id =
                Uuid::parse_str(&row.operation_id).unwrap_or_else(|_| Uuid::nil());
            let was_waiting = row.status == PostponementStatus::Waiting;

            let (retry_at, cancel_at) = if was_waiting {
                let retry_at = now + self.retry_delay();
                let cancel_at = retry_at + self.cancellation_delay();
                if let Err(err) =
                    self.inner
                        .store
                        .mark_postponed(&row.operation_id, retry_at, cancel_at)
                {
                    warn!(error = %err, "recovered postponement not persisted");
                }
                (retry_at, cancel_at)
            } else {
                (
                    row.retry_at.unwrap_or(now + self.retry_delay()),
                    row.cancel_at
                        .unwrap_or(now + self.retry_delay() + self.cancellation_delay()),
                )
            };

            let pending = PendingClarification {
                operation_id,
                chat_id: row.chat_id.clone(),
                original_prompt: row.original_prompt,
                options: (row.option_a, row.option_b),
                response_text: row.clarification_response,
                postponed: true,
                retry_message_sent: row.retry_enqueued,
                retry_at: Some(retry_at),
                cancel_at: Some(cancel_at),
                notify: Arc::new(Notify::new()),
            };
            lock(&self.inner.pending_by_chat).insert(row.chat_id.clone(), pending.clone());

            self.arm_timers(
                &pending,
                (retry_at - now).max(0),
                (cancel_at - now).max(0),
            );
            info!(
                operation_id = %operation_id,
                chat_id = %row.chat_id,
                "postponement recovered"
            );
        }
    }
}
