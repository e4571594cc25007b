use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::Ordering;
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tokio::task::JoinHandle;
use tracing::error;
use tracing::info;
use tracing::warn;

use warden_config::ConfigManager;
use warden_persistence::OutboxStore;
use warden_protocol::OutboxEntry;

/// The injected chat-side contract: the only way notifications leave the
/// process. Returns `true` on delivery.
#[async_trait]
pub trait ChatTransport: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool;
}

struct WorkerCtx {
    transport: Arc<dyn ChatTransport>,
    outbox: OutboxStore,
    config: Arc<ConfigManager>,
    running: AtomicBool,
    stop_notify: Notify,
}

impl WorkerCtx {
    fn poll_interval(&self) -> Duration {
        Duration::from_secs(
            self.config
                .int("notifications.poll_interval_seconds")
                .max(1) as u64,
        )
    }
}

/// Background loop draining `notification_outbox` through the transport,
/// with at-least-once delivery and exponential retry back-off. A crashed
/// loop is restarted by its supervisor after one poll interval.
pub struct NotificationWorker {
    ctx: Arc<WorkerCtx>,
    supervisor: Mutex<Option<JoinHandle<()>>>,
}

impl NotificationWorker {
    pub fn new(
        transport: Arc<dyn ChatTransport>,
        outbox: OutboxStore,
        config: Arc<ConfigManager>,
    ) -> Self {
        Self {
            ctx: Arc::new(WorkerCtx {
                transport,
                outbox,
                config,
                running: AtomicBool::new(false),
                stop_notify: Notify::new(),
            }),
            supervisor: Mutex::new(None),
        }
    }

    pub fn start(&self) {
        if self.ctx.running.swap(true, Ordering::SeqCst) {
            return;
        }
        let ctx = Arc::clone(&self.ctx);
        let handle = tokio::spawn(supervise(ctx));
        let mut slot = self
            .supervisor
            .lock()
            .unwrap_or_else(|poisoned| poisoned.into_inner());
        *slot = Some(handle);
        info!("notification worker started");
    }

    /// Idempotent; any in-flight send finishes before the loop exits.
    pub async fn stop(&self) {
        self.ctx.running.store(false, Ordering::SeqCst);
        self.ctx.stop_notify.notify_waiters();
        let handle = {
            let mut slot = self
                .supervisor
                .lock()
                .unwrap_or_else(|poisoned| poisoned.into_inner());
            slot.take()
        };
        if let Some(handle) = handle {
            if let Err(err) = handle.await {
                warn!(error = %err, "notification worker supervisor join failed");
            }
        }
        info!("notification worker stopped");
    }

    /// One polling pass, exposed for deterministic tests.
    pub async fn run_once(&self) {
        process_batch(&self.ctx).await;
    }
}

async fn supervise(ctx: Arc<WorkerCtx>) {
    while ctx.running.load(Ordering::SeqCst) {
        let loop_ctx = Arc::clone(&ctx);
        let handle = tokio::spawn(worker_loop(loop_ctx));
        match handle.await {
            // Clean exit: stop() flipped the flag.
            Ok(()) => break,
            Err(err) => {
                error!(error = %err, "notification worker crashed");
                if !ctx.running.load(Ordering::SeqCst) {
                    break;
                }
                let delay = ctx.poll_interval();
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {
                        info!("notification worker restarted");
                    }
                    _ = ctx.stop_notify.notified() => break,
                }
            }
        }
    }
}

async fn worker_loop(ctx: Arc<WorkerCtx>) {
    while ctx.running.load(Ordering::SeqCst) {
        process_batch(&ctx).await;
        let delay = ctx.poll_interval();
        tokio::select! {
            _ = tokio::time::sleep(delay) => {}
            _ = ctx.stop_notify.notified() => {}
        }
    }
}

async fn process_batch(ctx: &WorkerCtx) {
    let batch_size = ctx.config.int("notifications.batch_size").max(1);
    let pending = match ctx.outbox.pending(batch_size) {
        Ok(rows) => rows,
        Err(err) => {
            warn!(error = %err, "failed to fetch pending notifications");
            return;
        }
    };
    if pending.is_empty() {
        return;
    }

    let count = pending.len();
    for entry in pending {
        process_entry(ctx, entry).await;
    }

    let lag = ctx.outbox.oldest_pending_age().ok().flatten();
    info!(batch_size = count, lag_seconds = lag, "notification batch complete");
}

async fn process_entry(ctx: &WorkerCtx, entry: OutboxEntry) {
    let Ok(chat_id) = entry.chat_id.parse::<i64>() else {
        if let Err(err) = ctx.outbox.mark_failed(entry.id, "invalid chat_id") {
            warn!(notification_id = entry.id, error = %err, "failed to mark notification");
        }
        return;
    };

    if ctx.transport.send_message(chat_id, &entry.message_text).await {
        if let Err(err) = ctx.outbox.mark_sent(entry.id) {
            warn!(notification_id = entry.id, error = %err, "failed to mark notification sent");
            return;
        }
        info!(
            notification_id = entry.id,
            chat_id = %entry.chat_id,
            "notification_sent_from_outbox"
        );
        return;
    }

    if let Err(err) = ctx.outbox.mark_failed(entry.id, "transport send failed") {
        warn!(notification_id = entry.id, error = %err, "failed to mark notification failed");
        return;
    }
    let retry_count = entry.retry_count + 1;
    let max_retries = ctx.config.int("notifications.max_retries");
    if retry_count < max_retries {
        let base = ctx
            .config
            .int("notifications.retry_backoff_base_seconds")
            .max(1);
        let delay = base
            .checked_pow(retry_count.clamp(0, u32::MAX as i64) as u32)
            .unwrap_or(i64::MAX);
        if let Err(err) = ctx.outbox.schedule_retry(entry.id, delay) {
            warn!(notification_id = entry.id, error = %err, "failed to schedule retry");
            return;
        }
        warn!(
            notification_id = entry.id,
            retry_count,
            backoff_seconds = delay,
            "notification retry scheduled"
        );
    } else {
        error!(
            notification_id = entry.id,
            retry_count, "notification retries exhausted"
        );
    }
}
