use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use std::time::Instant;

use sysinfo::Pid;
use sysinfo::System;
use tokio::task::JoinHandle;
use tracing::debug;
use tracing::error;
use tracing::warn;

use warden_config::ConfigManager;
use warden_persistence::AuditStore;
use warden_persistence::DbManager;
use warden_persistence::OutboxStore;

use crate::health;
use crate::snapshot::BrokerActivity;
use crate::snapshot::HealthCheckResult;
use crate::snapshot::InFlightOperation;
use crate::snapshot::NotifierState;
use crate::snapshot::ProcessInfo;
use crate::snapshot::ResourceUsage;
use crate::snapshot::SchedulerState;
use crate::snapshot::StatusCache;
use crate::snapshot::StatusSnapshot;

/// Budget for one full collection; anything slower is logged.
const COLLECTION_BUDGET_MS: u128 = 100;

/// Long-lived task assembling a [`StatusSnapshot`] every interval and
/// swapping it into the cache. Read-only against every subsystem; any
/// failure is caught and the loop continues.
pub struct SnapshotCollector {
    config: Arc<ConfigManager>,
    db: Arc<DbManager>,
    audit: AuditStore,
    outbox: OutboxStore,
    cache: Arc<StatusCache>,
    scope_roots: Vec<PathBuf>,
    started_at: Instant,
    sys: Mutex<System>,
}

impl SnapshotCollector {
    pub fn new(
        config: Arc<ConfigManager>,
        db: Arc<DbManager>,
        audit: AuditStore,
        outbox: OutboxStore,
        cache: Arc<StatusCache>,
    ) -> Arc<Self> {
        let scope_roots = config
            .list("scope.allowed_roots")
            .into_iter()
            .map(PathBuf::from)
            .collect();
        Arc::new(Self {
            config,
            db,
            audit,
            outbox,
            cache,
            scope_roots,
            started_at: Instant::now(),
            sys: Mutex::new(System::new()),
        })
    }

    pub fn spawn(self: &Arc<Self>) -> JoinHandle<()> {
        let collector = Arc::clone(self);
        tokio::spawn(async move {
            loop {
                let started = Instant::now();
                let snapshot = collector.collect().await;
                match snapshot {
                    Ok(snapshot) => {
                        collector.cache.set(snapshot);
                        let elapsed = started.elapsed().as_millis();
                        if elapsed > COLLECTION_BUDGET_MS {
                            warn!(duration_ms = elapsed as u64, "snapshot collection slow");
                        } else {
                            debug!(duration_ms = elapsed as u64, "snapshot collected");
                        }
                    }
                    Err(err) => error!(error = %err, "snapshot collection failed"),
                }

                let interval = collector
                    .config
                    .int("observability.interval_seconds")
                    .max(1) as u64;
                tokio::time::sleep(Duration::from_secs(interval)).await;
            }
        })
    }

    /// Assemble one snapshot. Individual sections degrade to empty values
    /// on error rather than failing the whole collection.
    pub async fn collect(&self) -> Result<StatusSnapshot, String> {
        let timestamp = chrono::Utc::now().timestamp();

        let process = self.collect_process_info();
        let broker = self.collect_broker_activity();
        let scheduler = SchedulerState::default();
        let notifier = self.collect_notifier_state();
        let resources = self.collect_resource_usage().await;
        let health = self.run_health_checks(&scheduler, &notifier, &resources);
        let recent_operations = self
            .audit
            .recent_operations(100)
            .map(|rows| {
                rows.into_iter()
                    .map(|op| {
                        serde_json::json!({
                            "operation_id": op.operation_id,
                            "tool": format!("{}.{}", op.capability, op.action),
                            "status": op.status,
                            "timestamp": op.timestamp,
                            "duration_ms": op.duration_ms,
                        })
                    })
                    .collect()
            })
            .unwrap_or_default();

        Ok(StatusSnapshot {
            timestamp,
            process,
            broker,
            scheduler,
            notifier,
            resources,
            health,
            recent_operations,
        })
    }

    fn collect_process_info(&self) -> ProcessInfo {
        let supervisor = if std::env::var_os("PM2_HOME").is_some() {
            Some("pm2".to_string())
        } else if std::env::var_os("INVOCATION_ID").is_some() {
            Some("systemd".to_string())
        } else {
            Some("none".to_string())
        };
        ProcessInfo {
            pid: std::process::id(),
            uptime_seconds: self.started_at.elapsed().as_secs() as i64,
            version: env!("CARGO_PKG_VERSION").to_string(),
            supervisor,
            supervisor_status: None,
            restart_count: None,
        }
    }

    fn collect_broker_activity(&self) -> BrokerActivity {
        let in_flight = self
            .audit
            .in_flight(20)
            .map(|rows| {
                rows.into_iter()
                    .map(|row| InFlightOperation {
                        operation_id: row.operation_id,
                        tool: row.tool,
                        tier: row.tier,
                        elapsed_s: row.elapsed_seconds,
                    })
                    .collect()
            })
            .unwrap_or_default();
        let last_10_results = self.audit.terminal_histogram(10).unwrap_or_default();
        let last_operation_timestamp = self
            .audit
            .last_operation_timestamp()
            .ok()
            .flatten()
            .unwrap_or(0);

        BrokerActivity {
            last_operation_timestamp,
            in_flight_operations: in_flight,
            last_10_results,
        }
    }

    fn collect_notifier_state(&self) -> NotifierState {
        NotifierState {
            last_attempt_timestamp: self.outbox.last_attempt_proxy().ok().flatten().unwrap_or(0),
            pending_count: self.outbox.pending_count().unwrap_or(0),
            oldest_pending_age_seconds: self.outbox.oldest_pending_age().ok().flatten(),
        }
    }

    async fn collect_resource_usage(&self) -> ResourceUsage {
        let (cpu_percent, ram_mb) = {
            let mut sys = self.sys.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            let pid = Pid::from_u32(std::process::id());
            sys.refresh_process(pid);
            match sys.process(pid) {
                // First refresh reports 0% by design; later calls are deltas.
                Some(process) => (process.cpu_usage(), process.memory() / (1024 * 1024)),
                None => (0.0, 0),
            }
        };

        let db_size_mb = std::fs::metadata(self.db.path())
            .map(|m| m.len() as f64 / (1024.0 * 1024.0))
            .unwrap_or(0.0);

        let log_size_mb = {
            let log_path = PathBuf::from(self.config.string("logging.file_path"));
            let log_dir = log_path
                .parent()
                .map(std::path::Path::to_path_buf)
                .unwrap_or_else(|| PathBuf::from("."));
            tokio::task::spawn_blocking(move || directory_size_mb(&log_dir))
                .await
                .unwrap_or(0.0)
        };

        let snapshot_count = self.count_snapshot_branches().await;

        let lag_start = Instant::now();
        tokio::time::sleep(Duration::ZERO).await;
        let event_loop_lag_ms = Some(lag_start.elapsed().as_secs_f64() * 1000.0);

        ResourceUsage {
            cpu_percent,
            cpu_1m_avg: None,
            ram_mb,
            db_size_mb,
            log_size_mb,
            snapshot_count,
            event_loop_lag_ms,
        }
    }

    /// Snapshot branches across every scope root that is a git repository.
    async fn count_snapshot_branches(&self) -> i64 {
        let timeout = self.config.int("git.operation_timeout_seconds").max(1) as u64;
        let mut total = 0i64;
        for root in &self.scope_roots {
            if !root.join(".git").exists() {
                continue;
            }
            if let Ok(snapshots) = warden_git::list_snapshots(root, timeout).await {
                total += snapshots.len() as i64;
            }
        }
        total
    }

    fn run_health_checks(
        &self,
        scheduler: &SchedulerState,
        notifier: &NotifierState,
        resources: &ResourceUsage,
    ) -> Vec<HealthCheckResult> {
        let mut checks = vec![
            health::check_sqlite_writable(&self.db),
            health::check_scheduler_lag(
                scheduler,
                self.config.int("observability.scheduler_lag_threshold"),
            ),
            health::check_job_timeouts(),
            health::check_notifier_alive(
                notifier,
                self.config.int("observability.notifier_lag_threshold"),
            ),
            health::check_outbox_stuck(
                notifier,
                self.config.int("observability.outbox_stuck_threshold"),
            ),
        ];
        if self.config.bool("observability.disk_usage_check_enabled") {
            checks.push(health::check_disk_usage(
                resources.db_size_mb,
                resources.log_size_mb,
                self.config.int("observability.disk_usage_cap_mb"),
            ));
        }
        checks
    }
}

fn directory_size_mb(dir: &std::path::Path) -> f64 {
    if !dir.exists() {
        return 0.0;
    }
    let bytes: u64 = walkdir::WalkDir::new(dir)
        .into_iter()
        .filter_map(|entry| entry.ok())
        .filter(|entry| entry.file_type().is_file())
        .filter_map(|entry| entry.metadata().ok())
        .map(|metadata| metadata.len())
        .sum();
    bytes as f64 / (1024.0 * 1024.0)
}
