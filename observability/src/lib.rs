//! Observability: the `StatusSnapshot` model, a single-slot in-memory
//! cache, the periodic collector task, and the health checks it runs.

mod collector;
mod health;
mod snapshot;

pub use collector::SnapshotCollector;
pub use health::check_disk_usage;
pub use health::check_job_timeouts;
pub use health::check_notifier_alive;
pub use health::check_outbox_stuck;
pub use health::check_scheduler_lag;
pub use health::check_sqlite_writable;
pub use snapshot::BrokerActivity;
pub use snapshot::HealthCheckResult;
pub use snapshot::HealthStatus;
pub use snapshot::InFlightOperation;
pub use snapshot::NotifierState;
pub use snapshot::ProcessInfo;
pub use snapshot::ResourceUsage;
pub use snapshot::SchedulerState;
pub use snapshot::StatusCache;
pub use snapshot::StatusSnapshot;
