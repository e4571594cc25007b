//! Git capability. Every command runs as `git -C <repo> …` through
//! [`tokio::process::Command`] under a per-call deadline; a deadline expiry
//! kills the child and surfaces a retryable `*_timeout` error.

mod exec;
mod ops;
mod snapshot;

pub use exec::GitOutput;
pub use ops::CheckoutResult;
pub use ops::CommitResult;
pub use ops::DiffResult;
pub use ops::StatusResult;
pub use ops::checkout;
pub use ops::commit;
pub use ops::diff;
pub use ops::status;
pub use snapshot::PruneResult;
pub use snapshot::RollbackResult;
pub use snapshot::SnapshotInfo;
pub use snapshot::create_snapshot;
pub use snapshot::find_repo_root;
pub use snapshot::list_snapshots;
pub use snapshot::prune_snapshots;
pub use snapshot::rollback_to_snapshot;
