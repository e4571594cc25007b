use std::path::Path;

use rusqlite::Connection;
use rusqlite::params;
use sha2::Digest;
use sha2::Sha256;
use thiserror::Error;
use tracing::info;

use crate::db::now_ts;

/// The tracking table itself must never be applied as a migration.
const TRACKING_TABLE_FILE: &str = "schema_migrations.sql";

#[derive(Debug, Error)]
pub enum MigrationError {
    #[error("migration `{name}` was modified after being applied (checksum mismatch)")]
    Tampered { name: String },

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug, Default)]
pub struct MigrationReport {
    /// Names applied by this run, in order.
    pub applied: Vec<String>,
    /// Previously-applied names whose checksums were re-verified.
    pub verified: usize,
}

/// Apply every `*.sql` file in `migrations_dir` to the database at
/// `db_path`, in lexical order.
///
/// Already-applied migrations are checksum-verified (SHA-256); a mismatch
/// aborts with [`MigrationError::Tampered`] before any further change.
/// Pending migrations run as a script inside one transaction each and are
/// recorded with their checksum. Running the same set twice is a no-op.
pub fn run_migrations(
    db_path: &Path,
    migrations_dir: &Path,
) -> Result<MigrationReport, MigrationError> {
    if let Some(parent) = db_path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let mut conn = Connection::open(db_path)?;
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.execute(
        "CREATE TABLE IF NOT EXISTS schema_migrations (
            migration_name TEXT PRIMARY KEY,
            checksum TEXT NOT NULL,
            applied_at INTEGER NOT NULL
        ) STRICT",
        [],
    )?;

    let mut names: Vec<String> = std::fs::read_dir(migrations_dir)?
        .filter_map(|entry| entry.ok())
        .filter_map(|entry| entry.file_name().into_string().ok())
        .filter(|name| name.ends_with(".sql") && name != TRACKING_TABLE_FILE)
        .collect();
    names.sort();

    let mut report = MigrationReport::default();
    for name in names {
        let sql_path = migrations_dir.join(&name);
        let contents = std::fs::read(&sql_path)?;
        let checksum = sha256_hex(&contents);

        let recorded: Option<String> = conn
            .query_row(
                "SELECT checksum FROM schema_migrations WHERE migration_name = ?1",
                params![name],
                |row| row.get(0),
            )
            .map(Some)
            .or_else(|err| match err {
                rusqlite::Error::QueryReturnedNoRows => Ok(None),
                other => Err(other),
            })?;

        match recorded {
            Some(stored) if stored == checksum => {
                report.verified += 1;
            }
            Some(_) => {
                return Err(MigrationError::Tampered { name });
            }
            None => {
                let sql = String::from_utf8_lossy(&contents).into_owned();
                let tx = conn.transaction()?;
                tx.execute_batch(&sql)?;
                tx.execute(
                    "INSERT INTO schema_migrations (migration_name, checksum, applied_at)
                     VALUES (?1, ?2, ?3)",
                    params![name, checksum, now_ts()],
                )?;
                tx.commit()?;
                info!(migration = %name, "migration applied");
                report.applied.push(name);
            }
        }
    }

    Ok(report)
}

fn sha256_hex(bytes: &[u8]) -> String {
    let digest = Sha256::digest(bytes);
    digest.iter().fold(String::with_capacity(64), |mut acc, b| {
        use std::fmt::Write as _;
        let _ = write!(acc, "{b:02x}");
        acc
    })
}
