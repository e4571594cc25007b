use std::path::Path;
use std::path::PathBuf;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::RwLock;

use rusqlite::Connection;
use thiserror::Error;
use tracing::info;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error("failed to enable WAL mode; journal_mode is `{mode}`")]
    WalUnavailable { mode: String },

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Epoch seconds, the timestamp unit used throughout the schema.
pub fn now_ts() -> i64 {
    chrono::Utc::now().timestamp()
}

/// Owns the single SQLite connection for the process.
///
/// The connection is opened lazily on first use and cached. Every store
/// call runs under the mutex, so callers get the serialization the
/// single-connection design promises and must treat each call as an
/// atomic unit.
pub struct DbManager {
    path: PathBuf,
    conn: Mutex<Option<Connection>>,
}

impl DbManager {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            conn: Mutex::new(None),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Run `f` against the cached connection, opening it first if needed.
    pub fn with_conn<T>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, rusqlite::Error>,
    ) -> Result<T, StoreError> {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.is_none() {
            *guard = Some(open_connection(&self.path)?);
        }
        match guard.as_ref() {
            Some(conn) => f(conn).map_err(StoreError::from),
            None => unreachable!("connection populated above"),
        }
    }

    /// Drop the cached connection. The next call reopens it.
    pub fn close(&self) {
        let mut guard = self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
        if guard.take().is_some() {
            info!(db_path = %self.path.display(), "database connection closed");
        }
    }
}

fn open_connection(path: &Path) -> Result<Connection, StoreError> {
    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() {
            std::fs::create_dir_all(parent)?;
        }
    }

    let conn = Connection::open(path)?;

    // Pragma order matters: foreign keys first, WAL before tuning.
    conn.pragma_update(None, "foreign_keys", "ON")?;
    conn.query_row("PRAGMA journal_mode=WAL", [], |row| row.get::<_, String>(0))?;
    conn.pragma_update(None, "synchronous", "NORMAL")?;
    conn.query_row("PRAGMA busy_timeout=5000", [], |row| row.get::<_, i64>(0))?;
    conn.pragma_update(None, "temp_store", "MEMORY")?;
    conn.pragma_update(None, "cache_size", -64_000)?;

    let mode: String = conn.query_row("PRAGMA journal_mode", [], |row| row.get(0))?;
    if !mode.eq_ignore_ascii_case("wal") {
        return Err(StoreError::WalUnavailable { mode });
    }

    info!(db_path = %path.display(), journal_mode = %mode, "database connection established");
    Ok(conn)
}

// ---------------------------------------------------------------------------
// Process-wide singleton, installed by the startup sequence. Tests construct
// managers directly on temp files instead.
// ---------------------------------------------------------------------------

static GLOBAL: RwLock<Option<Arc<DbManager>>> = RwLock::new(None);

pub fn install_db_manager(manager: Arc<DbManager>) {
    let mut slot = GLOBAL.write().unwrap_or_else(|poisoned| poisoned.into_inner());
    *slot = Some(manager);
}

/// The installed global manager. Panics if startup has not installed one.
pub fn db_manager() -> Arc<DbManager> {
    let slot = GLOBAL.read().unwrap_or_else(|poisoned| poisoned.into_inner());
    slot.clone()
        .unwrap_or_else(|| panic!("DbManager not initialized; call install_db_manager first"))
}
