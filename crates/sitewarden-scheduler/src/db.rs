use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

use chrono::{DateTime, SecondsFormat, Utc};
use rusqlite::Connection;

use crate::error::{Result, SchedulerError};

/// One SQLite connection shared by the scheduler components of a process.
///
/// Separate runner processes open their own connection to the same file;
/// coordination between them goes through the lock row and atomic updates,
/// never through this mutex.
pub type Db = Arc<Mutex<Connection>>;

/// How long SQLite waits on a locked database file before giving up.
const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// Open (or create) the database file and run the scheduler migrations.
pub fn open(path: &str) -> Result<Db> {
    let conn = Connection::open(path)?;
    conn.busy_timeout(BUSY_TIMEOUT)?;
    conn.execute_batch("PRAGMA journal_mode=WAL; PRAGMA foreign_keys=ON;")?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Private in-memory database, used by tests and dry runs.
pub fn open_in_memory() -> Result<Db> {
    let conn = Connection::open_in_memory()?;
    init_db(&conn)?;
    Ok(Arc::new(Mutex::new(conn)))
}

/// Initialise the scheduler schema in `conn`.
///
/// Creates the `tasks`, `scheduler_locks` and `settings` tables (idempotent)
/// plus the index the dequeue query walks.
pub fn init_db(conn: &Connection) -> Result<()> {
    conn.execute_batch(
        "
        CREATE TABLE IF NOT EXISTS tasks (
            id              INTEGER PRIMARY KEY AUTOINCREMENT,
            site_id         INTEGER,            -- NULL for system jobs
            type            TEXT    NOT NULL,
            params          TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            storage         TEXT    NOT NULL DEFAULT '{}',  -- JSON object
            cron_expression TEXT    NOT NULL,
            enabled         INTEGER NOT NULL DEFAULT 1,
            priority        INTEGER NOT NULL DEFAULT 0,
            last_exit_code  INTEGER NOT NULL DEFAULT -1,
            last_execution  TEXT,               -- UTC, RFC 3339
            last_run_end    TEXT,               -- UTC, RFC 3339
            next_execution  TEXT,               -- UTC, RFC 3339
            times_executed  INTEGER NOT NULL DEFAULT 0,
            times_failed    INTEGER NOT NULL DEFAULT 0,
            created_at      TEXT    NOT NULL,
            updated_at      TEXT    NOT NULL
        );

        CREATE INDEX IF NOT EXISTS idx_tasks_due
            ON tasks (enabled, last_exit_code, next_execution);
        CREATE INDEX IF NOT EXISTS idx_tasks_site ON tasks (site_id);

        -- One row per named advisory lock; a row past expires_at is free.
        CREATE TABLE IF NOT EXISTS scheduler_locks (
            name        TEXT NOT NULL PRIMARY KEY,
            owner       TEXT NOT NULL,
            acquired_at TEXT NOT NULL,
            expires_at  TEXT NOT NULL
        );

        CREATE TABLE IF NOT EXISTS settings (
            key        TEXT NOT NULL PRIMARY KEY,
            value      TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        ",
    )?;
    Ok(())
}

/// Lock the shared connection, surfacing poisoning as an error.
pub(crate) fn lock(db: &Db) -> Result<MutexGuard<'_, Connection>> {
    db.lock()
        .map_err(|e| SchedulerError::Poisoned(e.to_string()))
}

/// Fixed-width UTC timestamp so that text comparison in SQL orders correctly.
pub(crate) fn ts(dt: DateTime<Utc>) -> String {
    dt.to_rfc3339_opts(SecondsFormat::Millis, true)
}

pub(crate) fn parse_ts(s: &str) -> Option<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(s)
        .ok()
        .map(|dt| dt.with_timezone(&Utc))
}
