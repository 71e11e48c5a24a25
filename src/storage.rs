// SQLite persistence capability
//
// The store is constructed once per process and handed to the Template
// Store and Account Ledger explicitly; no module reaches for an ambient
// connection. A mutation's success is only reported after the statement
// (or transaction) has committed.

use crate::error::{EngineError, EngineResult};
use rusqlite::{types::Type, Connection};
use rust_decimal::Decimal;
use std::path::Path;
use std::str::FromStr;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;
use tracing::warn;

/// Transient SQLite failures get this many attempts before the call fails
/// with `Unavailable`
const RETRY_ATTEMPTS: u32 = 3;

/// Backoff between retry attempts
const RETRY_BACKOFF: Duration = Duration::from_millis(25);

// ============================================================================
// STORAGE
// ============================================================================

/// Shared handle to the SQLite database
#[derive(Clone)]
pub struct Storage {
    conn: Arc<Mutex<Connection>>,
}

impl Storage {
    /// Open (or create) a database file and initialize the schema
    pub fn open(path: &Path) -> EngineResult<Self> {
        let conn = Connection::open(path).map_err(|e| unavailable(1, &e))?;
        setup_schema(&conn).map_err(|e| unavailable(1, &e))?;
        Ok(Storage {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// In-memory database, used by tests and the demo mode
    pub fn in_memory() -> EngineResult<Self> {
        let conn = Connection::open_in_memory().map_err(|e| unavailable(1, &e))?;
        setup_schema(&conn).map_err(|e| unavailable(1, &e))?;
        Ok(Storage {
            conn: Arc::new(Mutex::new(conn)),
        })
    }

    /// Run an operation against the connection with bounded retry.
    ///
    /// Busy/locked errors are retried up to `RETRY_ATTEMPTS` times; any
    /// failure that survives the retries surfaces as `Unavailable`. The
    /// mutex guards individual operations only, never a check-then-update
    /// span; that serialization belongs to the ledger's per-account locks.
    pub(crate) fn with_conn<T>(
        &self,
        mut op: impl FnMut(&mut Connection) -> rusqlite::Result<T>,
    ) -> EngineResult<T> {
        let mut attempt = 1;
        loop {
            let mut guard: MutexGuard<'_, Connection> =
                self.conn.lock().unwrap_or_else(|poisoned| poisoned.into_inner());
            match op(&mut *guard) {
                Ok(value) => return Ok(value),
                Err(err) if is_transient(&err) && attempt < RETRY_ATTEMPTS => {
                    drop(guard);
                    warn!(attempt, error = %err, "transient storage failure, retrying");
                    std::thread::sleep(RETRY_BACKOFF * attempt);
                    attempt += 1;
                }
                Err(err) => return Err(unavailable(attempt, &err)),
            }
        }
    }
}

/// Busy and locked are the retriable classes; everything else fails fast
fn is_transient(err: &rusqlite::Error) -> bool {
    matches!(
        err,
        rusqlite::Error::SqliteFailure(inner, _)
            if inner.code == rusqlite::ErrorCode::DatabaseBusy
                || inner.code == rusqlite::ErrorCode::DatabaseLocked
    )
}

fn unavailable(attempts: u32, err: &rusqlite::Error) -> EngineError {
    EngineError::Unavailable {
        attempts,
        message: err.to_string(),
    }
}

// ============================================================================
// SCHEMA
// ============================================================================

fn setup_schema(conn: &Connection) -> rusqlite::Result<()> {
    // WAL mode for crash recovery
    conn.pragma_update(None, "journal_mode", "WAL")?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS accounts (
            account_id TEXT PRIMARY KEY,
            display_name TEXT NOT NULL,
            balance TEXT NOT NULL,
            initial_balance TEXT NOT NULL,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL
        )",
        [],
    )?;

    conn.execute(
        "CREATE TABLE IF NOT EXISTS templates (
            account_id TEXT PRIMARY KEY,
            vector TEXT NOT NULL,
            fingerprint TEXT NOT NULL,
            enrolled_at TEXT NOT NULL
        )",
        [],
    )?;

    // Append-only: rows are never updated or deleted after insert
    conn.execute(
        "CREATE TABLE IF NOT EXISTS ledger_entries (
            id INTEGER PRIMARY KEY AUTOINCREMENT,
            entry_id TEXT UNIQUE NOT NULL,
            account_id TEXT NOT NULL,
            seq INTEGER NOT NULL,
            kind TEXT NOT NULL,
            amount TEXT NOT NULL,
            requested TEXT NOT NULL,
            balance_after TEXT NOT NULL,
            outcome TEXT NOT NULL,
            reason TEXT,
            at TEXT NOT NULL,
            UNIQUE(account_id, seq)
        )",
        [],
    )?;

    conn.execute(
        "CREATE INDEX IF NOT EXISTS idx_entries_account ON ledger_entries(account_id, seq)",
        [],
    )?;

    Ok(())
}

// ============================================================================
// COLUMN CODECS
// ============================================================================

/// Decimal amounts are stored as TEXT to keep them exact
pub(crate) fn decimal_from_column(index: usize, text: &str) -> rusqlite::Result<Decimal> {
    Decimal::from_str(text).map_err(|e| {
        rusqlite::Error::FromSqlConversionFailure(index, Type::Text, Box::new(e))
    })
}
