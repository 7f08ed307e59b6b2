//! Store: the SQLite gateway shared by every coordinator.
//!
//! One `Store` owns one connection behind a mutex. Several stores (in one
//! process or many) may point at the same database file; SQLite arbitrates
//! between them and its primary keys are the synchronisation point for the
//! idempotency and watermark tables.

mod schema;

pub use schema::SCHEMA;

use crate::error::StoreError;
use chrono::{DateTime, TimeZone, Utc};
use rusqlite::Connection;
use std::path::Path;
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

/// Default time a connection waits on a locked database before failing.
pub const DEFAULT_BUSY_TIMEOUT: Duration = Duration::from_millis(5000);

/// Tables that must exist for the runtime to be healthy.
const REQUIRED_TABLES: [&str; 5] = [
    "idempotency_keys",
    "nonce_watermarks",
    "revocations",
    "signing_keys",
    "signing_key_versions",
];

/// SQLite-backed store handle. Cheap to clone; clones share the connection.
#[derive(Clone)]
pub struct Store {
    conn: Arc<Mutex<Connection>>,
}

impl Store {
    /// Open a file-backed store with the default busy timeout.
    pub fn open(path: &Path) -> Result<Self, StoreError> {
        Self::open_with_timeout(path, DEFAULT_BUSY_TIMEOUT)
    }

    /// Open a file-backed store; `busy_timeout` bounds every lock wait.
    pub fn open_with_timeout(path: &Path, busy_timeout: Duration) -> Result<Self, StoreError> {
        let conn = Connection::open(path)?;
        Self::init_connection(&conn, busy_timeout)?;
        tracing::debug!(event = "store_opened", path = %path.display());
        Ok(Self::wrap(conn))
    }

    /// Create an in-memory store (for testing).
    pub fn memory() -> Result<Self, StoreError> {
        let conn = Connection::open_in_memory()?;
        Self::init_connection(&conn, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::wrap(conn))
    }

    /// Create store from existing connection (for multi-connection tests).
    pub fn from_connection(conn: Connection) -> Result<Self, StoreError> {
        Self::init_connection(&conn, DEFAULT_BUSY_TIMEOUT)?;
        Ok(Self::wrap(conn))
    }

    fn wrap(conn: Connection) -> Self {
        Self {
            conn: Arc::new(Mutex::new(conn)),
        }
    }

    fn init_connection(conn: &Connection, busy_timeout: Duration) -> Result<(), StoreError> {
        conn.execute_batch("PRAGMA foreign_keys = ON")?;
        conn.busy_timeout(busy_timeout)?;
        // WAL mode for file-backed DBs (no-op for in-memory)
        if let Err(e) = conn.query_row("PRAGMA journal_mode = WAL", [], |_| Ok(())) {
            tracing::debug!(event = "store_wal_unavailable", error = %e);
        }
        conn.execute_batch(SCHEMA)?;
        Ok(())
    }

    /// Lock the connection. A poisoned lock is recovered: the connection holds
    /// no Rust-side state that a panicking holder could have left half-written.
    pub(crate) fn lock(&self) -> MutexGuard<'_, Connection> {
        self.conn.lock().unwrap_or_else(|e| e.into_inner())
    }

    /// Run `f` inside `BEGIN IMMEDIATE … COMMIT`, rolling back on error.
    pub(crate) fn immediate<T, E>(
        &self,
        f: impl FnOnce(&Connection) -> Result<T, E>,
    ) -> Result<T, E>
    where
        E: From<StoreError>,
    {
        let conn = self.lock();

        // BEGIN IMMEDIATE acquires the write lock up front
        conn.execute_batch("BEGIN IMMEDIATE")
            .map_err(|e| E::from(StoreError::from(e)))?;

        let result = f(&conn);

        let commit = match &result {
            Ok(_) => conn.execute_batch("COMMIT"),
            Err(_) => Ok(()),
        };
        if result.is_err() || commit.is_err() {
            if let Err(e) = conn.execute_batch("ROLLBACK") {
                tracing::warn!(event = "store_rollback_failed", error = %e);
            }
        }
        commit.map_err(|e| E::from(StoreError::from(e)))?;

        result
    }

    /// Direct access to the underlying connection (maintenance and tests).
    pub fn connection(&self) -> MutexGuard<'_, Connection> {
        self.lock()
    }

    /// Verify the connection answers and the schema is in place.
    pub fn health_check(&self) -> Result<(), StoreError> {
        let tables = self.table_names()?;
        for required in REQUIRED_TABLES {
            if !tables.iter().any(|t| t == required) {
                return Err(StoreError::Corrupt(format!("missing table {required}")));
            }
        }
        Ok(())
    }

    /// Names of all tables in the database, sorted.
    pub fn table_names(&self) -> Result<Vec<String>, StoreError> {
        let conn = self.lock();
        let mut stmt =
            conn.prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")?;
        let names = stmt
            .query_map([], |row| row.get::<_, String>(0))?
            .collect::<Result<Vec<_>, _>>()?;
        Ok(names)
    }
}

/// Convert an instant to the stored representation.
pub(crate) fn to_millis(t: DateTime<Utc>) -> i64 {
    t.timestamp_millis()
}

/// Convert a stored instant back; out-of-range values are corrupt rows.
pub(crate) fn from_millis(ms: i64) -> Result<DateTime<Utc>, StoreError> {
    Utc.timestamp_millis_opt(ms)
        .single()
        .ok_or_else(|| StoreError::Corrupt(format!("timestamp out of range: {ms}")))
}
