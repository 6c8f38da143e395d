//! Embedded persistence: connection setup, migrations, and typed CRUD.
//!
//! The store wraps a single [`rusqlite::Connection`] behind a
//! [`tokio::sync::Mutex`]. Every public operation takes the lock, runs a
//! short synchronous transaction, and releases it — no suspension point ever
//! holds the connection, per the concurrency model's "DB calls are short
//! transactions" rule.

pub mod catalog;
pub mod migrations;
pub mod model;
pub mod runs;
pub mod schedules;

use std::path::Path;

use rusqlite::Connection;
use thiserror::Error;
use tokio::sync::Mutex;

pub use model::*;

/// Errors surfaced by store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Db(#[from] rusqlite::Error),
    #[error("json error: {0}")]
    Json(#[from] serde_json::Error),
    #[error("not found")]
    NotFound,
    #[error("invalid state: {0}")]
    Invalid(String),
}

pub type StoreResult<T> = Result<T, StoreError>;

/// The embedded store. Cheap to clone (it's an `Arc` internally via
/// `tokio::sync::Mutex` wrapped by callers in an `Arc<Store>`), but the
/// connection itself is single-writer.
pub struct Store {
    conn: Mutex<Connection>,
}

impl Store {
    /// Opens (creating if needed) the SQLite database at `path`, applies
    /// durability pragmas, and runs any outstanding migrations.
    pub fn open(path: &Path) -> StoreResult<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            std::fs::create_dir_all(parent).map_err(|e| {
                StoreError::Invalid(format!("failed to create database directory: {e}"))
            })?;
        }

        let mut conn = Connection::open(path)?;
        apply_pragmas(&conn)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    /// Opens an in-memory database. Used by tests.
    pub fn open_in_memory() -> StoreResult<Self> {
        let mut conn = Connection::open_in_memory()?;
        apply_pragmas(&conn)?;
        migrations::run_migrations(&mut conn)?;
        Ok(Self { conn: Mutex::new(conn) })
    }

    pub(crate) async fn lock(&self) -> tokio::sync::MutexGuard<'_, Connection> {
        self.conn.lock().await
    }
}

fn apply_pragmas(conn: &Connection) -> StoreResult<()> {
    conn.execute_batch(
        "PRAGMA foreign_keys = ON;
         PRAGMA journal_mode = WAL;
         PRAGMA synchronous = NORMAL;",
    )?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn open_in_memory_runs_migrations() {
        let store = Store::open_in_memory().expect("open");
        let conn = store.conn.blocking_lock();
        let version: i64 = conn
            .query_row("SELECT MAX(version) FROM migration_ledger", [], |r| r.get(0))
            .expect("query ledger");
        assert!(version >= 1);
    }

    #[test]
    fn reopening_does_not_reapply_migrations() {
        let dir = tempfile::tempdir().expect("tempdir");
        let path = dir.path().join("test.db");
        {
            let _store = Store::open(&path).expect("open");
        }
        let store = Store::open(&path).expect("reopen");
        let conn = store.conn.blocking_lock();
        let count: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_ledger", [], |r| r.get(0))
            .expect("query ledger");
        assert_eq!(count, migrations::MIGRATIONS.len() as i64);
    }
}
