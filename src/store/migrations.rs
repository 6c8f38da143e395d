//! Append-only schema migrations.
//!
//! Each migration runs inside its own transaction; the ledger row for a
//! version is inserted only after that version's schema statements succeed.
//! A recorded version is never re-applied, and existing migrations are never
//! edited — add a new one instead.

use rusqlite::{Connection, Transaction};

use super::StoreResult;

type MigrationFn = fn(&Transaction) -> rusqlite::Result<()>;

/// Ordered list of migrations. Index + 1 is the version number.
pub static MIGRATIONS: &[MigrationFn] = &[migration_001_initial_schema];

pub fn run_migrations(conn: &mut Connection) -> StoreResult<()> {
    conn.execute_batch(
        "CREATE TABLE IF NOT EXISTS migration_ledger (
            version INTEGER PRIMARY KEY,
            applied_at TEXT NOT NULL
        );",
    )?;

    let current: i64 =
        conn.query_row("SELECT COALESCE(MAX(version), 0) FROM migration_ledger", [], |r| r.get(0))?;

    for (idx, migration) in MIGRATIONS.iter().enumerate() {
        let version = (idx + 1) as i64;
        if version <= current {
            continue;
        }
        let tx = conn.transaction()?;
        migration(&tx)?;
        tx.execute(
            "INSERT INTO migration_ledger (version, applied_at) VALUES (?1, datetime('now'))",
            rusqlite::params![version],
        )?;
        tx.commit()?;
    }

    Ok(())
}

fn migration_001_initial_schema(tx: &Transaction) -> rusqlite::Result<()> {
    tx.execute_batch(
        "
        CREATE TABLE test_definitions (
            id TEXT PRIMARY KEY,
            test_key TEXT NOT NULL UNIQUE,
            folder_path TEXT NOT NULL,
            spec_path TEXT NOT NULL,
            meta TEXT NOT NULL,
            constants TEXT NOT NULL,
            overrides TEXT,
            active INTEGER NOT NULL DEFAULT 1,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX idx_test_definitions_test_key ON test_definitions (test_key);

        CREATE TABLE schedules (
            id TEXT PRIMARY KEY,
            name TEXT NOT NULL,
            cron TEXT NOT NULL,
            enabled INTEGER NOT NULL DEFAULT 1,
            environment TEXT NOT NULL,
            last_triggered_at TEXT,
            selector TEXT NOT NULL,
            default_run_overrides TEXT,
            created_by_email TEXT NOT NULL,
            updated_by_email TEXT NOT NULL,
            created_at TEXT NOT NULL,
            updated_at TEXT NOT NULL
        );
        CREATE INDEX idx_schedules_enabled ON schedules (enabled);

        CREATE TABLE runs (
            id TEXT PRIMARY KEY,
            status TEXT NOT NULL,
            trigger_type TEXT NOT NULL,
            environment TEXT NOT NULL,
            schedule_id TEXT REFERENCES schedules(id) ON DELETE SET NULL,
            triggered_by_email TEXT,
            run_overrides TEXT NOT NULL,
            metadata TEXT NOT NULL,
            summary TEXT NOT NULL,
            created_at TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT
        );
        CREATE INDEX idx_runs_status ON runs (status);
        CREATE INDEX idx_runs_environment ON runs (environment);
        CREATE INDEX idx_runs_created_at ON runs (created_at);
        CREATE INDEX idx_runs_schedule_id ON runs (schedule_id);

        CREATE TABLE run_tests (
            run_id TEXT NOT NULL REFERENCES runs(id) ON DELETE CASCADE,
            test_id TEXT NOT NULL,
            test_key TEXT NOT NULL,
            status TEXT NOT NULL,
            duration_ms INTEGER,
            error_message TEXT,
            artifacts TEXT NOT NULL,
            started_at TEXT,
            finished_at TEXT,
            PRIMARY KEY (run_id, test_key)
        );
        CREATE INDEX idx_run_tests_run_id ON run_tests (run_id);
        CREATE INDEX idx_run_tests_status ON run_tests (status);
        CREATE INDEX idx_run_tests_test_key ON run_tests (test_key);
        ",
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn migration_creates_expected_tables() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();

        let mut stmt = conn
            .prepare("SELECT name FROM sqlite_master WHERE type='table' ORDER BY name")
            .unwrap();
        let names: Vec<String> =
            stmt.query_map([], |r| r.get(0)).unwrap().collect::<Result<_, _>>().unwrap();

        for expected in ["test_definitions", "schedules", "runs", "run_tests", "migration_ledger"] {
            assert!(names.iter().any(|n| n == expected), "missing table {expected}");
        }
    }

    #[test]
    fn running_twice_is_idempotent() {
        let mut conn = Connection::open_in_memory().unwrap();
        run_migrations(&mut conn).unwrap();
        run_migrations(&mut conn).unwrap();
        let version: i64 = conn
            .query_row("SELECT COUNT(*) FROM migration_ledger", [], |r| r.get(0))
            .unwrap();
        assert_eq!(version, MIGRATIONS.len() as i64);
    }
}
