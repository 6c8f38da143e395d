//! Typed CRUD over runs and their per-test rows, including the mediated
//! status-transition helpers the executor and queue rely on.

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use rusqlite::{OptionalExtension, Transaction, params};
use serde_json::Value;
use uuid::Uuid;

use super::{
    Run, RunStatus, RunSummary, RunTest, RunTestArtifacts, RunTestStatus, RunWithTests, Store,
    StoreError, StoreResult, TriggerType,
};

fn parse_dt(s: Option<String>) -> Option<DateTime<Utc>> {
    s.and_then(|s| s.parse().ok())
}

fn row_to_run(row: &rusqlite::Row) -> rusqlite::Result<Run> {
    let id: String = row.get("id")?;
    let status: String = row.get("status")?;
    let trigger_type: String = row.get("trigger_type")?;
    let schedule_id: Option<String> = row.get("schedule_id")?;
    let run_overrides: String = row.get("run_overrides")?;
    let metadata: String = row.get("metadata")?;
    let summary: String = row.get("summary")?;
    let created_at: String = row.get("created_at")?;

    Ok(Run {
        id: Uuid::parse_str(&id).unwrap_or_default(),
        status: RunStatus::parse(&status).unwrap_or(RunStatus::Failed),
        trigger_type: TriggerType::parse(&trigger_type).unwrap_or(TriggerType::Manual),
        environment: row.get("environment")?,
        schedule_id: schedule_id.and_then(|s| Uuid::parse_str(&s).ok()),
        triggered_by_email: row.get("triggered_by_email")?,
        run_overrides: serde_json::from_str::<HashMap<String, Value>>(&run_overrides).unwrap_or_default(),
        metadata: serde_json::from_str(&metadata).unwrap_or(Value::Null),
        summary: serde_json::from_str::<RunSummary>(&summary).unwrap_or_default(),
        created_at: created_at.parse().unwrap_or_else(|_| Utc::now()),
        started_at: parse_dt(row.get("started_at")?),
        finished_at: parse_dt(row.get("finished_at")?),
    })
}

fn row_to_run_test(row: &rusqlite::Row) -> rusqlite::Result<RunTest> {
    let run_id: String = row.get("run_id")?;
    let test_id: String = row.get("test_id")?;
    let status: String = row.get("status")?;
    let artifacts: String = row.get("artifacts")?;

    Ok(RunTest {
        run_id: Uuid::parse_str(&run_id).unwrap_or_default(),
        test_id: Uuid::parse_str(&test_id).unwrap_or_default(),
        test_key: row.get("test_key")?,
        status: RunTestStatus::parse(&status).unwrap_or(RunTestStatus::Failed),
        duration_ms: row.get("duration_ms")?,
        error_message: row.get("error_message")?,
        artifacts: serde_json::from_str::<RunTestArtifacts>(&artifacts).unwrap_or_default(),
        started_at: parse_dt(row.get("started_at")?),
        finished_at: parse_dt(row.get("finished_at")?),
    })
}

/// Input to [`Store::create_run`]: the resolved set of tests to attach.
pub struct NewRunTest {
    pub test_id: Uuid,
    pub test_key: String,
}

impl Store {
    /// Creates a run with `status = queued` and one `pending` [`RunTest`]
    /// per entry in `tests`, in a single transaction. `tests` may be empty.
    #[allow(clippy::too_many_arguments)]
    pub async fn create_run(
        &self,
        environment: &str,
        trigger_type: TriggerType,
        schedule_id: Option<Uuid>,
        triggered_by_email: Option<&str>,
        run_overrides: &HashMap<String, Value>,
        metadata: &Value,
        tests: &[NewRunTest],
    ) -> StoreResult<Run> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;

        let id = Uuid::new_v4();
        let now = Utc::now();
        let summary = RunSummary { total_tests: tests.len(), ..Default::default() };

        tx.execute(
            "INSERT INTO runs
                (id, status, trigger_type, environment, schedule_id, triggered_by_email,
                 run_overrides, metadata, summary, created_at, started_at, finished_at)
             VALUES (?1, 'queued', ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, NULL, NULL)",
            params![
                id.to_string(),
                trigger_type.as_str(),
                environment,
                schedule_id.map(|u| u.to_string()),
                triggered_by_email,
                serde_json::to_string(run_overrides)?,
                serde_json::to_string(metadata)?,
                serde_json::to_string(&summary)?,
                now.to_rfc3339(),
            ],
        )?;

        for test in tests {
            let artifacts = RunTestArtifacts::default();
            tx.execute(
                "INSERT INTO run_tests
                    (run_id, test_id, test_key, status, duration_ms, error_message,
                     artifacts, started_at, finished_at)
                 VALUES (?1, ?2, ?3, 'pending', NULL, NULL, ?4, NULL, NULL)",
                params![
                    id.to_string(),
                    test.test_id.to_string(),
                    test.test_key,
                    serde_json::to_string(&artifacts)?,
                ],
            )?;
        }

        let run = tx.query_row("SELECT * FROM runs WHERE id = ?1", params![id.to_string()], row_to_run)?;

        tx.commit()?;
        drop(conn);
        Ok(run)
    }

    pub async fn get_run(&self, id: Uuid) -> StoreResult<Option<Run>> {
        let conn = self.lock().await;
        conn.query_row("SELECT * FROM runs WHERE id = ?1", params![id.to_string()], row_to_run)
            .optional()
            .map_err(StoreError::from)
    }

    pub async fn get_run_with_tests(&self, id: Uuid) -> StoreResult<Option<RunWithTests>> {
        let Some(run) = self.get_run(id).await? else { return Ok(None) };
        let tests = self.list_run_tests(id).await?;
        Ok(Some(RunWithTests { run, tests }))
    }

    /// Tests for a run, in `ORDER BY test_key ASC` per the executor's
    /// sequential-execution ordering guarantee.
    pub async fn list_run_tests(&self, run_id: Uuid) -> StoreResult<Vec<RunTest>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare(
            "SELECT * FROM run_tests WHERE run_id = ?1 ORDER BY test_key ASC",
        )?;
        let rows = stmt.query_map(params![run_id.to_string()], row_to_run_test)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// Lists runs, optionally filtered by status and/or environment, newest
    /// first, paginated.
    pub async fn list_runs(
        &self,
        status: Option<RunStatus>,
        environment: Option<&str>,
        limit: i64,
        offset: i64,
    ) -> StoreResult<Vec<Run>> {
        let conn = self.lock().await;
        let mut sql = String::from("SELECT * FROM runs WHERE 1 = 1");
        let mut params: Vec<Box<dyn rusqlite::ToSql>> = Vec::new();
        if let Some(status) = status {
            sql.push_str(" AND status = ?");
            params.push(Box::new(status.as_str().to_string()));
        }
        if let Some(env) = environment {
            sql.push_str(" AND environment = ?");
            params.push(Box::new(env.to_string()));
        }
        sql.push_str(" ORDER BY created_at DESC LIMIT ? OFFSET ?");
        params.push(Box::new(limit));
        params.push(Box::new(offset));

        let mut stmt = conn.prepare(&sql)?;
        let refs: Vec<&dyn rusqlite::ToSql> = params.iter().map(|b| b.as_ref()).collect();
        let rows = stmt.query_map(refs.as_slice(), row_to_run)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    pub async fn count_runs_by_status(&self, status: RunStatus) -> StoreResult<i64> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE status = ?1",
            params![status.as_str()],
            |r| r.get(0),
        )
        .map_err(StoreError::from)
    }

    /// The single oldest `queued` run, if any — the queue's admission
    /// candidate.
    pub async fn oldest_queued_run(&self) -> StoreResult<Option<Run>> {
        let conn = self.lock().await;
        conn.query_row(
            "SELECT * FROM runs WHERE status = 'queued' ORDER BY created_at ASC LIMIT 1",
            [],
            row_to_run,
        )
        .optional()
        .map_err(StoreError::from)
    }

    /// Mediated status transition: stamps `started_at` on the first
    /// `running` transition, `finished_at` on any terminal transition.
    pub async fn set_run_status(&self, id: Uuid, next: RunStatus) -> StoreResult<()> {
        let conn = self.lock().await;
        let now = Utc::now().to_rfc3339();
        if next == RunStatus::Running {
            conn.execute(
                "UPDATE runs SET status = ?1, started_at = COALESCE(started_at, ?2) WHERE id = ?3",
                params![next.as_str(), now, id.to_string()],
            )?;
        } else if next.is_terminal() {
            conn.execute(
                "UPDATE runs SET status = ?1, finished_at = ?2 WHERE id = ?3",
                params![next.as_str(), now, id.to_string()],
            )?;
        } else {
            conn.execute(
                "UPDATE runs SET status = ?1 WHERE id = ?2",
                params![next.as_str(), id.to_string()],
            )?;
        }
        Ok(())
    }

    /// Cancels a run iff it is currently `queued` or `running`. Idempotent:
    /// calling this on an already-cancelled (or otherwise terminal) run is a
    /// no-op that returns `false`.
    pub async fn cancel_run(&self, id: Uuid) -> StoreResult<bool> {
        let conn = self.lock().await;
        let affected = conn.execute(
            "UPDATE runs SET status = 'cancelled', finished_at = ?1
             WHERE id = ?2 AND status IN ('queued', 'running')",
            params![Utc::now().to_rfc3339(), id.to_string()],
        )?;
        Ok(affected > 0)
    }

    /// Bulk-promotes remaining `pending` rows of a run to `skipped`.
    pub async fn skip_pending_tests(&self, run_id: Uuid) -> StoreResult<usize> {
        let conn = self.lock().await;
        let affected = conn.execute(
            "UPDATE run_tests SET status = 'skipped', finished_at = ?1
             WHERE run_id = ?2 AND status = 'pending'",
            params![Utc::now().to_rfc3339(), run_id.to_string()],
        )?;
        Ok(affected)
    }

    pub async fn set_run_test_status(
        &self,
        run_id: Uuid,
        test_key: &str,
        status: RunTestStatus,
    ) -> StoreResult<()> {
        let conn = self.lock().await;
        let now = Utc::now().to_rfc3339();
        match status {
            RunTestStatus::Running => {
                conn.execute(
                    "UPDATE run_tests SET status = ?1, started_at = ?2
                     WHERE run_id = ?3 AND test_key = ?4",
                    params![status.as_str(), now, run_id.to_string(), test_key],
                )?;
            }
            s if s.is_finished() => {
                conn.execute(
                    "UPDATE run_tests SET status = ?1, finished_at = ?2
                     WHERE run_id = ?3 AND test_key = ?4",
                    params![status.as_str(), now, run_id.to_string(), test_key],
                )?;
            }
            _ => {
                conn.execute(
                    "UPDATE run_tests SET status = ?1 WHERE run_id = ?2 AND test_key = ?3",
                    params![status.as_str(), run_id.to_string(), test_key],
                )?;
            }
        }
        Ok(())
    }

    /// Records the outcome of a finished test: terminal status, duration,
    /// optional error message, and artifact filenames.
    pub async fn finish_run_test(
        &self,
        run_id: Uuid,
        test_key: &str,
        status: RunTestStatus,
        duration_ms: i64,
        error_message: Option<&str>,
        artifacts: &RunTestArtifacts,
    ) -> StoreResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE run_tests
             SET status = ?1, duration_ms = ?2, error_message = ?3, artifacts = ?4, finished_at = ?5
             WHERE run_id = ?6 AND test_key = ?7",
            params![
                status.as_str(),
                duration_ms,
                error_message,
                serde_json::to_string(artifacts)?,
                Utc::now().to_rfc3339(),
                run_id.to_string(),
                test_key,
            ],
        )?;
        Ok(())
    }

    pub async fn set_run_summary(&self, id: Uuid, summary: &RunSummary) -> StoreResult<()> {
        let conn = self.lock().await;
        conn.execute(
            "UPDATE runs SET summary = ?1 WHERE id = ?2",
            params![serde_json::to_string(summary)?, id.to_string()],
        )?;
        Ok(())
    }

    /// All runs whose status is `queued` or `running`, for startup recovery.
    pub async fn list_nonterminal_runs(&self) -> StoreResult<Vec<Run>> {
        let conn = self.lock().await;
        let mut stmt =
            conn.prepare("SELECT * FROM runs WHERE status IN ('queued', 'running')")?;
        let rows = stmt.query_map([], row_to_run)?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }

    /// Within one transaction: fails every non-terminal run and every
    /// non-terminal `run_test` belonging to it. Used only by startup
    /// recovery.
    pub async fn fail_all_nonterminal_runs(&self, interrupt_message: &str) -> StoreResult<usize> {
        let mut conn = self.lock().await;
        let tx = conn.transaction()?;
        let count = fail_nonterminal_runs_tx(&tx, interrupt_message)?;
        tx.commit()?;
        Ok(count)
    }

    /// Run IDs created before `cutoff`, for retention.
    pub async fn run_ids_older_than(&self, cutoff: DateTime<Utc>) -> StoreResult<Vec<Uuid>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM runs WHERE created_at < ?1")?;
        let rows = stmt.query_map(params![cutoff.to_rfc3339()], |r| r.get::<_, String>(0))?;
        let mut out = Vec::new();
        for row in rows {
            if let Ok(id) = Uuid::parse_str(&row?) {
                out.push(id);
            }
        }
        Ok(out)
    }

    /// Deletes a run row (cascades to `run_tests`).
    pub async fn delete_run(&self, id: Uuid) -> StoreResult<()> {
        let conn = self.lock().await;
        conn.execute("DELETE FROM runs WHERE id = ?1", params![id.to_string()])?;
        Ok(())
    }

    /// All run IDs currently known to the store, as strings — used by the
    /// retention worker's orphan reaper to decide which artifact
    /// directories are orphaned.
    pub async fn all_run_ids(&self) -> StoreResult<std::collections::HashSet<String>> {
        let conn = self.lock().await;
        let mut stmt = conn.prepare("SELECT id FROM runs")?;
        let rows = stmt.query_map([], |r| r.get::<_, String>(0))?;
        rows.collect::<Result<_, _>>().map_err(StoreError::from)
    }
}

fn fail_nonterminal_runs_tx(tx: &Transaction, interrupt_message: &str) -> rusqlite::Result<usize> {
    let now = Utc::now().to_rfc3339();
    let affected = tx.execute(
        "UPDATE runs SET status = 'failed', finished_at = ?1 WHERE status IN ('queued', 'running')",
        params![now],
    )?;
    tx.execute(
        "UPDATE run_tests SET status = 'failed', finished_at = ?1, error_message = ?2
         WHERE status IN ('pending', 'running')
           AND run_id IN (SELECT id FROM runs WHERE finished_at = ?1 AND status = 'failed')",
        params![now, interrupt_message],
    )?;
    Ok(affected)
}

#[cfg(test)]
mod tests {
    use super::*;

    async fn store_with_run(tests: &[NewRunTest]) -> (Store, Uuid) {
        let store = Store::open_in_memory().unwrap();
        let run = store
            .create_run("SIT1", TriggerType::Manual, None, Some("qa@x"), &HashMap::new(), &Value::Null, tests)
            .await
            .unwrap();
        (store, run.id)
    }

    #[tokio::test]
    async fn create_run_sets_total_tests_from_attached_rows() {
        let tests = vec![
            NewRunTest { test_id: Uuid::new_v4(), test_key: "a".into() },
            NewRunTest { test_id: Uuid::new_v4(), test_key: "b".into() },
        ];
        let (store, id) = store_with_run(&tests).await;
        let run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.summary.total_tests, 2);
        assert_eq!(run.status, RunStatus::Queued);
        assert!(run.started_at.is_none());
    }

    #[tokio::test]
    async fn empty_test_list_is_permitted() {
        let (store, id) = store_with_run(&[]).await;
        let with_tests = store.get_run_with_tests(id).await.unwrap().unwrap();
        assert_eq!(with_tests.tests.len(), 0);
        assert_eq!(with_tests.run.summary.total_tests, 0);
    }

    #[tokio::test]
    async fn running_transition_stamps_started_at_once() {
        let (store, id) = store_with_run(&[]).await;
        store.set_run_status(id, RunStatus::Running).await.unwrap();
        let first = store.get_run(id).await.unwrap().unwrap().started_at.unwrap();
        store.set_run_status(id, RunStatus::Running).await.unwrap();
        let second = store.get_run(id).await.unwrap().unwrap().started_at.unwrap();
        assert_eq!(first, second);
    }

    #[tokio::test]
    async fn cancel_is_idempotent() {
        let (store, id) = store_with_run(&[]).await;
        assert!(store.cancel_run(id).await.unwrap());
        assert!(!store.cancel_run(id).await.unwrap());
        assert_eq!(store.get_run(id).await.unwrap().unwrap().status, RunStatus::Cancelled);
    }

    #[tokio::test]
    async fn cancel_on_terminal_run_is_noop() {
        let (store, id) = store_with_run(&[]).await;
        store.set_run_status(id, RunStatus::Passed).await.unwrap();
        assert!(!store.cancel_run(id).await.unwrap());
    }

    #[tokio::test]
    async fn skip_pending_tests_only_touches_pending() {
        let tests = vec![
            NewRunTest { test_id: Uuid::new_v4(), test_key: "a".into() },
            NewRunTest { test_id: Uuid::new_v4(), test_key: "b".into() },
        ];
        let (store, id) = store_with_run(&tests).await;
        store.set_run_test_status(id, "a", RunTestStatus::Passed).await.unwrap();
        let affected = store.skip_pending_tests(id).await.unwrap();
        assert_eq!(affected, 1);
        let tests = store.list_run_tests(id).await.unwrap();
        assert_eq!(tests.iter().find(|t| t.test_key == "a").unwrap().status, RunTestStatus::Passed);
        assert_eq!(tests.iter().find(|t| t.test_key == "b").unwrap().status, RunTestStatus::Skipped);
    }

    #[tokio::test]
    async fn startup_recovery_fails_nonterminal_runs_and_tests() {
        let tests = vec![NewRunTest { test_id: Uuid::new_v4(), test_key: "a".into() }];
        let (store, id) = store_with_run(&tests).await;
        store.set_run_status(id, RunStatus::Running).await.unwrap();
        store.set_run_test_status(id, "a", RunTestStatus::Running).await.unwrap();

        let affected = store.fail_all_nonterminal_runs("Test execution interrupted by server restart").await.unwrap();
        assert_eq!(affected, 1);

        let run = store.get_run(id).await.unwrap().unwrap();
        assert_eq!(run.status, RunStatus::Failed);
        assert!(run.finished_at.is_some());

        let test = store.list_run_tests(id).await.unwrap().remove(0);
        assert_eq!(test.status, RunTestStatus::Failed);
        assert_eq!(test.error_message.as_deref(), Some("Test execution interrupted by server restart"));

        assert!(store.list_nonterminal_runs().await.unwrap().is_empty());
    }
}
