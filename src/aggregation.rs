//! Read-only dashboard queries: pass rate, flakiness, environment health,
//! per-test trends. Rounding and zero-divisor rules are implemented as
//! small free functions, unit-tested in isolation the way the teacher tests
//! `expand_env_value` in `config.rs`.

use std::collections::HashMap;

use chrono::{DateTime, Duration, Utc};
use rusqlite::{OptionalExtension, params};
use serde::Serialize;

use crate::store::{Store, StoreError};

pub type AggregationResult<T> = Result<T, StoreError>;

/// Rounds to one decimal place using half-up rounding (never banker's
/// rounding), and returns `0.0` for a zero divisor rather than `NaN`.
pub fn percentage(numerator: f64, denominator: f64) -> f64 {
    if denominator == 0.0 {
        return 0.0;
    }
    let raw = numerator / denominator * 100.0;
    (raw * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct RunProgress {
    pub run_id: String,
    pub completed: i64,
    pub total: i64,
}

#[derive(Debug, Clone, Default, Serialize)]
pub struct ActiveRuns {
    pub running: i64,
    pub queued: i64,
    pub progress: Vec<RunProgress>,
}

/// Counts of `running`/`queued` runs, plus per-running-run `(completed,
/// total)` progress. `startedAt` is deliberately never surfaced here for
/// `queued` rows — progress is only reported for `running` runs.
pub async fn active_runs(store: &Store) -> AggregationResult<ActiveRuns> {
    let conn = store.lock().await;
    let running: i64 =
        conn.query_row("SELECT COUNT(*) FROM runs WHERE status = 'running'", [], |r| r.get(0))?;
    let queued: i64 =
        conn.query_row("SELECT COUNT(*) FROM runs WHERE status = 'queued'", [], |r| r.get(0))?;

    let mut stmt = conn.prepare(
        "SELECT r.id,
                (SELECT COUNT(*) FROM run_tests t WHERE t.run_id = r.id AND t.status IN ('passed','failed','skipped')),
                (SELECT COUNT(*) FROM run_tests t WHERE t.run_id = r.id)
         FROM runs r WHERE r.status = 'running'",
    )?;
    let progress = stmt
        .query_map([], |row| {
            Ok(RunProgress { run_id: row.get(0)?, completed: row.get(1)?, total: row.get(2)? })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    Ok(ActiveRuns { running, queued, progress })
}

#[derive(Debug, Clone, Serialize)]
pub struct PassRate {
    pub percentage: f64,
    pub trend: f64,
}

/// Pass rate over `run_tests` finished within `[now - days, now)`,
/// restricted to terminal pass/fail outcomes; trend compares against the
/// immediately preceding window of the same width.
pub async fn pass_rate(store: &Store, environment: Option<&str>, days: i64) -> AggregationResult<PassRate> {
    let now = Utc::now();
    let window_start = now - Duration::days(days);
    let prev_start = window_start - Duration::days(days);

    let current = pass_fail_counts(store, environment, window_start, now).await?;
    let previous = pass_fail_counts(store, environment, prev_start, window_start).await?;

    let current_pct = percentage(current.0 as f64, (current.0 + current.1) as f64);
    let previous_pct = percentage(previous.0 as f64, (previous.0 + previous.1) as f64);

    Ok(PassRate { percentage: current_pct, trend: round1(current_pct - previous_pct) })
}

async fn pass_fail_counts(
    store: &Store,
    environment: Option<&str>,
    from: DateTime<Utc>,
    to: DateTime<Utc>,
) -> AggregationResult<(i64, i64)> {
    let conn = store.lock().await;
    let mut sql = String::from(
        "SELECT t.status, COUNT(*) FROM run_tests t
         JOIN runs r ON r.id = t.run_id
         WHERE r.finished_at IS NOT NULL AND r.finished_at >= ?1 AND r.finished_at < ?2
           AND t.status IN ('passed', 'failed')",
    );
    let mut bind: Vec<Box<dyn rusqlite::ToSql>> =
        vec![Box::new(from.to_rfc3339()), Box::new(to.to_rfc3339())];
    if let Some(env) = environment {
        sql.push_str(" AND r.environment = ?3");
        bind.push(Box::new(env.to_string()));
    }
    sql.push_str(" GROUP BY t.status");

    let mut stmt = conn.prepare(&sql)?;
    let refs: Vec<&dyn rusqlite::ToSql> = bind.iter().map(|b| b.as_ref()).collect();
    let rows = stmt.query_map(refs.as_slice(), |row| {
        Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
    })?;

    let mut passed = 0;
    let mut failed = 0;
    for row in rows {
        let (status, count) = row?;
        match status.as_str() {
            "passed" => passed = count,
            "failed" => failed = count,
            _ => {}
        }
    }
    Ok((passed, failed))
}

#[derive(Debug, Clone, Serialize)]
pub struct TotalExecutions {
    pub by_environment: HashMap<String, i64>,
    pub trend: i64,
}

pub async fn total_executions(store: &Store, days: i64) -> AggregationResult<TotalExecutions> {
    let now = Utc::now();
    let window_start = now - Duration::days(days);
    let prev_start = window_start - Duration::days(days);

    let conn = store.lock().await;
    let by_environment = {
        let mut stmt = conn.prepare(
            "SELECT environment, COUNT(*) FROM runs WHERE created_at >= ?1 AND created_at < ?2 GROUP BY environment",
        )?;
        let rows = stmt.query_map(params![window_start.to_rfc3339(), now.to_rfc3339()], |row| {
            Ok((row.get::<_, String>(0)?, row.get::<_, i64>(1)?))
        })?;
        rows.collect::<Result<HashMap<_, _>, _>>()?
    };

    let current_total: i64 = by_environment.values().sum();
    let previous_total: i64 = conn.query_row(
        "SELECT COUNT(*) FROM runs WHERE created_at >= ?1 AND created_at < ?2",
        params![prev_start.to_rfc3339(), window_start.to_rfc3339()],
        |r| r.get(0),
    )?;

    Ok(TotalExecutions { by_environment, trend: current_total - previous_total })
}

#[derive(Debug, Clone, Serialize)]
pub struct LastFailure {
    pub run_id: String,
    pub finished_at: DateTime<Utc>,
    pub environment: String,
    pub error_message: Option<String>,
}

#[derive(Debug, Clone, Serialize)]
pub struct FlakyTest {
    pub test_key: String,
    pub flakiness_score: f64,
    pub critical: bool,
    pub total_executions: i64,
    pub passed: i64,
    pub failed: i64,
    pub recent_outcomes: Vec<String>,
    pub failing_environments: Vec<String>,
    pub last_failure: Option<LastFailure>,
}

const FLAKY_MIN_RATE: f64 = 0.10;
const FLAKY_MAX_RATE: f64 = 0.90;
const FLAKY_CRITICAL_RATE: f64 = 0.30;

/// Test-key-level flakiness over the window: requires `total >=
/// min_executions`, both outcomes present, and failure rate in `[10%, 90%]`
/// inclusive. Score is the failure rate; "critical" at `>= 30%`.
pub async fn flaky_tests(store: &Store, days: i64, min_executions: i64) -> AggregationResult<Vec<FlakyTest>> {
    let now = Utc::now();
    let window_start = now - Duration::days(days);

    let conn = store.lock().await;
    let mut stmt = conn.prepare(
        "SELECT t.test_key,
                COUNT(*) AS total,
                SUM(CASE WHEN t.status = 'passed' THEN 1 ELSE 0 END) AS passed,
                SUM(CASE WHEN t.status = 'failed' THEN 1 ELSE 0 END) AS failed
         FROM run_tests t
         JOIN runs r ON r.id = t.run_id
         WHERE r.finished_at IS NOT NULL AND r.finished_at >= ?1
           AND t.status IN ('passed', 'failed')
         GROUP BY t.test_key
         HAVING total >= ?2",
    )?;

    let rows = stmt.query_map(params![window_start.to_rfc3339(), min_executions], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, i64>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (test_key, total, passed, failed) = row?;
        if passed == 0 || failed == 0 {
            continue;
        }
        let rate = failed as f64 / total as f64;
        if rate < FLAKY_MIN_RATE || rate > FLAKY_MAX_RATE {
            continue;
        }

        let recent_outcomes = recent_outcomes(&conn, &test_key, 10)?;
        let failing_environments = failing_environments(&conn, &test_key, window_start)?;
        let last_failure = last_failure(&conn, &test_key)?;

        out.push(FlakyTest {
            test_key,
            flakiness_score: round1(rate * 100.0),
            critical: rate >= FLAKY_CRITICAL_RATE,
            total_executions: total,
            passed,
            failed,
            recent_outcomes,
            failing_environments,
            last_failure,
        });
    }

    Ok(out)
}

fn recent_outcomes(conn: &rusqlite::Connection, test_key: &str, limit: i64) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT t.status FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND t.status IN ('passed', 'failed')
         ORDER BY r.finished_at DESC LIMIT ?2",
    )?;
    let rows = stmt.query_map(params![test_key, limit], |r| r.get::<_, String>(0))?;
    rows.collect()
}

fn last_failure(conn: &rusqlite::Connection, test_key: &str) -> rusqlite::Result<Option<LastFailure>> {
    conn.query_row(
        "SELECT r.id, r.finished_at, r.environment, t.error_message
         FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND t.status = 'failed' AND r.finished_at IS NOT NULL
         ORDER BY r.finished_at DESC LIMIT 1",
        params![test_key],
        |row| {
            let finished_at: String = row.get(1)?;
            Ok(LastFailure {
                run_id: row.get(0)?,
                finished_at: finished_at.parse().unwrap_or_else(|_| Utc::now()),
                environment: row.get(2)?,
                error_message: row.get(3)?,
            })
        },
    )
    .optional()
}

fn failing_environments(
    conn: &rusqlite::Connection,
    test_key: &str,
    since: DateTime<Utc>,
) -> rusqlite::Result<Vec<String>> {
    let mut stmt = conn.prepare(
        "SELECT DISTINCT r.environment FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND t.status = 'failed' AND r.finished_at >= ?2",
    )?;
    let rows = stmt.query_map(params![test_key, since.to_rfc3339()], |r| r.get::<_, String>(0))?;
    rows.collect()
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
}

#[derive(Debug, Clone, Serialize)]
pub struct LatestRun {
    pub run_id: String,
    pub status: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct EnvironmentHealth {
    pub environment: String,
    pub total_runs: i64,
    pub passed_runs: i64,
    pub pass_rate: f64,
    pub mean_duration_ms: f64,
    pub runs_last_24h: i64,
    pub latest_finished_run: Option<LatestRun>,
    pub status: HealthStatus,
}

pub async fn environment_health(store: &Store, days: i64) -> AggregationResult<Vec<EnvironmentHealth>> {
    let now = Utc::now();
    let window_start = now - Duration::days(days);
    let day_ago = now - Duration::hours(24);

    let conn = store.lock().await;
    let mut stmt = conn.prepare(
        "SELECT environment, COUNT(*),
                SUM(CASE WHEN status = 'passed' THEN 1 ELSE 0 END),
                AVG(CASE WHEN started_at IS NOT NULL AND finished_at IS NOT NULL
                         THEN (julianday(finished_at) - julianday(started_at)) * 86400000.0 END)
         FROM runs
         WHERE created_at >= ?1 AND status IN ('passed','failed','cancelled')
         GROUP BY environment",
    )?;
    let rows = stmt.query_map(params![window_start.to_rfc3339()], |row| {
        Ok((
            row.get::<_, String>(0)?,
            row.get::<_, i64>(1)?,
            row.get::<_, i64>(2)?,
            row.get::<_, Option<f64>>(3)?,
        ))
    })?;

    let mut out = Vec::new();
    for row in rows {
        let (environment, total_runs, passed_runs, mean_duration_ms) = row?;
        let runs_last_24h: i64 = conn.query_row(
            "SELECT COUNT(*) FROM runs WHERE environment = ?1 AND created_at >= ?2",
            params![environment, day_ago.to_rfc3339()],
            |r| r.get(0),
        )?;
        let latest_finished_run = conn
            .query_row(
                "SELECT id, status, finished_at FROM runs
                 WHERE environment = ?1 AND status IN ('passed','failed','cancelled')
                 ORDER BY finished_at DESC LIMIT 1",
                params![environment],
                |row| {
                    let finished_at: String = row.get(2)?;
                    Ok(LatestRun {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        finished_at: finished_at.parse().unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()?;
        let pass_rate = percentage(passed_runs as f64, total_runs as f64);
        let status = if pass_rate < 70.0 || runs_last_24h == 0 {
            HealthStatus::Critical
        } else if pass_rate < 90.0 || runs_last_24h < 2 {
            HealthStatus::Warning
        } else {
            HealthStatus::Healthy
        };

        out.push(EnvironmentHealth {
            environment,
            total_runs,
            passed_runs,
            pass_rate,
            mean_duration_ms: mean_duration_ms.unwrap_or(0.0),
            runs_last_24h,
            latest_finished_run,
            status,
        });
    }

    Ok(out)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Trend {
    Up,
    Down,
    Stable,
}

/// `up` if `current - previous > 5`, `down` if `< -5`, else `stable`.
pub fn trend_direction(current_pct: f64, previous_pct: f64) -> Trend {
    let delta = current_pct - previous_pct;
    if delta > 5.0 {
        Trend::Up
    } else if delta < -5.0 {
        Trend::Down
    } else {
        Trend::Stable
    }
}

fn round1(value: f64) -> f64 {
    (value * 10.0).round() / 10.0
}

#[derive(Debug, Clone, Serialize)]
pub struct TestEnvironmentBreakdown {
    pub environment: String,
    pub total_executions: i64,
    pub passed: i64,
    pub failed: i64,
    pub pass_rate: f64,
    pub last_run: Option<LatestRun>,
}

#[derive(Debug, Clone, Serialize)]
pub struct RecentRun {
    pub run_id: String,
    pub environment: String,
    pub status: String,
    pub finished_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize)]
pub struct TestStats {
    pub test_key: String,
    pub total_executions: i64,
    pub passed: i64,
    pub failed: i64,
    pub pass_rate: f64,
    pub mean_duration_ms: f64,
    pub by_environment: Vec<TestEnvironmentBreakdown>,
    pub recent_runs: Vec<RecentRun>,
    pub trend: Trend,
}

/// Per-test stats over the window: overall totals, pass rate, and mean
/// duration; a per-environment breakdown each carrying its own last-run
/// snapshot; the last 10 completed runs regardless of environment; and
/// trend direction against the preceding window of the same width.
/// Returns `None` if the test has no completed executions in the window.
pub async fn test_stats(store: &Store, test_key: &str, days: i64) -> AggregationResult<Option<TestStats>> {
    let now = Utc::now();
    let window_start = now - Duration::days(days);
    let prev_start = window_start - Duration::days(days);

    let conn = store.lock().await;

    let (total_executions, passed, failed, mean_duration_ms): (i64, i64, i64, Option<f64>) = conn.query_row(
        "SELECT COUNT(*),
                SUM(CASE WHEN t.status = 'passed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN t.status = 'failed' THEN 1 ELSE 0 END),
                AVG(CASE WHEN t.started_at IS NOT NULL AND t.finished_at IS NOT NULL
                         THEN (julianday(t.finished_at) - julianday(t.started_at)) * 86400000.0 END)
         FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND r.finished_at IS NOT NULL AND r.finished_at >= ?2
           AND t.status IN ('passed', 'failed')",
        params![test_key, window_start.to_rfc3339()],
        |row| {
            Ok((
                row.get(0)?,
                row.get::<_, Option<i64>>(1)?.unwrap_or(0),
                row.get::<_, Option<i64>>(2)?.unwrap_or(0),
                row.get(3)?,
            ))
        },
    )?;

    if total_executions == 0 {
        return Ok(None);
    }

    let pass_rate = percentage(passed as f64, total_executions as f64);

    let mut env_stmt = conn.prepare(
        "SELECT r.environment, COUNT(*),
                SUM(CASE WHEN t.status = 'passed' THEN 1 ELSE 0 END),
                SUM(CASE WHEN t.status = 'failed' THEN 1 ELSE 0 END)
         FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND r.finished_at IS NOT NULL AND r.finished_at >= ?2
           AND t.status IN ('passed', 'failed')
         GROUP BY r.environment",
    )?;
    let env_rows = env_stmt
        .query_map(params![test_key, window_start.to_rfc3339()], |row| {
            Ok((
                row.get::<_, String>(0)?,
                row.get::<_, i64>(1)?,
                row.get::<_, i64>(2)?,
                row.get::<_, i64>(3)?,
            ))
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let mut by_environment = Vec::new();
    for (environment, total, env_passed, env_failed) in env_rows {
        let last_run = conn
            .query_row(
                "SELECT r.id, r.status, r.finished_at FROM run_tests t JOIN runs r ON r.id = t.run_id
                 WHERE t.test_key = ?1 AND r.environment = ?2 AND r.finished_at IS NOT NULL
                 ORDER BY r.finished_at DESC LIMIT 1",
                params![test_key, environment],
                |row| {
                    let finished_at: String = row.get(2)?;
                    Ok(LatestRun {
                        run_id: row.get(0)?,
                        status: row.get(1)?,
                        finished_at: finished_at.parse().unwrap_or_else(|_| Utc::now()),
                    })
                },
            )
            .optional()?;

        by_environment.push(TestEnvironmentBreakdown {
            environment,
            total_executions: total,
            passed: env_passed,
            failed: env_failed,
            pass_rate: percentage(env_passed as f64, total as f64),
            last_run,
        });
    }

    let mut recent_stmt = conn.prepare(
        "SELECT r.id, r.environment, t.status, r.finished_at
         FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND r.finished_at IS NOT NULL
         ORDER BY r.finished_at DESC LIMIT 10",
    )?;
    let recent_runs = recent_stmt
        .query_map(params![test_key], |row| {
            let finished_at: String = row.get(3)?;
            Ok(RecentRun {
                run_id: row.get(0)?,
                environment: row.get(1)?,
                status: row.get(2)?,
                finished_at: finished_at.parse().unwrap_or_else(|_| Utc::now()),
            })
        })?
        .collect::<Result<Vec<_>, _>>()?;

    let (previous_passed, previous_total): (i64, i64) = conn.query_row(
        "SELECT SUM(CASE WHEN t.status = 'passed' THEN 1 ELSE 0 END), COUNT(*)
         FROM run_tests t JOIN runs r ON r.id = t.run_id
         WHERE t.test_key = ?1 AND r.finished_at IS NOT NULL AND r.finished_at >= ?2 AND r.finished_at < ?3
           AND t.status IN ('passed', 'failed')",
        params![test_key, prev_start.to_rfc3339(), window_start.to_rfc3339()],
        |row| Ok((row.get::<_, Option<i64>>(0)?.unwrap_or(0), row.get(1)?)),
    )?;
    let previous_pct = percentage(previous_passed as f64, previous_total as f64);
    let trend = trend_direction(pass_rate, previous_pct);

    Ok(Some(TestStats {
        test_key: test_key.to_string(),
        total_executions,
        passed,
        failed,
        pass_rate,
        mean_duration_ms: mean_duration_ms.unwrap_or(0.0),
        by_environment,
        recent_runs,
        trend,
    }))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn percentage_zero_divisor_is_zero_not_nan() {
        assert_eq!(percentage(0.0, 0.0), 0.0);
    }

    #[test]
    fn percentage_rounds_half_up_at_one_decimal() {
        assert_eq!(percentage(8.0, 12.0), 66.7);
        assert_eq!(percentage(1.0, 3.0), 33.3);
    }

    #[test]
    fn trend_thresholds_are_exclusive_at_five() {
        assert_eq!(trend_direction(60.0, 55.0), Trend::Stable);
        assert_eq!(trend_direction(60.1, 55.0), Trend::Up);
        assert_eq!(trend_direction(50.0, 55.1), Trend::Down);
    }

    #[tokio::test]
    async fn active_runs_never_surfaces_started_at_for_queued() {
        let store = Store::open_in_memory().unwrap();
        store
            .create_run(
                "SIT1",
                crate::store::TriggerType::Manual,
                None,
                None,
                &HashMap::new(),
                &serde_json::Value::Null,
                &[],
            )
            .await
            .unwrap();
        let active = active_runs(&store).await.unwrap();
        assert_eq!(active.queued, 1);
        assert_eq!(active.running, 0);
        assert!(active.progress.is_empty());
    }

    #[tokio::test]
    async fn test_stats_returns_none_without_completed_executions() {
        let store = Store::open_in_memory().unwrap();
        assert!(test_stats(&store, "auth.login", 30).await.unwrap().is_none());
    }
}
