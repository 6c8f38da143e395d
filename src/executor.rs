//! Drives one run end to end: sequential per-test subprocess execution,
//! stdio capture, and artifact bookkeeping.
//!
//! The subprocess bridge generalizes the teacher's local-sandbox
//! `exec_stream` pattern (`tokio::process::Command`, piped stdio,
//! line-buffered reads) from "run inside a sandbox abstraction" to "run the
//! external browser-test driver directly" — there is no sandbox pool here,
//! just one child process per test.

use std::collections::HashMap;
use std::path::Path;
use std::process::Stdio;
use std::time::Instant;

use chrono::Utc;
use serde_json::Value;
use thiserror::Error;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tracing::{info, warn};
use uuid::Uuid;

use crate::artifact;
use crate::store::{ConstantSet, RunStatus, RunSummary, RunTest, RunTestArtifacts, RunTestStatus, Store, StoreError};

#[derive(Debug, Error)]
pub enum ExecutorError {
    #[error("store error: {0}")]
    Store(#[from] StoreError),
    #[error("run {0} not found")]
    RunNotFound(Uuid),
}

/// Where the driver binary lives and how it's invoked.
#[derive(Debug, Clone)]
pub struct DriverConfig {
    pub driver_path: String,
    pub deploy_root: std::path::PathBuf,
    pub config_env_var: String,
}

/// Computes the effective configuration: an ordered, shallow, left-to-right
/// merge where later sources fully replace matching top-level keys.
pub fn effective_config(
    env_code: &str,
    test_constants: &ConstantSet,
    test_overrides: Option<&ConstantSet>,
    run_overrides: &HashMap<String, Value>,
) -> HashMap<String, Value> {
    let mut merged = HashMap::new();
    merged.insert("envCode".to_string(), Value::String(env_code.to_string()));

    let layer = |merged: &mut HashMap<String, Value>, set: &ConstantSet| {
        for (k, v) in &set.shared {
            merged.insert(k.clone(), v.clone());
        }
        if let Some(env_specific) = set.environments.get(env_code) {
            for (k, v) in env_specific {
                merged.insert(k.clone(), v.clone());
            }
        }
    };

    layer(&mut merged, test_constants);
    if let Some(overrides) = test_overrides {
        layer(&mut merged, overrides);
    }
    for (k, v) in run_overrides {
        merged.insert(k.clone(), v.clone());
    }

    merged
}

/// Drives `run_id` to completion: transitions it to `running`, executes its
/// tests sequentially in `test_key` order, and persists the final summary
/// and status.
pub async fn run_queued(
    store: &Store,
    driver: &DriverConfig,
    artifact_root: &Path,
    run_id: Uuid,
) -> Result<(), ExecutorError> {
    let run = store.get_run(run_id).await?.ok_or(ExecutorError::RunNotFound(run_id))?;
    store.set_run_status(run_id, RunStatus::Running).await?;
    tokio::fs::create_dir_all(artifact::run_dir(artifact_root, run_id))
        .await
        .map_err(|e| warn!(error = %e, "failed to create run artifact directory"))
        .ok();

    let run_started = Instant::now();
    let tests = store.list_run_tests(run_id).await?;

    let mut passed = 0usize;
    let mut failed = 0usize;
    let mut skipped = 0usize;

    for test in &tests {
        let current = store.get_run(run_id).await?.ok_or(ExecutorError::RunNotFound(run_id))?;
        if current.status == RunStatus::Cancelled {
            skipped += store.skip_pending_tests(run_id).await?;
            break;
        }

        match run_one_test(store, driver, artifact_root, &run, test).await {
            Ok(RunTestStatus::Passed) => passed += 1,
            Ok(RunTestStatus::Failed) => failed += 1,
            Ok(RunTestStatus::Skipped) => skipped += 1,
            Ok(_) => {}
            Err(err) => {
                warn!(test_key = %test.test_key, error = %err, "uncaught error executing test");
                failed += 1;
            }
        }
    }

    let summary = RunSummary {
        total_tests: tests.len(),
        passed,
        failed,
        skipped,
        duration_ms: Some(run_started.elapsed().as_millis() as i64),
    };
    store.set_run_summary(run_id, &summary).await?;

    let final_status = if failed > 0 { RunStatus::Failed } else { RunStatus::Passed };
    // A run cancelled mid-loop keeps its `cancelled` status even though the
    // remaining tests were just marked skipped above.
    let current = store.get_run(run_id).await?.ok_or(ExecutorError::RunNotFound(run_id))?;
    if current.status != RunStatus::Cancelled {
        store.set_run_status(run_id, final_status).await?;
    }

    info!(run_id = %run_id, passed, failed, skipped, "run finished");
    Ok(())
}

async fn run_one_test(
    store: &Store,
    driver: &DriverConfig,
    artifact_root: &Path,
    run: &crate::store::Run,
    test: &RunTest,
) -> Result<RunTestStatus, ExecutorError> {
    let Some(definition) = store.get_test_by_key(&test.test_key).await? else {
        store
            .finish_run_test(
                run.id,
                &test.test_key,
                RunTestStatus::Skipped,
                0,
                Some("Test definition not found"),
                &RunTestArtifacts::default(),
            )
            .await?;
        return Ok(RunTestStatus::Skipped);
    };

    let dir = match artifact::ensure_test_dir(artifact_root, run.id, &test.test_key).await {
        Ok(dir) => dir,
        Err(err) => {
            warn!(test_key = %test.test_key, error = %err, "failed to create test artifact directory");
            store
                .finish_run_test(
                    run.id,
                    &test.test_key,
                    RunTestStatus::Failed,
                    0,
                    Some(&err.to_string()),
                    &RunTestArtifacts::default(),
                )
                .await?;
            return Ok(RunTestStatus::Failed);
        }
    };

    let header = format!("[{}] environment={}\n", Utc::now().to_rfc3339(), run.environment);
    artifact::seed_console_log(&dir, &header).await.ok();

    store.set_run_test_status(run.id, &test.test_key, RunTestStatus::Running).await?;
    let started = Instant::now();

    let config = effective_config(
        &run.environment,
        &definition.constants,
        definition.overrides.as_ref(),
        &run.run_overrides,
    );

    let outcome = spawn_driver(driver, &config, &definition.spec_path, &dir).await;
    let duration_ms = started.elapsed().as_millis() as i64;

    let video = artifact::locate_and_normalize_video(&dir).await.unwrap_or(None);
    artifact::delete_live_screenshot(&dir).await.ok();

    let artifacts = RunTestArtifacts {
        console_log: Some(artifact::CONSOLE_LOG.to_string()),
        video,
        trace: None,
    };

    let (status, error_message) = match outcome {
        Ok(0) => (RunTestStatus::Passed, None),
        Ok(_) => (RunTestStatus::Failed, Some(tail_error_message(&dir).await)),
        Err(err) => (RunTestStatus::Failed, Some(err)),
    };

    store
        .finish_run_test(run.id, &test.test_key, status, duration_ms, error_message.as_deref(), &artifacts)
        .await?;

    Ok(status)
}

/// Spawns the driver, tees stdout/stderr to `console.log`, and returns the
/// exit code (or an error message on spawn failure).
async fn spawn_driver(
    driver: &DriverConfig,
    config: &HashMap<String, Value>,
    spec_path: &str,
    artifact_dir: &Path,
) -> Result<i32, String> {
    let config_json = serde_json::to_string(config).map_err(|e| e.to_string())?;

    let mut command = Command::new(&driver.driver_path);
    command
        .arg(spec_path)
        .env(&driver.config_env_var, config_json)
        .current_dir(&driver.deploy_root)
        .stdout(Stdio::piped())
        .stderr(Stdio::piped());

    let mut child = command.spawn().map_err(|e| format!("failed to spawn driver: {e}"))?;

    let stdout = child.stdout.take().expect("stdout piped");
    let stderr = child.stderr.take().expect("stderr piped");

    let log_path = artifact_dir.join(artifact::CONSOLE_LOG);
    let stdout_task = tee_lines(stdout, log_path.clone());
    let stderr_task = tee_lines(stderr, log_path);

    let (_stdout_res, _stderr_res, wait_res) =
        tokio::join!(stdout_task, stderr_task, child.wait());

    match wait_res {
        Ok(status) => Ok(status.code().unwrap_or(-1)),
        Err(e) => Err(format!("failed to wait on driver process: {e}")),
    }
}

async fn tee_lines(reader: impl tokio::io::AsyncRead + Unpin, log_path: std::path::PathBuf) {
    let mut lines = BufReader::new(reader).lines();
    while let Ok(Some(line)) = lines.next_line().await {
        if let Ok(mut file) = tokio::fs::OpenOptions::new().append(true).open(&log_path).await {
            let _ = file.write_all(line.as_bytes()).await;
            let _ = file.write_all(b"\n").await;
        }
    }
}

/// Tail of stderr, else stdout, else a synthesized message — read back from
/// the already-written `console.log` since stdout/stderr are interleaved
/// there by arrival order, not separated streams.
async fn tail_error_message(dir: &Path) -> String {
    let path = dir.join(artifact::CONSOLE_LOG);
    match tokio::fs::read_to_string(&path).await {
        Ok(content) => {
            let tail: String = content.lines().rev().take(5).collect::<Vec<_>>().into_iter().rev().collect::<Vec<_>>().join("\n");
            if tail.trim().is_empty() { "Test driver exited with a non-zero status".to_string() } else { tail }
        }
        Err(_) => "Test driver exited with a non-zero status".to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn constants(shared: &[(&str, Value)], env: &str, env_vals: &[(&str, Value)]) -> ConstantSet {
        let mut set = ConstantSet::default();
        set.shared = shared.iter().map(|(k, v)| (k.to_string(), v.clone())).collect();
        set.environments
            .insert(env.to_string(), env_vals.iter().map(|(k, v)| (k.to_string(), v.clone())).collect());
        set
    }

    #[test]
    fn merge_order_later_sources_win() {
        let test_constants = constants(&[("timeout", json!(10))], "SIT1", &[("timeout", json!(20))]);
        let overrides = constants(&[("timeout", json!(30))], "SIT1", &[("timeout", json!(40))]);
        let mut run_overrides = HashMap::new();
        run_overrides.insert("timeout".to_string(), json!(50));

        let merged = effective_config("SIT1", &test_constants, Some(&overrides), &run_overrides);
        assert_eq!(merged.get("timeout"), Some(&json!(50)));
        assert_eq!(merged.get("envCode"), Some(&json!("SIT1")));
    }

    #[test]
    fn merge_without_override_layer_stops_at_test_environment_constants() {
        let test_constants = constants(&[("timeout", json!(10))], "SIT1", &[("timeout", json!(20))]);
        let merged = effective_config("SIT1", &test_constants, None, &HashMap::new());
        assert_eq!(merged.get("timeout"), Some(&json!(20)));
    }

    #[test]
    fn merge_only_applies_matching_environment_map() {
        let test_constants = constants(&[("timeout", json!(10))], "SIT2", &[("timeout", json!(999))]);
        let merged = effective_config("SIT1", &test_constants, None, &HashMap::new());
        assert_eq!(merged.get("timeout"), Some(&json!(10)));
    }

    #[tokio::test]
    async fn missing_test_definition_is_skipped_with_message() {
        let store = Store::open_in_memory().unwrap();
        let run = store
            .create_run(
                "SIT1",
                crate::store::TriggerType::Manual,
                None,
                Some("qa@x"),
                &HashMap::new(),
                &Value::Null,
                &[crate::store::runs::NewRunTest { test_id: Uuid::new_v4(), test_key: "ghost".into() }],
            )
            .await
            .unwrap();
        let test = store.list_run_tests(run.id).await.unwrap().remove(0);

        let status = run_one_test(
            &store,
            &DriverConfig {
                driver_path: "/bin/true".into(),
                deploy_root: std::env::temp_dir(),
                config_env_var: "TESTBAY_CONFIG".into(),
            },
            &std::env::temp_dir(),
            &run,
            &test,
        )
        .await
        .unwrap();

        assert_eq!(status, RunTestStatus::Skipped);
        let updated = store.list_run_tests(run.id).await.unwrap().remove(0);
        assert_eq!(updated.error_message.as_deref(), Some("Test definition not found"));
    }
}
