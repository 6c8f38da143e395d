//! Runs sub-tree: create, list, get with tests, cancel, live log polling,
//! live screenshot.

use std::collections::HashMap;

use axum::body::Bytes;
use axum::extract::{Path, Query, State};
use axum::http::{StatusCode, header};
use axum::response::IntoResponse;
use axum::routing::{get, post};
use axum::{Json, Router};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use tracing::warn;
use uuid::Uuid;

use super::{HttpError, HttpResult, SharedState};
use crate::artifact;
use crate::store::runs::NewRunTest;
use crate::store::{Run, RunStatus, RunWithTests, TriggerType};

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", post(create_run).get(list_runs))
        .route("/{run_id}", get(get_run))
        .route("/{run_id}/cancel", post(cancel_run))
        .route("/{run_id}/tests/{test_key}/logs", get(poll_logs))
        .route("/{run_id}/tests/{test_key}/screenshot", get(live_screenshot))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct CreateRunRequest {
    test_keys: Vec<String>,
    environment: String,
    user_email: String,
    #[serde(default)]
    run_overrides: HashMap<String, Value>,
}

async fn create_run(
    State(state): State<SharedState>,
    Json(body): Json<CreateRunRequest>,
) -> HttpResult<super::Created<Run>> {
    if !state.known_environment(&body.environment) {
        return Err(HttpError::Validation(format!("unknown environment {}", body.environment)));
    }
    if !state.access.is_allowed(&body.user_email, &body.environment) {
        return Err(HttpError::Forbidden(format!(
            "User {} does not have access to environment {}",
            body.user_email, body.environment
        )));
    }

    let mut tests = Vec::new();
    for key in &body.test_keys {
        match state.store.get_test_by_key(key).await? {
            Some(def) if def.active => tests.push(NewRunTest { test_id: def.id, test_key: def.test_key }),
            _ => warn!(test_key = %key, "create_run: dropping unknown or inactive test key"),
        }
    }
    if body.test_keys.is_empty() {
        return Err(HttpError::Validation("testKeys must not be empty".to_string()));
    }
    if tests.is_empty() {
        return Err(HttpError::Validation("no requested test keys resolved to active tests".to_string()));
    }

    let metadata = serde_json::json!({ "requestedTestKeys": body.test_keys });
    let run = state
        .store
        .create_run(
            &body.environment,
            TriggerType::Manual,
            None,
            Some(&body.user_email),
            &body.run_overrides,
            &metadata,
            &tests,
        )
        .await?;
    Ok(super::Created(run))
}

#[derive(Debug, Deserialize)]
struct ListQuery {
    status: Option<String>,
    environment: Option<String>,
    #[serde(default = "default_limit")]
    limit: i64,
    #[serde(default)]
    offset: i64,
}

fn default_limit() -> i64 {
    50
}

async fn list_runs(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> HttpResult<Json<Vec<Run>>> {
    let status = match query.status.as_deref() {
        Some(s) => Some(
            RunStatus::parse(s).ok_or_else(|| HttpError::Validation("invalid status filter".to_string()))?,
        ),
        None => None,
    };
    let runs = state.store.list_runs(status, query.environment.as_deref(), query.limit, query.offset).await?;
    Ok(Json(runs))
}

async fn get_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> HttpResult<Json<RunWithTests>> {
    let run = state.store.get_run_with_tests(run_id).await?.ok_or(HttpError::NotFound)?;
    Ok(Json(run))
}

#[derive(Debug, Serialize)]
struct CancelResponse {
    success: bool,
}

async fn cancel_run(
    State(state): State<SharedState>,
    Path(run_id): Path<Uuid>,
) -> HttpResult<Json<CancelResponse>> {
    let run = state.store.get_run(run_id).await?.ok_or(HttpError::NotFound)?;
    if run.status.is_terminal() {
        return Err(HttpError::Validation("cannot cancel a run that has already finished".to_string()));
    }
    let success = state.store.cancel_run(run_id).await?;
    Ok(Json(CancelResponse { success }))
}

#[derive(Debug, Deserialize)]
struct LogQuery {
    #[serde(default)]
    offset: u64,
}

#[derive(Debug, Serialize)]
struct LogResponse {
    content: String,
    offset: u64,
    finished: bool,
}

async fn poll_logs(
    State(state): State<SharedState>,
    Path((run_id, test_key)): Path<(Uuid, String)>,
    Query(query): Query<LogQuery>,
) -> HttpResult<Json<LogResponse>> {
    let tests = state.store.list_run_tests(run_id).await?;
    let test = tests.iter().find(|t| t.test_key == test_key).ok_or(HttpError::NotFound)?;
    let finished = test.status.is_finished();

    let path = artifact::resolve_artifact_path(&state.artifact_root, run_id, &test_key, artifact::CONSOLE_LOG)
        .map_err(|e| HttpError::Validation(e.to_string()))?;

    let bytes = match tokio::fs::read(&path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Ok(Json(LogResponse { content: String::new(), offset: query.offset, finished }));
        }
        Err(e) => return Err(HttpError::Internal(e.to_string())),
    };

    let offset = query.offset.min(bytes.len() as u64) as usize;
    let content = String::from_utf8_lossy(&bytes[offset..]).into_owned();
    let new_offset = bytes.len() as u64;

    Ok(Json(LogResponse { content, offset: new_offset, finished }))
}

async fn live_screenshot(
    State(state): State<SharedState>,
    Path((run_id, test_key)): Path<(Uuid, String)>,
) -> HttpResult<impl IntoResponse> {
    let path = artifact::resolve_artifact_path(
        &state.artifact_root,
        run_id,
        &test_key,
        artifact::LIVE_SCREENSHOT,
    )
    .map_err(|e| HttpError::Validation(e.to_string()))?;

    match tokio::fs::read(&path).await {
        Ok(bytes) => Ok((StatusCode::OK, [(header::CONTENT_TYPE, "image/jpeg")], Bytes::from(bytes))),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Err(HttpError::NotFound),
        Err(e) => Err(HttpError::Internal(e.to_string())),
    }
}
