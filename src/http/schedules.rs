//! Schedules sub-tree: full CRUD, validating environment access and basic
//! cron shape.

use std::collections::HashMap;

use axum::extract::{Path, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::{Created, HttpError, HttpResult, SharedState};
use crate::store::{Schedule, Selector};

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(list_schedules).post(create_schedule))
        .route("/{schedule_id}", put(update_schedule).delete(delete_schedule))
        .with_state(state)
}

/// 5 or 6 whitespace-separated fields, per the core's basic cron-shape
/// validation (full cron-grammar validation happens lazily when the
/// scheduler evaluates the expression).
fn validate_cron_shape(expr: &str) -> HttpResult<()> {
    let fields = expr.split_whitespace().count();
    if (5..=6).contains(&fields) {
        Ok(())
    } else {
        Err(HttpError::Validation(format!("cron expression must have 5 or 6 fields, got {fields}")))
    }
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ScheduleRequest {
    name: String,
    cron: String,
    environment: String,
    selector: Selector,
    #[serde(default)]
    default_run_overrides: Option<HashMap<String, Value>>,
    user_email: String,
}

async fn list_schedules(State(state): State<SharedState>) -> HttpResult<Json<Vec<Schedule>>> {
    Ok(Json(state.store.list_schedules(false).await?))
}

async fn create_schedule(
    State(state): State<SharedState>,
    Json(body): Json<ScheduleRequest>,
) -> HttpResult<Created<Schedule>> {
    validate_cron_shape(&body.cron)?;
    if !state.known_environment(&body.environment) {
        return Err(HttpError::Validation(format!("unknown environment {}", body.environment)));
    }
    if !state.access.is_allowed(&body.user_email, &body.environment) {
        return Err(HttpError::Forbidden(format!(
            "User {} does not have access to environment {}",
            body.user_email, body.environment
        )));
    }

    let schedule = state
        .store
        .create_schedule(
            &body.name,
            &body.cron,
            &body.environment,
            &body.selector,
            body.default_run_overrides.as_ref(),
            &body.user_email,
        )
        .await?;
    Ok(Created(schedule))
}

#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
struct UpdateScheduleRequest {
    name: String,
    cron: String,
    enabled: bool,
    environment: String,
    selector: Selector,
    #[serde(default)]
    default_run_overrides: Option<HashMap<String, Value>>,
    user_email: String,
}

async fn update_schedule(
    State(state): State<SharedState>,
    Path(schedule_id): Path<Uuid>,
    Json(body): Json<UpdateScheduleRequest>,
) -> HttpResult<Json<Schedule>> {
    validate_cron_shape(&body.cron)?;
    if !state.known_environment(&body.environment) {
        return Err(HttpError::Validation(format!("unknown environment {}", body.environment)));
    }
    if !state.access.is_allowed(&body.user_email, &body.environment) {
        return Err(HttpError::Forbidden(format!(
            "User {} does not have access to environment {}",
            body.user_email, body.environment
        )));
    }

    let schedule = state
        .store
        .update_schedule(
            schedule_id,
            &body.name,
            &body.cron,
            body.enabled,
            &body.environment,
            &body.selector,
            body.default_run_overrides.as_ref(),
            &body.user_email,
        )
        .await?;
    Ok(Json(schedule))
}

async fn delete_schedule(State(state): State<SharedState>, Path(schedule_id): Path<Uuid>) -> HttpResult<()> {
    state.store.delete_schedule(schedule_id).await?;
    Ok(())
}
