//! Dashboard sub-tree: the read-only aggregation views.

use axum::extract::{Path, Query, State};
use axum::routing::get;
use axum::{Json, Router};
use serde::Deserialize;

use super::{HttpError, HttpResult, SharedState};
use crate::aggregation::{self, ActiveRuns, EnvironmentHealth, FlakyTest, PassRate, TestStats, TotalExecutions};

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/active-runs", get(active_runs))
        .route("/pass-rate", get(pass_rate))
        .route("/total-executions", get(total_executions))
        .route("/flaky-tests", get(flaky_tests))
        .route("/environment-health", get(environment_health))
        .route("/tests/{test_key}/stats", get(test_stats))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
struct WindowQuery {
    #[serde(default = "default_days")]
    days: i64,
    environment: Option<String>,
}

#[derive(Debug, Deserialize)]
struct FlakyQuery {
    #[serde(default = "default_days")]
    days: i64,
    #[serde(default = "default_min_executions")]
    min_executions: i64,
}

fn default_days() -> i64 {
    30
}

fn default_min_executions() -> i64 {
    5
}

/// Clamps the `days` window to the documented 1–365 bound.
fn clamp_days(days: i64) -> HttpResult<i64> {
    if !(1..=365).contains(&days) {
        return Err(HttpError::Validation("days must be between 1 and 365".to_string()));
    }
    Ok(days)
}

async fn active_runs(State(state): State<SharedState>) -> HttpResult<Json<ActiveRuns>> {
    Ok(Json(aggregation::active_runs(&state.store).await?))
}

async fn pass_rate(State(state): State<SharedState>, Query(query): Query<WindowQuery>) -> HttpResult<Json<PassRate>> {
    let days = clamp_days(query.days)?;
    Ok(Json(aggregation::pass_rate(&state.store, query.environment.as_deref(), days).await?))
}

async fn total_executions(
    State(state): State<SharedState>,
    Query(query): Query<WindowQuery>,
) -> HttpResult<Json<TotalExecutions>> {
    let days = clamp_days(query.days)?;
    Ok(Json(aggregation::total_executions(&state.store, days).await?))
}

async fn flaky_tests(
    State(state): State<SharedState>,
    Query(query): Query<FlakyQuery>,
) -> HttpResult<Json<Vec<FlakyTest>>> {
    let days = clamp_days(query.days)?;
    Ok(Json(aggregation::flaky_tests(&state.store, days, query.min_executions).await?))
}

async fn environment_health(
    State(state): State<SharedState>,
    Query(query): Query<WindowQuery>,
) -> HttpResult<Json<Vec<EnvironmentHealth>>> {
    let days = clamp_days(query.days)?;
    Ok(Json(aggregation::environment_health(&state.store, days).await?))
}

async fn test_stats(
    State(state): State<SharedState>,
    Path(test_key): Path<String>,
    Query(query): Query<WindowQuery>,
) -> HttpResult<Json<TestStats>> {
    let days = clamp_days(query.days)?;
    let stats = aggregation::test_stats(&state.store, &test_key, days).await?;
    Ok(Json(stats.ok_or(HttpError::NotFound)?))
}
