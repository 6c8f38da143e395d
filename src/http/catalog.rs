//! Catalog sub-tree: list/filter, get by key, list tags/folders, update
//! overrides.

use axum::extract::{Path, Query, State};
use axum::routing::{get, put};
use axum::{Json, Router};
use serde::Deserialize;
use serde_json::Value;

use super::{HttpError, HttpResult, SharedState};
use crate::store::TestDefinition;

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/", get(list_tests))
        .route("/tags", get(list_tags))
        .route("/folders", get(list_folders))
        .route("/{test_key}", get(get_test))
        .route("/{test_key}/overrides", put(update_overrides))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct ListQuery {
    pub folder_prefix: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

async fn list_tests(
    State(state): State<SharedState>,
    Query(query): Query<ListQuery>,
) -> HttpResult<Json<Vec<TestDefinition>>> {
    let tests = state.store.list_tests(query.folder_prefix.as_deref(), &query.tags).await?;
    Ok(Json(tests))
}

async fn list_tags(State(state): State<SharedState>) -> HttpResult<Json<Vec<String>>> {
    Ok(Json(state.store.list_tags().await?))
}

async fn list_folders(State(state): State<SharedState>) -> HttpResult<Json<Vec<String>>> {
    Ok(Json(state.store.list_folder_paths().await?))
}

async fn get_test(
    State(state): State<SharedState>,
    Path(test_key): Path<String>,
) -> HttpResult<Json<TestDefinition>> {
    let test = state.store.get_test_by_key(&test_key).await?.ok_or(HttpError::NotFound)?;
    Ok(Json(test))
}

async fn update_overrides(
    State(state): State<SharedState>,
    Path(test_key): Path<String>,
    Json(overrides): Json<Value>,
) -> HttpResult<Json<TestDefinition>> {
    if !overrides.is_object() {
        return Err(HttpError::Validation("overrides must be a JSON object".to_string()));
    }
    let updated = state.store.update_test_overrides(&test_key, &overrides).await?;
    Ok(Json(updated))
}
