//! Path-safe artifact file serving: `<artifactRoot>/<runId>/<testKey>/<file>`.

use axum::body::Bytes;
use axum::extract::{Path, State};
use axum::routing::get;
use axum::Router;
use uuid::Uuid;

use super::{HttpError, HttpResult, SharedState};
use crate::artifact;

pub fn router(state: SharedState) -> Router {
    Router::new().route("/{run_id}/{test_key}/{filename}", get(get_artifact)).with_state(state)
}

async fn get_artifact(
    State(state): State<SharedState>,
    Path((run_id, test_key, filename)): Path<(Uuid, String, String)>,
) -> HttpResult<Bytes> {
    let path = artifact::resolve_artifact_path(&state.artifact_root, run_id, &test_key, &filename)
        .map_err(|e| HttpError::Validation(e.to_string()))?;
    let bytes = tokio::fs::read(&path).await.map_err(|e| {
        if e.kind() == std::io::ErrorKind::NotFound { HttpError::NotFound } else { HttpError::Internal(e.to_string()) }
    })?;
    Ok(Bytes::from(bytes))
}
