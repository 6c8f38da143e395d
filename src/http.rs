//! Thin JSON/byte-range adapter exposing the core to the dashboard UI.
//!
//! Composed as nested `axum::Router`s sharing one cloned [`AppState`], the
//! same nested-router-with-shared-state shape the pack's only production
//! HTTP service uses. A `tower_http::trace::TraceLayer` provides per-request
//! structured logging in place of a direct teacher analogue.

pub mod artifacts;
pub mod catalog;
pub mod dashboard;
pub mod runs;
pub mod schedules;

use std::path::PathBuf;
use std::sync::Arc;

use axum::Json;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use serde::Serialize;
use serde_json::json;
use tower_http::cors::CorsLayer;
use tower_http::trace::TraceLayer;

use crate::access::AccessPolicy;
use crate::config::Environment;
use crate::executor::DriverConfig;
use crate::store::{Store, StoreError};

pub struct AppState {
    pub store: Arc<Store>,
    pub access: AccessPolicy,
    pub environments: Vec<Environment>,
    pub artifact_root: PathBuf,
    pub driver: DriverConfig,
}

impl AppState {
    pub fn known_environment(&self, code: &str) -> bool {
        self.environments.iter().any(|e| e.code == code)
    }
}

pub type SharedState = Arc<AppState>;

/// Error shape converted to `{error: string}` JSON plus a status code, per
/// the core's documented error-handling design — handlers return
/// `Result<_, HttpError>` rather than unwrapping.
#[derive(Debug)]
pub enum HttpError {
    Validation(String),
    Forbidden(String),
    NotFound,
    Internal(String),
}

impl std::fmt::Display for HttpError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Validation(msg) => write!(f, "validation error: {msg}"),
            Self::Forbidden(msg) => write!(f, "forbidden: {msg}"),
            Self::NotFound => write!(f, "not found"),
            Self::Internal(msg) => write!(f, "internal error: {msg}"),
        }
    }
}

impl From<StoreError> for HttpError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound => Self::NotFound,
            other => Self::Internal(other.to_string()),
        }
    }
}

impl IntoResponse for HttpError {
    fn into_response(self) -> Response {
        let status = match &self {
            Self::Validation(_) => StatusCode::BAD_REQUEST,
            Self::Forbidden(_) => StatusCode::FORBIDDEN,
            Self::NotFound => StatusCode::NOT_FOUND,
            Self::Internal(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        let body = json!({ "error": self.to_string() });
        (status, Json(body)).into_response()
    }
}

pub type HttpResult<T> = Result<T, HttpError>;

/// Wraps a successful body with an explicit status code (e.g. 201 Created).
pub struct Created<T>(pub T);

impl<T: Serialize> IntoResponse for Created<T> {
    fn into_response(self) -> Response {
        (StatusCode::CREATED, Json(self.0)).into_response()
    }
}

pub fn router(state: SharedState) -> Router {
    Router::new()
        .route("/api/health", get(health))
        .nest("/api/catalog", catalog::router(state.clone()))
        .nest("/api/runs", runs::router(state.clone()))
        .nest("/api/schedules", schedules::router(state.clone()))
        .nest("/api/dashboard", dashboard::router(state.clone()))
        .nest("/api/artifacts", artifacts::router(state))
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}
