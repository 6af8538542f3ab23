//! Router assembly and shared handler plumbing

use axum::{
    http::StatusCode,
    middleware,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde_json::json;
use std::sync::Arc;
use std::time::Duration;
use tower_http::trace::TraceLayer;

use super::{control, health, ingest};
use crate::auth::{require_operator, ProbeAuthorizer};
use crate::bus::BusError;
use crate::influence::InfluenceBoard;
use crate::middleware::request_logging;
use crate::registry::{ChamberRegistry, PromotionPolicy, RegistryError};

/// State shared by every handler
#[derive(Clone)]
pub struct AppState {
    pub registry: Arc<ChamberRegistry>,
    pub influence: Arc<InfluenceBoard>,
    pub promotion: PromotionPolicy,
    /// Deadline for collecting chamber statuses in a probe
    pub probe_timeout: Duration,
}

/// Build the full router. Everything except `/health` needs an operator token.
pub fn router(state: AppState, authorizer: Arc<dyn ProbeAuthorizer>) -> Router {
    let protected = Router::new()
        .route("/health/detailed", get(health::detailed_health))
        .route("/events", post(ingest::publish_event))
        .route("/control/chambers", get(control::list_chambers))
        .route("/control/chambers/:id", get(control::chamber_status))
        .route("/control/chambers/:id/transition", post(control::transition))
        .route("/control/chambers/:id/backtest", post(control::run_backtest))
        .route("/control/chambers/:id/promotion", post(control::evaluate_promotion))
        .route_layer(middleware::from_fn_with_state(authorizer, require_operator))
        .with_state(state.clone());

    let public = Router::new()
        .route("/health", get(health::health))
        .with_state(state);

    Router::new()
        .merge(public)
        .merge(protected)
        .layer(middleware::from_fn(request_logging))
        .layer(TraceLayer::new_for_http())
}

// ===== Errors =====

#[derive(Debug)]
pub enum ApiError {
    NotFound(String),
    BadRequest(String),
    Unprocessable(String),
    Internal(anyhow::Error),
}

impl From<anyhow::Error> for ApiError {
    fn from(err: anyhow::Error) -> Self {
        ApiError::Internal(err)
    }
}

impl From<RegistryError> for ApiError {
    fn from(err: RegistryError) -> Self {
        match err {
            RegistryError::UnknownChamber(_) => ApiError::NotFound(err.to_string()),
            RegistryError::DuplicateChamberId(_) | RegistryError::InvalidChamberId(_) => {
                ApiError::BadRequest(err.to_string())
            }
            RegistryError::BacktestWorker { .. } => ApiError::Internal(err.into()),
        }
    }
}

impl From<BusError> for ApiError {
    fn from(err: BusError) -> Self {
        ApiError::Unprocessable(err.to_string())
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let (status, message) = match self {
            ApiError::Internal(err) => {
                tracing::error!(error = %err, "internal_error");
                (StatusCode::INTERNAL_SERVER_ERROR, "Internal server error".to_string())
            }
            ApiError::NotFound(msg) => (StatusCode::NOT_FOUND, msg),
            ApiError::BadRequest(msg) => (StatusCode::BAD_REQUEST, msg),
            ApiError::Unprocessable(msg) => (StatusCode::UNPROCESSABLE_ENTITY, msg),
        };

        (status, Json(json!({ "error": message }))).into_response()
    }
}
