//! Authenticated event ingest

use axum::{extract::State, http::StatusCode, Json};
use serde_json::Value;

use super::{ApiError, AppState};
use crate::bus::PublishReceipt;
use crate::events::RawPlatformEvent;

/// `POST /events`: decode the wire form and publish it
pub async fn publish_event(
    State(state): State<AppState>,
    Json(body): Json<Value>,
) -> Result<(StatusCode, Json<PublishReceipt>), ApiError> {
    let raw: RawPlatformEvent = serde_json::from_value(body)
        .map_err(|e| ApiError::Unprocessable(format!("malformed event: {}", e)))?;

    let receipt = state.registry.bus().publish_raw(raw).await?;
    Ok((StatusCode::ACCEPTED, Json(receipt)))
}
