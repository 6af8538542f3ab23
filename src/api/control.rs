//! Operator control: list, transition, backtest and promotion

use axum::{
    extract::{Path, Query, State},
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use super::{ApiError, AppState};
use crate::models::{BacktestResult, ChamberMode, ChamberStatus};
use crate::registry::{PromotionDecision, TransitionRecord};

#[derive(Serialize)]
pub struct ChamberList {
    pub chambers: Vec<String>,
    pub active: Vec<String>,
}

#[derive(Debug, Deserialize)]
pub struct TransitionRequest {
    pub mode: ChamberMode,
}

#[derive(Debug, Default, Deserialize)]
pub struct BacktestQuery {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    /// Used when `from` is absent
    pub window_hours: Option<i64>,
}

pub async fn list_chambers(State(state): State<AppState>) -> Json<ChamberList> {
    Json(ChamberList {
        chambers: state.registry.get_docked_chamber_ids(),
        active: state.registry.active_chamber_ids(),
    })
}

pub async fn chamber_status(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<ChamberStatus>, ApiError> {
    Ok(Json(state.registry.get_status(&id)?))
}

pub async fn transition(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Json(req): Json<TransitionRequest>,
) -> Result<Json<TransitionRecord>, ApiError> {
    Ok(Json(state.registry.transition(&id, req.mode).await?))
}

pub async fn run_backtest(
    State(state): State<AppState>,
    Path(id): Path<String>,
    Query(query): Query<BacktestQuery>,
) -> Result<Json<BacktestResult>, ApiError> {
    let to = query.to.unwrap_or_else(Utc::now);
    let from = match query.from {
        Some(from) => from,
        None => {
            let hours = query.window_hours.unwrap_or(24).max(1);
            Duration::try_hours(hours)
                .and_then(|window| to.checked_sub_signed(window))
                .ok_or_else(|| {
                    ApiError::BadRequest(format!("window of {} hours is out of range", hours))
                })?
        }
    };
    if from > to {
        return Err(ApiError::BadRequest(format!(
            "window start {} is after end {}",
            from, to
        )));
    }

    Ok(Json(state.registry.run_backtest(&id, from, to).await?))
}

pub async fn evaluate_promotion(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<PromotionDecision>, ApiError> {
    let decision = state
        .registry
        .evaluate_promotion(&id, Utc::now(), &state.promotion)
        .await?;
    Ok(Json(decision))
}
