//! Health probes.
//!
//! `/health` is unauthenticated and reveals nothing beyond ok / degraded.
//! `/health/detailed` carries per-chamber status and bus counters.

use axum::{extract::State, http::StatusCode, response::IntoResponse, Json};
use chrono::{DateTime, Utc};
use serde::Serialize;
use serde_json::json;
use std::sync::Arc;
use tracing::{error, warn};

use super::AppState;
use crate::bus::BusStats;
use crate::events::TAXONOMY_VERSION;
use crate::models::{ChamberHealth, ChamberStatus};

#[derive(Serialize)]
struct HealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
}

#[derive(Serialize)]
struct DetailedHealthResponse {
    status: &'static str,
    timestamp: DateTime<Utc>,
    docked: usize,
    active_chambers: Vec<String>,
    chambers: Vec<ChamberStatus>,
    bus: BusStats,
    taxonomy_version: u32,
    influences_in_force: usize,
}

/// Collect statuses off the async workers, bounded by the probe deadline
async fn collect_statuses(state: &AppState) -> Option<Vec<ChamberStatus>> {
    let registry = Arc::clone(&state.registry);
    let task = tokio::task::spawn_blocking(move || registry.get_all_statuses());

    match tokio::time::timeout(state.probe_timeout, task).await {
        Ok(Ok(statuses)) => Some(statuses),
        Ok(Err(e)) => {
            error!(error = %e, "status_collection_failed");
            None
        }
        Err(_) => {
            warn!(
                timeout_ms = state.probe_timeout.as_millis() as u64,
                "status_collection_timed_out"
            );
            None
        }
    }
}

fn overall(statuses: &[ChamberStatus]) -> (&'static str, StatusCode) {
    let degraded = statuses
        .iter()
        .any(|s| s.health == ChamberHealth::Degraded || s.error.is_some());
    if degraded {
        ("degraded", StatusCode::SERVICE_UNAVAILABLE)
    } else {
        ("ok", StatusCode::OK)
    }
}

fn probe_error() -> axum::response::Response {
    (
        StatusCode::INTERNAL_SERVER_ERROR,
        Json(json!({ "status": "error" })),
    )
        .into_response()
}

pub async fn health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(statuses) = collect_statuses(&state).await else {
        return probe_error();
    };
    let (status, code) = overall(&statuses);
    (
        code,
        Json(HealthResponse {
            status,
            timestamp: Utc::now(),
        }),
    )
        .into_response()
}

pub async fn detailed_health(State(state): State<AppState>) -> impl IntoResponse {
    let Some(statuses) = collect_statuses(&state).await else {
        return probe_error();
    };
    let (status, code) = overall(&statuses);
    let now = Utc::now();

    (
        code,
        Json(DetailedHealthResponse {
            status,
            timestamp: now,
            docked: statuses.len(),
            active_chambers: state.registry.active_chamber_ids(),
            chambers: statuses,
            bus: state.registry.bus().get_stats(),
            taxonomy_version: TAXONOMY_VERSION,
            influences_in_force: state.influence.active_at(now).len(),
        }),
    )
        .into_response()
}
