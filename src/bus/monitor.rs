//! Delivery failure reporting.
//!
//! A chamber that errors, panics or overruns its deadline is contained by the
//! bus and reported here instead of being re-raised.

use serde::Serialize;
use tracing::{error, warn};

use super::BusError;
use crate::events::EventType;
use crate::models::ChamberInfluence;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FailureKind {
    /// `on_event` returned an error
    Error { message: String },
    /// Delivery exceeded the per-chamber deadline
    TimedOut { after_ms: u64 },
    Panicked { message: String },
    Cancelled,
}

impl std::fmt::Display for FailureKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Error { message } => write!(f, "error: {}", message),
            Self::TimedOut { after_ms } => write!(f, "timed out after {}ms", after_ms),
            Self::Panicked { message } => write!(f, "panicked: {}", message),
            Self::Cancelled => write!(f, "cancelled"),
        }
    }
}

/// One isolated delivery failure
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChamberDeliveryFailure {
    pub chamber_id: String,
    pub sequence: u64,
    pub event_type: EventType,
    #[serde(flatten)]
    pub kind: FailureKind,
}

impl std::fmt::Display for ChamberDeliveryFailure {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "delivery of #{} ({}) to chamber '{}' failed: {}",
            self.sequence, self.event_type, self.chamber_id, self.kind
        )
    }
}

impl std::error::Error for ChamberDeliveryFailure {}

/// External monitoring collaborator
pub trait DeliveryMonitor: Send + Sync {
    fn delivery_failed(&self, failure: &ChamberDeliveryFailure);

    fn publish_rejected(&self, error: &BusError) {
        let _ = error;
    }

    fn ledger_failed(&self, sequence: u64, error: &anyhow::Error) {
        let _ = (sequence, error);
    }

    fn influence_suppressed(&self, influence: &ChamberInfluence, reason: &str) {
        let _ = (influence, reason);
    }
}

/// Default monitor: everything goes to the log
#[derive(Debug, Default, Clone, Copy)]
pub struct TracingMonitor;

impl DeliveryMonitor for TracingMonitor {
    fn delivery_failed(&self, failure: &ChamberDeliveryFailure) {
        error!(
            chamber = %failure.chamber_id,
            sequence = failure.sequence,
            event_type = %failure.event_type,
            kind = %failure.kind,
            "chamber_delivery_failed"
        );
    }

    fn publish_rejected(&self, error: &BusError) {
        warn!(error = %error, "publish_rejected");
    }

    fn ledger_failed(&self, sequence: u64, error: &anyhow::Error) {
        error!(sequence, error = %error, "ledger_append_failed");
    }

    fn influence_suppressed(&self, influence: &ChamberInfluence, reason: &str) {
        warn!(
            chamber = %influence.chamber_id,
            influence_type = ?influence.influence_type,
            reason,
            "influence_suppressed"
        );
    }
}
