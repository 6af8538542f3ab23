//! Closed event vocabulary.
//!
//! The taxonomy is versioned: adding a variant bumps [`TAXONOMY_VERSION`].
//! Anything outside this list is rejected at the bus boundary.

use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Current taxonomy revision, reported by the detailed health probe.
pub const TAXONOMY_VERSION: u32 = 1;

/// Every event type the platform understands
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub enum EventType {
    #[serde(rename = "job.created")]
    JobCreated,
    #[serde(rename = "job.completed")]
    JobCompleted,
    #[serde(rename = "job.cancelled")]
    JobCancelled,
    #[serde(rename = "gpu.listed")]
    GpuListed,
    #[serde(rename = "gpu.status_changed")]
    GpuStatusChanged,
    #[serde(rename = "gpu.delisted")]
    GpuDelisted,
    #[serde(rename = "network.route_calculated")]
    NetworkRouteCalculated,
    #[serde(rename = "arbitrage.calculated")]
    ArbitrageCalculated,
    #[serde(rename = "pricing.calculated")]
    PricingCalculated,
}

impl EventType {
    pub const ALL: [EventType; 9] = [
        EventType::JobCreated,
        EventType::JobCompleted,
        EventType::JobCancelled,
        EventType::GpuListed,
        EventType::GpuStatusChanged,
        EventType::GpuDelisted,
        EventType::NetworkRouteCalculated,
        EventType::ArbitrageCalculated,
        EventType::PricingCalculated,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::JobCreated => "job.created",
            EventType::JobCompleted => "job.completed",
            EventType::JobCancelled => "job.cancelled",
            EventType::GpuListed => "gpu.listed",
            EventType::GpuStatusChanged => "gpu.status_changed",
            EventType::GpuDelisted => "gpu.delisted",
            EventType::NetworkRouteCalculated => "network.route_calculated",
            EventType::ArbitrageCalculated => "arbitrage.calculated",
            EventType::PricingCalculated => "pricing.calculated",
        }
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Returned when a type string is not part of the taxonomy
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UnknownEventType(pub String);

impl std::fmt::Display for UnknownEventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "unknown event type '{}' (taxonomy v{})",
            self.0, TAXONOMY_VERSION
        )
    }
}

impl std::error::Error for UnknownEventType {}

impl FromStr for EventType {
    type Err = UnknownEventType;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        EventType::ALL
            .iter()
            .copied()
            .find(|t| t.as_str() == s)
            .ok_or_else(|| UnknownEventType(s.to_string()))
    }
}
