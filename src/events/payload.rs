//! Typed payloads, one struct per event type.

use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::taxonomy::EventType;

/// Supply tier of a listed GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum SupplyTier {
    Edge,
    Datacenter,
    Hyperscale,
}

/// Availability of a listed GPU
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GpuStatus {
    #[default]
    Online,
    Busy,
    Offline,
    Maintenance,
}

impl GpuStatus {
    /// Only idle online supply can take new work
    pub fn is_eligible(&self) -> bool {
        matches!(self, GpuStatus::Online)
    }
}

fn default_gpu_count() -> u32 {
    1
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCreated {
    pub job_id: String,
    #[serde(default)]
    pub region: Option<String>,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default = "default_gpu_count")]
    pub gpu_count: u32,
    #[serde(default)]
    pub max_price_per_hour: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCompleted {
    pub job_id: String,
    #[serde(default)]
    pub gpu_id: Option<String>,
    #[serde(default)]
    pub duration_seconds: Option<f64>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobCancelled {
    pub job_id: String,
    #[serde(default)]
    pub reason: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuListed {
    pub gpu_id: String,
    pub region: String,
    pub supply_tier: SupplyTier,
    #[serde(default)]
    pub gpu_type: Option<String>,
    #[serde(default)]
    pub price_per_hour: Option<f64>,
    #[serde(default)]
    pub status: GpuStatus,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuStatusChanged {
    pub gpu_id: String,
    pub status: GpuStatus,
    #[serde(default)]
    pub region: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct GpuDelisted {
    pub gpu_id: String,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct NetworkRouteCalculated {
    pub origin_region: String,
    pub target_region: String,
    pub latency_ms: f64,
    #[serde(default)]
    pub job_id: Option<String>,
    #[serde(default)]
    pub supply_tier: Option<SupplyTier>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ArbitrageCalculated {
    pub gpu_type: String,
    pub spread_pct: f64,
    #[serde(default)]
    pub cheapest_provider: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PricingCalculated {
    pub gpu_type: String,
    pub price_per_hour: f64,
    #[serde(default)]
    pub region: Option<String>,
}

/// Payload variant, discriminated by [`EventType`]
#[derive(Debug, Clone, PartialEq)]
pub enum EventPayload {
    JobCreated(JobCreated),
    JobCompleted(JobCompleted),
    JobCancelled(JobCancelled),
    GpuListed(GpuListed),
    GpuStatusChanged(GpuStatusChanged),
    GpuDelisted(GpuDelisted),
    NetworkRouteCalculated(NetworkRouteCalculated),
    ArbitrageCalculated(ArbitrageCalculated),
    PricingCalculated(PricingCalculated),
}

impl EventPayload {
    pub fn event_type(&self) -> EventType {
        match self {
            EventPayload::JobCreated(_) => EventType::JobCreated,
            EventPayload::JobCompleted(_) => EventType::JobCompleted,
            EventPayload::JobCancelled(_) => EventType::JobCancelled,
            EventPayload::GpuListed(_) => EventType::GpuListed,
            EventPayload::GpuStatusChanged(_) => EventType::GpuStatusChanged,
            EventPayload::GpuDelisted(_) => EventType::GpuDelisted,
            EventPayload::NetworkRouteCalculated(_) => EventType::NetworkRouteCalculated,
            EventPayload::ArbitrageCalculated(_) => EventType::ArbitrageCalculated,
            EventPayload::PricingCalculated(_) => EventType::PricingCalculated,
        }
    }

    /// Decode a wire payload for an already-validated type
    pub fn decode(event_type: EventType, value: Value) -> serde_json::Result<Self> {
        Ok(match event_type {
            EventType::JobCreated => EventPayload::JobCreated(serde_json::from_value(value)?),
            EventType::JobCompleted => EventPayload::JobCompleted(serde_json::from_value(value)?),
            EventType::JobCancelled => EventPayload::JobCancelled(serde_json::from_value(value)?),
            EventType::GpuListed => EventPayload::GpuListed(serde_json::from_value(value)?),
            EventType::GpuStatusChanged => {
                EventPayload::GpuStatusChanged(serde_json::from_value(value)?)
            }
            EventType::GpuDelisted => EventPayload::GpuDelisted(serde_json::from_value(value)?),
            EventType::NetworkRouteCalculated => {
                EventPayload::NetworkRouteCalculated(serde_json::from_value(value)?)
            }
            EventType::ArbitrageCalculated => {
                EventPayload::ArbitrageCalculated(serde_json::from_value(value)?)
            }
            EventType::PricingCalculated => {
                EventPayload::PricingCalculated(serde_json::from_value(value)?)
            }
        })
    }

    /// Encode back to the untyped wire form
    pub fn encode(&self) -> Value {
        let encoded = match self {
            EventPayload::JobCreated(p) => serde_json::to_value(p),
            EventPayload::JobCompleted(p) => serde_json::to_value(p),
            EventPayload::JobCancelled(p) => serde_json::to_value(p),
            EventPayload::GpuListed(p) => serde_json::to_value(p),
            EventPayload::GpuStatusChanged(p) => serde_json::to_value(p),
            EventPayload::GpuDelisted(p) => serde_json::to_value(p),
            EventPayload::NetworkRouteCalculated(p) => serde_json::to_value(p),
            EventPayload::ArbitrageCalculated(p) => serde_json::to_value(p),
            EventPayload::PricingCalculated(p) => serde_json::to_value(p),
        };
        // Plain structs with string keys always serialize
        encoded.unwrap_or(Value::Null)
    }
}
