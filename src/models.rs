//! Shared chamber vocabulary: modes, status snapshots, influence and
//! backtest results.

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::str::FromStr;

/// Lifecycle mode of a docked chamber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChamberMode {
    /// Docked, counted, never influential
    #[default]
    Offline,
    /// Accumulates and backtests, never influential
    Shadow,
    /// May return influence signals
    Active,
}

impl ChamberMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChamberMode::Offline => "OFFLINE",
            ChamberMode::Shadow => "SHADOW",
            ChamberMode::Active => "ACTIVE",
        }
    }

    pub fn may_influence(&self) -> bool {
        matches!(self, ChamberMode::Active)
    }
}

impl std::fmt::Display for ChamberMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChamberMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "OFFLINE" => Ok(ChamberMode::Offline),
            "SHADOW" => Ok(ChamberMode::Shadow),
            "ACTIVE" => Ok(ChamberMode::Active),
            other => Err(format!("unknown chamber mode '{}'", other)),
        }
    }
}

/// Derived health of a chamber
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum ChamberHealth {
    Healthy,
    Degraded,
    Offline,
}

/// Read-only snapshot of one chamber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberStatus {
    pub chamber_id: String,
    pub name: String,
    pub mode: ChamberMode,
    pub events_received: u64,
    pub events_since_last_restart: u64,
    pub health: ChamberHealth,
    pub last_event_at: Option<DateTime<Utc>>,
    pub activated_at: Option<DateTime<Utc>>,
    pub backtest_score: Option<u8>,
    /// Set when the status had to be synthesized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ChamberStatus {
    /// Stand-in for a chamber whose own status call failed
    pub fn unavailable(chamber_id: &str, error: impl Into<String>) -> Self {
        Self {
            chamber_id: chamber_id.to_string(),
            name: chamber_id.to_string(),
            mode: ChamberMode::Offline,
            events_received: 0,
            events_since_last_restart: 0,
            health: ChamberHealth::Offline,
            last_event_at: None,
            activated_at: None,
            backtest_score: None,
            error: Some(error.into()),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum InfluenceType {
    RoutingPreference,
}

/// Steer matching work toward the listed regions
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RoutingPreference {
    pub regions: Vec<String>,
    pub job_id: String,
    /// Candidate supply, most recently observed first
    pub supply_ids: Vec<String>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum InfluencePayload {
    RoutingPreference(RoutingPreference),
}

/// Advisory recommendation returned by an ACTIVE chamber
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChamberInfluence {
    pub chamber_id: String,
    pub influence_type: InfluenceType,
    pub payload: InfluencePayload,
    pub confidence: f64,
    pub ttl_seconds: u64,
    pub emitted_at: DateTime<Utc>,
}

/// Longest lifetime the bus accepts for a single influence
pub const MAX_INFLUENCE_TTL_SECS: u64 = 24 * 60 * 60;

impl ChamberInfluence {
    /// Saturates at the latest representable instant, so an absurd ttl
    /// reads as "never expires" instead of overflowing
    pub fn expires_at(&self) -> DateTime<Utc> {
        i64::try_from(self.ttl_seconds)
            .ok()
            .and_then(Duration::try_seconds)
            .and_then(|ttl| self.emitted_at.checked_add_signed(ttl))
            .unwrap_or(DateTime::<Utc>::MAX_UTC)
    }

    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at()
    }

    pub fn has_valid_ttl(&self) -> bool {
        (1..=MAX_INFLUENCE_TTL_SECS).contains(&self.ttl_seconds)
    }

    pub fn has_valid_confidence(&self) -> bool {
        (0.0..=1.0).contains(&self.confidence)
    }
}

/// Outcome of replaying a chamber's own records over a window
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BacktestResult {
    pub chamber_id: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
    pub events_replayed: usize,
    pub matched: usize,
    pub score: u8,
    pub improvement_pct: f64,
    pub pass_threshold: u8,
    pub passed: bool,
    pub summary: String,
}

impl BacktestResult {
    /// Result for a window without enough samples; never a pass
    pub fn insufficient(
        chamber_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        replayed: usize,
        min_samples: usize,
        pass_threshold: u8,
    ) -> Self {
        Self {
            chamber_id: chamber_id.to_string(),
            from,
            to,
            events_replayed: replayed,
            matched: 0,
            score: 0,
            improvement_pct: 0.0,
            pass_threshold,
            passed: false,
            summary: format!(
                "insufficient data: {} relevant records in window, need {}",
                replayed, min_samples
            ),
        }
    }
}
