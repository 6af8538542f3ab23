//! Outer Rim: edge-compute routing chamber
//!
//! Correlates demand (`job.created`) with edge supply (`gpu.listed` at the
//! EDGE tier, plus later status changes) by region. When ACTIVE and a new job
//! lands in a region with idle edge GPUs, it recommends routing there.
//!
//! Supply is keyed by `gpu_id`: a newer observation replaces the record in
//! place, an older one only lands in history. Backtests rebuild the supply
//! picture as it stood at each job's timestamp from that history.

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use parking_lot::RwLock;
use std::collections::{HashMap, VecDeque};
use tracing::{debug, info};

use super::Chamber;
use crate::events::{EventPayload, EventType, GpuStatus, PlatformEvent, SupplyTier};
use crate::models::{
    BacktestResult, ChamberHealth, ChamberInfluence, ChamberMode, ChamberStatus,
    InfluencePayload, InfluenceType, RoutingPreference, MAX_INFLUENCE_TTL_SECS,
};

pub const OUTER_RIM_ID: &str = "outerim";

const SUBSCRIPTIONS: [EventType; 4] = [
    EventType::JobCreated,
    EventType::GpuListed,
    EventType::GpuStatusChanged,
    EventType::GpuDelisted,
];

// =============================================================================
// CONFIGURATION
// =============================================================================

#[derive(Debug, Clone)]
pub struct OuterRimConfig {
    pub chamber_id: String,
    pub name: String,
    pub tracked_tier: SupplyTier,
    /// Fixed confidence attached to every routing preference
    pub confidence: f64,
    pub influence_ttl_secs: u64,
    pub min_backtest_samples: usize,
    /// Score (0-100) a backtest must reach to pass
    pub pass_threshold: u8,
    /// Accumulation older than this, relative to the latest event, is stale
    pub stale_after_secs: i64,
    /// Cap for demand and supply-observation history
    pub max_history: usize,
}

impl Default for OuterRimConfig {
    fn default() -> Self {
        Self {
            chamber_id: OUTER_RIM_ID.to_string(),
            name: "Outer Rim Edge Router".to_string(),
            tracked_tier: SupplyTier::Edge,
            confidence: 0.72,
            influence_ttl_secs: 60,
            min_backtest_samples: 5,
            pass_threshold: 70,
            stale_after_secs: 30 * 60,
            max_history: 10_000,
        }
    }
}

impl OuterRimConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("OUTERIM_CONFIDENCE") {
            config.confidence = v
                .parse::<f64>()
                .map(|c| c.clamp(0.0, 1.0))
                .unwrap_or(config.confidence);
        }
        if let Ok(v) = std::env::var("OUTERIM_INFLUENCE_TTL_SECS") {
            config.influence_ttl_secs = v
                .parse::<u64>()
                .map(|t| t.clamp(1, MAX_INFLUENCE_TTL_SECS))
                .unwrap_or(config.influence_ttl_secs);
        }
        if let Ok(v) = std::env::var("OUTERIM_MIN_BACKTEST_SAMPLES") {
            config.min_backtest_samples = v
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .unwrap_or(config.min_backtest_samples);
        }
        if let Ok(v) = std::env::var("OUTERIM_PASS_THRESHOLD") {
            config.pass_threshold = v
                .parse::<u8>()
                .map(|t| t.min(100))
                .unwrap_or(config.pass_threshold);
        }
        if let Ok(v) = std::env::var("OUTERIM_STALE_AFTER_SECS") {
            config.stale_after_secs = v.parse().unwrap_or(config.stale_after_secs);
        }
        if let Ok(v) = std::env::var("OUTERIM_MAX_HISTORY") {
            config.max_history = v
                .parse::<usize>()
                .ok()
                .filter(|&n| n > 0)
                .unwrap_or(config.max_history);
        }

        config
    }
}

// =============================================================================
// ACCUMULATED RECORDS
// =============================================================================

#[derive(Debug, Clone)]
struct SupplyRecord {
    gpu_id: String,
    region: String,
    status: GpuStatus,
    observed_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
struct DemandRecord {
    job_id: String,
    region: String,
    requested_at: DateTime<Utc>,
}

#[derive(Debug, Default)]
struct OuterRimState {
    mode: ChamberMode,
    events_received: u64,
    events_since_last_restart: u64,
    last_event_at: Option<DateTime<Utc>>,
    last_accumulated_at: Option<DateTime<Utc>>,
    activated_at: Option<DateTime<Utc>>,
    backtest_score: Option<u8>,
    /// Current view, one record per gpu_id. Delisted GPUs stay as OFFLINE
    /// tombstones so late, older observations cannot revive them; the map
    /// grows with the number of distinct tracked GPUs.
    supply: HashMap<String, SupplyRecord>,
    /// Recent supply observations in arrival order
    observations: VecDeque<SupplyRecord>,
    /// Newest observation per gpu_id among those evicted from `observations`
    evicted_baseline: HashMap<String, SupplyRecord>,
    demand: VecDeque<DemandRecord>,
}

/// Last writer (by timestamp) wins; equal timestamps go to the later arrival
fn apply_observation(view: &mut HashMap<String, SupplyRecord>, obs: &SupplyRecord) {
    match view.get_mut(&obs.gpu_id) {
        Some(existing) if existing.observed_at > obs.observed_at => {}
        Some(existing) => *existing = obs.clone(),
        None => {
            view.insert(obs.gpu_id.clone(), obs.clone());
        }
    }
}

/// Idle supply in `region`, most recently observed first
fn eligible_supply<'a>(
    supply: impl Iterator<Item = &'a SupplyRecord>,
    region: &str,
) -> Vec<&'a SupplyRecord> {
    let mut matches: Vec<&SupplyRecord> = supply
        .filter(|s| s.status.is_eligible() && s.region.eq_ignore_ascii_case(region))
        .collect();
    matches.sort_by(|a, b| {
        b.observed_at
            .cmp(&a.observed_at)
            .then_with(|| a.gpu_id.cmp(&b.gpu_id))
    });
    matches
}

/// Push onto a capped buffer, handing back whatever fell off the front
fn push_bounded<T>(buf: &mut VecDeque<T>, item: T, cap: usize) -> Option<T> {
    let evicted = if buf.len() >= cap { buf.pop_front() } else { None };
    buf.push_back(item);
    evicted
}

// =============================================================================
// CHAMBER
// =============================================================================

pub struct OuterRimChamber {
    config: OuterRimConfig,
    state: RwLock<OuterRimState>,
}

impl OuterRimChamber {
    pub fn new(config: OuterRimConfig) -> Self {
        Self {
            config,
            state: RwLock::new(OuterRimState::default()),
        }
    }

    pub fn config(&self) -> &OuterRimConfig {
        &self.config
    }

    /// Number of distinct GPUs currently tracked
    pub fn tracked_supply(&self) -> usize {
        self.state.read().supply.len()
    }

    pub fn tracked_demand(&self) -> usize {
        self.state.read().demand.len()
    }

    fn observe(&self, state: &mut OuterRimState, record: SupplyRecord) {
        let at = record.observed_at;
        apply_observation(&mut state.supply, &record);
        if let Some(evicted) = push_bounded(&mut state.observations, record, self.config.max_history)
        {
            apply_observation(&mut state.evicted_baseline, &evicted);
        }
        state.last_accumulated_at = state.last_accumulated_at.max(Some(at));
    }

    fn derive_health(&self, state: &OuterRimState) -> ChamberHealth {
        if state.mode == ChamberMode::Offline {
            return ChamberHealth::Offline;
        }
        if state.events_received == 0 {
            return ChamberHealth::Healthy;
        }
        if state.supply.is_empty() && state.demand.is_empty() {
            return ChamberHealth::Degraded;
        }
        let stale = match (state.last_accumulated_at, state.last_event_at) {
            (Some(acc), Some(last)) => Duration::try_seconds(self.config.stale_after_secs)
                .map_or(false, |limit| last - acc > limit),
            _ => true,
        };
        if stale {
            ChamberHealth::Degraded
        } else {
            ChamberHealth::Healthy
        }
    }

    fn routing_preference(
        &self,
        job_id: &str,
        region: &str,
        supply: &[&SupplyRecord],
    ) -> ChamberInfluence {
        ChamberInfluence {
            chamber_id: self.config.chamber_id.clone(),
            influence_type: InfluenceType::RoutingPreference,
            payload: InfluencePayload::RoutingPreference(RoutingPreference {
                regions: vec![region.to_string()],
                job_id: job_id.to_string(),
                supply_ids: supply.iter().map(|s| s.gpu_id.clone()).collect(),
            }),
            confidence: self.config.confidence,
            ttl_seconds: self.config.influence_ttl_secs,
            emitted_at: Utc::now(),
        }
    }
}

impl Default for OuterRimChamber {
    fn default() -> Self {
        Self::new(OuterRimConfig::default())
    }
}

#[async_trait]
impl Chamber for OuterRimChamber {
    fn id(&self) -> &str {
        &self.config.chamber_id
    }

    fn name(&self) -> &str {
        &self.config.name
    }

    fn subscriptions(&self) -> &[EventType] {
        &SUBSCRIPTIONS
    }

    async fn on_event(&self, event: &PlatformEvent) -> Result<Option<ChamberInfluence>> {
        let ts = event.timestamp();
        let mut state = self.state.write();

        state.events_received += 1;
        state.events_since_last_restart += 1;
        state.last_event_at = state.last_event_at.max(Some(ts));

        match event.payload() {
            EventPayload::GpuListed(listed) if listed.supply_tier == self.config.tracked_tier => {
                let record = SupplyRecord {
                    gpu_id: listed.gpu_id.clone(),
                    region: listed.region.clone(),
                    status: listed.status,
                    observed_at: ts,
                };
                self.observe(&mut state, record);
            }
            EventPayload::GpuStatusChanged(change) => {
                let record = state.supply.get(&change.gpu_id).map(|current| SupplyRecord {
                    gpu_id: change.gpu_id.clone(),
                    region: change.region.clone().unwrap_or_else(|| current.region.clone()),
                    status: change.status,
                    observed_at: ts,
                });
                if let Some(record) = record {
                    self.observe(&mut state, record);
                }
            }
            EventPayload::GpuDelisted(delisted) => {
                let record = state.supply.get(&delisted.gpu_id).map(|current| SupplyRecord {
                    status: GpuStatus::Offline,
                    observed_at: ts,
                    ..current.clone()
                });
                if let Some(record) = record {
                    self.observe(&mut state, record);
                }
            }
            EventPayload::JobCreated(job) => {
                let Some(region) = job.region.as_deref() else {
                    return Ok(None);
                };
                push_bounded(
                    &mut state.demand,
                    DemandRecord {
                        job_id: job.job_id.clone(),
                        region: region.to_string(),
                        requested_at: ts,
                    },
                    self.config.max_history,
                );
                state.last_accumulated_at = state.last_accumulated_at.max(Some(ts));

                if !state.mode.may_influence() {
                    return Ok(None);
                }

                let matches = eligible_supply(state.supply.values(), region);
                if matches.is_empty() {
                    return Ok(None);
                }

                debug!(
                    chamber = %self.config.chamber_id,
                    job_id = %job.job_id,
                    region,
                    candidates = matches.len(),
                    "routing_preference"
                );
                return Ok(Some(self.routing_preference(&job.job_id, region, &matches)));
            }
            _ => {}
        }

        Ok(None)
    }

    fn get_status(&self) -> Result<ChamberStatus> {
        let state = self.state.read();
        Ok(ChamberStatus {
            chamber_id: self.config.chamber_id.clone(),
            name: self.config.name.clone(),
            mode: state.mode,
            events_received: state.events_received,
            events_since_last_restart: state.events_since_last_restart,
            health: self.derive_health(&state),
            last_event_at: state.last_event_at,
            activated_at: state.activated_at,
            backtest_score: state.backtest_score,
            error: None,
        })
    }

    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult {
        let chamber_id = self.config.chamber_id.as_str();
        let threshold = self.config.pass_threshold;

        let (mut demand, mut observations) = {
            let state = self.state.read();
            let demand: Vec<DemandRecord> = state
                .demand
                .iter()
                .filter(|d| d.requested_at >= from && d.requested_at <= to)
                .cloned()
                .collect();
            // Compacted history first so retained observations with equal
            // timestamps still win the stable sort below
            let observations: Vec<SupplyRecord> = state
                .evicted_baseline
                .values()
                .chain(state.observations.iter())
                .filter(|o| o.observed_at <= to)
                .cloned()
                .collect();
            (demand, observations)
        };

        let replayed = demand.len();
        if replayed < self.config.min_backtest_samples {
            self.state.write().backtest_score = Some(0);
            return BacktestResult::insufficient(
                chamber_id,
                from,
                to,
                replayed,
                self.config.min_backtest_samples,
                threshold,
            );
        }

        // Stable sorts keep arrival order for equal timestamps
        demand.sort_by_key(|d| d.requested_at);
        observations.sort_by_key(|o| o.observed_at);

        let mut snapshot: HashMap<String, SupplyRecord> = HashMap::new();
        let mut cursor = 0;
        let mut matched = 0;

        for job in &demand {
            while cursor < observations.len() && observations[cursor].observed_at <= job.requested_at
            {
                apply_observation(&mut snapshot, &observations[cursor]);
                cursor += 1;
            }
            if !eligible_supply(snapshot.values(), &job.region).is_empty() {
                matched += 1;
            }
        }

        let improvement_pct = matched as f64 * 100.0 / replayed as f64;
        let score = improvement_pct.round().clamp(0.0, 100.0) as u8;
        let passed = score >= threshold;

        self.state.write().backtest_score = Some(score);

        info!(
            chamber = chamber_id,
            replayed, matched, score, passed, "backtest_complete"
        );

        BacktestResult {
            chamber_id: chamber_id.to_string(),
            from,
            to,
            events_replayed: replayed,
            matched,
            score,
            improvement_pct,
            pass_threshold: threshold,
            passed,
            summary: format!(
                "{}/{} jobs had idle {:?} supply in their region (threshold {})",
                matched, replayed, self.config.tracked_tier, threshold
            ),
        }
    }

    fn on_mode_change(&self, previous: ChamberMode, next: ChamberMode) {
        let mut state = self.state.write();
        let current = state.mode;

        if next == ChamberMode::Active && current != ChamberMode::Active {
            state.activated_at = Some(Utc::now());
        }
        if current == ChamberMode::Offline && next != ChamberMode::Offline {
            state.events_since_last_restart = 0;
        }
        state.mode = next;

        debug!(
            chamber = %self.config.chamber_id,
            previous = %previous,
            current = %current,
            next = %next,
            "mode_change"
        );
    }
}
