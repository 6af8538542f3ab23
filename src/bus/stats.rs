//! Rolling delivery counters.

use serde::Serialize;
use std::collections::{BTreeMap, HashMap, VecDeque};
use std::time::Duration;

use super::monitor::FailureKind;
use crate::events::EventType;

const MIN_LATENCY_SAMPLES: usize = 20;

/// Per-chamber delivery figures
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct ChamberDeliveryStats {
    pub delivered: u64,
    pub failed: u64,
    pub timed_out: u64,
    pub panicked: u64,
    /// Set by a failed delivery, cleared by the next success
    pub degraded: bool,
    pub last_latency_ms: Option<f64>,
    pub avg_latency_ms: Option<f64>,
    /// Only reported once enough samples exist
    pub p95_latency_ms: Option<f64>,
}

/// Snapshot returned by `EventBus::get_stats`
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct BusStats {
    pub events_published: u64,
    pub events_rejected: u64,
    pub ledger_failures: u64,
    pub influences_emitted: u64,
    pub influences_suppressed: u64,
    pub by_type: BTreeMap<String, u64>,
    pub chambers: BTreeMap<String, ChamberDeliveryStats>,
}

#[derive(Debug, Default)]
struct ChamberCounters {
    delivered: u64,
    failed: u64,
    timed_out: u64,
    panicked: u64,
    degraded: bool,
    total_latency_ms: f64,
    last_latency_ms: Option<f64>,
    latencies_ms: VecDeque<f64>,
}

impl ChamberCounters {
    fn push_latency(&mut self, latency: Duration, window: usize) {
        let ms = latency.as_secs_f64() * 1000.0;
        self.total_latency_ms += ms;
        self.last_latency_ms = Some(ms);
        self.latencies_ms.push_back(ms);
        if self.latencies_ms.len() > window {
            self.latencies_ms.pop_front();
        }
    }

    fn p95_latency(&self) -> Option<f64> {
        if self.latencies_ms.len() < MIN_LATENCY_SAMPLES {
            return None;
        }
        let mut samples: Vec<f64> = self.latencies_ms.iter().copied().collect();
        samples.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        let index = ((samples.len() as f64 * 0.95).ceil() as usize).saturating_sub(1);
        samples.get(index).copied()
    }

    fn snapshot(&self) -> ChamberDeliveryStats {
        let attempts = self.delivered + self.failed;
        ChamberDeliveryStats {
            delivered: self.delivered,
            failed: self.failed,
            timed_out: self.timed_out,
            panicked: self.panicked,
            degraded: self.degraded,
            last_latency_ms: self.last_latency_ms,
            avg_latency_ms: (attempts > 0).then(|| self.total_latency_ms / attempts as f64),
            p95_latency_ms: self.p95_latency(),
        }
    }
}

/// Mutable side of [`BusStats`], owned by the bus
#[derive(Debug)]
pub(crate) struct StatsCollector {
    window: usize,
    published: u64,
    rejected: u64,
    ledger_failures: u64,
    influences_emitted: u64,
    influences_suppressed: u64,
    by_type: BTreeMap<EventType, u64>,
    chambers: HashMap<String, ChamberCounters>,
}

impl StatsCollector {
    pub(crate) fn new(window: usize) -> Self {
        Self {
            window: window.max(1),
            published: 0,
            rejected: 0,
            ledger_failures: 0,
            influences_emitted: 0,
            influences_suppressed: 0,
            by_type: BTreeMap::new(),
            chambers: HashMap::new(),
        }
    }

    pub(crate) fn record_published(&mut self, event_type: EventType) {
        self.published += 1;
        *self.by_type.entry(event_type).or_insert(0) += 1;
    }

    pub(crate) fn record_rejected(&mut self) {
        self.rejected += 1;
    }

    pub(crate) fn record_ledger_failure(&mut self) {
        self.ledger_failures += 1;
    }

    pub(crate) fn record_influence(&mut self, emitted: bool) {
        if emitted {
            self.influences_emitted += 1;
        } else {
            self.influences_suppressed += 1;
        }
    }

    /// Start tracking a subscriber; counters survive a re-subscribe
    pub(crate) fn register(&mut self, chamber_id: &str) {
        self.chambers.entry(chamber_id.to_string()).or_default();
    }

    /// Stop tracking a subscriber and drop its counters
    pub(crate) fn forget(&mut self, chamber_id: &str) {
        self.chambers.remove(chamber_id);
    }

    /// Deliveries that land after `forget` are not counted
    pub(crate) fn record_delivery(&mut self, chamber_id: &str, latency: Duration) {
        let window = self.window;
        let Some(counters) = self.chambers.get_mut(chamber_id) else {
            return;
        };
        counters.delivered += 1;
        counters.degraded = false;
        counters.push_latency(latency, window);
    }

    pub(crate) fn record_failure(&mut self, chamber_id: &str, kind: &FailureKind, latency: Duration) {
        let window = self.window;
        let Some(counters) = self.chambers.get_mut(chamber_id) else {
            return;
        };
        counters.failed += 1;
        counters.degraded = true;
        match kind {
            FailureKind::TimedOut { .. } => counters.timed_out += 1,
            FailureKind::Panicked { .. } => counters.panicked += 1,
            FailureKind::Error { .. } | FailureKind::Cancelled => {}
        }
        counters.push_latency(latency, window);
    }

    pub(crate) fn is_degraded(&self, chamber_id: &str) -> bool {
        self.chambers
            .get(chamber_id)
            .map(|c| c.degraded)
            .unwrap_or(false)
    }

    pub(crate) fn snapshot(&self) -> BusStats {
        BusStats {
            events_published: self.published,
            events_rejected: self.rejected,
            ledger_failures: self.ledger_failures,
            influences_emitted: self.influences_emitted,
            influences_suppressed: self.influences_suppressed,
            by_type: self
                .by_type
                .iter()
                .map(|(t, n)| (t.as_str().to_string(), *n))
                .collect(),
            chambers: self
                .chambers
                .iter()
                .map(|(id, c)| (id.clone(), c.snapshot()))
                .collect(),
        }
    }
}
