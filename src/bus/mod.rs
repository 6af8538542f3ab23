//! Event Bus
//!
//! In-process pub/sub between event producers and docked chambers.
//!
//! - Every publish validates the type, takes the publish gate, assigns a
//!   sequence number and copies the event to the ledger before fan-out
//! - Fan-out runs one tokio task per subscribed chamber under a deadline and
//!   awaits all of them before returning
//! - A chamber that errors, panics or times out is contained and reported to
//!   the [`DeliveryMonitor`]; other chambers still get the event
//! - Influence only leaves the bus when the chamber's registry mode is ACTIVE

pub mod ledger;
pub mod monitor;
pub mod stats;

pub use ledger::{EventLedger, LedgerEntry, MemoryLedger};
pub use monitor::{ChamberDeliveryFailure, DeliveryMonitor, FailureKind, TracingMonitor};
pub use stats::{BusStats, ChamberDeliveryStats};

use futures_util::future::join_all;
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashSet;
use std::sync::Arc;
use std::time::{Duration, Instant};
use tracing::{debug, info};
use uuid::Uuid;

use crate::chambers::Chamber;
use crate::events::{EventDecodeError, EventType, PlatformEvent, RawPlatformEvent};
use crate::influence::InfluenceSink;
use crate::models::{ChamberInfluence, ChamberMode};
use stats::StatsCollector;

/// Mode cell shared between the registry (writer) and the bus (reader)
pub type ModeCell = Arc<RwLock<ChamberMode>>;

// =============================================================================
// CONFIG
// =============================================================================

#[derive(Debug, Clone)]
pub struct BusConfig {
    /// Deadline for one chamber to handle one event
    pub delivery_timeout: Duration,
    /// Latency samples kept per chamber for p95
    pub latency_window: usize,
}

impl Default for BusConfig {
    fn default() -> Self {
        Self {
            delivery_timeout: Duration::from_millis(2_000),
            latency_window: 1_000,
        }
    }
}

impl BusConfig {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Ok(v) = std::env::var("CHAMBER_DELIVERY_TIMEOUT_MS") {
            if let Ok(ms) = v.parse::<u64>() {
                if ms > 0 {
                    config.delivery_timeout = Duration::from_millis(ms);
                }
            }
        }
        if let Ok(v) = std::env::var("CHAMBER_LATENCY_WINDOW") {
            if let Ok(n) = v.parse::<usize>() {
                config.latency_window = n.max(1);
            }
        }

        config
    }
}

// =============================================================================
// ERRORS / RECEIPT
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BusError {
    /// Type string outside the taxonomy, or outside this bus's accepted set
    UnknownEventType(String),
    /// Payload or timestamp does not match the declared type
    MalformedEvent(String),
}

impl std::fmt::Display for BusError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownEventType(t) => write!(f, "unknown event type '{}'", t),
            Self::MalformedEvent(reason) => write!(f, "malformed event: {}", reason),
        }
    }
}

impl std::error::Error for BusError {}

impl From<EventDecodeError> for BusError {
    fn from(err: EventDecodeError) -> Self {
        match err {
            EventDecodeError::UnknownType(unknown) => BusError::UnknownEventType(unknown.0),
            other => BusError::MalformedEvent(other.to_string()),
        }
    }
}

/// What happened to one published event
#[derive(Debug, Clone, Serialize)]
pub struct PublishReceipt {
    pub sequence: u64,
    pub delivery_id: Uuid,
    pub event_type: EventType,
    /// Chambers that handled the event without failing
    pub delivered: Vec<String>,
    pub failures: Vec<ChamberDeliveryFailure>,
    /// Influence that passed the gate, in subscription order
    pub influences: Vec<ChamberInfluence>,
}

// =============================================================================
// BUS
// =============================================================================

#[derive(Clone)]
struct Subscription {
    chamber: Arc<dyn Chamber>,
    types: HashSet<EventType>,
    mode: ModeCell,
}

type DeliveryOutcome = Result<Option<ChamberInfluence>, FailureKind>;

pub struct EventBus {
    config: BusConfig,
    accepted: HashSet<EventType>,
    subscriptions: RwLock<Vec<Subscription>>,
    /// Held for the whole publish; guards the sequence counter
    publish_gate: tokio::sync::Mutex<u64>,
    stats: Mutex<StatsCollector>,
    ledger: Option<Arc<dyn EventLedger>>,
    monitor: Arc<dyn DeliveryMonitor>,
    influence_sink: Option<Arc<dyn InfluenceSink>>,
}

impl EventBus {
    pub fn new(config: BusConfig) -> Self {
        let stats = StatsCollector::new(config.latency_window);
        Self {
            config,
            accepted: EventType::ALL.iter().copied().collect(),
            subscriptions: RwLock::new(Vec::new()),
            publish_gate: tokio::sync::Mutex::new(0),
            stats: Mutex::new(stats),
            ledger: None,
            monitor: Arc::new(TracingMonitor),
            influence_sink: None,
        }
    }

    pub fn with_ledger(mut self, ledger: Arc<dyn EventLedger>) -> Self {
        self.ledger = Some(ledger);
        self
    }

    pub fn with_monitor(mut self, monitor: Arc<dyn DeliveryMonitor>) -> Self {
        self.monitor = monitor;
        self
    }

    pub fn with_influence_sink(mut self, sink: Arc<dyn InfluenceSink>) -> Self {
        self.influence_sink = Some(sink);
        self
    }

    /// Restrict the accepted vocabulary to a subset of the taxonomy
    pub fn with_accepted_types(mut self, types: impl IntoIterator<Item = EventType>) -> Self {
        self.accepted = types.into_iter().collect();
        self
    }

    pub fn config(&self) -> &BusConfig {
        &self.config
    }

    pub fn accepts(&self, event_type: EventType) -> bool {
        self.accepted.contains(&event_type)
    }

    /// Subscribe a chamber to its declared types. Re-subscribing the same id
    /// replaces the previous entry.
    pub fn subscribe(&self, chamber: Arc<dyn Chamber>, mode: ModeCell) {
        let types: HashSet<EventType> = chamber.subscriptions().iter().copied().collect();
        let id = chamber.id().to_string();
        let mut subs = self.subscriptions.write();
        subs.retain(|s| s.chamber.id() != id);
        self.stats.lock().register(&id);
        info!(chamber = %id, types = types.len(), "chamber_subscribed");
        subs.push(Subscription {
            chamber,
            types,
            mode,
        });
    }

    /// Returns false when nothing was subscribed under `chamber_id`
    pub fn unsubscribe(&self, chamber_id: &str) -> bool {
        let mut subs = self.subscriptions.write();
        let before = subs.len();
        subs.retain(|s| s.chamber.id() != chamber_id);
        let removed = subs.len() != before;
        if removed {
            self.stats.lock().forget(chamber_id);
            info!(chamber = %chamber_id, "chamber_unsubscribed");
        }
        removed
    }

    pub fn subscriber_ids(&self) -> Vec<String> {
        self.subscriptions
            .read()
            .iter()
            .map(|s| s.chamber.id().to_string())
            .collect()
    }

    /// Decode a wire event and publish it
    pub async fn publish_raw(&self, raw: RawPlatformEvent) -> Result<PublishReceipt, BusError> {
        match PlatformEvent::from_raw(raw) {
            Ok(event) => self.publish(event).await,
            Err(e) => Err(self.reject(e.into())),
        }
    }

    /// Deliver one event to every subscribed chamber and wait for all of them
    pub async fn publish(&self, event: PlatformEvent) -> Result<PublishReceipt, BusError> {
        let event_type = event.event_type();
        if !self.accepts(event_type) {
            return Err(self.reject(BusError::UnknownEventType(event_type.as_str().to_string())));
        }

        let mut gate = self.publish_gate.lock().await;
        *gate += 1;
        let sequence = *gate;
        let delivery_id = Uuid::new_v4();

        if let Some(ledger) = &self.ledger {
            if let Err(e) = ledger.append(sequence, &event) {
                self.stats.lock().record_ledger_failure();
                self.monitor.ledger_failed(sequence, &e);
            }
        }

        let targets: Vec<Subscription> = self
            .subscriptions
            .read()
            .iter()
            .filter(|s| s.types.contains(&event_type))
            .cloned()
            .collect();

        debug!(
            sequence,
            %delivery_id,
            event_type = %event_type,
            subject = %event.subject_id(),
            targets = targets.len(),
            "publishing_event"
        );

        let event = Arc::new(event);
        let deliveries = targets.iter().map(|sub| self.deliver(sub, Arc::clone(&event)));
        let outcomes = join_all(deliveries).await;

        let mut receipt = PublishReceipt {
            sequence,
            delivery_id,
            event_type,
            delivered: Vec::new(),
            failures: Vec::new(),
            influences: Vec::new(),
        };

        {
            let mut stats = self.stats.lock();
            stats.record_published(event_type);

            for (sub, (outcome, latency)) in targets.iter().zip(outcomes) {
                let chamber_id = sub.chamber.id();
                match outcome {
                    Ok(influence) => {
                        stats.record_delivery(chamber_id, latency);
                        receipt.delivered.push(chamber_id.to_string());
                        if let Some(influence) = influence {
                            let accepted = self.vet_influence(sub, &influence);
                            stats.record_influence(accepted);
                            if accepted {
                                receipt.influences.push(influence);
                            }
                        }
                    }
                    Err(kind) => {
                        stats.record_failure(chamber_id, &kind, latency);
                        let failure = ChamberDeliveryFailure {
                            chamber_id: chamber_id.to_string(),
                            sequence,
                            event_type,
                            kind,
                        };
                        self.monitor.delivery_failed(&failure);
                        receipt.failures.push(failure);
                    }
                }
            }
        }

        if let Some(sink) = &self.influence_sink {
            for influence in &receipt.influences {
                sink.accept(influence);
            }
        }

        drop(gate);
        Ok(receipt)
    }

    /// Side-effect free snapshot of delivery counters
    pub fn get_stats(&self) -> BusStats {
        self.stats.lock().snapshot()
    }

    /// True when the chamber's most recent delivery failed
    pub fn is_degraded(&self, chamber_id: &str) -> bool {
        self.stats.lock().is_degraded(chamber_id)
    }

    fn reject(&self, error: BusError) -> BusError {
        self.stats.lock().record_rejected();
        self.monitor.publish_rejected(&error);
        error
    }

    async fn deliver(
        &self,
        sub: &Subscription,
        event: Arc<PlatformEvent>,
    ) -> (DeliveryOutcome, Duration) {
        let chamber = Arc::clone(&sub.chamber);
        let deadline = self.config.delivery_timeout;
        let started = Instant::now();

        let handle = tokio::spawn(async move { chamber.on_event(&event).await });
        let abort = handle.abort_handle();

        let outcome = match tokio::time::timeout(deadline, handle).await {
            Ok(Ok(Ok(influence))) => Ok(influence),
            Ok(Ok(Err(e))) => Err(FailureKind::Error {
                message: format!("{:#}", e),
            }),
            Ok(Err(join_err)) if join_err.is_panic() => Err(FailureKind::Panicked {
                message: panic_message(join_err.into_panic().as_ref()),
            }),
            Ok(Err(_)) => Err(FailureKind::Cancelled),
            Err(_) => {
                abort.abort();
                Err(FailureKind::TimedOut {
                    after_ms: deadline.as_millis() as u64,
                })
            }
        };

        (outcome, started.elapsed())
    }

    fn vet_influence(&self, sub: &Subscription, influence: &ChamberInfluence) -> bool {
        let mode = *sub.mode.read();
        let reason = if !mode.may_influence() {
            Some("chamber not active")
        } else if influence.chamber_id != sub.chamber.id() {
            Some("influence attributed to another chamber")
        } else if !influence.has_valid_confidence() {
            Some("confidence outside [0, 1]")
        } else if !influence.has_valid_ttl() {
            Some("ttl outside accepted range")
        } else {
            None
        };

        match reason {
            Some(reason) => {
                self.monitor.influence_suppressed(influence, reason);
                false
            }
            None => true,
        }
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new(BusConfig::default())
    }
}

/// Best-effort text of a caught panic payload
pub(crate) fn panic_message(payload: &(dyn std::any::Any + Send)) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        s.to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "non-string panic payload".to_string()
    }
}
