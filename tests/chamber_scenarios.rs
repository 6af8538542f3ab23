//! End-to-end chamber scenarios through the bus and registry
//!
//! Covers delivery counting, influence gating across random event streams,
//! the outerim shadow/active workflows and failure isolation.

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, Duration, TimeZone, Utc};
use parking_lot::Mutex;
use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};
use std::sync::Arc;

use chamber_platform::bus::{
    BusConfig, ChamberDeliveryFailure, DeliveryMonitor, EventBus, FailureKind,
};
use chamber_platform::events::{
    EventPayload, EventType, GpuDelisted, GpuListed, GpuStatus, GpuStatusChanged, JobCreated,
    PlatformEvent, PricingCalculated, RawPlatformEvent, SupplyTier,
};
use chamber_platform::models::{
    BacktestResult, ChamberHealth, ChamberInfluence, ChamberMode, ChamberStatus, InfluencePayload,
    InfluenceType,
};
use chamber_platform::{BusError, Chamber, ChamberRegistry, OuterRimChamber};

// =============================================================================
// FIXTURES
// =============================================================================

fn at(minute: i64) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2026, 3, 1, 9, 0, 0).unwrap() + Duration::minutes(minute)
}

fn listed(gpu: &str, region: &str, tier: SupplyTier, minute: i64) -> PlatformEvent {
    PlatformEvent::new(
        gpu,
        at(minute),
        EventPayload::GpuListed(GpuListed {
            gpu_id: gpu.to_string(),
            region: region.to_string(),
            supply_tier: tier,
            gpu_type: Some("a100".to_string()),
            price_per_hour: Some(1.1),
            status: GpuStatus::Online,
        }),
    )
}

fn job(id: &str, region: Option<&str>, minute: i64) -> PlatformEvent {
    PlatformEvent::new(
        id,
        at(minute),
        EventPayload::JobCreated(JobCreated {
            job_id: id.to_string(),
            region: region.map(str::to_string),
            gpu_type: None,
            gpu_count: 1,
            max_price_per_hour: None,
        }),
    )
}

fn registry() -> ChamberRegistry {
    ChamberRegistry::new(Arc::new(EventBus::default()))
}

/// Six edge listings over two regions, then six jobs, four of them served
async fn seed_outerim(registry: &ChamberRegistry) {
    let bus = registry.bus();
    let supply = [
        ("g-1", "us-west"),
        ("g-2", "us-west"),
        ("g-3", "us-west"),
        ("g-4", "eu-central"),
        ("g-5", "eu-central"),
        ("g-6", "eu-central"),
    ];
    for (i, (gpu, region)) in supply.iter().enumerate() {
        bus.publish(listed(gpu, region, SupplyTier::Edge, i as i64))
            .await
            .unwrap();
    }

    let demand = [
        ("j-1", "us-west"),
        ("j-2", "eu-central"),
        ("j-3", "ap-south"),
        ("j-4", "us-west"),
        ("j-5", "sa-east"),
        ("j-6", "eu-central"),
    ];
    for (i, (id, region)) in demand.iter().enumerate() {
        bus.publish(job(id, Some(region), 10 + i as i64)).await.unwrap();
    }
}

// =============================================================================
// COUNTING / LIFECYCLE
// =============================================================================

#[tokio::test]
async fn test_every_delivered_event_counted_exactly_once() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();

    let events = vec![
        listed("g-1", "us-west", SupplyTier::Edge, 0),
        listed("g-dc", "us-west", SupplyTier::Datacenter, 1),
        job("j-1", None, 2),
        job("j-2", Some("us-west"), 3),
        PlatformEvent::new(
            "g-unknown",
            at(4),
            EventPayload::GpuDelisted(GpuDelisted {
                gpu_id: "g-unknown".to_string(),
            }),
        ),
    ];

    for (i, event) in events.into_iter().enumerate() {
        registry.bus().publish(event).await.unwrap();
        let status = registry.get_status("outerim").unwrap();
        assert_eq!(status.events_received, i as u64 + 1);
    }

    // Not subscribed: pricing is delivered to nobody
    let pricing = PlatformEvent::new(
        "a100",
        at(5),
        EventPayload::PricingCalculated(PricingCalculated {
            gpu_type: "a100".to_string(),
            price_per_hour: 1.2,
            region: None,
        }),
    );
    let receipt = registry.bus().publish(pricing).await.unwrap();
    assert!(receipt.delivered.is_empty());
    assert_eq!(registry.get_status("outerim").unwrap().events_received, 5);
}

#[tokio::test]
async fn test_status_immediately_after_dock() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();

    let statuses = registry.get_all_statuses();
    assert_eq!(statuses.len(), 1);
    let status = &statuses[0];
    assert_eq!(status.chamber_id, "outerim");
    assert_eq!(status.mode, ChamberMode::Offline);
    assert_eq!(status.events_received, 0);
    assert!(matches!(
        status.health,
        ChamberHealth::Offline | ChamberHealth::Degraded
    ));
    assert!(status.last_event_at.is_none());
    assert_eq!(registry.get_docked_chamber_ids(), vec!["outerim".to_string()]);
}

#[tokio::test]
async fn test_full_transition_cycle() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();

    let cycle = [
        ChamberMode::Shadow,
        ChamberMode::Active,
        ChamberMode::Shadow,
        ChamberMode::Offline,
    ];
    let mut previous = ChamberMode::Offline;
    for next in cycle {
        let record = registry.transition("outerim", next).await.unwrap();
        assert_eq!(record.previous, previous);
        assert_eq!(record.next, next);
        assert_eq!(registry.get_status("outerim").unwrap().mode, next);
        previous = next;
    }
}

#[tokio::test]
async fn test_reentering_active_keeps_activated_at() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();

    registry.transition("outerim", ChamberMode::Active).await.unwrap();
    let first = registry.get_status("outerim").unwrap().activated_at;
    assert!(first.is_some());

    tokio::time::sleep(std::time::Duration::from_millis(5)).await;
    let record = registry.transition("outerim", ChamberMode::Active).await.unwrap();
    assert!(!record.changed);
    assert_eq!(registry.get_status("outerim").unwrap().activated_at, first);
}

// =============================================================================
// INFLUENCE GATING
// =============================================================================

fn random_event(rng: &mut StdRng, minute: i64) -> PlatformEvent {
    const REGIONS: [&str; 3] = ["us-west", "eu-central", "ap-south"];
    const TIERS: [SupplyTier; 3] = [SupplyTier::Edge, SupplyTier::Datacenter, SupplyTier::Hyperscale];
    const STATUSES: [GpuStatus; 4] = [
        GpuStatus::Online,
        GpuStatus::Busy,
        GpuStatus::Offline,
        GpuStatus::Maintenance,
    ];

    let gpu = format!("g-{}", rng.gen_range(0..8));
    let region = REGIONS[rng.gen_range(0..REGIONS.len())];
    match rng.gen_range(0..4) {
        0 => listed(&gpu, region, TIERS[rng.gen_range(0..TIERS.len())], minute),
        1 => PlatformEvent::new(
            gpu.clone(),
            at(minute),
            EventPayload::GpuStatusChanged(GpuStatusChanged {
                gpu_id: gpu,
                status: STATUSES[rng.gen_range(0..STATUSES.len())],
                region: None,
            }),
        ),
        2 => PlatformEvent::new(
            gpu.clone(),
            at(minute),
            EventPayload::GpuDelisted(GpuDelisted { gpu_id: gpu }),
        ),
        _ => job(&format!("j-{}", minute), Some(region), minute),
    }
}

#[tokio::test]
async fn test_no_influence_outside_active_for_random_streams() {
    for seed in 0..16u64 {
        let mut rng = StdRng::seed_from_u64(seed);
        let mode = if seed % 2 == 0 {
            ChamberMode::Shadow
        } else {
            ChamberMode::Offline
        };

        let chamber = Arc::new(OuterRimChamber::default());
        let registry = registry();
        registry.dock(chamber.clone()).unwrap();
        registry.transition("outerim", mode).await.unwrap();

        for minute in 0..200 {
            let event = random_event(&mut rng, minute);
            assert!(
                chamber.on_event(&event).await.unwrap().is_none(),
                "seed {} produced influence in {}",
                seed,
                mode
            );
            let receipt = registry.bus().publish(event).await.unwrap();
            assert!(receipt.influences.is_empty());
        }
        assert_eq!(registry.bus().get_stats().influences_emitted, 0);
    }
}

// =============================================================================
// OUTERIM SCENARIOS
// =============================================================================

#[tokio::test]
async fn test_outerim_shadow_backtest_scenario() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
    seed_outerim(&registry).await;
    registry.transition("outerim", ChamberMode::Shadow).await.unwrap();

    let result = registry
        .run_backtest("outerim", at(0), at(60))
        .await
        .unwrap();
    assert_eq!(result.events_replayed, 6);
    assert_eq!(result.matched, 4);
    assert_eq!(result.score, 67);
    assert!(!result.passed);
    assert_eq!(result.pass_threshold, 70);

    // Same window, no new events: same answer
    let again = registry
        .run_backtest("outerim", at(0), at(60))
        .await
        .unwrap();
    assert_eq!(again.score, result.score);
    assert_eq!(again.passed, result.passed);

    let status = registry.get_status("outerim").unwrap();
    assert_eq!(status.backtest_score, Some(67));
    assert_eq!(status.events_received, 12);
}

#[tokio::test]
async fn test_outerim_backtest_needs_minimum_samples() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
    seed_outerim(&registry).await;

    // Only j-1..j-4 fall in this window
    let result = registry
        .run_backtest("outerim", at(0), at(13))
        .await
        .unwrap();
    assert_eq!(result.events_replayed, 4);
    assert_eq!(result.score, 0);
    assert!(!result.passed);
}

#[tokio::test]
async fn test_outerim_active_scenario_emits_routing_preference() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
    seed_outerim(&registry).await;
    registry.transition("outerim", ChamberMode::Active).await.unwrap();

    let receipt = registry
        .bus()
        .publish(job("j-7", Some("eu-central"), 30))
        .await
        .unwrap();
    assert_eq!(receipt.influences.len(), 1);

    let influence = &receipt.influences[0];
    assert_eq!(influence.chamber_id, "outerim");
    assert_eq!(influence.influence_type, InfluenceType::RoutingPreference);
    assert!((influence.confidence - 0.72).abs() < f64::EPSILON);
    assert_eq!(influence.ttl_seconds, 60);
    let InfluencePayload::RoutingPreference(pref) = &influence.payload;
    assert_eq!(pref.regions, vec!["eu-central".to_string()]);
    assert_eq!(pref.job_id, "j-7");
    assert_eq!(pref.supply_ids, vec!["g-6", "g-5", "g-4"]);

    // Unserved region: nothing
    let receipt = registry
        .bus()
        .publish(job("j-8", Some("ap-south"), 31))
        .await
        .unwrap();
    assert!(receipt.influences.is_empty());
    assert_eq!(registry.active_chamber_ids(), vec!["outerim".to_string()]);
}

#[tokio::test]
async fn test_unknown_type_leaves_counters_alone() {
    let registry = registry();
    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
    seed_outerim(&registry).await;
    let before = registry.get_status("outerim").unwrap();

    let raw = RawPlatformEvent {
        event_type: "gpu.teleported".to_string(),
        timestamp: at(40).to_rfc3339(),
        subject_id: "g-1".to_string(),
        correlation_id: None,
        payload: serde_json::json!({ "gpu_id": "g-1" }),
    };
    let err = registry.bus().publish_raw(raw).await.unwrap_err();
    assert_eq!(err, BusError::UnknownEventType("gpu.teleported".to_string()));

    let after = registry.get_status("outerim").unwrap();
    assert_eq!(after.events_received, before.events_received);
    assert_eq!(after.last_event_at, before.last_event_at);
}

// =============================================================================
// FAILURE ISOLATION
// =============================================================================

#[derive(Default)]
struct RecordingMonitor {
    failures: Mutex<Vec<ChamberDeliveryFailure>>,
}

impl DeliveryMonitor for RecordingMonitor {
    fn delivery_failed(&self, failure: &ChamberDeliveryFailure) {
        self.failures.lock().push(failure.clone());
    }
}

enum Misbehaviour {
    Sleep(std::time::Duration),
    Panic,
    Fail,
}

struct Misbehaving {
    id: &'static str,
    how: Misbehaviour,
}

#[async_trait]
impl Chamber for Misbehaving {
    fn id(&self) -> &str {
        self.id
    }
    fn name(&self) -> &str {
        self.id
    }
    fn subscriptions(&self) -> &[EventType] {
        &[EventType::JobCreated]
    }
    async fn on_event(&self, _event: &PlatformEvent) -> Result<Option<ChamberInfluence>> {
        match self.how {
            Misbehaviour::Sleep(d) => {
                tokio::time::sleep(d).await;
                Ok(None)
            }
            Misbehaviour::Panic => panic!("chamber blew up"),
            Misbehaviour::Fail => Err(anyhow!("heuristic store unavailable")),
        }
    }
    fn get_status(&self) -> Result<ChamberStatus> {
        Ok(ChamberStatus {
            chamber_id: self.id.to_string(),
            name: self.id.to_string(),
            mode: ChamberMode::Shadow,
            events_received: 0,
            events_since_last_restart: 0,
            health: ChamberHealth::Healthy,
            last_event_at: None,
            activated_at: None,
            backtest_score: None,
            error: None,
        })
    }
    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult {
        BacktestResult::insufficient(self.id, from, to, 0, 5, 70)
    }
    fn on_mode_change(&self, _previous: ChamberMode, _next: ChamberMode) {}
}

#[tokio::test]
async fn test_failing_chambers_are_isolated() {
    let monitor = Arc::new(RecordingMonitor::default());
    let bus = EventBus::new(BusConfig {
        delivery_timeout: std::time::Duration::from_millis(50),
        ..BusConfig::default()
    })
    .with_monitor(monitor.clone());
    let registry = ChamberRegistry::new(Arc::new(bus));

    registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
    for chamber in [
        Misbehaving {
            id: "slow",
            how: Misbehaviour::Sleep(std::time::Duration::from_secs(5)),
        },
        Misbehaving {
            id: "panicky",
            how: Misbehaviour::Panic,
        },
        Misbehaving {
            id: "failing",
            how: Misbehaviour::Fail,
        },
    ] {
        let id = chamber.id;
        registry.dock(Arc::new(chamber)).unwrap();
        registry.transition(id, ChamberMode::Shadow).await.unwrap();
    }

    let receipt = registry
        .bus()
        .publish(job("j-1", Some("us-west"), 0))
        .await
        .unwrap();
    assert_eq!(receipt.delivered, vec!["outerim".to_string()]);
    assert_eq!(receipt.failures.len(), 3);
    assert_eq!(registry.get_status("outerim").unwrap().events_received, 1);

    let kind_of = |id: &str| {
        receipt
            .failures
            .iter()
            .find(|f| f.chamber_id == id)
            .map(|f| f.kind.clone())
            .unwrap()
    };
    assert_eq!(kind_of("slow"), FailureKind::TimedOut { after_ms: 50 });
    assert!(matches!(kind_of("panicky"), FailureKind::Panicked { message } if message.contains("blew up")));
    assert!(matches!(kind_of("failing"), FailureKind::Error { message } if message.contains("unavailable")));
    assert_eq!(monitor.failures.lock().len(), 3);

    let stats = registry.bus().get_stats();
    assert_eq!(stats.chambers["slow"].timed_out, 1);
    assert_eq!(stats.chambers["panicky"].panicked, 1);
    assert_eq!(stats.chambers["outerim"].delivered, 1);

    assert_eq!(registry.get_status("slow").unwrap().health, ChamberHealth::Degraded);
    assert_eq!(registry.get_status("failing").unwrap().health, ChamberHealth::Degraded);

    // The bus stays usable
    let next = registry
        .bus()
        .publish(job("j-2", Some("us-west"), 1))
        .await
        .unwrap();
    assert_eq!(next.sequence, receipt.sequence + 1);
}

/// Records subjects in arrival order
struct Recorder {
    seen: Mutex<Vec<String>>,
}

#[async_trait]
impl Chamber for Recorder {
    fn id(&self) -> &str {
        "recorder"
    }
    fn name(&self) -> &str {
        "recorder"
    }
    fn subscriptions(&self) -> &[EventType] {
        &[EventType::JobCreated]
    }
    async fn on_event(&self, event: &PlatformEvent) -> Result<Option<ChamberInfluence>> {
        self.seen.lock().push(event.subject_id().to_string());
        Ok(None)
    }
    fn get_status(&self) -> Result<ChamberStatus> {
        Err(anyhow!("not tracked"))
    }
    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult {
        BacktestResult::insufficient("recorder", from, to, 0, 5, 70)
    }
    fn on_mode_change(&self, _previous: ChamberMode, _next: ChamberMode) {}
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn test_concurrent_publishes_delivered_in_sequence_order() {
    let registry = Arc::new(registry());
    let recorder = Arc::new(Recorder {
        seen: Mutex::new(Vec::new()),
    });
    registry.dock(recorder.clone()).unwrap();

    let mut handles = Vec::new();
    for i in 0..32 {
        let registry = registry.clone();
        handles.push(tokio::spawn(async move {
            let id = format!("j-{}", i);
            let receipt = registry
                .bus()
                .publish(job(&id, Some("us-west"), i))
                .await
                .unwrap();
            (id, receipt.sequence)
        }));
    }

    let mut by_sequence = Vec::new();
    for handle in handles {
        by_sequence.push(handle.await.unwrap());
    }
    by_sequence.sort_by_key(|(_, seq)| *seq);

    let expected: Vec<String> = by_sequence.into_iter().map(|(id, _)| id).collect();
    assert_eq!(*recorder.seen.lock(), expected);
}
