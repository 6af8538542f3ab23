//! Backtest-driven promotion and demotion.
//!
//! SHADOW chambers that pass a trailing-window backtest go ACTIVE. ACTIVE
//! chambers that keep failing, or whose health degrades, drop back to SHADOW.
//! OFFLINE chambers are left where an operator put them.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use std::sync::Arc;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use super::{ChamberRegistry, RegistryError};
use crate::models::{BacktestResult, ChamberHealth, ChamberMode};

#[derive(Debug, Clone)]
pub struct PromotionPolicy {
    /// Trailing window each evaluation backtests over
    pub window: Duration,
    /// Failed backtests in a row before an ACTIVE chamber is demoted
    pub max_consecutive_failures: u32,
    /// Scheduler period
    pub interval: std::time::Duration,
}

impl Default for PromotionPolicy {
    fn default() -> Self {
        Self {
            window: Duration::hours(24),
            max_consecutive_failures: 3,
            interval: std::time::Duration::from_secs(300),
        }
    }
}

impl PromotionPolicy {
    /// Load from environment with defaults
    pub fn from_env() -> Self {
        let mut policy = Self::default();

        if let Ok(v) = std::env::var("PROMOTION_WINDOW_HOURS") {
            if let Ok(h) = v.parse::<i64>() {
                if let Some(window) = Duration::try_hours(h).filter(|_| h > 0) {
                    policy.window = window;
                }
            }
        }
        if let Ok(v) = std::env::var("PROMOTION_MAX_FAILURES") {
            if let Ok(n) = v.parse::<u32>() {
                policy.max_consecutive_failures = n.max(1);
            }
        }
        if let Ok(v) = std::env::var("PROMOTION_INTERVAL_SECS") {
            if let Ok(s) = v.parse::<u64>() {
                if s > 0 {
                    policy.interval = std::time::Duration::from_secs(s);
                }
            }
        }

        policy
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PromotionAction {
    Promoted,
    Demoted,
    Held,
}

#[derive(Debug, Clone, Serialize)]
pub struct PromotionDecision {
    pub chamber_id: String,
    pub mode_before: ChamberMode,
    pub mode_after: ChamberMode,
    pub action: PromotionAction,
    pub reason: String,
    pub consecutive_failures: u32,
    pub backtest: BacktestResult,
    pub decided_at: DateTime<Utc>,
}

impl ChamberRegistry {
    /// Backtest the trailing window ending at `now` and apply the policy
    pub async fn evaluate_promotion(
        &self,
        chamber_id: &str,
        now: DateTime<Utc>,
        policy: &PromotionPolicy,
    ) -> Result<PromotionDecision, RegistryError> {
        let mode_before = self.mode_of(chamber_id)?;
        let from = now
            .checked_sub_signed(policy.window)
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let backtest = self.run_backtest(chamber_id, from, now).await?;
        let failures = self.consecutive_failures(chamber_id)?;

        let (action, reason) = match mode_before {
            ChamberMode::Offline => (
                PromotionAction::Held,
                "offline chambers are only moved by an operator".to_string(),
            ),
            ChamberMode::Shadow if backtest.passed => (
                PromotionAction::Promoted,
                format!("backtest passed with score {}", backtest.score),
            ),
            ChamberMode::Shadow => (
                PromotionAction::Held,
                format!(
                    "score {} below threshold {}",
                    backtest.score, backtest.pass_threshold
                ),
            ),
            ChamberMode::Active => {
                let health = self.get_status(chamber_id)?.health;
                if failures >= policy.max_consecutive_failures {
                    (
                        PromotionAction::Demoted,
                        format!("{} consecutive failed backtests", failures),
                    )
                } else if health == ChamberHealth::Degraded {
                    (PromotionAction::Demoted, "chamber health degraded".to_string())
                } else {
                    (PromotionAction::Held, "active and healthy".to_string())
                }
            }
        };

        // Apply only if nobody moved the chamber while the backtest ran
        let target = match action {
            PromotionAction::Promoted => Some(ChamberMode::Active),
            PromotionAction::Demoted => Some(ChamberMode::Shadow),
            PromotionAction::Held => None,
        };
        let (action, reason, mode_after) = match target {
            Some(next) => match self.transition_if(chamber_id, mode_before, next).await? {
                Some(record) => (action, reason, record.next),
                None => {
                    let current = self.mode_of(chamber_id)?;
                    (
                        PromotionAction::Held,
                        format!(
                            "mode changed from {} to {} during evaluation",
                            mode_before, current
                        ),
                        current,
                    )
                }
            },
            None => (action, reason, mode_before),
        };

        if action == PromotionAction::Held {
            debug!(chamber = %chamber_id, mode = %mode_before, reason = %reason, "promotion_held");
        } else {
            info!(
                chamber = %chamber_id,
                from = %mode_before,
                to = %mode_after,
                reason = %reason,
                "promotion_decision"
            );
        }

        Ok(PromotionDecision {
            chamber_id: chamber_id.to_string(),
            mode_before,
            mode_after,
            action,
            reason,
            consecutive_failures: failures,
            backtest,
            decided_at: Utc::now(),
        })
    }
}

/// Evaluate every docked chamber once per `policy.interval`
pub fn spawn_promotion_scheduler(
    registry: Arc<ChamberRegistry>,
    policy: PromotionPolicy,
) -> JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(policy.interval);
        ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        // First tick completes immediately
        ticker.tick().await;

        info!(interval_secs = policy.interval.as_secs(), "promotion_scheduler_started");
        loop {
            ticker.tick().await;
            for id in registry.get_docked_chamber_ids() {
                if let Err(e) = registry.evaluate_promotion(&id, Utc::now(), &policy).await {
                    warn!(chamber = %id, error = %e, "promotion_evaluation_failed");
                }
            }
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bus::EventBus;
    use crate::chambers::OuterRimChamber;
    use crate::chambers::Chamber;
    use crate::events::{
        EventPayload, EventType, GpuListed, GpuStatus, JobCreated, PlatformEvent, SupplyTier,
    };
    use crate::models::{ChamberInfluence, ChamberStatus};
    use async_trait::async_trait;

    async fn seeded(matched_jobs: usize, unmatched_jobs: usize) -> ChamberRegistry {
        let registry = ChamberRegistry::new(Arc::new(EventBus::default()));
        registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
        let bus = Arc::clone(registry.bus());
        let base = Utc::now() - Duration::minutes(30);

        bus.publish(PlatformEvent::new(
            "g-1",
            base,
            EventPayload::GpuListed(GpuListed {
                gpu_id: "g-1".to_string(),
                region: "us-west".to_string(),
                supply_tier: SupplyTier::Edge,
                gpu_type: None,
                price_per_hour: None,
                status: GpuStatus::Online,
            }),
        ))
        .await
        .unwrap();

        let jobs = (0..matched_jobs)
            .map(|_| "us-west")
            .chain((0..unmatched_jobs).map(|_| "ap-south"));
        for (i, region) in jobs.enumerate() {
            let job_id = format!("j-{}", i);
            bus.publish(PlatformEvent::new(
                job_id.clone(),
                base + Duration::minutes(i as i64 + 1),
                EventPayload::JobCreated(JobCreated {
                    job_id,
                    region: Some(region.to_string()),
                    gpu_type: None,
                    gpu_count: 1,
                    max_price_per_hour: None,
                }),
            ))
            .await
            .unwrap();
        }
        registry
    }

    #[tokio::test]
    async fn test_shadow_promoted_on_pass() {
        let registry = seeded(5, 0).await;
        registry.transition("outerim", ChamberMode::Shadow).await.unwrap();

        let decision = registry
            .evaluate_promotion("outerim", Utc::now(), &PromotionPolicy::default())
            .await
            .unwrap();
        assert_eq!(decision.action, PromotionAction::Promoted);
        assert_eq!(decision.mode_after, ChamberMode::Active);
        assert_eq!(registry.mode_of("outerim").unwrap(), ChamberMode::Active);
    }

    #[tokio::test]
    async fn test_offline_never_moved() {
        let registry = seeded(5, 0).await;
        let decision = registry
            .evaluate_promotion("outerim", Utc::now(), &PromotionPolicy::default())
            .await
            .unwrap();
        assert_eq!(decision.action, PromotionAction::Held);
        assert!(decision.backtest.passed);
        assert_eq!(registry.mode_of("outerim").unwrap(), ChamberMode::Offline);
    }

    #[tokio::test]
    async fn test_active_demoted_after_repeated_failures() {
        let registry = seeded(2, 4).await;
        registry.transition("outerim", ChamberMode::Active).await.unwrap();
        let policy = PromotionPolicy {
            max_consecutive_failures: 2,
            ..Default::default()
        };

        let first = registry
            .evaluate_promotion("outerim", Utc::now(), &policy)
            .await
            .unwrap();
        assert_eq!(first.action, PromotionAction::Held);

        let second = registry
            .evaluate_promotion("outerim", Utc::now(), &policy)
            .await
            .unwrap();
        assert_eq!(second.action, PromotionAction::Demoted);
        assert_eq!(registry.mode_of("outerim").unwrap(), ChamberMode::Shadow);
    }

    #[tokio::test]
    async fn test_active_demoted_when_health_degraded() {
        let registry = ChamberRegistry::new(Arc::new(EventBus::default()));
        registry.dock(Arc::new(OuterRimChamber::default())).unwrap();
        registry.transition("outerim", ChamberMode::Active).await.unwrap();

        // Counted but nothing accumulated
        registry
            .bus()
            .publish(PlatformEvent::new(
                "j-1",
                Utc::now(),
                EventPayload::JobCreated(JobCreated {
                    job_id: "j-1".to_string(),
                    region: None,
                    gpu_type: None,
                    gpu_count: 1,
                    max_price_per_hour: None,
                }),
            ))
            .await
            .unwrap();
        assert_eq!(
            registry.get_status("outerim").unwrap().health,
            ChamberHealth::Degraded
        );

        let decision = registry
            .evaluate_promotion("outerim", Utc::now(), &PromotionPolicy::default())
            .await
            .unwrap();
        assert_eq!(decision.action, PromotionAction::Demoted);
        assert_eq!(decision.reason, "chamber health degraded");
        assert_eq!(decision.consecutive_failures, 1);
        assert_eq!(decision.mode_after, ChamberMode::Shadow);
        assert_eq!(registry.mode_of("outerim").unwrap(), ChamberMode::Shadow);
    }

    /// Always passes, but takes a while to say so
    struct SlowPasser;

    #[async_trait]
    impl Chamber for SlowPasser {
        fn id(&self) -> &str {
            "slow"
        }
        fn name(&self) -> &str {
            "slow passer"
        }
        fn subscriptions(&self) -> &[EventType] {
            &[]
        }
        async fn on_event(&self, _event: &PlatformEvent) -> anyhow::Result<Option<ChamberInfluence>> {
            Ok(None)
        }
        fn get_status(&self) -> anyhow::Result<ChamberStatus> {
            Ok(ChamberStatus::unavailable("slow", "no state"))
        }
        fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult {
            std::thread::sleep(std::time::Duration::from_millis(300));
            BacktestResult {
                matched: 10,
                score: 100,
                improvement_pct: 100.0,
                passed: true,
                summary: "all matched".to_string(),
                ..BacktestResult::insufficient("slow", from, to, 10, 5, 70)
            }
        }
        fn on_mode_change(&self, _previous: ChamberMode, _next: ChamberMode) {}
    }

    #[tokio::test]
    async fn test_operator_transition_during_backtest_wins() {
        let registry = Arc::new(ChamberRegistry::new(Arc::new(EventBus::default())));
        registry.dock(Arc::new(SlowPasser)).unwrap();
        registry.transition("slow", ChamberMode::Shadow).await.unwrap();

        let evaluating = {
            let registry = Arc::clone(&registry);
            tokio::spawn(async move {
                registry
                    .evaluate_promotion("slow", Utc::now(), &PromotionPolicy::default())
                    .await
            })
        };
        tokio::time::sleep(std::time::Duration::from_millis(50)).await;
        registry.transition("slow", ChamberMode::Offline).await.unwrap();

        let decision = evaluating.await.unwrap().unwrap();
        assert!(decision.backtest.passed);
        assert_eq!(decision.mode_before, ChamberMode::Shadow);
        assert_eq!(decision.action, PromotionAction::Held);
        assert_eq!(decision.mode_after, ChamberMode::Offline);
        assert_eq!(registry.mode_of("slow").unwrap(), ChamberMode::Offline);
    }

    #[tokio::test]
    async fn test_unknown_chamber() {
        let registry = ChamberRegistry::new(Arc::new(EventBus::default()));
        let err = registry
            .evaluate_promotion("ghost", Utc::now(), &PromotionPolicy::default())
            .await
            .unwrap_err();
        assert_eq!(err, RegistryError::UnknownChamber("ghost".to_string()));
    }
}
