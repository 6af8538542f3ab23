//! Chamber Registry
//!
//! Owns docked chambers and their modes. It is the only place modes change
//! and the only way to enumerate chambers. Each chamber shares its mode cell
//! with the bus so influence gating always sees the registry's view.

pub mod promotion;

pub use promotion::{spawn_promotion_scheduler, PromotionAction, PromotionDecision, PromotionPolicy};

use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};
use serde::Serialize;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use tracing::{error, info, warn};

use crate::bus::{panic_message, EventBus, ModeCell};
use crate::chambers::Chamber;
use crate::models::{BacktestResult, ChamberHealth, ChamberMode, ChamberStatus};

// =============================================================================
// ERRORS
// =============================================================================

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum RegistryError {
    UnknownChamber(String),
    DuplicateChamberId(String),
    InvalidChamberId(String),
    /// The blocking backtest worker died before returning a result
    BacktestWorker { chamber_id: String, reason: String },
}

impl std::fmt::Display for RegistryError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::UnknownChamber(id) => write!(f, "unknown chamber '{}'", id),
            Self::DuplicateChamberId(id) => write!(f, "chamber '{}' is already docked", id),
            Self::InvalidChamberId(id) => write!(f, "invalid chamber id '{}'", id),
            Self::BacktestWorker { chamber_id, reason } => {
                write!(f, "backtest for '{}' failed: {}", chamber_id, reason)
            }
        }
    }
}

impl std::error::Error for RegistryError {}

/// Outcome of one `transition` call
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct TransitionRecord {
    pub chamber_id: String,
    pub previous: ChamberMode,
    pub next: ChamberMode,
    /// False for a same-mode re-entry
    pub changed: bool,
    pub confirmed_at: DateTime<Utc>,
}

// =============================================================================
// REGISTRY
// =============================================================================

struct DockedChamber {
    chamber: Arc<dyn Chamber>,
    mode: ModeCell,
    /// Serializes transitions for this chamber id
    transition_lock: tokio::sync::Mutex<()>,
    docked_at: DateTime<Utc>,
    last_transition: Mutex<Option<TransitionRecord>>,
    last_backtest: Mutex<Option<BacktestResult>>,
    consecutive_failures: AtomicU32,
}

pub struct ChamberRegistry {
    bus: Arc<EventBus>,
    chambers: RwLock<HashMap<String, Arc<DockedChamber>>>,
}

impl ChamberRegistry {
    pub fn new(bus: Arc<EventBus>) -> Self {
        Self {
            bus,
            chambers: RwLock::new(HashMap::new()),
        }
    }

    pub fn bus(&self) -> &Arc<EventBus> {
        &self.bus
    }

    /// Dock a chamber in OFFLINE mode and subscribe it to its declared types
    pub fn dock(&self, chamber: Arc<dyn Chamber>) -> Result<(), RegistryError> {
        let id = chamber.id().to_string();
        if id.trim().is_empty() || id.trim() != id {
            return Err(RegistryError::InvalidChamberId(id));
        }

        let mut chambers = self.chambers.write();
        if chambers.contains_key(&id) {
            return Err(RegistryError::DuplicateChamberId(id));
        }

        let mode: ModeCell = Arc::new(RwLock::new(ChamberMode::Offline));
        self.bus.subscribe(Arc::clone(&chamber), Arc::clone(&mode));
        chambers.insert(
            id.clone(),
            Arc::new(DockedChamber {
                chamber,
                mode,
                transition_lock: tokio::sync::Mutex::new(()),
                docked_at: Utc::now(),
                last_transition: Mutex::new(None),
                last_backtest: Mutex::new(None),
                consecutive_failures: AtomicU32::new(0),
            }),
        );

        info!(chamber = %id, "chamber_docked");
        Ok(())
    }

    /// Unsubscribe and drop a chamber
    pub fn undock(&self, chamber_id: &str) -> Result<(), RegistryError> {
        let removed = self.chambers.write().remove(chamber_id);
        match removed {
            Some(docked) => {
                self.bus.unsubscribe(chamber_id);
                info!(
                    chamber = %chamber_id,
                    docked_for_secs = (Utc::now() - docked.docked_at).num_seconds(),
                    "chamber_undocked"
                );
                Ok(())
            }
            None => Err(RegistryError::UnknownChamber(chamber_id.to_string())),
        }
    }

    /// Move a chamber to `next`. Every mode pair is legal; re-entering the
    /// current mode only refreshes `confirmed_at`.
    pub async fn transition(
        &self,
        chamber_id: &str,
        next: ChamberMode,
    ) -> Result<TransitionRecord, RegistryError> {
        let docked = self.docked(chamber_id)?;
        let _serial = docked.transition_lock.lock().await;
        Ok(Self::apply_transition(chamber_id, &docked, next))
    }

    /// Move a chamber to `next` only if it is still in `expected` once the
    /// per-chamber transition lock is held. `None` means another transition
    /// got there first and nothing was changed.
    pub async fn transition_if(
        &self,
        chamber_id: &str,
        expected: ChamberMode,
        next: ChamberMode,
    ) -> Result<Option<TransitionRecord>, RegistryError> {
        let docked = self.docked(chamber_id)?;
        let _serial = docked.transition_lock.lock().await;

        let current = *docked.mode.read();
        if current != expected {
            warn!(
                chamber = %chamber_id,
                expected = %expected,
                current = %current,
                "conditional_transition_skipped"
            );
            return Ok(None);
        }
        Ok(Some(Self::apply_transition(chamber_id, &docked, next)))
    }

    /// Caller holds `transition_lock`
    fn apply_transition(
        chamber_id: &str,
        docked: &DockedChamber,
        next: ChamberMode,
    ) -> TransitionRecord {
        let previous = *docked.mode.read();
        let hook = catch_unwind(AssertUnwindSafe(|| {
            docked.chamber.on_mode_change(previous, next)
        }));
        if let Err(payload) = hook {
            error!(
                chamber = %chamber_id,
                panic = %panic_message(payload.as_ref()),
                "mode_change_hook_panicked"
            );
        }
        *docked.mode.write() = next;

        let record = TransitionRecord {
            chamber_id: chamber_id.to_string(),
            previous,
            next,
            changed: previous != next,
            confirmed_at: Utc::now(),
        };
        *docked.last_transition.lock() = Some(record.clone());

        if record.changed {
            info!(chamber = %chamber_id, from = %previous, to = %next, "chamber_transition");
        }
        record
    }

    /// Status of every docked chamber, sorted by id. A chamber whose status
    /// call errors or panics is reported as a synthetic OFFLINE entry.
    pub fn get_all_statuses(&self) -> Vec<ChamberStatus> {
        let mut docked: Vec<(String, Arc<DockedChamber>)> = self
            .chambers
            .read()
            .iter()
            .map(|(id, d)| (id.clone(), Arc::clone(d)))
            .collect();
        docked.sort_by(|a, b| a.0.cmp(&b.0));

        docked
            .iter()
            .map(|(id, d)| self.status_of(id, d))
            .collect()
    }

    pub fn get_status(&self, chamber_id: &str) -> Result<ChamberStatus, RegistryError> {
        let docked = self.docked(chamber_id)?;
        Ok(self.status_of(chamber_id, &docked))
    }

    /// Docked chamber ids, sorted
    pub fn get_docked_chamber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.chambers.read().keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn active_chamber_ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self
            .chambers
            .read()
            .iter()
            .filter(|(_, d)| *d.mode.read() == ChamberMode::Active)
            .map(|(id, _)| id.clone())
            .collect();
        ids.sort();
        ids
    }

    pub fn mode_of(&self, chamber_id: &str) -> Result<ChamberMode, RegistryError> {
        Ok(*self.docked(chamber_id)?.mode.read())
    }

    pub fn last_transition(&self, chamber_id: &str) -> Result<Option<TransitionRecord>, RegistryError> {
        Ok(self.docked(chamber_id)?.last_transition.lock().clone())
    }

    pub fn last_backtest(&self, chamber_id: &str) -> Result<Option<BacktestResult>, RegistryError> {
        Ok(self.docked(chamber_id)?.last_backtest.lock().clone())
    }

    /// Backtests that failed in a row, reset by the next pass
    pub fn consecutive_failures(&self, chamber_id: &str) -> Result<u32, RegistryError> {
        Ok(self
            .docked(chamber_id)?
            .consecutive_failures
            .load(Ordering::SeqCst))
    }

    /// Run the chamber's backtest on a blocking worker and record the result
    pub async fn run_backtest(
        &self,
        chamber_id: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<BacktestResult, RegistryError> {
        let docked = self.docked(chamber_id)?;
        let chamber = Arc::clone(&docked.chamber);

        let result = tokio::task::spawn_blocking(move || chamber.run_backtest(from, to))
            .await
            .map_err(|e| RegistryError::BacktestWorker {
                chamber_id: chamber_id.to_string(),
                reason: if e.is_panic() {
                    format!("backtest panicked: {}", panic_message(e.into_panic().as_ref()))
                } else {
                    e.to_string()
                },
            })?;

        if result.passed {
            docked.consecutive_failures.store(0, Ordering::SeqCst);
        } else {
            docked.consecutive_failures.fetch_add(1, Ordering::SeqCst);
        }
        *docked.last_backtest.lock() = Some(result.clone());

        info!(
            chamber = %chamber_id,
            score = result.score,
            replayed = result.events_replayed,
            passed = result.passed,
            "backtest_complete"
        );
        Ok(result)
    }

    /// Take every chamber OFFLINE and undock it
    pub async fn shutdown(&self) {
        for id in self.get_docked_chamber_ids() {
            if let Err(e) = self.transition(&id, ChamberMode::Offline).await {
                warn!(chamber = %id, error = %e, "shutdown_transition_failed");
            }
            if let Err(e) = self.undock(&id) {
                warn!(chamber = %id, error = %e, "shutdown_undock_failed");
            }
        }
        info!("registry_shutdown_complete");
    }

    fn docked(&self, chamber_id: &str) -> Result<Arc<DockedChamber>, RegistryError> {
        self.chambers
            .read()
            .get(chamber_id)
            .cloned()
            .ok_or_else(|| RegistryError::UnknownChamber(chamber_id.to_string()))
    }

    fn status_of(&self, chamber_id: &str, docked: &DockedChamber) -> ChamberStatus {
        let reported = catch_unwind(AssertUnwindSafe(|| docked.chamber.get_status()));
        let mut status = match reported {
            Ok(Ok(status)) => status,
            Ok(Err(e)) => {
                warn!(chamber = %chamber_id, error = %e, "chamber_status_failed");
                return ChamberStatus::unavailable(chamber_id, format!("{:#}", e));
            }
            Err(payload) => {
                let text = panic_message(payload.as_ref());
                error!(chamber = %chamber_id, panic = %text, "chamber_status_panicked");
                return ChamberStatus::unavailable(chamber_id, format!("status panicked: {}", text));
            }
        };

        // Registry owns the mode
        status.mode = *docked.mode.read();
        if status.mode == ChamberMode::Offline {
            status.health = ChamberHealth::Offline;
        } else if status.health == ChamberHealth::Healthy && self.bus.is_degraded(chamber_id) {
            status.health = ChamberHealth::Degraded;
        }
        if status.backtest_score.is_none() {
            status.backtest_score = docked.last_backtest.lock().as_ref().map(|r| r.score);
        }
        status
    }
}
