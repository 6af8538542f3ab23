//! Chambers: pluggable analytic units fed by the event bus.
//!
//! A chamber owns its accumulated state outright. The registry decides its
//! mode and tells it through [`Chamber::on_mode_change`]; a chamber never
//! promotes itself.

pub mod outer_rim;

pub use outer_rim::{OuterRimChamber, OuterRimConfig};

use anyhow::Result;
use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::events::{EventType, PlatformEvent};
use crate::models::{BacktestResult, ChamberInfluence, ChamberMode, ChamberStatus};

/// Capability set every chamber implements
#[async_trait]
pub trait Chamber: Send + Sync {
    /// Globally unique id used by the registry
    fn id(&self) -> &str;

    fn name(&self) -> &str;

    /// Event types the bus should deliver to this chamber
    fn subscriptions(&self) -> &[EventType];

    /// Accumulate the event and, only when ACTIVE, maybe recommend something.
    ///
    /// Must count every delivered event, including ones whose payload the
    /// chamber ignores.
    async fn on_event(&self, event: &PlatformEvent) -> Result<Option<ChamberInfluence>>;

    /// Snapshot derived from accumulated records. Never mutates.
    fn get_status(&self) -> Result<ChamberStatus>;

    /// Replay own records in `[from, to]` with the live heuristic
    fn run_backtest(&self, from: DateTime<Utc>, to: DateTime<Utc>) -> BacktestResult;

    /// Bookkeeping hook; idempotent and infallible
    fn on_mode_change(&self, previous: ChamberMode, next: ChamberMode);
}
