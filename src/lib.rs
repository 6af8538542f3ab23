//! Chamber Platform
//!
//! Routes marketplace events to pluggable analytic chambers, drives their
//! OFFLINE / SHADOW / ACTIVE lifecycle from backtests, and forwards the
//! influence ACTIVE chambers emit.
//!
//! The pieces are wired explicitly: build an [`bus::EventBus`], hand it to a
//! [`registry::ChamberRegistry`], dock chambers, publish events.

pub mod api;
pub mod auth;
pub mod bus;
pub mod chambers;
pub mod config;
pub mod events;
pub mod influence;
pub mod middleware;
pub mod models;
pub mod registry;

pub use bus::{BusConfig, BusError, EventBus, PublishReceipt};
pub use chambers::{Chamber, OuterRimChamber, OuterRimConfig};
pub use events::{EventPayload, EventType, PlatformEvent, RawPlatformEvent};
pub use models::{BacktestResult, ChamberHealth, ChamberInfluence, ChamberMode, ChamberStatus};
pub use registry::{ChamberRegistry, RegistryError, TransitionRecord};
