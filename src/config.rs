//! Daemon configuration assembled from the environment

use anyhow::{anyhow, Result};
use std::time::Duration;

use crate::bus::BusConfig;
use crate::chambers::OuterRimConfig;
use crate::models::ChamberMode;
use crate::registry::PromotionPolicy;

#[derive(Debug, Clone)]
pub struct Config {
    pub port: u16,
    pub bus: BusConfig,
    /// Capacity of the in-memory ledger copy
    pub ledger_capacity: usize,
    /// Capacity of the in-force influence board
    pub influence_capacity: usize,
    /// Deadline for the health probe to collect statuses
    pub probe_timeout: Duration,
    pub promotion: PromotionPolicy,
    /// Run the promotion scheduler at all
    pub promotion_enabled: bool,
    pub outerim: OuterRimConfig,
    /// Mode to move outerim into right after docking
    pub outerim_initial_mode: Option<ChamberMode>,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        dotenv::dotenv().ok();

        let port = std::env::var("PORT")
            .unwrap_or_else(|_| "8080".to_string())
            .parse()
            .unwrap_or(8080);

        let ledger_capacity = std::env::var("LEDGER_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(50_000);

        let influence_capacity = std::env::var("INFLUENCE_CAPACITY")
            .ok()
            .and_then(|v| v.parse::<usize>().ok())
            .filter(|&n| n > 0)
            .unwrap_or(1_000);

        let probe_timeout = std::env::var("PROBE_TIMEOUT_MS")
            .ok()
            .and_then(|v| v.parse::<u64>().ok())
            .filter(|&ms| ms > 0)
            .map(Duration::from_millis)
            .unwrap_or(Duration::from_millis(1_500));

        let promotion_enabled = std::env::var("PROMOTION_ENABLED")
            .map(|v| matches!(v.as_str(), "1" | "true" | "TRUE" | "on" | "ON"))
            .unwrap_or(true);

        let outerim_initial_mode = match std::env::var("OUTERIM_INITIAL_MODE") {
            Ok(v) if !v.trim().is_empty() => Some(
                v.parse::<ChamberMode>()
                    .map_err(|e| anyhow!("OUTERIM_INITIAL_MODE: {}", e))?,
            ),
            _ => None,
        };

        Ok(Self {
            port,
            bus: BusConfig::from_env(),
            ledger_capacity,
            influence_capacity,
            probe_timeout,
            promotion: PromotionPolicy::from_env(),
            promotion_enabled,
            outerim: OuterRimConfig::from_env(),
            outerim_initial_mode,
        })
    }
}
