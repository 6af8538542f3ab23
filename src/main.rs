//! chamberd: chamber platform daemon
//!
//! Builds the bus and registry, docks the outerim chamber, runs the promotion
//! scheduler and serves probes, ingest and control over HTTP.

use anyhow::{Context, Result};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tracing::{error, info};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chamber_platform::{
    api::{self, AppState},
    auth::authorizer_from_env,
    bus::{EventBus, MemoryLedger},
    config::Config,
    influence::InfluenceBoard,
    registry::{spawn_promotion_scheduler, ChamberRegistry},
    OuterRimChamber,
};

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();

    let config = Config::from_env().context("Failed to load configuration")?;
    info!(
        port = config.port,
        delivery_timeout_ms = config.bus.delivery_timeout.as_millis() as u64,
        ledger_capacity = config.ledger_capacity,
        "chamberd starting"
    );

    let ledger = Arc::new(MemoryLedger::new(config.ledger_capacity));
    let influence = Arc::new(InfluenceBoard::new(config.influence_capacity));
    let bus = Arc::new(
        EventBus::new(config.bus.clone())
            .with_ledger(ledger)
            .with_influence_sink(influence.clone()),
    );
    let registry = Arc::new(ChamberRegistry::new(bus));

    let outerim_id = config.outerim.chamber_id.clone();
    registry
        .dock(Arc::new(OuterRimChamber::new(config.outerim.clone())))
        .context("Failed to dock outerim")?;
    if let Some(mode) = config.outerim_initial_mode {
        registry
            .transition(&outerim_id, mode)
            .await
            .context("Failed to apply initial outerim mode")?;
    }

    let scheduler = config
        .promotion_enabled
        .then(|| spawn_promotion_scheduler(registry.clone(), config.promotion.clone()));
    let pruner = tokio::spawn(influence_pruning(influence.clone()));

    let state = AppState {
        registry: registry.clone(),
        influence,
        promotion: config.promotion.clone(),
        probe_timeout: config.probe_timeout,
    };
    let app = api::router(state, authorizer_from_env());

    let addr = format!("0.0.0.0:{}", config.port);
    let listener = TcpListener::bind(&addr)
        .await
        .with_context(|| format!("Failed to bind {}", addr))?;
    info!("API server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await
        .context("Server error")?;

    if let Some(scheduler) = scheduler {
        scheduler.abort();
    }
    pruner.abort();
    registry.shutdown().await;
    info!("chamberd stopped");

    Ok(())
}

/// Drop expired influence once a minute
async fn influence_pruning(board: Arc<InfluenceBoard>) {
    let mut ticker = tokio::time::interval(Duration::from_secs(60));
    loop {
        ticker.tick().await;
        let removed = board.prune(chrono::Utc::now());
        if removed > 0 {
            tracing::debug!(removed, remaining = board.len(), "influence_pruned");
        }
    }
}

async fn shutdown_signal() {
    if let Err(e) = tokio::signal::ctrl_c().await {
        error!(error = %e, "failed to listen for ctrl-c");
        std::future::pending::<()>().await;
    }
    info!("shutdown requested");
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chamber_platform=debug,chamberd=debug,tower_http=debug".into()),
        )
        .with(tracing_subscriber::fmt::layer())
        .init();
}
