//! chamberctl: operator CLI for chamberd
//!
//! Usage:
//!   chamberctl status [--detailed]
//!   chamberctl transition outerim SHADOW
//!   chamberctl backtest outerim --window-hours 6
//!   chamberctl publish events.jsonl
//!   chamberctl replay events.jsonl --mode ACTIVE
//!
//! Environment Variables:
//!   CHAMBERD_URL   - Daemon base URL (default: http://127.0.0.1:8080)
//!   CHAMBERD_TOKEN - Operator bearer token

use anyhow::{bail, Context, Result};
use chrono::{DateTime, Duration, Utc};
use clap::{Parser, Subcommand};
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tracing::{debug, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use chamber_platform::{
    events::load_jsonl, ChamberMode, ChamberRegistry, EventBus, OuterRimChamber, OuterRimConfig,
    PlatformEvent,
};

#[derive(Parser, Debug)]
#[command(name = "chamberctl")]
#[command(about = "Inspect and steer chambers on a running chamberd")]
struct Cli {
    /// Daemon base URL
    #[arg(long, env = "CHAMBERD_URL", default_value = "http://127.0.0.1:8080")]
    url: String,

    /// Operator bearer token
    #[arg(long, env = "CHAMBERD_TOKEN")]
    token: Option<String>,

    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand, Debug)]
enum Command {
    /// Platform health
    Status {
        /// Per-chamber detail (needs a token)
        #[arg(long)]
        detailed: bool,
    },
    /// Move a chamber to OFFLINE, SHADOW or ACTIVE
    Transition { chamber_id: String, mode: ChamberMode },
    /// Backtest a chamber over a window
    Backtest {
        chamber_id: String,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
        #[arg(long)]
        window_hours: Option<i64>,
    },
    /// Run the promotion policy for one chamber now
    Promote { chamber_id: String },
    /// Publish every event in a JSONL file
    Publish { file: PathBuf },
    /// Replay a JSONL file through an in-process outerim and print its backtest
    Replay {
        file: PathBuf,
        /// Mode outerim is in while the file is replayed
        #[arg(long, default_value = "SHADOW")]
        mode: ChamberMode,
        #[arg(long)]
        from: Option<DateTime<Utc>>,
        #[arg(long)]
        to: Option<DateTime<Utc>>,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    init_tracing();
    let cli = Cli::parse();

    let output = match cli.command {
        Command::Replay {
            ref file,
            mode,
            from,
            to,
        } => replay(file, mode, from, to).await?,
        ref command => {
            let client = DaemonClient::new(&cli.url, cli.token.clone());
            remote(&client, command).await?
        }
    };

    println!("{}", serde_json::to_string_pretty(&output)?);
    Ok(())
}

async fn remote(client: &DaemonClient, command: &Command) -> Result<Value> {
    match command {
        Command::Status { detailed } => {
            let path = if *detailed { "/health/detailed" } else { "/health" };
            client.get(path).await
        }
        Command::Transition { chamber_id, mode } => {
            client
                .post(
                    &format!("/control/chambers/{}/transition", chamber_id),
                    &json!({ "mode": mode }),
                )
                .await
        }
        Command::Backtest {
            chamber_id,
            from,
            to,
            window_hours,
        } => {
            let mut query = Vec::new();
            if let Some(from) = from {
                query.push(("from", from.to_rfc3339()));
            }
            if let Some(to) = to {
                query.push(("to", to.to_rfc3339()));
            }
            if let Some(hours) = window_hours {
                query.push(("window_hours", hours.to_string()));
            }
            client
                .post_query(&format!("/control/chambers/{}/backtest", chamber_id), &query)
                .await
        }
        Command::Promote { chamber_id } => {
            client
                .post(&format!("/control/chambers/{}/promotion", chamber_id), &json!({}))
                .await
        }
        Command::Publish { file } => {
            let events = load_jsonl(file)?;
            let mut accepted = 0usize;
            let mut rejected = Vec::new();
            for (idx, event) in events.iter().enumerate() {
                match client.post("/events", &serde_json::to_value(event)?).await {
                    Ok(_) => accepted += 1,
                    Err(e) => {
                        warn!(line = idx + 1, error = %e, "event rejected");
                        rejected.push(json!({ "line": idx + 1, "error": e.to_string() }));
                    }
                }
            }
            Ok(json!({ "accepted": accepted, "rejected": rejected }))
        }
        Command::Replay { .. } => bail!("replay runs in-process"),
    }
}

/// Dock a fresh outerim, publish the file through a local bus and backtest it
async fn replay(
    file: &PathBuf,
    mode: ChamberMode,
    from: Option<DateTime<Utc>>,
    to: Option<DateTime<Utc>>,
) -> Result<Value> {
    let raw = load_jsonl(file)?;

    let registry = ChamberRegistry::new(Arc::new(EventBus::default()));
    let config = OuterRimConfig::default();
    let chamber_id = config.chamber_id.clone();
    registry.dock(Arc::new(OuterRimChamber::new(config)))?;
    registry.transition(&chamber_id, mode).await?;

    let mut published = 0usize;
    let mut influences = 0usize;
    let mut rejected = Vec::new();
    let mut first: Option<DateTime<Utc>> = None;
    let mut last: Option<DateTime<Utc>> = None;

    for (idx, event) in raw.into_iter().enumerate() {
        let event = match PlatformEvent::from_raw(event) {
            Ok(event) => event,
            Err(e) => {
                rejected.push(json!({ "line": idx + 1, "error": e.to_string() }));
                continue;
            }
        };
        let ts = event.timestamp();
        first = Some(first.map_or(ts, |f| f.min(ts)));
        last = Some(last.map_or(ts, |l| l.max(ts)));

        let receipt = registry.bus().publish(event).await?;
        published += 1;
        influences += receipt.influences.len();
    }

    let to = to.or(last).unwrap_or_else(Utc::now);
    let from = from.or(first).unwrap_or(to - Duration::hours(24));
    debug!(%from, %to, published, "replay backtest window");

    let backtest = registry.run_backtest(&chamber_id, from, to).await?;
    let status = registry.get_status(&chamber_id)?;
    registry.shutdown().await;

    Ok(json!({
        "published": published,
        "rejected": rejected,
        "influences": influences,
        "status": status,
        "backtest": backtest,
    }))
}

struct DaemonClient {
    http: reqwest::Client,
    base: String,
    token: Option<String>,
}

impl DaemonClient {
    fn new(base: &str, token: Option<String>) -> Self {
        Self {
            http: reqwest::Client::new(),
            base: base.trim_end_matches('/').to_string(),
            token,
        }
    }

    fn request(&self, method: reqwest::Method, path: &str) -> reqwest::RequestBuilder {
        let req = self.http.request(method, format!("{}{}", self.base, path));
        match &self.token {
            Some(token) => req.bearer_auth(token),
            None => req,
        }
    }

    async fn get(&self, path: &str) -> Result<Value> {
        Self::read(self.request(reqwest::Method::GET, path).send().await?).await
    }

    async fn post(&self, path: &str, body: &Value) -> Result<Value> {
        Self::read(
            self.request(reqwest::Method::POST, path)
                .json(body)
                .send()
                .await?,
        )
        .await
    }

    async fn post_query(&self, path: &str, query: &[(&str, String)]) -> Result<Value> {
        Self::read(
            self.request(reqwest::Method::POST, path)
                .query(query)
                .send()
                .await?,
        )
        .await
    }

    /// Health probes answer 503 with a body worth printing
    async fn read(resp: reqwest::Response) -> Result<Value> {
        let status = resp.status();
        let body: Value = resp
            .json()
            .await
            .with_context(|| format!("Unreadable response (HTTP {})", status))?;
        if status.is_success() || status == reqwest::StatusCode::SERVICE_UNAVAILABLE {
            Ok(body)
        } else {
            let message = body
                .get("error")
                .and_then(|e| e.as_str())
                .unwrap_or("request failed");
            bail!("HTTP {}: {}", status.as_u16(), message)
        }
    }
}

fn init_tracing() {
    tracing_subscriber::registry()
        .with(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "chamberctl=info,chamber_platform=warn".into()),
        )
        .with(tracing_subscriber::fmt::layer().with_writer(std::io::stderr))
        .init();
}
