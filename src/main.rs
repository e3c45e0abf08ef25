//! ==============================================================================
//! main.rs - plant guardian entry point
//! ==============================================================================
//!
//! purpose:
//!     relays soil-moisture readings from an mqtt broker to browser clients
//!     so the guardian character on the viewer page can live, die, or swipe.
//!
//! responsibilities:
//!     - load configuration and set up logging
//!     - run the mqtt sensor feed on its own task
//!     - serve the viewer page, the exported models and the live websocket
//!     - or, in `listen` mode, just print every sensor message to the terminal
//!
//! relationships:
//!     - uses: config.rs (guardian.toml)
//!     - uses: feed.rs (mqtt connection, SensorSink trait)
//!     - uses: bridge.rs (view state + broadcast, the relay core)
//!     - uses: server.rs (axum routes and websocket sessions)
//!     - uses: listener.rs (console output for listen mode)
//!
//! architecture:
//!
//!     ┌─────────────────────────────────────────────────────────────┐
//!     │                      plant-guardian                          │
//!     │  ┌─────────────┐     ┌─────────────┐     ┌───────────────┐   │
//!     │  │ sensor feed │ ──> │   bridge    │ ──> │  client hub   │   │
//!     │  │ (mqtt task) │     │ (ViewState) │     │ (per-client q)│   │
//!     │  └─────────────┘     └──────┬──────┘     └───────┬───────┘   │
//!     │                             │ snapshot on join   │ frames    │
//!     │                      ┌──────┴────────────────────┴──────┐    │
//!     │                      │     web server (axum, :5000)     │    │
//!     │                      └──────────────────────────────────┘    │
//!     └─────────────────────────────────────────────────────────────┘
//!
//! ==============================================================================

mod bridge;
mod classify;
mod config;
mod domain;
mod feed;
mod hub;
mod listener;
mod server;

use std::path::PathBuf;
use std::sync::Arc;

use anyhow::{bail, Context, Result};
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bridge::Bridge;
use crate::config::{GuardianConfig, LoggingConfig};
use crate::feed::SensorFeed;
use crate::listener::ConsoleListener;

const USAGE: &str = "usage: plant-guardian [relay|listen] [--config <path>]";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Mode {
    /// mqtt feed + web viewer
    Relay,
    /// print sensor messages to the terminal
    Listen,
}

#[derive(Debug, PartialEq, Eq)]
struct Args {
    mode: Mode,
    config_path: Option<PathBuf>,
}

fn parse_args<I>(args: I) -> Result<Option<Args>>
where
    I: IntoIterator<Item = String>,
{
    let mut mode = Mode::Relay;
    let mut config_path = None;
    let mut args = args.into_iter();

    while let Some(arg) = args.next() {
        match arg.as_str() {
            "relay" => mode = Mode::Relay,
            "listen" => mode = Mode::Listen,
            "--config" | "-c" => {
                let path = args.next().context("--config needs a path")?;
                config_path = Some(PathBuf::from(path));
            }
            "--help" | "-h" => return Ok(None),
            other => bail!("unknown argument {other:?}\n{USAGE}"),
        }
    }

    Ok(Some(Args { mode, config_path }))
}

/// RUST_LOG wins over the configured level. GUARDIAN_LOG_FORMAT=json switches
/// to newline-delimited json.
fn init_logging(logging: &LoggingConfig) {
    let env_filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(&logging.level));

    if std::env::var("GUARDIAN_LOG_FORMAT").as_deref() == Ok("json") {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .json()
            .init();
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(env_filter)
            .with_target(true)
            .compact()
            .init();
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    let Some(args) = parse_args(std::env::args().skip(1))? else {
        println!("{USAGE}");
        return Ok(());
    };

    // step 1: load configuration
    let config = match &args.config_path {
        Some(path) => GuardianConfig::load(path)?,
        None => GuardianConfig::load_or_default(),
    };
    init_logging(&config.logging);

    // startup banner
    println!("===========================================================");
    println!("  🌱 Plant Guardian");
    println!("===========================================================");
    config.print_summary();

    match args.mode {
        Mode::Relay => run_relay(config).await,
        Mode::Listen => run_listener(config).await,
    }
}

async fn run_relay(config: GuardianConfig) -> Result<()> {
    // step 2: shared view state + client registry
    let bridge = Arc::new(
        Bridge::new(&config.moisture, config.server.client_queue)
            .with_sensor_echo(config.logging.show_sensor_data),
    );

    // step 3: sensor feed in background; a dead feed leaves the viewer up
    let feed = SensorFeed::new(&config.broker);
    let feed_bridge = Arc::clone(&bridge);
    tokio::spawn(async move {
        match feed.run(feed_bridge.as_ref()).await {
            Ok(()) => info!("sensor feed finished"),
            Err(e) => {
                error!("sensor feed stopped: {}", e);
                warn!("no live sensor data until restart");
            }
        }
    });

    println!("\n🌿 Waiting for sensor data...");

    // step 4: web server in the foreground
    server::run(bridge, &config.server).await
}

async fn run_listener(config: GuardianConfig) -> Result<()> {
    let feed = SensorFeed::new(&config.broker);
    println!("Connecting to broker {}:{} ...", config.broker.host, config.broker.port);
    info!(topic = feed.topic(), "listening");

    feed.run(&ConsoleListener)
        .await
        .context("sensor feed stopped")
}
