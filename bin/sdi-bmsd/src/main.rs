//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Binary entrypoint for the SDI battery aggregation daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
mod publisher;
mod source;

use std::path::PathBuf;
use std::sync::Arc;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use clap::{Parser, Subcommand};
use sdi_bms_common::{init_tracing, AppConfig};
use sdi_bms_core::BmsEngine;
use sdi_bms_metrics::{new_registry, spawn_http_server, BmsMetrics, DaemonMetrics};
use sdi_bms_rt::{RateLimiter, TaskSet};
use tokio::signal;
use tracing::{info, warn};

use crate::publisher::MetricsPublisher;
use crate::source::{load_capture, replay_capture, run_simulation, DaemonEngine, FrameSource};

const SERVICE_NAME: &str = "sdi-bmsd";

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Samsung SDI battery aggregation and safety control daemon",
    long_about = None
)]
struct Cli {
    #[arg(long, value_name = "FILE", global = true, help = "Path to configuration file")]
    config: Option<PathBuf>,

    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Debug, Subcommand)]
enum Commands {
    #[command(about = "Drive the engine from a frame source")]
    Run {
        #[arg(
            long,
            default_value = "sim",
            value_name = "SOURCE",
            help = "Frame source: 'sim' or 'candump:<file>'"
        )]
        source: FrameSource,
    },
    #[command(about = "Validate the configuration and print the effective values")]
    CheckConfig,
}

#[tokio::main]
async fn main() -> Result<()> {
    let cli = Cli::parse();
    let mut candidates = Vec::new();
    if let Some(path) = &cli.config {
        candidates.push(path.clone());
    }
    candidates.push(PathBuf::from("configs/sdi-bms.toml"));
    candidates.push(PathBuf::from("configs/sdi-bms.example.toml"));

    let load_started = Instant::now();
    let loaded = AppConfig::load_with_source(&candidates)?;
    let load_duration = load_started.elapsed();

    let command = cli.command.unwrap_or(Commands::Run {
        source: FrameSource::Simulated,
    });
    match command {
        Commands::CheckConfig => {
            let rendered = toml::to_string_pretty(&loaded.config)
                .context("unable to render configuration")?;
            println!("# source: {}\n{}", loaded.source.display(), rendered);
        }
        Commands::Run { source } => {
            init_tracing(SERVICE_NAME, &loaded.config.logging)?;
            info!(config_path = %loaded.source.display(), "configuration loaded");
            run_daemon(loaded.config, source, load_duration).await?;
        }
    }

    Ok(())
}

async fn run_daemon(config: AppConfig, source: FrameSource, load_duration: Duration) -> Result<()> {
    info!(
        interface = %config.can.interface,
        bitrate = config.can.bitrate,
        max_systems = config.can.max_systems,
        systems = config.systems.len(),
        policy = ?config.limits.policy,
        "bus settings"
    );
    let registry = new_registry();
    let daemon_metrics = DaemonMetrics::new(registry.clone())?;
    daemon_metrics.observe_config_load(load_duration.as_secs_f64());
    daemon_metrics.inc_start();
    let profile = if cfg!(debug_assertions) {
        "debug"
    } else {
        "release"
    };
    daemon_metrics.set_build_info(env!("CARGO_PKG_VERSION"), profile);
    let bms_metrics = BmsMetrics::new(registry.clone())?;

    let metrics_server = if config.metrics.enabled {
        let server = spawn_http_server(registry, config.metrics.listen)?;
        info!(address = %server.addr(), "metrics exporter enabled");
        Some(server)
    } else {
        info!("metrics exporter disabled by configuration");
        None
    };

    // Parse captures before spawning anything so a bad file aborts startup.
    let capture = match &source {
        FrameSource::Candump(path) => Some(load_capture(path)?),
        FrameSource::Simulated => None,
    };

    let publisher = Arc::new(MetricsPublisher::new(bms_metrics, &config));
    let engine: Arc<DaemonEngine> = Arc::new(BmsEngine::new(&config, publisher.clone()));
    if config.controller.tick_interval > config.controller.heartbeat_period {
        warn!(
            tick_ms = config.controller.tick_interval.as_millis() as u64,
            heartbeat_ms = config.controller.heartbeat_period.as_millis() as u64,
            "tick interval exceeds heartbeat period; keep-alives will be late"
        );
    }

    let mut tasks = TaskSet::new();
    match capture {
        Some(records) => {
            tasks.spawn(
                "candump-replay",
                replay_capture(records, engine.clone(), publisher.clone()),
            );
        }
        None => {
            tasks.spawn(
                "simulator",
                run_simulation(config.clone(), engine.clone(), publisher.clone()),
            );
        }
    }
    tasks.spawn(
        "control-loop",
        control_loop(engine.clone(), config.controller.tick_interval),
    );

    info!(source = ?source, "daemon running; waiting for termination signal");
    signal::ctrl_c().await?;
    info!("ctrl-c received; shutting down");
    tasks.abort_all();
    tasks.join().await?;

    if let Some(server) = metrics_server {
        server.shutdown().await?;
    }

    Ok(())
}

async fn control_loop(engine: Arc<DaemonEngine>, period: Duration) -> Result<()> {
    let mut limiter = RateLimiter::new(period);
    loop {
        let now = limiter.tick().await;
        engine.tick(now);
    }
}
