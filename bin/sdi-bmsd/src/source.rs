//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Frame sources feeding the aggregation engine."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fs::File;
use std::io::BufReader;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::sync::Arc;

use anyhow::{Context, Result};
use sdi_bms_can::{parse_log, CandumpRecord};
use sdi_bms_common::time::monotonic_now;
use sdi_bms_common::AppConfig;
use sdi_bms_core::BmsEngine;
use sdi_bms_rt::RateLimiter;
use sdi_bms_sim::BatterySimulator;
use tracing::{info, warn};

use crate::publisher::MetricsPublisher;

pub type DaemonEngine = BmsEngine<Arc<MetricsPublisher>>;

/// Where the daemon gets its CAN traffic from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FrameSource {
    Simulated,
    Candump(PathBuf),
}

impl FromStr for FrameSource {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        if value == "sim" {
            return Ok(FrameSource::Simulated);
        }
        match value.strip_prefix("candump:") {
            Some(path) if !path.is_empty() => Ok(FrameSource::Candump(PathBuf::from(path))),
            _ => Err(format!(
                "unknown frame source '{}' (expected 'sim' or 'candump:<file>')",
                value
            )),
        }
    }
}

/// Read a whole capture up front so a bad file fails before anything runs.
pub fn load_capture(path: &Path) -> Result<Vec<CandumpRecord>> {
    let file =
        File::open(path).with_context(|| format!("unable to open capture {}", path.display()))?;
    let records = parse_log(BufReader::new(file))
        .with_context(|| format!("unable to parse capture {}", path.display()))?;
    info!(capture = %path.display(), frames = records.len(), "capture loaded");
    Ok(records)
}

/// Feed simulated frames forever at the controller tick rate.
pub async fn run_simulation(
    config: AppConfig,
    engine: Arc<DaemonEngine>,
    publisher: Arc<MetricsPublisher>,
) -> Result<()> {
    let mut simulator = BatterySimulator::from_config(&config)?;
    let mut limiter = RateLimiter::new(config.controller.tick_interval);
    info!(
        systems = config.simulation.systems,
        seed = config.simulation.random_seed,
        "simulated frame source running"
    );
    loop {
        let now = limiter.tick().await;
        for frame in simulator.step(limiter.period(), now)? {
            publisher.record_ingest(&engine.ingest(frame));
        }
    }
}

/// Replay a capture with its original inter-frame spacing, then stop.
pub async fn replay_capture(
    records: Vec<CandumpRecord>,
    engine: Arc<DaemonEngine>,
    publisher: Arc<MetricsPublisher>,
) -> Result<()> {
    let Some(first) = records.first().map(|record| record.log_time) else {
        info!("capture is empty");
        return Ok(());
    };
    let start = monotonic_now();
    for record in &records {
        let Some(frame) = record.to_raw_frame(start, first) else {
            warn!(id = record.id, "capture timestamp out of clock range; stopping replay");
            break;
        };
        tokio::time::sleep_until(tokio::time::Instant::from_std(frame.timestamp)).await;
        publisher.record_ingest(&engine.ingest(frame));
    }
    info!(frames = records.len(), "capture replay finished");
    Ok(())
}
