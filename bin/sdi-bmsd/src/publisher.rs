//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "binary"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Publisher mapping engine output onto tracing and Prometheus."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;

use parking_lot::Mutex;
use sdi_bms_can::{KeepAlive, RawFrame};
use sdi_bms_common::AppConfig;
use sdi_bms_core::{ControlOutput, ControllerState, IngestOutcome, Publisher, SystemSnapshot};
use sdi_bms_metrics::BmsMetrics;
use tracing::{debug, info, trace, warn};

/// Logs state changes and mirrors every published value into metrics.
/// There is no CAN writer yet, so keep-alive frames end in the log.
pub struct MetricsPublisher {
    metrics: BmsMetrics,
    names: HashMap<u8, String>,
    last_state: Mutex<Option<ControllerState>>,
}

impl MetricsPublisher {
    pub fn new(metrics: BmsMetrics, config: &AppConfig) -> Self {
        let names: HashMap<u8, String> = config
            .expected_systems()
            .into_iter()
            .map(|id| (id, config.system_name(id)))
            .collect();
        for (id, name) in &names {
            metrics.set_system_info(*id, name);
        }
        Self {
            metrics,
            names,
            last_state: Mutex::new(None),
        }
    }

    /// Configured name, or `system-<id>` for systems not in the config.
    pub fn system_name(&self, system_id: u8) -> String {
        self.names
            .get(&system_id)
            .cloned()
            .unwrap_or_else(|| format!("system-{}", system_id))
    }

    /// Count a single ingest result.
    pub fn record_ingest(&self, outcome: &IngestOutcome) {
        match outcome {
            IngestOutcome::Applied { system_id, kind } => {
                self.metrics.record_frame(*system_id, kind.as_str())
            }
            IngestOutcome::Ignored => self.metrics.record_ignored(),
            IngestOutcome::Malformed(err) => self.metrics.record_malformed(err.system_id()),
            IngestOutcome::UnknownSystem(_) => self.metrics.record_unknown_system(),
        }
    }
}

impl Publisher for MetricsPublisher {
    fn publish_system(&self, system: &SystemSnapshot) {
        let telemetry = &system.telemetry;
        self.metrics.set_system(
            system.system_id,
            telemetry.soc_pct,
            telemetry.voltage_v,
            telemetry.current_a,
            (
                telemetry.temperature_min_c,
                telemetry.temperature_avg_c,
                telemetry.temperature_max_c,
            ),
        );
        trace!(
            system_id = system.system_id,
            name = %self.system_name(system.system_id),
            liveness = %system.liveness,
            safety = %system.safety,
            soc_pct = telemetry.soc_pct,
            "system published"
        );
    }

    fn publish_control(&self, output: &ControlOutput) {
        self.metrics.set_controller(
            output.state.code(),
            output.charge_limit_a,
            output.discharge_limit_a,
            output.derating_factor,
            output.disconnect_request,
        );
        self.metrics
            .set_systems(output.live_systems, output.expected_systems);
        self.metrics.set_pack(output.soc_pct, output.voltage_v, output.current_a);
        self.metrics.set_near_full(output.near_full);

        let mut last = self.last_state.lock();
        if *last != Some(output.state) {
            match output.state {
                ControllerState::Watchdog | ControllerState::Fault => warn!(
                    state = %output.state,
                    fault = ?output.fault,
                    live_systems = output.live_systems,
                    "output forced to zero"
                ),
                _ => info!(
                    state = %output.state,
                    charge_limit_a = output.charge_limit_a,
                    discharge_limit_a = output.discharge_limit_a,
                    near_full = output.near_full,
                    "controller output"
                ),
            }
            *last = Some(output.state);
        }
    }

    fn send_keepalive(&self, keepalive: &KeepAlive, frame: &RawFrame) {
        self.metrics.record_keepalive();
        debug!(
            counter = keepalive.counter,
            can_id = frame.id,
            charge_limit_a = keepalive.charge_limit_a,
            discharge_limit_a = keepalive.discharge_limit_a,
            "keep-alive"
        );
    }
}
