//! ---
//! ems_section: "06-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Seeded battery system models producing encoded CAN frames."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashSet;
use std::time::{Duration, Instant};

use anyhow::{anyhow, Context, Result};
use rand::prelude::*;
use rand_distr::Normal;
use sdi_bms_can::{
    encode_telemetry, CellVoltageSummary, CurrentLimits, RawFrame, SystemConfiguration,
    SystemStatus, TelemetryUpdate, TemperatureSummary,
};
use sdi_bms_common::{AppConfig, SimulationConfig};
use tracing::debug;

const SERIES_CELLS: f64 = 14.0;
const TRAYS: u8 = 4;
const EMPTY_VOLTAGE_V: f64 = 44.8;
const FULL_VOLTAGE_V: f64 = 58.4;
const NOMINAL_CHARGE_LIMIT_A: f64 = 30.0;
const NOMINAL_DISCHARGE_LIMIT_A: f64 = 60.0;
const AMBIENT_C: f64 = 20.0;
const NOISE_SIGMA: f64 = 0.2;

/// Model state for one simulated battery system.
#[derive(Debug, Clone, PartialEq)]
pub struct SimulatedSystem {
    pub system_id: u8,
    pub capacity_ah: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    /// Positive while charging.
    pub current_a: f64,
    pub temperature_c: f64,
    pub alarm_flags: u16,
    pub protection_flags: u16,
    heartbeat: u16,
}

impl SimulatedSystem {
    pub fn new(system_id: u8, capacity_ah: f64, soc_pct: f64, temperature_c: f64) -> Self {
        Self {
            system_id,
            capacity_ah,
            soc_pct: soc_pct.clamp(0.0, 100.0),
            soh_pct: 98.0,
            current_a: 0.0,
            temperature_c,
            alarm_flags: 0,
            protection_flags: 0,
            heartbeat: 0,
        }
    }

    /// Linear open-circuit voltage between the discharge and charge voltages.
    pub fn voltage_v(&self) -> f64 {
        EMPTY_VOLTAGE_V + (FULL_VOLTAGE_V - EMPTY_VOLTAGE_V) * self.soc_pct / 100.0
    }

    fn charge_limit_a(&self) -> f64 {
        if self.protection_flags != 0 || self.soc_pct >= 100.0 {
            return 0.0;
        }
        if self.soc_pct > 90.0 {
            return NOMINAL_CHARGE_LIMIT_A * (100.0 - self.soc_pct) / 10.0;
        }
        NOMINAL_CHARGE_LIMIT_A
    }

    fn discharge_limit_a(&self) -> f64 {
        if self.protection_flags != 0 || self.soc_pct <= 0.0 {
            return 0.0;
        }
        if self.soc_pct < 10.0 {
            return NOMINAL_DISCHARGE_LIMIT_A * self.soc_pct / 10.0;
        }
        NOMINAL_DISCHARGE_LIMIT_A
    }

    fn advance(&mut self, dt: Duration, temperature_noise: f64) {
        let hours = dt.as_secs_f64() / 3600.0;
        if self.capacity_ah > 0.0 {
            self.soc_pct += self.current_a * hours / self.capacity_ah * 100.0;
            self.soc_pct = self.soc_pct.clamp(0.0, 100.0);
        }
        // I^2 heating against a first-order pull back to ambient.
        let heating = 0.002 * self.current_a.powi(2) * dt.as_secs_f64() / 60.0;
        let cooling = (self.temperature_c - AMBIENT_C) * 0.01 * dt.as_secs_f64();
        self.temperature_c += heating - cooling + temperature_noise;
        self.heartbeat = self.heartbeat.wrapping_add(1);
    }

    /// The five telemetry updates describing the current model state.
    pub fn updates(&self) -> [TelemetryUpdate; 5] {
        let voltage = self.voltage_v();
        let cell_avg = voltage / SERIES_CELLS;
        let spread_c = 1.0 + self.current_a.abs() / 30.0;
        let fault_trays = if self.protection_flags != 0 { 1 } else { 0 };
        [
            TelemetryUpdate::Status(SystemStatus {
                voltage_v: voltage,
                current_a: self.current_a,
                soc_pct: self.soc_pct,
                soh_pct: self.soh_pct,
                bms_heartbeat: self.heartbeat,
            }),
            TelemetryUpdate::Config(SystemConfiguration {
                alarm_flags: self.alarm_flags,
                protection_flags: self.protection_flags,
                tray_count: TRAYS,
                normal_trays: TRAYS - fault_trays,
                fault_trays,
            }),
            TelemetryUpdate::Limits(CurrentLimits {
                charge_voltage_v: FULL_VOLTAGE_V,
                charge_current_limit_a: self.charge_limit_a(),
                discharge_current_limit_a: self.discharge_limit_a(),
                discharge_voltage_v: EMPTY_VOLTAGE_V,
            }),
            TelemetryUpdate::CellVoltage(CellVoltageSummary {
                avg_v: cell_avg,
                max_v: cell_avg + 0.012,
                min_v: cell_avg - 0.015,
            }),
            TelemetryUpdate::Temperature(TemperatureSummary {
                avg_c: self.temperature_c,
                max_c: self.temperature_c + spread_c,
                min_c: self.temperature_c - spread_c,
            }),
        ]
    }
}

/// Seeded simulator for a group of battery systems sharing one bus.
#[derive(Debug)]
pub struct BatterySimulator {
    rng: StdRng,
    noise: Normal<f64>,
    systems: Vec<SimulatedSystem>,
    silenced: HashSet<u8>,
}

impl BatterySimulator {
    pub fn new(config: &SimulationConfig, capacity_for: impl Fn(u8) -> f64) -> Result<Self> {
        let noise = Normal::new(0.0, NOISE_SIGMA)
            .map_err(|err| anyhow!("invalid temperature noise: {}", err))?;
        let mut rng = StdRng::seed_from_u64(config.random_seed);
        let start_temperature = config.start_temperature_c.unwrap_or(AMBIENT_C);
        let systems = (1..=config.systems)
            .map(|system_id| {
                let soc = rng.gen_range(40.0..80.0);
                SimulatedSystem::new(system_id, capacity_for(system_id), soc, start_temperature)
            })
            .collect();
        Ok(Self {
            rng,
            noise,
            systems,
            silenced: HashSet::new(),
        })
    }

    pub fn from_config(config: &AppConfig) -> Result<Self> {
        Self::new(&config.simulation, |id| config.capacity_for(id))
            .context("unable to build battery simulator")
    }

    pub fn systems(&self) -> &[SimulatedSystem] {
        &self.systems
    }

    pub fn system_mut(&mut self, system_id: u8) -> Option<&mut SimulatedSystem> {
        self.systems.iter_mut().find(|s| s.system_id == system_id)
    }

    /// Split a pack current evenly across all systems.
    pub fn set_pack_current(&mut self, current_a: f64) {
        let count = self.systems.len().max(1) as f64;
        for system in &mut self.systems {
            system.current_a = current_a / count;
        }
    }

    /// Stop emitting frames for a system, as if its CAN link dropped.
    pub fn silence(&mut self, system_id: u8) {
        debug!(system_id, "silencing simulated system");
        self.silenced.insert(system_id);
    }

    pub fn restore(&mut self, system_id: u8) {
        self.silenced.remove(&system_id);
    }

    /// Advance every model by `dt` and return the frames emitted at `at`.
    pub fn step(&mut self, dt: Duration, at: Instant) -> Result<Vec<RawFrame>> {
        let mut frames = Vec::with_capacity(self.systems.len() * 5);
        for system in &mut self.systems {
            let jitter = self.noise.sample(&mut self.rng);
            system.advance(dt, jitter);
            if self.silenced.contains(&system.system_id) {
                continue;
            }
            for update in system.updates() {
                let frame = encode_telemetry(system.system_id, &update, at).with_context(|| {
                    format!("unable to encode frame for system {}", system.system_id)
                })?;
                frames.push(frame);
            }
        }
        Ok(frames)
    }
}
