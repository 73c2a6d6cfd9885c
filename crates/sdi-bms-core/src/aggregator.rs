//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::Instant;

use sdi_bms_common::{AppConfig, LimitsConfig};
use serde::Serialize;
use tracing::{debug, info};

use crate::error::AggregateError;
use crate::policy::{allocate_limits, LimitInput};
use crate::tracker::{Liveness, SystemState, TrackerSet};

const NEAR_FULL_SOC_PCT: f64 = 99.0;

/// One logical pack fused from the contributing systems.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct AggregateState {
    /// Complete systems that are Live or Stale.
    pub contributing: usize,
    pub live_systems: usize,
    pub expected_systems: usize,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    pub charge_current_limit_a: f64,
    pub discharge_current_limit_a: f64,
    pub charge_voltage_v: f64,
    pub discharge_voltage_v: f64,
    pub cell_voltage_min_v: f64,
    pub cell_voltage_max_v: f64,
    pub cell_voltage_avg_v: f64,
    pub temperature_min_c: f64,
    pub temperature_max_c: f64,
    pub temperature_avg_c: f64,
    pub alarm_flags: u16,
    pub protection_flags: u16,
    pub tray_count: u32,
    pub normal_trays: u32,
    pub fault_trays: u32,
    pub total_capacity_ah: f64,
    pub near_full: bool,
    pub degraded: bool,
    #[serde(skip)]
    pub newest_update: Instant,
}

/// Fuses tracked systems into an [`AggregateState`] once per tick.
#[derive(Debug, Clone)]
pub struct Aggregator {
    limits: LimitsConfig,
    expected: Vec<u8>,
    last_degraded: Option<bool>,
}

impl Aggregator {
    /// `expected` lists the system ids the installation is built with; when
    /// empty, every tracked system counts as expected.
    pub fn new(limits: LimitsConfig, expected: Vec<u8>) -> Self {
        Self {
            limits,
            expected,
            last_degraded: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(config.limits.clone(), config.expected_systems())
    }

    pub fn aggregate(&mut self, tracker: &TrackerSet) -> Result<AggregateState, AggregateError> {
        let contributors: Vec<&SystemState> = tracker
            .iter()
            .filter(|state| state.is_complete() && state.liveness() != Liveness::Lost)
            .collect();
        let live: Vec<&SystemState> = contributors
            .iter()
            .copied()
            .filter(|state| state.liveness() == Liveness::Live)
            .collect();

        let degraded = self.is_degraded(tracker);
        if self.last_degraded != Some(degraded) {
            info!(
                degraded,
                live = live.len(),
                tracked = tracker.len(),
                "pack redundancy changed"
            );
            self.last_degraded = Some(degraded);
        }

        if live.is_empty() {
            return Err(AggregateError::NoLiveSystems {
                tracked: tracker.len(),
            });
        }

        let count = contributors.len() as f64;
        let mean =
            |f: fn(&SystemState) -> f64| contributors.iter().map(|s| f(s)).sum::<f64>() / count;
        let min = |f: fn(&SystemState) -> f64| {
            contributors
                .iter()
                .map(|s| f(s))
                .fold(f64::INFINITY, f64::min)
        };
        let max = |f: fn(&SystemState) -> f64| {
            contributors
                .iter()
                .map(|s| f(s))
                .fold(f64::NEG_INFINITY, f64::max)
        };

        let total_capacity_ah: f64 = contributors.iter().map(|s| s.capacity_ah).sum();
        let soc_pct = if total_capacity_ah > 0.0 {
            contributors
                .iter()
                .map(|s| s.telemetry.soc_pct * s.capacity_ah)
                .sum::<f64>()
                / total_capacity_ah
        } else {
            mean(|s| s.telemetry.soc_pct)
        };

        let limit_inputs: Vec<LimitInput> = live
            .iter()
            .map(|s| LimitInput {
                charge_a: s.telemetry.charge_current_limit_a,
                discharge_a: s.telemetry.discharge_current_limit_a,
                soc_pct: s.telemetry.soc_pct,
            })
            .collect();
        let near_full = contributors
            .iter()
            .any(|s| s.telemetry.soc_pct >= NEAR_FULL_SOC_PCT);
        let limits = allocate_limits(&self.limits, &limit_inputs, near_full);

        let voltage_v = mean(|s| s.telemetry.voltage_v);
        let current_a: f64 = contributors.iter().map(|s| s.telemetry.current_a).sum();
        let newest_update = contributors
            .iter()
            .map(|s| s.last_update())
            .max()
            .unwrap_or_else(|| live[0].last_update());

        let state = AggregateState {
            contributing: contributors.len(),
            live_systems: live.len(),
            expected_systems: self.expected_count(tracker),
            voltage_v,
            current_a,
            power_w: voltage_v * current_a,
            soc_pct,
            soh_pct: min(|s| s.telemetry.soh_pct),
            charge_current_limit_a: limits.charge_a,
            discharge_current_limit_a: limits.discharge_a,
            charge_voltage_v: min(|s| s.telemetry.charge_voltage_v),
            discharge_voltage_v: max(|s| s.telemetry.discharge_voltage_v),
            cell_voltage_min_v: min(|s| s.telemetry.cell_voltage_min_v),
            cell_voltage_max_v: max(|s| s.telemetry.cell_voltage_max_v),
            cell_voltage_avg_v: mean(|s| s.telemetry.cell_voltage_avg_v),
            temperature_min_c: min(|s| s.telemetry.temperature_min_c),
            temperature_max_c: max(|s| s.telemetry.temperature_max_c),
            temperature_avg_c: mean(|s| s.telemetry.temperature_avg_c),
            alarm_flags: contributors.iter().fold(0, |acc, s| acc | s.telemetry.alarm_flags),
            protection_flags: contributors
                .iter()
                .fold(0, |acc, s| acc | s.telemetry.protection_flags),
            tray_count: sum_u8(&contributors, |s| s.telemetry.tray_count),
            normal_trays: sum_u8(&contributors, |s| s.telemetry.normal_trays),
            fault_trays: sum_u8(&contributors, |s| s.telemetry.fault_trays),
            total_capacity_ah,
            near_full,
            degraded,
            newest_update,
        };
        debug!(
            contributing = state.contributing,
            live = state.live_systems,
            soc = state.soc_pct,
            current_a = state.current_a,
            charge_limit_a = state.charge_current_limit_a,
            discharge_limit_a = state.discharge_current_limit_a,
            "aggregated pack state"
        );
        Ok(state)
    }

    /// Systems the pack is expected to have.
    pub fn expected_count(&self, tracker: &TrackerSet) -> usize {
        if self.expected.is_empty() {
            tracker.len()
        } else {
            self.expected.len()
        }
    }

    fn is_degraded(&self, tracker: &TrackerSet) -> bool {
        let is_live =
            |state: &SystemState| state.is_complete() && state.liveness() == Liveness::Live;
        if self.expected.is_empty() {
            return tracker.is_empty() || !tracker.iter().all(is_live);
        }
        self.expected
            .iter()
            .any(|system_id| !tracker.get(*system_id).is_some_and(is_live))
    }
}

fn sum_u8(states: &[&SystemState], field: fn(&SystemState) -> u8) -> u32 {
    states.iter().map(|s| u32::from(field(s))).sum()
}

#[cfg(test)]
mod tests {
    use std::collections::HashMap;
    use std::time::Duration;

    use sdi_bms_can::{
        CellVoltageSummary, CurrentLimits, SystemConfiguration, SystemStatus, TelemetryUpdate,
        TemperatureSummary,
    };
    use sdi_bms_common::TrackerConfig;

    use super::*;

    struct Sample {
        soc: f64,
        current: f64,
        charge_limit: f64,
        temperature: (f64, f64, f64),
        alarm_flags: u16,
    }

    impl Sample {
        fn new(soc: f64, current: f64) -> Self {
            Self {
                soc,
                current,
                charge_limit: 25.0,
                temperature: (18.0, 20.0, 22.0),
                alarm_flags: 0,
            }
        }
    }

    fn feed(tracker: &mut TrackerSet, system_id: u8, sample: &Sample, at: Instant) {
        let (min_c, avg_c, max_c) = sample.temperature;
        let updates = [
            TelemetryUpdate::Status(SystemStatus {
                voltage_v: 52.0 + f64::from(system_id) / 10.0,
                current_a: sample.current,
                soc_pct: sample.soc,
                soh_pct: 100.0 - f64::from(system_id),
                bms_heartbeat: 0,
            }),
            TelemetryUpdate::Config(SystemConfiguration {
                alarm_flags: sample.alarm_flags,
                protection_flags: 0,
                tray_count: 4,
                normal_trays: 4,
                fault_trays: 0,
            }),
            TelemetryUpdate::Limits(CurrentLimits {
                charge_voltage_v: 58.0 - f64::from(system_id) / 10.0,
                charge_current_limit_a: sample.charge_limit,
                discharge_current_limit_a: 60.0,
                discharge_voltage_v: 44.0 + f64::from(system_id) / 10.0,
            }),
            TelemetryUpdate::CellVoltage(CellVoltageSummary {
                avg_v: 3.3,
                max_v: 3.35,
                min_v: 3.25,
            }),
            TelemetryUpdate::Temperature(TemperatureSummary {
                avg_c,
                max_c,
                min_c,
            }),
        ];
        for update in updates {
            tracker.apply(system_id, &update, at).unwrap();
        }
    }

    fn uncapped() -> LimitsConfig {
        LimitsConfig {
            charge_ceiling_a: None,
            discharge_ceiling_a: None,
            ..LimitsConfig::default()
        }
    }

    fn tracker(capacities: HashMap<u8, f64>) -> TrackerSet {
        TrackerSet::new(TrackerConfig::default(), 8, capacities)
    }

    #[test]
    fn equal_capacity_soc_is_arithmetic_mean() {
        let now = Instant::now();
        let mut set = tracker(HashMap::new());
        feed(&mut set, 1, &Sample::new(80.0, 0.0), now);
        feed(&mut set, 2, &Sample::new(90.0, 0.0), now);
        let aggregate = Aggregator::new(uncapped(), vec![1, 2]).aggregate(&set).unwrap();
        assert!((aggregate.soc_pct - 85.0).abs() < 1e-9);
        assert!(!aggregate.degraded);
    }

    #[test]
    fn soc_is_capacity_weighted() {
        let now = Instant::now();
        let mut set = tracker(HashMap::from([(1, 300.0), (2, 100.0)]));
        feed(&mut set, 1, &Sample::new(80.0, 0.0), now);
        feed(&mut set, 2, &Sample::new(40.0, 0.0), now);
        let aggregate = Aggregator::new(uncapped(), vec![]).aggregate(&set).unwrap();
        assert!((aggregate.soc_pct - 70.0).abs() < 1e-9);
        assert_eq!(aggregate.total_capacity_ah, 400.0);
    }

    #[test]
    fn fuses_currents_flags_and_extremes() {
        let now = Instant::now();
        let mut set = tracker(HashMap::new());
        feed(&mut set, 1, &Sample::new(50.0, 10.0), now);
        let mut cold = Sample::new(50.0, 12.0);
        cold.temperature = (-4.0, 1.0, 3.0);
        cold.alarm_flags = 0x0002;
        feed(&mut set, 2, &cold, now);
        let mut hot = Sample::new(99.0, -2.0);
        hot.temperature = (25.0, 28.0, 31.0);
        hot.alarm_flags = 0x0010;
        feed(&mut set, 3, &hot, now);

        let aggregate = Aggregator::new(uncapped(), vec![]).aggregate(&set).unwrap();
        assert_eq!(aggregate.current_a, 20.0);
        assert_eq!(aggregate.contributing, 3);
        assert_eq!(aggregate.temperature_min_c, -4.0);
        assert_eq!(aggregate.temperature_max_c, 31.0);
        assert!((aggregate.temperature_avg_c - (20.0 + 1.0 + 28.0) / 3.0).abs() < 1e-9);
        assert_eq!(aggregate.alarm_flags, 0x0012);
        assert_eq!(aggregate.soh_pct, 97.0);
        assert!((aggregate.voltage_v - 52.2).abs() < 1e-9);
        assert!((aggregate.charge_voltage_v - 57.7).abs() < 1e-9);
        assert!((aggregate.discharge_voltage_v - 44.3).abs() < 1e-9);
        assert_eq!(aggregate.tray_count, 12);
        assert_eq!(aggregate.charge_current_limit_a, 75.0);
        assert_eq!(aggregate.discharge_current_limit_a, 180.0);
        assert!(aggregate.near_full);
    }

    #[test]
    fn stale_systems_contribute_state_but_not_limits() {
        let base = Instant::now();
        let mut set = tracker(HashMap::new());
        feed(&mut set, 1, &Sample::new(60.0, 5.0), base);
        feed(&mut set, 2, &Sample::new(60.0, 5.0), base + Duration::from_secs(4));
        set.evaluate(base + Duration::from_secs(7));

        let aggregate = Aggregator::new(uncapped(), vec![1, 2]).aggregate(&set).unwrap();
        assert_eq!(aggregate.contributing, 2);
        assert_eq!(aggregate.live_systems, 1);
        assert_eq!(aggregate.current_a, 10.0);
        assert_eq!(aggregate.charge_current_limit_a, 25.0);
        assert!(aggregate.degraded);
        assert_eq!(aggregate.newest_update, base + Duration::from_secs(4));
    }

    #[test]
    fn incomplete_and_missing_systems_mark_degraded() {
        let now = Instant::now();
        let mut set = tracker(HashMap::new());
        feed(&mut set, 1, &Sample::new(60.0, 5.0), now);
        set.apply(
            2,
            &TelemetryUpdate::Status(SystemStatus::default()),
            now,
        )
        .unwrap();

        let aggregate = Aggregator::new(uncapped(), vec![1, 2, 3]).aggregate(&set).unwrap();
        assert_eq!(aggregate.contributing, 1);
        assert_eq!(aggregate.expected_systems, 3);
        assert!(aggregate.degraded);
    }

    #[test]
    fn near_full_system_switches_bulk_policy_to_bms_requests() {
        let now = Instant::now();
        let limits = LimitsConfig {
            policy: sdi_bms_common::LimitPolicy::BulkUntilNearFull,
            charge_ceiling_a: Some(50.0),
            discharge_ceiling_a: None,
            ..LimitsConfig::default()
        };
        let mut aggregator = Aggregator::new(limits, vec![1, 2]);

        let mut set = tracker(HashMap::new());
        feed(&mut set, 1, &Sample::new(90.0, 0.0), now);
        feed(&mut set, 2, &Sample::new(98.0, 0.0), now);
        let bulk = aggregator.aggregate(&set).unwrap();
        assert!(!bulk.near_full);
        assert_eq!(bulk.charge_current_limit_a, 50.0);

        let mut full = Sample::new(99.0, 0.0);
        full.charge_limit = 4.0;
        feed(&mut set, 2, &full, now);
        let absorbing = aggregator.aggregate(&set).unwrap();
        assert!(absorbing.near_full);
        assert_eq!(absorbing.charge_current_limit_a, 29.0);
    }

    #[test]
    fn no_live_systems_is_an_error() {
        let base = Instant::now();
        let mut set = tracker(HashMap::new());
        let mut aggregator = Aggregator::new(uncapped(), vec![]);
        assert_eq!(
            aggregator.aggregate(&set),
            Err(AggregateError::NoLiveSystems { tracked: 0 })
        );

        feed(&mut set, 1, &Sample::new(60.0, 5.0), base);
        set.evaluate(base + Duration::from_secs(6));
        assert_eq!(
            aggregator.aggregate(&set),
            Err(AggregateError::NoLiveSystems { tracked: 1 })
        );
    }
}
