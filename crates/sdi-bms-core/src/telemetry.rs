//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use sdi_bms_can::TelemetryUpdate;
use serde::{Deserialize, Serialize};

/// Last known decoded values for one battery system.
///
/// Each frame kind refreshes only its own fields; the rest keep whatever the
/// previous frames delivered.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemTelemetry {
    pub system_id: u8,
    pub voltage_v: f64,
    /// Positive while charging.
    pub current_a: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    pub bms_heartbeat: u16,
    pub alarm_flags: u16,
    pub protection_flags: u16,
    pub tray_count: u8,
    pub normal_trays: u8,
    pub fault_trays: u8,
    pub charge_voltage_v: f64,
    pub charge_current_limit_a: f64,
    pub discharge_current_limit_a: f64,
    pub discharge_voltage_v: f64,
    pub cell_voltage_min_v: f64,
    pub cell_voltage_max_v: f64,
    pub cell_voltage_avg_v: f64,
    pub temperature_min_c: f64,
    pub temperature_max_c: f64,
    pub temperature_avg_c: f64,
}

impl SystemTelemetry {
    pub fn new(system_id: u8) -> Self {
        Self {
            system_id,
            ..Self::default()
        }
    }

    pub fn merge(&mut self, update: &TelemetryUpdate) {
        match update {
            TelemetryUpdate::Status(status) => {
                self.voltage_v = status.voltage_v;
                self.current_a = status.current_a;
                self.soc_pct = status.soc_pct;
                self.soh_pct = status.soh_pct;
                self.bms_heartbeat = status.bms_heartbeat;
            }
            TelemetryUpdate::Config(config) => {
                self.alarm_flags = config.alarm_flags;
                self.protection_flags = config.protection_flags;
                self.tray_count = config.tray_count;
                self.normal_trays = config.normal_trays;
                self.fault_trays = config.fault_trays;
            }
            TelemetryUpdate::Limits(limits) => {
                self.charge_voltage_v = limits.charge_voltage_v;
                self.charge_current_limit_a = limits.charge_current_limit_a;
                self.discharge_current_limit_a = limits.discharge_current_limit_a;
                self.discharge_voltage_v = limits.discharge_voltage_v;
            }
            TelemetryUpdate::CellVoltage(cells) => {
                self.cell_voltage_min_v = cells.min_v;
                self.cell_voltage_max_v = cells.max_v;
                self.cell_voltage_avg_v = cells.avg_v;
            }
            TelemetryUpdate::Temperature(temps) => {
                self.temperature_min_c = temps.min_c;
                self.temperature_max_c = temps.max_c;
                self.temperature_avg_c = temps.avg_c;
            }
        }
    }

    pub fn power_w(&self) -> f64 {
        self.voltage_v * self.current_a
    }

    /// Amp-hours drawn out of a system of the given capacity.
    pub fn consumed_ah(&self, capacity_ah: f64) -> f64 {
        capacity_ah * (100.0 - self.soc_pct) / 100.0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use sdi_bms_can::{CurrentLimits, SystemStatus, TemperatureSummary};

    #[test]
    fn merge_leaves_other_fields_untouched() {
        let mut telemetry = SystemTelemetry::new(3);
        telemetry.merge(&TelemetryUpdate::Status(SystemStatus {
            voltage_v: 52.0,
            current_a: -10.0,
            soc_pct: 75.0,
            soh_pct: 98.0,
            bms_heartbeat: 1,
        }));
        telemetry.merge(&TelemetryUpdate::Temperature(TemperatureSummary {
            avg_c: 21.0,
            max_c: 24.0,
            min_c: 19.0,
        }));
        telemetry.merge(&TelemetryUpdate::Limits(CurrentLimits {
            charge_voltage_v: 58.4,
            charge_current_limit_a: 50.0,
            discharge_current_limit_a: 100.0,
            discharge_voltage_v: 44.8,
        }));

        assert_eq!(telemetry.system_id, 3);
        assert_eq!(telemetry.voltage_v, 52.0);
        assert_eq!(telemetry.soc_pct, 75.0);
        assert_eq!(telemetry.temperature_min_c, 19.0);
        assert_eq!(telemetry.charge_current_limit_a, 50.0);
        assert_eq!(telemetry.power_w(), -520.0);
        assert_eq!(telemetry.consumed_ah(100.0), 25.0);
    }
}
