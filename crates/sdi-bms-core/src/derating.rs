//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use sdi_bms_common::DeratingConfig;

/// Multipliers applied to the target limits.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct DeratingFactors {
    pub charge: f64,
    pub discharge: f64,
}

impl DeratingFactors {
    pub const FULL: DeratingFactors = DeratingFactors {
        charge: 1.0,
        discharge: 1.0,
    };

    /// The stronger of the two reductions.
    pub fn effective(&self) -> f64 {
        self.charge.min(self.discharge)
    }
}

/// Temperature derating curves.
///
/// Cold: linear from full allowance at `cold_threshold_c` down to zero at
/// `cold_floor_c`, charge only. Hot: linear from `hot_threshold_c` to zero at
/// `hot_ceiling_c`, both directions.
#[derive(Debug, Clone)]
pub struct Derating {
    config: DeratingConfig,
}

impl Derating {
    pub fn new(config: DeratingConfig) -> Self {
        Self { config }
    }

    pub fn factors(&self, temperature_min_c: f64, temperature_max_c: f64) -> DeratingFactors {
        let cfg = &self.config;
        let cold = ramp_factor(
            temperature_min_c - cfg.cold_floor_c,
            cfg.cold_threshold_c - cfg.cold_floor_c,
        );
        let hot = ramp_factor(
            cfg.hot_ceiling_c - temperature_max_c,
            cfg.hot_ceiling_c - cfg.hot_threshold_c,
        );
        DeratingFactors {
            charge: cold * hot,
            discharge: hot,
        }
    }

    /// Temperatures outside the full-allowance window.
    pub fn should_enter(&self, temperature_min_c: f64, temperature_max_c: f64) -> bool {
        temperature_min_c < self.config.cold_threshold_c
            || temperature_max_c > self.config.hot_threshold_c
    }

    /// Temperatures back inside the window by at least the dead-band.
    pub fn may_exit(&self, temperature_min_c: f64, temperature_max_c: f64) -> bool {
        let cfg = &self.config;
        temperature_min_c >= cfg.cold_threshold_c + cfg.hysteresis_c
            && temperature_max_c <= cfg.hot_threshold_c - cfg.hysteresis_c
    }
}

fn ramp_factor(distance: f64, span: f64) -> f64 {
    if span <= 0.0 {
        return if distance > 0.0 { 1.0 } else { 0.0 };
    }
    (distance / span).clamp(0.0, 1.0)
}
