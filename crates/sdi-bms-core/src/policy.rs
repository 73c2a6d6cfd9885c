//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Fleet-wide current limit allocation.

use sdi_bms_common::{LimitPolicy, LimitsConfig};

/// Limits advertised by one Live system.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct LimitInput {
    pub charge_a: f64,
    pub discharge_a: f64,
    pub soc_pct: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct LimitTotals {
    pub charge_a: f64,
    pub discharge_a: f64,
}

/// Combine per-system limits under the configured policy, then clamp to the
/// system-wide ceilings. `near_full` is set when any contributing system is
/// at or above the near-full SOC.
pub fn allocate_limits(
    config: &LimitsConfig,
    inputs: &[LimitInput],
    near_full: bool,
) -> LimitTotals {
    if inputs.is_empty() {
        return LimitTotals::default();
    }
    let summed = LimitTotals {
        charge_a: inputs.iter().map(|input| input.charge_a).sum(),
        discharge_a: inputs.iter().map(|input| input.discharge_a).sum(),
    };
    let raw = match config.policy {
        LimitPolicy::Sum => summed,
        LimitPolicy::BulkUntilNearFull => {
            // Bulk phase charges at the inverter ceiling; the BMS requests
            // only take over once a system is close to full.
            let charge_a = match config.charge_ceiling_a {
                Some(ceiling) if !near_full => ceiling,
                _ => summed.charge_a,
            };
            LimitTotals {
                charge_a,
                discharge_a: summed.discharge_a,
            }
        }
        LimitPolicy::Min => {
            // Parallel strings share current roughly evenly, so the weakest
            // string bounds what each one may carry.
            let count = inputs.len() as f64;
            let weakest_charge = inputs
                .iter()
                .map(|input| input.charge_a)
                .fold(f64::INFINITY, f64::min);
            let weakest_discharge = inputs
                .iter()
                .map(|input| input.discharge_a)
                .fold(f64::INFINITY, f64::min);
            LimitTotals {
                charge_a: count * weakest_charge,
                discharge_a: count * weakest_discharge,
            }
        }
        LimitPolicy::ProportionalToSoc => {
            let taper = config.soc_taper_pct;
            LimitTotals {
                charge_a: inputs
                    .iter()
                    .map(|input| input.charge_a * taper_factor(100.0 - input.soc_pct, taper))
                    .sum(),
                discharge_a: inputs
                    .iter()
                    .map(|input| input.discharge_a * taper_factor(input.soc_pct, taper))
                    .sum(),
            }
        }
    };
    LimitTotals {
        charge_a: clamp_to_ceiling(raw.charge_a, config.charge_ceiling_a),
        discharge_a: clamp_to_ceiling(raw.discharge_a, config.discharge_ceiling_a),
    }
}

fn taper_factor(headroom_pct: f64, taper_pct: f64) -> f64 {
    if taper_pct <= 0.0 {
        return 1.0;
    }
    (headroom_pct / taper_pct).clamp(0.0, 1.0)
}

fn clamp_to_ceiling(value: f64, ceiling: Option<f64>) -> f64 {
    let value = value.max(0.0);
    match ceiling {
        Some(ceiling) => value.min(ceiling),
        None => value,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn input(charge_a: f64, discharge_a: f64, soc_pct: f64) -> LimitInput {
        LimitInput {
            charge_a,
            discharge_a,
            soc_pct,
        }
    }

    fn config(policy: LimitPolicy) -> LimitsConfig {
        LimitsConfig {
            policy,
            charge_ceiling_a: None,
            discharge_ceiling_a: None,
            ..LimitsConfig::default()
        }
    }

    #[test]
    fn sum_adds_every_system() {
        let totals = allocate_limits(
            &config(LimitPolicy::Sum),
            &[input(30.0, 60.0, 50.0), input(20.0, 40.0, 50.0)],
            false,
        );
        assert_eq!(totals.charge_a, 50.0);
        assert_eq!(totals.discharge_a, 100.0);
    }

    #[test]
    fn min_scales_weakest_system() {
        let totals = allocate_limits(
            &config(LimitPolicy::Min),
            &[input(30.0, 60.0, 50.0), input(20.0, 80.0, 50.0)],
            false,
        );
        assert_eq!(totals.charge_a, 40.0);
        assert_eq!(totals.discharge_a, 120.0);
    }

    #[test]
    fn proportional_tapers_near_the_ends() {
        let mut limits = config(LimitPolicy::ProportionalToSoc);
        limits.soc_taper_pct = 10.0;
        let totals = allocate_limits(
            &limits,
            &[input(40.0, 40.0, 95.0), input(40.0, 40.0, 5.0), input(40.0, 40.0, 50.0)],
            false,
        );
        // 40 * 0.5 + 40 + 40
        assert_eq!(totals.charge_a, 100.0);
        assert_eq!(totals.discharge_a, 100.0);

        let full = allocate_limits(&limits, &[input(40.0, 40.0, 100.0)], true);
        assert_eq!(full.charge_a, 0.0);
        assert_eq!(full.discharge_a, 40.0);
    }

    #[test]
    fn ceilings_apply_after_policy() {
        let limits = LimitsConfig {
            policy: LimitPolicy::Sum,
            charge_ceiling_a: Some(50.0),
            discharge_ceiling_a: Some(70.0),
            ..LimitsConfig::default()
        };
        let totals = allocate_limits(
            &limits,
            &[input(40.0, 40.0, 50.0), input(40.0, 40.0, 50.0)],
            false,
        );
        assert_eq!(totals.charge_a, 50.0);
        assert_eq!(totals.discharge_a, 70.0);
        assert_eq!(allocate_limits(&limits, &[], false), LimitTotals::default());
    }

    #[test]
    fn bulk_charges_at_ceiling_until_a_system_is_near_full() {
        let limits = LimitsConfig {
            policy: LimitPolicy::BulkUntilNearFull,
            charge_ceiling_a: Some(50.0),
            discharge_ceiling_a: None,
            ..LimitsConfig::default()
        };
        let inputs = [input(10.0, 60.0, 97.0), input(8.0, 60.0, 99.0)];

        let bulk = allocate_limits(&limits, &inputs, false);
        assert_eq!(bulk.charge_a, 50.0);
        assert_eq!(bulk.discharge_a, 120.0);

        let absorbing = allocate_limits(&limits, &inputs, true);
        assert_eq!(absorbing.charge_a, 18.0);
        assert_eq!(absorbing.discharge_a, 120.0);
    }

    #[test]
    fn bulk_without_ceiling_falls_back_to_sum() {
        let limits = config(LimitPolicy::BulkUntilNearFull);
        let totals = allocate_limits(&limits, &[input(10.0, 60.0, 50.0)], false);
        assert_eq!(totals.charge_a, 10.0);
    }
}
