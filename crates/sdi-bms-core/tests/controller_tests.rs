//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use sdi_bms_common::{ControllerConfig, DeratingConfig, HysteresisConfig};
use sdi_bms_core::{AggregateError, AggregateState, ControllerState, FaultCause, SafetyController};

fn controller() -> SafetyController {
    SafetyController::new(
        ControllerConfig::default(),
        DeratingConfig::default(),
        &HysteresisConfig::default(),
    )
}

fn pack(at: Instant, charge_limit_a: f64, temperature_min_c: f64) -> AggregateState {
    AggregateState {
        contributing: 2,
        live_systems: 2,
        expected_systems: 2,
        voltage_v: 52.0,
        current_a: 0.0,
        power_w: 0.0,
        soc_pct: 55.0,
        soh_pct: 97.0,
        charge_current_limit_a: charge_limit_a,
        discharge_current_limit_a: 100.0,
        charge_voltage_v: 58.4,
        discharge_voltage_v: 44.8,
        cell_voltage_min_v: 3.28,
        cell_voltage_max_v: 3.31,
        cell_voltage_avg_v: 3.30,
        temperature_min_c,
        temperature_max_c: temperature_min_c + 4.0,
        temperature_avg_c: temperature_min_c + 2.0,
        alarm_flags: 0,
        protection_flags: 0,
        tray_count: 8,
        normal_trays: 8,
        fault_trays: 0,
        total_capacity_ah: 188.0,
        near_full: false,
        degraded: false,
        newest_update: at,
    }
}

/// Drive the controller from Init through a full ramp at 20 °C.
fn ramped(base: Instant) -> SafetyController {
    let mut controller = controller();
    controller.step(Ok(&pack(base, 50.0, 20.0)), base);
    let done = base + Duration::from_secs(15);
    controller.step(Ok(&pack(done, 50.0, 20.0)), done);
    assert_eq!(controller.state(), ControllerState::Active);
    controller
}

#[test]
fn ramp_reaches_target_linearly_over_fifteen_seconds() {
    let mut controller = controller();
    let base = Instant::now();

    let start = controller.step(Ok(&pack(base, 50.0, 20.0)), base);
    assert_eq!(start.output.state, ControllerState::RampUp);
    assert_eq!(start.output.charge_limit_a, 0.0);

    let mid_at = base + Duration::from_millis(7_500);
    let mid = controller.step(Ok(&pack(mid_at, 50.0, 20.0)), mid_at);
    assert!((mid.output.charge_limit_a - 25.0).abs() < 0.5);

    let end_at = base + Duration::from_secs(15);
    let end = controller.step(Ok(&pack(end_at, 50.0, 20.0)), end_at);
    assert_eq!(end.output.charge_limit_a, 50.0);
    assert_eq!(end.output.discharge_limit_a, 100.0);
    assert_eq!(end.output.state, ControllerState::Active);
}

#[test]
fn ramp_is_monotonic_at_tick_rate() {
    let mut controller = controller();
    let base = Instant::now();
    let mut previous = 0.0;
    for second in 0..=20 {
        let now = base + Duration::from_secs(second);
        let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);
        assert!(step.output.charge_limit_a >= previous);
        assert!(step.output.charge_limit_a <= 50.0);
        previous = step.output.charge_limit_a;
    }
    assert_eq!(previous, 50.0);
}

#[test]
fn cold_pack_derates_charge_towards_zero() {
    let base = Instant::now();
    let mut controller = ramped(base);

    let mut previous = 50.0;
    for (offset, temperature) in [(16, -2.0), (17, -5.0), (18, -9.0), (19, -10.0)] {
        let now = base + Duration::from_secs(offset);
        let step = controller.step(Ok(&pack(now, 50.0, temperature)), now);
        assert_eq!(step.output.state, ControllerState::Derated);
        assert!(step.output.charge_limit_a < 50.0);
        assert!(step.output.charge_limit_a < previous);
        assert_eq!(step.output.discharge_limit_a, 100.0);
        previous = step.output.charge_limit_a;
    }
    assert_eq!(previous, 0.0);
}

#[test]
fn derated_exit_needs_dead_band() {
    let base = Instant::now();
    let mut controller = ramped(base);

    let cold_at = base + Duration::from_secs(16);
    controller.step(Ok(&pack(cold_at, 50.0, -1.0)), cold_at);
    assert_eq!(controller.state(), ControllerState::Derated);

    let marginal_at = base + Duration::from_secs(17);
    controller.step(Ok(&pack(marginal_at, 50.0, 1.0)), marginal_at);
    assert_eq!(controller.state(), ControllerState::Derated);
    let back_at = base + Duration::from_secs(18);
    controller.step(Ok(&pack(back_at, 50.0, -0.5)), back_at);
    assert_eq!(controller.state(), ControllerState::Derated);

    let warm_at = base + Duration::from_secs(19);
    let step = controller.step(Ok(&pack(warm_at, 50.0, 2.5)), warm_at);
    assert_eq!(step.output.state, ControllerState::Active);
    assert_eq!(step.output.charge_limit_a, 50.0);
}

#[test]
fn small_oscillation_does_not_move_output() {
    let base = Instant::now();
    let mut controller = ramped(base);

    for (offset, limit) in [(16, 50.4), (17, 49.6), (18, 50.9), (19, 49.3), (20, 50.2)] {
        let now = base + Duration::from_secs(offset);
        let step = controller.step(Ok(&pack(now, limit, 20.0)), now);
        assert_eq!(step.output.charge_limit_a, 50.0);
    }

    let now = base + Duration::from_secs(21);
    let step = controller.step(Ok(&pack(now, 45.0, 20.0)), now);
    assert_eq!(step.output.charge_limit_a, 45.0);
}

#[test]
fn no_live_systems_zeroes_output_then_faults_after_grace() {
    let base = Instant::now();
    let mut controller = ramped(base);
    let err = AggregateError::NoLiveSystems { tracked: 2 };

    let lost_at = base + Duration::from_secs(20);
    let step = controller.step(Err(&err), lost_at);
    assert_eq!(step.output.state, ControllerState::Watchdog);
    assert_eq!(step.output.charge_limit_a, 0.0);
    assert_eq!(step.output.discharge_limit_a, 0.0);
    assert!(step.output.disconnect_request);
    assert!(step.keepalive.is_none());

    let within_grace = lost_at + Duration::from_secs(60);
    controller.step(Err(&err), within_grace);
    assert_eq!(controller.state(), ControllerState::Watchdog);

    let past_grace = lost_at + Duration::from_secs(61);
    let step = controller.step(Err(&err), past_grace);
    assert_eq!(step.output.state, ControllerState::Fault);
    assert!(matches!(
        step.output.fault,
        Some(FaultCause::NoLiveSystems { .. })
    ));
}

#[test]
fn watchdog_recovers_by_ramping_again() {
    let base = Instant::now();
    let mut controller = ramped(base);
    let err = AggregateError::NoLiveSystems { tracked: 2 };
    controller.step(Err(&err), base + Duration::from_secs(20));

    let back_at = base + Duration::from_secs(25);
    let step = controller.step(Ok(&pack(back_at, 50.0, 20.0)), back_at);
    assert_eq!(step.output.state, ControllerState::RampUp);
    assert_eq!(step.output.charge_limit_a, 0.0);
    assert!(!step.output.disconnect_request);
    assert!(step.keepalive.is_some());
}

#[test]
fn fault_is_terminal_until_reset() {
    let base = Instant::now();
    let mut controller = ramped(base);
    let err = AggregateError::NoLiveSystems { tracked: 2 };
    controller.step(Err(&err), base + Duration::from_secs(20));
    controller.step(Err(&err), base + Duration::from_secs(90));
    assert_eq!(controller.state(), ControllerState::Fault);

    for offset in 91..100 {
        let now = base + Duration::from_secs(offset);
        let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);
        assert_eq!(step.output.state, ControllerState::Fault);
        assert_eq!(step.output.charge_limit_a, 0.0);
        assert!(step.output.disconnect_request);
        assert!(step.keepalive.is_none());
    }

    controller.reset();
    assert_eq!(controller.state(), ControllerState::Init);
    assert_eq!(controller.fault(), None);
    let now = base + Duration::from_secs(100);
    let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);
    assert_eq!(step.output.state, ControllerState::RampUp);
}

#[test]
fn tripped_fault_latches_from_any_state() {
    let mut controller = controller();
    controller.trip_fault(FaultCause::MalformedFrames {
        system_id: 2,
        consecutive: 21,
    });
    let now = Instant::now();
    let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);
    assert_eq!(step.output.state, ControllerState::Fault);
    assert_eq!(
        step.output.fault,
        Some(FaultCause::MalformedFrames {
            system_id: 2,
            consecutive: 21
        })
    );
}

#[test]
fn near_full_flag_follows_the_aggregate() {
    let mut controller = controller();
    let base = Instant::now();
    let step = controller.step(Ok(&pack(base, 50.0, 20.0)), base);
    assert!(!step.output.near_full);

    let mut full = pack(base + Duration::from_secs(1), 50.0, 20.0);
    full.near_full = true;
    let step = controller.step(Ok(&full), base + Duration::from_secs(1));
    assert!(step.output.near_full);

    let err = AggregateError::NoLiveSystems { tracked: 2 };
    let step = controller.step(Err(&err), base + Duration::from_secs(2));
    assert!(!step.output.near_full);
}

#[test]
fn fault_output_serializes_with_tagged_cause() {
    let mut controller = controller();
    controller.trip_fault(FaultCause::MalformedFrames {
        system_id: 3,
        consecutive: 21,
    });
    let now = Instant::now();
    let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);

    let json = serde_json::to_value(&step.output).unwrap();
    assert_eq!(json["state"], "fault");
    assert_eq!(json["fault"]["cause"], "malformed_frames");
    assert_eq!(json["fault"]["system_id"], 3);
    assert_eq!(json["fault"]["consecutive"], 21);
    assert_eq!(json["charge_limit_a"], 0.0);
    assert_eq!(json["disconnect_request"], true);
    assert_eq!(json["near_full"], false);
}

#[test]
fn healthy_output_serializes_without_fault() {
    let mut controller = controller();
    let now = Instant::now();
    let step = controller.step(Ok(&pack(now, 50.0, 20.0)), now);
    let json = serde_json::to_value(&step.output).unwrap();
    assert_eq!(json["state"], "ramp_up");
    assert!(json["fault"].is_null());

    let aggregate = serde_json::to_value(pack(now, 50.0, 20.0)).unwrap();
    assert!(aggregate.get("newest_update").is_none());
    assert_eq!(aggregate["soc_pct"], 55.0);
}
