//! ---
//! ems_section: "06-simulation"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulated systems driving the aggregation engine end to end."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::time::{Duration, Instant};

use sdi_bms_common::{AppConfig, SystemConfig};
use sdi_bms_core::{BmsEngine, ControllerState, IngestOutcome, RecordingPublisher};
use sdi_bms_sim::BatterySimulator;

fn setup() -> (BmsEngine<RecordingPublisher>, BatterySimulator) {
    let mut config = AppConfig::default();
    config.systems = vec![SystemConfig::new(1, 94.0), SystemConfig::new(2, 94.0)];
    config.simulation.systems = 2;
    config.simulation.start_temperature_c = Some(22.0);
    let sim = BatterySimulator::from_config(&config).unwrap();
    (BmsEngine::new(&config, RecordingPublisher::new()), sim)
}

fn run(
    engine: &BmsEngine<RecordingPublisher>,
    sim: &mut BatterySimulator,
    base: Instant,
    seconds: std::ops::RangeInclusive<u64>,
) {
    for second in seconds {
        let now = base + Duration::from_secs(second);
        for frame in sim.step(Duration::from_secs(1), now).unwrap() {
            assert!(matches!(engine.ingest(frame), IngestOutcome::Applied { .. }));
        }
        engine.tick(now);
    }
}

#[test]
fn simulated_pack_ramps_to_active() {
    let (engine, mut sim) = setup();
    let base = Instant::now();
    run(&engine, &mut sim, base, 0..=16);

    let output = engine.last_output().unwrap();
    assert_eq!(output.state, ControllerState::Active);
    assert_eq!(output.live_systems, 2);
    assert_eq!(output.charge_limit_a, 50.0);
    assert_eq!(output.discharge_limit_a, 120.0);
    assert!(!output.degraded);
    assert!(engine.publisher().keepalives().len() >= 16);
}

#[test]
fn silenced_bus_trips_watchdog() {
    let (engine, mut sim) = setup();
    let base = Instant::now();
    run(&engine, &mut sim, base, 0..=16);

    sim.silence(1);
    sim.silence(2);
    run(&engine, &mut sim, base, 17..=22);

    let output = engine.last_output().unwrap();
    assert_eq!(output.state, ControllerState::Watchdog);
    assert_eq!(output.charge_limit_a, 0.0);
    assert!(output.disconnect_request);
}

#[test]
fn one_silent_system_degrades_without_tripping() {
    let (engine, mut sim) = setup();
    let base = Instant::now();
    run(&engine, &mut sim, base, 0..=16);

    sim.silence(2);
    run(&engine, &mut sim, base, 17..=24);

    let output = engine.last_output().unwrap();
    assert!(output.degraded);
    assert_eq!(output.live_systems, 1);
    assert_ne!(output.state, ControllerState::Watchdog);
    assert_eq!(output.charge_limit_a, 30.0);
}
