//! ---
//! ems_section: "06-simulation"
//! ems_subsection: "01-bootstrap"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Simulation module exports."
//! ems_version: "v0.1.0"
//! ems_owner: "tbd"
//! ---
//! Simulated Samsung SDI battery systems for bench runs and tests.
//!
//! The simulator keeps a small physical model per system (SOC integration,
//! open-circuit voltage, self-heating) and emits the five telemetry frames a
//! real BMS would put on the bus, encoded with the production codec.

pub mod generator;

pub use generator::{BatterySimulator, SimulatedSystem};
