//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Battery aggregation and safety control engine for Samsung SDI systems.
//!
//! Decoded frames land in a [`TrackerSet`]; every tick the [`Aggregator`]
//! fuses the live systems into one pack and the [`SafetyController`] turns
//! that into limits that are safe to hand to an inverter. [`BmsEngine`]
//! ties the pieces together behind a single lock.

mod aggregator;
mod controller;
mod derating;
mod engine;
mod error;
mod hysteresis;
mod policy;
mod publisher;
mod telemetry;
mod tracker;

pub use aggregator::{AggregateState, Aggregator};
pub use controller::{ControlOutput, ControllerState, ControllerStep, FaultCause, SafetyController};
pub use derating::{Derating, DeratingFactors};
pub use engine::{BmsEngine, IngestOutcome};
pub use error::{AggregateError, TrackerError};
pub use hysteresis::OutputFilter;
pub use policy::{allocate_limits, LimitInput, LimitTotals};
pub use publisher::{NullPublisher, Publisher, RecordingPublisher};
pub use telemetry::SystemTelemetry;
pub use tracker::{Liveness, SystemSafety, SystemSnapshot, SystemState, TrackerSet};
