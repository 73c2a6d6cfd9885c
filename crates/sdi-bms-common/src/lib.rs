//! ---
//! ems_section: "01-core-functionality"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Shared primitives and utilities for the battery aggregation runtime."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Shared primitives for the SDI battery aggregation workspace.
//! This crate exposes configuration loading, tracing initialisation, and
//! time helpers consumed by the codec, core engine, and daemon.

pub mod config;
pub mod logging;
pub mod time;

pub use config::{
    AppConfig, CanConfig, ControllerConfig, DeratingConfig, HysteresisConfig, LimitPolicy,
    LimitsConfig, LoadedAppConfig, LoggingConfig, MetricsConfig, SimulationConfig, SystemConfig,
    TrackerConfig,
};
pub use logging::{init_tracing, LogFormat};
