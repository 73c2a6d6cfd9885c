//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use thiserror::Error;

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum TrackerError {
    #[error("system {system_id} outside configured range 1..={max_systems}")]
    UnknownSystem { system_id: u8, max_systems: u8 },
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum AggregateError {
    /// No complete system is currently Live.
    #[error("no live battery systems ({tracked} tracked)")]
    NoLiveSystems { tracked: usize },
}
