//! ---
//! ems_section: "04-runtime"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Runtime helpers supporting the battery daemon."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Scheduling helpers for the battery daemon: the periodic tick source and a
//! set of named tasks joined at shutdown.

pub mod scheduling;

pub use scheduling::{RateLimiter, TaskSet};
