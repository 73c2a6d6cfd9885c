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

use sdi_bms_common::time::elapsed_since;
use sdi_bms_common::HysteresisConfig;

/// Holds an output value until it moves by more than `band` or has not been
/// refreshed for `max_interval`.
#[derive(Debug, Clone)]
pub struct OutputFilter {
    band: f64,
    max_interval: Duration,
    last: Option<(f64, Instant)>,
}

impl OutputFilter {
    pub fn new(band: f64, max_interval: Duration) -> Self {
        Self {
            band,
            max_interval,
            last: None,
        }
    }

    pub fn from_config(config: &HysteresisConfig) -> Self {
        Self::new(config.band_a, config.max_interval)
    }

    /// Feed the latest true value and return the value to expose.
    pub fn filter(&mut self, value: f64, now: Instant) -> f64 {
        let emit = match self.last {
            None => true,
            // Cutting current is never delayed.
            Some((previous, _)) if value == 0.0 && previous != 0.0 => true,
            Some((previous, at)) => {
                (value - previous).abs() > self.band
                    || elapsed_since(now, at) >= self.max_interval
            }
        };
        if emit {
            self.last = Some((value, now));
            value
        } else {
            self.last.map_or(value, |(previous, _)| previous)
        }
    }

    pub fn reset(&mut self) {
        self.last = None;
    }
}
