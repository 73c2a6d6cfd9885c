//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::{BTreeMap, HashMap};
use std::fmt;
use std::time::{Duration, Instant};

use sdi_bms_can::TelemetryUpdate;
use sdi_bms_common::time::elapsed_since;
use sdi_bms_common::{AppConfig, TrackerConfig};
use serde::Serialize;
use tracing::{debug, info, warn};

use crate::error::TrackerError;
use crate::telemetry::SystemTelemetry;

const ALL_KINDS_MASK: u8 = 0b1_1111;

/// Freshness of a system's telemetry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Liveness {
    Live,
    Stale,
    Lost,
}

impl Liveness {
    pub fn as_str(&self) -> &'static str {
        match self {
            Liveness::Live => "live",
            Liveness::Stale => "stale",
            Liveness::Lost => "lost",
        }
    }
}

impl fmt::Display for Liveness {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Safety sub-state reported by the system's own BMS.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum SystemSafety {
    Nominal,
    Alarm,
    Protection,
}

impl SystemSafety {
    pub fn from_flags(alarm_flags: u16, protection_flags: u16) -> Self {
        if protection_flags != 0 {
            SystemSafety::Protection
        } else if alarm_flags != 0 {
            SystemSafety::Alarm
        } else {
            SystemSafety::Nominal
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            SystemSafety::Nominal => "nominal",
            SystemSafety::Alarm => "alarm",
            SystemSafety::Protection => "protection",
        }
    }
}

impl fmt::Display for SystemSafety {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Bookkeeping for one physical battery system.
#[derive(Debug, Clone)]
pub struct SystemState {
    pub telemetry: SystemTelemetry,
    pub capacity_ah: f64,
    last_update: Instant,
    liveness: Liveness,
    safety: SystemSafety,
    seen_kinds: u8,
}

impl SystemState {
    fn new(system_id: u8, capacity_ah: f64, now: Instant) -> Self {
        Self {
            telemetry: SystemTelemetry::new(system_id),
            capacity_ah,
            last_update: now,
            liveness: Liveness::Live,
            safety: SystemSafety::Nominal,
            seen_kinds: 0,
        }
    }

    pub fn system_id(&self) -> u8 {
        self.telemetry.system_id
    }

    pub fn last_update(&self) -> Instant {
        self.last_update
    }

    pub fn liveness(&self) -> Liveness {
        self.liveness
    }

    pub fn safety(&self) -> SystemSafety {
        self.safety
    }

    /// All five frame kinds have arrived at least once.
    pub fn is_complete(&self) -> bool {
        self.seen_kinds & ALL_KINDS_MASK == ALL_KINDS_MASK
    }

    pub fn snapshot(&self) -> SystemSnapshot {
        SystemSnapshot {
            system_id: self.system_id(),
            liveness: self.liveness,
            safety: self.safety,
            complete: self.is_complete(),
            capacity_ah: self.capacity_ah,
            power_w: self.telemetry.power_w(),
            consumed_ah: self.telemetry.consumed_ah(self.capacity_ah),
            telemetry: self.telemetry.clone(),
        }
    }
}

/// Read-only view of a system handed to publishers.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct SystemSnapshot {
    pub system_id: u8,
    pub liveness: Liveness,
    pub safety: SystemSafety,
    pub complete: bool,
    pub capacity_ah: f64,
    pub power_w: f64,
    pub consumed_ah: f64,
    pub telemetry: SystemTelemetry,
}

/// Arena of tracked systems keyed by system id.
///
/// Systems are created on their first valid frame and evicted after
/// `evict_after` without traffic.
#[derive(Debug)]
pub struct TrackerSet {
    config: TrackerConfig,
    max_systems: u8,
    capacities: HashMap<u8, f64>,
    systems: BTreeMap<u8, SystemState>,
}

impl TrackerSet {
    pub fn new(config: TrackerConfig, max_systems: u8, capacities: HashMap<u8, f64>) -> Self {
        Self {
            config,
            max_systems,
            capacities,
            systems: BTreeMap::new(),
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        let capacities = config
            .systems
            .iter()
            .map(|system| (system.id, system.capacity_ah))
            .collect();
        Self::new(config.tracker.clone(), config.can.max_systems, capacities)
    }

    /// Merge a decoded update into its system, creating the system if needed.
    pub fn apply(
        &mut self,
        system_id: u8,
        update: &TelemetryUpdate,
        at: Instant,
    ) -> Result<&SystemState, TrackerError> {
        if system_id == 0 || system_id > self.max_systems {
            return Err(TrackerError::UnknownSystem {
                system_id,
                max_systems: self.max_systems,
            });
        }
        let capacity_ah = self
            .capacities
            .get(&system_id)
            .copied()
            .unwrap_or(self.config.default_capacity_ah);
        let state = self.systems.entry(system_id).or_insert_with(|| {
            info!(system_id, capacity_ah, "tracking new battery system");
            SystemState::new(system_id, capacity_ah, at)
        });

        state.telemetry.merge(update);
        state.seen_kinds |= update.kind().mask();
        // Frames may be handed over out of order; never move the clock back.
        state.last_update = state.last_update.max(at);
        if state.liveness != Liveness::Live {
            info!(system_id, from = %state.liveness, "battery system live again");
            state.liveness = Liveness::Live;
        }

        let safety = SystemSafety::from_flags(
            state.telemetry.alarm_flags,
            state.telemetry.protection_flags,
        );
        if safety != state.safety {
            match safety {
                SystemSafety::Nominal => {
                    info!(system_id, from = %state.safety, "battery system back to nominal")
                }
                _ => warn!(
                    system_id,
                    safety = %safety,
                    alarm_flags = state.telemetry.alarm_flags,
                    protection_flags = state.telemetry.protection_flags,
                    "battery system safety state changed"
                ),
            }
            state.safety = safety;
        }
        Ok(&*state)
    }

    /// Re-evaluate liveness against `now` and evict long-absent systems.
    pub fn evaluate(&mut self, now: Instant) {
        let config = &self.config;
        self.systems.retain(|system_id, state| {
            let age = elapsed_since(now, state.last_update);
            if age > config.evict_after {
                warn!(
                    system_id = *system_id,
                    age_s = age.as_secs_f64(),
                    "evicting absent battery system"
                );
                return false;
            }
            let liveness = liveness_for(age, config);
            if liveness != state.liveness {
                match liveness {
                    Liveness::Stale => {
                        debug!(system_id = *system_id, age_s = age.as_secs_f64(), "battery system stale")
                    }
                    _ => warn!(
                        system_id = *system_id,
                        liveness = %liveness,
                        age_s = age.as_secs_f64(),
                        "battery system liveness changed"
                    ),
                }
                state.liveness = liveness;
            }
            true
        });
    }

    pub fn get(&self, system_id: u8) -> Option<&SystemState> {
        self.systems.get(&system_id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &SystemState> {
        self.systems.values()
    }

    pub fn len(&self) -> usize {
        self.systems.len()
    }

    pub fn is_empty(&self) -> bool {
        self.systems.is_empty()
    }

    pub fn live_count(&self) -> usize {
        self.systems
            .values()
            .filter(|state| state.liveness == Liveness::Live)
            .count()
    }
}

fn liveness_for(age: Duration, config: &TrackerConfig) -> Liveness {
    if age > config.lost_after {
        Liveness::Lost
    } else if age > config.stale_after {
        Liveness::Stale
    } else {
        Liveness::Live
    }
}
