//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Safety and ramp state machine sitting between the aggregate and anything
//! that actuates current.

use std::fmt;
use std::time::Instant;

use sdi_bms_can::KeepAlive;
use sdi_bms_common::time::{elapsed_since, progress};
use sdi_bms_common::{AppConfig, ControllerConfig, DeratingConfig, HysteresisConfig};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::aggregator::AggregateState;
use crate::derating::{Derating, DeratingFactors};
use crate::error::AggregateError;
use crate::hysteresis::OutputFilter;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ControllerState {
    /// No aggregate seen yet.
    Init,
    RampUp,
    Active,
    Derated,
    Watchdog,
    /// Terminal until [`SafetyController::reset`].
    Fault,
}

impl ControllerState {
    pub fn as_str(&self) -> &'static str {
        match self {
            ControllerState::Init => "init",
            ControllerState::RampUp => "ramp_up",
            ControllerState::Active => "active",
            ControllerState::Derated => "derated",
            ControllerState::Watchdog => "watchdog",
            ControllerState::Fault => "fault",
        }
    }

    /// Numeric code carried in the keep-alive frame and exported as a gauge.
    pub fn code(&self) -> u8 {
        match self {
            ControllerState::Init => 0,
            ControllerState::RampUp => 1,
            ControllerState::Active => 2,
            ControllerState::Derated => 3,
            ControllerState::Watchdog => 4,
            ControllerState::Fault => 5,
        }
    }

    /// States in which the batteries are trusted and kept awake.
    pub fn is_energised(&self) -> bool {
        matches!(
            self,
            ControllerState::RampUp | ControllerState::Active | ControllerState::Derated
        )
    }
}

impl fmt::Display for ControllerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
#[serde(tag = "cause", rename_all = "snake_case")]
pub enum FaultCause {
    NoLiveSystems { outage_s: f64 },
    MalformedFrames { system_id: u8, consecutive: u32 },
}

impl fmt::Display for FaultCause {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FaultCause::NoLiveSystems { outage_s } => {
                write!(f, "no live battery systems for {:.1} s", outage_s)
            }
            FaultCause::MalformedFrames {
                system_id,
                consecutive,
            } => write!(
                f,
                "{} consecutive malformed frames from system {}",
                consecutive, system_id
            ),
        }
    }
}

/// Values that are safe to expose downstream.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ControlOutput {
    pub state: ControllerState,
    pub fault: Option<FaultCause>,
    pub charge_limit_a: f64,
    pub discharge_limit_a: f64,
    pub derating_factor: f64,
    pub ramp_progress: f64,
    pub disconnect_request: bool,
    pub heartbeat_counter: u16,
    pub soc_pct: f64,
    pub soh_pct: f64,
    pub voltage_v: f64,
    pub current_a: f64,
    pub power_w: f64,
    pub temperature_min_c: f64,
    pub temperature_max_c: f64,
    pub alarm_flags: u16,
    pub protection_flags: u16,
    pub live_systems: usize,
    pub expected_systems: usize,
    /// Any live system at or above the near-full SOC threshold.
    pub near_full: bool,
    pub degraded: bool,
}

/// Result of one controller evaluation.
#[derive(Debug, Clone, PartialEq)]
pub struct ControllerStep {
    pub output: ControlOutput,
    /// Present when a keep-alive frame is due this tick.
    pub keepalive: Option<KeepAlive>,
}

#[derive(Debug, Clone)]
pub struct SafetyController {
    config: ControllerConfig,
    derating: Derating,
    charge_filter: OutputFilter,
    discharge_filter: OutputFilter,
    state: ControllerState,
    fault: Option<FaultCause>,
    ramp_started: Option<Instant>,
    no_live_since: Option<Instant>,
    heartbeat_counter: u16,
    last_heartbeat: Option<Instant>,
}

impl SafetyController {
    pub fn new(
        config: ControllerConfig,
        derating: DeratingConfig,
        hysteresis: &HysteresisConfig,
    ) -> Self {
        Self {
            config,
            derating: Derating::new(derating),
            charge_filter: OutputFilter::from_config(hysteresis),
            discharge_filter: OutputFilter::from_config(hysteresis),
            state: ControllerState::Init,
            fault: None,
            ramp_started: None,
            no_live_since: None,
            heartbeat_counter: 0,
            last_heartbeat: None,
        }
    }

    pub fn from_config(config: &AppConfig) -> Self {
        Self::new(
            config.controller.clone(),
            config.derating.clone(),
            &config.hysteresis,
        )
    }

    pub fn state(&self) -> ControllerState {
        self.state
    }

    pub fn fault(&self) -> Option<FaultCause> {
        self.fault
    }

    /// Evaluate one tick.
    pub fn step(
        &mut self,
        aggregate: Result<&AggregateState, &AggregateError>,
        now: Instant,
    ) -> ControllerStep {
        if self.state != ControllerState::Fault {
            match aggregate {
                Ok(aggregate) => self.on_aggregate(aggregate, now),
                Err(err) => self.on_no_live(err, now),
            }
        }

        let (targets, factors, ramp_progress) = match (self.state, aggregate) {
            (state, Ok(aggregate)) if state.is_energised() => {
                let factors = self
                    .derating
                    .factors(aggregate.temperature_min_c, aggregate.temperature_max_c);
                let scale = self.ramp_progress(now);
                let targets = (
                    aggregate.charge_current_limit_a * factors.charge * scale,
                    aggregate.discharge_current_limit_a * factors.discharge * scale,
                );
                (targets, factors, scale)
            }
            _ => ((0.0, 0.0), DeratingFactors::FULL, 0.0),
        };
        let charge_limit_a = self.charge_filter.filter(targets.0, now);
        let discharge_limit_a = self.discharge_filter.filter(targets.1, now);
        let keepalive = self.heartbeat(now, charge_limit_a, discharge_limit_a);

        let mut output = ControlOutput {
            state: self.state,
            fault: self.fault,
            charge_limit_a,
            discharge_limit_a,
            derating_factor: factors.effective(),
            ramp_progress,
            disconnect_request: matches!(
                self.state,
                ControllerState::Watchdog | ControllerState::Fault
            ),
            heartbeat_counter: self.heartbeat_counter,
            soc_pct: 0.0,
            soh_pct: 0.0,
            voltage_v: 0.0,
            current_a: 0.0,
            power_w: 0.0,
            temperature_min_c: 0.0,
            temperature_max_c: 0.0,
            alarm_flags: 0,
            protection_flags: 0,
            live_systems: 0,
            expected_systems: 0,
            near_full: false,
            degraded: true,
        };
        if let Ok(aggregate) = aggregate {
            output.soc_pct = aggregate.soc_pct;
            output.soh_pct = aggregate.soh_pct;
            output.voltage_v = aggregate.voltage_v;
            output.current_a = aggregate.current_a;
            output.power_w = aggregate.power_w;
            output.temperature_min_c = aggregate.temperature_min_c;
            output.temperature_max_c = aggregate.temperature_max_c;
            output.alarm_flags = aggregate.alarm_flags;
            output.protection_flags = aggregate.protection_flags;
            output.live_systems = aggregate.live_systems;
            output.expected_systems = aggregate.expected_systems;
            output.near_full = aggregate.near_full;
            output.degraded = aggregate.degraded;
        }
        ControllerStep { output, keepalive }
    }

    /// Latch Fault from outside the tick path (e.g. repeated decode errors).
    pub fn trip_fault(&mut self, cause: FaultCause) {
        if self.state == ControllerState::Fault {
            return;
        }
        error!(from = %self.state, cause = %cause, "safety controller fault");
        self.state = ControllerState::Fault;
        self.fault = Some(cause);
    }

    /// Operator reset; the only way out of Fault.
    pub fn reset(&mut self) {
        info!(from = %self.state, "safety controller reset");
        self.state = ControllerState::Init;
        self.fault = None;
        self.ramp_started = None;
        self.no_live_since = None;
        self.last_heartbeat = None;
        self.charge_filter.reset();
        self.discharge_filter.reset();
    }

    fn on_aggregate(&mut self, aggregate: &AggregateState, now: Instant) {
        self.no_live_since = None;
        let age = elapsed_since(now, aggregate.newest_update);
        if age > self.config.watchdog_timeout {
            if !matches!(self.state, ControllerState::Init | ControllerState::Watchdog) {
                warn!(age_s = age.as_secs_f64(), "newest battery frame too old");
                self.transition(ControllerState::Watchdog);
            }
            return;
        }

        let (t_min, t_max) = (aggregate.temperature_min_c, aggregate.temperature_max_c);
        match self.state {
            ControllerState::Init | ControllerState::Watchdog => {
                self.ramp_started = Some(now);
                self.transition(ControllerState::RampUp);
            }
            ControllerState::RampUp => {
                if self.ramp_progress(now) >= 1.0 {
                    let next = if self.derating.should_enter(t_min, t_max) {
                        ControllerState::Derated
                    } else {
                        ControllerState::Active
                    };
                    self.transition(next);
                }
            }
            ControllerState::Active => {
                if self.derating.should_enter(t_min, t_max) {
                    self.transition(ControllerState::Derated);
                }
            }
            ControllerState::Derated => {
                if self.derating.may_exit(t_min, t_max) {
                    self.transition(ControllerState::Active);
                }
            }
            ControllerState::Fault => {}
        }
    }

    fn on_no_live(&mut self, err: &AggregateError, now: Instant) {
        // Before the first aggregate there is nothing to lose.
        if self.state == ControllerState::Init {
            return;
        }
        let since = *self.no_live_since.get_or_insert(now);
        let outage = elapsed_since(now, since);
        if outage > self.config.no_live_grace {
            self.trip_fault(FaultCause::NoLiveSystems {
                outage_s: outage.as_secs_f64(),
            });
        } else if self.state != ControllerState::Watchdog {
            warn!(%err, "aggregate unavailable; forcing zero limits");
            self.transition(ControllerState::Watchdog);
        }
    }

    fn ramp_progress(&self, now: Instant) -> f64 {
        match (self.state, self.ramp_started) {
            (ControllerState::RampUp, Some(started)) => {
                progress(elapsed_since(now, started), self.config.ramp_duration)
            }
            (ControllerState::RampUp, None) => 0.0,
            _ => 1.0,
        }
    }

    fn heartbeat(&mut self, now: Instant, charge_a: f64, discharge_a: f64) -> Option<KeepAlive> {
        if !self.state.is_energised() {
            self.last_heartbeat = None;
            return None;
        }
        if let Some(last) = self.last_heartbeat {
            if elapsed_since(now, last) < self.config.heartbeat_period {
                return None;
            }
        }
        self.last_heartbeat = Some(now);
        let keepalive = KeepAlive {
            counter: self.heartbeat_counter,
            state_code: self.state.code(),
            disconnect_request: false,
            charge_limit_a: charge_a,
            discharge_limit_a: discharge_a,
        };
        self.heartbeat_counter = self.heartbeat_counter.wrapping_add(1);
        debug!(counter = keepalive.counter, "keep-alive due");
        Some(keepalive)
    }

    fn transition(&mut self, next: ControllerState) {
        if next == self.state {
            return;
        }
        match next {
            ControllerState::Watchdog => {
                warn!(from = %self.state, to = %next, "safety controller watchdog")
            }
            _ => info!(from = %self.state, to = %next, "safety controller transition"),
        }
        self.state = next;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    fn controller() -> SafetyController {
        SafetyController::new(
            ControllerConfig::default(),
            DeratingConfig::default(),
            &HysteresisConfig::default(),
        )
    }

    fn aggregate(at: Instant) -> AggregateState {
        AggregateState {
            contributing: 1,
            live_systems: 1,
            expected_systems: 1,
            voltage_v: 52.0,
            current_a: 0.0,
            power_w: 0.0,
            soc_pct: 60.0,
            soh_pct: 98.0,
            charge_current_limit_a: 50.0,
            discharge_current_limit_a: 100.0,
            charge_voltage_v: 58.4,
            discharge_voltage_v: 44.8,
            cell_voltage_min_v: 3.3,
            cell_voltage_max_v: 3.3,
            cell_voltage_avg_v: 3.3,
            temperature_min_c: 20.0,
            temperature_max_c: 25.0,
            temperature_avg_c: 22.0,
            alarm_flags: 0,
            protection_flags: 0,
            tray_count: 4,
            normal_trays: 4,
            fault_trays: 0,
            total_capacity_ah: 94.0,
            near_full: false,
            degraded: false,
            newest_update: at,
        }
    }

    #[test]
    fn init_holds_zero_without_data() {
        let mut controller = controller();
        let err = AggregateError::NoLiveSystems { tracked: 0 };
        let step = controller.step(Err(&err), Instant::now());
        assert_eq!(step.output.state, ControllerState::Init);
        assert_eq!(step.output.charge_limit_a, 0.0);
        assert!(!step.output.disconnect_request);
        assert!(step.keepalive.is_none());
    }

    #[test]
    fn stale_newest_frame_trips_watchdog() {
        let mut controller = controller();
        let base = Instant::now();
        controller.step(Ok(&aggregate(base)), base);
        let later = base + Duration::from_secs(6);
        let step = controller.step(Ok(&aggregate(base)), later);
        assert_eq!(step.output.state, ControllerState::Watchdog);
        assert_eq!(step.output.charge_limit_a, 0.0);
        assert!(step.output.disconnect_request);
    }

    #[test]
    fn keepalive_follows_period_and_stops_in_watchdog() {
        let mut controller = controller();
        let base = Instant::now();
        let first = controller.step(Ok(&aggregate(base)), base);
        assert_eq!(first.keepalive.map(|k| k.counter), Some(0));
        assert_eq!(first.keepalive.map(|k| k.state_code), Some(1));

        let half = base + Duration::from_millis(500);
        assert!(controller.step(Ok(&aggregate(half)), half).keepalive.is_none());
        let second = base + Duration::from_secs(1);
        assert_eq!(
            controller
                .step(Ok(&aggregate(second)), second)
                .keepalive
                .map(|k| k.counter),
            Some(1)
        );

        let err = AggregateError::NoLiveSystems { tracked: 1 };
        let lost = base + Duration::from_secs(2);
        assert!(controller.step(Err(&err), lost).keepalive.is_none());
    }

    #[test]
    fn heartbeat_counter_wraps() {
        let mut controller = controller();
        controller.heartbeat_counter = u16::MAX;
        let base = Instant::now();
        let first = controller.step(Ok(&aggregate(base)), base);
        assert_eq!(first.keepalive.map(|k| k.counter), Some(u16::MAX));
        let next = base + Duration::from_secs(1);
        let second = controller.step(Ok(&aggregate(next)), next);
        assert_eq!(second.keepalive.map(|k| k.counter), Some(0));
    }

    #[test]
    fn hot_pack_derates_both_directions() {
        let mut controller = controller();
        let base = Instant::now();
        controller.step(Ok(&aggregate(base)), base);
        let done = base + Duration::from_secs(15);
        controller.step(Ok(&aggregate(done)), done);
        assert_eq!(controller.state(), ControllerState::Active);

        let hot_at = done + Duration::from_secs(1);
        let mut hot = aggregate(hot_at);
        hot.temperature_max_c = 50.0;
        let step = controller.step(Ok(&hot), hot_at);
        assert_eq!(step.output.state, ControllerState::Derated);
        assert!((step.output.charge_limit_a - 25.0).abs() < 1e-9);
        assert!((step.output.discharge_limit_a - 50.0).abs() < 1e-9);
        assert!((step.output.derating_factor - 0.5).abs() < 1e-9);
    }
}
