//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::collections::HashMap;
use std::time::Instant;

use parking_lot::Mutex;
use sdi_bms_can::{
    decode, encode_keepalive, CodecError, Decoded, FrameKind, KeepAlive, RawFrame,
};
use sdi_bms_common::AppConfig;
use tracing::{debug, trace, warn};

use crate::aggregator::{AggregateState, Aggregator};
use crate::controller::{ControlOutput, ControllerState, FaultCause, SafetyController};
use crate::error::TrackerError;
use crate::publisher::Publisher;
use crate::tracker::{Liveness, SystemSnapshot, TrackerSet};

/// What happened to one ingested frame.
#[derive(Debug, Clone, PartialEq)]
pub enum IngestOutcome {
    Applied { system_id: u8, kind: FrameKind },
    /// Foreign traffic or keep-alive echoes.
    Ignored,
    Malformed(CodecError),
    UnknownSystem(u8),
}

#[derive(Debug)]
struct EngineInner {
    tracker: TrackerSet,
    aggregator: Aggregator,
    controller: SafetyController,
    malformed_budget: u32,
    malformed_streaks: HashMap<u8, u32>,
    last_aggregate: Option<AggregateState>,
    last_output: Option<ControlOutput>,
}

/// Tracker set, aggregator, and controller behind one lock, so frame
/// ingestion and tick evaluation never interleave.
#[derive(Debug)]
pub struct BmsEngine<P> {
    inner: Mutex<EngineInner>,
    publisher: P,
}

impl<P: Publisher> BmsEngine<P> {
    pub fn new(config: &AppConfig, publisher: P) -> Self {
        Self {
            inner: Mutex::new(EngineInner {
                tracker: TrackerSet::from_config(config),
                aggregator: Aggregator::from_config(config),
                controller: SafetyController::from_config(config),
                malformed_budget: config.controller.malformed_budget,
                malformed_streaks: HashMap::new(),
                last_aggregate: None,
                last_output: None,
            }),
            publisher,
        }
    }

    pub fn publisher(&self) -> &P {
        &self.publisher
    }

    /// Decode a frame and fold it into its system. Never fails: problems are
    /// reported through the outcome and the log.
    pub fn ingest(&self, frame: RawFrame) -> IngestOutcome {
        let decoded = decode(&frame);
        let mut guard = self.inner.lock();
        let inner = &mut *guard;
        match decoded {
            Ok(Decoded::NotApplicable) => {
                trace!(id = frame.id, "ignoring foreign frame");
                IngestOutcome::Ignored
            }
            Ok(Decoded::KeepAlive(keepalive)) => {
                trace!(counter = keepalive.counter, "ignoring keep-alive echo");
                IngestOutcome::Ignored
            }
            Ok(Decoded::Telemetry { system_id, update }) => {
                let applied = inner
                    .tracker
                    .apply(system_id, &update, frame.timestamp)
                    .map(|_| ());
                match applied {
                    Ok(()) => {
                        inner.malformed_streaks.remove(&system_id);
                        IngestOutcome::Applied {
                            system_id,
                            kind: update.kind(),
                        }
                    }
                    Err(TrackerError::UnknownSystem {
                        system_id,
                        max_systems,
                    }) => {
                        warn!(
                            system_id,
                            max_systems,
                            id = frame.id,
                            "dropping frame from unknown system"
                        );
                        IngestOutcome::UnknownSystem(system_id)
                    }
                }
            }
            Err(err) => {
                warn!(id = frame.id, error = %err, "dropping malformed frame");
                // Streaks are keyed by the decoded id, not the tracker range:
                // ids above `can.max_systems` count too, and their well-formed
                // frames end as UnknownSystem without clearing the streak, so a
                // stray device sending garbage in the 0x500 block latches Fault.
                if let Some(system_id) = err.system_id() {
                    inner.record_malformed(system_id);
                }
                IngestOutcome::Malformed(err)
            }
        }
    }

    /// Run liveness, aggregation, and the controller for `now`, then publish.
    pub fn tick(&self, now: Instant) -> ControlOutput {
        let (output, systems, keepalive) = {
            let mut guard = self.inner.lock();
            let inner = &mut *guard;
            inner.tracker.evaluate(now);
            let aggregate = inner.aggregator.aggregate(&inner.tracker);
            let mut step = inner.controller.step(aggregate.as_ref(), now);
            step.output.expected_systems = inner.aggregator.expected_count(&inner.tracker);

            let systems: Vec<SystemSnapshot> = inner
                .tracker
                .iter()
                .filter(|state| state.liveness() == Liveness::Live)
                .map(|state| state.snapshot())
                .collect();
            inner.last_aggregate = aggregate.ok();
            inner.last_output = Some(step.output.clone());
            (step.output, systems, step.keepalive)
        };

        for system in &systems {
            self.publisher.publish_system(system);
        }
        self.publisher.publish_control(&output);
        if let Some(keepalive) = keepalive {
            self.send_keepalive(&keepalive, now);
        }
        debug!(
            state = %output.state,
            charge_limit_a = output.charge_limit_a,
            discharge_limit_a = output.discharge_limit_a,
            live = output.live_systems,
            "tick complete"
        );
        output
    }

    /// Clear a latched Fault. Tracked systems are kept.
    pub fn reset(&self) {
        let mut inner = self.inner.lock();
        inner.malformed_streaks.clear();
        inner.controller.reset();
    }

    pub fn state(&self) -> ControllerState {
        self.inner.lock().controller.state()
    }

    pub fn fault(&self) -> Option<FaultCause> {
        self.inner.lock().controller.fault()
    }

    pub fn system(&self, system_id: u8) -> Option<SystemSnapshot> {
        self.inner
            .lock()
            .tracker
            .get(system_id)
            .map(|state| state.snapshot())
    }

    pub fn systems(&self) -> Vec<SystemSnapshot> {
        self.inner
            .lock()
            .tracker
            .iter()
            .map(|state| state.snapshot())
            .collect()
    }

    pub fn last_aggregate(&self) -> Option<AggregateState> {
        self.inner.lock().last_aggregate.clone()
    }

    pub fn last_output(&self) -> Option<ControlOutput> {
        self.inner.lock().last_output.clone()
    }

    fn send_keepalive(&self, keepalive: &KeepAlive, now: Instant) {
        let frame = encode_keepalive(keepalive, now);
        self.publisher.send_keepalive(keepalive, &frame);
    }
}

impl EngineInner {
    fn record_malformed(&mut self, system_id: u8) {
        let streak = self.malformed_streaks.entry(system_id).or_insert(0);
        *streak += 1;
        let consecutive = *streak;
        if consecutive > self.malformed_budget {
            self.controller.trip_fault(FaultCause::MalformedFrames {
                system_id,
                consecutive,
            });
        }
    }
}
