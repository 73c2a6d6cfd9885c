//! ---
//! ems_section: "03-aggregation-control"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Battery system tracking, aggregation, and safety control."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::sync::Arc;

use parking_lot::Mutex;
use sdi_bms_can::{KeepAlive, RawFrame};

use crate::controller::ControlOutput;
use crate::tracker::SystemSnapshot;

/// Egress boundary of the engine. Implementations map values onto whatever
/// bus or transport the host uses and must not block for long: they are
/// called once per tick.
pub trait Publisher: Send + Sync {
    fn publish_system(&self, system: &SystemSnapshot);

    fn publish_control(&self, output: &ControlOutput);

    /// `frame` is the encoded form of `keepalive`, ready for the CAN writer.
    fn send_keepalive(&self, keepalive: &KeepAlive, frame: &RawFrame);
}

impl<P: Publisher + ?Sized> Publisher for Arc<P> {
    fn publish_system(&self, system: &SystemSnapshot) {
        (**self).publish_system(system)
    }

    fn publish_control(&self, output: &ControlOutput) {
        (**self).publish_control(output)
    }

    fn send_keepalive(&self, keepalive: &KeepAlive, frame: &RawFrame) {
        (**self).send_keepalive(keepalive, frame)
    }
}

/// Discards everything.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullPublisher;

impl Publisher for NullPublisher {
    fn publish_system(&self, _system: &SystemSnapshot) {}

    fn publish_control(&self, _output: &ControlOutput) {}

    fn send_keepalive(&self, _keepalive: &KeepAlive, _frame: &RawFrame) {}
}

/// Keeps every published value in memory.
#[derive(Debug, Default)]
pub struct RecordingPublisher {
    systems: Mutex<Vec<SystemSnapshot>>,
    controls: Mutex<Vec<ControlOutput>>,
    keepalives: Mutex<Vec<(KeepAlive, RawFrame)>>,
}

impl RecordingPublisher {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn systems(&self) -> Vec<SystemSnapshot> {
        self.systems.lock().clone()
    }

    pub fn controls(&self) -> Vec<ControlOutput> {
        self.controls.lock().clone()
    }

    pub fn last_control(&self) -> Option<ControlOutput> {
        self.controls.lock().last().cloned()
    }

    pub fn keepalives(&self) -> Vec<(KeepAlive, RawFrame)> {
        self.keepalives.lock().clone()
    }
}

impl Publisher for RecordingPublisher {
    fn publish_system(&self, system: &SystemSnapshot) {
        self.systems.lock().push(system.clone());
    }

    fn publish_control(&self, output: &ControlOutput) {
        self.controls.lock().push(output.clone());
    }

    fn send_keepalive(&self, keepalive: &KeepAlive, frame: &RawFrame) {
        self.keepalives.lock().push((*keepalive, frame.clone()));
    }
}
