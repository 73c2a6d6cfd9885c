//! ---
//! ems_section: "02-can-protocol"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Samsung SDI CAN frame layout, codec, and capture parsing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
use std::fmt;
use std::time::Instant;

use serde::{Deserialize, Serialize};

/// First arbitration ID of system 1's telemetry block.
pub const TELEMETRY_BASE_ID: u32 = 0x500;
/// Distance between consecutive systems' telemetry blocks.
pub const SYSTEM_STRIDE: u32 = 0x10;
/// Host-to-battery keep-alive frame.
pub const KEEPALIVE_ID: u32 = 0x4F0;
/// Every Samsung SDI frame carries exactly eight data bytes.
pub const FRAME_LEN: usize = 8;

const MAX_SYSTEM_ID: u8 = 16;

/// Frame as delivered by the CAN transport.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RawFrame {
    pub id: u32,
    pub data: Vec<u8>,
    pub timestamp: Instant,
}

impl RawFrame {
    pub fn new(id: u32, data: impl Into<Vec<u8>>, timestamp: Instant) -> Self {
        Self {
            id,
            data: data.into(),
            timestamp,
        }
    }
}

/// The five telemetry frame kinds each battery system emits.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FrameKind {
    SystemStatus,
    SystemConfig,
    Limits,
    CellVoltage,
    Temperature,
}

impl FrameKind {
    pub const ALL: [FrameKind; 5] = [
        FrameKind::SystemStatus,
        FrameKind::SystemConfig,
        FrameKind::Limits,
        FrameKind::CellVoltage,
        FrameKind::Temperature,
    ];

    /// Offset of this kind inside a system's identifier block.
    pub fn offset(self) -> u32 {
        match self {
            FrameKind::SystemStatus => 0,
            FrameKind::SystemConfig => 1,
            FrameKind::Limits => 2,
            FrameKind::CellVoltage => 3,
            FrameKind::Temperature => 4,
        }
    }

    pub fn from_offset(offset: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|kind| kind.offset() == offset)
    }

    /// Bit used when tracking which kinds a system has delivered.
    pub fn mask(self) -> u8 {
        1 << self.offset()
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            FrameKind::SystemStatus => "system_status",
            FrameKind::SystemConfig => "system_config",
            FrameKind::Limits => "limits",
            FrameKind::CellVoltage => "cell_voltage",
            FrameKind::Temperature => "temperature",
        }
    }
}

impl fmt::Display for FrameKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// What an arbitration ID refers to, before looking at the payload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FrameClass {
    Telemetry { system_id: u8, kind: FrameKind },
    KeepAlive,
    Other,
}

/// Arbitration ID for a system's frame of the given kind.
pub fn telemetry_id(system_id: u8, kind: FrameKind) -> Option<u32> {
    if system_id == 0 || system_id > MAX_SYSTEM_ID {
        return None;
    }
    Some(TELEMETRY_BASE_ID + SYSTEM_STRIDE * u32::from(system_id - 1) + kind.offset())
}

pub fn classify(id: u32) -> FrameClass {
    if id == KEEPALIVE_ID {
        return FrameClass::KeepAlive;
    }
    let block_end = TELEMETRY_BASE_ID + SYSTEM_STRIDE * u32::from(MAX_SYSTEM_ID);
    if !(TELEMETRY_BASE_ID..block_end).contains(&id) {
        return FrameClass::Other;
    }
    let relative = id - TELEMETRY_BASE_ID;
    match FrameKind::from_offset(relative % SYSTEM_STRIDE) {
        Some(kind) => FrameClass::Telemetry {
            // bounded by block_end above
            system_id: (relative / SYSTEM_STRIDE) as u8 + 1,
            kind,
        },
        None => FrameClass::Other,
    }
}
