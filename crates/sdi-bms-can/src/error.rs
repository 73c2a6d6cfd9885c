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

use thiserror::Error;

use crate::frame::FrameKind;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MalformedReason {
    /// Payload was not exactly eight bytes.
    Length(usize),
    /// SOC or SOH above 100 %.
    PercentOutOfRange(u8),
    /// A min/avg/max summary violated `min <= avg <= max`.
    UnorderedSummary,
}

impl fmt::Display for MalformedReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            MalformedReason::Length(len) => write!(f, "payload length {} (expected 8)", len),
            MalformedReason::PercentOutOfRange(raw) => write!(f, "percentage {} above 100", raw),
            MalformedReason::UnorderedSummary => f.write_str("min/avg/max summary out of order"),
        }
    }
}

#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum CodecError {
    #[error("malformed {kind} frame 0x{id:03X} from system {system_id}: {reason}")]
    MalformedFrame {
        id: u32,
        system_id: u8,
        kind: FrameKind,
        reason: MalformedReason,
    },
    #[error("malformed keep-alive frame: payload length {len} (expected 8)")]
    MalformedKeepAlive { len: usize },
    #[error("system id {0} cannot be addressed by the 0x500 identifier block")]
    SystemOutOfRange(u8),
}

impl CodecError {
    /// System the offending frame was addressed to, when known.
    pub fn system_id(&self) -> Option<u8> {
        match self {
            CodecError::MalformedFrame { system_id, .. } => Some(*system_id),
            CodecError::MalformedKeepAlive { .. } => None,
            CodecError::SystemOutOfRange(system_id) => Some(*system_id),
        }
    }
}

#[derive(Debug, Error)]
pub enum CandumpError {
    #[error("line {line}: {message}")]
    Syntax { line: usize, message: String },
    #[error("line {line}: invalid hex payload: {source}")]
    Payload {
        line: usize,
        #[source]
        source: hex::FromHexError,
    },
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}
