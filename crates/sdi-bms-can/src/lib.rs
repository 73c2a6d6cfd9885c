//! ---
//! ems_section: "02-can-protocol"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Samsung SDI CAN frame layout, codec, and capture parsing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Frame codec for Samsung SDI ELPM482 battery systems.
//!
//! Every battery system publishes five 8-byte telemetry frames on a block of
//! arbitration IDs starting at `0x500 + 0x10 * (system_id - 1)`. The codec is
//! pure: it turns a [`RawFrame`] into a typed [`TelemetryUpdate`] (or reports
//! that the frame is not battery traffic) and encodes telemetry and host
//! keep-alive frames back into bytes.

pub mod candump;
pub mod codec;
pub mod error;
pub mod frame;

pub use candump::{parse_line, parse_log, CandumpRecord};
pub use codec::{
    decode, encode_keepalive, encode_telemetry, CellVoltageSummary, CurrentLimits, Decoded,
    KeepAlive, SystemConfiguration, SystemStatus, TelemetryUpdate, TemperatureSummary,
};
pub use error::{CandumpError, CodecError, MalformedReason};
pub use frame::{
    classify, telemetry_id, FrameClass, FrameKind, RawFrame, FRAME_LEN, KEEPALIVE_ID,
    SYSTEM_STRIDE, TELEMETRY_BASE_ID,
};
