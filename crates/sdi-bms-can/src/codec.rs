//! ---
//! ems_section: "02-can-protocol"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Samsung SDI CAN frame layout, codec, and capture parsing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Byte layouts follow the ELPM482-00005 product specification, rev 0.2.
//! All multi-byte fields are little-endian. Scaled fields are decoded by
//! dividing by their divisor so a decoded value is the nearest `f64` to its
//! decimal reading (e.g. raw `5210` at `/100` is exactly `52.1`).

use std::time::Instant;

use serde::{Deserialize, Serialize};

use crate::error::{CodecError, MalformedReason};
use crate::frame::{
    classify, telemetry_id, FrameClass, FrameKind, RawFrame, FRAME_LEN, KEEPALIVE_ID,
};

const CENTI: f64 = 100.0;
const DECI: f64 = 10.0;
const MILLI: f64 = 1000.0;

/// Frame 0: pack voltage, current, SOC, SOH, BMS heartbeat counter.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct SystemStatus {
    pub voltage_v: f64,
    /// Positive while charging.
    pub current_a: f64,
    pub soc_pct: f64,
    pub soh_pct: f64,
    pub bms_heartbeat: u16,
}

/// Frame 1: alarm/protection bit sets and tray inventory.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct SystemConfiguration {
    pub alarm_flags: u16,
    pub protection_flags: u16,
    pub tray_count: u8,
    pub normal_trays: u8,
    pub fault_trays: u8,
}

/// Frame 2: BMS-requested charge/discharge envelope.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CurrentLimits {
    pub charge_voltage_v: f64,
    pub charge_current_limit_a: f64,
    pub discharge_current_limit_a: f64,
    pub discharge_voltage_v: f64,
}

/// Frame 3: cell voltage summary across all trays.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct CellVoltageSummary {
    pub avg_v: f64,
    pub max_v: f64,
    pub min_v: f64,
}

/// Frame 4: cell temperature summary across all trays.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct TemperatureSummary {
    pub avg_c: f64,
    pub max_c: f64,
    pub min_c: f64,
}

/// Field set carried by one telemetry frame.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum TelemetryUpdate {
    Status(SystemStatus),
    Config(SystemConfiguration),
    Limits(CurrentLimits),
    CellVoltage(CellVoltageSummary),
    Temperature(TemperatureSummary),
}

impl TelemetryUpdate {
    pub fn kind(&self) -> FrameKind {
        match self {
            TelemetryUpdate::Status(_) => FrameKind::SystemStatus,
            TelemetryUpdate::Config(_) => FrameKind::SystemConfig,
            TelemetryUpdate::Limits(_) => FrameKind::Limits,
            TelemetryUpdate::CellVoltage(_) => FrameKind::CellVoltage,
            TelemetryUpdate::Temperature(_) => FrameKind::Temperature,
        }
    }
}

/// Host keep-alive sent to the batteries while the controller trusts them.
#[derive(Debug, Clone, Copy, PartialEq, Default, Serialize, Deserialize)]
pub struct KeepAlive {
    pub counter: u16,
    pub state_code: u8,
    pub disconnect_request: bool,
    pub charge_limit_a: f64,
    pub discharge_limit_a: f64,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub enum Decoded {
    Telemetry {
        system_id: u8,
        update: TelemetryUpdate,
    },
    KeepAlive(KeepAlive),
    /// Not battery traffic; callers ignore it.
    NotApplicable,
}

/// Decode one frame. Pure: identical bytes always yield identical fields.
pub fn decode(frame: &RawFrame) -> Result<Decoded, CodecError> {
    match classify(frame.id) {
        FrameClass::Other => Ok(Decoded::NotApplicable),
        FrameClass::KeepAlive => {
            let data = payload(&frame.data).ok_or(CodecError::MalformedKeepAlive {
                len: frame.data.len(),
            })?;
            Ok(Decoded::KeepAlive(decode_keepalive(data)))
        }
        FrameClass::Telemetry { system_id, kind } => {
            let malformed = |reason| CodecError::MalformedFrame {
                id: frame.id,
                system_id,
                kind,
                reason,
            };
            let data = payload(&frame.data)
                .ok_or_else(|| malformed(MalformedReason::Length(frame.data.len())))?;
            let update = decode_payload(kind, data).map_err(malformed)?;
            Ok(Decoded::Telemetry { system_id, update })
        }
    }
}

/// Encode a telemetry update for the given system.
pub fn encode_telemetry(
    system_id: u8,
    update: &TelemetryUpdate,
    timestamp: Instant,
) -> Result<RawFrame, CodecError> {
    let id = telemetry_id(system_id, update.kind())
        .ok_or(CodecError::SystemOutOfRange(system_id))?;
    Ok(RawFrame::new(id, encode_payload(update).to_vec(), timestamp))
}

pub fn encode_keepalive(keepalive: &KeepAlive, timestamp: Instant) -> RawFrame {
    let mut data = [0u8; FRAME_LEN];
    put_u16(&mut data, 0, keepalive.counter);
    data[2] = keepalive.state_code;
    data[3] = u8::from(keepalive.disconnect_request);
    put_u16(&mut data, 4, to_u16(keepalive.charge_limit_a, DECI));
    put_u16(&mut data, 6, to_u16(keepalive.discharge_limit_a, DECI));
    RawFrame::new(KEEPALIVE_ID, data.to_vec(), timestamp)
}

fn payload(data: &[u8]) -> Option<&[u8; FRAME_LEN]> {
    data.try_into().ok()
}

fn decode_keepalive(data: &[u8; FRAME_LEN]) -> KeepAlive {
    KeepAlive {
        counter: u16_at(data, 0),
        state_code: data[2],
        disconnect_request: data[3] & 0x01 != 0,
        charge_limit_a: f64::from(u16_at(data, 4)) / DECI,
        discharge_limit_a: f64::from(u16_at(data, 6)) / DECI,
    }
}

fn decode_payload(
    kind: FrameKind,
    data: &[u8; FRAME_LEN],
) -> Result<TelemetryUpdate, MalformedReason> {
    let update = match kind {
        FrameKind::SystemStatus => {
            let soc = percent(data[4])?;
            let soh = percent(data[5])?;
            TelemetryUpdate::Status(SystemStatus {
                voltage_v: f64::from(u16_at(data, 0)) / CENTI,
                current_a: f64::from(i16_at(data, 2)),
                soc_pct: soc,
                soh_pct: soh,
                bms_heartbeat: u16_at(data, 6),
            })
        }
        FrameKind::SystemConfig => TelemetryUpdate::Config(SystemConfiguration {
            alarm_flags: u16_at(data, 0),
            protection_flags: u16_at(data, 2),
            tray_count: data[4],
            normal_trays: data[5],
            fault_trays: data[6],
        }),
        FrameKind::Limits => TelemetryUpdate::Limits(CurrentLimits {
            charge_voltage_v: f64::from(u16_at(data, 0)) / DECI,
            charge_current_limit_a: f64::from(u16_at(data, 2)) / DECI,
            discharge_current_limit_a: f64::from(u16_at(data, 4)) / DECI,
            discharge_voltage_v: f64::from(u16_at(data, 6)) / DECI,
        }),
        FrameKind::CellVoltage => {
            let (avg, max, min) = (u16_at(data, 0), u16_at(data, 2), u16_at(data, 4));
            ordered(min, avg, max)?;
            TelemetryUpdate::CellVoltage(CellVoltageSummary {
                avg_v: f64::from(avg) / MILLI,
                max_v: f64::from(max) / MILLI,
                min_v: f64::from(min) / MILLI,
            })
        }
        FrameKind::Temperature => {
            let (avg, max, min) = (data[4] as i8, data[5] as i8, data[6] as i8);
            ordered(min, avg, max)?;
            TelemetryUpdate::Temperature(TemperatureSummary {
                avg_c: f64::from(avg),
                max_c: f64::from(max),
                min_c: f64::from(min),
            })
        }
    };
    Ok(update)
}

fn encode_payload(update: &TelemetryUpdate) -> [u8; FRAME_LEN] {
    let mut data = [0u8; FRAME_LEN];
    match update {
        TelemetryUpdate::Status(status) => {
            put_u16(&mut data, 0, to_u16(status.voltage_v, CENTI));
            put_i16(&mut data, 2, to_i16(status.current_a));
            data[4] = to_percent(status.soc_pct);
            data[5] = to_percent(status.soh_pct);
            put_u16(&mut data, 6, status.bms_heartbeat);
        }
        TelemetryUpdate::Config(config) => {
            put_u16(&mut data, 0, config.alarm_flags);
            put_u16(&mut data, 2, config.protection_flags);
            data[4] = config.tray_count;
            data[5] = config.normal_trays;
            data[6] = config.fault_trays;
        }
        TelemetryUpdate::Limits(limits) => {
            put_u16(&mut data, 0, to_u16(limits.charge_voltage_v, DECI));
            put_u16(&mut data, 2, to_u16(limits.charge_current_limit_a, DECI));
            put_u16(&mut data, 4, to_u16(limits.discharge_current_limit_a, DECI));
            put_u16(&mut data, 6, to_u16(limits.discharge_voltage_v, DECI));
        }
        TelemetryUpdate::CellVoltage(cells) => {
            put_u16(&mut data, 0, to_u16(cells.avg_v, MILLI));
            put_u16(&mut data, 2, to_u16(cells.max_v, MILLI));
            put_u16(&mut data, 4, to_u16(cells.min_v, MILLI));
        }
        TelemetryUpdate::Temperature(temps) => {
            data[4] = to_i8(temps.avg_c) as u8;
            data[5] = to_i8(temps.max_c) as u8;
            data[6] = to_i8(temps.min_c) as u8;
        }
    }
    data
}

fn percent(raw: u8) -> Result<f64, MalformedReason> {
    if raw > 100 {
        return Err(MalformedReason::PercentOutOfRange(raw));
    }
    Ok(f64::from(raw))
}

fn ordered<T: PartialOrd>(min: T, avg: T, max: T) -> Result<(), MalformedReason> {
    if min <= avg && avg <= max {
        Ok(())
    } else {
        Err(MalformedReason::UnorderedSummary)
    }
}

fn u16_at(data: &[u8; FRAME_LEN], offset: usize) -> u16 {
    u16::from_le_bytes([data[offset], data[offset + 1]])
}

fn i16_at(data: &[u8; FRAME_LEN], offset: usize) -> i16 {
    i16::from_le_bytes([data[offset], data[offset + 1]])
}

fn put_u16(data: &mut [u8; FRAME_LEN], offset: usize, value: u16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

fn put_i16(data: &mut [u8; FRAME_LEN], offset: usize, value: i16) {
    data[offset..offset + 2].copy_from_slice(&value.to_le_bytes());
}

// Encoders saturate at the field range; NaN encodes as zero.
fn to_u16(value: f64, divisor: f64) -> u16 {
    (value * divisor).round().clamp(0.0, f64::from(u16::MAX)) as u16
}

fn to_i16(value: f64) -> i16 {
    value
        .round()
        .clamp(f64::from(i16::MIN), f64::from(i16::MAX)) as i16
}

fn to_i8(value: f64) -> i8 {
    value.round().clamp(f64::from(i8::MIN), f64::from(i8::MAX)) as i8
}

fn to_percent(value: f64) -> u8 {
    value.round().clamp(0.0, 100.0) as u8
}
