//! ---
//! ems_section: "02-can-protocol"
//! ems_subsection: "module"
//! ems_type: "source"
//! ems_scope: "code"
//! ems_description: "Samsung SDI CAN frame layout, codec, and capture parsing."
//! ems_version: "v0.0.0-prealpha"
//! ems_owner: "tbd"
//! ---
//! Parser for `candump -L` captures, e.g.
//! `(1697712000.123456) can0 500#5A14F4FF50610201`.

use std::io::BufRead;
use std::time::{Duration, Instant};

use tracing::trace;

use crate::error::CandumpError;
use crate::frame::RawFrame;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CandumpRecord {
    /// Capture timestamp as seconds since the epoch.
    pub log_time: Duration,
    pub interface: String,
    pub id: u32,
    pub data: Vec<u8>,
}

impl CandumpRecord {
    /// Rebase the capture time onto a monotonic clock, `start` being the
    /// instant that corresponds to `first_log_time`. `None` when the offset
    /// does not fit the clock.
    pub fn to_raw_frame(&self, start: Instant, first_log_time: Duration) -> Option<RawFrame> {
        let offset = self.log_time.saturating_sub(first_log_time);
        let timestamp = start.checked_add(offset)?;
        Some(RawFrame::new(self.id, self.data.clone(), timestamp))
    }
}

/// Parse a single line. Blank lines and `#` comments yield `None`.
pub fn parse_line(line_no: usize, line: &str) -> Result<Option<CandumpRecord>, CandumpError> {
    let trimmed = line.trim();
    if trimmed.is_empty() || trimmed.starts_with('#') {
        return Ok(None);
    }
    let syntax = |message: &str| CandumpError::Syntax {
        line: line_no,
        message: message.to_owned(),
    };

    let mut parts = trimmed.split_whitespace();
    let stamp = parts.next().ok_or_else(|| syntax("missing timestamp"))?;
    let interface = parts.next().ok_or_else(|| syntax("missing interface"))?;
    let body = parts.next().ok_or_else(|| syntax("missing frame"))?;

    let seconds = stamp
        .strip_prefix('(')
        .and_then(|s| s.strip_suffix(')'))
        .and_then(|s| s.parse::<f64>().ok())
        .ok_or_else(|| syntax("timestamp must look like (seconds.micros)"))?;
    let log_time = Duration::try_from_secs_f64(seconds)
        .map_err(|_| syntax("timestamp is negative or out of range"))?;

    let (id_hex, data_hex) = body
        .split_once('#')
        .ok_or_else(|| syntax("frame must look like ID#DATA"))?;
    if data_hex.starts_with('R') {
        trace!(line = line_no, "skipping remote request frame");
        return Ok(None);
    }
    let id = u32::from_str_radix(id_hex, 16).map_err(|_| syntax("identifier is not hex"))?;
    let data = hex::decode(data_hex).map_err(|source| CandumpError::Payload {
        line: line_no,
        source,
    })?;

    Ok(Some(CandumpRecord {
        log_time,
        interface: interface.to_owned(),
        id,
        data,
    }))
}

/// Parse an entire capture.
pub fn parse_log<R: BufRead>(reader: R) -> Result<Vec<CandumpRecord>, CandumpError> {
    let mut records = Vec::new();
    for (index, line) in reader.lines().enumerate() {
        let line = line?;
        if let Some(record) = parse_line(index + 1, &line)? {
            records.push(record);
        }
    }
    Ok(records)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_standard_line() {
        let record = parse_line(1, "(1697712000.250000) can0 500#5A14F4FF50610201")
            .unwrap()
            .unwrap();
        assert_eq!(record.interface, "can0");
        assert_eq!(record.id, 0x500);
        assert_eq!(record.data, vec![0x5A, 0x14, 0xF4, 0xFF, 0x50, 0x61, 0x02, 0x01]);
        assert_eq!(record.log_time.as_millis(), 1_697_712_000_250);
    }

    #[test]
    fn rejects_out_of_range_timestamps() {
        for line in [
            "(1e300) can0 500#0000000000000000",
            "(-1.0) can0 500#0000000000000000",
            "(inf) can0 500#0000000000000000",
            "(NaN) can0 500#0000000000000000",
        ] {
            let err = parse_line(4, line).unwrap_err();
            assert!(matches!(err, CandumpError::Syntax { line: 4, .. }), "{}", line);
        }
    }

    #[test]
    fn offset_past_clock_range_yields_no_frame() {
        let record = parse_line(1, "(1.8e19) can0 500#0000000000000000")
            .unwrap()
            .unwrap();
        assert_eq!(record.to_raw_frame(Instant::now(), Duration::ZERO), None);
    }

    #[test]
    fn skips_comments_blank_and_remote_frames() {
        assert!(parse_line(1, "").unwrap().is_none());
        assert!(parse_line(2, "# captured on bench").unwrap().is_none());
        assert!(parse_line(3, "(1.0) can0 500#R").unwrap().is_none());
    }

    #[test]
    fn reports_line_numbers() {
        let err = parse_line(7, "(1.0) can0 500-0011").unwrap_err();
        assert!(err.to_string().starts_with("line 7"));
        let err = parse_line(8, "(1.0) can0 500#0G").unwrap_err();
        assert!(matches!(err, CandumpError::Payload { line: 8, .. }));
    }

    #[test]
    fn rebases_onto_monotonic_clock() {
        let log = "(100.000000) can0 500#0000000000000000\n(100.500000) can0 501#0000000000000000\n";
        let records = parse_log(log.as_bytes()).unwrap();
        assert_eq!(records.len(), 2);
        let start = Instant::now();
        let first = records[0].log_time;
        let second = records[1].to_raw_frame(start, first).unwrap();
        assert_eq!(second.timestamp.duration_since(start), Duration::from_millis(500));
        assert_eq!(second.id, 0x501);
    }
}
