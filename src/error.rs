//! Error kinds surfaced to callers, per the collector's error handling
//! design: configuration errors abort startup, decoder errors are absorbed
//! locally (counted, not raised), and ring/session errors are raised to the
//! consumer loop.

use snafu::Snafu;
use std::net::SocketAddr;

/// Why an NFv5 (or similarly framed) datagram was rejected outright, before
/// any per-record inspection.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadPacketReason {
    HeaderTooShort,
    BadVersion,
    ZeroRecordCount,
    RecordCountTooLarge,
    LengthMismatch,
}

impl BadPacketReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BadPacketReason::HeaderTooShort => "header too short",
            BadPacketReason::BadVersion => "unsupported version",
            BadPacketReason::ZeroRecordCount => "zero record count",
            BadPacketReason::RecordCountTooLarge => "record count exceeds maximum",
            BadPacketReason::LengthMismatch => "length inconsistent with record count",
        }
    }
}

/// Why an individual flow record within an otherwise valid packet was
/// rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum BadRecordReason {
    ZeroPackets,
    ZeroBytes,
    MorePacketsThanBytes,
    EndBeforeStart,
}

impl BadRecordReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BadRecordReason::ZeroPackets => "zero packets",
            BadRecordReason::ZeroBytes => "zero bytes",
            BadRecordReason::MorePacketsThanBytes => "more packets than bytes",
            BadRecordReason::EndBeforeStart => "end before start after rollover adjustment",
        }
    }
}

/// Errors raised to a consumer loop (not absorbed as per-source counters).
#[derive(Debug, Snafu)]
pub enum SourceError {
    #[snafu(display("source has been stopped"))]
    Stopped,
    #[snafu(display("ring allocation failed while growing to serve a burst"))]
    Alloc,
    #[snafu(display("I/O error on source: {source}"))]
    Io { source: std::io::Error },
}

/// Errors raised while building (verifying) the probe/sensor/group model.
#[derive(Debug, Snafu)]
pub enum ConfigError {
    #[snafu(display("{file}:{line}: {message}"))]
    Syntax {
        file: String,
        line: usize,
        message: String,
    },
    #[snafu(display("unknown keyword '{keyword}' in {block} block"))]
    UnknownKeyword { block: String, keyword: String },
    #[snafu(display("duplicate {kind} name '{name}'"))]
    DuplicateName { kind: String, name: String },
    #[snafu(display("sensor '{sensor}' has no numeric id in the site file"))]
    UnresolvableSensorId { sensor: String },
    #[snafu(display("probes '{a}' and '{b}' register conflicting listeners on {addr}"))]
    ConflictingListener {
        a: String,
        b: String,
        addr: SocketAddr,
    },
    #[snafu(display("missing required value '{field}' in {block} block"))]
    MissingValue { block: String, field: String },
    #[snafu(display("include stack depth exceeded (max 8) at '{path}'"))]
    IncludeDepthExceeded { path: String },
    #[snafu(display("'{kind}' block starting at {file}:{line} was never closed"))]
    UnclosedBlock {
        kind: String,
        file: String,
        line: usize,
    },
}
