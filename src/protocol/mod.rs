//! Wire-format codecs for the three field protocols carried by the virtual
//! bus, plus the shared frame vocabulary (protocol, direction, status).
//!
//! Each codec is a pair of pure functions over byte slices. Decoding never
//! panics: malformed input is reported through [`CodecError`] with a stable
//! error code, and well-formed frames round-trip without loss.

pub mod modbus;
pub mod station_bus;
pub mod telecontrol;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Protocol spoken on a given link.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
pub enum LinkProtocol {
    InternalBus,
    ModbusTcp,
    Iec61850,
    Iec104,
}

impl core::fmt::Display for LinkProtocol {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        match self {
            LinkProtocol::InternalBus => write!(f, "internalbus"),
            LinkProtocol::ModbusTcp => write!(f, "modbus"),
            LinkProtocol::Iec61850 => write!(f, "iec61850"),
            LinkProtocol::Iec104 => write!(f, "iec104"),
        }
    }
}

/// Transfer direction relative to the station hierarchy.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Uplink,
    Downlink,
}

impl Direction {
    /// Direction of the synchronous reply to a message sent this way.
    pub fn flipped(self) -> Self {
        match self {
            Direction::Uplink => Direction::Downlink,
            Direction::Downlink => Direction::Uplink,
        }
    }
}

/// Business status attached to frame records and device reports.
///
/// Ordered so that `max` picks the worst status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum CommStatus {
    Normal,
    Warning,
    Error,
}

impl CommStatus {
    pub fn merge(self, other: Self) -> Self {
        self.max(other)
    }

    pub fn is_error(self) -> bool {
        self == CommStatus::Error
    }
}

/// Decode failures for all three codecs. Error codes are stable and appear
/// verbatim in frame records.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum CodecError {
    #[error("modbus_tcp: short_frame")]
    ShortFrame,
    #[error("modbus_tcp: bad_protocol_id")]
    BadProtocolId,
    #[error("modbus_tcp: bad_length")]
    LengthMismatch,
    #[error("modbus_tcp: bad_pdu_len")]
    BadPduLength,
    #[error("modbus_tcp: bad_byte_count")]
    BadByteCount,
    #[error("modbus_tcp: unsupported_fc_{0}")]
    UnsupportedFunction(u8),
    #[error("iec61850: short")]
    StationShort,
    #[error("iec61850: bad_magic")]
    StationBadMagic,
    #[error("iec61850: bad_length")]
    StationBadLength,
    #[error("iec61850: bad_payload")]
    StationBadPayload,
    #[error("iec104: short")]
    TelecontrolShort,
    #[error("iec104: bad_start")]
    TelecontrolBadStart,
    #[error("iec104: bad_payload")]
    TelecontrolBadPayload,
}

/// Uppercase hex rendering used wherever raw payloads are surfaced.
pub fn payload_hex(bytes: &[u8]) -> alloc::string::String {
    use core::fmt::Write;
    let mut out = alloc::string::String::with_capacity(bytes.len() * 2);
    for b in bytes {
        // Writing to a String cannot fail.
        let _ = write!(out, "{b:02X}");
    }
    out
}
