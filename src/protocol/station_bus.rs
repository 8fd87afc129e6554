//! Station-bus report codec (IEC 61850 flavoured).
//!
//! Frames carry a JSON dataset report behind a fixed binary preamble:
//! 8 ASCII magic bytes, a u32 BE body length, then the body. The body is a
//! `service`/`direction`/`dataset`/`entries` object; entries are key/value
//! points with a quality flag.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use super::{CodecError, Direction};

pub const MAGIC: &[u8; 8] = b"IEC61850";
const HEADER_LEN: usize = 12;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Service {
    #[serde(rename = "MMS")]
    Mms,
    #[serde(rename = "GOOSE")]
    Goose,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum EntryQuality {
    Good,
    Questionable,
    Invalid,
}

/// One dataset point: a path-style key and a stringified value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DatasetEntry {
    pub key: String,
    pub value: String,
    pub quality: EntryQuality,
}

impl DatasetEntry {
    pub fn good(key: impl Into<String>, value: impl Into<String>) -> Self {
        Self {
            key: key.into(),
            value: value.into(),
            quality: EntryQuality::Good,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StationMessage {
    pub service: Service,
    pub direction: Direction,
    pub dataset: String,
    pub entries: Vec<DatasetEntry>,
}

pub fn encode_message(msg: &StationMessage) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(msg).map_err(|_| CodecError::StationBadPayload)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.extend_from_slice(MAGIC);
    #[allow(clippy::cast_possible_truncation)]
    out.extend_from_slice(&(body.len() as u32).to_be_bytes());
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_message(buf: &[u8]) -> Result<StationMessage, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::StationShort);
    }
    if &buf[..8] != MAGIC {
        return Err(CodecError::StationBadMagic);
    }
    let body_len = u32::from_be_bytes([buf[8], buf[9], buf[10], buf[11]]) as usize;
    let Some(body) = buf.get(HEADER_LEN..HEADER_LEN + body_len) else {
        return Err(CodecError::StationBadLength);
    };
    serde_json::from_slice(body).map_err(|_| CodecError::StationBadPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StationMessage {
        StationMessage {
            service: Service::Mms,
            direction: Direction::Uplink,
            dataset: String::from("CCU2/Report@1700000000000"),
            entries: alloc::vec![
                DatasetEntry::good("CCU2/Heartbeat", "1700000000000"),
                DatasetEntry {
                    key: String::from("CCU2/ErrorGroups"),
                    value: String::from("1"),
                    quality: EntryQuality::Questionable,
                },
            ],
        }
    }

    #[test]
    fn test_message_roundtrip() {
        let msg = sample();
        let buf = encode_message(&msg).unwrap();
        assert_eq!(&buf[..8], MAGIC);
        assert_eq!(decode_message(&buf).unwrap(), msg);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert_eq!(decode_message(&[0x49; 11]), Err(CodecError::StationShort));
    }

    #[test]
    fn test_bad_magic_rejected() {
        let mut buf = encode_message(&sample()).unwrap();
        buf[0] = b'X';
        assert_eq!(decode_message(&buf), Err(CodecError::StationBadMagic));
    }

    #[test]
    fn test_truncated_body_rejected() {
        let buf = encode_message(&sample()).unwrap();
        let cut = &buf[..buf.len() - 4];
        assert_eq!(decode_message(cut), Err(CodecError::StationBadLength));
    }

    #[test]
    fn test_garbled_body_rejected() {
        let mut buf = encode_message(&sample()).unwrap();
        let last = buf.len() - 1;
        buf[last] = 0x00;
        assert_eq!(decode_message(&buf), Err(CodecError::StationBadPayload));
    }

    #[test]
    fn test_service_and_quality_spelling() {
        let buf = encode_message(&sample()).unwrap();
        let text = core::str::from_utf8(&buf[12..]).unwrap();
        assert!(text.contains("\"MMS\""));
        assert!(text.contains("\"GOOD\""));
        assert!(text.contains("\"uplink\""));
    }
}
