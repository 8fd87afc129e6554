//! Telecontrol codec for the dispatch-centre uplink (IEC 60870-5-104
//! flavoured). Only information (I) frames exist on this link.
//!
//! Layout: start byte 0x68, a saturating length byte covering control field
//! plus payload, four zero control-field bytes, then a JSON information
//! object.

use alloc::string::String;
use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use super::{CodecError, Direction};

pub const START_BYTE: u8 = 0x68;
const HEADER_LEN: usize = 6;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum FrameKind {
    #[serde(rename = "I")]
    Information,
}

/// Cyclic measurand or command carried as an information object.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct InfoFrame {
    #[serde(rename = "type")]
    pub kind: FrameKind,
    pub direction: Direction,
    pub ioa: u32,
    #[serde(rename = "asduType")]
    pub asdu_type: String,
    pub cot: String,
    pub value: String,
}

impl InfoFrame {
    /// Cyclic short-float measurand uplink for one information object.
    pub fn cyclic_measurand(ioa: u32, value: impl Into<String>) -> Self {
        Self {
            kind: FrameKind::Information,
            direction: Direction::Uplink,
            ioa,
            asdu_type: String::from("M_ME_NC_1"),
            cot: String::from("CYCLIC"),
            value: value.into(),
        }
    }
}

pub fn encode_frame(frame: &InfoFrame) -> Result<Vec<u8>, CodecError> {
    let body = serde_json::to_vec(frame).map_err(|_| CodecError::TelecontrolBadPayload)?;
    let mut out = Vec::with_capacity(HEADER_LEN + body.len());
    out.push(START_BYTE);
    #[allow(clippy::cast_possible_truncation)]
    out.push(core::cmp::min(255, body.len() + 4) as u8);
    out.extend_from_slice(&[0, 0, 0, 0]);
    out.extend_from_slice(&body);
    Ok(out)
}

pub fn decode_frame(buf: &[u8]) -> Result<InfoFrame, CodecError> {
    if buf.len() < HEADER_LEN {
        return Err(CodecError::TelecontrolShort);
    }
    if buf[0] != START_BYTE {
        return Err(CodecError::TelecontrolBadStart);
    }
    serde_json::from_slice(&buf[HEADER_LEN..]).map_err(|_| CodecError::TelecontrolBadPayload)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_frame_roundtrip() {
        let frame = InfoFrame::cyclic_measurand(1001, "58.3");
        let buf = encode_frame(&frame).unwrap();
        assert_eq!(buf[0], START_BYTE);
        assert_eq!(&buf[2..6], &[0, 0, 0, 0]);
        assert_eq!(decode_frame(&buf).unwrap(), frame);
    }

    #[test]
    fn test_length_byte_saturates() {
        let frame = InfoFrame::cyclic_measurand(1001, "x".repeat(400));
        let buf = encode_frame(&frame).unwrap();
        assert_eq!(buf[1], 255);
    }

    #[test]
    fn test_short_frame_rejected() {
        assert_eq!(decode_frame(&[0x68, 0x04, 0, 0, 0]), Err(CodecError::TelecontrolShort));
    }

    #[test]
    fn test_bad_start_rejected() {
        let frame = InfoFrame::cyclic_measurand(1001, "58.3");
        let mut buf = encode_frame(&frame).unwrap();
        buf[0] = 0x69;
        assert_eq!(decode_frame(&buf), Err(CodecError::TelecontrolBadStart));
    }

    #[test]
    fn test_non_information_frame_rejected() {
        let frame = InfoFrame::cyclic_measurand(1001, "58.3");
        let mut buf = encode_frame(&frame).unwrap();
        // Corrupt the type tag inside the JSON body.
        let body = String::from_utf8(buf.split_off(HEADER_LEN)).unwrap();
        buf.extend_from_slice(body.replace("\"I\"", "\"S\"").as_bytes());
        assert_eq!(decode_frame(&buf), Err(CodecError::TelecontrolBadPayload));
    }
}
