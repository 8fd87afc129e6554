//! Register-poll protocol codec (Modbus TCP, function 0x03 only).
//!
//! Frame layout: 7-byte MBAP header (transaction id, protocol id 0, length,
//! unit id) followed by the PDU. The length field counts the unit id plus the
//! PDU bytes. Only "read holding registers" traffic exists on these links;
//! anything else decodes to an unsupported-function error.

use alloc::vec::Vec;
use serde::{Deserialize, Serialize};

use super::CodecError;

pub const FC_READ_HOLDING_REGISTERS: u8 = 0x03;
pub const MBAP_LEN: usize = 7;
const MIN_FRAME_LEN: usize = 8;

/// Read request addressed to one unit's register bank.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ReadRequest {
    pub transaction_id: u16,
    pub unit_id: u8,
    pub start: u16,
    pub quantity: u16,
}

/// Reply to a read request: register values or an exception.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub enum Response {
    Values {
        transaction_id: u16,
        unit_id: u8,
        values: Vec<u16>,
    },
    Exception {
        transaction_id: u16,
        unit_id: u8,
        function_code: u8,
        exception_code: u8,
    },
}

fn write_mbap(out: &mut Vec<u8>, transaction_id: u16, unit_id: u8, pdu_len: usize) {
    out.extend_from_slice(&transaction_id.to_be_bytes());
    out.extend_from_slice(&0u16.to_be_bytes());
    #[allow(clippy::cast_possible_truncation)]
    let length = (pdu_len + 1) as u16;
    out.extend_from_slice(&length.to_be_bytes());
    out.push(unit_id);
}

fn read_u16(buf: &[u8], at: usize) -> u16 {
    u16::from_be_bytes([buf[at], buf[at + 1]])
}

/// Validates the MBAP header and returns the PDU slice.
fn split_frame(buf: &[u8]) -> Result<(u16, u8, &[u8]), CodecError> {
    if buf.len() < MIN_FRAME_LEN {
        return Err(CodecError::ShortFrame);
    }
    let transaction_id = read_u16(buf, 0);
    if read_u16(buf, 2) != 0 {
        return Err(CodecError::BadProtocolId);
    }
    let length = read_u16(buf, 4) as usize;
    let pdu = &buf[MBAP_LEN..];
    if length != pdu.len() + 1 {
        return Err(CodecError::LengthMismatch);
    }
    Ok((transaction_id, buf[6], pdu))
}

pub fn encode_read_request(req: &ReadRequest) -> Vec<u8> {
    let mut out = Vec::with_capacity(MBAP_LEN + 5);
    write_mbap(&mut out, req.transaction_id, req.unit_id, 5);
    out.push(FC_READ_HOLDING_REGISTERS);
    out.extend_from_slice(&req.start.to_be_bytes());
    out.extend_from_slice(&req.quantity.to_be_bytes());
    out
}

pub fn decode_read_request(buf: &[u8]) -> Result<ReadRequest, CodecError> {
    let (transaction_id, unit_id, pdu) = split_frame(buf)?;
    if pdu.is_empty() {
        return Err(CodecError::BadPduLength);
    }
    if pdu[0] != FC_READ_HOLDING_REGISTERS {
        return Err(CodecError::UnsupportedFunction(pdu[0]));
    }
    if pdu.len() != 5 {
        return Err(CodecError::BadPduLength);
    }
    Ok(ReadRequest {
        transaction_id,
        unit_id,
        start: read_u16(pdu, 1),
        quantity: read_u16(pdu, 3),
    })
}

pub fn encode_response(res: &Response) -> Vec<u8> {
    match res {
        Response::Values {
            transaction_id,
            unit_id,
            values,
        } => {
            let byte_count = values.len() * 2;
            let mut out = Vec::with_capacity(MBAP_LEN + 2 + byte_count);
            write_mbap(&mut out, *transaction_id, *unit_id, 2 + byte_count);
            out.push(FC_READ_HOLDING_REGISTERS);
            #[allow(clippy::cast_possible_truncation)]
            out.push(byte_count as u8);
            for value in values {
                out.extend_from_slice(&value.to_be_bytes());
            }
            out
        }
        Response::Exception {
            transaction_id,
            unit_id,
            function_code,
            exception_code,
        } => {
            let mut out = Vec::with_capacity(MBAP_LEN + 2);
            write_mbap(&mut out, *transaction_id, *unit_id, 2);
            out.push(function_code | 0x80);
            out.push(*exception_code);
            out
        }
    }
}

pub fn decode_response(buf: &[u8]) -> Result<Response, CodecError> {
    let (transaction_id, unit_id, pdu) = split_frame(buf)?;
    if pdu.is_empty() {
        return Err(CodecError::BadPduLength);
    }
    let function_code = pdu[0];
    if function_code & 0x80 != 0 {
        if pdu.len() != 2 {
            return Err(CodecError::BadPduLength);
        }
        return Ok(Response::Exception {
            transaction_id,
            unit_id,
            function_code: function_code & 0x7F,
            exception_code: pdu[1],
        });
    }
    if function_code != FC_READ_HOLDING_REGISTERS {
        return Err(CodecError::UnsupportedFunction(function_code));
    }
    if pdu.len() < 2 {
        return Err(CodecError::BadPduLength);
    }
    let byte_count = pdu[1] as usize;
    if byte_count % 2 != 0 || pdu.len() != 2 + byte_count {
        return Err(CodecError::BadByteCount);
    }
    let mut values = Vec::with_capacity(byte_count / 2);
    for i in 0..byte_count / 2 {
        values.push(read_u16(pdu, 2 + i * 2));
    }
    Ok(Response::Values {
        transaction_id,
        unit_id,
        values,
    })
}

/// Maps a signed engineering value into a 16-bit register using
/// two's-complement wrapping. Values outside i16 range wrap.
pub fn register_from_signed(value: i32) -> u16 {
    (value & 0xFFFF) as u16
}

/// Inverse of [`register_from_signed`]: sign-extends the high bit.
pub fn register_to_signed(word: u16) -> i32 {
    if word & 0x8000 != 0 {
        i32::from(word) - 0x1_0000
    } else {
        i32::from(word)
    }
}
