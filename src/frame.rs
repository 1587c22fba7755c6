//! Command framing and response integrity checks.
//!
//! Every request is a 7-byte command `[opcode, subcode, arg0..arg4]` followed
//! by one checksum byte. Every response ends with the checksum of the bytes
//! before it. The checksum is the Dallas/Maxim CRC-8 (poly 0x31, init 0x00,
//! reflected in and out).

use crate::errors::ProtocolError;

/// Length of a command without its checksum.
pub const COMMAND_LEN: usize = 7;

/// Length of a command frame as written to the wire.
pub const FRAME_LEN: usize = COMMAND_LEN + 1;

/// Bit 0x20 of the first response byte: device not ready, resend.
pub const BUSY_BIT: u8 = 0x20;

/// Poly 0x31 bit-reversed, for the LSB-first loop.
const CRC8_MAXIM_REFLECTED_POLY: u8 = 0x8C;

pub type Command = [u8; COMMAND_LEN];

// Opcodes shared by more than one module
pub(crate) const CMD_STATUS: Command = [0x82, 0x01, 0x00, 0x00, 0x00, 0x00, 0x00];
pub(crate) const OP_READ_MEMORY: u8 = 0x8B;
pub(crate) const OP_SET_BAUD: u8 = 0x85;

/// Build a command from its opcode, subcode and 5 argument bytes.
pub fn command(opcode: u8, subcode: u8, payload: [u8; 5]) -> Command {
    [
        opcode, subcode, payload[0], payload[1], payload[2], payload[3], payload[4],
    ]
}

/// Dallas/Maxim CRC-8 over `bytes`.
pub fn checksum(bytes: &[u8]) -> u8 {
    let mut crc = 0u8;
    for &byte in bytes {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x01 != 0 {
                (crc >> 1) ^ CRC8_MAXIM_REFLECTED_POLY
            } else {
                crc >> 1
            };
        }
    }
    crc
}

/// Append the checksum to a command.
pub fn build_frame(command: &Command) -> [u8; FRAME_LEN] {
    let mut frame = [0u8; FRAME_LEN];
    frame[..COMMAND_LEN].copy_from_slice(command);
    frame[COMMAND_LEN] = checksum(command);
    frame
}

/// True iff `buf` is empty or its last byte is the checksum of the rest.
pub fn validate_response(buf: &[u8]) -> bool {
    check_response(buf).is_ok()
}

/// Like [`validate_response`] but reports the mismatching bytes.
pub fn check_response(buf: &[u8]) -> Result<(), ProtocolError> {
    let Some((&received, body)) = buf.split_last() else {
        return Ok(());
    };
    let expected = checksum(body);
    if expected == received {
        Ok(())
    } else {
        Err(ProtocolError::ChecksumMismatch { expected, received })
    }
}

/// Whether the device asked for the command to be resent.
pub fn is_busy(response: &[u8]) -> bool {
    response.first().is_some_and(|b| b & BUSY_BIT != 0)
}

/// Little-endian u16 at `buf[lo]`, `buf[lo + 1]`.
pub(crate) fn le_u16(buf: &[u8], lo: usize) -> u16 {
    u16::from_le_bytes([buf[lo], buf[lo + 1]])
}

/// Wrap a response buffer with its checksum, the way the device sends it.
#[cfg(test)]
pub(crate) fn with_checksum(mut body: Vec<u8>) -> Vec<u8> {
    let crc = checksum(&body);
    body.push(crc);
    body
}
