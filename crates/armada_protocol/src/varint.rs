//! LEB128-style variable-length integer encoding.
//!
//! Used for the header/body length prefixes of wire frames and for all
//! length prefixes inside structured buffers. Little-endian base-128 with
//! a continuation bit, at most 10 bytes for a full `u64`.

use crate::error::ProtocolError;
use bytes::BytesMut;

/// Maximum encoded width of a `u64` varint.
pub const MAX_VAR_LEN: usize = 10;

/// Appends `value` to `out` in variable-length encoding.
pub fn write_var_u64(out: &mut BytesMut, mut value: u64) {
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value != 0 {
            byte |= 0x80;
        }
        out.extend_from_slice(&[byte]);
        if value == 0 {
            break;
        }
    }
}

/// Decodes a varint from the front of `input` without consuming it.
///
/// Returns `Ok(None)` when `input` ends mid-varint so a streaming caller
/// can wait for more bytes. Returns the decoded value and its encoded
/// width on success.
pub fn peek_var_u64(input: &[u8]) -> Result<Option<(u64, usize)>, ProtocolError> {
    let mut value: u64 = 0;
    for i in 0..MAX_VAR_LEN {
        let Some(&byte) = input.get(i) else {
            return Ok(None);
        };
        if i == MAX_VAR_LEN - 1 && (byte & 0xFE) != 0 {
            // The tenth byte may only carry bit 63.
            return Err(ProtocolError::VarIntOverflow);
        }
        value |= u64::from(byte & 0x7F) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    Err(ProtocolError::VarIntOverflow)
}

/// Encoded width of `value` in bytes.
pub fn var_len(value: u64) -> usize {
    let bits = (64 - value.leading_zeros()) as usize;
    core::cmp::max(1, bits.div_ceil(7))
}
