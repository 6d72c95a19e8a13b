//! Variable Byte Integer encoding for MQTT.
//!
//! Remaining-length and property-length fields use a 7-bits-per-byte
//! encoding with a continuation bit, at most 4 bytes:
//! - 0..=127: 1 byte
//! - 128..=16_383: 2 bytes
//! - 16_384..=2_097_151: 3 bytes
//! - 2_097_152..=268_435_455: 4 bytes

use crate::error::{ProtocolError, Result};

/// Largest value representable in 4 encoded bytes (28 bits).
pub const MAX_VALUE: u32 = 268_435_455;

/// Decode a variable byte integer from the front of `buf`.
///
/// Returns `Ok(Some((value, bytes_consumed)))` on success, `Ok(None)` if the
/// buffer ends before the terminating byte, or an error if a fifth byte
/// would be required.
pub fn decode(buf: &[u8]) -> Result<Option<(u32, usize)>> {
    let mut value = 0u32;
    for (i, &byte) in buf.iter().enumerate().take(4) {
        value |= ((byte & 0x7F) as u32) << (7 * i);
        if byte & 0x80 == 0 {
            return Ok(Some((value, i + 1)));
        }
    }
    if buf.len() >= 4 {
        return Err(ProtocolError::InvalidRemainingLength);
    }
    Ok(None)
}

/// Encode `value` as a variable byte integer, appending to `buf`.
///
/// Returns the number of bytes written. `value` must not exceed
/// [`MAX_VALUE`].
pub fn encode(mut value: u32, buf: &mut Vec<u8>) -> usize {
    debug_assert!(value <= MAX_VALUE);
    let start = buf.len();
    loop {
        let mut byte = (value & 0x7F) as u8;
        value >>= 7;
        if value > 0 {
            byte |= 0x80;
        }
        buf.push(byte);
        if value == 0 {
            break;
        }
    }
    buf.len() - start
}

/// Number of bytes [`encode`] will write for `value`.
pub fn encoded_len(value: u32) -> usize {
    match value {
        0..=127 => 1,
        128..=16_383 => 2,
        16_384..=2_097_151 => 3,
        _ => 4,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decode_boundaries() {
        assert_eq!(decode(&[0x00]).unwrap(), Some((0, 1)));
        assert_eq!(decode(&[0x7F]).unwrap(), Some((127, 1)));
        assert_eq!(decode(&[0x80, 0x01]).unwrap(), Some((128, 2)));
        assert_eq!(decode(&[0xFF, 0x7F]).unwrap(), Some((16_383, 2)));
        assert_eq!(decode(&[0x80, 0x80, 0x01]).unwrap(), Some((16_384, 3)));
        assert_eq!(decode(&[0xFF, 0xFF, 0x7F]).unwrap(), Some((2_097_151, 3)));
        assert_eq!(
            decode(&[0x80, 0x80, 0x80, 0x01]).unwrap(),
            Some((2_097_152, 4))
        );
        assert_eq!(
            decode(&[0xFF, 0xFF, 0xFF, 0x7F]).unwrap(),
            Some((MAX_VALUE, 4))
        );
    }

    #[test]
    fn decode_incomplete() {
        assert_eq!(decode(&[]).unwrap(), None);
        assert_eq!(decode(&[0x80]).unwrap(), None);
        assert_eq!(decode(&[0x80, 0x80, 0x80]).unwrap(), None);
    }

    #[test]
    fn decode_overlong() {
        assert!(decode(&[0x80, 0x80, 0x80, 0x80]).is_err());
        assert!(decode(&[0xFF, 0xFF, 0xFF, 0xFF, 0x7F]).is_err());
    }

    #[test]
    fn encode_matches_decode() {
        for value in [0, 1, 127, 128, 300, 16_383, 16_384, 2_097_151, 2_097_152, MAX_VALUE] {
            let mut buf = Vec::new();
            let written = encode(value, &mut buf);
            assert_eq!(written, encoded_len(value));
            let (decoded, consumed) = decode(&buf).unwrap().unwrap();
            assert_eq!(decoded, value);
            assert_eq!(consumed, written);
        }
    }

    #[test]
    fn encode_known_bytes() {
        let mut buf = Vec::new();
        encode(300, &mut buf);
        assert_eq!(&buf, &[0xAC, 0x02]);
    }
}
