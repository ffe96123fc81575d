//! # MQTT Serialization Utilities
//!
//! Helpers for reading and writing the MQTT wire primitives used by the
//! packet codec: variable-byte integers, length-prefixed UTF-8 strings and
//! length-prefixed binary fields.

use crate::error::{ErrorPlaceHolder, MqttError, ProtocolError};

/// Reads a variable-byte integer from the buffer, advancing the cursor.
///
/// Used for the remaining-length field of every fixed header.
pub fn read_variable_byte_integer(
    cursor: &mut usize,
    buf: &[u8],
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let mut multiplier = 1;
    let mut value = 0;
    let mut i = 0;
    loop {
        let encoded_byte = buf
            .get(*cursor + i)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?;
        value += (encoded_byte & 127) as usize * multiplier;
        if (encoded_byte & 128) == 0 {
            break;
        }
        multiplier *= 128;
        i += 1;
        if i >= 4 {
            return Err(MqttError::Protocol(ProtocolError::MalformedPacket));
        }
    }
    *cursor += i + 1;
    Ok(value)
}

/// Writes a variable-byte integer at the start of `buf`, returning the byte count.
pub fn write_variable_byte_integer_len(
    buf: &mut [u8],
    mut val: usize,
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let mut i = 0;
    loop {
        let mut encoded_byte = (val % 128) as u8;
        val /= 128;
        if val > 0 {
            encoded_byte |= 128;
        }
        *buf.get_mut(i).ok_or(MqttError::BufferTooSmall)? = encoded_byte;
        i += 1;
        if val == 0 {
            break;
        }
    }
    Ok(i)
}

/// Mutable view of the buffer from `cursor` on, for encoders that write
/// field by field without panicking on an undersized buffer.
pub fn tail_mut(
    buf: &mut [u8],
    cursor: usize,
) -> Result<&mut [u8], MqttError<ErrorPlaceHolder>> {
    buf.get_mut(cursor..).ok_or(MqttError::BufferTooSmall)
}

/// Reads a UTF-8 encoded string (prefixed with a 2-byte length) from the buffer.
pub fn read_utf8_string<'a>(
    cursor: &mut usize,
    buf: &'a [u8],
) -> Result<&'a str, MqttError<ErrorPlaceHolder>> {
    let len_bytes: [u8; 2] = buf
        .get(*cursor..*cursor + 2)
        .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?
        .try_into()
        .map_err(|_| MqttError::Protocol(ProtocolError::MalformedPacket))?;
    let len = u16::from_be_bytes(len_bytes) as usize;
    *cursor += 2;
    let s = core::str::from_utf8(
        buf.get(*cursor..*cursor + len)
            .ok_or(MqttError::Protocol(ProtocolError::MalformedPacket))?,
    )
    .map_err(|_| MqttError::Protocol(ProtocolError::InvalidUtf8String))?;
    *cursor += len;
    Ok(s)
}

/// Writes a UTF-8 encoded string (prefixed with a 2-byte length) to the buffer.
pub fn write_utf8_string(buf: &mut [u8], s: &str) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    write_binary_data(buf, s.as_bytes())
}

/// Writes a length-prefixed binary field (2-byte length) to the buffer.
///
/// The will message in CONNECT uses the same framing as a string but
/// without the UTF-8 requirement.
pub fn write_binary_data(
    buf: &mut [u8],
    data: &[u8],
) -> Result<usize, MqttError<ErrorPlaceHolder>> {
    let len = data.len();
    if len > u16::MAX as usize {
        return Err(MqttError::Protocol(ProtocolError::PayloadTooLarge));
    }
    let len_bytes = (len as u16).to_be_bytes();

    let required_space = 2 + len;
    let slice = buf
        .get_mut(0..required_space)
        .ok_or(MqttError::BufferTooSmall)?;

    slice[0..2].copy_from_slice(&len_bytes);
    slice[2..].copy_from_slice(data);
    Ok(required_space)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn variable_byte_integer_round_trips_boundary_values() {
        for val in [0usize, 127, 128, 16_383, 16_384, 268_435_455] {
            let mut buf = [0u8; 4];
            let written = write_variable_byte_integer_len(&mut buf, val).unwrap();
            let mut cursor = 0;
            let read = read_variable_byte_integer(&mut cursor, &buf).unwrap();
            assert_eq!(read, val);
            assert_eq!(cursor, written);
        }
    }

    #[test]
    fn truncated_string_is_rejected_without_panicking() {
        // Length prefix claims 10 bytes but only 3 are present.
        let buf = [0x00, 0x0A, b'a', b'b', b'c'];
        let mut cursor = 0;
        assert!(read_utf8_string(&mut cursor, &buf).is_err());
    }

    #[test]
    fn utf8_string_framing_matches_prefix() {
        let mut buf = [0u8; 16];
        let n = write_utf8_string(&mut buf, "van").unwrap();
        assert_eq!(n, 5);
        assert_eq!(&buf[..5], &[0x00, 0x03, b'v', b'a', b'n']);
    }
}
