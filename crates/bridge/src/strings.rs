//! USB string descriptors
//!
//! Raw `GET_DESCRIPTOR(STRING)` passthrough plus the ASCII convenience read
//! the daemon uses for serial numbers and product names.

use crate::host::HostConnection;
use protocol::BridgeError;
use std::time::Duration;
use tracing::debug;

/// Standard, device-to-host, device recipient
const REQUEST_TYPE_STANDARD_IN: u8 = 0x80;
/// bRequest for GET_DESCRIPTOR
pub const REQUEST_GET_DESCRIPTOR: u8 = 0x06;
/// Descriptor type for strings
pub const DESCRIPTOR_TYPE_STRING: u8 = 0x03;
/// Largest descriptor a device can return (bLength is one byte)
const MAX_DESCRIPTOR_LENGTH: usize = 255;

/// Read string descriptor `index` in `language_id`, at most `length` bytes
///
/// Returns the bytes the device actually sent, which may be fewer than
/// requested, or None if the control transfer failed.
pub fn get_string_descriptor(
    connection: &dyn HostConnection,
    index: u8,
    language_id: u16,
    length: usize,
    timeout: Duration,
) -> Option<Vec<u8>> {
    let mut buffer = vec![0u8; length];
    let value = (u16::from(DESCRIPTOR_TYPE_STRING) << 8) | u16::from(index);

    let received = connection.control_transfer_in(
        REQUEST_TYPE_STANDARD_IN,
        REQUEST_GET_DESCRIPTOR,
        value,
        language_id,
        &mut buffer,
        timeout,
    )?;

    buffer.truncate(received.min(length));
    Some(buffer)
}

/// Read string descriptor `index` as ASCII in the device's first language
///
/// Characters outside ASCII come back as `?`. Index 0 is the language table
/// and is rejected.
pub fn read_string_ascii(
    connection: &dyn HostConnection,
    index: u8,
    timeout: Duration,
) -> protocol::Result<String> {
    if index == 0 {
        return Err(BridgeError::StringDescriptor {
            index,
            reason: "index 0 is the language table".to_string(),
        });
    }

    let languages = get_string_descriptor(connection, 0, 0, MAX_DESCRIPTOR_LENGTH, timeout)
        .ok_or_else(|| BridgeError::StringDescriptor {
            index,
            reason: "language table read failed".to_string(),
        })?;

    if languages.len() < 4 {
        return Err(BridgeError::StringDescriptor {
            index,
            reason: format!("language table too short ({} bytes)", languages.len()),
        });
    }

    let language_id = u16::from_le_bytes([languages[2], languages[3]]);
    debug!("Reading string {} in language {:#06x}", index, language_id);

    let raw = get_string_descriptor(connection, index, language_id, MAX_DESCRIPTOR_LENGTH, timeout)
        .ok_or_else(|| BridgeError::StringDescriptor {
            index,
            reason: "control transfer failed".to_string(),
        })?;

    decode_ascii(&raw).map_err(|reason| BridgeError::StringDescriptor { index, reason })
}

/// Decode a raw UTF-16LE string descriptor, mapping non-ASCII units to `?`
pub fn decode_ascii(raw: &[u8]) -> Result<String, String> {
    if raw.len() < 2 {
        return Err(format!("descriptor too short ({} bytes)", raw.len()));
    }

    if raw[1] != DESCRIPTOR_TYPE_STRING {
        return Err(format!("not a string descriptor (type {:#04x})", raw[1]));
    }

    let declared = usize::from(raw[0]);
    if declared > raw.len() {
        return Err(format!(
            "descriptor declares {} bytes but only {} arrived",
            declared,
            raw.len()
        ));
    }

    let text = raw[2..declared.max(2)]
        .chunks_exact(2)
        .map(|unit| {
            if unit[1] == 0 && unit[0].is_ascii() {
                char::from(unit[0])
            } else {
                '?'
            }
        })
        .collect();

    Ok(text)
}
