//! Capability stripping and field extraction for the two handshake
//! packets the relay must actually look inside: the server greeting and
//! the client's HandshakeResponse41. Everything else passes through
//! opaque.

use crate::error::ProxyError;
use crate::protocol::mysql::constants::{stripped_capabilities, HANDSHAKE_RESPONSE_MIN_LEN};
use crate::protocol::mysql::response::read_length_encoded_number;

use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::CapabilityFlags;
use winnow::binary::{le_u32, le_u8};
use winnow::prelude::*;
use winnow::token::{literal, take, take_until};

/// What the relay learns from the client's handshake response; the rest of
/// the packet (auth material, plugin names, connect attributes) is never
/// interpreted.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HandshakeFields {
    pub capabilities: CapabilityFlags,
    pub username: Vec<u8>,
    pub database: Option<Vec<u8>>,
}

fn truncated(_: winnow::error::ErrMode<winnow::error::InputError<&[u8]>>) -> ProxyError {
    ProxyError::MalformedPacket("truncated handshake response".to_string())
}

/// Clears the capability bits the proxy cannot honor from a protocol-10
/// server greeting. The flags live in two split 2-byte fields on either
/// side of the charset/status block.
pub fn strip_server_greeting(payload: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if payload.first() != Some(&0x0a) {
        return Err(ProxyError::MalformedPacket(format!(
            "unsupported greeting protocol version {:?}",
            payload.first()
        )));
    }
    let version_end = payload[1..]
        .iter()
        .position(|b| *b == 0)
        .ok_or_else(|| ProxyError::MalformedPacket("unterminated server version".to_string()))?;
    // version + NUL, connection id (4), auth-plugin-data-part-1 (8), filler
    let flags_at = 1 + version_end + 1 + 4 + 8 + 1;
    // lower flags (2), charset (1), status (2), upper flags (2)
    if payload.len() < flags_at + 7 {
        return Err(ProxyError::MalformedPacket(
            "server greeting too short".to_string(),
        ));
    }
    let mut out = payload.to_vec();
    let lower = LittleEndian::read_u16(&out[flags_at..flags_at + 2]) as u32;
    let upper = LittleEndian::read_u16(&out[flags_at + 5..flags_at + 7]) as u32;
    let caps = (upper << 16 | lower) & !stripped_capabilities().bits();
    LittleEndian::write_u16(&mut out[flags_at..flags_at + 2], caps as u16);
    LittleEndian::write_u16(&mut out[flags_at + 5..flags_at + 7], (caps >> 16) as u16);
    Ok(out)
}

/// Clears the same bits from the client's HandshakeResponse41, where the
/// flags sit as one little-endian u32 at offset 0.
pub fn strip_client_response(payload: &[u8]) -> Result<Vec<u8>, ProxyError> {
    if payload.len() < HANDSHAKE_RESPONSE_MIN_LEN {
        return Err(ProxyError::MalformedPacket(format!(
            "handshake response too short: {}",
            payload.len()
        )));
    }
    let mut out = payload.to_vec();
    let caps = LittleEndian::read_u32(&out[0..4]) & !stripped_capabilities().bits();
    LittleEndian::write_u32(&mut out[0..4], caps);
    Ok(out)
}

/// Reads capability flags, username, and (when CLIENT_CONNECT_WITH_DB is
/// set) the initial database out of a HandshakeResponse41. The auth
/// response field is skipped according to whichever of the three length
/// encodings the capability flags select; every length and terminator is
/// bounds-checked.
pub fn client_handshake_fields(payload: &[u8]) -> Result<HandshakeFields, ProxyError> {
    if payload.len() < HANDSHAKE_RESPONSE_MIN_LEN {
        return Err(ProxyError::MalformedPacket(format!(
            "handshake response too short: {}",
            payload.len()
        )));
    }
    let i = payload;
    let (i, caps_raw) = le_u32.parse_peek(i).map_err(truncated)?;
    let capabilities = CapabilityFlags::from_bits_truncate(caps_raw);
    // max packet length (4), charset (1), filler (23)
    let (i, _) = take(28u8).parse_peek(i).map_err(truncated)?;
    let (i, username) = take_until(0.., "\0").parse_peek(i).map_err(truncated)?;
    let (i, _) = literal(b"\0").parse_peek(i).map_err(truncated)?;

    let i = if capabilities.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA) {
        match i.first().copied() {
            Some(0xfe) | Some(0xff) => {
                return Err(ProxyError::MalformedPacket(
                    "invalid auth-response length encoding".to_string(),
                ))
            }
            _ => {}
        }
        let (i, len) = read_length_encoded_number(i).map_err(truncated)?;
        let (i, _) = take(len).parse_peek(i).map_err(truncated)?;
        i
    } else if capabilities.contains(CapabilityFlags::CLIENT_SECURE_CONNECTION) {
        let (i, len) = le_u8.parse_peek(i).map_err(truncated)?;
        let (i, _) = take(len).parse_peek(i).map_err(truncated)?;
        i
    } else {
        let (i, _) = take_until(0.., "\0").parse_peek(i).map_err(truncated)?;
        let (i, _) = literal(b"\0").parse_peek(i).map_err(truncated)?;
        i
    };

    let database = if capabilities.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB) && !i.is_empty()
    {
        let (i, db) = take_until(0.., "\0").parse_peek(i).map_err(truncated)?;
        let (_i, _) = literal(b"\0").parse_peek(i).map_err(truncated)?;
        Some(db.to_vec())
    } else {
        None
    };

    Ok(HandshakeFields {
        capabilities,
        username: username.to_vec(),
        database,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample_response(caps: CapabilityFlags) -> Vec<u8> {
        let mut payload = Vec::new();
        let mut head = [0u8; 4];
        LittleEndian::write_u32(&mut head, caps.bits());
        payload.extend_from_slice(&head);
        payload.extend_from_slice(&16_777_216u32.to_le_bytes());
        payload.push(0x21);
        payload.extend_from_slice(&[0u8; 23]);
        payload.extend_from_slice(b"testuser\0");
        payload.push(20);
        payload.extend_from_slice(&[0xaa; 20]);
        payload.extend_from_slice(b"appdb\0");
        payload
    }

    fn base_caps() -> CapabilityFlags {
        CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB
    }

    #[test]
    fn extracts_user_and_database() {
        let payload = sample_response(base_caps());
        let fields = client_handshake_fields(&payload).unwrap();
        assert_eq!(fields.username, b"testuser");
        assert_eq!(fields.database.as_deref(), Some(&b"appdb"[..]));
        assert!(fields
            .capabilities
            .contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
    }

    #[test]
    fn extracts_from_real_client_packet() {
        // mysql client HandshakeResponse41: user "default", db "default",
        // lenenc auth data, trailing auth plugin name (ignored here).
        let payload: &[u8] = &[
            0x8d, 0xa6, 0xff, 0x09, 0x00, 0x00, 0x00, 0x01, 0x21, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00,
            0x00, 0x00, 0x00, 0x00, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x14, 0xf7,
            0xd1, 0x6c, 0xe9, 0x0d, 0x2f, 0x34, 0xb0, 0x2f, 0xd8, 0x1d, 0x18, 0xc7, 0xa4, 0xe8,
            0x98, 0x97, 0x67, 0xeb, 0xad, 0x64, 0x65, 0x66, 0x61, 0x75, 0x6c, 0x74, 0x00, 0x6d,
            0x79, 0x73, 0x71, 0x6c, 0x5f, 0x6e, 0x61, 0x74, 0x69, 0x76, 0x65, 0x5f, 0x70, 0x61,
            0x73, 0x73, 0x77, 0x6f, 0x72, 0x64, 0x00,
        ];
        let fields = client_handshake_fields(payload).unwrap();
        assert_eq!(fields.username, b"default");
        assert_eq!(fields.database.as_deref(), Some(&b"default"[..]));
    }

    #[test]
    fn lenenc_auth_rejects_8_byte_form() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH_LENENC_CLIENT_DATA;
        let mut payload = Vec::new();
        let mut head = [0u8; 4];
        LittleEndian::write_u32(&mut head, caps.bits());
        payload.extend_from_slice(&head);
        payload.extend_from_slice(&[0u8; 28]);
        payload.extend_from_slice(b"u\0");
        payload.push(0xfe);
        payload.extend_from_slice(&[0u8; 8]);
        let err = client_handshake_fields(&payload).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPacket(_)));
    }

    #[test]
    fn short_response_is_malformed() {
        let err = client_handshake_fields(&[0x8d, 0xa6]).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPacket(_)));
    }

    #[test]
    fn overrun_auth_length_is_malformed() {
        let mut payload = sample_response(base_caps());
        // claim more auth bytes than the packet holds
        let auth_len_at = 4 + 28 + b"testuser\0".len();
        payload[auth_len_at] = 0xf0;
        let err = client_handshake_fields(&payload).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPacket(_)));
    }

    #[test]
    fn strips_client_capability_bits() {
        let caps = base_caps()
            | CapabilityFlags::CLIENT_SSL
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;
        let payload = sample_response(caps);
        let stripped = strip_client_response(&payload).unwrap();
        let after = CapabilityFlags::from_bits_truncate(LittleEndian::read_u32(&stripped[0..4]));
        assert!(!after.contains(CapabilityFlags::CLIENT_SSL));
        assert!(!after.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert!(!after.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES));
        assert!(after.contains(CapabilityFlags::CLIENT_CONNECT_WITH_DB));
        // only the flag bytes change
        assert_eq!(&stripped[4..], &payload[4..]);
    }

    fn sample_greeting(caps: CapabilityFlags) -> Vec<u8> {
        let mut payload = vec![0x0a];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&42u32.to_le_bytes());
        payload.extend_from_slice(&[0x61; 8]);
        payload.push(0x00);
        let bits = caps.bits();
        payload.extend_from_slice(&(bits as u16).to_le_bytes());
        payload.push(0xff);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&((bits >> 16) as u16).to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(&[0x62; 12]);
        payload.push(0x00);
        payload.extend_from_slice(b"caching_sha2_password\0");
        payload
    }

    #[test]
    fn strips_greeting_capability_bits() {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_PLUGIN_AUTH
            | CapabilityFlags::CLIENT_SSL
            | CapabilityFlags::CLIENT_DEPRECATE_EOF
            | CapabilityFlags::CLIENT_QUERY_ATTRIBUTES;
        let payload = sample_greeting(caps);
        let stripped = strip_server_greeting(&payload).unwrap();
        assert_eq!(stripped.len(), payload.len());

        let flags_at = 1 + b"8.0.36\0".len() + 4 + 8 + 1;
        let lower = LittleEndian::read_u16(&stripped[flags_at..flags_at + 2]) as u32;
        let upper = LittleEndian::read_u16(&stripped[flags_at + 5..flags_at + 7]) as u32;
        let after = CapabilityFlags::from_bits_truncate(upper << 16 | lower);
        assert!(!after.contains(CapabilityFlags::CLIENT_SSL));
        assert!(!after.contains(CapabilityFlags::CLIENT_DEPRECATE_EOF));
        assert!(!after.contains(CapabilityFlags::CLIENT_QUERY_ATTRIBUTES));
        assert!(after.contains(CapabilityFlags::CLIENT_PLUGIN_AUTH));
    }

    #[test]
    fn greeting_with_wrong_protocol_version_is_malformed() {
        let err = strip_server_greeting(&[0x09, 0x00]).unwrap_err();
        assert!(matches!(err, ProxyError::MalformedPacket(_)));
    }
}
