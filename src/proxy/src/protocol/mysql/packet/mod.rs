pub mod packet_reader;
pub mod packet_writer;

use crate::error::ProxyError;
use crate::protocol::mysql::constants::{ERR_PACKET_OVERHEAD, MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};
use crate::protocol::mysql::error_codes::ErrorKind;

use byteorder::{ByteOrder, LittleEndian};
use std::ops::Deref;

/// First-payload-byte classification of a wire packet. Context-free apart
/// from the 0xFE size disambiguation; it never tries to tell an OK packet
/// from a HandshakeResponse (both start 0x00), that is the caller's job
/// by sequence position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PacketType {
    Ok,
    Err,
    Eof,
    AuthSwitchRequest,
    AuthMoreData,
    LocalInfile,
    Unknown,
}

impl PacketType {
    pub fn classify(payload: &[u8]) -> PacketType {
        match payload.first().copied() {
            Some(0x00) => PacketType::Ok,
            Some(0x01) => PacketType::AuthMoreData,
            Some(0xfb) => PacketType::LocalInfile,
            Some(0xfe) if payload.len() < 9 => PacketType::Eof,
            Some(0xfe) => PacketType::AuthSwitchRequest,
            Some(0xff) => PacketType::Err,
            _ => PacketType::Unknown,
        }
    }
}

/// One MySQL wire packet: 3-byte little-endian payload length, 1-byte
/// sequence id, payload. The sequence id is preserved verbatim so relayed
/// and synthesized packets keep the peer's framing.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MysqlPacket {
    pub seq: u8,
    pub payload: Vec<u8>,
    pub packet_type: PacketType,
}

impl MysqlPacket {
    pub fn new(seq: u8, payload: Vec<u8>) -> Self {
        let packet_type = PacketType::classify(&payload);
        MysqlPacket {
            seq,
            payload,
            packet_type,
        }
    }

    /// Parses one packet off the front of `input`, returning it together
    /// with the number of bytes consumed.
    pub fn parse(input: &[u8]) -> Result<(MysqlPacket, usize), ProxyError> {
        if input.len() < PACKET_HEADER_LEN {
            return Err(ProxyError::MalformedPacket(format!(
                "packet header needs 4 bytes, got {}",
                input.len()
            )));
        }
        let payload_len = LittleEndian::read_u24(input) as usize;
        let seq = input[3];
        let total = PACKET_HEADER_LEN + payload_len;
        if input.len() < total {
            return Err(ProxyError::MalformedPacket(format!(
                "declared payload length {} exceeds available {}",
                payload_len,
                input.len() - PACKET_HEADER_LEN
            )));
        }
        let payload = input[PACKET_HEADER_LEN..total].to_vec();
        Ok((MysqlPacket::new(seq, payload), total))
    }

    /// Serializes header + payload. A payload longer than the 3-byte length
    /// field can carry yields an empty vector; callers must treat empty
    /// output as a serialization failure.
    pub fn to_bytes(&self) -> Vec<u8> {
        if self.payload.len() > MAX_PAYLOAD_LEN {
            return Vec::new();
        }
        let mut out = Vec::with_capacity(PACKET_HEADER_LEN + self.payload.len());
        let mut header = [0u8; PACKET_HEADER_LEN];
        LittleEndian::write_u24(&mut header, self.payload.len() as u32);
        header[3] = self.seq;
        out.extend_from_slice(&header);
        out.extend_from_slice(&self.payload);
        out
    }

    /// Builds a MySQL ERR packet: 0xFF, little-endian error code, `#`
    /// marker, the fixed `HY000` sql state, then the message truncated to
    /// the payload ceiling.
    pub fn error(seq: u8, kind: ErrorKind, message: &str) -> MysqlPacket {
        let max_msg = MAX_PAYLOAD_LEN - ERR_PACKET_OVERHEAD;
        let msg = message.as_bytes();
        let msg = &msg[..msg.len().min(max_msg)];
        let mut payload = Vec::with_capacity(ERR_PACKET_OVERHEAD + msg.len());
        payload.push(0xff);
        let mut code = [0u8; 2];
        LittleEndian::write_u16(&mut code, kind.code());
        payload.extend_from_slice(&code);
        payload.push(b'#');
        payload.extend_from_slice(kind.sqlstate());
        payload.extend_from_slice(msg);
        MysqlPacket::new(seq, payload)
    }

    pub fn is_ok_packet(&self) -> bool {
        self.packet_type == PacketType::Ok
    }

    pub fn is_err_packet(&self) -> bool {
        self.packet_type == PacketType::Err
    }

    /// See [MySQL EOF_Packet](https://dev.mysql.com/doc/dev/mysql-server/latest/page_protocol_basic_eof_packet.html)
    pub fn is_eof_packet(&self) -> bool {
        self.packet_type == PacketType::Eof && self.payload.len() <= 5
    }

    pub fn is_local_in_file_packet(&self) -> bool {
        self.packet_type == PacketType::LocalInfile
    }
}

impl AsRef<[u8]> for MysqlPacket {
    fn as_ref(&self) -> &[u8] {
        &self.payload
    }
}

impl Deref for MysqlPacket {
    type Target = [u8];
    fn deref(&self) -> &Self::Target {
        &self.payload
    }
}
