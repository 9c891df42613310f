use crate::error::ProxyError;
use crate::protocol::mysql::constants::PACKET_HEADER_LEN;
use crate::protocol::mysql::packet::MysqlPacket;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use tokio::io::{AsyncRead, AsyncReadExt};

const PACKET_BUFFER_SIZE: usize = 4096;

/// Incremental framing reader: pulls bytes off a stream and yields one wire
/// packet at a time. Frame boundaries are preserved exactly as received so
/// the relay can re-emit identical framing on the other side.
pub struct PacketReader<R> {
    bytes: Vec<u8>,
    pub r: R,
}

impl<R> PacketReader<R> {
    pub fn new(r: R) -> Self {
        PacketReader {
            bytes: Vec::new(),
            r,
        }
    }
}

impl<R: AsyncRead + Unpin> PacketReader<R> {
    /// Returns the next packet, or `None` on a clean peer close at a frame
    /// boundary. A close mid-frame is an error.
    pub async fn next_packet(&mut self) -> Result<Option<MysqlPacket>, ProxyError> {
        let mut chunk = [0u8; PACKET_BUFFER_SIZE];
        loop {
            if self.bytes.len() >= PACKET_HEADER_LEN {
                let payload_len = LittleEndian::read_u24(&self.bytes) as usize;
                let total = PACKET_HEADER_LEN + payload_len;
                if self.bytes.len() >= total {
                    let (pkt, used) = MysqlPacket::parse(&self.bytes[..total])?;
                    self.bytes.drain(..used);
                    return Ok(Some(pkt));
                }
            }

            let read = self.r.read(&mut chunk).await?;
            if read == 0 {
                if self.bytes.is_empty() {
                    return Ok(None);
                }
                return Err(ProxyError::Io(io::Error::new(
                    io::ErrorKind::UnexpectedEof,
                    format!("{} unhandled bytes", self.bytes.len()),
                )));
            }
            self.bytes.extend_from_slice(&chunk[..read]);
        }
    }
}
