use crate::protocol::mysql::constants::{MAX_PAYLOAD_LEN, PACKET_HEADER_LEN};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::MysqlPacket;

use byteorder::{ByteOrder, LittleEndian};
use std::io;
use std::io::prelude::*;
use tokio::io::{AsyncWrite, AsyncWriteExt};

/// Buffering packet writer. Payload bytes accumulate through the `Write`
/// impl; `end_packet` frames the buffer (splitting at the 16M payload
/// boundary) and pushes it to the underlying stream with the tracked
/// sequence id.
pub struct PacketWriter<W> {
    buf: Vec<u8>,
    seq: u8,
    pub inner_writer: W,
}

impl<W> PacketWriter<W> {
    pub fn new(write: W) -> Self {
        Self {
            buf: Vec::new(),
            seq: 0,
            inner_writer: write,
        }
    }

    fn is_empty(&self) -> bool {
        self.buf.is_empty()
    }

    fn take_buffer(&mut self) -> Vec<u8> {
        std::mem::take(&mut self.buf)
    }

    pub fn set_seq(&mut self, seq: u8) {
        self.seq = seq;
    }

    fn increase_seq(&mut self) {
        self.seq = self.seq.wrapping_add(1);
    }

    pub fn reset_seq(&mut self) {
        self.seq = 0;
    }

    pub fn seq(&self) -> u8 {
        self.seq
    }
}

impl<W> Write for PacketWriter<W> {
    fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
        self.buf.extend_from_slice(buf);
        Ok(buf.len())
    }

    fn flush(&mut self) -> io::Result<()> {
        Ok(())
    }
}

impl<W: AsyncWrite + Unpin> PacketWriter<W> {
    pub async fn end_packet(&mut self) -> io::Result<()> {
        let mut header = [0; PACKET_HEADER_LEN];
        if !self.is_empty() {
            let raw_packet = self.take_buffer();
            // split the raw buffer at the boundary of size MAX_PAYLOAD_LEN
            for chunk in raw_packet.chunks(MAX_PAYLOAD_LEN) {
                LittleEndian::write_u24(&mut header, chunk.len() as u32);
                header[3] = self.seq();
                self.increase_seq();
                self.inner_writer.write_all(&header).await?;
                self.inner_writer.write_all(chunk).await?;
            }
            Ok(())
        } else {
            // Empty payload still needs its frame (empty auth responses).
            LittleEndian::write_u24(&mut header, 0);
            header[3] = self.seq();
            self.increase_seq();
            self.inner_writer.write_all(&header).await
        }
    }

    pub async fn flush_all(&mut self) -> io::Result<()> {
        self.inner_writer.flush().await
    }

    /// Relays a packet verbatim under its own sequence id.
    pub async fn write_packet(&mut self, pkt: &MysqlPacket) -> io::Result<()> {
        self.set_seq(pkt.seq);
        self.write_all(&pkt.payload)?;
        self.end_packet().await
    }

    /// Synthesizes a MySQL ERR packet on the given sequence id and flushes.
    pub async fn write_err_packet(
        &mut self,
        seq: u8,
        kind: ErrorKind,
        msg: &str,
    ) -> io::Result<()> {
        let err = MysqlPacket::error(seq, kind, msg);
        self.write_packet(&err).await?;
        self.flush_all().await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn frames_buffered_payload() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(2);
        writer.write_all(&[0x0e]).unwrap();
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x01, 0, 0, 2, 0x0e]);
        assert_eq!(writer.seq(), 3);
    }

    #[tokio::test]
    async fn empty_payload_still_framed() {
        let mut writer = PacketWriter::new(Vec::new());
        writer.set_seq(5);
        writer.end_packet().await.unwrap();
        assert_eq!(writer.inner_writer, vec![0, 0, 0, 5]);
    }

    #[tokio::test]
    async fn relays_packet_on_its_own_seq() {
        let mut writer = PacketWriter::new(Vec::new());
        let pkt = MysqlPacket::new(7, vec![0x03, b'x']);
        writer.write_packet(&pkt).await.unwrap();
        assert_eq!(writer.inner_writer, vec![0x02, 0, 0, 7, 0x03, b'x']);
    }

    #[tokio::test]
    async fn err_packet_bytes() {
        let mut writer = PacketWriter::new(Vec::new());
        writer
            .write_err_packet(1, ErrorKind::ER_ACCESS_DENIED_ERROR, "Query blocked by policy")
            .await
            .unwrap();
        let wire = &writer.inner_writer;
        assert_eq!(wire[3], 1);
        assert_eq!(wire[4], 0xff);
        assert_eq!(LittleEndian::read_u16(&wire[5..7]), 1045);
        assert_eq!(&wire[7..13], b"#HY000");
    }
}
