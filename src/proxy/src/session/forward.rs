//! Streaming server responses back to the client. The handshake strips
//! CLIENT_DEPRECATE_EOF, so the upstream always speaks the legacy
//! result-set framing: column count, column definitions, EOF, rows, EOF,
//! with SERVER_MORE_RESULTS_EXISTS chaining multi-result responses.

use crate::error::ProxyError;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::MysqlPacket;
use crate::protocol::mysql::response::{eof_server_status, ok_status_flags};

use byteorder::{ByteOrder, LittleEndian};
use mysql_common::constants::{CapabilityFlags, StatusFlags};
use std::io;
use tokio::io::{AsyncRead, AsyncWrite};

fn upstream_closed() -> ProxyError {
    ProxyError::Io(io::Error::new(
        io::ErrorKind::ConnectionAborted,
        "upstream closed connection",
    ))
}

pub async fn forward_one_packet<R, W>(
    client_writer: &mut PacketWriter<W>,
    server_reader: &mut PacketReader<R>,
    flush: bool,
) -> Result<MysqlPacket, ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let pkt = server_reader
        .next_packet()
        .await?
        .ok_or_else(upstream_closed)?;
    client_writer.write_packet(&pkt).await?;
    if flush {
        client_writer.flush_all().await?;
    }
    Ok(pkt)
}

fn eof_flags(pkt: &MysqlPacket) -> StatusFlags {
    eof_server_status(&pkt.payload)
        .map(|(_, flags)| flags)
        .unwrap_or_else(|_| StatusFlags::empty())
}

/// Walks one COM_QUERY (or COM_STMT_EXECUTE) response: an OK, an ERR, or a
/// result set, looping while the server reports more results.
pub async fn forward_query_response<R, W>(
    server_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let first = forward_one_packet(client_writer, server_reader, false).await?;
        let status = if first.is_ok_packet() {
            client_writer.flush_all().await?;
            ok_status_flags(&first.payload, CapabilityFlags::empty())
        } else if first.is_err_packet() {
            client_writer.flush_all().await?;
            return Ok(());
        } else if first.is_local_in_file_packet() {
            // a file-transfer subprotocol the proxy will not half-relay
            return Err(ProxyError::InternalError(
                "LOCAL INFILE responses are not supported".to_string(),
            ));
        } else {
            forward_result_set(server_reader, client_writer).await?
        };
        if !status.contains(StatusFlags::SERVER_MORE_RESULTS_EXISTS) {
            return Ok(());
        }
    }
}

/// The column-definition block ends at an EOF; rows end at a second EOF
/// (or an ERR mid-stream). A cursor-producing execute stops after the
/// column block.
async fn forward_result_set<R, W>(
    server_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> Result<StatusFlags, ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let pkt = forward_one_packet(client_writer, server_reader, false).await?;
        if pkt.is_eof_packet() {
            let flags = eof_flags(&pkt);
            if flags.contains(StatusFlags::SERVER_STATUS_CURSOR_EXISTS) {
                client_writer.flush_all().await?;
                return Ok(flags);
            }
            break;
        }
        if pkt.is_err_packet() {
            client_writer.flush_all().await?;
            return Ok(StatusFlags::empty());
        }
    }
    loop {
        let pkt = forward_one_packet(client_writer, server_reader, false).await?;
        if pkt.is_eof_packet() {
            client_writer.flush_all().await?;
            return Ok(eof_flags(&pkt));
        }
        if pkt.is_err_packet() {
            client_writer.flush_all().await?;
            return Ok(StatusFlags::empty());
        }
    }
}

/// COM_FIELD_LIST / COM_STMT_FETCH responses: packets until EOF or ERR.
pub async fn forward_until_eof<R, W>(
    server_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    loop {
        let pkt = forward_one_packet(client_writer, server_reader, false).await?;
        if pkt.is_eof_packet() || pkt.is_err_packet() {
            client_writer.flush_all().await?;
            return Ok(());
        }
    }
}

/// COM_STMT_PREPARE response: the PREPARE_OK header names how many column
/// and parameter definition packets follow, each block closed by an EOF in
/// the legacy framing.
pub async fn forward_prepare_response<R, W>(
    server_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    let first = forward_one_packet(client_writer, server_reader, false).await?;
    if first.is_err_packet() {
        client_writer.flush_all().await?;
        return Ok(());
    }
    if !first.is_ok_packet() || first.payload.len() < 9 {
        return Err(ProxyError::MalformedPacket(
            "unexpected COM_STMT_PREPARE response".to_string(),
        ));
    }
    let columns = LittleEndian::read_u16(&first.payload[5..7]);
    let params = LittleEndian::read_u16(&first.payload[7..9]);
    let mut expected = (columns + params) as u32;
    if columns > 0 {
        expected += 1;
    }
    if params > 0 {
        expected += 1;
    }
    for _ in 0..expected {
        forward_one_packet(client_writer, server_reader, false).await?;
    }
    client_writer.flush_all().await
        .map_err(ProxyError::from)
}

/// Single-packet responses (OK, ERR, or a plain text blob for
/// COM_STATISTICS).
pub async fn forward_single_packet<R, W>(
    server_reader: &mut PacketReader<R>,
    client_writer: &mut PacketWriter<W>,
) -> Result<(), ProxyError>
where
    R: AsyncRead + Send + Unpin,
    W: AsyncWrite + Send + Unpin,
{
    forward_one_packet(client_writer, server_reader, true).await?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        MysqlPacket::new(seq, payload.to_vec()).to_bytes()
    }

    fn ok_payload(more_results: bool) -> Vec<u8> {
        let status: u16 = if more_results { 0x0008 } else { 0x0000 };
        let mut payload = vec![0x00, 0x00, 0x00];
        payload.extend_from_slice(&status.to_le_bytes());
        payload.extend_from_slice(&[0x00, 0x00]);
        payload
    }

    fn eof_payload(more_results: bool) -> Vec<u8> {
        let status: u16 = if more_results { 0x0008 } else { 0x0000 };
        let mut payload = vec![0xfe, 0x00, 0x00];
        payload.extend_from_slice(&status.to_le_bytes());
        payload
    }

    async fn collect_packets(wire: &[u8]) -> Vec<MysqlPacket> {
        let mut reader = PacketReader::new(wire);
        let mut out = Vec::new();
        while let Some(pkt) = reader.next_packet().await.unwrap() {
            out.push(pkt);
        }
        out
    }

    #[tokio::test]
    async fn plain_ok_response() {
        let server_wire = frame(1, &ok_payload(false));
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        forward_query_response(&mut reader, &mut writer).await.unwrap();
        let sent = collect_packets(&writer.inner_writer).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_ok_packet());
    }

    #[tokio::test]
    async fn result_set_walk() {
        // column count, one column definition, EOF, two rows, EOF
        let server_wire = [
            frame(1, &[0x01]),
            frame(2, b"\x03def"),
            frame(3, &eof_payload(false)),
            frame(4, &[0x01, b'1']),
            frame(5, &[0x01, b'2']),
            frame(6, &eof_payload(false)),
        ]
        .concat();
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        forward_query_response(&mut reader, &mut writer).await.unwrap();
        let sent = collect_packets(&writer.inner_writer).await;
        assert_eq!(sent.len(), 6);
        assert_eq!(sent[0].payload, vec![0x01]);
        assert!(sent[5].is_eof_packet());
    }

    #[tokio::test]
    async fn multi_result_chains() {
        let server_wire = [frame(1, &ok_payload(true)), frame(2, &ok_payload(false))].concat();
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        forward_query_response(&mut reader, &mut writer).await.unwrap();
        let sent = collect_packets(&writer.inner_writer).await;
        assert_eq!(sent.len(), 2);
    }

    #[tokio::test]
    async fn err_response_stops_the_walk() {
        let server_wire = frame(1, &[0xff, 0x28, 0x04, b'#']);
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        forward_query_response(&mut reader, &mut writer).await.unwrap();
        let sent = collect_packets(&writer.inner_writer).await;
        assert_eq!(sent.len(), 1);
        assert!(sent[0].is_err_packet());
    }

    #[tokio::test]
    async fn local_infile_fails_closed() {
        let server_wire = frame(1, &[0xfb, b'/', b'x']);
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        let err = forward_query_response(&mut reader, &mut writer)
            .await
            .unwrap_err();
        assert!(matches!(err, ProxyError::InternalError(_)));
    }

    #[tokio::test]
    async fn prepare_response_walk() {
        // PREPARE_OK with 2 columns and 1 param: 2 + 1 defs + 2 EOFs
        let mut prepare_ok = vec![0x00, 0x01, 0x00, 0x00, 0x00];
        prepare_ok.extend_from_slice(&2u16.to_le_bytes());
        prepare_ok.extend_from_slice(&1u16.to_le_bytes());
        prepare_ok.extend_from_slice(&[0x00, 0x00, 0x00]);
        let server_wire = [
            frame(1, &prepare_ok),
            frame(2, b"\x03p1"),
            frame(3, &eof_payload(false)),
            frame(4, b"\x03c1"),
            frame(5, b"\x03c2"),
            frame(6, &eof_payload(false)),
        ]
        .concat();
        let mut reader = PacketReader::new(&server_wire[..]);
        let mut writer = PacketWriter::new(Vec::new());
        forward_prepare_response(&mut reader, &mut writer).await.unwrap();
        let sent = collect_packets(&writer.inner_writer).await;
        assert_eq!(sent.len(), 6);
    }
}
