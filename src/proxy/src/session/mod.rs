//! Per-connection orchestration: handshake relay, the command loop, and
//! the allow/block fork on every COM_QUERY. A session owns exactly its two
//! sockets and shares only the policy handle, the stats collector, and the
//! session registry.

pub mod forward;

use crate::error::ProxyError;
use crate::policy::evaluator::{PolicyAction, PolicyResult};
use crate::policy::PolicyEvaluator;
use crate::protocol::mysql::command::{extract_command, CommandPacket};
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::handshake::HandshakeRelay;
use crate::protocol::mysql::packet::packet_reader::PacketReader;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::protocol::mysql::packet::MysqlPacket;
use crate::sql::classifier::{parse_query, ParsedQuery};
use crate::sql::injection::InjectionDetector;
use crate::stats::StatsCollector;

use chrono::{DateTime, Utc};
use common::metrics::metric_def::{
    PROXY_BLOCKED_QUERIES, PROXY_CONN_TOTAL, PROXY_CURR_CONN, PROXY_QUERIES_TOTAL,
};
use dashmap::DashMap;
use serde::Serialize;
use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::time::timeout;
use tracing::{debug, info, warn};

/// The neutral message blocked clients see; internal rule names and
/// reasons stay in the logs.
const BLOCKED_MESSAGE: &str = "Query blocked by policy";

/// Immutable-after-handshake record describing one client connection.
/// Created by the accept loop; the handshake relay fills in user/database;
/// policy, logging, and stats read it afterwards.
#[derive(Debug, Clone)]
pub struct SessionContext {
    pub session_id: u64,
    pub client_addr: SocketAddr,
    pub user: Option<String>,
    pub database: Option<String>,
    pub connected_at: DateTime<Utc>,
    pub handshake_done: bool,
}

impl SessionContext {
    pub fn new(session_id: u64, client_addr: SocketAddr) -> Self {
        SessionContext {
            session_id,
            client_addr,
            user: None,
            database: None,
            connected_at: Utc::now(),
            handshake_done: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Handshaking,
    Ready,
    ProcessingQuery,
    Closing,
    Closed,
}

/// What the control channel's `sessions` command reports.
#[derive(Debug, Clone, Serialize)]
pub struct SessionInfo {
    pub session_id: u64,
    pub user: String,
    pub client_addr: String,
    pub connected_at_ms: i64,
}

pub type SessionRegistry = DashMap<u64, SessionInfo>;

pub struct Session {
    ctx: SessionContext,
    state: SessionState,
    evaluator: Arc<PolicyEvaluator>,
    detector: Arc<InjectionDetector>,
    stats: Arc<StatsCollector>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    closed: bool,
}

impl Session {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        session_id: u64,
        client_addr: SocketAddr,
        evaluator: Arc<PolicyEvaluator>,
        detector: Arc<InjectionDetector>,
        stats: Arc<StatsCollector>,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
    ) -> Self {
        Session {
            ctx: SessionContext::new(session_id, client_addr),
            state: SessionState::Handshaking,
            evaluator,
            detector,
            stats,
            registry,
            idle_timeout,
            closed: false,
        }
    }

    pub fn context(&self) -> &SessionContext {
        &self.ctx
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    fn register(&self) {
        self.registry.insert(
            self.ctx.session_id,
            SessionInfo {
                session_id: self.ctx.session_id,
                user: self.ctx.user.clone().unwrap_or_default(),
                client_addr: self.ctx.client_addr.to_string(),
                connected_at_ms: self.ctx.connected_at.timestamp_millis(),
            },
        );
    }

    /// Drives the whole connection. The caller owns dialing the upstream;
    /// both streams are surrendered here and dropped on return.
    pub async fn run<C, S>(&mut self, client: C, upstream: S) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        self.stats.on_connection_open();
        common::metrics::counter_inc(PROXY_CONN_TOTAL, 1);
        common::metrics::gauge_inc(PROXY_CURR_CONN, 1.0);
        self.register();
        info!(
            session_id = self.ctx.session_id,
            client = %self.ctx.client_addr,
            "session opened"
        );
        let result = self.drive(client, upstream).await;
        if let Err(e) = &result {
            warn!(session_id = self.ctx.session_id, "session ended with error: {e}");
        }
        self.close();
        result
    }

    /// Idempotent: the first call releases the registry entry and the
    /// stats slot, later calls are indistinguishable from it.
    pub fn close(&mut self) {
        if self.closed {
            return;
        }
        self.closed = true;
        self.state = SessionState::Closed;
        self.registry.remove(&self.ctx.session_id);
        self.stats.on_connection_close();
        common::metrics::gauge_dec(PROXY_CURR_CONN, 1.0);
        info!(session_id = self.ctx.session_id, "session closed");
    }

    async fn drive<C, S>(&mut self, client: C, upstream: S) -> Result<(), ProxyError>
    where
        C: AsyncRead + AsyncWrite + Send + Unpin,
        S: AsyncRead + AsyncWrite + Send + Unpin,
    {
        let (client_read, client_write) = tokio::io::split(client);
        let (server_read, server_write) = tokio::io::split(upstream);
        let mut client_reader = PacketReader::new(client_read);
        let mut client_writer = PacketWriter::new(client_write);
        let mut server_reader = PacketReader::new(server_read);
        let mut server_writer = PacketWriter::new(server_write);

        self.state = SessionState::Handshaking;
        HandshakeRelay::new()
            .run(
                &mut client_reader,
                &mut client_writer,
                &mut server_reader,
                &mut server_writer,
                &mut self.ctx,
            )
            .await?;
        // the registry entry now has a user
        self.register();
        self.state = SessionState::Ready;

        loop {
            let next = timeout(self.idle_timeout, client_reader.next_packet()).await;
            let pkt = match next {
                Err(_elapsed) => {
                    info!(session_id = self.ctx.session_id, "idle timeout, closing");
                    break;
                }
                Ok(Ok(None)) => break,
                Ok(Ok(Some(pkt))) => pkt,
                Ok(Err(e)) => return Err(e),
            };

            match extract_command(&pkt) {
                Ok(CommandPacket::Quit) => {
                    // let the upstream see the quit, then drain out
                    server_writer.write_packet(&pkt).await?;
                    server_writer.flush_all().await?;
                    break;
                }
                Ok(CommandPacket::Query { seq, sql }) => {
                    self.state = SessionState::ProcessingQuery;
                    self.handle_query(
                        &pkt,
                        seq,
                        &sql,
                        &mut client_writer,
                        &mut server_reader,
                        &mut server_writer,
                    )
                    .await?;
                    self.state = SessionState::Ready;
                }
                Ok(CommandPacket::ChangeUser) => {
                    // would re-authenticate behind the policy's back; the
                    // session identity is fixed at handshake time
                    warn!(
                        session_id = self.ctx.session_id,
                        "COM_CHANGE_USER refused"
                    );
                    client_writer
                        .write_err_packet(
                            pkt.seq.wrapping_add(1),
                            ErrorKind::ER_UNKNOWN_COM_ERROR,
                            "COM_CHANGE_USER is not supported by the proxy",
                        )
                        .await?;
                }
                Ok(command) => {
                    self.relay_passthrough(
                        &command,
                        &pkt,
                        &mut client_writer,
                        &mut server_reader,
                        &mut server_writer,
                    )
                    .await?;
                }
                Err(e) if e.is_parse_error() => {
                    let result = self.evaluator.evaluate_error(&e, &self.ctx);
                    self.log_block(None, &result);
                    self.count_query(true);
                    client_writer
                        .write_err_packet(
                            pkt.seq.wrapping_add(1),
                            ErrorKind::ER_ACCESS_DENIED_ERROR,
                            BLOCKED_MESSAGE,
                        )
                        .await?;
                }
                Err(e) => return Err(e),
            }
        }

        self.state = SessionState::Closing;
        Ok(())
    }

    /// classify → injection scan → policy. Allow relays and streams the
    /// response; Block synthesizes the ERR without the upstream ever
    /// seeing the query.
    async fn handle_query<CW, SR, SW>(
        &mut self,
        pkt: &MysqlPacket,
        seq: u8,
        sql: &[u8],
        client_writer: &mut PacketWriter<CW>,
        server_reader: &mut PacketReader<SR>,
        server_writer: &mut PacketWriter<SW>,
    ) -> Result<(), ProxyError>
    where
        CW: AsyncWrite + Send + Unpin,
        SR: AsyncRead + Send + Unpin,
        SW: AsyncWrite + Send + Unpin,
    {
        let sql_text = String::from_utf8_lossy(sql).into_owned();
        let (result, parsed) = self.decide(&sql_text);

        match result.action {
            PolicyAction::Block => {
                self.log_block(parsed.as_ref(), &result);
                self.count_query(true);
                client_writer
                    .write_err_packet(
                        seq.wrapping_add(1),
                        ErrorKind::ER_ACCESS_DENIED_ERROR,
                        BLOCKED_MESSAGE,
                    )
                    .await?;
                Ok(())
            }
            PolicyAction::Allow | PolicyAction::Log => {
                if result.action == PolicyAction::Log {
                    warn!(
                        session_id = self.ctx.session_id,
                        rule = result.matched_rule.as_str(),
                        sql = sql_text.as_str(),
                        "query flagged for logging"
                    );
                }
                let timer = common::metrics::MetricsTimer::new(
                    common::metrics::metric_def::PROXY_COM_LATENCY,
                );
                server_writer.write_packet(pkt).await?;
                server_writer.flush_all().await?;
                forward::forward_query_response(server_reader, client_writer).await?;
                drop(timer);
                self.count_query(false);
                if let Some(parsed) = parsed.as_ref() {
                    self.log_query(parsed, &result);
                }
                Ok(())
            }
        }
    }

    fn decide(&self, sql: &str) -> (PolicyResult, Option<ParsedQuery>) {
        match parse_query(sql) {
            Err(e) => (self.evaluator.evaluate_error(&e, &self.ctx), None),
            Ok(parsed) => {
                let check = self.detector.check(&parsed.raw_sql);
                if check.detected {
                    (PolicyResult::block("injection", check.reason), Some(parsed))
                } else {
                    (self.evaluator.evaluate(&parsed, &self.ctx), Some(parsed))
                }
            }
        }
    }

    async fn relay_passthrough<CW, SR, SW>(
        &mut self,
        command: &CommandPacket,
        pkt: &MysqlPacket,
        client_writer: &mut PacketWriter<CW>,
        server_reader: &mut PacketReader<SR>,
        server_writer: &mut PacketWriter<SW>,
    ) -> Result<(), ProxyError>
    where
        CW: AsyncWrite + Send + Unpin,
        SR: AsyncRead + Send + Unpin,
        SW: AsyncWrite + Send + Unpin,
    {
        debug!(
            session_id = self.ctx.session_id,
            command = command.as_ref(),
            "relaying passthrough command"
        );
        server_writer.write_packet(pkt).await?;
        server_writer.flush_all().await?;
        match command {
            CommandPacket::StmtClose | CommandPacket::StmtSendLongData => Ok(()),
            CommandPacket::StmtExecute | CommandPacket::ProcessInfo => {
                forward::forward_query_response(server_reader, client_writer).await
            }
            CommandPacket::FieldList | CommandPacket::StmtFetch => {
                forward::forward_until_eof(server_reader, client_writer).await
            }
            CommandPacket::StmtPrepare => {
                forward::forward_prepare_response(server_reader, client_writer).await
            }
            _ => forward::forward_single_packet(server_reader, client_writer).await,
        }
    }

    fn count_query(&self, blocked: bool) {
        self.stats.on_query(blocked);
        common::metrics::counter_inc(PROXY_QUERIES_TOTAL, 1);
        if blocked {
            common::metrics::counter_inc(PROXY_BLOCKED_QUERIES, 1);
        }
    }

    fn log_query(&self, parsed: &ParsedQuery, result: &PolicyResult) {
        info!(
            session_id = self.ctx.session_id,
            user = self.ctx.user.as_deref().unwrap_or(""),
            command = parsed.command.as_ref(),
            tables = parsed.tables.join(",").as_str(),
            rule = result.matched_rule.as_str(),
            "query allowed"
        );
    }

    fn log_block(&self, parsed: Option<&ParsedQuery>, result: &PolicyResult) {
        warn!(
            session_id = self.ctx.session_id,
            user = self.ctx.user.as_deref().unwrap_or(""),
            command = parsed.map(|p| p.command.as_ref()).unwrap_or("?"),
            rule = result.matched_rule.as_str(),
            reason = result.reason.as_str(),
            "query blocked"
        );
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::policy::config::{AccessRule, PolicyConfig, SqlRule};
    use byteorder::{ByteOrder, LittleEndian};
    use mysql_common::constants::CapabilityFlags;

    fn frame(seq: u8, payload: &[u8]) -> Vec<u8> {
        MysqlPacket::new(seq, payload.to_vec()).to_bytes()
    }

    fn greeting_payload() -> Vec<u8> {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_PLUGIN_AUTH;
        let bits = caps.bits();
        let mut payload = vec![0x0a];
        payload.extend_from_slice(b"8.0.36\0");
        payload.extend_from_slice(&7u32.to_le_bytes());
        payload.extend_from_slice(&[0x40; 8]);
        payload.push(0x00);
        payload.extend_from_slice(&(bits as u16).to_le_bytes());
        payload.push(0xff);
        payload.extend_from_slice(&2u16.to_le_bytes());
        payload.extend_from_slice(&((bits >> 16) as u16).to_le_bytes());
        payload.push(21);
        payload.extend_from_slice(&[0u8; 10]);
        payload.extend_from_slice(&[0x41; 12]);
        payload.push(0x00);
        payload.extend_from_slice(b"mysql_native_password\0");
        payload
    }

    fn response_payload() -> Vec<u8> {
        let caps = CapabilityFlags::CLIENT_PROTOCOL_41
            | CapabilityFlags::CLIENT_SECURE_CONNECTION
            | CapabilityFlags::CLIENT_CONNECT_WITH_DB;
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

    fn auth_ok() -> Vec<u8> {
        vec![0x00, 0x00, 0x00, 0x02, 0x00, 0x00, 0x00]
    }

    fn com_query(sql: &str) -> Vec<u8> {
        let mut payload = vec![0x03];
        payload.extend_from_slice(sql.as_bytes());
        frame(0, &payload)
    }

    fn eof_payload() -> Vec<u8> {
        vec![0xfe, 0x00, 0x00, 0x00, 0x00]
    }

    fn policy() -> PolicyConfig {
        PolicyConfig {
            access_control: vec![AccessRule {
                user: "testuser".to_string(),
                source_ip_cidr: vec!["192.168.1.0/24".to_string()],
                allowed_tables: vec!["users".to_string()],
                allowed_operations: vec!["SELECT".to_string()],
                ..Default::default()
            }],
            sql_rules: SqlRule {
                block_statements: vec!["DROP".to_string()],
                block_patterns: vec!["into\\s+outfile".to_string()],
            },
            ..Default::default()
        }
    }

    struct Fixture {
        session: Session,
        stats: Arc<StatsCollector>,
        registry: Arc<SessionRegistry>,
    }

    fn fixture() -> Fixture {
        let stats = Arc::new(StatsCollector::new());
        let registry = Arc::new(SessionRegistry::default());
        let session = Session::new(
            1,
            "192.168.1.7:50000".parse().unwrap(),
            Arc::new(PolicyEvaluator::with_config(policy())),
            Arc::new(InjectionDetector::with_default_patterns()),
            Arc::clone(&stats),
            Arc::clone(&registry),
            Duration::from_secs(5),
        );
        Fixture {
            session,
            stats,
            registry,
        }
    }

    async fn collect(wire: &[u8]) -> Vec<MysqlPacket> {
        let mut reader = PacketReader::new(wire);
        let mut out = Vec::new();
        while let Some(pkt) = reader.next_packet().await.unwrap() {
            out.push(pkt);
        }
        out
    }

    /// The scripted variant used by most tests: everything is pre-written,
    /// outputs are captured from the proxy's writer halves directly.
    async fn run_scripted(
        fixture: &mut Fixture,
        client_script: Vec<u8>,
        server_script: Vec<u8>,
    ) -> (Vec<MysqlPacket>, Vec<MysqlPacket>, Result<(), ProxyError>) {
        struct ScriptedStream {
            read: std::io::Cursor<Vec<u8>>,
            written: Vec<u8>,
        }
        // a simple duplex built from buffers: reads come from the script,
        // writes accumulate
        use std::pin::Pin;
        use std::task::{Context, Poll};
        impl AsyncRead for ScriptedStream {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut tokio::io::ReadBuf<'_>,
            ) -> Poll<std::io::Result<()>> {
                let pos = self.read.position() as usize;
                let data = self.read.get_ref();
                if pos >= data.len() {
                    return Poll::Ready(Ok(()));
                }
                let n = std::cmp::min(buf.remaining(), data.len() - pos);
                buf.put_slice(&data[pos..pos + n]);
                self.read.set_position((pos + n) as u64);
                Poll::Ready(Ok(()))
            }
        }
        impl AsyncWrite for ScriptedStream {
            fn poll_write(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &[u8],
            ) -> Poll<std::io::Result<usize>> {
                self.written.extend_from_slice(buf);
                Poll::Ready(Ok(buf.len()))
            }
            fn poll_flush(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
            fn poll_shutdown(
                self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
            ) -> Poll<std::io::Result<()>> {
                Poll::Ready(Ok(()))
            }
        }

        let client = ScriptedStream {
            read: std::io::Cursor::new(client_script),
            written: Vec::new(),
        };
        let server = ScriptedStream {
            read: std::io::Cursor::new(server_script),
            written: Vec::new(),
        };
        // split gives back halves of the same stream, so move the streams
        // in whole and fish the buffers out after
        let result;
        let (client_out, server_out);
        {
            let mut client = client;
            let mut server = server;
            result = fixture.session.drive(&mut client, &mut server).await;
            fixture.session.close();
            client_out = client.written;
            server_out = server.written;
        }
        (collect(&client_out).await, collect(&server_out).await, result)
    }

    #[tokio::test]
    async fn allowed_select_is_relayed_and_counted() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            com_query("SELECT id FROM users WHERE id=1"),
            frame(0, &[0x01]), // COM_QUIT
        ]
        .concat();
        let server_script = [
            frame(0, &greeting_payload()),
            frame(2, &auth_ok()),
            // result set: count, coldef, EOF, row, EOF
            frame(1, &[0x01]),
            frame(2, b"\x03def"),
            frame(3, &eof_payload()),
            frame(4, &[0x01, b'7']),
            frame(5, &eof_payload()),
        ]
        .concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        // upstream saw the handshake response, the query, and the quit
        assert_eq!(to_server.len(), 3);
        assert_eq!(to_server[1].payload[0], 0x03);
        assert_eq!(&to_server[1].payload[1..], b"SELECT id FROM users WHERE id=1");
        assert_eq!(to_server[2].payload, vec![0x01]);

        // client saw greeting, auth OK, then the five result-set packets
        assert_eq!(to_client.len(), 7);
        assert!(to_client[6].is_eof_packet());

        let snap = fixture.stats.snapshot();
        assert_eq!(snap.total_queries, 1);
        assert_eq!(snap.blocked_queries, 0);
        assert_eq!(snap.active_sessions, 0);
        assert!(fixture.registry.is_empty());
    }

    #[tokio::test]
    async fn blocked_statement_never_reaches_upstream() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            com_query("DROP TABLE users"),
            frame(0, &[0x01]),
        ]
        .concat();
        let server_script = [frame(0, &greeting_payload()), frame(2, &auth_ok())].concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        // only the handshake response and quit reached the server
        assert_eq!(to_server.len(), 2);
        assert_eq!(to_server[1].payload, vec![0x01]);

        // the client got an ERR 1045 on the next sequence id
        let err = &to_client[2];
        assert!(err.is_err_packet());
        assert_eq!(err.seq, 1);
        assert_eq!(LittleEndian::read_u16(&err.payload[1..3]), 1045);
        assert_eq!(&err.payload[9..], BLOCKED_MESSAGE.as_bytes());

        let snap = fixture.stats.snapshot();
        assert_eq!(snap.total_queries, 1);
        assert_eq!(snap.blocked_queries, 1);
    }

    #[tokio::test]
    async fn injection_is_blocked_before_policy() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            com_query("SELECT * FROM users WHERE name='' OR '1'='1'"),
            frame(0, &[0x01]),
        ]
        .concat();
        let server_script = [frame(0, &greeting_payload()), frame(2, &auth_ok())].concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        assert_eq!(to_server.len(), 2);
        assert!(to_client[2].is_err_packet());
        assert_eq!(fixture.stats.snapshot().blocked_queries, 1);
    }

    #[tokio::test]
    async fn multi_statement_parse_error_blocks_and_continues() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            com_query("SELECT 1; DROP TABLE users"),
            com_query("SELECT id FROM users"),
            frame(0, &[0x01]),
        ]
        .concat();
        let server_script = [
            frame(0, &greeting_payload()),
            frame(2, &auth_ok()),
            frame(1, &[0x01]),
            frame(2, b"\x03def"),
            frame(3, &eof_payload()),
            frame(4, &eof_payload()),
        ]
        .concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        // the piggyback never reached the server; the clean query did
        assert_eq!(to_server.len(), 3);
        assert_eq!(&to_server[1].payload[1..], b"SELECT id FROM users");
        assert!(to_client[2].is_err_packet());

        let snap = fixture.stats.snapshot();
        assert_eq!(snap.total_queries, 2);
        assert_eq!(snap.blocked_queries, 1);
    }

    #[tokio::test]
    async fn ping_passes_through_without_policy() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            frame(0, &[0x0e]), // COM_PING
            frame(0, &[0x01]),
        ]
        .concat();
        let server_script = [
            frame(0, &greeting_payload()),
            frame(2, &auth_ok()),
            frame(1, &auth_ok()), // OK to the ping
        ]
        .concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        assert_eq!(to_server[1].payload, vec![0x0e]);
        assert!(to_client[2].is_ok_packet());
        // pings are not queries
        assert_eq!(fixture.stats.snapshot().total_queries, 0);
    }

    #[tokio::test]
    async fn change_user_is_refused_locally() {
        let mut fixture = fixture();
        let client_script = [
            frame(1, &response_payload()),
            frame(0, &[0x11, b'r', b'o', b'o', b't', 0x00]),
            frame(0, &[0x01]),
        ]
        .concat();
        let server_script = [frame(0, &greeting_payload()), frame(2, &auth_ok())].concat();

        let (to_client, to_server, result) =
            run_scripted(&mut fixture, client_script, server_script).await;
        result.unwrap();

        // change-user stopped at the proxy
        assert_eq!(to_server.len(), 2);
        assert!(to_client[2].is_err_packet());
    }

    #[tokio::test]
    async fn close_is_idempotent() {
        let mut fixture = fixture();
        fixture.stats.on_connection_open();
        fixture.session.close();
        let after_first = fixture.stats.snapshot().active_sessions;
        fixture.session.close();
        fixture.session.close();
        assert_eq!(fixture.stats.snapshot().active_sessions, after_first);
        assert_eq!(fixture.session.state(), SessionState::Closed);
    }
}
