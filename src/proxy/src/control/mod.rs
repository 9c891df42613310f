//! Local control channel: a Unix-domain socket speaking 4-byte
//! little-endian length-prefixed JSON. One spawned task per client; a
//! client that violates the framing is dropped without a response and
//! without disturbing anyone else.

use crate::policy::PolicyEvaluator;
use crate::session::SessionRegistry;
use crate::stats::StatsCollector;

use byteorder::{ByteOrder, LittleEndian};
use common::ShutdownMessage;
use serde::Deserialize;
use serde_json::{json, Value};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};
use tokio::net::UnixListener;
use tokio::sync::watch;
use tracing::{info, warn};

/// Hard ceiling on a request body; anything larger is treated as hostile.
pub const MAX_CONTROL_FRAME: usize = 4 * 1024 * 1024;

#[derive(Debug, Deserialize)]
pub struct ControlRequest {
    pub command: String,
    #[serde(default)]
    pub version: Option<u32>,
}

/// Shared state the commands read. Split from the listener so tests can
/// drive `serve_conn` over an in-memory duplex stream.
pub struct ControlHandler {
    stats: Arc<StatsCollector>,
    registry: Arc<SessionRegistry>,
    evaluator: Arc<PolicyEvaluator>,
    policy_path: Option<PathBuf>,
}

impl ControlHandler {
    pub fn new(
        stats: Arc<StatsCollector>,
        registry: Arc<SessionRegistry>,
        evaluator: Arc<PolicyEvaluator>,
        policy_path: Option<PathBuf>,
    ) -> Self {
        ControlHandler {
            stats,
            registry,
            evaluator,
            policy_path,
        }
    }

    pub fn handle(&self, request: &ControlRequest) -> Value {
        match request.command.as_str() {
            "stats" => match serde_json::to_value(self.stats.snapshot()) {
                Ok(payload) => json!({"ok": true, "payload": payload}),
                Err(e) => json!({"ok": false, "error": e.to_string()}),
            },
            "sessions" => {
                let sessions: Vec<Value> = self
                    .registry
                    .iter()
                    .map(|entry| {
                        json!({
                            "session_id": entry.session_id,
                            "user": entry.user,
                            "client_addr": entry.client_addr,
                            "connected_at_ms": entry.connected_at_ms,
                        })
                    })
                    .collect();
                json!({"ok": true, "payload": sessions})
            }
            "policy_reload" => match &self.policy_path {
                None => json!({"ok": false, "error": "no policy path configured"}),
                Some(path) => match self.evaluator.reload_from_path(path) {
                    Ok(()) => {
                        info!(path = %path.display(), "policy reloaded via control channel");
                        json!({"ok": true, "payload": {"reloaded": true}})
                    }
                    Err(e) => {
                        // the previous policy stays active
                        warn!("policy reload failed, keeping active policy: {e}");
                        json!({"ok": false, "error": e.to_string()})
                    }
                },
            },
            other => json!({"ok": false, "error": format!("unknown command {other:?}")}),
        }
    }
}

/// Serves one client until EOF or a framing violation. Zero-length and
/// oversize bodies close the connection with no response.
pub async fn serve_conn<S>(mut stream: S, handler: Arc<ControlHandler>)
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    loop {
        let mut len_buf = [0u8; 4];
        if stream.read_exact(&mut len_buf).await.is_err() {
            return;
        }
        let len = LittleEndian::read_u32(&len_buf) as usize;
        if len == 0 || len > MAX_CONTROL_FRAME {
            warn!(len, "control client violated framing, closing");
            return;
        }
        let mut body = vec![0u8; len];
        if stream.read_exact(&mut body).await.is_err() {
            return;
        }

        let response = match serde_json::from_slice::<ControlRequest>(&body) {
            Ok(request) => handler.handle(&request),
            Err(e) => json!({"ok": false, "error": format!("invalid request: {e}")}),
        };
        let body = match serde_json::to_vec(&response) {
            Ok(body) => body,
            Err(_) => return,
        };
        let mut frame = [0u8; 4];
        LittleEndian::write_u32(&mut frame, body.len() as u32);
        if stream.write_all(&frame).await.is_err() || stream.write_all(&body).await.is_err() {
            return;
        }
        if stream.flush().await.is_err() {
            return;
        }
    }
}

pub struct ControlChannel {
    socket_path: PathBuf,
    handler: Arc<ControlHandler>,
    shutdown_tx: watch::Sender<ShutdownMessage>,
    shutdown_rx: watch::Receiver<ShutdownMessage>,
}

impl ControlChannel {
    pub fn new(socket_path: PathBuf, handler: ControlHandler) -> Self {
        let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
        ControlChannel {
            socket_path,
            handler: Arc::new(handler),
            shutdown_tx,
            shutdown_rx,
        }
    }

    /// Signals the accept loop to exit. Safe whether or not `run` has
    /// started; before `run` it is a no-op.
    pub fn stop(&self) {
        let _ = self.shutdown_tx.send(ShutdownMessage::Cancel(
            "control channel stop".to_string(),
        ));
    }

    pub async fn run(&self) -> anyhow::Result<()> {
        // stale socket file from an unclean exit
        let _ = fs_err::remove_file(&self.socket_path);
        let listener = UnixListener::bind(&self.socket_path)?;
        info!(path = %self.socket_path.display(), "control channel listening");

        let mut shutdown = self.shutdown_rx.clone();
        // a stop() issued before run() is a no-op by contract
        shutdown.borrow_and_update();
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("control channel shutting down");
                    let _ = fs_err::remove_file(&self.socket_path);
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, _addr)) => {
                            let handler = Arc::clone(&self.handler);
                            tokio::spawn(async move { serve_conn(stream, handler).await });
                        }
                        Err(e) => warn!("control channel accept error: {e:?}"),
                    }
                }
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::session::SessionInfo;
    use std::io::Write as _;

    fn handler() -> Arc<ControlHandler> {
        Arc::new(ControlHandler::new(
            Arc::new(StatsCollector::new()),
            Arc::new(SessionRegistry::default()),
            Arc::new(PolicyEvaluator::new()),
            None,
        ))
    }

    fn frame(body: &[u8]) -> Vec<u8> {
        let mut out = vec![0u8; 4];
        LittleEndian::write_u32(&mut out, body.len() as u32);
        out.extend_from_slice(body);
        out
    }

    async fn request(handler: Arc<ControlHandler>, body: &[u8]) -> Option<Value> {
        let (mut client, server) = tokio::io::duplex(64 * 1024);
        let server_task = tokio::spawn(serve_conn(server, handler));
        client.write_all(&frame(body)).await.unwrap();
        client.shutdown().await.unwrap();

        let mut len_buf = [0u8; 4];
        if client.read_exact(&mut len_buf).await.is_err() {
            server_task.await.unwrap();
            return None;
        }
        let len = LittleEndian::read_u32(&len_buf) as usize;
        let mut body = vec![0u8; len];
        client.read_exact(&mut body).await.unwrap();
        server_task.await.unwrap();
        Some(serde_json::from_slice(&body).unwrap())
    }

    #[tokio::test]
    async fn stats_command_returns_snapshot() {
        let handler = handler();
        handler.stats.on_query(true);
        let response = request(Arc::clone(&handler), br#"{"command":"stats","version":1}"#)
            .await
            .unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["payload"]["total_queries"], 1);
        assert_eq!(response["payload"]["blocked_queries"], 1);
        assert!(response["payload"]["captured_at_ms"].is_i64());
    }

    #[tokio::test]
    async fn unknown_command_is_an_error() {
        let response = request(handler(), br#"{"command":"xyz"}"#).await.unwrap();
        assert_eq!(response["ok"], false);
        assert!(response["error"].as_str().unwrap().contains("xyz"));
    }

    #[tokio::test]
    async fn invalid_json_is_an_error_response() {
        let response = request(handler(), b"{not json").await.unwrap();
        assert_eq!(response["ok"], false);
    }

    #[tokio::test]
    async fn zero_length_body_closes_without_response() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_conn(server, handler()));
        client.write_all(&[0u8; 4]).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn oversize_body_closes_without_response() {
        let (mut client, server) = tokio::io::duplex(1024);
        let task = tokio::spawn(serve_conn(server, handler()));
        let mut len_buf = [0u8; 4];
        LittleEndian::write_u32(&mut len_buf, (MAX_CONTROL_FRAME + 1) as u32);
        client.write_all(&len_buf).await.unwrap();
        let mut buf = [0u8; 1];
        let n = client.read(&mut buf).await.unwrap();
        assert_eq!(n, 0);
        task.await.unwrap();
    }

    #[tokio::test]
    async fn sessions_lists_the_registry() {
        let registry = Arc::new(SessionRegistry::default());
        registry.insert(
            9,
            SessionInfo {
                session_id: 9,
                user: "testuser".to_string(),
                client_addr: "192.168.1.7:50000".to_string(),
                connected_at_ms: 1_700_000_000_000,
            },
        );
        let handler = Arc::new(ControlHandler::new(
            Arc::new(StatsCollector::new()),
            registry,
            Arc::new(PolicyEvaluator::new()),
            None,
        ));
        let response = request(handler, br#"{"command":"sessions"}"#).await.unwrap();
        assert_eq!(response["ok"], true);
        assert_eq!(response["payload"][0]["session_id"], 9);
        assert_eq!(response["payload"][0]["user"], "testuser");
    }

    #[tokio::test]
    async fn policy_reload_swaps_and_keeps_old_on_failure() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        file.write_all(
            b"sql_rules:\n  block_patterns:\n    - \"union\\\\s+select\"\naccess_control:\n  - user: \"*\"\n    allowed_operations: [\"*\"]\n",
        )
        .unwrap();
        let evaluator = Arc::new(PolicyEvaluator::new());
        let handler = Arc::new(ControlHandler::new(
            Arc::new(StatsCollector::new()),
            Arc::new(SessionRegistry::default()),
            Arc::clone(&evaluator),
            Some(file.path().to_path_buf()),
        ));

        let response = request(Arc::clone(&handler), br#"{"command":"policy_reload"}"#)
            .await
            .unwrap();
        assert_eq!(response["ok"], true);
        assert!(evaluator.snapshot().is_some());

        // make the file invalid; reload fails, active policy stays
        use std::io::{Seek, SeekFrom};
        file.as_file_mut().set_len(0).unwrap();
        file.as_file_mut().seek(SeekFrom::Start(0)).unwrap();
        file.write_all(b"sql_rules:\n  block_patterns: []\n").unwrap();
        file.flush().unwrap();
        let response = request(handler, br#"{"command":"policy_reload"}"#).await.unwrap();
        assert_eq!(response["ok"], false);
        assert!(evaluator.snapshot().is_some());
    }

    #[test]
    fn stop_before_run_is_a_no_op() {
        let channel = ControlChannel::new(
            std::env::temp_dir().join("sqlgate-test-control.sock"),
            ControlHandler::new(
                Arc::new(StatsCollector::new()),
                Arc::new(SessionRegistry::default()),
                Arc::new(PolicyEvaluator::new()),
                None,
            ),
        );
        channel.stop();
        channel.stop();
    }
}
