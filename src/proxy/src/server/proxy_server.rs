use crate::policy::PolicyEvaluator;
use crate::protocol::mysql::error_codes::ErrorKind;
use crate::protocol::mysql::packet::packet_writer::PacketWriter;
use crate::session::{Session, SessionRegistry};
use crate::sql::injection::InjectionDetector;
use crate::stats::StatsCollector;

use common::ShutdownMessage;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::net::{lookup_host, TcpListener, TcpStream};
use tokio::sync::watch;
use tracing::{info, warn};

/// Everything the accept loop needs to stand up a session: the shared
/// policy/detector/stats handles and the upstream coordinates.
pub struct GateServer {
    upstream_host: String,
    upstream_port: u16,
    evaluator: Arc<PolicyEvaluator>,
    detector: Arc<InjectionDetector>,
    stats: Arc<StatsCollector>,
    registry: Arc<SessionRegistry>,
    idle_timeout: Duration,
    max_connections: usize,
    next_session_id: AtomicU64,
}

impl GateServer {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        upstream_host: String,
        upstream_port: u16,
        evaluator: Arc<PolicyEvaluator>,
        detector: Arc<InjectionDetector>,
        stats: Arc<StatsCollector>,
        registry: Arc<SessionRegistry>,
        idle_timeout: Duration,
        max_connections: usize,
    ) -> Self {
        GateServer {
            upstream_host,
            upstream_port,
            evaluator,
            detector,
            stats,
            registry,
            idle_timeout,
            max_connections,
            next_session_id: AtomicU64::new(1),
        }
    }

    pub fn stats(&self) -> Arc<StatsCollector> {
        Arc::clone(&self.stats)
    }

    /// Accept loop: one spawned task per connection until the shutdown
    /// channel fires. Sessions over the connection cap are refused before
    /// any upstream dial happens.
    pub async fn serve(
        self: Arc<Self>,
        listener: TcpListener,
        mut shutdown: watch::Receiver<ShutdownMessage>,
    ) -> anyhow::Result<()> {
        info!(
            upstream = format!("{}:{}", self.upstream_host, self.upstream_port),
            "proxy accepting connections"
        );
        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    info!("proxy accept loop shutting down");
                    return Ok(());
                }
                accepted = listener.accept() => {
                    match accepted {
                        Ok((stream, addr)) => {
                            let server = Arc::clone(&self);
                            tokio::spawn(async move { server.handle_conn(stream, addr).await });
                        }
                        Err(e) => warn!("accept error: {e:?}"),
                    }
                }
            }
        }
    }

    async fn handle_conn(&self, client: TcpStream, addr: SocketAddr) {
        if self.stats.active_sessions() >= self.max_connections as u64 {
            warn!(client = %addr, "connection refused, at max_connections");
            let mut writer = PacketWriter::new(client);
            let _ = writer
                .write_err_packet(0, ErrorKind::ER_UNKNOWN_ERROR, "Too many connections")
                .await;
            return;
        }

        let session_id = self.next_session_id.fetch_add(1, Ordering::Relaxed);
        let upstream = match self.dial_upstream().await {
            Ok(upstream) => upstream,
            Err(e) => {
                warn!(client = %addr, "upstream dial failed: {e}");
                let mut writer = PacketWriter::new(client);
                let _ = writer
                    .write_err_packet(0, ErrorKind::ER_UNKNOWN_ERROR, "Upstream unavailable")
                    .await;
                return;
            }
        };

        let mut session = Session::new(
            session_id,
            addr,
            Arc::clone(&self.evaluator),
            Arc::clone(&self.detector),
            Arc::clone(&self.stats),
            Arc::clone(&self.registry),
            self.idle_timeout,
        );
        // session errors are logged inside run(); the task just ends
        let _ = session.run(client, upstream).await;
    }

    /// Resolves the configured upstream on every dial so DNS changes are
    /// honored; resolution failure fails the session closed.
    async fn dial_upstream(&self) -> io::Result<TcpStream> {
        let mut addrs = lookup_host((self.upstream_host.as_str(), self.upstream_port)).await?;
        let addr = addrs.next().ok_or_else(|| {
            io::Error::new(
                io::ErrorKind::NotFound,
                format!("upstream host {} did not resolve", self.upstream_host),
            )
        })?;
        TcpStream::connect(addr).await
    }
}
