use clap::Parser;
use common::ShutdownMessage;
use proxy::control::{ControlChannel, ControlHandler};
use proxy::policy::{load_policy, PolicyEvaluator};
use proxy::server::proxy_cli_args::ProxyServerArgs;
use proxy::server::GateServer;
use proxy::session::SessionRegistry;
use proxy::sql::injection::InjectionDetector;
use proxy::stats::StatsCollector;
use std::str::FromStr;
use std::sync::Arc;
use tokio::net::TcpListener;
use tokio::runtime::Runtime;
use tokio::sync::watch;
use tokio::sync::watch::Receiver;
use tracing::{error, info, warn, Level};
use tracing_subscriber::EnvFilter;

#[cfg(unix)]
#[global_allocator]
static GLOBAL: tikv_jemallocator::Jemalloc = tikv_jemallocator::Jemalloc;

async fn shutdown_await(mut shutdown_rx: Box<Receiver<ShutdownMessage>>) {
    let changed_rs = &shutdown_rx.changed().await;
    if changed_rs.is_ok() {
        let canceled = shutdown_rx.borrow_and_update().clone();
        if let ShutdownMessage::Cancel(msg) = canceled {
            info!("SqlGate process receive shutdown msg {msg}");
        }
    }
}

async fn shutdown_signal() -> ShutdownMessage {
    let ctrl_c = async {
        tokio::signal::ctrl_c()
            .await
            .expect("failed to install Ctrl+C handler");
    };

    let terminate = async {
        tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
            .expect("failed to install signal handler")
            .recv()
            .await;
    };

    tokio::select! {
        ctrl_c_v = ctrl_c => {
            let msg = format!("SqlGate receive ctrl_c signal  {ctrl_c_v:?}");
            ShutdownMessage::Cancel(msg)
        },
        v = terminate => {
            let msg = format!("SqlGate receive terminate signal  {v:?}");
            ShutdownMessage::Cancel(msg)
        },
    }
}

/// SIGHUP re-reads the policy file and atomically installs it; a bad file
/// keeps the active policy.
fn start_policy_reload_on_hup(
    runtime: &Runtime,
    evaluator: Arc<PolicyEvaluator>,
    policy_path: std::path::PathBuf,
) {
    runtime.spawn(async move {
        let mut hup = match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::hangup())
        {
            Ok(hup) => hup,
            Err(e) => {
                warn!("failed to install SIGHUP handler: {e}");
                return;
            }
        };
        while hup.recv().await.is_some() {
            match evaluator.reload_from_path(&policy_path) {
                Ok(()) => info!(path = %policy_path.display(), "policy reloaded on SIGHUP"),
                Err(e) => warn!("policy reload failed, keeping active policy: {e}"),
            }
        }
    });
}

fn start_health_service(
    proxy_config: &ProxyServerArgs,
    runtime: &Runtime,
    stats: Arc<StatsCollector>,
    max_connections: usize,
    shutdown_rx: &Receiver<ShutdownMessage>,
) {
    let http_port = proxy_config.http_port;
    let enable_metrics = proxy_config.enable_metrics;
    if enable_metrics {
        common::metrics::init_metrics_context();
        common::metrics::gauge_set(
            common::metrics::metric_def::PROXY_MAX_CONN,
            max_connections as f64,
        );
    }
    let state = web_service::http_server::GateRestState {
        stats,
        max_connections,
    };
    let shutdown_rx_clone = Box::new(shutdown_rx.clone());
    runtime.spawn(async move {
        web_service::http_server::GateRest::start_server(
            "0.0.0.0".to_string(),
            http_port,
            enable_metrics,
            state,
            shutdown_await(shutdown_rx_clone),
        )
        .await
    });
}

fn main() -> Result<(), Box<dyn std::error::Error>> {
    let proxy_config = ProxyServerArgs::parse();
    let log_level_string = proxy_config.log_level.clone().unwrap_or("INFO".to_string());
    let level = Level::from_str(log_level_string.as_str())?;
    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new("INFO,hyper=INFO,tower=INFO,h2=INFO"))
        .add_directive(level.into())
        .add_directive("hyper=INFO".parse()?)
        .add_directive("h2=INFO".parse()?)
        .add_directive("tower=INFO".parse()?);
    tracing_subscriber::fmt()
        .with_env_filter(filter)
        .with_line_number(true)
        .init();

    info!("SqlGate running config args={:?}", proxy_config);

    // a policy that will not load refuses to start; never serve unguarded
    let policy = match load_policy(&proxy_config.policy_path) {
        Ok(policy) => policy,
        Err(e) => {
            error!("failed to load policy: {e}");
            return Err(e.into());
        }
    };
    let max_connections = proxy_config.effective_max_connections(&policy);
    let idle_timeout = proxy_config.effective_idle_timeout(&policy);

    let evaluator = Arc::new(PolicyEvaluator::with_config(policy));
    let detector = Arc::new(InjectionDetector::with_default_patterns());
    let stats = Arc::new(StatsCollector::new());
    let registry = Arc::new(SessionRegistry::default());

    let runtime = tokio::runtime::Builder::new_multi_thread()
        .enable_all()
        .thread_name("SQLGATE")
        .worker_threads(proxy_config.workers)
        .build()?;

    let (shutdown_tx, shutdown_rx) = watch::channel(ShutdownMessage::Init);
    start_health_service(
        &proxy_config,
        &runtime,
        Arc::clone(&stats),
        max_connections,
        &shutdown_rx,
    );
    start_policy_reload_on_hup(
        &runtime,
        Arc::clone(&evaluator),
        proxy_config.policy_path.clone(),
    );

    runtime.block_on(async {
        let listener = TcpListener::bind(proxy_config.listen_on()).await.map_err(|e| {
            error!("failed to bind {}: {e}", proxy_config.listen_on());
            e
        })?;
        info!("SqlGate listening on {}", proxy_config.listen_on());

        let control = Arc::new(ControlChannel::new(
            proxy_config.control_socket.clone(),
            ControlHandler::new(
                Arc::clone(&stats),
                Arc::clone(&registry),
                Arc::clone(&evaluator),
                Some(proxy_config.policy_path.clone()),
            ),
        ));
        let control_runner = Arc::clone(&control);
        tokio::spawn(async move {
            if let Err(e) = control_runner.run().await {
                warn!("control channel exited: {e:?}");
            }
        });

        let server = Arc::new(GateServer::new(
            proxy_config.upstream_host.clone(),
            proxy_config.upstream_port,
            evaluator,
            detector,
            stats,
            registry,
            idle_timeout,
            max_connections,
        ));

        let shutdown_tx_clone = shutdown_tx.clone();
        tokio::spawn(async move {
            let msg = shutdown_signal().await;
            let _ = shutdown_tx_clone.send(msg);
        });

        let serve_result = server.serve(listener, shutdown_rx.clone()).await;
        control.stop();
        serve_result.map_err(|e| -> Box<dyn std::error::Error> { e.into() })?;
        Ok::<(), Box<dyn std::error::Error>>(())
    })?;
    Ok(())
}
