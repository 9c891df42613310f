use crate::http_handler::*;

use anyhow::anyhow;
use axum::routing::get;
use axum::Router;
use proxy::stats::StatsCollector;
use std::future::Future;
use std::sync::Arc;
use tower_http::trace::{DefaultMakeSpan, TraceLayer};

pub struct GateRest;

/// State for the health handler: liveness flips on the session gauge
/// against the configured ceiling.
#[derive(Clone)]
pub struct GateRestState {
    pub stats: Arc<StatsCollector>,
    pub max_connections: usize,
}

impl GateRest {
    pub async fn start_server<F>(
        addr: String,
        port: u16,
        enable_metric: bool,
        state: GateRestState,
        shutdown: F,
    ) -> anyhow::Result<()>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        let mut app = Router::new()
            .route("/", get("Hi I'm SqlGateREST"))
            .route("/health", get(health_get))
            .with_state(state);

        if enable_metric {
            app = app.merge(route_metrics(MetricsHandler {}));
        }

        app = app.layer(TraceLayer::new_for_http().make_span_with(DefaultMakeSpan::new()));
        let listener = tokio::net::TcpListener::bind(format!("{addr}:{port}")).await?;

        match axum::serve(listener, app.into_make_service())
            .with_graceful_shutdown(shutdown)
            .await
        {
            Ok(_) => Ok(()),
            Err(e) => {
                tracing::error!("Failed to start GateRest {e:?}");
                Err(anyhow!(e.to_string()))
            }
        }
    }
}
