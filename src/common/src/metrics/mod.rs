pub mod metric_def;

use crate::metrics::metric_def::MetricsConsts;
use metrics::{describe_counter, describe_gauge, describe_histogram, Histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use parking_lot::RwLock;
use std::fmt;
use std::sync::{Arc, LazyLock, Once};
use tracing::{info, warn};

static DEFAULT_BUCKETS: &[f64; 26] = &[
    1e+2, 2e+2, 4e+2, 6e+2, 8e+2, 1e+3, 2e+3, 4e+3, 6e+3, 8e+3, 1e+4, 2e+4, 4e+4, 6e+4, 8e+4, 1e+5,
    2e+5, 4e+5, 6e+5, 8e+5, 1e+6, 2e+6, 4e+6, 6e+6, 8e+6, 1e+7,
];

const DEFAULT_QUANTILES: &[f64; 9] = &[0.0, 0.5, 0.7, 0.8, 0.9, 0.95, 0.99, 0.999, 1.0];

#[derive(Debug, Clone, Copy)]
pub enum MetricType {
    Gauge,
    Counter,
    Histogram,
}

static PROMETHEUS_HANDLE: LazyLock<Arc<RwLock<Option<PrometheusHandle>>>> =
    LazyLock::new(|| Arc::new(RwLock::new(None)));

pub fn init_metrics_context() {
    static START: Once = Once::new();
    START.call_once(init_metrics)
}

fn init_metrics() {
    let recorder = PrometheusBuilder::new()
        .set_quantiles(DEFAULT_QUANTILES)
        .expect("can't set quantiles")
        .set_buckets(DEFAULT_BUCKETS)
        .expect("can't set buckets")
        .build_recorder();
    let mut prometheus_handle = PROMETHEUS_HANDLE.as_ref().write();
    *prometheus_handle = Some(recorder.handle());
    match metrics::set_global_recorder(recorder) {
        Ok(_) => {
            describe_proxy_metrics();
            info!("SqlGate init prometheus metrics context successfully!");
        }
        Err(e) => {
            warn!(
                "SqlGate init prometheus metrics context error.cause by {:?}",
                e.to_string()
            );
        }
    }
}

fn describe_proxy_metrics() {
    for metric in metric_def::list_all_metrics().iter() {
        let (name, desc, _, metric_type) = metric.get_metrics_pair();
        match metric_type {
            MetricType::Gauge => describe_gauge!(name, desc),
            MetricType::Counter => describe_counter!(name, desc),
            MetricType::Histogram => describe_histogram!(name, desc),
        }
    }
}

pub fn try_handle() -> Option<PrometheusHandle> {
    PROMETHEUS_HANDLE.as_ref().read().clone()
}

pub fn common_labels() -> &'static Vec<(&'static str, String)> {
    static COMMON_LABELS: LazyLock<Vec<(&'static str, String)>> = LazyLock::new(|| {
        let host = std::env::var("HOSTNAME").unwrap_or_else(|_| "localhost".to_string());
        vec![("host", host), ("service", "sqlgate".to_string())]
    });
    &COMMON_LABELS
}

pub fn counter_inc(name: &'static str, value: u64) {
    metrics::counter!(name).increment(value);
}

pub fn gauge_inc(name: &'static str, value: f64) {
    metrics::gauge!(name).increment(value);
}

pub fn gauge_dec(name: &'static str, value: f64) {
    metrics::gauge!(name).decrement(value);
}

pub fn gauge_set(name: &'static str, value: f64) {
    metrics::gauge!(name).set(value);
}

/// Records elapsed milliseconds into its histogram when dropped, unless
/// `observe` already did.
pub struct MetricsTimer {
    start: coarsetime::Instant,
    histogram: Histogram,
    observed: bool,
}

impl MetricsTimer {
    pub fn new(name: &'static str) -> Self {
        MetricsTimer {
            start: coarsetime::Instant::now(),
            histogram: metrics::histogram!(name),
            observed: false,
        }
    }

    pub fn observe(&mut self) {
        self.observed = true;
        let elapsed = self.start.elapsed().as_millis();
        self.histogram.record(elapsed as f64);
    }
}

impl From<Histogram> for MetricsTimer {
    fn from(histogram: Histogram) -> MetricsTimer {
        MetricsTimer {
            start: coarsetime::Instant::now(),
            histogram,
            observed: false,
        }
    }
}

impl fmt::Debug for MetricsTimer {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("MetricsTimer")
            .field("start", &self.start)
            .field("observed", &self.observed)
            .finish()
    }
}

impl Drop for MetricsTimer {
    fn drop(&mut self) {
        if !self.observed {
            let elapsed = self.start.elapsed().as_millis();
            self.histogram.record(elapsed as f64);
        }
    }
}
