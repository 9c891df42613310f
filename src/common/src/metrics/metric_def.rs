pub const PROXY_CONN_TOTAL: &str = "proxy_connections_total";
pub const PROXY_CURR_CONN: &str = "proxy_curr_connections";
pub const PROXY_MAX_CONN: &str = "proxy_max_connections";
pub const PROXY_QUERIES_TOTAL: &str = "proxy_queries_total";
pub const PROXY_BLOCKED_QUERIES: &str = "proxy_blocked_queries_total";
pub const PROXY_COM_LATENCY: &str = "proxy_com_latency";

#[macro_export]
macro_rules! metrics_const {
    ($({$metric_name:ident, $init_fn:ident, $metric_type:expr, $name:expr, $desc:expr}),*) => {
        use metrics::KeyName;
        use std::sync::OnceLock;
        use $crate::metrics::MetricType;

        #[derive(Debug, Clone)]
        pub enum MetricsConsts {
           $($metric_name(&'static str, &'static str, KeyName, MetricType),)*
        }

        pub fn list_all_metrics() -> &'static Vec<MetricsConsts> {
           static ALL_METRICS: OnceLock<Vec<MetricsConsts>> = OnceLock::new();
           ALL_METRICS.get_or_init(|| {
              vec![$(MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type),)*]
           })
        }

        impl MetricsConsts {
            $(
            #[inline]
            pub fn $init_fn() -> Self {
                MetricsConsts::$metric_name($name, $desc, KeyName::from_const_str($name), $metric_type)
            })*

            pub fn get_name(&self) -> String {
                let (name, _,_,_) = self.get_metrics_pair();
                name.to_string()
            }

            pub fn get_metrics_pair(&self) -> (&'static str, &'static str, &KeyName, &MetricType){
                match self {
                    $(
                    MetricsConsts::$metric_name(name, desc, key_name, metrics_type) => (name, desc, key_name, metrics_type),
                    )*
                }
            }
        }
    };
}

metrics_const!(
    { ProxyConnectionsTotal, connections_total, MetricType::Counter, PROXY_CONN_TOTAL, "Total client connections accepted by the proxy."},
    { ProxyCurrentConnections, current_connections, MetricType::Gauge, PROXY_CURR_CONN, "The current connection count by the proxy."},
    { ProxyMaxConnections, max_connections, MetricType::Gauge, PROXY_MAX_CONN, "The max number of connections allowed by the proxy."},
    { ProxyQueriesTotal, queries_total, MetricType::Counter, PROXY_QUERIES_TOTAL, "Total COM_QUERY commands evaluated."},
    { ProxyBlockedQueries, blocked_queries, MetricType::Counter, PROXY_BLOCKED_QUERIES, "Queries refused by policy or injection screening."},
    { ProxyComLatency, com_latency, MetricType::Histogram, PROXY_COM_LATENCY, "Latency of command execution."}
);
