use crate::policy::config::PolicyConfig;

use clap::Parser;
use std::path::PathBuf;
use std::time::Duration;

#[derive(Parser, Debug, Clone)]
#[clap(
    name = "sqlgate",
    version = "0.1.0",
    about = "transparent MySQL access-control proxy"
)]
pub struct ProxyServerArgs {
    #[clap(long, value_name = "WORKERS", env = "SQLGATE_WORKERS", default_value_t = 4)]
    pub workers: usize,
    #[clap(
        long,
        value_name = "ADDR",
        env = "SQLGATE_LISTEN_ADDR",
        default_value = "0.0.0.0"
    )]
    pub listen_addr: String,
    #[clap(long, value_name = "PORT", env = "SQLGATE_LISTEN_PORT", default_value_t = 3310)]
    pub port: u16,
    #[clap(
        long,
        value_name = "HOST",
        env = "SQLGATE_UPSTREAM_HOST",
        default_value = "127.0.0.1"
    )]
    pub upstream_host: String,
    #[clap(
        long,
        value_name = "PORT",
        env = "SQLGATE_UPSTREAM_PORT",
        default_value_t = 3306
    )]
    pub upstream_port: u16,
    #[clap(long, value_name = "FILE", env = "SQLGATE_POLICY_PATH")]
    pub policy_path: PathBuf,
    #[clap(
        long,
        value_name = "SOCKET",
        env = "SQLGATE_CONTROL_SOCKET",
        default_value = "/tmp/sqlgate-control.sock"
    )]
    pub control_socket: PathBuf,
    #[clap(long, value_name = "HTTP_PORT", env = "SQLGATE_HEALTH_PORT", default_value_t = 9000)]
    pub http_port: u16,
    #[clap(long, value_name = "LOG_LEVEL", env = "SQLGATE_LOG_LEVEL")]
    pub log_level: Option<String>,
    /// Overrides the policy file's global.max_connections when set.
    #[clap(long, value_name = "MAX", env = "SQLGATE_MAX_CONNECTIONS")]
    pub max_connections: Option<usize>,
    /// Overrides the policy file's global.connection_timeout when set.
    #[clap(long, value_name = "SECONDS", env = "SQLGATE_IDLE_TIMEOUT")]
    pub idle_timeout: Option<u64>,
    #[clap(long, value_name = "ENABLE METRICS COLLECTOR", env = "SQLGATE_ENABLE_METRICS", default_value_t = false)]
    pub enable_metrics: bool,
}

impl ProxyServerArgs {
    pub fn listen_on(&self) -> String {
        format!("{}:{}", self.listen_addr, self.port)
    }

    pub fn effective_max_connections(&self, config: &PolicyConfig) -> usize {
        self.max_connections
            .unwrap_or(config.global.max_connections)
    }

    pub fn effective_idle_timeout(&self, config: &PolicyConfig) -> Duration {
        Duration::from_secs(
            self.idle_timeout
                .unwrap_or(config.global.connection_timeout),
        )
    }
}
