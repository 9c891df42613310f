pub mod proxy_cli_args;
pub mod proxy_server;

pub use proxy_server::GateServer;
