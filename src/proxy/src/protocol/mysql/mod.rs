pub mod command;
pub mod constants;
pub mod error_codes;
pub mod handshake;
pub mod packet;
pub mod response;
