/// MySQL server error codes the proxy synthesizes itself. Only the handful
/// the data path emits are listed; relayed server errors pass through
/// untouched.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u16)]
#[allow(non_camel_case_types)]
pub enum ErrorKind {
    ER_ACCESS_DENIED_ERROR = 1045,
    ER_UNKNOWN_COM_ERROR = 1047,
    ER_PARSE_ERROR = 1064,
    ER_UNKNOWN_ERROR = 1105,
    ER_NET_PACKET_TOO_LARGE = 1153,
}

impl ErrorKind {
    /// All synthesized errors use the generic unhandled-exception state;
    /// the real per-code sql states belong to the upstream server.
    pub fn sqlstate(&self) -> &'static [u8] {
        b"HY000"
    }

    pub fn code(&self) -> u16 {
        *self as u16
    }
}
