use thiserror::Error;

/// Error taxonomy for the data path. Parse-side failures keep their
/// category so the policy layer can fail closed with a stable reason
/// string while the client only ever sees a generic ERR packet.
#[derive(Debug, Error)]
pub enum ProxyError {
    #[error("malformed packet: {0}")]
    MalformedPacket(String),

    #[error("invalid sql: {0}")]
    InvalidSql(String),

    #[error("unsupported command: {0}")]
    UnsupportedCommand(String),

    #[error("internal error: {0}")]
    InternalError(String),

    #[error("policy load failure: {0}")]
    PolicyLoadFailure(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),
}

impl ProxyError {
    /// True for the parse-side categories that the command loop converts
    /// into a blocked query instead of tearing the session down.
    pub fn is_parse_error(&self) -> bool {
        matches!(
            self,
            ProxyError::MalformedPacket(_)
                | ProxyError::InvalidSql(_)
                | ProxyError::UnsupportedCommand(_)
                | ProxyError::InternalError(_)
        )
    }
}
