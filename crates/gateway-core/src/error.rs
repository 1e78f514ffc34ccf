use gateway_protocol::CloseCode;

/// Error kinds per §7. These classify failure, not implementation —
/// `Transient` failures are logged and swallowed by callers; the rest close
/// the connection or tear down the `Hub::run` loop.
#[derive(Debug, thiserror::Error)]
pub enum GatewayError {
    #[error("protocol violation: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Auth(String),

    #[error("resume impossible: {0}")]
    ResumeImpossible(String),

    #[error("overloaded: {0}")]
    Overload(String),

    #[error("transient failure: {0}")]
    Transient(String),

    #[error("fatal: {0}")]
    Fatal(String),
}

impl GatewayError {
    /// Maps a connection-terminating error to its close code. `Transient`
    /// and `Fatal` have no wire representation — the caller never closes a
    /// socket over a transient error, and a fatal error ends `Hub::run`
    /// rather than any one connection.
    pub fn close_code(&self) -> Option<CloseCode> {
        match self {
            Self::Protocol(_) => Some(CloseCode::DecodeError),
            Self::Auth(_) => Some(CloseCode::AuthFailed),
            Self::ResumeImpossible(_) => None, // InvalidSession(false), not a close
            Self::Overload(_) => Some(CloseCode::UnknownError),
            Self::Transient(_) | Self::Fatal(_) => None,
        }
    }
}

pub type Result<T> = std::result::Result<T, GatewayError>;
