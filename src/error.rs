use thiserror::Error;

/// Unified error type for the relay
#[derive(Error, Debug)]
pub enum RelayError {
    // Upstream errors
    #[error("Upstream connect failed: {0}")]
    Connect(String),

    #[error("Upstream TLS handshake failed: {0}")]
    SecureWrap(String),

    #[error("Send to upstream failed: {0}")]
    Send(String),

    #[error("Receive from upstream failed: {0}")]
    Receive(String),

    // Strategy chain errors
    #[error("All strategies exhausted after {attempts} attempts")]
    AllStrategiesExhausted { attempts: u32 },

    #[error("No strategy supports protocol {0}")]
    UnsupportedProtocol(String),

    // Configuration errors
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Invalid upstream address: {0}")]
    InvalidUpstreamAddress(String),

    // Request errors
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    // I/O errors
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),
}

/// Result type alias for relay operations
pub type Result<T> = std::result::Result<T, RelayError>;

impl RelayError {
    /// Whether the controller may retry this connection with another strategy
    pub fn is_recoverable(&self) -> bool {
        matches!(
            self,
            RelayError::Connect(_)
                | RelayError::SecureWrap(_)
                | RelayError::Send(_)
                | RelayError::Receive(_)
        )
    }
}

// Convert from URL parse errors
impl From<url::ParseError> for RelayError {
    fn from(err: url::ParseError) -> Self {
        RelayError::InvalidUpstreamAddress(err.to_string())
    }
}

impl From<httparse::Error> for RelayError {
    fn from(err: httparse::Error) -> Self {
        RelayError::InvalidRequest(err.to_string())
    }
}
