use thiserror::Error;

/// Errors surfaced by the messaging core.
///
/// Network failures during a send never appear here during normal operation;
/// the dispatcher converts them into a `DeliveryState` instead.
#[derive(Debug, Error)]
pub enum TorlineError {
    #[error("Identity error: {0}")]
    IdentityError(String),

    #[error("Transport unavailable: {0}")]
    TransportUnavailable(String),

    #[error("Crypto error: {0}")]
    CryptoError(String),

    #[error("Network failure: {0}")]
    NetworkFailure(String),

    #[error("Server error: {0}")]
    ServerError(String),

    #[error("Configuration error: {0}")]
    ConfigError(String),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TorlineError {
    fn from(e: config::ConfigError) -> Self {
        TorlineError::ConfigError(e.to_string())
    }
}

pub type Result<T> = std::result::Result<T, TorlineError>;
