use thiserror::Error;

use crate::network::RadioError;

/// Custom error types for the FUOTA session layer
#[derive(Error, Debug)]
pub enum Error {
    #[error("Radio error: {0}")]
    Radio(#[from] RadioError),

    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Storage error: {0}")]
    Storage(String),

    #[error("Timing error: {0}")]
    Timing(String),

    #[error("Invalid state: {0}")]
    InvalidState(String),

    #[error("Initialization error: {0}")]
    Init(String),
}

/// Result type alias using our custom Error type
pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Creates a new protocol error
    pub fn protocol(msg: impl Into<String>) -> Self {
        Error::Protocol(msg.into())
    }

    /// Creates a new configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Creates a new storage error
    pub fn storage(msg: impl Into<String>) -> Self {
        Error::Storage(msg.into())
    }

    /// Creates a new timing error
    pub fn timing(msg: impl Into<String>) -> Self {
        Error::Timing(msg.into())
    }

    /// Creates a new invalid state error
    pub fn invalid_state(msg: impl Into<String>) -> Self {
        Error::InvalidState(msg.into())
    }

    /// Creates a new initialization error
    pub fn init(msg: impl Into<String>) -> Self {
        Error::Init(msg.into())
    }

    /// Whether the error came from the radio and is worth retrying later
    pub fn is_transient(&self) -> bool {
        matches!(
            self,
            Error::Radio(
                RadioError::WouldBlock
                    | RadioError::Busy
                    | RadioError::Timeout
                    | RadioError::NoActiveSessions
            )
        )
    }
}
