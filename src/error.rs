//! Logship Error Types

use thiserror::Error;

/// Result type alias for Logship operations
pub type Result<T> = std::result::Result<T, Error>;

/// Logship error types
#[derive(Error, Debug)]
pub enum Error {
    // Configuration errors
    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid configuration file: {0}")]
    ConfigParse(#[from] toml::de::Error),

    // Schema / row codec errors
    #[error("Schema error: {0}")]
    Schema(String),

    #[error("Row encoding error: {0}")]
    Row(String),

    // Naming errors
    #[error("Filename template error: {0}")]
    Template(String),

    #[error("Invalid bucket timestamp '{input}': {reason}")]
    Timestamp { input: String, reason: String },

    // Disk errors
    #[error("Disk backend error: {0}")]
    Disk(String),

    // Protocol errors
    #[error("Protocol error: {0}")]
    Protocol(String),

    #[error("Unsupported protocol version {0}")]
    UnsupportedProtocolVersion(u16),

    #[error("Message serialization error: {0}")]
    Serialization(#[from] bincode::Error),

    #[error("Message rejected by collector: {0}")]
    Rejected(String),

    // Network errors
    #[error("Network error: {0}")]
    Network(String),

    #[error("Connection failed to {address}: {reason}")]
    ConnectionFailed { address: String, reason: String },

    #[error("Connection timeout to {0}")]
    ConnectionTimeout(String),

    // State errors
    #[error("State error: {0}")]
    State(String),

    #[error("Control state corrupted: {0}")]
    StateCorrupted(#[from] serde_json::Error),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // Internal errors
    #[error("Internal error: {0}")]
    Internal(String),

    #[error("Shutdown in progress")]
    ShuttingDown,
}

impl Error {
    /// Check if this error is retryable
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Error::ConnectionTimeout(_)
                | Error::ConnectionFailed { .. }
                | Error::Network(_)
                | Error::Io(_)
        )
    }
}
