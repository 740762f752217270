//! Error types for Conclave core operations

/// Result type for Conclave core operations
pub type Result<T> = std::result::Result<T, ConclaveError>;

/// Error types shared by the protocol, metrics and configuration layers
#[derive(Debug, thiserror::Error)]
pub enum ConclaveError {
    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Control-socket protocol violation
    #[error("Protocol error: {0}")]
    Protocol(String),

    /// Metric recorded against an incompatible registration
    #[error("Metrics error: {0}")]
    Metrics(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// IO error
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Generic error
    #[error("{0}")]
    Other(String),
}

impl From<String> for ConclaveError {
    fn from(s: String) -> Self {
        ConclaveError::Other(s)
    }
}

impl From<&str> for ConclaveError {
    fn from(s: &str) -> Self {
        ConclaveError::Other(s.to_string())
    }
}

impl From<anyhow::Error> for ConclaveError {
    fn from(err: anyhow::Error) -> Self {
        ConclaveError::Other(err.to_string())
    }
}
