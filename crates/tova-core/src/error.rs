//! Unified error types for tova

use thiserror::Error;

/// Errors reported by the overlay control link
///
/// Variants split into retryable transport conditions and structural
/// rejections; see [`ControlError::is_retryable`].
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ControlError {
    /// Control socket could not be opened or was lost
    #[error("control socket error: {0}")]
    Socket(String),

    /// Consensus or relay descriptor is not available yet
    #[error("descriptor unavailable: {0}")]
    DescriptorUnavailable(String),

    /// Request was malformed or not permitted in the current state
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// Request referenced an unknown circuit, stream or relay
    #[error("invalid arguments: {0}")]
    InvalidArguments(String),

    /// Circuit could not be extended to the requested hop
    #[error("circuit extension failed: {0}")]
    ExtensionFailed(String),

    #[error("control request timed out: {0}")]
    Timeout(String),

    /// Generic "operation failed" reply
    #[error("operation failed: {0}")]
    OperationFailed(String),

    /// Reply could not be parsed
    #[error("control protocol error: {0}")]
    Protocol(String),

    #[error("authentication failed: {0}")]
    Authentication(String),
}

impl ControlError {
    /// Whether the failure is transient and the same call may succeed later
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            Self::Socket(_) | Self::DescriptorUnavailable(_) | Self::Timeout(_)
        )
    }

    /// Whether the request itself was refused by the overlay client
    pub fn is_rejection(&self) -> bool {
        matches!(
            self,
            Self::InvalidRequest(_)
                | Self::InvalidArguments(_)
                | Self::ExtensionFailed(_)
                | Self::OperationFailed(_)
        )
    }
}

/// Configuration errors, always naming the offending variable
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    #[error("missing env var: {0}")]
    Missing(String),

    #[error("invalid env var: {var}={value:?} is not an integer")]
    Invalid { var: String, value: String },

    #[error("invalid env var: {var}={value} ({reason})")]
    OutOfRange {
        var: String,
        value: i64,
        reason: String,
    },
}

/// Unified error type for all tova operations
#[derive(Error, Debug)]
pub enum TovaError {
    #[error(transparent)]
    Control(#[from] ControlError),

    #[error(transparent)]
    Config(#[from] ConfigError),

    #[error("Registry error: {0}")]
    Registry(String),

    #[error("Session error: {0}")]
    Session(String),

    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("{0}")]
    Other(String),
}

/// Result type alias using TovaError
pub type Result<T> = std::result::Result<T, TovaError>;
