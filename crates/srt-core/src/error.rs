//! Error handling for srtctl
//!
//! Provides the error type shared by the planning and configuration layers.

/// Result type alias for srt-core operations
pub type Result<T> = std::result::Result<T, Error>;

/// Error type for configuration loading and resource planning
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// Invalid or inconsistent configuration
    #[error("Configuration error: {0}")]
    InvalidConfiguration(String),

    /// The node pool cannot satisfy the requested resources
    #[error("Insufficient resources: {0}")]
    InsufficientResources(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// YAML parsing errors
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// JSON parsing errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Self::InvalidConfiguration(msg.into())
    }

    /// Create an insufficient resources error
    pub fn insufficient(msg: impl Into<String>) -> Self {
        Self::InsufficientResources(msg.into())
    }

    /// Get the error category for logging
    pub fn category(&self) -> &'static str {
        match self {
            Self::InvalidConfiguration(_) => "configuration",
            Self::InsufficientResources(_) => "resources",
            Self::Io(_) => "io",
            Self::Yaml(_) | Self::Json(_) => "serialization",
        }
    }

    /// Planning errors are deterministic and never worth retrying
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::Io(_))
    }
}
