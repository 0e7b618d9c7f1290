//! Error types for the block engine

use thiserror::Error;

/// Result type alias using EngineError
pub type Result<T> = std::result::Result<T, EngineError>;

/// Errors that can occur in the block engine
///
/// Graph problems are not represented here: validation returns a
/// [`ValidationReport`](crate::graph::ValidationReport) instead of failing.
#[derive(Debug, Error)]
pub enum EngineError {
    /// Batch input was rejected before any job was created
    #[error("Invalid batch: {0}")]
    InvalidBatch(String),

    /// A batch is already processing on this queue
    #[error("A batch is already running")]
    BatchAlreadyRunning,

    /// Command needs an active batch but there is none
    #[error("No active batch")]
    NoActiveBatch,

    /// The generation callback failed for one job
    #[error("Generation failed: {0}")]
    Generation(String),

    /// Fetching or writing one artifact failed
    #[error("Download failed: {0}")]
    Download(String),

    /// The request was cancelled by the user
    #[error("Cancelled by user")]
    Cancelled,

    /// Execution record lookup failed
    #[error("Execution not found: {0}")]
    ExecutionNotFound(String),

    /// Execution record already reached a terminal status
    #[error("Execution already finished: {0}")]
    ExecutionFinished(String),

    /// Download item lookup failed
    #[error("Download item not found: {0}")]
    DownloadNotFound(String),

    /// Configuration value out of range
    #[error("Invalid configuration: {0}")]
    Config(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// HTTP client error
    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),
}

impl EngineError {
    /// Create a generation error with a message
    pub fn generation(msg: impl Into<String>) -> Self {
        Self::Generation(msg.into())
    }

    /// Create a download error with a message
    pub fn download(msg: impl Into<String>) -> Self {
        Self::Download(msg.into())
    }

    /// Create an invalid batch error with a message
    pub fn invalid_batch(msg: impl Into<String>) -> Self {
        Self::InvalidBatch(msg.into())
    }

    /// Whether this error came from a user cancellation
    pub fn is_cancelled(&self) -> bool {
        matches!(self, Self::Cancelled)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_messages() {
        assert_eq!(
            EngineError::invalid_batch("no valid items").to_string(),
            "Invalid batch: no valid items"
        );
        assert_eq!(EngineError::Cancelled.to_string(), "Cancelled by user");
        assert!(EngineError::Cancelled.is_cancelled());
        assert!(!EngineError::generation("boom").is_cancelled());
    }
}
