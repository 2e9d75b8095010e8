//! Error types for the frame pipeline

use thiserror::Error;

/// Convenience alias for results using the pipeline error type.
pub type Result<T> = std::result::Result<T, PipelineError>;

#[derive(Error, Debug)]
pub enum PipelineError {
    /// Construction-time misconfiguration. Never retried internally.
    #[error("Invalid configuration: {0}")]
    InvalidConfiguration(String),

    /// The buffer or pipeline shut down while the operation was pending.
    #[error("Pipeline is closed")]
    Closed,

    #[error("Invalid state: {0}")]
    InvalidState(&'static str),

    #[error("Transform failed for frame {sequence}: {source}")]
    TransformFailure {
        sequence: u64,
        #[source]
        source: TransformError,
    },

    /// Frame displaced from the buffer before any worker picked it up.
    #[error("Frame {sequence} was evicted before processing")]
    Evicted { sequence: u64 },

    #[error("Shutdown deadline elapsed with {abandoned} worker(s) still running")]
    ShutdownTimedOut { joined: usize, abandoned: usize },

    #[error("Configuration error: {0}")]
    Config(#[from] config::ConfigError),

    #[error("Failed to spawn thread: {0}")]
    Spawn(#[from] std::io::Error),
}

/// Per-frame processing failure reported by a transform.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum TransformError {
    #[error("{0}")]
    Failed(String),

    #[error("transform panicked: {0}")]
    Panicked(String),
}

impl TransformError {
    pub fn failed(reason: impl Into<String>) -> Self {
        Self::Failed(reason.into())
    }
}
