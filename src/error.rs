//! Error types for the proxier.

use thiserror::Error;

/// Boxed error returned by pluggable components such as tunnel transports.
pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

/// Result type for proxier operations.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors surfaced by the proxier.
#[derive(Debug, Error)]
pub enum Error {
    /// The proxier has not finished setting up, or has already stopped.
    #[error("proxier not running")]
    NotRunning,

    /// `start` was called on a proxier that is already running or stopped.
    #[error("proxier already started")]
    AlreadyStarted,

    /// The tunnel transport could not be constructed.
    #[error("failed to set up tunnel transport: {0}")]
    Setup(#[source] BoxError),

    /// A pipeline task terminated abnormally.
    #[error("{task} task failed: {source}")]
    Task {
        /// Name of the task that failed.
        task: &'static str,
        /// The join error reported by the runtime.
        #[source]
        source: tokio::task::JoinError,
    },
}
