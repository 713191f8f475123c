//! Error types for the scheduler.

use thiserror::Error;

/// A result type using `SchedulerError`.
pub type Result<T> = std::result::Result<T, SchedulerError>;

/// Errors that can occur during reconciliation.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Storage layer error.
    #[error("storage error: {0}")]
    Store(#[from] stark_store::StoreError),

    /// The placement sink rejected an action.
    #[error("placement action failed: {0}")]
    Sink(#[from] stark_core::CoreError),

    /// Invalid configuration.
    #[error("scheduler config: {0}")]
    Config(String),

    /// An unexpected internal failure.
    #[error("internal scheduler error: {0}")]
    Internal(String),
}
