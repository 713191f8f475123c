//! Error types for the agent.

use thiserror::Error;

use stark_core::CoreError;

/// A result type using `AgentError`.
pub type Result<T> = std::result::Result<T, AgentError>;

/// Errors that can occur inside the node agent.
#[derive(Debug, Error)]
pub enum AgentError {
    /// A core-taxonomy error (policy denial, timeout, transport loss...).
    #[error(transparent)]
    Core(#[from] CoreError),

    /// A worker isolate was addressed before it finished initializing.
    #[error("worker not initialized for pod {0}")]
    WorkerNotInitialized(stark_core::PodId),

    /// An isolate task was cancelled before completing.
    #[error("task cancelled")]
    TaskCancelled,

    /// An isolate task overran its deadline.
    #[error("task timed out after {elapsed_ms}ms")]
    TaskTimeout {
        /// Milliseconds elapsed at the deadline.
        elapsed_ms: u64,
    },

    /// The peer listener or an isolate process failed at the OS level.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// The agent's WebSocket to the orchestrator failed.
    #[error("session transport: {0}")]
    Transport(String),
}

impl AgentError {
    /// Fold into the core taxonomy for wire replies.
    #[must_use]
    pub fn to_core(&self) -> CoreError {
        match self {
            Self::Core(e) => e.clone(),
            Self::WorkerNotInitialized(pod) => {
                CoreError::Internal(format!("worker not initialized for pod {pod}"))
            }
            Self::TaskCancelled => CoreError::Cancelled,
            Self::TaskTimeout { elapsed_ms } => CoreError::Timeout {
                elapsed_ms: *elapsed_ms,
            },
            Self::Io(e) => CoreError::Internal(e.to_string()),
            Self::Transport(_) => CoreError::TransportClosed,
        }
    }
}
