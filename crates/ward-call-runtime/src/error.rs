use thiserror::Error;
use ward_call_store::CallStoreError;
use ward_call_types::CallStatus;

/// Errors surfaced by dispatch and response operations.
#[derive(Debug, Error)]
pub enum CallError {
    #[error("invalid argument: {0}")]
    InvalidArgument(String),
    #[error("unauthorized: {0}")]
    Unauthorized(String),
    #[error("not found: {0}")]
    NotFound(String),
    #[error("call store failure: {0}")]
    Store(#[from] CallStoreError),
    #[error("identity resolution failed: {0}")]
    Identity(#[source] anyhow::Error),
}

/// Result of an accept or reject attempt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ResponseOutcome {
    /// This caller won the transition.
    Applied {
        status: CallStatus,
        /// Siblings cancelled as a consequence of a winning accept.
        cancelled_siblings: Vec<String>,
    },
    /// Another writer already resolved the attempt; nothing changed.
    AlreadyResolved { status: CallStatus },
}

impl ResponseOutcome {
    pub fn is_applied(&self) -> bool {
        matches!(self, Self::Applied { .. })
    }

    pub fn status(&self) -> CallStatus {
        match self {
            Self::Applied { status, .. } | Self::AlreadyResolved { status } => *status,
        }
    }
}

/// Recipients actually moved to `cancelled` by one cancel request.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CancelOutcome {
    pub cancelled: Vec<String>,
}
