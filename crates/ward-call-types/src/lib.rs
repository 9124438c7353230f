//! Shared data types for Ward call dispatch and response tracking.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a status transition is invalid.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StatusTransitionError {
    #[error("invalid call status transition: {from} -> {to}")]
    Invalid { from: CallStatus, to: CallStatus },
}

/// Error returned when a persisted or submitted status label is unknown.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("unknown call status '{0}'")]
pub struct UnknownCallStatus(pub String);

/// Lifecycle state for one recipient of a call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum CallStatus {
    #[default]
    Pending,
    Accepted,
    Rejected,
    Timeout,
    Cancelled,
}

impl CallStatus {
    pub const TERMINAL: [CallStatus; 4] = [
        CallStatus::Accepted,
        CallStatus::Rejected,
        CallStatus::Timeout,
        CallStatus::Cancelled,
    ];

    /// Returns true when this status can transition to `next`.
    ///
    /// Only `pending` moves, and only into a terminal status. Re-applying the
    /// current status is not a transition: the first terminal write wins.
    pub fn can_transition_to(self, next: Self) -> bool {
        self == Self::Pending && next.is_terminal()
    }

    /// Returns an error if transitioning to `next` is not allowed.
    pub fn ensure_transition(self, next: Self) -> Result<(), StatusTransitionError> {
        if self.can_transition_to(next) {
            return Ok(());
        }
        Err(StatusTransitionError::Invalid {
            from: self,
            to: next,
        })
    }

    /// Returns true when no further response is expected.
    pub fn is_terminal(self) -> bool {
        !matches!(self, Self::Pending)
    }

    pub fn as_str(self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Accepted => "accepted",
            Self::Rejected => "rejected",
            Self::Timeout => "timeout",
            Self::Cancelled => "cancelled",
        }
    }
}

impl fmt::Display for CallStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for CallStatus {
    type Err = UnknownCallStatus;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        match value.trim() {
            "pending" => Ok(Self::Pending),
            "accepted" => Ok(Self::Accepted),
            "rejected" => Ok(Self::Rejected),
            "timeout" => Ok(Self::Timeout),
            "cancelled" => Ok(Self::Cancelled),
            other => Err(UnknownCallStatus(other.to_string())),
        }
    }
}

/// One (call, recipient) pair and its independent response status.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttempt {
    pub call_id: String,
    pub from_identifier: String,
    pub to_identifier: String,
    pub organization_id: Option<String>,
    pub message: Option<String>,
    pub attachment_ref: Option<String>,
    pub status: CallStatus,
    pub created_at: DateTime<Utc>,
    pub accepted_at: Option<DateTime<Utc>>,
    pub rejected_at: Option<DateTime<Utc>>,
    pub resolved_at: Option<DateTime<Utc>>,
}

impl CallAttempt {
    /// Applies a terminal status and stamps the matching timestamps.
    ///
    /// Callers must have checked `status.can_transition_to(next)` first.
    pub fn resolve(&mut self, next: CallStatus, at: DateTime<Utc>) {
        self.status = next;
        self.resolved_at = Some(at);
        match next {
            CallStatus::Accepted => self.accepted_at = Some(at),
            CallStatus::Rejected => self.rejected_at = Some(at),
            _ => {}
        }
    }
}

/// Batch of pending attempts to persist for a freshly placed call.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NewCall {
    pub call_id: String,
    pub from_identifier: String,
    pub organization_id: Option<String>,
    pub targets: Vec<String>,
    pub message: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl NewCall {
    /// Expands the batch into one pending attempt per target, in target order.
    pub fn attempts(&self) -> Vec<CallAttempt> {
        self.targets
            .iter()
            .map(|target| CallAttempt {
                call_id: self.call_id.clone(),
                from_identifier: self.from_identifier.clone(),
                to_identifier: target.clone(),
                organization_id: self.organization_id.clone(),
                message: self.message.clone(),
                attachment_ref: self.attachment_ref.clone(),
                status: CallStatus::Pending,
                created_at: self.created_at,
                accepted_at: None,
                rejected_at: None,
                resolved_at: None,
            })
            .collect()
    }
}

/// Filter used when listing attempts for reporting.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallAttemptQuery {
    pub call_id: Option<String>,
    pub from_identifier: Option<String>,
    pub to_identifier: Option<String>,
    pub organization_id: Option<String>,
    pub statuses: Option<Vec<CallStatus>>,
    pub created_after: Option<DateTime<Utc>>,
    pub created_before: Option<DateTime<Utc>>,
    #[serde(default)]
    pub offset: usize,
    pub limit: Option<usize>,
}

impl CallAttemptQuery {
    /// Returns true when `attempt` satisfies every populated filter.
    pub fn matches(&self, attempt: &CallAttempt) -> bool {
        self.call_id
            .as_ref()
            .is_none_or(|call_id| call_id == &attempt.call_id)
            && self
                .from_identifier
                .as_ref()
                .is_none_or(|from| from == &attempt.from_identifier)
            && self
                .to_identifier
                .as_ref()
                .is_none_or(|to| to == &attempt.to_identifier)
            && self
                .organization_id
                .as_ref()
                .is_none_or(|org| attempt.organization_id.as_ref() == Some(org))
            && self
                .statuses
                .as_ref()
                .is_none_or(|statuses| statuses.contains(&attempt.status))
            && self
                .created_after
                .is_none_or(|after| attempt.created_at >= after)
            && self
                .created_before
                .is_none_or(|before| attempt.created_at < before)
    }
}

/// Payload pushed to a recipient when a call reaches them.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CallNotification {
    pub call_id: String,
    pub from_identifier: String,
    pub to_identifier: String,
    pub message: Option<String>,
    pub attachment_ref: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl From<&CallAttempt> for CallNotification {
    fn from(attempt: &CallAttempt) -> Self {
        Self {
            call_id: attempt.call_id.clone(),
            from_identifier: attempt.from_identifier.clone(),
            to_identifier: attempt.to_identifier.clone(),
            message: attempt.message.clone(),
            attachment_ref: attempt.attachment_ref.clone(),
            created_at: attempt.created_at,
        }
    }
}

/// What drove an attempt into its terminal status.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionCause {
    Accepted,
    Rejected,
    TimedOut,
    CancelledBySender,
    ClaimedByOther,
}

impl ResolutionCause {
    pub fn status(self) -> CallStatus {
        match self {
            Self::Accepted => CallStatus::Accepted,
            Self::Rejected => CallStatus::Rejected,
            Self::TimedOut => CallStatus::Timeout,
            Self::CancelledBySender | Self::ClaimedByOther => CallStatus::Cancelled,
        }
    }

    /// Human-readable notice shown to recipients and bot users.
    pub fn notice(self) -> &'static str {
        match self {
            Self::Accepted => "call accepted",
            Self::Rejected => "call rejected",
            Self::TimedOut => "call timed out without a response",
            Self::CancelledBySender => "call cancelled by the sender",
            Self::ClaimedByOther => "call already taken by another recipient",
        }
    }
}

/// One authoritative status transition, emitted exactly once to observers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusChange {
    pub call_id: String,
    pub from_identifier: String,
    pub to_identifier: String,
    pub status: CallStatus,
    pub cause: ResolutionCause,
    pub organization_scope: Option<String>,
    pub occurred_at: DateTime<Utc>,
}
