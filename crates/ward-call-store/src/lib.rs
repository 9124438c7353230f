//! Call record store abstractions and in-memory backend.
//!
//! Every racing response path (accept, reject, timeout, cancel) serializes
//! through [`CallStore::compare_and_set_status`] or
//! [`CallStore::set_terminal_for_all_pending`]; their return values are the sole
//! authority on which writer won.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::HashMap;
use thiserror::Error;
use tokio::sync::RwLock;

mod sqlite;

pub use sqlite::SqliteCallStore;
pub use ward_call_types::{
    CallAttempt, CallAttemptQuery, CallStatus, NewCall, StatusTransitionError,
};

/// Result type for call store operations.
pub type StoreResult<T> = Result<T, CallStoreError>;

/// Errors returned by store implementations.
#[derive(Debug, Error)]
pub enum CallStoreError {
    #[error("call '{0}' already exists")]
    CallAlreadyExists(String),
    #[error("call '{0}' has no recipients")]
    EmptyCall(String),
    #[error("call '{call_id}' lists recipient '{to_identifier}' more than once")]
    DuplicateRecipient {
        call_id: String,
        to_identifier: String,
    },
    #[error(transparent)]
    InvalidTransition(#[from] StatusTransitionError),
    #[error("invalid persisted value for '{field}': {value}")]
    InvalidPersistedValue { field: &'static str, value: String },
    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),
    #[error(transparent)]
    Chrono(#[from] chrono::ParseError),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

/// Outcome of a winning [`CallStore::accept_exclusive`].
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ExclusiveAccept {
    /// The accepted row as it was before the update.
    pub previous: CallAttempt,
    /// Siblings moved from `pending` to `cancelled`, in insertion order.
    pub cancelled_siblings: Vec<String>,
}

/// Async store contract used by the dispatcher and the response reconciler.
#[async_trait]
pub trait CallStore: Send + Sync {
    /// Inserts one pending attempt per target as a single all-or-nothing batch.
    async fn create_attempts(&self, call: NewCall) -> StoreResult<Vec<CallAttempt>>;

    /// Atomically moves one attempt from `expected` to `next`.
    ///
    /// Returns the row as it was before the update, or `None` when the row is
    /// missing or no longer in `expected`.
    async fn compare_and_set_status(
        &self,
        call_id: &str,
        to_identifier: &str,
        expected: CallStatus,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<CallAttempt>>;

    /// Moves every still-pending attempt of a call to `next`, returning the
    /// recipients actually transitioned.
    async fn set_terminal_for_all_pending(
        &self,
        call_id: &str,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<String>>;

    /// Atomically accepts one pending attempt and cancels every other pending
    /// attempt of the same call.
    ///
    /// Returns `None` when the attempt is missing or no longer pending, in
    /// which case nothing changes.
    async fn accept_exclusive(
        &self,
        call_id: &str,
        to_identifier: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExclusiveAccept>>;

    async fn find_by_call_id(&self, call_id: &str) -> StoreResult<Vec<CallAttempt>>;

    async fn find_pending_by_call_id(&self, call_id: &str) -> StoreResult<Vec<CallAttempt>> {
        Ok(self
            .find_by_call_id(call_id)
            .await?
            .into_iter()
            .filter(|attempt| attempt.status == CallStatus::Pending)
            .collect())
    }

    async fn query_attempts(&self, query: CallAttemptQuery) -> StoreResult<Vec<CallAttempt>>;
}

fn validate_new_call(call: &NewCall) -> StoreResult<()> {
    if call.targets.is_empty() {
        return Err(CallStoreError::EmptyCall(call.call_id.clone()));
    }
    for (index, target) in call.targets.iter().enumerate() {
        if call.targets[..index].contains(target) {
            return Err(CallStoreError::DuplicateRecipient {
                call_id: call.call_id.clone(),
                to_identifier: target.clone(),
            });
        }
    }
    Ok(())
}

/// In-memory implementation for tests and single-process deployments.
#[derive(Debug, Default)]
pub struct InMemoryCallStore {
    inner: RwLock<StoreInner>,
}

#[derive(Debug, Default)]
struct StoreInner {
    attempts_by_call: HashMap<String, Vec<CallAttempt>>,
    call_order: Vec<String>,
}

impl InMemoryCallStore {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl CallStore for InMemoryCallStore {
    async fn create_attempts(&self, call: NewCall) -> StoreResult<Vec<CallAttempt>> {
        validate_new_call(&call)?;
        let mut inner = self.inner.write().await;
        if inner.attempts_by_call.contains_key(&call.call_id) {
            return Err(CallStoreError::CallAlreadyExists(call.call_id));
        }

        let attempts = call.attempts();
        inner.call_order.push(call.call_id.clone());
        inner
            .attempts_by_call
            .insert(call.call_id, attempts.clone());
        Ok(attempts)
    }

    async fn compare_and_set_status(
        &self,
        call_id: &str,
        to_identifier: &str,
        expected: CallStatus,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<CallAttempt>> {
        expected.ensure_transition(next)?;
        let mut inner = self.inner.write().await;
        let Some(attempt) = inner
            .attempts_by_call
            .get_mut(call_id)
            .and_then(|attempts| {
                attempts
                    .iter_mut()
                    .find(|attempt| attempt.to_identifier == to_identifier)
            })
        else {
            return Ok(None);
        };
        if attempt.status != expected {
            return Ok(None);
        }

        let previous = attempt.clone();
        attempt.resolve(next, at);
        Ok(Some(previous))
    }

    async fn set_terminal_for_all_pending(
        &self,
        call_id: &str,
        next: CallStatus,
        at: DateTime<Utc>,
    ) -> StoreResult<Vec<String>> {
        CallStatus::Pending.ensure_transition(next)?;
        let mut inner = self.inner.write().await;
        let Some(attempts) = inner.attempts_by_call.get_mut(call_id) else {
            return Ok(Vec::new());
        };

        let mut transitioned = Vec::new();
        for attempt in attempts
            .iter_mut()
            .filter(|attempt| attempt.status == CallStatus::Pending)
        {
            attempt.resolve(next, at);
            transitioned.push(attempt.to_identifier.clone());
        }
        Ok(transitioned)
    }

    async fn accept_exclusive(
        &self,
        call_id: &str,
        to_identifier: &str,
        at: DateTime<Utc>,
    ) -> StoreResult<Option<ExclusiveAccept>> {
        let mut inner = self.inner.write().await;
        let Some(attempts) = inner.attempts_by_call.get_mut(call_id) else {
            return Ok(None);
        };
        let Some(index) = attempts.iter().position(|attempt| {
            attempt.to_identifier == to_identifier && attempt.status == CallStatus::Pending
        }) else {
            return Ok(None);
        };

        let previous = attempts[index].clone();
        attempts[index].resolve(CallStatus::Accepted, at);
        let mut cancelled_siblings = Vec::new();
        for attempt in attempts
            .iter_mut()
            .filter(|attempt| attempt.status == CallStatus::Pending)
        {
            attempt.resolve(CallStatus::Cancelled, at);
            cancelled_siblings.push(attempt.to_identifier.clone());
        }
        Ok(Some(ExclusiveAccept {
            previous,
            cancelled_siblings,
        }))
    }

    async fn find_by_call_id(&self, call_id: &str) -> StoreResult<Vec<CallAttempt>> {
        let inner = self.inner.read().await;
        Ok(inner
            .attempts_by_call
            .get(call_id)
            .cloned()
            .unwrap_or_default())
    }

    async fn query_attempts(&self, query: CallAttemptQuery) -> StoreResult<Vec<CallAttempt>> {
        let inner = self.inner.read().await;
        let mut attempts = inner
            .call_order
            .iter()
            .filter_map(|call_id| inner.attempts_by_call.get(call_id))
            .flatten()
            .filter(|attempt| query.matches(attempt))
            .cloned()
            .collect::<Vec<_>>();

        let start = query.offset.min(attempts.len());
        let mut sliced = attempts.split_off(start);
        if let Some(limit) = query.limit {
            sliced.truncate(limit);
        }
        Ok(sliced)
    }
}
