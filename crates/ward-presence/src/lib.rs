//! Process-local registry of live recipient transports.
//!
//! Keys are normalized recipient names. At most one live handle exists per
//! key; a new registration supersedes the previous one and removal on
//! disconnect always compares connection ids, so a stale socket closing late
//! never evicts the connection that replaced it.

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{PoisonError, RwLock};
use thiserror::Error;
use tokio::sync::mpsc;
use ward_core::{current_unix_timestamp_ms, normalize_identifier};

static NEXT_CONNECTION_ID: AtomicU64 = AtomicU64::new(1);

/// Errors returned by registry and transport operations.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum PresenceError {
    #[error("recipient key '{0}' is empty after normalization")]
    EmptyKey(String),
    #[error("transport connection {0} is closed")]
    TransportClosed(ConnectionId),
}

/// Process-unique identifier of one live transport connection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct ConnectionId(u64);

impl ConnectionId {
    pub fn next() -> Self {
        Self(NEXT_CONNECTION_ID.fetch_add(1, Ordering::Relaxed))
    }

    pub fn as_u64(self) -> u64 {
        self.0
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Server-initiated message queued for one connection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PresencePush {
    pub kind: String,
    pub payload: Value,
}

impl PresencePush {
    pub fn new(kind: impl Into<String>, payload: Value) -> Self {
        Self {
            kind: kind.into(),
            payload,
        }
    }
}

/// Cloneable handle to a connection's outbound queue.
#[derive(Debug, Clone)]
pub struct TransportHandle {
    connection_id: ConnectionId,
    outbox: mpsc::UnboundedSender<PresencePush>,
}

impl TransportHandle {
    /// Allocates a new connection id and its outbound queue.
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PresencePush>) {
        let (outbox, receiver) = mpsc::unbounded_channel();
        (
            Self {
                connection_id: ConnectionId::next(),
                outbox,
            },
            receiver,
        )
    }

    pub fn connection_id(&self) -> ConnectionId {
        self.connection_id
    }

    pub fn push(&self, push: PresencePush) -> Result<(), PresenceError> {
        self.outbox
            .send(push)
            .map_err(|_| PresenceError::TransportClosed(self.connection_id))
    }

    pub fn is_closed(&self) -> bool {
        self.outbox.is_closed()
    }
}

/// Descriptive fields supplied alongside a registration.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RegistrationMetadata {
    pub display_name: String,
    pub organization_scope: Option<String>,
}

/// One live recipient endpoint.
#[derive(Debug, Clone)]
pub struct RecipientRegistration {
    pub key: String,
    pub display_name: String,
    pub organization_scope: Option<String>,
    pub transport: TransportHandle,
    pub registered_unix_ms: u64,
}

impl RecipientRegistration {
    pub fn connection_id(&self) -> ConnectionId {
        self.transport.connection_id()
    }
}

/// Registry of live recipient transports, kept in registration order.
#[derive(Debug, Default)]
pub struct RecipientRegistry {
    entries: RwLock<Vec<RecipientRegistration>>,
}

impl RecipientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Upserts the registration for `key`, returning the superseded entry.
    ///
    /// Re-registering the same connection under the same key refreshes its
    /// metadata and returns `None`.
    pub fn register(
        &self,
        key: &str,
        transport: TransportHandle,
        metadata: RegistrationMetadata,
    ) -> Result<Option<RecipientRegistration>, PresenceError> {
        let normalized = normalize_identifier(key);
        if normalized.is_empty() {
            return Err(PresenceError::EmptyKey(key.to_string()));
        }

        let registration = RecipientRegistration {
            key: normalized.clone(),
            display_name: metadata.display_name,
            organization_scope: metadata.organization_scope,
            transport,
            registered_unix_ms: current_unix_timestamp_ms(),
        };
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let Some(index) = entries.iter().position(|entry| entry.key == normalized) else {
            tracing::debug!(
                key = %normalized,
                connection_id = %registration.connection_id(),
                "recipient registered"
            );
            entries.push(registration);
            return Ok(None);
        };

        let slot = &mut entries[index];
        let same_connection = slot.connection_id() == registration.connection_id();
        let previous = std::mem::replace(slot, registration);
        if same_connection {
            return Ok(None);
        }
        tracing::debug!(
            key = %normalized,
            previous_connection_id = %previous.connection_id(),
            connection_id = %slot.connection_id(),
            "recipient registration superseded"
        );
        Ok(Some(previous))
    }

    pub fn lookup(&self, key: &str) -> Option<RecipientRegistration> {
        let normalized = normalize_identifier(key);
        if normalized.is_empty() {
            return None;
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| entry.key == normalized)
            .cloned()
    }

    /// Removes every entry currently held by `connection_id`, returning their keys.
    pub fn remove_by_transport(&self, connection_id: ConnectionId) -> Vec<String> {
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let mut removed = Vec::new();
        entries.retain(|entry| {
            if entry.connection_id() == connection_id {
                removed.push(entry.key.clone());
                return false;
            }
            true
        });
        if !removed.is_empty() {
            tracing::debug!(%connection_id, keys = ?removed, "recipient registrations removed");
        }
        removed
    }

    /// Scans registrations in order comparing normalized display names.
    pub fn resolve_by_display_name(&self, name: &str) -> Option<RecipientRegistration> {
        let normalized = normalize_identifier(name);
        if normalized.is_empty() {
            return None;
        }
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .find(|entry| normalize_identifier(&entry.display_name) == normalized)
            .cloned()
    }

    /// Lists registrations visible to `organization_scope`; all when `None`.
    pub fn registrations_in_scope(
        &self,
        organization_scope: Option<&str>,
    ) -> Vec<RecipientRegistration> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .filter(|entry| {
                organization_scope
                    .is_none_or(|scope| entry.organization_scope.as_deref() == Some(scope))
            })
            .cloned()
            .collect()
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}
