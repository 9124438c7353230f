//! Status-change fanout to side-effect observers.

use anyhow::Result;
use async_trait::async_trait;
use std::sync::Arc;
use ward_call_types::StatusChange;

/// Receives each authoritative status transition exactly once.
#[async_trait]
pub trait CallStatusObserver: Send + Sync {
    /// Short label used in logs when the observer fails.
    fn observer_name(&self) -> &'static str;

    async fn on_status_change(&self, change: &StatusChange) -> Result<()>;
}

/// Ordered set of observers notified after a winning transition.
///
/// Failures are logged and never roll back the transition.
#[derive(Clone, Default)]
pub struct ObserverSet {
    observers: Vec<Arc<dyn CallStatusObserver>>,
}

impl ObserverSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with(mut self, observer: Arc<dyn CallStatusObserver>) -> Self {
        self.push(observer);
        self
    }

    pub fn push(&mut self, observer: Arc<dyn CallStatusObserver>) {
        self.observers.push(observer);
    }

    pub fn len(&self) -> usize {
        self.observers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.observers.is_empty()
    }

    pub async fn notify(&self, change: &StatusChange) {
        for observer in &self.observers {
            if let Err(error) = observer.on_status_change(change).await {
                tracing::warn!(
                    observer = observer.observer_name(),
                    call_id = %change.call_id,
                    to_identifier = %change.to_identifier,
                    status = %change.status,
                    error = %format!("{error:#}"),
                    "call status observer failed"
                );
            }
        }
    }
}

impl std::fmt::Debug for ObserverSet {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_list()
            .entries(self.observers.iter().map(|observer| observer.observer_name()))
            .finish()
    }
}
