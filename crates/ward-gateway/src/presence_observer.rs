use anyhow::{Context, Result};
use async_trait::async_trait;
use std::collections::HashSet;
use std::sync::Arc;
use ward_call_runtime::CallStatusObserver;
use ward_call_types::StatusChange;
use ward_presence::{PresencePush, RecipientRegistry};

pub const CALL_STATUS_PUSH_KIND: &str = "call.status";

/// Pushes `call.status` once to every live connection in the change's scope,
/// however many keys that connection is registered under.
#[derive(Debug, Clone)]
pub struct PresenceBroadcastObserver {
    registry: Arc<RecipientRegistry>,
}

impl PresenceBroadcastObserver {
    pub fn new(registry: Arc<RecipientRegistry>) -> Self {
        Self { registry }
    }
}

#[async_trait]
impl CallStatusObserver for PresenceBroadcastObserver {
    fn observer_name(&self) -> &'static str {
        "presence_broadcast"
    }

    async fn on_status_change(&self, change: &StatusChange) -> Result<()> {
        let payload = serde_json::to_value(change).context("serialize call status push")?;
        let audience = self
            .registry
            .registrations_in_scope(change.organization_scope.as_deref());
        let mut reached = HashSet::new();
        let mut delivered = 0usize;
        for registration in audience {
            if !reached.insert(registration.connection_id()) {
                continue;
            }
            match registration
                .transport
                .push(PresencePush::new(CALL_STATUS_PUSH_KIND, payload.clone()))
            {
                Ok(()) => delivered += 1,
                Err(error) => tracing::debug!(
                    key = %registration.key,
                    %error,
                    "skipping closed transport during status broadcast"
                ),
            }
        }
        tracing::debug!(
            call_id = %change.call_id,
            status = %change.status,
            delivered,
            "call status broadcast"
        );
        Ok(())
    }
}
