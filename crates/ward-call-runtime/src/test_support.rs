use anyhow::Result;
use async_trait::async_trait;
use chrono::Utc;
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::mpsc;
use ward_call_store::{CallStore, InMemoryCallStore};
use ward_call_types::{CallNotification, NewCall, StatusChange};
use ward_core::normalize_identifier;
use ward_identity::{DirectoryIdentityResolver, Identity, Principal};
use ward_presence::{PresencePush, RecipientRegistry, RegistrationMetadata, TransportHandle};

use crate::{
    BotLink, CallDispatcher, CallReconciler, CallRuntimeConfig, CallStatusObserver,
    ExternalBotTransport, ObserverSet, ResponseTimers,
};

const DIRECTORY_NAMES: [&str; 5] = ["ICU", "FloorA", "FloorB", "FloorC", "FloorD"];

pub(crate) fn principal(name: &str) -> Principal {
    Principal {
        id: format!("user-{}", normalize_identifier(name)),
        name: name.to_string(),
        organization_id: Some("org-1".to_string()),
        department: None,
        is_floor_account: false,
        is_department_account: false,
    }
}

#[derive(Default)]
pub(crate) struct RecordingObserver {
    changes: Mutex<Vec<StatusChange>>,
}

impl RecordingObserver {
    pub(crate) fn changes(&self) -> Vec<StatusChange> {
        self.changes.lock().expect("recorder lock").clone()
    }
}

#[async_trait]
impl CallStatusObserver for RecordingObserver {
    fn observer_name(&self) -> &'static str {
        "recording"
    }

    async fn on_status_change(&self, change: &StatusChange) -> Result<()> {
        self.changes.lock().expect("recorder lock").push(change.clone());
        Ok(())
    }
}

#[derive(Default)]
pub(crate) struct RecordingBot {
    links: Vec<BotLink>,
    pushed: Mutex<Vec<String>>,
}

impl RecordingBot {
    pub(crate) fn with_link(identifier: &str, chat_id: &str) -> Self {
        Self {
            links: vec![BotLink {
                identifier: identifier.to_string(),
                chat_id: chat_id.to_string(),
            }],
            pushed: Mutex::default(),
        }
    }

    pub(crate) fn pushed_call_ids(&self) -> Vec<String> {
        self.pushed.lock().expect("bot lock").clone()
    }
}

#[async_trait]
impl ExternalBotTransport for RecordingBot {
    async fn linked_recipient(&self, identifier: &str) -> Result<Option<BotLink>> {
        Ok(self
            .links
            .iter()
            .find(|link| normalize_identifier(&link.identifier) == normalize_identifier(identifier))
            .cloned())
    }

    async fn push_call(&self, _link: &BotLink, notification: &CallNotification) -> Result<()> {
        self.pushed
            .lock()
            .expect("bot lock")
            .push(notification.call_id.clone());
        Ok(())
    }
}

pub(crate) struct Harness {
    pub(crate) store: Arc<InMemoryCallStore>,
    pub(crate) timers: Arc<ResponseTimers>,
    pub(crate) registry: Arc<RecipientRegistry>,
    pub(crate) recorder: Arc<RecordingObserver>,
    pub(crate) reconciler: Arc<CallReconciler>,
}

impl Harness {
    pub(crate) fn new() -> Self {
        let identities = DIRECTORY_NAMES
            .iter()
            .map(|name| Identity {
                id: format!("user-{}", normalize_identifier(name)),
                name: name.to_string(),
                email: None,
                organization_id: Some("org-1".to_string()),
                department: None,
                is_floor_account: name.starts_with("Floor"),
                is_department_account: true,
            })
            .collect();
        let store = Arc::new(InMemoryCallStore::new());
        let timers = Arc::new(ResponseTimers::new());
        let recorder = Arc::new(RecordingObserver::default());
        let reconciler = Arc::new(CallReconciler::new(
            store.clone(),
            Arc::new(DirectoryIdentityResolver::new(identities)),
            timers.clone(),
            ObserverSet::new().with(recorder.clone()),
        ));
        Self {
            store,
            timers,
            registry: Arc::new(RecipientRegistry::new()),
            recorder,
            reconciler,
        }
    }

    pub(crate) fn dispatcher(&self, bot: Option<Arc<RecordingBot>>) -> CallDispatcher {
        self.dispatcher_with_window_ms(bot, 60_000)
    }

    pub(crate) fn dispatcher_with_window_ms(
        &self,
        bot: Option<Arc<RecordingBot>>,
        window_ms: u64,
    ) -> CallDispatcher {
        let dispatcher = CallDispatcher::new(
            self.reconciler.clone(),
            self.registry.clone(),
            CallRuntimeConfig::with_response_window_ms(window_ms),
        );
        match bot {
            Some(bot) => dispatcher.with_bot_transport(bot),
            None => dispatcher,
        }
    }

    pub(crate) fn connect(&self, name: &str) -> mpsc::UnboundedReceiver<PresencePush> {
        let (handle, receiver) = TransportHandle::channel();
        self.registry
            .register(
                name,
                handle,
                RegistrationMetadata {
                    display_name: name.to_string(),
                    organization_scope: Some("org-1".to_string()),
                },
            )
            .expect("register recipient");
        receiver
    }

    /// Writes pending rows directly and arms a long timer, bypassing fanout.
    pub(crate) async fn seed_call(&self, from: &str, targets: &[&str]) -> String {
        let call_id = uuid::Uuid::new_v4().to_string();
        self.store
            .create_attempts(NewCall {
                call_id: call_id.clone(),
                from_identifier: from.to_string(),
                organization_id: Some("org-1".to_string()),
                targets: targets.iter().map(|target| target.to_string()).collect(),
                message: Some("patient fall".to_string()),
                attachment_ref: None,
                created_at: Utc::now(),
            })
            .await
            .expect("seed call");
        self.timers
            .arm(&call_id, Duration::from_secs(60), async {});
        call_id
    }
}
