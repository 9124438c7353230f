use std::{
    path::Path,
    sync::{Arc, Mutex},
    time::Duration,
};

use anyhow::Result;
use async_trait::async_trait;
use serde_json::Value;
use tempfile::tempdir;
use tokio::sync::mpsc::UnboundedReceiver;
use ward_call_runtime::{
    CallDispatcher, CallError, CallReconciler, CallRuntimeConfig, CallStatusObserver,
    DeliveryRoute, JsonlAuditObserver, ObserverSet, PlaceCallRequest, ResponseOutcome,
    ResponseTimers, CALL_AUDIT_LOG_FILE,
};
use ward_call_store::{CallStore, SqliteCallStore};
use ward_call_types::{CallStatus, ResolutionCause, StatusChange};
use ward_identity::{DirectoryIdentityResolver, Identity, Principal};
use ward_presence::{PresencePush, RecipientRegistry, RegistrationMetadata, TransportHandle};

#[derive(Default)]
struct CollectingObserver {
    changes: Mutex<Vec<StatusChange>>,
}

impl CollectingObserver {
    fn changes(&self) -> Vec<StatusChange> {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .clone()
    }
}

#[async_trait]
impl CallStatusObserver for CollectingObserver {
    fn observer_name(&self) -> &'static str {
        "collecting"
    }

    async fn on_status_change(&self, change: &StatusChange) -> Result<()> {
        self.changes
            .lock()
            .unwrap_or_else(std::sync::PoisonError::into_inner)
            .push(change.clone());
        Ok(())
    }
}

fn directory() -> Vec<Identity> {
    ["ICU", "FloorA", "FloorB"]
        .into_iter()
        .map(|name| Identity {
            id: format!("u-{}", name.to_ascii_lowercase()),
            name: name.to_string(),
            email: None,
            organization_id: Some("org-1".to_string()),
            department: Some(name.to_string()),
            is_floor_account: name != "ICU",
            is_department_account: true,
        })
        .collect()
}

fn principal(name: &str) -> Principal {
    directory()
        .iter()
        .find(|identity| identity.name == name)
        .map(Principal::from)
        .expect("known principal")
}

struct Ward {
    store: Arc<SqliteCallStore>,
    registry: Arc<RecipientRegistry>,
    reconciler: Arc<CallReconciler>,
    dispatcher: CallDispatcher,
    observer: Arc<CollectingObserver>,
}

impl Ward {
    fn open(database: &Path, state_dir: &Path, window_ms: u64) -> Self {
        let store = Arc::new(SqliteCallStore::new(database).expect("open sqlite store"));
        let registry = Arc::new(RecipientRegistry::new());
        let observer = Arc::new(CollectingObserver::default());
        let observers = ObserverSet::new()
            .with(observer.clone())
            .with(Arc::new(JsonlAuditObserver::new(state_dir)));
        let reconciler = Arc::new(CallReconciler::new(
            store.clone(),
            Arc::new(DirectoryIdentityResolver::new(directory())),
            Arc::new(ResponseTimers::new()),
            observers,
        ));
        let dispatcher = CallDispatcher::new(
            reconciler.clone(),
            registry.clone(),
            CallRuntimeConfig::with_response_window_ms(window_ms),
        );
        Self {
            store,
            registry,
            reconciler,
            dispatcher,
            observer,
        }
    }

    fn connect(&self, name: &str) -> UnboundedReceiver<PresencePush> {
        let (transport, outbox) = TransportHandle::channel();
        self.registry
            .register(
                name,
                transport,
                RegistrationMetadata {
                    display_name: name.to_string(),
                    organization_scope: Some("org-1".to_string()),
                },
            )
            .expect("register recipient");
        outbox
    }

    async fn statuses(&self, call_id: &str) -> Vec<CallStatus> {
        self.store
            .find_by_call_id(call_id)
            .await
            .expect("read attempts")
            .into_iter()
            .map(|attempt| attempt.status)
            .collect()
    }
}

fn two_floor_call() -> PlaceCallRequest {
    PlaceCallRequest {
        from_identifier: "ICU".to_string(),
        targets: vec!["FloorA".to_string(), "FloorB".to_string()],
        message: Some("code blue, bed 12".to_string()),
        attachment_ref: None,
    }
}

#[tokio::test]
async fn scenario_two_target_dispatch_pushes_to_both_registered_recipients() {
    let temp = tempdir().expect("tempdir");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), temp.path(), 60_000);
    let mut floor_a = ward.connect("FloorA");
    let mut floor_b = ward.connect("FloorB");

    let dispatched = ward
        .dispatcher
        .dispatch(two_floor_call())
        .await
        .expect("dispatch");
    assert_eq!(
        ward.statuses(&dispatched.call_id).await,
        vec![CallStatus::Pending, CallStatus::Pending]
    );

    let deliveries = dispatched.fanout.await.expect("fanout task");
    assert!(deliveries
        .iter()
        .all(|delivery| matches!(delivery.route, DeliveryRoute::Live { .. })));
    for outbox in [&mut floor_a, &mut floor_b] {
        let push = outbox.try_recv().expect("call pushed");
        assert_eq!(push.kind, "call.incoming");
        assert_eq!(push.payload["call_id"], dispatched.call_id.as_str());
        assert_eq!(push.payload["message"], "code blue, bed 12");
    }
}

#[tokio::test]
async fn scenario_first_accept_cancels_sibling_and_outlives_the_window() {
    let temp = tempdir().expect("tempdir");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), temp.path(), 200);
    let call_id = ward
        .dispatcher
        .place_call(two_floor_call())
        .await
        .expect("place call");

    let outcome = ward
        .reconciler
        .accept(&call_id, "FloorA", &principal("FloorA"))
        .await
        .expect("accept");
    assert_eq!(
        outcome,
        ResponseOutcome::Applied {
            status: CallStatus::Accepted,
            cancelled_siblings: vec!["FloorB".to_string()],
        }
    );
    assert!(!ward.reconciler.timers().is_armed(&call_id));

    tokio::time::sleep(Duration::from_millis(400)).await;
    assert_eq!(
        ward.statuses(&call_id).await,
        vec![CallStatus::Accepted, CallStatus::Cancelled]
    );
    let causes = ward
        .observer
        .changes()
        .into_iter()
        .map(|change| change.cause)
        .collect::<Vec<_>>();
    assert_eq!(
        causes,
        vec![ResolutionCause::Accepted, ResolutionCause::ClaimedByOther]
    );
}

#[tokio::test]
async fn scenario_unanswered_call_times_out_only_pending_attempts() {
    let temp = tempdir().expect("tempdir");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), temp.path(), 200);
    let call_id = ward
        .dispatcher
        .place_call(two_floor_call())
        .await
        .expect("place call");
    ward.reconciler
        .reject(&call_id, "FloorB", &principal("FloorB"))
        .await
        .expect("reject");

    tokio::time::sleep(Duration::from_millis(500)).await;
    assert_eq!(
        ward.statuses(&call_id).await,
        vec![CallStatus::Timeout, CallStatus::Rejected]
    );
    assert!(!ward.reconciler.timers().is_armed(&call_id));

    let late = ward
        .reconciler
        .accept(&call_id, "FloorA", &principal("FloorA"))
        .await
        .expect("late accept");
    assert_eq!(
        late,
        ResponseOutcome::AlreadyResolved {
            status: CallStatus::Timeout
        }
    );
}

#[tokio::test]
async fn scenario_sender_cancel_is_idempotent_and_beats_stale_accept() {
    let temp = tempdir().expect("tempdir");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), temp.path(), 60_000);
    let call_id = ward
        .dispatcher
        .place_call(two_floor_call())
        .await
        .expect("place call");

    let error = ward
        .reconciler
        .cancel(&call_id, &principal("FloorA"), None)
        .await
        .expect_err("only the sender cancels");
    assert!(matches!(error, CallError::Unauthorized(_)));

    let cancelled = ward
        .reconciler
        .cancel(&call_id, &principal("ICU"), None)
        .await
        .expect("cancel");
    assert_eq!(cancelled.cancelled, vec!["FloorA", "FloorB"]);
    let notified = ward.observer.changes().len();

    let repeated = ward
        .reconciler
        .cancel(&call_id, &principal("ICU"), None)
        .await
        .expect("repeat cancel");
    assert!(repeated.cancelled.is_empty());
    assert_eq!(ward.observer.changes().len(), notified);

    let stale = ward
        .reconciler
        .accept(&call_id, "FloorA", &principal("FloorA"))
        .await
        .expect("stale accept");
    assert!(!stale.is_applied());
    assert_eq!(
        ward.statuses(&call_id).await,
        vec![CallStatus::Cancelled, CallStatus::Cancelled]
    );
}

#[tokio::test(flavor = "multi_thread", worker_threads = 4)]
async fn property_racing_accepts_across_processes_elect_one_winner() {
    let temp = tempdir().expect("tempdir");
    let database = temp.path().join("calls.sqlite3");
    let first = Ward::open(&database, &temp.path().join("first"), 60_000);
    let second = Ward::open(&database, &temp.path().join("second"), 60_000);
    let call_id = first
        .dispatcher
        .place_call(two_floor_call())
        .await
        .expect("place call");

    let a = {
        let reconciler = first.reconciler.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            reconciler
                .accept(&call_id, "FloorA", &principal("FloorA"))
                .await
        })
    };
    let b = {
        let reconciler = second.reconciler.clone();
        let call_id = call_id.clone();
        tokio::spawn(async move {
            reconciler
                .accept(&call_id, "FloorB", &principal("FloorB"))
                .await
        })
    };
    let outcomes = [
        a.await.expect("join a").expect("accept a"),
        b.await.expect("join b").expect("accept b"),
    ];

    assert_eq!(
        outcomes.iter().filter(|outcome| outcome.is_applied()).count(),
        1
    );
    let statuses = first.statuses(&call_id).await;
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == CallStatus::Accepted)
            .count(),
        1
    );
    assert_eq!(
        statuses
            .iter()
            .filter(|status| **status == CallStatus::Cancelled)
            .count(),
        1
    );
    assert_eq!(
        first.observer.changes().len() + second.observer.changes().len(),
        2
    );
}

#[tokio::test]
async fn property_reregistration_replaces_instead_of_duplicating() {
    let temp = tempdir().expect("tempdir");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), temp.path(), 60_000);
    let mut stale = ward.connect("FloorA");
    let mut fresh = ward.connect("floora");
    assert_eq!(ward.registry.len(), 1);

    let dispatched = ward
        .dispatcher
        .dispatch(PlaceCallRequest {
            targets: vec!["FloorA".to_string()],
            ..two_floor_call()
        })
        .await
        .expect("dispatch");
    dispatched.fanout.await.expect("fanout task");
    assert!(fresh.try_recv().is_ok());
    assert!(stale.try_recv().is_err());
}

#[tokio::test]
async fn functional_audit_log_records_every_transition() {
    let temp = tempdir().expect("tempdir");
    let state_dir = temp.path().join("state");
    let ward = Ward::open(&temp.path().join("calls.sqlite3"), &state_dir, 60_000);
    let call_id = ward
        .dispatcher
        .place_call(two_floor_call())
        .await
        .expect("place call");
    ward.reconciler
        .accept(&call_id, "FloorB", &principal("FloorB"))
        .await
        .expect("accept");

    let raw = std::fs::read_to_string(state_dir.join(CALL_AUDIT_LOG_FILE)).expect("read audit");
    let records = raw
        .lines()
        .map(|line| serde_json::from_str::<Value>(line).expect("audit json"))
        .collect::<Vec<_>>();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0]["to_identifier"], "FloorB");
    assert_eq!(records[0]["status"], "accepted");
    assert_eq!(records[1]["to_identifier"], "FloorA");
    assert_eq!(records[1]["cause"], "claimed_by_other");
    assert_eq!(records[1]["organization_scope"], "org-1");
}
