//! Call dispatch and response reconciliation runtime for Ward.
//!
//! [`CallDispatcher`] persists a multi-recipient call, arms its response timer
//! and fans notifications out to live sockets or bot-linked recipients.
//! [`CallReconciler`] funnels every response path (accept, reject, cancel,
//! timer fire) through the store's compare-and-set so each attempt reaches
//! exactly one terminal status, and notifies observers once per transition.

pub mod audit;
pub mod bot_transport;
pub mod config;
pub mod dispatcher;
pub mod error;
pub mod observer;
pub mod reconciler;
pub mod timers;

#[cfg(test)]
mod test_support;

pub use audit::{JsonlAuditObserver, CALL_AUDIT_LOG_FILE};
pub use bot_transport::{BotLink, ExternalBotTransport};
pub use config::{CallRuntimeConfig, DEFAULT_RESPONSE_WINDOW_MS};
pub use dispatcher::{
    call_incoming_payload, CallDispatcher, DeliveryRoute, DispatchedCall, PlaceCallRequest,
    TargetDelivery, CALL_INCOMING_PUSH_KIND,
};
pub use error::{CallError, CancelOutcome, ResponseOutcome};
pub use observer::{CallStatusObserver, ObserverSet};
pub use reconciler::CallReconciler;
pub use timers::ResponseTimers;
