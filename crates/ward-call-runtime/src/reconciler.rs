//! First-writer-wins reconciliation of racing responses.
//!
//! Every operation follows the same shape: authorize, compare-and-set through
//! the store, and only when that write won, disarm the timer once nothing is
//! pending and notify observers. Losing writers return
//! [`ResponseOutcome::AlreadyResolved`] and produce no side effects.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use ward_call_store::{CallStore, ExclusiveAccept};
use ward_call_types::{CallAttempt, CallStatus, ResolutionCause, StatusChange};
use ward_core::identifiers_match;
use ward_identity::{principal_may_act_for, IdentityResolver, Principal};

use crate::{CallError, CancelOutcome, ObserverSet, ResponseOutcome, ResponseTimers};

/// Applies accept, reject, cancel and timeout transitions.
pub struct CallReconciler {
    store: Arc<dyn CallStore>,
    identities: Arc<dyn IdentityResolver>,
    timers: Arc<ResponseTimers>,
    observers: ObserverSet,
}

impl CallReconciler {
    pub fn new(
        store: Arc<dyn CallStore>,
        identities: Arc<dyn IdentityResolver>,
        timers: Arc<ResponseTimers>,
        observers: ObserverSet,
    ) -> Self {
        Self {
            store,
            identities,
            timers,
            observers,
        }
    }

    pub fn store(&self) -> &Arc<dyn CallStore> {
        &self.store
    }

    pub fn timers(&self) -> &Arc<ResponseTimers> {
        &self.timers
    }

    pub fn identities(&self) -> &Arc<dyn IdentityResolver> {
        &self.identities
    }

    /// Accepts the call for `to_identifier` and cancels every pending sibling.
    #[tracing::instrument(skip(self, responder), fields(responder = %responder.name))]
    pub async fn accept(
        &self,
        call_id: &str,
        to_identifier: &str,
        responder: &Principal,
    ) -> Result<ResponseOutcome, CallError> {
        let (attempt, rows) = self
            .authorized_attempt(call_id, to_identifier, responder)
            .await?;
        let now = Utc::now();
        let Some(ExclusiveAccept {
            previous,
            cancelled_siblings,
        }) = self
            .store
            .accept_exclusive(call_id, &attempt.to_identifier, now)
            .await?
        else {
            return self.already_resolved(call_id, &attempt.to_identifier).await;
        };

        self.timers.disarm(call_id);
        let scope = self.organization_scope(&previous).await;
        tracing::info!(
            to_identifier = %previous.to_identifier,
            cancelled_siblings = cancelled_siblings.len(),
            total_recipients = rows.len(),
            "call accepted"
        );

        self.observers
            .notify(&status_change(
                &previous,
                &previous.to_identifier,
                ResolutionCause::Accepted,
                scope.clone(),
                now,
            ))
            .await;
        for sibling in &cancelled_siblings {
            self.observers
                .notify(&status_change(
                    &previous,
                    sibling,
                    ResolutionCause::ClaimedByOther,
                    scope.clone(),
                    now,
                ))
                .await;
        }

        Ok(ResponseOutcome::Applied {
            status: CallStatus::Accepted,
            cancelled_siblings,
        })
    }

    /// Rejects the call for `to_identifier`; siblings keep waiting.
    #[tracing::instrument(skip(self, responder), fields(responder = %responder.name))]
    pub async fn reject(
        &self,
        call_id: &str,
        to_identifier: &str,
        responder: &Principal,
    ) -> Result<ResponseOutcome, CallError> {
        let (attempt, _) = self
            .authorized_attempt(call_id, to_identifier, responder)
            .await?;
        let now = Utc::now();
        let Some(previous) = self
            .store
            .compare_and_set_status(
                call_id,
                &attempt.to_identifier,
                CallStatus::Pending,
                CallStatus::Rejected,
                now,
            )
            .await?
        else {
            return self.already_resolved(call_id, &attempt.to_identifier).await;
        };

        self.disarm_when_settled(call_id).await;
        tracing::info!(to_identifier = %previous.to_identifier, "call rejected");
        let scope = self.organization_scope(&previous).await;
        self.observers
            .notify(&status_change(
                &previous,
                &previous.to_identifier,
                ResolutionCause::Rejected,
                scope,
                now,
            ))
            .await;

        Ok(ResponseOutcome::Applied {
            status: CallStatus::Rejected,
            cancelled_siblings: Vec::new(),
        })
    }

    /// Cancels the listed recipients (all when `targets` is `None`).
    ///
    /// Only the original sender may cancel. Recipients already resolved are
    /// skipped, so repeating a cancel yields an empty outcome.
    #[tracing::instrument(skip(self, requester, targets), fields(requester = %requester.name))]
    pub async fn cancel(
        &self,
        call_id: &str,
        requester: &Principal,
        targets: Option<&[String]>,
    ) -> Result<CancelOutcome, CallError> {
        let rows = self.rows_for_call(call_id).await?;
        let template = &rows[0];
        if !identifiers_match(&requester.name, &template.from_identifier) {
            return Err(CallError::Unauthorized(format!(
                "'{}' did not place call '{call_id}'",
                requester.name
            )));
        }

        let now = Utc::now();
        let cancelled = match targets {
            None => {
                self.store
                    .set_terminal_for_all_pending(call_id, CallStatus::Cancelled, now)
                    .await?
            }
            Some([]) => {
                return Err(CallError::InvalidArgument(
                    "cancel targets must not be empty when provided".to_string(),
                ))
            }
            Some(targets) => {
                let mut selected = Vec::with_capacity(targets.len());
                for target in targets {
                    let attempt = find_attempt(&rows, target).ok_or_else(|| {
                        CallError::NotFound(format!(
                            "recipient '{target}' is not part of call '{call_id}'"
                        ))
                    })?;
                    if !selected.contains(&attempt.to_identifier) {
                        selected.push(attempt.to_identifier.clone());
                    }
                }

                let mut cancelled = Vec::new();
                for to_identifier in selected {
                    let won = self
                        .store
                        .compare_and_set_status(
                            call_id,
                            &to_identifier,
                            CallStatus::Pending,
                            CallStatus::Cancelled,
                            now,
                        )
                        .await;
                    match won {
                        Ok(Some(_)) => cancelled.push(to_identifier),
                        Ok(None) => {}
                        Err(error) if cancelled.is_empty() => return Err(error.into()),
                        Err(error) => {
                            tracing::warn!(
                                to_identifier = %to_identifier,
                                %error,
                                "cancel stopped early; reporting recipients already cancelled"
                            );
                            break;
                        }
                    }
                }
                cancelled
            }
        };

        if cancelled.is_empty() {
            tracing::debug!("cancel found nothing pending");
            return Ok(CancelOutcome::default());
        }

        self.disarm_when_settled(call_id).await;
        tracing::info!(cancelled = cancelled.len(), "call cancelled by sender");
        let scope = self.organization_scope(template).await;
        for to_identifier in &cancelled {
            self.observers
                .notify(&status_change(
                    template,
                    to_identifier,
                    ResolutionCause::CancelledBySender,
                    scope.clone(),
                    now,
                ))
                .await;
        }

        Ok(CancelOutcome { cancelled })
    }

    /// Times out every still-pending attempt. Invoked by the response timer.
    pub(crate) async fn timeout(&self, call_id: &str) -> Result<Vec<String>, CallError> {
        let rows = self.rows_for_call(call_id).await?;
        let template = &rows[0];
        let now = Utc::now();
        let timed_out = self
            .store
            .set_terminal_for_all_pending(call_id, CallStatus::Timeout, now)
            .await?;
        self.timers.disarm(call_id);
        if timed_out.is_empty() {
            tracing::debug!(call_id, "response window closed with nothing pending");
            return Ok(timed_out);
        }

        tracing::info!(call_id, timed_out = timed_out.len(), "call timed out");
        let scope = self.organization_scope(template).await;
        for to_identifier in &timed_out {
            self.observers
                .notify(&status_change(
                    template,
                    to_identifier,
                    ResolutionCause::TimedOut,
                    scope.clone(),
                    now,
                ))
                .await;
        }
        Ok(timed_out)
    }

    async fn rows_for_call(&self, call_id: &str) -> Result<Vec<CallAttempt>, CallError> {
        let call_id = call_id.trim();
        if call_id.is_empty() {
            return Err(CallError::InvalidArgument(
                "call_id must not be empty".to_string(),
            ));
        }
        let rows = self.store.find_by_call_id(call_id).await?;
        if rows.is_empty() {
            return Err(CallError::NotFound(format!("call '{call_id}'")));
        }
        Ok(rows)
    }

    async fn authorized_attempt(
        &self,
        call_id: &str,
        to_identifier: &str,
        responder: &Principal,
    ) -> Result<(CallAttempt, Vec<CallAttempt>), CallError> {
        if to_identifier.trim().is_empty() {
            return Err(CallError::InvalidArgument(
                "to_identifier must not be empty".to_string(),
            ));
        }
        let rows = self.rows_for_call(call_id).await?;
        let attempt = find_attempt(&rows, to_identifier)
            .cloned()
            .ok_or_else(|| {
                CallError::NotFound(format!(
                    "recipient '{to_identifier}' is not part of call '{call_id}'"
                ))
            })?;

        let allowed =
            principal_may_act_for(self.identities.as_ref(), responder, &attempt.to_identifier)
                .await
                .map_err(CallError::Identity)?;
        if !allowed {
            return Err(CallError::Unauthorized(format!(
                "'{}' may not respond for '{}'",
                responder.name, attempt.to_identifier
            )));
        }
        Ok((attempt, rows))
    }

    async fn already_resolved(
        &self,
        call_id: &str,
        to_identifier: &str,
    ) -> Result<ResponseOutcome, CallError> {
        let current = self
            .store
            .find_by_call_id(call_id)
            .await?
            .into_iter()
            .find(|attempt| attempt.to_identifier == to_identifier)
            .ok_or_else(|| {
                CallError::NotFound(format!(
                    "recipient '{to_identifier}' is not part of call '{call_id}'"
                ))
            })?;
        tracing::debug!(
            call_id,
            to_identifier,
            status = %current.status,
            "response lost the race; attempt already resolved"
        );
        Ok(ResponseOutcome::AlreadyResolved {
            status: current.status,
        })
    }

    /// Runs after a won write, so a failed read only leaves the timer armed;
    /// its later fire finds nothing pending.
    async fn disarm_when_settled(&self, call_id: &str) {
        match self.store.find_pending_by_call_id(call_id).await {
            Ok(pending) if pending.is_empty() => {
                self.timers.disarm(call_id);
            }
            Ok(_) => {}
            Err(error) => tracing::warn!(
                call_id,
                %error,
                "pending read failed after transition; response timer left armed"
            ),
        }
    }

    /// Broadcast audience: the sender's organization, else the recipient's,
    /// else global.
    async fn organization_scope(&self, attempt: &CallAttempt) -> Option<String> {
        if attempt.organization_id.is_some() {
            return attempt.organization_id.clone();
        }
        for identifier in [&attempt.from_identifier, &attempt.to_identifier] {
            match self.identities.resolve_identity(identifier).await {
                Ok(Some(identity)) if identity.organization_id.is_some() => {
                    return identity.organization_id;
                }
                Ok(_) => {}
                Err(error) => {
                    tracing::warn!(
                        identifier = %identifier,
                        error = %format!("{error:#}"),
                        "organization scope lookup failed; broadcasting globally"
                    );
                    return None;
                }
            }
        }
        None
    }
}

fn find_attempt<'a>(rows: &'a [CallAttempt], to_identifier: &str) -> Option<&'a CallAttempt> {
    let to_identifier = to_identifier.trim();
    rows.iter()
        .find(|attempt| attempt.to_identifier == to_identifier)
        .or_else(|| {
            rows.iter()
                .find(|attempt| identifiers_match(&attempt.to_identifier, to_identifier))
        })
}

fn status_change(
    template: &CallAttempt,
    to_identifier: &str,
    cause: ResolutionCause,
    organization_scope: Option<String>,
    occurred_at: DateTime<Utc>,
) -> StatusChange {
    StatusChange {
        call_id: template.call_id.clone(),
        from_identifier: template.from_identifier.clone(),
        to_identifier: to_identifier.to_string(),
        status: cause.status(),
        cause,
        organization_scope,
        occurred_at,
    }
}
