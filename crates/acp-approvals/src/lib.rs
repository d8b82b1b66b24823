// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-approvals
#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::{
    Approval, ApprovalStatus, EventPayload, RejectionReason, ResolutionSource, RunErrorInfo,
    RunErrorKind, RunState, TimeoutAction, TransitionRecord,
};
use acp_eventlog::AppendError;
use acp_ledger::{LedgerError, RunLedger};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, oneshot};
use tracing::{debug, info, warn};
use uuid::Uuid;

/// Errors from approval operations.
#[derive(Debug, thiserror::Error)]
pub enum ApprovalError {
    /// No checkpoint with this id exists, pending or resolved.
    #[error("unknown checkpoint: {0}")]
    NotFound(String),

    /// The checkpoint exists but was already resolved.
    #[error("checkpoint {0} is already resolved")]
    Conflict(String),

    /// A pending checkpoint with this id already exists.
    #[error("checkpoint {0} is already pending")]
    DuplicateCheckpoint(String),

    /// The run cannot enter `awaiting_approval` from its current state.
    #[error("run {run_id} cannot await approval from state {state}")]
    InvalidRunState {
        /// The run in question.
        run_id: Uuid,
        /// Its current state.
        state: RunState,
    },

    /// An underlying ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Parameters for raising a checkpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ApprovalRequest {
    /// Run raising the checkpoint.
    pub run_id: Uuid,
    /// Stable checkpoint id chosen by the agent.
    pub checkpoint_id: String,
    /// Action type being gated.
    pub action_type: String,
    /// Opaque preview for the approver.
    pub preview: serde_json::Value,
    /// Seconds until the timeout sweep auto-resolves it.
    pub timeout_seconds: u64,
    /// What the sweep does at expiry.
    pub timeout_action: TimeoutAction,
}

/// How a checkpoint ended up resolved, delivered to waiting run drivers.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "disposition", rename_all = "snake_case")]
pub enum Disposition {
    /// A human (or the sweep's auto-approve) approved the action.
    Approved,
    /// A human rejected the action.
    Rejected {
        /// Why.
        reason: RejectionReason,
    },
    /// The checkpoint expired with `reject`; the run is terminal.
    TimedOut,
}

/// Notification sent to a driver waiting on a checkpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Resolution {
    /// The resolved checkpoint.
    pub checkpoint_id: String,
    /// Its run.
    pub run_id: Uuid,
    /// How it resolved.
    pub disposition: Disposition,
}

/// Result of resolving one checkpoint.
#[derive(Debug, Clone)]
pub struct ResolutionOutcome {
    /// The audited approval record after resolution.
    pub approval: Approval,
    /// The run transition that resulted, when one was applied. `None` when
    /// the run had already left `awaiting_approval` (e.g. cancelled
    /// externally) and only the audit was recorded.
    pub transition: Option<TransitionRecord>,
}

/// Selector for [`ApprovalService::bulk_approve`].
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct BulkSelector {
    /// Match checkpoints of this run.
    pub run_id: Option<Uuid>,
    /// Match checkpoints gating this action type.
    pub action_type: Option<String>,
}

/// Per-checkpoint outcome of a bulk approval.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct BulkItemOutcome {
    /// The checkpoint.
    pub checkpoint_id: String,
    /// `"approved"` or an error code (`"conflict"`, `"not_found"`).
    pub outcome: String,
}

struct Inner {
    pending: HashMap<String, Approval>,
    resolved: Vec<Approval>,
    waiters: HashMap<String, Vec<oneshot::Sender<Resolution>>>,
}

/// Process-wide approval checkpoint service.
///
/// Holds the ledger handle and calls its typed methods directly; resolving
/// a checkpoint and transitioning its run happen as one logical step under
/// the service lock.
pub struct ApprovalService {
    ledger: Arc<RunLedger>,
    inner: Mutex<Inner>,
}

impl ApprovalService {
    /// Create the service.
    #[must_use]
    pub fn new(ledger: Arc<RunLedger>) -> Self {
        Self {
            ledger,
            inner: Mutex::new(Inner {
                pending: HashMap::new(),
                resolved: Vec::new(),
                waiters: HashMap::new(),
            }),
        }
    }

    /// Raise a checkpoint: suspend the run and record the request.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::DuplicateCheckpoint`] when a pending checkpoint with
    /// this id exists, [`ApprovalError::InvalidRunState`] when the run
    /// cannot suspend, or a ledger error.
    pub async fn request_approval(
        &self,
        request: ApprovalRequest,
    ) -> Result<Approval, ApprovalError> {
        let mut inner = self.inner.lock().await;
        if inner.pending.contains_key(&request.checkpoint_id) {
            return Err(ApprovalError::DuplicateCheckpoint(request.checkpoint_id));
        }

        let run = self.ledger.get_run(request.run_id).await?;
        let requested_from_phase = run.state;

        match self
            .ledger
            .transition_state(request.run_id, RunState::AwaitingApproval, None)
            .await
        {
            Ok(_) => {}
            Err(LedgerError::Transition(_)) => {
                return Err(ApprovalError::InvalidRunState {
                    run_id: request.run_id,
                    state: run.state,
                });
            }
            Err(e) => return Err(e.into()),
        }

        let now = Utc::now();
        let approval = Approval {
            checkpoint_id: request.checkpoint_id.clone(),
            run_id: request.run_id,
            action_type: request.action_type.clone(),
            preview: request.preview.clone(),
            status: ApprovalStatus::Pending,
            requested_from_phase,
            created_at: now,
            expires_at: now + Duration::seconds(request.timeout_seconds as i64),
            timeout_action: request.timeout_action,
            resolved_at: None,
            resolved_by: None,
            resolved_from: None,
            rejection_reason: None,
        };

        self.ledger
            .record_event(
                request.run_id,
                EventPayload::CheckpointRequested {
                    checkpoint_id: request.checkpoint_id.clone(),
                    action_type: request.action_type,
                    preview: request.preview,
                },
            )
            .await?;

        info!(
            target: "acp.approvals",
            run_id = %request.run_id,
            checkpoint_id = %request.checkpoint_id,
            "checkpoint requested"
        );
        inner
            .pending
            .insert(request.checkpoint_id, approval.clone());
        Ok(approval)
    }

    /// Approve a pending checkpoint and resume its run.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::Conflict`], or a
    /// ledger error.
    pub async fn approve(
        &self,
        checkpoint_id: &str,
        approver: &str,
        source: ResolutionSource,
    ) -> Result<ResolutionOutcome, ApprovalError> {
        let mut inner = self.inner.lock().await;
        let mut approval = take_pending(&mut inner, checkpoint_id)?;

        approval.status = ApprovalStatus::Approved;
        approval.resolved_at = Some(Utc::now());
        approval.resolved_by = Some(approver.to_string());
        approval.resolved_from = Some(source);

        let transition = self.resume_run(&approval).await?;
        self.emit_resolution(
            &approval,
            EventPayload::CheckpointApproved {
                checkpoint_id: approval.checkpoint_id.clone(),
                resolved_by: approver.to_string(),
                source,
            },
        )
        .await;

        finish(&mut inner, &approval, Disposition::Approved);
        Ok(ResolutionOutcome {
            approval,
            transition,
        })
    }

    /// Reject a pending checkpoint; the run moves per the reason.
    ///
    /// # Errors
    ///
    /// [`ApprovalError::NotFound`], [`ApprovalError::Conflict`], or a
    /// ledger error.
    pub async fn reject(
        &self,
        checkpoint_id: &str,
        reason: RejectionReason,
        rejector: Option<&str>,
        source: ResolutionSource,
    ) -> Result<ResolutionOutcome, ApprovalError> {
        self.reject_inner(checkpoint_id, reason, rejector, source, None)
            .await
    }

    /// Reject with `needs_edit`, replacing the preview with the approver's
    /// edited payload so the audit (and the agent's re-plan) see the edit.
    ///
    /// # Errors
    ///
    /// Same as [`reject`](Self::reject).
    pub async fn edit(
        &self,
        checkpoint_id: &str,
        edited_preview: serde_json::Value,
        editor: Option<&str>,
        source: ResolutionSource,
    ) -> Result<ResolutionOutcome, ApprovalError> {
        self.reject_inner(
            checkpoint_id,
            RejectionReason::NeedsEdit,
            editor,
            source,
            Some(edited_preview),
        )
        .await
    }

    async fn reject_inner(
        &self,
        checkpoint_id: &str,
        reason: RejectionReason,
        rejector: Option<&str>,
        source: ResolutionSource,
        edited_preview: Option<serde_json::Value>,
    ) -> Result<ResolutionOutcome, ApprovalError> {
        let mut inner = self.inner.lock().await;
        let mut approval = take_pending(&mut inner, checkpoint_id)?;

        if let Some(preview) = edited_preview {
            approval.preview = preview;
        }
        approval.status = ApprovalStatus::Rejected;
        approval.resolved_at = Some(Utc::now());
        approval.resolved_by = rejector.map(String::from);
        approval.resolved_from = Some(source);
        approval.rejection_reason = Some(reason);

        let target = reason.target_state();
        let error = match reason {
            RejectionReason::PolicyViolation => Some(RunErrorInfo::new(
                RunErrorKind::ContractViolation,
                format!(
                    "checkpoint '{}' rejected: proposed action violates policy",
                    approval.checkpoint_id
                ),
                false,
            )),
            _ => None,
        };

        let transition = match self
            .ledger
            .transition_state(approval.run_id, target, error)
            .await
        {
            Ok(record) => Some(record),
            Err(LedgerError::Transition(_)) => {
                warn!(
                    target: "acp.approvals",
                    run_id = %approval.run_id,
                    checkpoint_id = %approval.checkpoint_id,
                    "run left awaiting_approval before rejection; audit only"
                );
                None
            }
            Err(e) => return Err(e.into()),
        };

        self.emit_resolution(
            &approval,
            EventPayload::CheckpointRejected {
                checkpoint_id: approval.checkpoint_id.clone(),
                reason,
                resolved_by: approval.resolved_by.clone(),
                source,
            },
        )
        .await;

        finish(&mut inner, &approval, Disposition::Rejected { reason });
        Ok(ResolutionOutcome {
            approval,
            transition,
        })
    }

    /// Approve every pending checkpoint matching the selector.
    ///
    /// Each approval is independent; one failure never rolls back the
    /// others. The aggregate reports a per-checkpoint outcome.
    pub async fn bulk_approve(
        &self,
        selector: &BulkSelector,
        approver: &str,
    ) -> Vec<BulkItemOutcome> {
        let matching: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .values()
                .filter(|a| selector.run_id.is_none_or(|id| a.run_id == id))
                .filter(|a| {
                    selector
                        .action_type
                        .as_deref()
                        .is_none_or(|t| a.action_type == t)
                })
                .map(|a| a.checkpoint_id.clone())
                .collect()
        };

        let mut outcomes = Vec::with_capacity(matching.len());
        for checkpoint_id in matching {
            let outcome = match self
                .approve(&checkpoint_id, approver, ResolutionSource::Bulk)
                .await
            {
                Ok(_) => "approved".to_string(),
                Err(ApprovalError::Conflict(_)) => "conflict".to_string(),
                Err(ApprovalError::NotFound(_)) => "not_found".to_string(),
                Err(e) => {
                    warn!(target: "acp.approvals", %checkpoint_id, error = %e, "bulk approve item failed");
                    "error".to_string()
                }
            };
            outcomes.push(BulkItemOutcome {
                checkpoint_id,
                outcome,
            });
        }
        outcomes
    }

    /// Resolve every pending checkpoint whose `expires_at` has passed.
    ///
    /// `approve` timeout actions resume the run; `reject` actions terminate
    /// it in the distinct `timeout` state. Returns the resolutions applied.
    pub async fn process_timeouts(&self, now: DateTime<Utc>) -> Vec<Resolution> {
        let expired: Vec<String> = {
            let inner = self.inner.lock().await;
            inner
                .pending
                .values()
                .filter(|a| a.is_expired(now))
                .map(|a| a.checkpoint_id.clone())
                .collect()
        };

        let mut resolutions = Vec::with_capacity(expired.len());
        for checkpoint_id in expired {
            match self.timeout_one(&checkpoint_id).await {
                Ok(Some(resolution)) => resolutions.push(resolution),
                Ok(None) => {}
                Err(e) => {
                    warn!(target: "acp.approvals", %checkpoint_id, error = %e, "timeout sweep item failed");
                }
            }
        }
        resolutions
    }

    async fn timeout_one(&self, checkpoint_id: &str) -> Result<Option<Resolution>, ApprovalError> {
        let mut inner = self.inner.lock().await;
        // Raced with a human resolution: nothing to do.
        let Some(mut approval) = inner.pending.remove(checkpoint_id) else {
            return Ok(None);
        };

        approval.resolved_at = Some(Utc::now());
        approval.resolved_from = Some(ResolutionSource::Timeout);
        let action = approval.timeout_action;

        let disposition = match action {
            TimeoutAction::Approve => {
                approval.status = ApprovalStatus::Approved;
                self.resume_run(&approval).await?;
                Disposition::Approved
            }
            TimeoutAction::Reject => {
                approval.status = ApprovalStatus::Timeout;
                let error = RunErrorInfo::new(
                    RunErrorKind::ApprovalTimeout,
                    format!("checkpoint '{}' expired unresolved", approval.checkpoint_id),
                    false,
                );
                match self
                    .ledger
                    .transition_state(approval.run_id, RunState::Timeout, Some(error))
                    .await
                {
                    Ok(_) | Err(LedgerError::Transition(_)) => {}
                    Err(e) => return Err(e.into()),
                }
                Disposition::TimedOut
            }
        };

        self.emit_resolution(
            &approval,
            EventPayload::CheckpointTimeout {
                checkpoint_id: approval.checkpoint_id.clone(),
                action_taken: action,
            },
        )
        .await;

        info!(
            target: "acp.approvals",
            run_id = %approval.run_id,
            checkpoint_id = %approval.checkpoint_id,
            action = ?action,
            "checkpoint timed out"
        );
        let resolution = Resolution {
            checkpoint_id: approval.checkpoint_id.clone(),
            run_id: approval.run_id,
            disposition,
        };
        finish_resolution(&mut inner, &approval, resolution.clone());
        Ok(Some(resolution))
    }

    /// List pending checkpoints, optionally filtered.
    pub async fn list_pending(
        &self,
        run_id: Option<Uuid>,
        action_type: Option<&str>,
    ) -> Vec<Approval> {
        let inner = self.inner.lock().await;
        let mut out: Vec<Approval> = inner
            .pending
            .values()
            .filter(|a| run_id.is_none_or(|id| a.run_id == id))
            .filter(|a| action_type.is_none_or(|t| a.action_type == t))
            .cloned()
            .collect();
        out.sort_by(|a, b| a.created_at.cmp(&b.created_at));
        out
    }

    /// Fetch a checkpoint by id, pending or resolved.
    pub async fn get(&self, checkpoint_id: &str) -> Option<Approval> {
        let inner = self.inner.lock().await;
        inner
            .pending
            .get(checkpoint_id)
            .cloned()
            .or_else(|| {
                inner
                    .resolved
                    .iter()
                    .rev()
                    .find(|a| a.checkpoint_id == checkpoint_id)
                    .cloned()
            })
    }

    /// Wait for a checkpoint's resolution.
    ///
    /// Returns a receiver that fires once, when the checkpoint resolves.
    /// Subscribing to an already-resolved checkpoint fires immediately.
    pub async fn subscribe_resolution(&self, checkpoint_id: &str) -> oneshot::Receiver<Resolution> {
        let (tx, rx) = oneshot::channel();
        let mut inner = self.inner.lock().await;

        if let Some(resolved) = inner
            .resolved
            .iter()
            .rev()
            .find(|a| a.checkpoint_id == checkpoint_id)
        {
            let disposition = match (resolved.status, resolved.rejection_reason) {
                (ApprovalStatus::Approved, _) => Disposition::Approved,
                (ApprovalStatus::Rejected, Some(reason)) => Disposition::Rejected { reason },
                _ => Disposition::TimedOut,
            };
            let _ = tx.send(Resolution {
                checkpoint_id: resolved.checkpoint_id.clone(),
                run_id: resolved.run_id,
                disposition,
            });
            return rx;
        }

        inner
            .waiters
            .entry(checkpoint_id.to_string())
            .or_default()
            .push(tx);
        rx
    }

    /// Resume a run out of `awaiting_approval` to its captured phase.
    async fn resume_run(
        &self,
        approval: &Approval,
    ) -> Result<Option<TransitionRecord>, ApprovalError> {
        let run = self.ledger.get_run(approval.run_id).await?;
        if run.state != RunState::AwaitingApproval {
            warn!(
                target: "acp.approvals",
                run_id = %approval.run_id,
                state = %run.state,
                "run left awaiting_approval before resolution; audit only"
            );
            return Ok(None);
        }
        let target = run.previous_state.unwrap_or(approval.requested_from_phase);
        match self.ledger.transition_state(approval.run_id, target, None).await {
            Ok(record) => Ok(Some(record)),
            Err(LedgerError::Transition(_)) => Ok(None),
            Err(e) => Err(e.into()),
        }
    }

    /// Best-effort event emission: a frozen log (run already terminal)
    /// downgrades to audit-only.
    async fn emit_resolution(&self, approval: &Approval, payload: EventPayload) {
        match self.ledger.record_event(approval.run_id, payload).await {
            Ok(_) => {}
            Err(LedgerError::Append(AppendError::RunFrozen(_))) => {
                debug!(
                    target: "acp.approvals",
                    run_id = %approval.run_id,
                    checkpoint_id = %approval.checkpoint_id,
                    "log frozen; resolution recorded in audit only"
                );
            }
            Err(e) => {
                warn!(
                    target: "acp.approvals",
                    run_id = %approval.run_id,
                    error = %e,
                    "failed to record resolution event"
                );
            }
        }
    }
}

fn take_pending(inner: &mut Inner, checkpoint_id: &str) -> Result<Approval, ApprovalError> {
    if let Some(approval) = inner.pending.remove(checkpoint_id) {
        return Ok(approval);
    }
    if inner.resolved.iter().any(|a| a.checkpoint_id == checkpoint_id) {
        return Err(ApprovalError::Conflict(checkpoint_id.to_string()));
    }
    Err(ApprovalError::NotFound(checkpoint_id.to_string()))
}

fn finish(inner: &mut Inner, approval: &Approval, disposition: Disposition) {
    let resolution = Resolution {
        checkpoint_id: approval.checkpoint_id.clone(),
        run_id: approval.run_id,
        disposition,
    };
    finish_resolution(inner, approval, resolution);
}

fn finish_resolution(inner: &mut Inner, approval: &Approval, resolution: Resolution) {
    inner.resolved.push(approval.clone());
    if let Some(waiters) = inner.waiters.remove(&approval.checkpoint_id) {
        for tx in waiters {
            let _ = tx.send(resolution.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::ContractBuilder;
    use acp_eventlog::EventLog;

    async fn service() -> (Arc<RunLedger>, ApprovalService) {
        let events = Arc::new(EventLog::new());
        let ledger = Arc::new(RunLedger::new(events));
        let service = ApprovalService::new(Arc::clone(&ledger));
        (ledger, service)
    }

    async fn executing_run(ledger: &RunLedger) -> Uuid {
        let run = ledger
            .create_run("ws-1", ContractBuilder::new("goal").build())
            .await;
        for state in [RunState::Initializing, RunState::Planning, RunState::Executing] {
            ledger.transition_state(run.run_id, state, None).await.unwrap();
        }
        run.run_id
    }

    fn request(run_id: Uuid, checkpoint_id: &str) -> ApprovalRequest {
        ApprovalRequest {
            run_id,
            checkpoint_id: checkpoint_id.into(),
            action_type: "send_email".into(),
            preview: serde_json::json!({"to": "a@example.com"}),
            timeout_seconds: 300,
            timeout_action: TimeoutAction::Reject,
        }
    }

    #[tokio::test]
    async fn request_suspends_run_and_emits_event() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;

        let approval = service.request_approval(request(run_id, "cp1")).await.unwrap();
        assert_eq!(approval.requested_from_phase, RunState::Executing);
        assert!(approval.is_pending());

        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::AwaitingApproval);
        assert_eq!(run.previous_state, Some(RunState::Executing));

        let events = ledger.events().list(run_id, None, 100, None).await.unwrap();
        assert_eq!(events.last().unwrap().event_type(), acp_core::EventType::CheckpointRequested);
    }

    #[tokio::test]
    async fn duplicate_pending_checkpoint_rejected() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;

        service.request_approval(request(run_id, "cp1")).await.unwrap();
        let err = service.request_approval(request(run_id, "cp1")).await.unwrap_err();
        assert!(matches!(err, ApprovalError::DuplicateCheckpoint(_)));
    }

    #[tokio::test]
    async fn approve_resumes_to_captured_phase() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp1")).await.unwrap();

        let outcome = service
            .approve("cp1", "u1", ResolutionSource::Web)
            .await
            .unwrap();
        assert_eq!(outcome.approval.status, ApprovalStatus::Approved);
        assert_eq!(outcome.approval.resolved_by.as_deref(), Some("u1"));

        let transition = outcome.transition.unwrap();
        assert_eq!(transition.from, RunState::AwaitingApproval);
        assert_eq!(transition.to, RunState::Executing);

        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Executing);
    }

    #[tokio::test]
    async fn double_resolution_is_conflict_and_missing_is_not_found() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp1")).await.unwrap();
        service.approve("cp1", "u1", ResolutionSource::Web).await.unwrap();

        let err = service.approve("cp1", "u2", ResolutionSource::Web).await.unwrap_err();
        assert!(matches!(err, ApprovalError::Conflict(_)));

        // Run state is untouched by the failed resolution.
        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Executing);

        let err = service.approve("nope", "u1", ResolutionSource::Web).await.unwrap_err();
        assert!(matches!(err, ApprovalError::NotFound(_)));
    }

    #[tokio::test]
    async fn reject_routes_by_reason() {
        let (ledger, service) = service().await;

        // needs_edit → paused, resumable back to executing.
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp-edit")).await.unwrap();
        let outcome = service
            .reject("cp-edit", RejectionReason::NeedsEdit, Some("u1"), ResolutionSource::Web)
            .await
            .unwrap();
        assert_eq!(outcome.transition.unwrap().to, RunState::Paused);
        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.previous_state, Some(RunState::Executing));

        // user_cancelled → cancelled.
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp-cancel")).await.unwrap();
        let outcome = service
            .reject("cp-cancel", RejectionReason::UserCancelled, None, ResolutionSource::Api)
            .await
            .unwrap();
        assert_eq!(outcome.transition.unwrap().to, RunState::Cancelled);

        // policy_violation → failed, with a contract_violation error.
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp-policy")).await.unwrap();
        service
            .reject("cp-policy", RejectionReason::PolicyViolation, Some("sec"), ResolutionSource::Web)
            .await
            .unwrap();
        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Failed);
        assert_eq!(run.error.unwrap().kind, RunErrorKind::ContractViolation);
    }

    #[tokio::test]
    async fn edit_is_a_needs_edit_rejection_with_the_new_preview() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp1")).await.unwrap();

        let edited = serde_json::json!({"to": "b@example.com"});
        let outcome = service
            .edit("cp1", edited.clone(), Some("u1"), ResolutionSource::Web)
            .await
            .unwrap();
        assert_eq!(outcome.approval.rejection_reason, Some(RejectionReason::NeedsEdit));
        assert_eq!(outcome.approval.preview, edited);
        assert_eq!(outcome.transition.unwrap().to, RunState::Paused);

        // The audit keeps the edited preview.
        assert_eq!(service.get("cp1").await.unwrap().preview, edited);
    }

    #[tokio::test]
    async fn timeout_reject_terminates_in_timeout_state() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        let mut req = request(run_id, "cp1");
        req.timeout_seconds = 1;
        service.request_approval(req).await.unwrap();

        let resolutions = service
            .process_timeouts(Utc::now() + Duration::seconds(5))
            .await;
        assert_eq!(resolutions.len(), 1);
        assert_eq!(resolutions[0].disposition, Disposition::TimedOut);

        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Timeout);
        assert_eq!(run.error.unwrap().kind, RunErrorKind::ApprovalTimeout);

        let audited = service.get("cp1").await.unwrap();
        assert_eq!(audited.status, ApprovalStatus::Timeout);
        assert_eq!(audited.resolved_from, Some(ResolutionSource::Timeout));
    }

    #[tokio::test]
    async fn timeout_approve_resumes_run() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        let mut req = request(run_id, "cp1");
        req.timeout_seconds = 1;
        req.timeout_action = TimeoutAction::Approve;
        service.request_approval(req).await.unwrap();

        let resolutions = service
            .process_timeouts(Utc::now() + Duration::seconds(5))
            .await;
        assert_eq!(resolutions[0].disposition, Disposition::Approved);

        let run = ledger.get_run(run_id).await.unwrap();
        assert_eq!(run.state, RunState::Executing);
    }

    #[tokio::test]
    async fn sweep_skips_unexpired() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp1")).await.unwrap();

        let resolutions = service.process_timeouts(Utc::now()).await;
        assert!(resolutions.is_empty());
        assert_eq!(service.list_pending(None, None).await.len(), 1);
    }

    #[tokio::test]
    async fn bulk_approve_is_independent_per_item() {
        let (ledger, service) = service().await;
        let run_a = executing_run(&ledger).await;
        let run_b = executing_run(&ledger).await;
        service.request_approval(request(run_a, "cp-a")).await.unwrap();
        service.request_approval(request(run_b, "cp-b")).await.unwrap();

        let outcomes = service
            .bulk_approve(
                &BulkSelector {
                    run_id: None,
                    action_type: Some("send_email".into()),
                },
                "u1",
            )
            .await;
        assert_eq!(outcomes.len(), 2);
        assert!(outcomes.iter().all(|o| o.outcome == "approved"));

        for run_id in [run_a, run_b] {
            let run = ledger.get_run(run_id).await.unwrap();
            assert_eq!(run.state, RunState::Executing);
            // Bulk resolutions are audited with their source.
            let events = ledger.events().list(run_id, None, 100, None).await.unwrap();
            let approved = events
                .iter()
                .find(|e| e.event_type() == acp_core::EventType::CheckpointApproved)
                .unwrap();
            let v = serde_json::to_value(approved).unwrap();
            assert_eq!(v["source"], "bulk");
        }
    }

    #[tokio::test]
    async fn waiters_are_notified_on_resolution() {
        let (ledger, service) = service().await;
        let run_id = executing_run(&ledger).await;
        service.request_approval(request(run_id, "cp1")).await.unwrap();

        let rx = service.subscribe_resolution("cp1").await;
        service.approve("cp1", "u1", ResolutionSource::Mobile).await.unwrap();

        let resolution = rx.await.unwrap();
        assert_eq!(resolution.checkpoint_id, "cp1");
        assert_eq!(resolution.disposition, Disposition::Approved);

        // Late subscribers see the resolution immediately.
        let rx = service.subscribe_resolution("cp1").await;
        assert_eq!(rx.await.unwrap().disposition, Disposition::Approved);
    }

    #[tokio::test]
    async fn list_pending_filters() {
        let (ledger, service) = service().await;
        let run_a = executing_run(&ledger).await;
        let run_b = executing_run(&ledger).await;
        service.request_approval(request(run_a, "cp-a")).await.unwrap();
        let mut other = request(run_b, "cp-b");
        other.action_type = "delete_repo".into();
        service.request_approval(other).await.unwrap();

        assert_eq!(service.list_pending(None, None).await.len(), 2);
        assert_eq!(service.list_pending(Some(run_a), None).await.len(), 1);
        assert_eq!(
            service.list_pending(None, Some("delete_repo")).await.len(),
            1
        );
    }
}
