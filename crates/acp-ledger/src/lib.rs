// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-ledger
#![deny(unsafe_code)]
#![warn(missing_docs)]

use acp_core::{
    ArtifactRef, Contract, Event, EventPayload, Run, RunErrorInfo, RunState, TransitionError,
    TransitionRecord, apply_transition,
};
use acp_eventlog::{AppendError, EventLog};
use chrono::Utc;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{Mutex, RwLock};
use tracing::{debug, info};
use uuid::Uuid;

/// Errors from ledger operations.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum LedgerError {
    /// No run with this id exists.
    #[error("unknown run: {0}")]
    RunUnknown(Uuid),

    /// The requested state transition is not allowed.
    #[error(transparent)]
    Transition(#[from] TransitionError),

    /// Appending to the run's event log failed.
    #[error(transparent)]
    Append(#[from] AppendError),
}

/// Compact run view used by listings and the kanban board.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunSummary {
    /// Run identifier.
    pub run_id: Uuid,
    /// Workspace the run belongs to.
    pub workspace_id: String,
    /// The contract goal, for display.
    pub goal: String,
    /// Current state.
    pub state: RunState,
    /// Total spend so far, in cents.
    pub total_cents: u64,
    /// Last mutation timestamp.
    pub updated_at: chrono::DateTime<Utc>,
}

impl From<&Run> for RunSummary {
    fn from(run: &Run) -> Self {
        Self {
            run_id: run.run_id,
            workspace_id: run.workspace_id.clone(),
            goal: run.contract.goal.clone(),
            state: run.state,
            total_cents: run.total_cents(),
            updated_at: run.updated_at,
        }
    }
}

/// Precomputed grouping of runs for board-style UIs.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct KanbanBoard {
    /// `pending` and `initializing` runs.
    pub queue: Vec<RunSummary>,
    /// Actively progressing runs.
    pub running: Vec<RunSummary>,
    /// Runs blocked on a human (`awaiting_approval`, `paused`).
    pub needs_human: Vec<RunSummary>,
    /// Completed runs.
    pub done: Vec<RunSummary>,
    /// Failed, cancelled, and timed-out runs.
    pub failed: Vec<RunSummary>,
}

/// Process-wide run ledger.
///
/// The only writer of `state`, `previous_state`, lifecycle timestamps, and
/// cost fields. Constructed once at startup with the event log handle so
/// run registration and run state stay in step.
pub struct RunLedger {
    runs: RwLock<HashMap<Uuid, Arc<Mutex<Run>>>>,
    events: Arc<EventLog>,
}

impl RunLedger {
    /// Create a ledger sharing the given event log.
    #[must_use]
    pub fn new(events: Arc<EventLog>) -> Self {
        Self {
            runs: RwLock::new(HashMap::new()),
            events,
        }
    }

    /// Create a run in `pending` from a contract snapshot and register its
    /// event log.
    pub async fn create_run(&self, workspace_id: impl Into<String>, contract: Contract) -> Run {
        let run = Run::new(workspace_id, contract);
        self.events.register_run(run.run_id).await;
        info!(target: "acp.ledger", run_id = %run.run_id, "run created");
        let snapshot = run.clone();
        self.runs
            .write()
            .await
            .insert(run.run_id, Arc::new(Mutex::new(run)));
        snapshot
    }

    /// Create a run that failed preflight validation.
    ///
    /// The run is born terminal (`failed`, error recorded, `completed_at`
    /// set) without ever entering the transition table; its event log is
    /// registered so clients can still subscribe and observe the closure.
    pub async fn create_rejected(
        &self,
        workspace_id: impl Into<String>,
        contract: Contract,
        error: RunErrorInfo,
    ) -> Run {
        let mut run = Run::new(workspace_id, contract);
        let now = Utc::now();
        run.state = RunState::Failed;
        run.completed_at = Some(now);
        run.updated_at = now;
        run.error = Some(error);
        self.events.register_run(run.run_id).await;
        info!(target: "acp.ledger", run_id = %run.run_id, "run rejected at preflight");
        let snapshot = run.clone();
        self.runs
            .write()
            .await
            .insert(run.run_id, Arc::new(Mutex::new(run)));
        snapshot
    }

    async fn run_slot(&self, run_id: Uuid) -> Result<Arc<Mutex<Run>>, LedgerError> {
        self.runs
            .read()
            .await
            .get(&run_id)
            .cloned()
            .ok_or(LedgerError::RunUnknown(run_id))
    }

    /// Fetch a consistent snapshot of a run.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] if no run with this id exists.
    pub async fn get_run(&self, run_id: Uuid) -> Result<Run, LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let run = slot.lock().await;
        Ok(run.clone())
    }

    /// List summaries for a workspace, newest first.
    pub async fn list_by_workspace(&self, workspace_id: &str) -> Vec<RunSummary> {
        self.collect(|run| run.workspace_id == workspace_id).await
    }

    /// List summaries in a given state, newest first.
    pub async fn list_by_state(&self, state: RunState) -> Vec<RunSummary> {
        self.collect(|run| run.state == state).await
    }

    /// List every run, newest first.
    pub async fn list_all(&self) -> Vec<RunSummary> {
        self.collect(|_| true).await
    }

    async fn collect(&self, keep: impl Fn(&Run) -> bool) -> Vec<RunSummary> {
        let slots: Vec<Arc<Mutex<Run>>> = self.runs.read().await.values().cloned().collect();
        let mut out = Vec::new();
        for slot in slots {
            let run = slot.lock().await;
            if keep(&run) {
                out.push(RunSummary::from(&*run));
            }
        }
        out.sort_by(|a, b| b.updated_at.cmp(&a.updated_at));
        out
    }

    /// Group all runs into the kanban columns.
    pub async fn kanban_board(&self) -> KanbanBoard {
        let mut board = KanbanBoard::default();
        for summary in self.list_all().await {
            match summary.state {
                RunState::Pending | RunState::Initializing => board.queue.push(summary),
                RunState::Planning
                | RunState::Executing
                | RunState::Verifying
                | RunState::Packaging => board.running.push(summary),
                RunState::AwaitingApproval | RunState::Paused => board.needs_human.push(summary),
                RunState::Completed => board.done.push(summary),
                RunState::Failed | RunState::Cancelled | RunState::Timeout => {
                    board.failed.push(summary)
                }
            }
        }
        board
    }

    /// Apply a state transition through the pure state machine.
    ///
    /// When `error` is provided it is recorded on the run document (used by
    /// transitions into `failed` and `timeout`).
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] or a [`TransitionError`]; in the latter
    /// case the run is untouched.
    pub async fn transition_state(
        &self,
        run_id: Uuid,
        new_state: RunState,
        error: Option<RunErrorInfo>,
    ) -> Result<TransitionRecord, LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        let record = apply_transition(&mut run, new_state)?;
        if let Some(error) = error {
            run.error = Some(error);
        }
        debug!(
            target: "acp.ledger",
            %run_id,
            from = %record.from,
            to = %record.to,
            "state transition"
        );
        Ok(record)
    }

    /// Accumulate cost deltas. Returns the new `(compute, api)` totals.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] if no run with this id exists.
    pub async fn update_cost(
        &self,
        run_id: Uuid,
        d_compute_cents: u64,
        d_api_cents: u64,
    ) -> Result<(u64, u64), LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        run.compute_cents += d_compute_cents;
        run.api_cents += d_api_cents;
        run.updated_at = Utc::now();
        Ok((run.compute_cents, run.api_cents))
    }

    /// Record an artifact pointer on the run document.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] if no run with this id exists.
    pub async fn add_artifact(&self, run_id: Uuid, artifact: ArtifactRef) -> Result<(), LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        run.artifacts.push(artifact);
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Record the sequence number of the last appended event.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] if no run with this id exists.
    pub async fn set_last_event_seq(&self, run_id: Uuid, seq: i64) -> Result<(), LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        run.last_event_seq = seq;
        run.updated_at = Utc::now();
        Ok(())
    }

    /// Append an event for a run and keep `last_event_seq` in step.
    ///
    /// The sequence number is assigned by the event log under the run's
    /// lock; the event's `phase` is the run's current state. Subscribers
    /// therefore never observe an event whose state is not yet readable.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] or the underlying [`AppendError`].
    pub async fn record_event(
        &self,
        run_id: Uuid,
        payload: EventPayload,
    ) -> Result<Event, LedgerError> {
        self.record_event_with_severity(run_id, payload, None).await
    }

    /// [`record_event`](Self::record_event) with an explicit severity.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] or the underlying [`AppendError`].
    pub async fn record_event_with_severity(
        &self,
        run_id: Uuid,
        payload: EventPayload,
        severity: Option<acp_core::Severity>,
    ) -> Result<Event, LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        let event = self
            .events
            .emit_with_severity(run_id, run.state, payload, severity)
            .await?;
        run.last_event_seq = event.seq as i64;
        run.updated_at = Utc::now();
        Ok(event)
    }

    /// Append a terminal event and freeze the run's log in one step.
    ///
    /// # Errors
    ///
    /// [`LedgerError::RunUnknown`] or the underlying [`AppendError`].
    pub async fn record_closing_event(
        &self,
        run_id: Uuid,
        payload: EventPayload,
    ) -> Result<Event, LedgerError> {
        let slot = self.run_slot(run_id).await?;
        let mut run = slot.lock().await;
        let event = self.events.emit_closing(run_id, run.state, payload).await?;
        run.last_event_seq = event.seq as i64;
        run.updated_at = Utc::now();
        Ok(event)
    }

    /// Handle to the shared event log.
    #[must_use]
    pub fn events(&self) -> &Arc<EventLog> {
        &self.events
    }
}
