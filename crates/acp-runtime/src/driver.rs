// SPDX-License-Identifier: MIT OR Apache-2.0
//! The per-run driver task.
//!
//! One driver owns one run end to end: sandbox lifecycle, signal
//! normalization, contract enforcement, checkpoint waits, cost tracking,
//! and the terminal packaging/trace/closing sequence. Drivers never hold
//! the run lock across suspension points; every mutation goes through the
//! ledger.

use crate::cancel::CancelSignal;
use crate::verify::{ProducedArtifact, RecordedToolResult, evaluate_criteria};
use crate::{Shared, deliver_via};
use acp_approvals::{ApprovalError, ApprovalRequest, Disposition, Resolution};
use acp_core::{
    ApprovalRule, ArtifactRef, ArtifactStatus, Contract, ConstraintSeverity, EventPayload,
    RejectionReason, Run, RunErrorKind, RunState, Severity, TimeoutAction,
};
use acp_cost::CostTracker;
use acp_error::{RetryPolicy, RunError, retry_with_policy};
use acp_eventlog::AppendError;
use acp_ledger::LedgerError;
use acp_policy::{ContractValidator, ToolDecision, find_rule, should_gate};
use acp_sandbox::{
    AgentDirective, AgentFailure, AgentMessage, AgentResult, SandboxHandle, SandboxSignal,
    SandboxSpec,
};
use acp_vault::{ArtifactWrite, TraceReport};
use chrono::Utc;
use std::collections::{BTreeMap, BTreeSet};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::Ordering;
use std::time::Duration;
use tokio::sync::{mpsc, oneshot};
use tokio::time::Instant;
use tracing::{debug, info, warn};
use uuid::Uuid;

// Applied when the agent raises a checkpoint no approval rule covers.
const UNRULED_TIMEOUT_ACTION: TimeoutAction = TimeoutAction::Reject;

/// How one pump iteration ended.
enum Step {
    Continue,
    AwaitResolution(oneshot::Receiver<Resolution>),
    End(DriveEnd),
}

/// Why the drive loop stopped.
enum DriveEnd {
    /// The agent reported completion; run the success path.
    Completed,
    /// The cancel signal fired; the run is already `cancelled`.
    Cancelled,
    /// A checkpoint resolution terminated the run (state already set by
    /// the approval service).
    ResolvedTerminal,
    /// The driver must fail the run with this error.
    Failed(RunError),
}

/// One run's driver. Spawned by the orchestrator, consumed by [`run`].
pub struct Driver {
    shared: Arc<Shared>,
    run_id: Uuid,
    workspace_id: String,
    cancel: CancelSignal,
    handle: Option<SandboxHandle>,
    produced: Vec<ProducedArtifact>,
    tool_results: Vec<RecordedToolResult>,
    seen_actions: BTreeSet<String>,
    retry_history: Vec<BTreeMap<String, serde_json::Value>>,
    nudged: bool,
    packaged: bool,
    trace_written: bool,
}

impl Driver {
    pub(crate) fn new(
        shared: Arc<Shared>,
        run_id: Uuid,
        workspace_id: String,
        cancel: CancelSignal,
    ) -> Self {
        Self {
            shared,
            run_id,
            workspace_id,
            cancel,
            handle: None,
            produced: Vec::new(),
            tool_results: Vec::new(),
            seen_actions: BTreeSet::new(),
            retry_history: Vec::new(),
            nudged: false,
            packaged: false,
            trace_written: false,
        }
    }

    /// Drive the run to a terminal state, then clean up.
    pub async fn run(mut self) {
        let end = match self.load().await {
            Ok((contract, validator, cost, deadline)) => {
                self.drive(&contract, &validator, &cost, deadline).await
            }
            Err(e) => DriveEnd::Failed(e),
        };
        self.finalize(end).await;

        if let Some(handle) = self.handle.take() {
            let _ = self.shared.adapter.stop(&handle, "run finished").await;
        }
        self.shared.sessions.remove(self.run_id).await;
        self.shared.drivers.lock().await.remove(&self.run_id);
        self.shared.active.fetch_sub(1, Ordering::SeqCst);
    }

    async fn load(
        &self,
    ) -> Result<(Contract, ContractValidator, CostTracker, Instant), RunError> {
        let run = self
            .shared
            .ledger
            .get_run(self.run_id)
            .await
            .map_err(|e| RunError::new(RunErrorKind::AgentError, e.to_string()))?;

        let validator = ContractValidator::compile(&run.contract, &self.shared.registry)
            .map_err(|e| RunError::new(RunErrorKind::ContractViolation, format!("{e:#}")))?;
        let cost = CostTracker::for_contract(&run.contract);

        // Wall-clock deadline armed on started_at.
        let started_at = run.started_at.unwrap_or(run.created_at);
        let elapsed = (Utc::now() - started_at).to_std().unwrap_or_default();
        let budget = Duration::from_secs(run.contract.max_duration_seconds);
        let deadline = Instant::now() + budget.saturating_sub(elapsed);

        Ok((run.contract.clone(), validator, cost, deadline))
    }

    async fn drive(
        &mut self,
        contract: &Contract,
        validator: &ContractValidator,
        cost: &CostTracker,
        deadline: Instant,
    ) -> DriveEnd {
        let mut recovery_used = false;
        let mut first_attempt = true;

        loop {
            let stream = match self.provision(contract).await {
                Ok(stream) => stream,
                Err(e) => return DriveEnd::Failed(e),
            };

            if first_attempt {
                first_attempt = false;
                match self
                    .shared
                    .ledger
                    .transition_state(self.run_id, RunState::Planning, None)
                    .await
                {
                    Ok(record) => {
                        self.record(EventPayload::PhaseChanged {
                            from: record.from,
                            to: record.to,
                        })
                        .await;
                    }
                    Err(e) => {
                        // Cancelled while initializing.
                        debug!(target: "acp.runtime", run_id = %self.run_id, error = %e, "skipping planning transition");
                        return DriveEnd::Cancelled;
                    }
                }
            }

            let end = self.pump(contract, validator, cost, deadline, stream).await;
            match end {
                DriveEnd::Failed(ref error) if error.kind == RunErrorKind::SandboxCrash && !recovery_used => {
                    recovery_used = true;
                    info!(target: "acp.runtime", run_id = %self.run_id, "attempting sandbox recovery");
                    self.record_with_severity(
                        EventPayload::DriftDetected {
                            rule: "recovery".into(),
                            reason: format!("sandbox crashed ({}); recovering", error.message),
                            tool: None,
                            fallback: None,
                        },
                        Severity::Info,
                    )
                    .await;
                    if let Some(handle) = self.handle.take() {
                        let _ = self.shared.adapter.stop(&handle, "crashed").await;
                    }
                    continue;
                }
                end => return end,
            }
        }
    }

    /// Provision a sandbox with transient-failure retries: create, mount
    /// input files, open the signal stream.
    async fn provision(
        &mut self,
        contract: &Contract,
    ) -> Result<mpsc::Receiver<SandboxSignal>, RunError> {
        let policy = RetryPolicy::for_kind(RunErrorKind::Transient);
        let adapter = Arc::clone(&self.shared.adapter);
        let spec = SandboxSpec {
            template: contract.template_id.clone(),
            scopes: contract.integration_scopes.clone(),
            env: BTreeMap::new(),
            env_allowlist: vec![],
        };
        let input_files = contract.input_files.clone();

        let outcome = retry_with_policy(&policy, move || {
            let adapter = Arc::clone(&adapter);
            let spec = spec.clone();
            let input_files = input_files.clone();
            async move {
                let handle = adapter
                    .create(spec)
                    .await
                    .map_err(|e| RunError::new(RunErrorKind::Transient, e.to_string()))?;
                for file in &input_files {
                    adapter
                        .upload(&handle, Path::new(file), file)
                        .await
                        .map_err(|e| {
                            RunError::new(RunErrorKind::Transient, e.to_string())
                                .with_context("input_file", file.as_str())
                        })?;
                }
                let stream = adapter
                    .stream(&handle)
                    .await
                    .map_err(|e| RunError::new(RunErrorKind::Transient, e.to_string()))?;
                Ok((handle, stream))
            }
        })
        .await;

        if outcome.metadata.total_attempts > 1 {
            self.retry_history.push(outcome.metadata.to_trace_context());
        }
        let (handle, stream) = outcome.result?;

        self.shared
            .sessions
            .insert(acp_core::AgentSession::new(
                self.run_id,
                contract.template_id.clone(),
                handle.id.clone(),
            ))
            .await;
        if let Some(entry) = self.shared.drivers.lock().await.get_mut(&self.run_id) {
            entry.sandbox = Some(handle.clone());
        }
        self.handle = Some(handle);
        Ok(stream)
    }

    /// The select loop: signals, cancellation, deadline, approval waits.
    async fn pump(
        &mut self,
        contract: &Contract,
        validator: &ContractValidator,
        cost: &CostTracker,
        deadline: Instant,
        mut stream: mpsc::Receiver<SandboxSignal>,
    ) -> DriveEnd {
        let cancel = self.cancel.clone();
        let mut pending: Option<oneshot::Receiver<Resolution>> = None;

        loop {
            // The stall clock does not run while a human holds the run.
            let stall = if pending.is_some() {
                None
            } else {
                self.shared.options.stall_timeout
            };

            let step = tokio::select! {
                () = cancel.cancelled() => Step::End(DriveEnd::Cancelled),

                () = tokio::time::sleep_until(deadline) => Step::End(DriveEnd::Failed(
                    RunError::new(
                        RunErrorKind::Timeout,
                        format!(
                            "run exceeded max_duration_seconds ({})",
                            contract.max_duration_seconds
                        ),
                    ),
                )),

                resolution = wait_resolution(&mut pending) => {
                    pending = None;
                    match resolution {
                        Some(resolution) => self.on_resolution(resolution).await,
                        None => Step::Continue,
                    }
                }

                signal = next_signal(&mut stream, stall) => match signal {
                    SignalEvent::Signal(Some(signal)) => {
                        self.nudged = false;
                        self.on_signal(contract, validator, cost, signal).await
                    }
                    SignalEvent::Signal(None) => Step::End(DriveEnd::Failed(RunError::new(
                        RunErrorKind::SandboxCrash,
                        "sandbox exited without completing the run",
                    ))),
                    SignalEvent::Stalled => self.on_stall().await,
                },
            };

            match step {
                Step::Continue => {}
                Step::AwaitResolution(rx) => pending = Some(rx),
                Step::End(end) => return end,
            }
        }
    }

    async fn on_stall(&mut self) -> Step {
        if !self.nudged {
            self.nudged = true;
            self.record_with_severity(
                EventPayload::DriftDetected {
                    rule: "stalled".into(),
                    reason: "no sandbox signal within the heartbeat window; nudged".into(),
                    tool: None,
                    fallback: None,
                },
                Severity::Info,
            )
            .await;
            deliver_via(&self.shared, self.run_id, AgentDirective::Nudge).await;
            return Step::Continue;
        }
        Step::End(DriveEnd::Failed(RunError::new(
            RunErrorKind::Stalled,
            "no progress after a nudge",
        )))
    }

    async fn on_signal(
        &mut self,
        contract: &Contract,
        validator: &ContractValidator,
        cost: &CostTracker,
        signal: SandboxSignal,
    ) -> Step {
        match signal {
            SandboxSignal::Heartbeat => {
                self.shared.sessions.heartbeat(self.run_id).await;
                Step::Continue
            }
            SandboxSignal::Stderr(line) => {
                debug!(target: "acp.runtime", run_id = %self.run_id, %line, "sandbox stderr");
                Step::Continue
            }
            SandboxSignal::Stdout(message) => {
                self.on_message(contract, validator, cost, message).await
            }
            SandboxSignal::Result(AgentResult::Artifact {
                deliverable_id,
                sandbox_path,
            }) => {
                self.on_artifact(contract, deliverable_id, sandbox_path).await;
                Step::Continue
            }
            SandboxSignal::Result(AgentResult::Complete { message }) => {
                debug!(
                    target: "acp.runtime",
                    run_id = %self.run_id,
                    message = message.as_deref().unwrap_or(""),
                    "agent reported completion"
                );
                Step::End(DriveEnd::Completed)
            }
            SandboxSignal::Error(failure) => Step::End(DriveEnd::Failed(classify(failure))),
        }
    }

    async fn on_message(
        &mut self,
        contract: &Contract,
        validator: &ContractValidator,
        cost: &CostTracker,
        message: AgentMessage,
    ) -> Step {
        match message {
            AgentMessage::Phase { phase } => {
                self.advance_phase(phase).await;
                Step::Continue
            }
            AgentMessage::ToolCall {
                tool,
                tool_use_id,
                args,
            } => self.on_tool_call(validator, tool, tool_use_id, args).await,
            AgentMessage::ToolResult {
                tool,
                tool_use_id,
                output,
                is_error,
            } => {
                self.tool_results.push(RecordedToolResult {
                    tool: tool.clone(),
                    output: output.clone(),
                    is_error,
                });
                self.record(EventPayload::ToolResult {
                    tool,
                    tool_use_id,
                    output,
                    is_error,
                })
                .await;
                Step::Continue
            }
            AgentMessage::FileChanged { path, summary } => {
                self.record(EventPayload::FileChanged { path, summary }).await;
                Step::Continue
            }
            AgentMessage::Checkpoint {
                checkpoint_id,
                action_type,
                preview,
            } => {
                self.on_checkpoint(contract, checkpoint_id, action_type, preview)
                    .await
            }
            AgentMessage::Usage {
                compute_cents,
                api_cents,
            } => self.on_usage(cost, compute_cents, api_cents).await,
            AgentMessage::Log { text } => {
                debug!(target: "acp.runtime", run_id = %self.run_id, %text, "agent log");
                Step::Continue
            }
        }
    }

    async fn on_tool_call(
        &mut self,
        validator: &ContractValidator,
        tool: String,
        tool_use_id: Option<String>,
        args: serde_json::Value,
    ) -> Step {
        match validator.check_tool_call(&tool, &args) {
            ToolDecision::Allow => {
                self.record(EventPayload::ToolCalled {
                    tool,
                    tool_use_id,
                    args,
                })
                .await;
                Step::Continue
            }
            ToolDecision::Deny(report) => {
                let severity = report.severity;
                let reason = report.reason.clone();
                let fallback = report.fallback.clone();
                self.record(report.into_payload()).await;
                deliver_via(
                    &self.shared,
                    self.run_id,
                    AgentDirective::ToolDenied {
                        tool,
                        reason: reason.clone(),
                        fallback,
                    },
                )
                .await;

                if severity == ConstraintSeverity::Fail {
                    return Step::End(DriveEnd::Failed(RunError::new(
                        RunErrorKind::ContractViolation,
                        reason,
                    )));
                }
                Step::Continue
            }
        }
    }

    async fn on_checkpoint(
        &mut self,
        contract: &Contract,
        checkpoint_id: String,
        action_type: String,
        preview: serde_json::Value,
    ) -> Step {
        let default_rule = ApprovalRule {
            action_type: action_type.clone(),
            condition: acp_core::ApprovalCondition::Always,
            timeout_seconds: self.shared.options.default_checkpoint_timeout_secs,
            auto_action_on_timeout: UNRULED_TIMEOUT_ACTION,
        };
        let rule = find_rule(contract, &action_type).unwrap_or(&default_rule);
        let gate = should_gate(rule, &self.seen_actions, &contract.integration_scopes);
        self.seen_actions.insert(action_type.clone());

        if !gate {
            deliver_via(
                &self.shared,
                self.run_id,
                AgentDirective::CheckpointResolved {
                    checkpoint_id,
                    approved: true,
                    reason: None,
                },
            )
            .await;
            return Step::Continue;
        }

        let request = ApprovalRequest {
            run_id: self.run_id,
            checkpoint_id: checkpoint_id.clone(),
            action_type,
            preview,
            timeout_seconds: rule.timeout_seconds,
            timeout_action: rule.auto_action_on_timeout,
        };
        match self.shared.approvals.request_approval(request).await {
            Ok(_) => {
                let rx = self.shared.approvals.subscribe_resolution(&checkpoint_id).await;
                Step::AwaitResolution(rx)
            }
            Err(ApprovalError::DuplicateCheckpoint(id)) => {
                warn!(target: "acp.runtime", run_id = %self.run_id, checkpoint_id = %id, "duplicate checkpoint id from agent");
                deliver_via(
                    &self.shared,
                    self.run_id,
                    AgentDirective::CheckpointResolved {
                        checkpoint_id: id,
                        approved: false,
                        reason: Some("duplicate checkpoint id".into()),
                    },
                )
                .await;
                Step::Continue
            }
            Err(e) => Step::End(DriveEnd::Failed(RunError::new(
                RunErrorKind::AgentError,
                format!("checkpoint request failed: {e}"),
            ))),
        }
    }

    async fn on_resolution(&mut self, resolution: Resolution) -> Step {
        let (approved, reason) = match &resolution.disposition {
            Disposition::Approved => (true, None),
            Disposition::Rejected { reason } => (false, Some(reason.to_string())),
            Disposition::TimedOut => (false, Some("timeout".to_string())),
        };
        deliver_via(
            &self.shared,
            self.run_id,
            AgentDirective::CheckpointResolved {
                checkpoint_id: resolution.checkpoint_id.clone(),
                approved,
                reason,
            },
        )
        .await;

        match resolution.disposition {
            Disposition::Approved => Step::Continue,
            // Paused for edits: the run resumes through the API; the agent
            // waits for the resume directive.
            Disposition::Rejected {
                reason: RejectionReason::NeedsEdit,
            } => Step::Continue,
            Disposition::Rejected { .. } | Disposition::TimedOut => {
                Step::End(DriveEnd::ResolvedTerminal)
            }
        }
    }

    async fn on_usage(&mut self, cost: &CostTracker, compute_cents: u64, api_cents: u64) -> Step {
        cost.record(compute_cents, api_cents);
        if let Err(e) = self
            .shared
            .ledger
            .update_cost(self.run_id, compute_cents, api_cents)
            .await
        {
            warn!(target: "acp.runtime", run_id = %self.run_id, error = %e, "cost update failed");
        }
        self.shared
            .spend
            .record(&self.workspace_id, compute_cents + api_cents, Utc::now());

        match cost.check() {
            acp_cost::BudgetStatus::Exceeded(violation) => {
                Step::End(DriveEnd::Failed(
                    RunError::new(
                        RunErrorKind::ContractViolation,
                        format!("cost budget exceeded: {violation}"),
                    )
                    .with_context("limit_cents", violation.limit_cents)
                    .with_context("used_cents", violation.used_cents),
                ))
            }
            acp_cost::BudgetStatus::Approaching {
                used_cents,
                limit_cents,
            } => {
                warn!(
                    target: "acp.runtime",
                    run_id = %self.run_id,
                    used_cents,
                    limit_cents,
                    "run approaching its cost cap"
                );
                Step::Continue
            }
            acp_cost::BudgetStatus::WithinLimits => Step::Continue,
        }
    }

    async fn on_artifact(
        &mut self,
        contract: &Contract,
        deliverable_id: String,
        sandbox_path: String,
    ) {
        let Some(handle) = self.handle.clone() else {
            return;
        };
        let bytes = match self.shared.adapter.extract(&handle, &sandbox_path).await {
            Ok(bytes) => bytes,
            Err(e) => {
                warn!(
                    target: "acp.runtime",
                    run_id = %self.run_id,
                    %sandbox_path,
                    error = %e,
                    "artifact extraction failed"
                );
                return;
            }
        };

        let kind = contract
            .deliverables
            .iter()
            .find(|d| d.id == deliverable_id)
            .map_or_else(|| "file".to_string(), |d| d.kind.clone());

        self.record(EventPayload::ArtifactCreated {
            artifact: ArtifactRef {
                id: deliverable_id.clone(),
                kind,
                path: sandbox_path.clone(),
            },
        })
        .await;
        self.produced.push(ProducedArtifact {
            deliverable_id,
            sandbox_path,
            bytes,
        });
    }

    /// Walk the run forward to a declared phase, passing through the legal
    /// chain, and record one `phase.changed` for the hop.
    async fn advance_phase(&mut self, target: RunState) {
        const CHAIN: [RunState; 4] = [
            RunState::Planning,
            RunState::Executing,
            RunState::Verifying,
            RunState::Packaging,
        ];
        if !CHAIN.contains(&target) {
            warn!(target: "acp.runtime", run_id = %self.run_id, declared = %target, "agent declared a non-phase state");
            return;
        }
        let Ok(run) = self.shared.ledger.get_run(self.run_id).await else {
            return;
        };
        let from = run.state;
        if from == target {
            return;
        }

        let path: Vec<RunState> = match (
            CHAIN.iter().position(|s| *s == from),
            CHAIN.iter().position(|s| *s == target),
        ) {
            (Some(a), Some(b)) if a < b => CHAIN[a + 1..=b].to_vec(),
            _ if from.can_transition_to(target) => vec![target],
            _ => {
                warn!(
                    target: "acp.runtime",
                    run_id = %self.run_id,
                    %from,
                    declared = %target,
                    "ignoring unreachable phase declaration"
                );
                return;
            }
        };

        for state in path {
            if self
                .shared
                .ledger
                .transition_state(self.run_id, state, None)
                .await
                .is_err()
            {
                return;
            }
        }
        self.record(EventPayload::PhaseChanged { from, to: target }).await;
    }

    // -- terminal paths ------------------------------------------------------

    async fn finalize(&mut self, end: DriveEnd) {
        match end {
            DriveEnd::Completed => self.finish_success().await,
            DriveEnd::Cancelled | DriveEnd::ResolvedTerminal => self.finish_aborted().await,
            DriveEnd::Failed(error) => {
                self.fail_run(error).await;
                self.finish_aborted().await;
            }
        }
    }

    /// Transition to `failed`, stepping out of `paused` first when needed
    /// (the table only lets a paused run resume or cancel).
    async fn fail_run(&mut self, error: RunError) {
        let Ok(run) = self.shared.ledger.get_run(self.run_id).await else {
            return;
        };
        if run.is_terminal() {
            return;
        }
        if run.state == RunState::Paused {
            let target = run.previous_state.unwrap_or(RunState::Planning);
            let _ = self
                .shared
                .ledger
                .transition_state(self.run_id, target, None)
                .await;
        }
        let info = error.into_info();
        if let Err(e) = self
            .shared
            .ledger
            .transition_state(self.run_id, RunState::Failed, Some(info))
            .await
        {
            warn!(target: "acp.runtime", run_id = %self.run_id, error = %e, "failed-state transition rejected");
        }
    }

    async fn finish_success(&mut self) {
        // Advance through verification into packaging; a run that never
        // declared phases walks the whole chain silently.
        self.advance_phase(RunState::Packaging).await;

        let run = match self.shared.ledger.get_run(self.run_id).await {
            Ok(run) => run,
            Err(e) => {
                warn!(target: "acp.runtime", run_id = %self.run_id, error = %e, "run vanished before packaging");
                return;
            }
        };

        // Raced with an external cancel: fall back to the abort path.
        if run.is_terminal() {
            self.finish_aborted().await;
            return;
        }

        let verification = evaluate_criteria(&run.contract, &self.produced, &self.tool_results);
        let missing_required = run
            .contract
            .deliverables
            .iter()
            .filter(|d| d.required)
            .any(|d| !self.produced.iter().any(|p| p.deliverable_id == d.id));
        let status = if missing_required {
            ArtifactStatus::Partial
        } else {
            ArtifactStatus::Final
        };

        let artifact_count = self.package_artifacts(&run, status).await;
        self.write_trace(verification).await;

        if self
            .shared
            .ledger
            .transition_state(self.run_id, RunState::Completed, None)
            .await
            .is_err()
        {
            // Cancelled during packaging; close as aborted instead.
            self.finish_aborted().await;
            return;
        }
        let _ = self
            .shared
            .ledger
            .record_closing_event(self.run_id, EventPayload::RunCompleted { artifact_count })
            .await;
        info!(target: "acp.runtime", run_id = %self.run_id, artifact_count, "run completed");
    }

    /// Terminal path for cancelled / failed / timed-out runs: partial
    /// results are always preserved before the log closes.
    async fn finish_aborted(&mut self) {
        let Ok(run) = self.shared.ledger.get_run(self.run_id).await else {
            return;
        };

        let _ = self.package_artifacts(&run, ArtifactStatus::Partial).await;
        let verification = evaluate_criteria(&run.contract, &self.produced, &self.tool_results);
        self.write_trace(verification).await;

        let closing = match run.state {
            RunState::Failed => EventPayload::RunFailed {
                error: run.error.clone().unwrap_or_else(|| {
                    acp_core::RunErrorInfo::new(RunErrorKind::AgentError, "run failed", false)
                }),
            },
            state => EventPayload::PhaseChanged {
                from: run.previous_state.unwrap_or(state),
                to: state,
            },
        };
        let _ = self.shared.ledger.record_closing_event(self.run_id, closing).await;
        info!(target: "acp.runtime", run_id = %self.run_id, state = %run.state, "run closed");
    }

    /// Write produced artifacts into the vault and record their pointers.
    /// Returns the number packaged. Runs at most once per driver, so an
    /// abort following a raced completion cannot double-write.
    async fn package_artifacts(&mut self, run: &Run, status: ArtifactStatus) -> u64 {
        if self.packaged {
            return self.produced.len() as u64;
        }
        self.packaged = true;

        let mut packaged = 0;
        let produced = std::mem::take(&mut self.produced);
        for artifact in &produced {
            let deliverable = run
                .contract
                .deliverables
                .iter()
                .find(|d| d.id == artifact.deliverable_id);
            let (kind, pattern) = match deliverable {
                Some(d) => (d.kind.clone(), d.destination_pattern.clone()),
                None => ("file".to_string(), artifact.sandbox_path.clone()),
            };

            match self
                .shared
                .vault
                .write_artifact(ArtifactWrite {
                    run_id: self.run_id,
                    deliverable_id: artifact.deliverable_id.clone(),
                    kind: kind.clone(),
                    agent_slug: run.template_id.clone(),
                    status,
                    destination_pattern: pattern,
                    body: artifact.bytes.clone(),
                })
                .await
            {
                Ok(manifest) => {
                    packaged += 1;
                    let _ = self
                        .shared
                        .ledger
                        .add_artifact(
                            self.run_id,
                            ArtifactRef {
                                id: manifest.artifact_id.clone(),
                                kind,
                                path: manifest.destination_path.clone(),
                            },
                        )
                        .await;
                }
                Err(e) => {
                    warn!(
                        target: "acp.runtime",
                        run_id = %self.run_id,
                        deliverable = %artifact.deliverable_id,
                        error = %e,
                        "artifact packaging failed"
                    );
                }
            }
        }
        self.produced = produced;
        packaged
    }

    async fn write_trace(&mut self, verification: Vec<acp_vault::CriterionOutcome>) {
        if self.trace_written {
            return;
        }
        self.trace_written = true;
        let Ok(run) = self.shared.ledger.get_run(self.run_id).await else {
            return;
        };
        let events = self
            .shared
            .ledger
            .events()
            .list(self.run_id, None, usize::MAX, None)
            .await
            .unwrap_or_default();
        let estimate = acp_cost::estimate(&run.contract);
        let cost = acp_cost::reconcile(estimate, run.total_cents());

        let report = TraceReport {
            run,
            events,
            retry_history: std::mem::take(&mut self.retry_history),
            cost: Some(cost),
            verification,
        };
        if let Err(e) = self.shared.traces.write_trace(&report).await {
            warn!(target: "acp.runtime", run_id = %self.run_id, error = %e, "trace write failed");
        }
    }

    // -- event helpers -------------------------------------------------------

    async fn record(&self, payload: EventPayload) {
        self.record_inner(payload, None).await;
    }

    async fn record_with_severity(&self, payload: EventPayload, severity: Severity) {
        self.record_inner(payload, Some(severity)).await;
    }

    async fn record_inner(&self, payload: EventPayload, severity: Option<Severity>) {
        let result = self
            .shared
            .ledger
            .record_event_with_severity(self.run_id, payload, severity)
            .await;
        match result {
            Ok(_) => {}
            Err(LedgerError::Append(AppendError::RunFrozen(_))) => {
                debug!(target: "acp.runtime", run_id = %self.run_id, "event dropped; log closed");
            }
            Err(e) => {
                warn!(target: "acp.runtime", run_id = %self.run_id, error = %e, "event append failed");
            }
        }
    }
}

fn classify(failure: AgentFailure) -> RunError {
    let kind = match failure.class.as_deref() {
        Some("transient" | "crash" | "sandbox_crash") => RunErrorKind::SandboxCrash,
        _ => RunErrorKind::AgentError,
    };
    RunError::new(kind, failure.message)
}

enum SignalEvent {
    Signal(Option<SandboxSignal>),
    Stalled,
}

async fn next_signal(
    stream: &mut mpsc::Receiver<SandboxSignal>,
    stall: Option<Duration>,
) -> SignalEvent {
    match stall {
        None => SignalEvent::Signal(stream.recv().await),
        Some(window) => match tokio::time::timeout(window, stream.recv()).await {
            Ok(signal) => SignalEvent::Signal(signal),
            Err(_) => SignalEvent::Stalled,
        },
    }
}

/// Await the pending checkpoint resolution; pends forever when none is
/// outstanding so the select loop's other arms stay live.
async fn wait_resolution(pending: &mut Option<oneshot::Receiver<Resolution>>) -> Option<Resolution> {
    match pending {
        Some(rx) => rx.await.ok(),
        None => std::future::pending().await,
    }
}
