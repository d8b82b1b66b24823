// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-runtime
#![deny(unsafe_code)]

/// Cooperative cancellation primitives.
pub mod cancel;
/// The per-run driver task.
mod driver;
/// Success-criteria evaluation.
pub mod verify;

use acp_approvals::ApprovalService;
use acp_core::{Contract, EventPayload, Run, RunErrorInfo, RunErrorKind, RunState};
use acp_cost::WorkspaceSpend;
use acp_ledger::{LedgerError, RunLedger};
use acp_policy::{PredicateRegistry, PreflightError, preflight};
use acp_sandbox::{AgentDirective, SandboxAdapter, SandboxHandle, SessionRegistry};
use acp_vault::{TraceWriter, VaultWriter};
use chrono::Utc;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

pub use cancel::{CancelReason, CancelSignal};
pub use driver::Driver;
pub use verify::{ProducedArtifact, RecordedToolResult, evaluate_criteria};

/// Errors from orchestrator operations.
#[derive(Debug, thiserror::Error)]
pub enum OrchestratorError {
    /// The admission cap on concurrently active runs was reached.
    #[error("admission limit reached: {0} active runs")]
    AdmissionFull(usize),

    /// The run is not in a state this operation accepts.
    #[error("run {run_id} is in state {state}, cannot {operation}")]
    WrongState {
        /// The run.
        run_id: Uuid,
        /// Its current state.
        state: RunState,
        /// The attempted operation.
        operation: &'static str,
    },

    /// An underlying ledger operation failed.
    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

/// Tuning knobs for the orchestrator.
#[derive(Debug, Clone)]
pub struct RuntimeOptions {
    /// Cap on concurrently active runs.
    pub max_active_runs: usize,
    /// Fail a run as stalled after this long without any sandbox signal.
    pub stall_timeout: Option<Duration>,
    /// Checkpoint timeout applied when no approval rule covers an action.
    pub default_checkpoint_timeout_secs: u64,
}

impl Default for RuntimeOptions {
    fn default() -> Self {
        Self {
            max_active_runs: 8,
            stall_timeout: None,
            default_checkpoint_timeout_secs: 600,
        }
    }
}

/// Per-driver bookkeeping kept by the orchestrator.
pub(crate) struct DriverEntry {
    pub(crate) cancel: CancelSignal,
    pub(crate) sandbox: Option<SandboxHandle>,
}

/// Everything a driver shares with the orchestrator.
pub(crate) struct Shared {
    pub(crate) ledger: Arc<RunLedger>,
    pub(crate) approvals: Arc<ApprovalService>,
    pub(crate) adapter: Arc<dyn SandboxAdapter>,
    pub(crate) sessions: Arc<SessionRegistry>,
    pub(crate) vault: VaultWriter,
    pub(crate) traces: TraceWriter,
    pub(crate) spend: Arc<WorkspaceSpend>,
    pub(crate) registry: PredicateRegistry,
    pub(crate) options: RuntimeOptions,
    pub(crate) drivers: Mutex<HashMap<Uuid, DriverEntry>>,
    pub(crate) active: AtomicUsize,
}

/// The top-level run orchestrator.
///
/// Wires the ledger, event log, approval service, sandbox adapter, cost
/// accounting, and vault/trace writers into a per-run control loop. One
/// driver task per active run; drivers are independent and run in
/// parallel across runs.
pub struct Orchestrator {
    shared: Arc<Shared>,
}

impl Orchestrator {
    /// Construct the orchestrator from its collaborators.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        ledger: Arc<RunLedger>,
        approvals: Arc<ApprovalService>,
        adapter: Arc<dyn SandboxAdapter>,
        sessions: Arc<SessionRegistry>,
        vault: VaultWriter,
        traces: TraceWriter,
        spend: Arc<WorkspaceSpend>,
        registry: PredicateRegistry,
        options: RuntimeOptions,
    ) -> Self {
        Self {
            shared: Arc::new(Shared {
                ledger,
                approvals,
                adapter,
                sessions,
                vault,
                traces,
                spend,
                registry,
                options,
                drivers: Mutex::new(HashMap::new()),
                active: AtomicUsize::new(0),
            }),
        }
    }

    /// Handle to the run ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<RunLedger> {
        &self.shared.ledger
    }

    /// Handle to the approval service.
    #[must_use]
    pub fn approvals(&self) -> &Arc<ApprovalService> {
        &self.shared.approvals
    }

    /// Number of currently active run drivers.
    #[must_use]
    pub fn active_runs(&self) -> usize {
        self.shared.active.load(Ordering::SeqCst)
    }

    /// Submit a contract for execution.
    ///
    /// Preflight failures and workspace-budget rejections do not error:
    /// the run is recorded as `failed` before ever initializing, and the
    /// rejected run document is returned so the caller can inspect it.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::AdmissionFull`] when the active-run cap is
    /// reached, or a ledger error.
    pub async fn submit(
        &self,
        workspace_id: impl Into<String>,
        contract: Contract,
    ) -> Result<Run, OrchestratorError> {
        let workspace_id = workspace_id.into();

        if let Err(PreflightError { problems }) = preflight(&contract, &self.shared.registry) {
            return Ok(self
                .reject_at_preflight(
                    &workspace_id,
                    contract,
                    format!("contract failed preflight: {}", problems.join("; ")),
                )
                .await?);
        }

        let estimate = acp_cost::estimate(&contract);
        if let acp_cost::BudgetStatus::Exceeded(violation) = self.shared.spend.precheck(
            &workspace_id,
            estimate.expected_cents,
            Utc::now(),
        ) {
            return Ok(self
                .reject_at_preflight(
                    &workspace_id,
                    contract,
                    format!("workspace budget would be exceeded: {violation}"),
                )
                .await?);
        }

        let active = self.shared.active.load(Ordering::SeqCst);
        if active >= self.shared.options.max_active_runs {
            return Err(OrchestratorError::AdmissionFull(active));
        }

        let run = self.shared.ledger.create_run(&workspace_id, contract).await;
        let run_id = run.run_id;

        self.shared
            .ledger
            .transition_state(run_id, RunState::Initializing, None)
            .await?;
        self.shared
            .ledger
            .record_event(
                run_id,
                EventPayload::RunStarted {
                    goal: run.contract.goal.clone(),
                },
            )
            .await?;

        let cancel = CancelSignal::new();
        {
            let mut drivers = self.shared.drivers.lock().await;
            drivers.insert(
                run_id,
                DriverEntry {
                    cancel: cancel.clone(),
                    sandbox: None,
                },
            );
        }
        self.shared.active.fetch_add(1, Ordering::SeqCst);

        let driver = Driver::new(Arc::clone(&self.shared), run_id, workspace_id, cancel);
        tokio::spawn(driver.run());

        info!(target: "acp.runtime", %run_id, "run admitted");
        Ok(self.shared.ledger.get_run(run_id).await?)
    }

    async fn reject_at_preflight(
        &self,
        workspace_id: &str,
        contract: Contract,
        message: String,
    ) -> Result<Run, LedgerError> {
        warn!(target: "acp.runtime", %message, "run rejected before initializing");
        let error = RunErrorInfo::new(RunErrorKind::ContractViolation, message, false);
        let run = self
            .shared
            .ledger
            .create_rejected(workspace_id, contract, error.clone())
            .await;
        self.shared
            .ledger
            .record_closing_event(run.run_id, EventPayload::RunFailed { error })
            .await?;
        self.shared.ledger.get_run(run.run_id).await
    }

    /// Pause a run. Allowed while planning, executing, or verifying; the
    /// agent receives a pause directive, in-flight work is still recorded.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WrongState`] (including for `awaiting_approval`,
    /// which only approval resolution may move) or a ledger error.
    pub async fn pause(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        let run = self.shared.ledger.get_run(run_id).await?;
        if !matches!(
            run.state,
            RunState::Planning | RunState::Executing | RunState::Verifying
        ) {
            return Err(OrchestratorError::WrongState {
                run_id,
                state: run.state,
                operation: "pause",
            });
        }

        let record = self
            .shared
            .ledger
            .transition_state(run_id, RunState::Paused, None)
            .await?;
        self.shared
            .ledger
            .record_event(
                run_id,
                EventPayload::PhaseChanged {
                    from: record.from,
                    to: record.to,
                },
            )
            .await?;
        self.deliver(run_id, AgentDirective::Pause).await;
        Ok(self.shared.ledger.get_run(run_id).await?)
    }

    /// Resume a paused run back to its captured phase.
    ///
    /// # Errors
    ///
    /// [`OrchestratorError::WrongState`] unless the run is `paused`, or a
    /// ledger error.
    pub async fn resume(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        let run = self.shared.ledger.get_run(run_id).await?;
        if run.state != RunState::Paused {
            return Err(OrchestratorError::WrongState {
                run_id,
                state: run.state,
                operation: "resume",
            });
        }
        let target = run.previous_state.unwrap_or(RunState::Planning);

        let record = self
            .shared
            .ledger
            .transition_state(run_id, target, None)
            .await?;
        self.shared
            .ledger
            .record_event(
                run_id,
                EventPayload::PhaseChanged {
                    from: record.from,
                    to: record.to,
                },
            )
            .await?;
        self.deliver(run_id, AgentDirective::Resume).await;
        Ok(self.shared.ledger.get_run(run_id).await?)
    }

    /// Cancel a run. Idempotent: cancelling a terminal run is a no-op.
    /// In-flight work is abandoned; the driver still packages partial
    /// artifacts and writes the trace before closing the log.
    ///
    /// # Errors
    ///
    /// Ledger errors other than an already-terminal state.
    pub async fn cancel(&self, run_id: Uuid) -> Result<Run, OrchestratorError> {
        let run = self.shared.ledger.get_run(run_id).await?;
        if run.is_terminal() {
            return Ok(run);
        }

        let record = self
            .shared
            .ledger
            .transition_state(run_id, RunState::Cancelled, None)
            .await?;

        let driver = {
            let drivers = self.shared.drivers.lock().await;
            drivers.get(&run_id).map(|entry| entry.cancel.clone())
        };
        match driver {
            Some(cancel) => cancel.cancel(CancelReason::UserRequested),
            None => {
                // No driver to close the log (cancelled straight out of
                // pending); close it here.
                let _ = self
                    .shared
                    .ledger
                    .record_closing_event(
                        run_id,
                        EventPayload::PhaseChanged {
                            from: record.from,
                            to: record.to,
                        },
                    )
                    .await;
            }
        }

        info!(target: "acp.runtime", %run_id, "run cancelled");
        Ok(self.shared.ledger.get_run(run_id).await?)
    }

    /// Spawn the periodic approval-timeout sweep.
    ///
    /// The interval should be well below the smallest checkpoint timeout
    /// granted by any contract.
    #[must_use]
    pub fn spawn_timeout_sweeper(&self, interval: Duration) -> tokio::task::JoinHandle<()> {
        let approvals = Arc::clone(&self.shared.approvals);
        tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
            loop {
                ticker.tick().await;
                let resolutions = approvals.process_timeouts(Utc::now()).await;
                if !resolutions.is_empty() {
                    info!(
                        target: "acp.runtime",
                        count = resolutions.len(),
                        "approval timeouts processed"
                    );
                }
            }
        })
    }

    /// Best-effort directive delivery to a run's sandbox.
    pub(crate) async fn deliver(&self, run_id: Uuid, directive: AgentDirective) {
        deliver_via(&self.shared, run_id, directive).await;
    }
}

/// Deliver a directive through the driver's registered sandbox handle.
pub(crate) async fn deliver_via(shared: &Shared, run_id: Uuid, directive: AgentDirective) {
    let handle = {
        let drivers = shared.drivers.lock().await;
        drivers.get(&run_id).and_then(|entry| entry.sandbox.clone())
    };
    if let Some(handle) = handle
        && let Err(e) = shared.adapter.deliver(&handle, directive).await
    {
        warn!(target: "acp.runtime", %run_id, error = %e, "directive delivery failed");
    }
}
