// SPDX-License-Identifier: MIT OR Apache-2.0
#![deny(unsafe_code)]

use acp_approvals::ApprovalService;
use acp_config::ControlPlaneConfig;
use acp_cost::{WorkspaceBudget, WorkspaceSpend};
use acp_daemon::{AppState, build_app};
use acp_eventlog::EventLog;
use acp_ledger::RunLedger;
use acp_policy::PredicateRegistry;
use acp_runtime::{Orchestrator, RuntimeOptions};
use acp_sandbox::{
    AgentMessage, AgentResult, SandboxSignal, ScriptStep, ScriptedSandbox, SessionRegistry,
};
use acp_vault::{TraceWriter, VaultWriter};
use anyhow::{Context, Result};
use clap::Parser;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{info, warn};
use tracing_subscriber::EnvFilter;

#[derive(Parser, Debug)]
#[command(name = "acp-daemon", version, about = "Agent Control Plane daemon")]
struct Args {
    /// Bind address (overrides the config file).
    #[arg(long)]
    bind: Option<String>,

    /// Path to a TOML config file.
    #[arg(long)]
    config: Option<PathBuf>,

    /// Enable debug logging.
    #[arg(long)]
    debug: bool,
}

#[tokio::main]
async fn main() -> Result<()> {
    let args = Args::parse();

    let filter = if args.debug {
        EnvFilter::new("acp=debug")
    } else {
        EnvFilter::new("acp=info")
    };
    tracing_subscriber::fmt().with_env_filter(filter).init();

    let mut config = match &args.config {
        Some(path) => ControlPlaneConfig::load(path)
            .with_context(|| format!("load config {}", path.display()))?,
        None => ControlPlaneConfig::default(),
    };
    if let Some(bind) = args.bind {
        config.bind = bind;
    }
    for warning in config.warnings() {
        warn!(target: "acp.daemon", %warning, "config warning");
    }

    tokio::fs::create_dir_all(&config.vault.artifact_base)
        .await
        .with_context(|| format!("create vault dir {}", config.vault.artifact_base))?;
    tokio::fs::create_dir_all(&config.vault.trace_base)
        .await
        .with_context(|| format!("create trace dir {}", config.vault.trace_base))?;

    let events = Arc::new(EventLog::with_buffer(config.limits.event_buffer));
    let ledger = Arc::new(RunLedger::new(events));
    let approvals = Arc::new(ApprovalService::new(Arc::clone(&ledger)));

    let mut budgets = HashMap::new();
    for (workspace, budget) in &config.budgets {
        budgets.insert(
            workspace.clone(),
            WorkspaceBudget {
                per_day_cents: budget.per_day_cents,
                per_month_cents: budget.per_month_cents,
            },
        );
    }

    let options = RuntimeOptions {
        max_active_runs: config.limits.max_active_runs,
        stall_timeout: (config.limits.stall_timeout_ms > 0)
            .then(|| Duration::from_millis(config.limits.stall_timeout_ms)),
        ..RuntimeOptions::default()
    };

    let orchestrator = Arc::new(Orchestrator::new(
        ledger,
        approvals,
        // The in-process scripted sandbox stands in until a real isolation
        // adapter is wired up (the adapter seam is `acp_sandbox::SandboxAdapter`).
        Arc::new(ScriptedSandbox::new(demo_script())),
        Arc::new(SessionRegistry::new()),
        VaultWriter::new(&config.vault.artifact_base),
        TraceWriter::new(&config.vault.trace_base),
        Arc::new(WorkspaceSpend::new(budgets)),
        PredicateRegistry::new(),
        options,
    ));

    let _sweeper = orchestrator.spawn_timeout_sweeper(Duration::from_millis(
        config.limits.approval_sweep_interval_ms,
    ));

    let state = Arc::new(AppState {
        orchestrator,
        default_workspace: config.workspace_id.clone(),
        started_at: std::time::Instant::now(),
    });
    let app = build_app(state);

    let listener = tokio::net::TcpListener::bind(&config.bind)
        .await
        .with_context(|| format!("bind {}", config.bind))?;
    info!(
        target: "acp.daemon",
        bind = %config.bind,
        workspace = %config.workspace_id,
        "acp-daemon listening"
    );

    axum::serve(listener, app).await.context("serve")
}

/// Script replayed by the built-in sandbox: declare a phase, log, complete.
fn demo_script() -> Vec<ScriptStep> {
    vec![
        ScriptStep::Emit(SandboxSignal::Heartbeat),
        ScriptStep::Emit(SandboxSignal::Stdout(AgentMessage::Phase {
            phase: acp_core::RunState::Executing,
        })),
        ScriptStep::Emit(SandboxSignal::Stdout(AgentMessage::Log {
            text: "built-in scripted sandbox; wire a real adapter for actual agents".into(),
        })),
        ScriptStep::Emit(SandboxSignal::Result(AgentResult::Complete { message: None })),
    ]
}
