// SPDX-License-Identifier: MIT OR Apache-2.0
//! Run trace rendering.
//!
//! Every run leaves a human-readable markdown trace and a machine-readable
//! jsonl companion under `<base-traces>/<YYYY>/<MM>/`. The trace enumerates
//! the decision history: phases, retries, cost reconciliation, and the
//! verification verdict per success criterion.

use crate::year_month;
use acp_core::{Event, Run};
use acp_cost::CostReconciliation;
use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt::Write as _;
use std::path::{Path, PathBuf};
use uuid::Uuid;

/// Verdict for one success criterion.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CriterionStatus {
    /// Evidence found; the criterion holds.
    Verified,
    /// Evidence checked and the criterion does not hold.
    Failed,
    /// No deterministic predicate (`manual_check`); left for a human.
    Unverified,
}

/// Evaluation result for one success criterion.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CriterionOutcome {
    /// The criterion.
    pub criterion_id: String,
    /// The verdict.
    pub status: CriterionStatus,
    /// Supporting detail (path checked, tool result consulted, …).
    pub detail: Option<String>,
}

/// Everything the trace writer needs about a finished run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TraceReport {
    /// The final run document.
    pub run: Run,
    /// The full ordered event list.
    pub events: Vec<Event>,
    /// Retry history entries collected during the run.
    pub retry_history: Vec<BTreeMap<String, serde_json::Value>>,
    /// Estimate-vs-actual cost comparison.
    pub cost: Option<CostReconciliation>,
    /// Per-criterion verification verdicts.
    pub verification: Vec<CriterionOutcome>,
}

/// Writes traces under `<base-traces>/<YYYY>/<MM>/<run_id>.md` (+ `.jsonl`).
#[derive(Debug, Clone)]
pub struct TraceWriter {
    base: PathBuf,
}

impl TraceWriter {
    /// Create a writer rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The canonical markdown path for a run's trace written at `at`.
    pub fn trace_path(&self, run_id: Uuid, at: DateTime<Utc>) -> PathBuf {
        year_month(&self.base, at).join(format!("{run_id}.md"))
    }

    /// Write both trace files and return the markdown path.
    ///
    /// # Errors
    ///
    /// Fails when the trace directory cannot be created or either file
    /// cannot be written.
    pub async fn write_trace(&self, report: &TraceReport) -> Result<PathBuf> {
        let at = report.run.completed_at.unwrap_or_else(Utc::now);
        let md_path = self.trace_path(report.run.run_id, at);
        let jsonl_path = md_path.with_extension("jsonl");

        if let Some(parent) = md_path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create trace dir {}", parent.display()))?;
        }

        tokio::fs::write(&md_path, render_markdown(report))
            .await
            .with_context(|| format!("write trace to {}", md_path.display()))?;
        tokio::fs::write(&jsonl_path, render_jsonl(&report.events)?)
            .await
            .with_context(|| format!("write trace events to {}", jsonl_path.display()))?;

        tracing::debug!(
            target: "acp.vault",
            run_id = %report.run.run_id,
            path = %md_path.display(),
            "trace written"
        );
        Ok(md_path)
    }
}

fn render_markdown(report: &TraceReport) -> String {
    let run = &report.run;
    let mut out = String::new();

    let _ = writeln!(out, "# Run {}", run.run_id);
    let _ = writeln!(out);
    let _ = writeln!(out, "- goal: {}", run.contract.goal);
    let _ = writeln!(out, "- workspace: {}", run.workspace_id);
    let _ = writeln!(out, "- final state: {}", run.state);
    if let Some(error) = &run.error {
        let _ = writeln!(out, "- error: {} ({})", error.message, error.kind);
    }
    let _ = writeln!(
        out,
        "- cost: {} cents (compute {}, api {})",
        run.total_cents(),
        run.compute_cents,
        run.api_cents
    );
    if let Some(cost) = &report.cost {
        let _ = writeln!(
            out,
            "- estimate: {} cents expected, delta {:+} cents{}",
            cost.estimate.expected_cents,
            cost.delta_cents,
            if cost.within_band { "" } else { " (outside band)" },
        );
    }

    if !report.verification.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Verification");
        let _ = writeln!(out);
        for outcome in &report.verification {
            let status = match outcome.status {
                CriterionStatus::Verified => "verified",
                CriterionStatus::Failed => "failed",
                CriterionStatus::Unverified => "unverified",
            };
            let _ = write!(out, "- {}: {status}", outcome.criterion_id);
            if let Some(detail) = &outcome.detail {
                let _ = write!(out, " — {detail}");
            }
            let _ = writeln!(out);
        }
    }

    if !report.retry_history.is_empty() {
        let _ = writeln!(out);
        let _ = writeln!(out, "## Retries");
        let _ = writeln!(out);
        for entry in &report.retry_history {
            let _ = writeln!(
                out,
                "- {}",
                serde_json::to_string(entry).unwrap_or_else(|_| "<unserializable>".into())
            );
        }
    }

    let _ = writeln!(out);
    let _ = writeln!(out, "## Events");
    let _ = writeln!(out);
    for event in &report.events {
        let _ = writeln!(
            out,
            "- [{}] {} ({})",
            event.seq,
            event.event_type(),
            event.phase
        );
    }
    out
}

fn render_jsonl(events: &[Event]) -> Result<String> {
    let mut out = String::new();
    for event in events {
        out.push_str(&serde_json::to_string(event).context("serialize trace event")?);
        out.push('\n');
    }
    Ok(out)
}

/// List the trace files for a run, if they exist.
pub async fn find_trace(base: &Path, run_id: Uuid, at: DateTime<Utc>) -> Option<PathBuf> {
    let path = year_month(base, at).join(format!("{run_id}.md"));
    tokio::fs::try_exists(&path).await.ok()?.then_some(path)
}

#[cfg(test)]
mod tests {
    use super::*;
    use acp_core::{ContractBuilder, EventPayload, RunState, apply_transition};

    fn finished_run() -> Run {
        let mut run = Run::new("ws-1", ContractBuilder::new("summarize").build());
        for state in [
            RunState::Initializing,
            RunState::Planning,
            RunState::Executing,
            RunState::Verifying,
            RunState::Packaging,
            RunState::Completed,
        ] {
            apply_transition(&mut run, state).unwrap();
        }
        run
    }

    fn events_for(run: &Run) -> Vec<Event> {
        vec![
            Event::new(
                run.run_id,
                0,
                RunState::Initializing,
                EventPayload::RunStarted { goal: "summarize".into() },
            ),
            Event::new(
                run.run_id,
                1,
                RunState::Completed,
                EventPayload::RunCompleted { artifact_count: 1 },
            ),
        ]
    }

    #[tokio::test]
    async fn trace_files_land_in_year_month_layout() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(tmp.path());
        let run = finished_run();
        let events = events_for(&run);

        let md_path = writer
            .write_trace(&TraceReport {
                run: run.clone(),
                events,
                retry_history: vec![],
                cost: None,
                verification: vec![CriterionOutcome {
                    criterion_id: "S1".into(),
                    status: CriterionStatus::Verified,
                    detail: Some("out.md packaged".into()),
                }],
            })
            .await
            .unwrap();

        let at = run.completed_at.unwrap();
        assert_eq!(md_path, writer.trace_path(run.run_id, at));
        let text = std::fs::read_to_string(&md_path).unwrap();
        assert!(text.contains(&format!("# Run {}", run.run_id)));
        assert!(text.contains("- S1: verified"));
        assert!(text.contains("final state: completed"));

        let jsonl = std::fs::read_to_string(md_path.with_extension("jsonl")).unwrap();
        assert_eq!(jsonl.lines().count(), 2);
        let first: serde_json::Value = serde_json::from_str(jsonl.lines().next().unwrap()).unwrap();
        assert_eq!(first["type"], "run.started");
    }

    #[tokio::test]
    async fn retry_history_is_enumerated() {
        let tmp = tempfile::tempdir().unwrap();
        let writer = TraceWriter::new(tmp.path());
        let run = finished_run();

        let mut entry = BTreeMap::new();
        entry.insert("retry_total_attempts".to_string(), serde_json::json!(3));

        let md_path = writer
            .write_trace(&TraceReport {
                run,
                events: vec![],
                retry_history: vec![entry],
                cost: None,
                verification: vec![],
            })
            .await
            .unwrap();
        let text = std::fs::read_to_string(&md_path).unwrap();
        assert!(text.contains("## Retries"));
        assert!(text.contains("retry_total_attempts"));
    }
}
