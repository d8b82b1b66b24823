// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-sandbox
#![deny(unsafe_code)]

/// Scripted in-process adapter for tests and local runs.
pub mod scripted;
/// Session bookkeeping for sandbox processes.
pub mod sessions;
/// Raw signal and directive wire model.
pub mod signal;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;
use tokio::sync::mpsc;

pub use scripted::{ScriptStep, ScriptedSandbox};
pub use sessions::SessionRegistry;
pub use signal::{AgentDirective, AgentFailure, AgentMessage, AgentResult, SandboxSignal};

/// Errors from sandbox adapter operations.
#[derive(Debug, thiserror::Error)]
pub enum SandboxError {
    /// The adapter could not provision a sandbox.
    #[error("sandbox unavailable: {0}")]
    Unavailable(String),

    /// No sandbox with this handle exists (or it was already stopped).
    #[error("unknown sandbox handle: {0}")]
    UnknownHandle(String),

    /// A path inside the sandbox does not exist.
    #[error("path not found in sandbox: {0}")]
    PathNotFound(String),

    /// Transport or filesystem failure talking to the sandbox.
    #[error("sandbox io: {0}")]
    Io(String),
}

/// What the orchestrator asks for when provisioning a sandbox.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SandboxSpec {
    /// Sandbox template to instantiate (image, profile, …).
    pub template: String,
    /// Integration scopes granted to the agent.
    pub scopes: Vec<String>,
    /// Environment variables to set inside the sandbox.
    pub env: BTreeMap<String, String>,
    /// Variables allowed through sanitization even if they look secret.
    pub env_allowlist: Vec<String>,
}

/// Opaque handle to a provisioned sandbox.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SandboxHandle {
    /// Adapter-scoped identifier.
    pub id: String,
}

/// The isolation seam the orchestrator drives.
///
/// One sandbox per run, never shared. Implementations must sanitize the
/// environment (see [`sanitize_env`]), enforce their own wall-clock
/// ceiling, and emit a heartbeat signal at least every few seconds while
/// the agent is alive. The signal stream is finite: it ends when the
/// sandbox process exits or is stopped.
#[async_trait]
pub trait SandboxAdapter: Send + Sync {
    /// Provision a sandbox.
    async fn create(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError>;

    /// Copy a local file into the sandbox.
    async fn upload(
        &self,
        handle: &SandboxHandle,
        local_path: &Path,
        sandbox_path: &str,
    ) -> Result<(), SandboxError>;

    /// Open the signal stream. May be called once per sandbox.
    async fn stream(
        &self,
        handle: &SandboxHandle,
    ) -> Result<mpsc::Receiver<SandboxSignal>, SandboxError>;

    /// Deliver a directive (denial, checkpoint resolution, pause, nudge)
    /// into the sandbox.
    async fn deliver(
        &self,
        handle: &SandboxHandle,
        directive: AgentDirective,
    ) -> Result<(), SandboxError>;

    /// Read a file out of the sandbox.
    async fn extract(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<Vec<u8>, SandboxError>;

    /// Stop the sandbox. Implementations extract best-effort artifacts
    /// before tearing the environment down.
    async fn stop(&self, handle: &SandboxHandle, reason: &str) -> Result<(), SandboxError>;
}

// Substrings that mark a variable as credential-bearing.
const SECRET_MARKERS: [&str; 5] = ["TOKEN", "SECRET", "KEY", "PASSWORD", "CREDENTIAL"];

/// Drop credential-bearing variables from a sandbox environment.
///
/// A variable whose upper-cased name contains a secret marker is removed
/// unless the sandbox spec allowlists it.
#[must_use]
pub fn sanitize_env(
    env: &BTreeMap<String, String>,
    allowlist: &[String],
) -> BTreeMap<String, String> {
    env.iter()
        .filter(|(name, _)| {
            if allowlist.iter().any(|a| a == *name) {
                return true;
            }
            let upper = name.to_uppercase();
            !SECRET_MARKERS.iter().any(|marker| upper.contains(marker))
        })
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect()
}
