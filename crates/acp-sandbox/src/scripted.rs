// SPDX-License-Identifier: MIT OR Apache-2.0
//! A scriptable in-process sandbox for tests and local development.
//!
//! The adapter replays a programmed step sequence per provisioned sandbox:
//! emit a signal, write a file, wait for a directive, or sleep. Real
//! isolation backends implement [`SandboxAdapter`] out of tree; this one
//! exists so the whole control plane can be driven deterministically.

use crate::signal::{AgentDirective, SandboxSignal};
use crate::{SandboxAdapter, SandboxError, SandboxHandle, SandboxSpec, sanitize_env};
use async_trait::async_trait;
use std::collections::{BTreeMap, HashMap};
use std::path::Path;
use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{Mutex, RwLock, mpsc};
use tracing::debug;

/// One step of a sandbox script.
#[derive(Debug, Clone)]
pub enum ScriptStep {
    /// Emit a signal to the orchestrator.
    Emit(SandboxSignal),
    /// Write a file into the sandbox filesystem (visible to `extract`).
    WriteFile {
        /// Path inside the sandbox.
        path: String,
        /// File contents.
        content: Vec<u8>,
    },
    /// Block until the control plane delivers any directive.
    AwaitDirective,
    /// Idle for the given duration (drives timeout and stall tests).
    Sleep(Duration),
}

struct Instance {
    files: Mutex<HashMap<String, Vec<u8>>>,
    directive_tx: mpsc::UnboundedSender<AgentDirective>,
    directive_rx: Mutex<Option<mpsc::UnboundedReceiver<AgentDirective>>>,
    script: Mutex<Option<Vec<ScriptStep>>>,
    env: BTreeMap<String, String>,
}

/// In-process [`SandboxAdapter`] that replays a script per sandbox.
pub struct ScriptedSandbox {
    script: Vec<ScriptStep>,
    instances: RwLock<HashMap<String, Arc<Instance>>>,
    counter: AtomicU64,
}

impl ScriptedSandbox {
    /// Create an adapter whose sandboxes replay `script`.
    #[must_use]
    pub fn new(script: Vec<ScriptStep>) -> Self {
        Self {
            script,
            instances: RwLock::new(HashMap::new()),
            counter: AtomicU64::new(0),
        }
    }

    /// The sanitized environment a sandbox was provisioned with.
    ///
    /// Test hook: lets callers assert that secrets never propagated.
    pub async fn environment(&self, handle: &SandboxHandle) -> Option<BTreeMap<String, String>> {
        self.instances
            .read()
            .await
            .get(&handle.id)
            .map(|i| i.env.clone())
    }

    async fn instance(&self, handle: &SandboxHandle) -> Result<Arc<Instance>, SandboxError> {
        self.instances
            .read()
            .await
            .get(&handle.id)
            .cloned()
            .ok_or_else(|| SandboxError::UnknownHandle(handle.id.clone()))
    }
}

#[async_trait]
impl SandboxAdapter for ScriptedSandbox {
    async fn create(&self, spec: SandboxSpec) -> Result<SandboxHandle, SandboxError> {
        let id = format!("scripted-{}", self.counter.fetch_add(1, Ordering::SeqCst));
        let (directive_tx, directive_rx) = mpsc::unbounded_channel();
        let instance = Arc::new(Instance {
            files: Mutex::new(HashMap::new()),
            directive_tx,
            directive_rx: Mutex::new(Some(directive_rx)),
            script: Mutex::new(Some(self.script.clone())),
            env: sanitize_env(&spec.env, &spec.env_allowlist),
        });
        self.instances
            .write()
            .await
            .insert(id.clone(), instance);
        debug!(target: "acp.sandbox", sandbox = %id, template = %spec.template, "scripted sandbox created");
        Ok(SandboxHandle { id })
    }

    async fn upload(
        &self,
        handle: &SandboxHandle,
        local_path: &Path,
        sandbox_path: &str,
    ) -> Result<(), SandboxError> {
        let instance = self.instance(handle).await?;
        let bytes = tokio::fs::read(local_path)
            .await
            .map_err(|e| SandboxError::Io(format!("read {}: {e}", local_path.display())))?;
        instance
            .files
            .lock()
            .await
            .insert(sandbox_path.to_string(), bytes);
        Ok(())
    }

    async fn stream(
        &self,
        handle: &SandboxHandle,
    ) -> Result<mpsc::Receiver<SandboxSignal>, SandboxError> {
        let instance = self.instance(handle).await?;
        let script = instance
            .script
            .lock()
            .await
            .take()
            .ok_or_else(|| SandboxError::Io("stream already opened".into()))?;
        let mut directives = instance
            .directive_rx
            .lock()
            .await
            .take()
            .ok_or_else(|| SandboxError::Io("directive channel already taken".into()))?;

        let (tx, rx) = mpsc::channel(64);
        let files = Arc::clone(&instance);
        tokio::spawn(async move {
            for step in script {
                match step {
                    ScriptStep::Emit(signal) => {
                        if tx.send(signal).await.is_err() {
                            // Orchestrator went away; the sandbox dies with it.
                            return;
                        }
                    }
                    ScriptStep::WriteFile { path, content } => {
                        files.files.lock().await.insert(path, content);
                    }
                    ScriptStep::AwaitDirective => {
                        if directives.recv().await.is_none() {
                            return;
                        }
                    }
                    ScriptStep::Sleep(duration) => {
                        tokio::time::sleep(duration).await;
                    }
                }
            }
            // Dropping tx ends the stream: the process exited.
        });
        Ok(rx)
    }

    async fn deliver(
        &self,
        handle: &SandboxHandle,
        directive: AgentDirective,
    ) -> Result<(), SandboxError> {
        let instance = self.instance(handle).await?;
        instance
            .directive_tx
            .send(directive)
            .map_err(|_| SandboxError::UnknownHandle(handle.id.clone()))
    }

    async fn extract(
        &self,
        handle: &SandboxHandle,
        sandbox_path: &str,
    ) -> Result<Vec<u8>, SandboxError> {
        let instance = self.instance(handle).await?;
        instance
            .files
            .lock()
            .await
            .get(sandbox_path)
            .cloned()
            .ok_or_else(|| SandboxError::PathNotFound(sandbox_path.to_string()))
    }

    async fn stop(&self, handle: &SandboxHandle, reason: &str) -> Result<(), SandboxError> {
        debug!(target: "acp.sandbox", sandbox = %handle.id, %reason, "scripted sandbox stopped");
        self.instances.write().await.remove(&handle.id);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::signal::{AgentMessage, AgentResult};
    use serde_json::json;

    fn spec() -> SandboxSpec {
        SandboxSpec {
            template: "test".into(),
            ..SandboxSpec::default()
        }
    }

    #[tokio::test]
    async fn script_replays_in_order_and_stream_is_finite() {
        let adapter = ScriptedSandbox::new(vec![
            ScriptStep::Emit(SandboxSignal::Heartbeat),
            ScriptStep::Emit(SandboxSignal::Stdout(AgentMessage::Log {
                text: "working".into(),
            })),
            ScriptStep::Emit(SandboxSignal::Result(AgentResult::Complete { message: None })),
        ]);
        let handle = adapter.create(spec()).await.unwrap();
        let mut rx = adapter.stream(&handle).await.unwrap();

        assert_eq!(rx.recv().await.unwrap(), SandboxSignal::Heartbeat);
        assert!(matches!(rx.recv().await.unwrap(), SandboxSignal::Stdout(_)));
        assert!(matches!(rx.recv().await.unwrap(), SandboxSignal::Result(_)));
        assert!(rx.recv().await.is_none());
    }

    #[tokio::test]
    async fn await_directive_blocks_until_delivery() {
        let adapter = ScriptedSandbox::new(vec![
            ScriptStep::AwaitDirective,
            ScriptStep::Emit(SandboxSignal::Result(AgentResult::Complete { message: None })),
        ]);
        let handle = adapter.create(spec()).await.unwrap();
        let mut rx = adapter.stream(&handle).await.unwrap();

        // Nothing arrives until the directive is delivered.
        tokio::select! {
            _ = rx.recv() => panic!("script should be blocked on the directive"),
            _ = tokio::time::sleep(Duration::from_millis(20)) => {}
        }

        adapter
            .deliver(
                &handle,
                AgentDirective::CheckpointResolved {
                    checkpoint_id: "cp1".into(),
                    approved: true,
                    reason: None,
                },
            )
            .await
            .unwrap();
        assert!(matches!(rx.recv().await.unwrap(), SandboxSignal::Result(_)));
    }

    #[tokio::test]
    async fn files_written_by_script_are_extractable() {
        let adapter = ScriptedSandbox::new(vec![ScriptStep::WriteFile {
            path: "/work/out.md".into(),
            content: b"# summary".to_vec(),
        }]);
        let handle = adapter.create(spec()).await.unwrap();
        let mut rx = adapter.stream(&handle).await.unwrap();
        assert!(rx.recv().await.is_none());

        let bytes = adapter.extract(&handle, "/work/out.md").await.unwrap();
        assert_eq!(bytes, b"# summary");
        assert!(matches!(
            adapter.extract(&handle, "/missing").await.unwrap_err(),
            SandboxError::PathNotFound(_)
        ));
    }

    #[tokio::test]
    async fn create_sanitizes_environment() {
        let adapter = ScriptedSandbox::new(vec![]);
        let mut env = BTreeMap::new();
        env.insert("PATH".to_string(), "/bin".to_string());
        env.insert("GITHUB_TOKEN".to_string(), "leak".to_string());
        let handle = adapter
            .create(SandboxSpec {
                template: "t".into(),
                env,
                ..SandboxSpec::default()
            })
            .await
            .unwrap();

        let env = adapter.environment(&handle).await.unwrap();
        assert!(env.contains_key("PATH"));
        assert!(!env.contains_key("GITHUB_TOKEN"));
    }

    #[tokio::test]
    async fn stopped_sandbox_rejects_operations() {
        let adapter = ScriptedSandbox::new(vec![]);
        let handle = adapter.create(spec()).await.unwrap();
        adapter.stop(&handle, "test over").await.unwrap();
        assert!(matches!(
            adapter.extract(&handle, "/x").await.unwrap_err(),
            SandboxError::UnknownHandle(_)
        ));
    }

    #[test]
    fn json_script_signals_parse() {
        // Scripts can be described in JSON, e.g. from fixtures.
        let raw = json!({
            "kind": "stdout",
            "payload": {"msg": "tool_call", "tool": "write", "tool_use_id": null, "args": {}}
        });
        let signal: SandboxSignal = serde_json::from_value(raw).unwrap();
        assert!(matches!(signal, SandboxSignal::Stdout(AgentMessage::ToolCall { .. })));
    }
}
