// SPDX-License-Identifier: MIT OR Apache-2.0
//! Session bookkeeping shared between the orchestrator and stream endpoints.

use acp_core::{AgentSession, SessionState};
use std::collections::HashMap;
use tokio::sync::RwLock;
use tracing::warn;
use uuid::Uuid;

/// Tracks the [`AgentSession`] behind each active run.
///
/// Transitions are guarded: an attempt the session state machine does not
/// allow is logged and dropped rather than corrupting the record.
#[derive(Debug, Default)]
pub struct SessionRegistry {
    sessions: RwLock<HashMap<Uuid, AgentSession>>,
}

impl SessionRegistry {
    /// Create an empty registry.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a session for a run, replacing any previous one.
    pub async fn insert(&self, session: AgentSession) {
        self.sessions.write().await.insert(session.run_id, session);
    }

    /// Fetch the session for a run.
    pub async fn get(&self, run_id: Uuid) -> Option<AgentSession> {
        self.sessions.read().await.get(&run_id).cloned()
    }

    /// Record a heartbeat; promotes `starting` to `running`.
    pub async fn heartbeat(&self, run_id: Uuid) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&run_id) {
            if session.state == SessionState::Starting {
                session.state = SessionState::Running;
            }
            session.heartbeat();
        }
    }

    /// Transition a session's process state, guarded by the state machine.
    pub async fn transition(&self, run_id: Uuid, to: SessionState) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&run_id) {
            if session.state.can_transition_to(to) {
                session.state = to;
            } else if session.state != to {
                warn!(
                    target: "acp.sandbox",
                    %run_id,
                    from = %session.state,
                    requested = %to,
                    "dropped invalid session transition"
                );
            }
        }
    }

    /// Mark a session stopped and record its exit.
    pub async fn stop(
        &self,
        run_id: Uuid,
        state: SessionState,
        exit_code: Option<i32>,
        reason: &str,
    ) {
        let mut sessions = self.sessions.write().await;
        if let Some(session) = sessions.get_mut(&run_id) {
            session.stop(state, exit_code, reason);
        }
    }

    /// Remove a run's session record.
    pub async fn remove(&self, run_id: Uuid) -> Option<AgentSession> {
        self.sessions.write().await.remove(&run_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn heartbeat_promotes_starting_to_running() {
        let registry = SessionRegistry::new();
        let run_id = Uuid::new_v4();
        registry
            .insert(AgentSession::new(run_id, "researcher", "sbx-1"))
            .await;

        registry.heartbeat(run_id).await;
        let session = registry.get(run_id).await.unwrap();
        assert_eq!(session.state, SessionState::Running);
        assert!(session.last_heartbeat.is_some());
    }

    #[tokio::test]
    async fn invalid_transition_is_dropped() {
        let registry = SessionRegistry::new();
        let run_id = Uuid::new_v4();
        registry
            .insert(AgentSession::new(run_id, "researcher", "sbx-1"))
            .await;
        registry
            .stop(run_id, SessionState::Stopped, Some(0), "done")
            .await;

        registry.transition(run_id, SessionState::Running).await;
        assert_eq!(
            registry.get(run_id).await.unwrap().state,
            SessionState::Stopped
        );
    }
}
