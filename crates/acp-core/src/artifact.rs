// SPDX-License-Identifier: MIT OR Apache-2.0
//! Artifact manifests.

use chrono::{DateTime, Utc};
use schemars::JsonSchema;
use serde::{Deserialize, Serialize};
use std::fmt;
use uuid::Uuid;

/// Full description of a packaged artifact, persisted alongside it by the
/// vault writer. The run document only carries an [`crate::ArtifactRef`].
#[derive(Debug, Clone, Serialize, Deserialize, JsonSchema)]
pub struct ArtifactManifest {
    /// Artifact identifier (matches the deliverable id where applicable).
    pub artifact_id: String,
    /// Run that produced the artifact.
    pub run_id: Uuid,
    /// Artifact type (e.g. `"markdown"`).
    #[serde(rename = "type")]
    pub kind: String,
    /// Final path in the vault.
    pub destination_path: String,
    /// Hex-encoded SHA-256 of the artifact bytes.
    pub checksum: String,
    /// Size of the artifact in bytes.
    pub size_bytes: u64,
    /// When the artifact was written.
    pub created_at: DateTime<Utc>,
    /// Hint for client-side preview rendering (e.g. `"markdown"`, `"json"`).
    pub preview_type: String,
    /// Completion status stamped into the frontmatter.
    pub status: ArtifactStatus,
}

/// Completion status of a packaged artifact.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, JsonSchema)]
#[serde(rename_all = "snake_case")]
pub enum ArtifactStatus {
    /// Produced by a successfully completed run.
    Final,
    /// Produced mid-run (not yet verified).
    Draft,
    /// Packaged while aborting; some deliverables may be missing.
    Partial,
}

impl ArtifactStatus {
    /// Stable snake_case name, matching the serde representation.
    #[must_use]
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Final => "final",
            Self::Draft => "draft",
            Self::Partial => "partial",
        }
    }
}

impl fmt::Display for ArtifactStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_serde_uses_type_key() {
        let m = ArtifactManifest {
            artifact_id: "D1".into(),
            run_id: Uuid::new_v4(),
            kind: "markdown".into(),
            destination_path: "vault/2026/08/abc_out.md".into(),
            checksum: crate::sha256_hex(b"content"),
            size_bytes: 7,
            created_at: Utc::now(),
            preview_type: "markdown".into(),
            status: ArtifactStatus::Final,
        };
        let v = serde_json::to_value(&m).unwrap();
        assert_eq!(v["type"], "markdown");
        assert_eq!(v["status"], "final");
        assert_eq!(v["checksum"].as_str().unwrap().len(), 64);
    }
}
