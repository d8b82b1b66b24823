// SPDX-License-Identifier: MIT OR Apache-2.0
#![doc = include_str!("../README.md")]
//! acp-vault
#![deny(unsafe_code)]

/// Run trace rendering (markdown + jsonl).
pub mod trace;

use acp_core::{ArtifactManifest, ArtifactStatus, sha256_hex};
use anyhow::{Context, Result};
use chrono::{DateTime, Datelike, Utc};
use std::path::{Path, PathBuf};
use uuid::Uuid;

pub use trace::{CriterionOutcome, CriterionStatus, TraceReport, TraceWriter};

/// One artifact to persist.
#[derive(Debug, Clone)]
pub struct ArtifactWrite {
    /// Run that produced the artifact.
    pub run_id: Uuid,
    /// Deliverable this artifact fulfils (becomes the artifact id).
    pub deliverable_id: String,
    /// Artifact type (e.g. `"markdown"`).
    pub kind: String,
    /// Agent profile that produced it.
    pub agent_slug: String,
    /// Completion status stamped into the frontmatter.
    pub status: ArtifactStatus,
    /// Filename pattern from the deliverable (its stem becomes the slug).
    pub destination_pattern: String,
    /// Artifact body.
    pub body: Vec<u8>,
}

/// Writes artifacts under a deterministic `<base>/<YYYY>/<MM>/` layout.
#[derive(Debug, Clone)]
pub struct VaultWriter {
    base: PathBuf,
}

impl VaultWriter {
    /// Create a writer rooted at `base`.
    pub fn new(base: impl Into<PathBuf>) -> Self {
        Self { base: base.into() }
    }

    /// The canonical destination for an artifact written at `at`:
    /// `<base>/<YYYY>/<MM>/<run_id>_<slug>.md`.
    pub fn destination_for(&self, run_id: Uuid, slug: &str, at: DateTime<Utc>) -> PathBuf {
        self.base
            .join(format!("{:04}", at.year()))
            .join(format!("{:02}", at.month()))
            .join(format!("{run_id}_{slug}.md"))
    }

    /// Persist an artifact and return its manifest.
    ///
    /// The file starts with a frontmatter block (`---\n`) carrying
    /// `run_id, agent, source, created_at, status, type`, followed by the
    /// body. The manifest checksum covers the full written file.
    ///
    /// # Errors
    ///
    /// Fails when the destination directory cannot be created or the file
    /// cannot be written.
    pub async fn write_artifact(&self, write: ArtifactWrite) -> Result<ArtifactManifest> {
        let created_at = Utc::now();
        let slug = slugify(stem(&write.destination_pattern));
        let path = self.destination_for(write.run_id, &slug, created_at);

        let mut contents = Vec::with_capacity(write.body.len() + 256);
        contents.extend_from_slice(frontmatter(&write, created_at).as_bytes());
        contents.extend_from_slice(&write.body);

        if let Some(parent) = path.parent() {
            tokio::fs::create_dir_all(parent)
                .await
                .with_context(|| format!("create artifact dir {}", parent.display()))?;
        }
        tokio::fs::write(&path, &contents)
            .await
            .with_context(|| format!("write artifact to {}", path.display()))?;

        tracing::debug!(
            target: "acp.vault",
            run_id = %write.run_id,
            path = %path.display(),
            "artifact written"
        );

        Ok(ArtifactManifest {
            artifact_id: write.deliverable_id,
            run_id: write.run_id,
            kind: write.kind.clone(),
            destination_path: path.to_string_lossy().into_owned(),
            checksum: sha256_hex(&contents),
            size_bytes: contents.len() as u64,
            created_at,
            preview_type: write.kind,
            status: write.status,
        })
    }
}

fn frontmatter(write: &ArtifactWrite, created_at: DateTime<Utc>) -> String {
    format!(
        "---\nrun_id: {}\nagent: {}\nsource: agent-run\ncreated_at: {}\nstatus: {}\ntype: {}\n---\n\n",
        write.run_id,
        write.agent_slug,
        created_at.to_rfc3339(),
        write.status,
        write.kind,
    )
}

/// File stem of a destination pattern (`"reports/out.md"` → `"out"`).
fn stem(pattern: &str) -> &str {
    let name = pattern.rsplit('/').next().unwrap_or(pattern);
    name.rsplit_once('.').map_or(name, |(stem, _)| stem)
}

/// Lowercase, alphanumeric-and-dash slug.
pub fn slugify(s: &str) -> String {
    let mut out = String::with_capacity(s.len());
    let mut last_dash = true;
    for c in s.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    while out.ends_with('-') {
        out.pop();
    }
    if out.is_empty() {
        out.push_str("artifact");
    }
    out
}

/// The year/month directory pair used by both writers.
pub(crate) fn year_month(base: &Path, at: DateTime<Utc>) -> PathBuf {
    base.join(format!("{:04}", at.year()))
        .join(format!("{:02}", at.month()))
}
