//! Issue-tracker ("beads") collaborator interface.
//!
//! Beads mirror phases as external tickets. The engine only needs create /
//! update / close / comment; everything is nil-safe at the call sites — a
//! nebula can run without any tracker attached unless its manifest says
//! `requires_beads = true`.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use tokio_util::sync::CancellationToken;

/// Ticket creation options, filled from the phase spec.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BeadOpts {
    pub description: String,
    pub labels: Vec<String>,
    pub assignee: Option<String>,
    pub priority: i64,
    pub issue_type: Option<String>,
}

/// A ticket as reported by the tracker.
#[derive(Debug, Clone, Default)]
pub struct BeadInfo {
    pub id: String,
    pub title: String,
    pub status: String,
}

#[async_trait]
pub trait BeadsClient: Send + Sync {
    /// Create a ticket and return its id.
    async fn create(
        &self,
        cancel: &CancellationToken,
        title: &str,
        opts: BeadOpts,
    ) -> Result<String>;

    async fn show(&self, cancel: &CancellationToken, id: &str) -> Result<BeadInfo>;

    async fn update(&self, cancel: &CancellationToken, id: &str, status: &str) -> Result<()>;

    async fn close(&self, cancel: &CancellationToken, id: &str) -> Result<()>;

    async fn add_comment(&self, cancel: &CancellationToken, id: &str, text: &str) -> Result<()>;
}

/// Ticket options derived from a phase spec.
pub fn opts_for(spec: &crate::phase::PhaseSpec) -> BeadOpts {
    BeadOpts {
        description: spec.body.clone(),
        labels: spec.labels.clone(),
        assignee: spec.assignee.clone(),
        priority: spec.priority_or_default(),
        issue_type: spec.phase_type.clone(),
    }
}
