//! Contract board ("fabric") collaborator interface.
//!
//! The board is an optional coordination service other phases consult for
//! published symbols and file claims. The engine polls it before admitting
//! a phase, claims the phase's scope while it runs, and releases/publishes
//! on completion. All call sites are nil-safe: no board, no calls.

use anyhow::Result;
use async_trait::async_trait;
use serde::Serialize;
use std::collections::BTreeMap;
use tokio_util::sync::CancellationToken;

/// Board verdict for a ready phase.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PollDecision {
    /// Clear to run.
    Proceed,
    /// Missing information; the phase is parked and re-polled.
    NeedInfo { reason: String },
    /// Contract conflict; the phase is escalated to failure.
    Conflict { reason: String },
}

/// Read-only view of the board's current contracts.
#[derive(Debug, Clone, Default, Serialize)]
pub struct BoardSnapshot {
    /// File-claim owner by path pattern.
    pub claims: BTreeMap<String, String>,
    /// Published symbol -> publishing phase.
    pub symbols: BTreeMap<String, String>,
}

#[async_trait]
pub trait Board: Send + Sync {
    /// Ask whether a ready phase may run given the current contracts.
    async fn poll(
        &self,
        cancel: &CancellationToken,
        phase_id: &str,
        snapshot: &BoardSnapshot,
    ) -> Result<PollDecision>;

    /// Claim file ownership for a running phase.
    async fn claim(
        &self,
        cancel: &CancellationToken,
        phase_id: &str,
        patterns: &[String],
    ) -> Result<()>;

    /// Release every claim held by a phase.
    async fn release(&self, cancel: &CancellationToken, phase_id: &str) -> Result<()>;

    /// Publish symbols (entanglements) produced by a completed phase.
    async fn publish(
        &self,
        cancel: &CancellationToken,
        phase_id: &str,
        symbols: &[String],
    ) -> Result<()>;

    async fn snapshot(&self, cancel: &CancellationToken) -> Result<BoardSnapshot>;
}
