//! The phase-runner collaborator interface and execution-config resolution.
//!
//! The runner is the opaque function that actually performs a phase's
//! coding work. The engine only cares about its cost/cycle accounting and
//! the commit range it produced; everything else is the runner's business.
//! A process-based implementation is provided for the CLI, which shells out
//! to an external agent command.

use crate::manifest::{ExecutionConfig, Manifest};
use crate::phase::PhaseSpec;
use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use tokio::io::{AsyncBufReadExt, AsyncWriteExt, BufReader};
use tokio::process::Command;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

pub const DEFAULT_MAX_REVIEW_CYCLES: u32 = 3;
pub const DEFAULT_MAX_BUDGET_USD: f64 = 10.0;
pub const DEFAULT_MODEL: &str = "sonnet";

/// Execution settings after precedence resolution:
/// phase override > manifest > engine-global > built-in defaults.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ResolvedExecution {
    pub max_review_cycles: u32,
    pub max_budget_usd: f64,
    pub model: String,
}

impl Default for ResolvedExecution {
    fn default() -> Self {
        Self {
            max_review_cycles: DEFAULT_MAX_REVIEW_CYCLES,
            max_budget_usd: DEFAULT_MAX_BUDGET_USD,
            model: DEFAULT_MODEL.to_string(),
        }
    }
}

/// Resolve the execution config for one phase.
pub fn resolve_execution(
    phase: &PhaseSpec,
    manifest: &Manifest,
    global: Option<&ExecutionConfig>,
) -> ResolvedExecution {
    let defaults = ResolvedExecution::default();
    let pick_cycles = phase
        .max_review_cycles
        .or(manifest.execution.max_review_cycles)
        .or(global.and_then(|g| g.max_review_cycles))
        .map(|c| c.max(0) as u32)
        .unwrap_or(defaults.max_review_cycles);
    let pick_budget = phase
        .max_budget_usd
        .or(manifest.execution.max_budget_usd)
        .or(global.and_then(|g| g.max_budget_usd))
        .unwrap_or(defaults.max_budget_usd);
    let pick_model = phase
        .model
        .clone()
        .or_else(|| manifest.execution.model.clone())
        .or_else(|| global.and_then(|g| g.model.clone()))
        .unwrap_or(defaults.model);

    ResolvedExecution {
        max_review_cycles: pick_cycles,
        max_budget_usd: pick_budget,
        model: pick_model,
    }
}

/// Everything a runner needs for one phase.
///
/// `refactors` delivers hot-reloaded bodies; a cooperating runner drains it
/// at cycle boundaries and adopts the most recent body. Runners are free to
/// ignore it.
pub struct RunRequest {
    pub phase_id: String,
    pub bead_id: String,
    pub title: String,
    pub body: String,
    pub execution: ResolvedExecution,
    pub refactors: mpsc::Receiver<String>,
}

/// What a runner reports back. Errors signal phase failure.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct RunOutcome {
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default)]
    pub cycles_used: u32,
    #[serde(default)]
    pub report: String,
    #[serde(default)]
    pub base_commit_sha: Option<String>,
    #[serde(default)]
    pub final_commit_sha: Option<String>,
}

/// The phase-runner collaborator.
#[async_trait]
pub trait Runner: Send + Sync {
    async fn run_phase(&self, cancel: &CancellationToken, req: RunRequest) -> Result<RunOutcome>;
}

/// Runner that spawns an external agent command per phase.
///
/// The phase title and body go to the child's stdin; the child's last
/// stdout line must be a JSON-encoded `RunOutcome`. The child is killed on
/// cancellation.
pub struct ProcessRunner {
    cmd: String,
    work_dir: PathBuf,
}

impl ProcessRunner {
    pub fn new(cmd: &str, work_dir: &std::path::Path) -> Self {
        Self {
            cmd: cmd.to_string(),
            work_dir: work_dir.to_path_buf(),
        }
    }

    fn build_prompt(req: &RunRequest) -> String {
        format!(
            "# Phase {id}: {title}\n\nmodel: {model}\nmax_review_cycles: {cycles}\nmax_budget_usd: {budget}\n\n{body}\n",
            id = req.phase_id,
            title = req.title,
            model = req.execution.model,
            cycles = req.execution.max_review_cycles,
            budget = req.execution.max_budget_usd,
            body = req.body,
        )
    }
}

#[async_trait]
impl Runner for ProcessRunner {
    async fn run_phase(&self, cancel: &CancellationToken, req: RunRequest) -> Result<RunOutcome> {
        let mut parts = self.cmd.split_whitespace();
        let program = parts.next().context("runner command is empty")?;

        let mut child = Command::new(program)
            .args(parts)
            .arg(&req.phase_id)
            .stdin(std::process::Stdio::piped())
            .stdout(std::process::Stdio::piped())
            .current_dir(&self.work_dir)
            .kill_on_drop(true)
            .spawn()
            .with_context(|| format!("failed to spawn runner '{}'", self.cmd))?;

        let prompt = Self::build_prompt(&req);
        if let Some(mut stdin) = child.stdin.take() {
            stdin.write_all(prompt.as_bytes()).await?;
            stdin.shutdown().await.context("failed to close runner stdin")?;
        }

        let stdout = child.stdout.take().context("failed to take runner stdout")?;
        let mut lines = BufReader::new(stdout).lines();
        let mut last_line = String::new();

        loop {
            tokio::select! {
                _ = cancel.cancelled() => {
                    child.kill().await.ok();
                    anyhow::bail!("runner cancelled for phase '{}'", req.phase_id);
                }
                line = lines.next_line() => match line? {
                    Some(line) => {
                        if !line.trim().is_empty() {
                            last_line = line;
                        }
                    }
                    None => break,
                },
            }
        }

        let status = child.wait().await.context("failed to await runner")?;
        if !status.success() {
            anyhow::bail!(
                "runner exited with {} for phase '{}'",
                status.code().map(|c| c.to_string()).unwrap_or_else(|| "signal".into()),
                req.phase_id
            );
        }

        serde_json::from_str(&last_line).with_context(|| {
            format!(
                "runner for phase '{}' did not end with a JSON outcome line",
                req.phase_id
            )
        })
    }
}
