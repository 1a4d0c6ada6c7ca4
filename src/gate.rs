//! Gate modes and the human checkpoint protocol.
//!
//! Four modes share the two-method contract `{phase_gate, plan_gate}`:
//!
//! | mode    | phase completion              | plan start              |
//! |---------|-------------------------------|-------------------------|
//! | trust   | accept silently               | proceed                 |
//! | watch   | render checkpoint, accept     | proceed                 |
//! | review  | render, ask the prompter      | proceed                 |
//! | approve | render, ask the prompter      | ask; reject unless ok   |
//!
//! Resolution per phase: phase-level `gate` wins, else the manifest gate,
//! else trust; unknown strings fall back to trust. Checkpoint rendering is
//! serialized under a dedicated output mutex so it never holds up the
//! orchestrator mutex.

use crate::phase::PhaseSpec;
use crate::plan::ExecutionPlan;
use async_trait::async_trait;
use serde::Serialize;
use std::str::FromStr;
use std::sync::Arc;
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader, Lines};
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum GateMode {
    #[default]
    Trust,
    Watch,
    Review,
    Approve,
}

impl FromStr for GateMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "trust" => Ok(Self::Trust),
            "watch" => Ok(Self::Watch),
            "review" => Ok(Self::Review),
            "approve" => Ok(Self::Approve),
            _ => anyhow::bail!(
                "invalid gate mode '{}'. Valid values: trust, watch, review, approve",
                s
            ),
        }
    }
}

impl std::fmt::Display for GateMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Trust => "trust",
            Self::Watch => "watch",
            Self::Review => "review",
            Self::Approve => "approve",
        };
        write!(f, "{s}")
    }
}

/// Resolve the effective mode for one phase. Unknown strings at either
/// level degrade to trust; the validator reports them separately.
pub fn resolve_mode(phase_gate: Option<&str>, manifest_gate: Option<&str>) -> GateMode {
    if let Some(raw) = phase_gate {
        return GateMode::from_str(raw).unwrap_or_default();
    }
    if let Some(raw) = manifest_gate {
        return GateMode::from_str(raw).unwrap_or_default();
    }
    GateMode::Trust
}

/// Decision for a completed phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PhaseDecision {
    Accept,
    Reject,
    Retry,
    Skip,
}

/// Decision for the whole plan before dispatch.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PlanDecision {
    Proceed,
    Rejected,
}

/// Which prompt is being asked; the allowed keys differ.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PromptKind {
    /// `{approve, skip}`
    Plan,
    /// `{accept, reject, retry, skip}`
    Phase,
}

/// Human-readable summary of a phase outcome, rendered at a gate.
#[derive(Debug, Clone, Default, Serialize)]
pub struct Checkpoint {
    pub phase_id: String,
    pub title: String,
    pub success: bool,
    pub cost_usd: f64,
    pub cycles_used: u32,
    pub report: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub final_commit_sha: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// Source of human decisions.
#[async_trait]
pub trait Prompter: Send + Sync {
    async fn prompt(&self, cancel: &CancellationToken, kind: PromptKind) -> PhaseDecision;
}

/// Line-oriented prompter over any async input source.
///
/// Decision table for degraded input:
/// - non-interactive input: accept with a warning, no read attempted
/// - context cancellation: skip
/// - EOF: skip
/// - unparseable line: accept
/// - per-prompt timeout: accept for phase prompts, skip for plan prompts
pub struct TerminalPrompter {
    input: Mutex<Lines<BufReader<Box<dyn AsyncRead + Send + Unpin>>>>,
    timeout: Duration,
    interactive: bool,
}

impl TerminalPrompter {
    /// Prompter over stdin with the configured per-prompt timeout.
    pub fn stdin(timeout: Duration) -> Self {
        let reader: Box<dyn AsyncRead + Send + Unpin> = Box::new(tokio::io::stdin());
        Self {
            input: Mutex::new(BufReader::new(reader).lines()),
            timeout,
            interactive: console::user_attended(),
        }
    }

    /// Prompter over an arbitrary source, treated as interactive. Used by
    /// tests and by callers piping decisions in deliberately.
    pub fn from_reader<R>(reader: R, timeout: Duration) -> Self
    where
        R: AsyncRead + Send + Unpin + 'static,
    {
        let boxed: Box<dyn AsyncRead + Send + Unpin> = Box::new(reader);
        Self {
            input: Mutex::new(BufReader::new(boxed).lines()),
            timeout,
            interactive: true,
        }
    }

    fn parse(kind: PromptKind, line: &str) -> PhaseDecision {
        let token = line.trim().to_lowercase();
        match kind {
            PromptKind::Plan => match token.as_str() {
                "approve" | "a" | "yes" | "y" => PhaseDecision::Accept,
                "skip" | "s" | "no" | "n" => PhaseDecision::Skip,
                _ => {
                    tracing::warn!(input = %token, "unrecognized plan gate input, defaulting to approve");
                    PhaseDecision::Accept
                }
            },
            PromptKind::Phase => match token.as_str() {
                "accept" | "a" | "" => PhaseDecision::Accept,
                "reject" | "r" => PhaseDecision::Reject,
                "retry" | "t" => PhaseDecision::Retry,
                "skip" | "s" => PhaseDecision::Skip,
                _ => {
                    tracing::warn!(input = %token, "unrecognized phase gate input, defaulting to accept");
                    PhaseDecision::Accept
                }
            },
        }
    }

    fn timeout_default(kind: PromptKind) -> PhaseDecision {
        match kind {
            PromptKind::Phase => PhaseDecision::Accept,
            PromptKind::Plan => PhaseDecision::Skip,
        }
    }
}

#[async_trait]
impl Prompter for TerminalPrompter {
    async fn prompt(&self, cancel: &CancellationToken, kind: PromptKind) -> PhaseDecision {
        if !self.interactive {
            tracing::warn!("gate prompt on non-interactive input, auto-accepting");
            return PhaseDecision::Accept;
        }

        let keys = match kind {
            PromptKind::Plan => "[a]pprove / [s]kip",
            PromptKind::Phase => "[a]ccept / [r]eject / re[t]ry / [s]kip",
        };
        println!("  {} {}", console::style("decision?").bold(), console::style(keys).dim());

        let mut input = self.input.lock().await;
        tokio::select! {
            _ = cancel.cancelled() => PhaseDecision::Skip,
            _ = tokio::time::sleep(self.timeout) => {
                tracing::warn!(timeout_secs = self.timeout.as_secs(), "gate prompt timed out");
                Self::timeout_default(kind)
            }
            line = input.next_line() => match line {
                Ok(Some(line)) => Self::parse(kind, &line),
                // EOF
                Ok(None) => PhaseDecision::Skip,
                Err(e) => {
                    tracing::warn!(error = %e, "gate prompt read failed, defaulting to accept");
                    PhaseDecision::Accept
                }
            },
        }
    }
}

/// The gate strategy tree, resolved per phase.
pub struct Gater {
    manifest_gate: Option<String>,
    prompter: Arc<dyn Prompter>,
    /// Output mutex: checkpoint rendering serializes here, independent of
    /// the orchestrator mutex.
    output: Arc<Mutex<()>>,
}

impl Gater {
    pub fn new(manifest_gate: Option<String>, prompter: Arc<dyn Prompter>) -> Self {
        Self {
            manifest_gate,
            prompter,
            output: Arc::new(Mutex::new(())),
        }
    }

    /// A gater that accepts everything; the default for tests and trust-only runs.
    pub fn trusting() -> Self {
        Self::new(None, Arc::new(AutoPrompter::accepting()))
    }

    pub fn mode_for(&self, phase: &PhaseSpec) -> GateMode {
        resolve_mode(phase.gate.as_deref(), self.manifest_gate.as_deref())
    }

    fn manifest_mode(&self) -> GateMode {
        resolve_mode(None, self.manifest_gate.as_deref())
    }

    /// Interpose on one phase completion.
    pub async fn phase_gate(
        &self,
        cancel: &CancellationToken,
        phase: &PhaseSpec,
        checkpoint: &Checkpoint,
    ) -> PhaseDecision {
        match self.mode_for(phase) {
            GateMode::Trust => PhaseDecision::Accept,
            GateMode::Watch => {
                self.render_checkpoint(checkpoint).await;
                PhaseDecision::Accept
            }
            GateMode::Review | GateMode::Approve => {
                self.render_checkpoint(checkpoint).await;
                self.prompter.prompt(cancel, PromptKind::Phase).await
            }
        }
    }

    /// Interpose on plan start. Only the approve mode consults the prompter.
    pub async fn plan_gate(
        &self,
        cancel: &CancellationToken,
        plan: &ExecutionPlan,
    ) -> PlanDecision {
        if self.manifest_mode() != GateMode::Approve {
            return PlanDecision::Proceed;
        }

        self.render_plan(plan).await;
        match self.prompter.prompt(cancel, PromptKind::Plan).await {
            PhaseDecision::Accept => PlanDecision::Proceed,
            _ => PlanDecision::Rejected,
        }
    }

    async fn render_checkpoint(&self, cp: &Checkpoint) {
        let _guard = self.output.lock().await;
        let status = if cp.success {
            console::style("done").green()
        } else {
            console::style("failed").red()
        };
        println!();
        println!(
            "{} {} {} [{}]",
            console::style("checkpoint").bold().cyan(),
            console::style(&cp.phase_id).bold(),
            console::style(&cp.title).dim(),
            status,
        );
        println!(
            "  cost ${:.2}  cycles {}",
            cp.cost_usd, cp.cycles_used
        );
        if let (Some(base), Some(fin)) = (&cp.base_commit_sha, &cp.final_commit_sha) {
            println!("  commits {}..{}", shorten(base), shorten(fin));
        }
        if let Some(ref err) = cp.error {
            println!("  {} {}", console::style("error:").red(), err);
        }
        if !cp.report.is_empty() {
            for line in cp.report.lines().take(6) {
                println!("  {}", console::style(line).dim());
            }
        }
    }

    async fn render_plan(&self, plan: &ExecutionPlan) {
        let _guard = self.output.lock().await;
        println!(
            "{} {} wave(s), {} track(s)",
            console::style("plan").bold().cyan(),
            plan.waves.len(),
            plan.tracks.len()
        );
        for (i, wave) in plan.waves.iter().enumerate() {
            println!(
                "  wave {} (parallelism {}): {}",
                i,
                plan.parallelism.get(i).copied().unwrap_or(0),
                wave.join(", ")
            );
        }
        for risk in &plan.risks {
            println!("  {} {}", console::style("risk:").yellow(), risk);
        }
    }
}

fn shorten(sha: &str) -> &str {
    &sha[..sha.len().min(8)]
}

/// Prompter returning a fixed decision; used for tests and headless runs.
pub struct AutoPrompter {
    decision: PhaseDecision,
}

impl AutoPrompter {
    pub fn accepting() -> Self {
        Self {
            decision: PhaseDecision::Accept,
        }
    }

    pub fn returning(decision: PhaseDecision) -> Self {
        Self { decision }
    }
}

#[async_trait]
impl Prompter for AutoPrompter {
    async fn prompt(&self, _cancel: &CancellationToken, _kind: PromptKind) -> PhaseDecision {
        self.decision
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn mode_parsing_and_fallback() {
        assert_eq!(GateMode::from_str("review").unwrap(), GateMode::Review);
        assert_eq!(GateMode::from_str("APPROVE").unwrap(), GateMode::Approve);
        assert!(GateMode::from_str("berserk").is_err());

        assert_eq!(resolve_mode(Some("watch"), Some("approve")), GateMode::Watch);
        assert_eq!(resolve_mode(None, Some("approve")), GateMode::Approve);
        assert_eq!(resolve_mode(None, None), GateMode::Trust);
        // Unknown strings degrade to trust at resolution time.
        assert_eq!(resolve_mode(Some("berserk"), Some("review")), GateMode::Trust);
        assert_eq!(resolve_mode(None, Some("berserk")), GateMode::Trust);
    }

    #[test]
    fn prompt_parsing_per_kind() {
        use PhaseDecision::*;
        assert_eq!(TerminalPrompter::parse(PromptKind::Phase, "accept"), Accept);
        assert_eq!(TerminalPrompter::parse(PromptKind::Phase, "r"), Reject);
        assert_eq!(TerminalPrompter::parse(PromptKind::Phase, "retry"), Retry);
        assert_eq!(TerminalPrompter::parse(PromptKind::Phase, " s "), Skip);
        // Parse errors default to accept.
        assert_eq!(TerminalPrompter::parse(PromptKind::Phase, "??"), Accept);

        assert_eq!(TerminalPrompter::parse(PromptKind::Plan, "approve"), Accept);
        assert_eq!(TerminalPrompter::parse(PromptKind::Plan, "skip"), Skip);
        assert_eq!(TerminalPrompter::parse(PromptKind::Plan, "gibberish"), Accept);
    }

    #[tokio::test]
    async fn prompter_reads_decisions_from_reader() {
        let input = std::io::Cursor::new(b"reject\nretry\n".to_vec());
        let prompter = TerminalPrompter::from_reader(input, Duration::from_secs(5));
        let cancel = CancellationToken::new();

        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Phase).await,
            PhaseDecision::Reject
        );
        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Phase).await,
            PhaseDecision::Retry
        );
        // EOF yields skip.
        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Phase).await,
            PhaseDecision::Skip
        );
    }

    #[tokio::test]
    async fn cancellation_yields_skip() {
        // Empty pending reader: the cancel branch must win.
        let (_tx, rx) = tokio::io::duplex(8);
        let prompter = TerminalPrompter::from_reader(rx, Duration::from_secs(60));
        let cancel = CancellationToken::new();
        cancel.cancel();

        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Phase).await,
            PhaseDecision::Skip
        );
    }

    #[tokio::test]
    async fn timeout_defaults_differ_per_kind() {
        let (_tx, rx) = tokio::io::duplex(8);
        let prompter = TerminalPrompter::from_reader(rx, Duration::from_millis(10));
        let cancel = CancellationToken::new();
        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Phase).await,
            PhaseDecision::Accept
        );

        let (_tx2, rx2) = tokio::io::duplex(8);
        let prompter = TerminalPrompter::from_reader(rx2, Duration::from_millis(10));
        assert_eq!(
            prompter.prompt(&cancel, PromptKind::Plan).await,
            PhaseDecision::Skip
        );
    }

    #[tokio::test]
    async fn trust_and_watch_accept_without_prompting() {
        // A prompter that would reject everything: trust/watch never consult it.
        let gater = Gater::new(
            Some("watch".to_string()),
            Arc::new(AutoPrompter::returning(PhaseDecision::Reject)),
        );
        let phase = PhaseSpec::new("a", "A");
        let cp = Checkpoint {
            phase_id: "a".into(),
            title: "A".into(),
            success: true,
            ..Default::default()
        };
        let cancel = CancellationToken::new();

        assert_eq!(
            gater.phase_gate(&cancel, &phase, &cp).await,
            PhaseDecision::Accept
        );

        let mut trusted = PhaseSpec::new("b", "B");
        trusted.gate = Some("trust".to_string());
        assert_eq!(
            gater.phase_gate(&cancel, &trusted, &cp).await,
            PhaseDecision::Accept
        );
    }

    #[tokio::test]
    async fn review_mode_consults_prompter() {
        let gater = Gater::new(
            Some("review".to_string()),
            Arc::new(AutoPrompter::returning(PhaseDecision::Retry)),
        );
        let phase = PhaseSpec::new("a", "A");
        let cp = Checkpoint::default();
        let cancel = CancellationToken::new();

        assert_eq!(
            gater.phase_gate(&cancel, &phase, &cp).await,
            PhaseDecision::Retry
        );
    }

    #[tokio::test]
    async fn plan_gate_only_bites_in_approve_mode() {
        use crate::dag::Dag;
        use crate::phase::PhaseRegistry;

        let registry = PhaseRegistry::new(vec![PhaseSpec::new("a", "A")]);
        let mut dag = Dag::new();
        dag.add_node("a", 0);
        let plan = ExecutionPlan::build(&registry, &dag, 4);
        let cancel = CancellationToken::new();

        let review = Gater::new(
            Some("review".to_string()),
            Arc::new(AutoPrompter::returning(PhaseDecision::Skip)),
        );
        assert_eq!(review.plan_gate(&cancel, &plan).await, PlanDecision::Proceed);

        let approve_no = Gater::new(
            Some("approve".to_string()),
            Arc::new(AutoPrompter::returning(PhaseDecision::Skip)),
        );
        assert_eq!(
            approve_no.plan_gate(&cancel, &plan).await,
            PlanDecision::Rejected
        );

        let approve_yes = Gater::new(
            Some("approve".to_string()),
            Arc::new(AutoPrompter::accepting()),
        );
        assert_eq!(
            approve_yes.plan_gate(&cancel, &plan).await,
            PlanDecision::Proceed
        );
    }
}
