//! The worker group: dispatch loop, workers, and shutdown discipline.
//!
//! Exactly one dispatch loop runs per nebula. Each round it snapshots the
//! ready set from the DAG, sorts by impact, lets the board veto, applies
//! the tracker's admission filter, and spawns a worker per admitted phase
//! under a `max_workers` semaphore. Workers run the external phase runner;
//! completions flow back over a channel and are folded into tracker, state,
//! and gater under the single orchestrator mutex.
//!
//! Locking discipline: collaborator I/O (runner, beads, board, prompter)
//! never happens while the mutex is held — drop, call, reacquire.

use crate::beads::{self, BeadsClient};
use crate::board::{Board, PollDecision};
use crate::dag::Dag;
use crate::errors::EngineError;
use crate::gate::{Checkpoint, Gater, PhaseDecision, PlanDecision};
use crate::manifest::{ExecutionConfig, Manifest, Nebula};
use crate::phase::{PhaseRegistry, PhaseSpec};
use crate::plan::{self, ExecutionPlan};
use crate::runner::{self, RunOutcome, RunRequest, Runner};
use crate::state::{PhaseStatus, State, StateStore};
use crate::tracker::PhaseTracker;
use crate::validate;
use serde::Serialize;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{Mutex, Notify, Semaphore, mpsc};
use tokio_util::sync::CancellationToken;

/// Fired after every phase transition.
#[derive(Debug, Clone, Serialize)]
pub struct ProgressUpdate {
    /// Phases that reached `done` successfully.
    pub completed: usize,
    pub total: usize,
    /// Non-terminal phase records.
    pub open: usize,
    /// Terminal phase records.
    pub closed: usize,
    pub total_cost_usd: f64,
}

pub type ProgressFn = Arc<dyn Fn(&ProgressUpdate) + Send + Sync>;
pub type HotAddFn = Arc<dyn Fn(&str, &str, &[String]) + Send + Sync>;
pub type RefactorFn = Arc<dyn Fn(&str, bool) + Send + Sync>;

/// Observer hooks; all optional.
#[derive(Default, Clone)]
pub struct Callbacks {
    pub progress: Option<ProgressFn>,
    pub on_hot_add: Option<HotAddFn>,
    pub on_refactor: Option<RefactorFn>,
}

/// Engine-level knobs not owned by the manifest.
#[derive(Debug, Clone)]
pub struct GroupConfig {
    pub max_workers: usize,
    /// Global re-poll rounds granted to blocked phases before escalation.
    pub poll_retry_limit: u32,
    /// Cadence for PAUSE/STOP sentinel checks and idle wakeups.
    pub sentinel_poll: Duration,
    /// Engine-global execution overrides (below manifest precedence).
    pub global_execution: Option<ExecutionConfig>,
}

impl Default for GroupConfig {
    fn default() -> Self {
        Self {
            max_workers: crate::manifest::DEFAULT_MAX_WORKERS,
            poll_retry_limit: 3,
            sentinel_poll: Duration::from_millis(200),
            global_execution: None,
        }
    }
}

/// A board-parked phase awaiting re-poll.
#[derive(Debug, Clone)]
pub struct BlockedPhase {
    pub reason: String,
    pub observations: u32,
}

/// Everything the orchestrator mutex protects. The worker group owns it
/// after initialization; the hot reloader mutates it under the same lock.
pub(crate) struct EngineCore {
    pub(crate) dag: Dag,
    pub(crate) registry: PhaseRegistry,
    pub(crate) tracker: PhaseTracker,
    pub(crate) state: State,
    pub(crate) store: StateStore,
    pub(crate) blocked: HashMap<String, BlockedPhase>,
    /// Refactor channel per running phase loop; unregistered on worker exit.
    pub(crate) refactor_loops: HashMap<String, mpsc::Sender<String>>,
    /// Latest refactored body per phase, for phases not currently running.
    pub(crate) pending_refactors: HashMap<String, String>,
}

impl EngineCore {
    /// Best-effort persistence: a failed save is a warning, not a failure.
    /// The next successful save overwrites whatever was missed.
    pub(crate) fn persist(&self) {
        if let Err(e) = self.store.save(&self.state) {
            tracing::warn!(error = %e, "state save failed; continuing");
        }
    }

    fn progress_snapshot(&self) -> ProgressUpdate {
        let (open, closed) = self.state.open_closed();
        let completed = self
            .state
            .phases
            .values()
            .filter(|p| p.status == PhaseStatus::Done)
            .count();
        ProgressUpdate {
            completed,
            total: self.registry.len(),
            open,
            closed,
            total_cost_usd: self.state.total_cost_usd,
        }
    }
}

/// Outcome record for one executed (or escalated) phase.
#[derive(Debug, Clone, Serialize)]
pub struct PhaseOutcome {
    pub phase_id: String,
    pub success: bool,
    pub cost_usd: f64,
    pub cycles_used: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// What a whole run produced.
#[derive(Debug, Default)]
pub struct RunSummary {
    pub results: Vec<PhaseOutcome>,
    pub completed: usize,
    pub failed: usize,
    pub skipped: usize,
    pub total_cost_usd: f64,
    /// True when the run ended on context cancellation.
    pub interrupted: bool,
}

struct WorkerDone {
    phase_id: String,
    outcome: Result<RunOutcome, String>,
}

/// Handle the hot reloader uses to reach into the running engine.
#[derive(Clone)]
pub struct ReloadHandle {
    pub(crate) core: Arc<Mutex<EngineCore>>,
    pub(crate) manifest: Manifest,
    pub(crate) beads: Option<Arc<dyn BeadsClient>>,
    pub(crate) hot_added_tx: mpsc::Sender<String>,
    pub(crate) wake: Arc<Notify>,
    pub(crate) callbacks: Callbacks,
}

/// The concurrent phase-execution engine for one nebula.
pub struct WorkerGroup {
    core: Arc<Mutex<EngineCore>>,
    manifest: Manifest,
    dir: PathBuf,
    runner: Arc<dyn Runner>,
    beads: Option<Arc<dyn BeadsClient>>,
    board: Option<Arc<dyn Board>>,
    gater: Arc<Gater>,
    cfg: GroupConfig,
    callbacks: Callbacks,
    sem: Arc<Semaphore>,
    hot_added_tx: mpsc::Sender<String>,
    hot_added_rx: mpsc::Receiver<String>,
    wake: Arc<Notify>,
}

impl WorkerGroup {
    /// Build the engine from a nebula and its resumed state. The nebula is
    /// re-validated here so the engine never runs on a broken graph.
    ///
    /// Phases found `in_progress` (crashed run) or `skipped` are reopened
    /// to `created` so a resumed run picks them up again.
    pub fn new(
        nebula: &Nebula,
        mut state: State,
        runner: Arc<dyn Runner>,
        gater: Gater,
        cfg: GroupConfig,
    ) -> Result<Self, EngineError> {
        // Structural errors are fatal here. Scope overlaps are not: the
        // admission filter serializes overlapping phases at runtime, so
        // they only warn.
        let (overlaps, errors): (Vec<_>, Vec<_>) = validate::validate(nebula)
            .into_iter()
            .partition(|e| e.category == validate::Category::ScopeOverlap);
        for warn in &overlaps {
            tracing::warn!(error = %warn, "scope overlap will serialize execution");
        }
        if !errors.is_empty() {
            for err in &errors {
                tracing::warn!(error = %err, "nebula failed validation");
            }
            return Err(EngineError::Validation(errors.len()));
        }

        let registry = nebula.registry();
        let dag = validate::build_dag(nebula)?;

        if state.nebula_name.is_empty() {
            state.nebula_name = nebula.name().to_string();
        }

        let mut tracker = PhaseTracker::new();
        let mut reopened = Vec::new();
        for (id, ps) in &state.phases {
            match ps.status {
                PhaseStatus::Done => tracker.finish(id, false),
                PhaseStatus::Failed => tracker.finish(id, true),
                PhaseStatus::InProgress | PhaseStatus::Skipped => reopened.push(id.clone()),
                PhaseStatus::Pending | PhaseStatus::Created => {}
            }
        }
        for id in reopened {
            state.set_phase_state(&id, "", PhaseStatus::Created);
        }

        let max_workers = cfg.max_workers.max(1);
        let (hot_added_tx, hot_added_rx) = mpsc::channel(16);

        Ok(Self {
            core: Arc::new(Mutex::new(EngineCore {
                dag,
                registry,
                tracker,
                state,
                store: StateStore::new(&nebula.dir),
                blocked: HashMap::new(),
                refactor_loops: HashMap::new(),
                pending_refactors: HashMap::new(),
            })),
            manifest: nebula.manifest.clone(),
            dir: nebula.dir.clone(),
            runner,
            beads: None,
            board: None,
            gater: Arc::new(gater),
            cfg,
            callbacks: Callbacks::default(),
            sem: Arc::new(Semaphore::new(max_workers)),
            hot_added_tx,
            hot_added_rx,
            wake: Arc::new(Notify::new()),
        })
    }

    pub fn with_beads(mut self, beads: Arc<dyn BeadsClient>) -> Self {
        self.beads = Some(beads);
        self
    }

    pub fn with_board(mut self, board: Arc<dyn Board>) -> Self {
        self.board = Some(board);
        self
    }

    pub fn with_callbacks(mut self, callbacks: Callbacks) -> Self {
        self.callbacks = callbacks;
        self
    }

    /// Handle for wiring a `HotReloader` to this engine.
    pub fn reload_handle(&self) -> ReloadHandle {
        ReloadHandle {
            core: self.core.clone(),
            manifest: self.manifest.clone(),
            beads: self.beads.clone(),
            hot_added_tx: self.hot_added_tx.clone(),
            wake: self.wake.clone(),
            callbacks: self.callbacks.clone(),
        }
    }

    /// Execute the nebula to quiescence, cancellation, or manual stop.
    pub async fn run(&mut self, cancel: CancellationToken) -> Result<RunSummary, EngineError> {
        // The plan gate runs before anything persists: a rejected plan
        // leaves the state file untouched.
        let plan = {
            let core = self.core.lock().await;
            ExecutionPlan::build(&core.registry, &core.dag, self.cfg.max_workers)
        };
        if self.gater.plan_gate(&cancel, &plan).await == PlanDecision::Rejected {
            return Err(EngineError::PlanRejected);
        }

        self.ensure_tickets(&cancel).await;

        let (done_tx, mut done_rx) = mpsc::channel::<WorkerDone>(64);
        let mut results: Vec<PhaseOutcome> = Vec::new();
        let mut stopping = false;
        let mut interrupted = false;
        let mut stale_blocked_rounds: u32 = 0;

        loop {
            if cancel.is_cancelled() && !stopping {
                stopping = true;
                interrupted = true;
            }

            match self.sentinel() {
                Sentinel::Stop => {
                    if !stopping {
                        tracing::info!("STOP sentinel observed; stopping gracefully");
                        stopping = true;
                    }
                }
                Sentinel::Pause => {
                    // A stopping run ignores PAUSE and proceeds to drain.
                    if !stopping {
                        tokio::select! {
                            _ = cancel.cancelled() => {}
                            _ = tokio::time::sleep(self.cfg.sentinel_poll) => {}
                        }
                        continue;
                    }
                }
                Sentinel::None => {}
            }

            if !stopping {
                let admitted = self.admission_round(&cancel, &mut stale_blocked_rounds, &mut results).await;
                for (spec, bead_id) in admitted {
                    self.dispatch(&cancel, spec, bead_id, done_tx.clone()).await;
                }
            }

            // Quiescence check.
            let (in_flight, runnable, blocked) = {
                let core = self.core.lock().await;
                let mut ready = core.dag.ready(core.tracker.done());
                ready.retain(|id| !core.tracker.is_in_flight(id));
                let blocked = core.blocked.len();
                let runnable = ready
                    .iter()
                    .filter(|id| !core.blocked.contains_key(*id))
                    .count();
                (core.tracker.in_flight_count(), runnable, blocked)
            };

            if stopping && in_flight == 0 {
                break;
            }
            if !stopping && in_flight == 0 && runnable == 0 && blocked == 0 {
                break;
            }

            // Wait for a completion, a hot-add, a reload wake, cancellation,
            // or the sentinel poll tick.
            let wake = self.wake.clone();
            let tick = self.cfg.sentinel_poll;
            let event = {
                let hot_rx = &mut self.hot_added_rx;
                tokio::select! {
                    done = done_rx.recv() => LoopEvent::Done(done),
                    id = hot_rx.recv() => LoopEvent::HotAdded(id),
                    _ = wake.notified() => LoopEvent::Tick,
                    _ = cancel.cancelled() => LoopEvent::Tick,
                    _ = tokio::time::sleep(tick) => LoopEvent::Tick,
                }
            };
            match event {
                LoopEvent::Done(Some(done)) => {
                    if self.handle_completion(&cancel, done, &mut results, stopping).await
                        == LoopSignal::Stop
                    {
                        stopping = true;
                    }
                }
                LoopEvent::HotAdded(Some(id)) => {
                    tracing::info!(phase = %id, "hot-added phase is ready for dispatch");
                }
                _ => {}
            }
        }

        // Drain remaining workers, then mark the remainder skipped.
        let leftover = {
            let core = self.core.lock().await;
            core.tracker.in_flight_count()
        };
        for _ in 0..leftover {
            if let Some(done) = done_rx.recv().await {
                self.handle_completion(&cancel, done, &mut results, true).await;
            }
        }
        self.skip_remaining().await;

        let summary = self.summarize(results, interrupted).await;
        Ok(summary)
    }

    /// One admission round: ready snapshot, board polls, tracker filter.
    /// Returns dispatch-ready (spec, bead_id) pairs.
    async fn admission_round(
        &mut self,
        cancel: &CancellationToken,
        stale_blocked_rounds: &mut u32,
        results: &mut Vec<PhaseOutcome>,
    ) -> Vec<(PhaseSpec, String)> {
        let candidates = {
            let core = self.core.lock().await;
            let mut ready = core.dag.ready(core.tracker.done());
            ready.retain(|id| !core.tracker.is_in_flight(id));
            let scores = plan::impact_scores(&core.dag);
            plan::sort_by_impact(&mut ready, &scores);
            ready
        };

        let mut cleared = Vec::new();
        let mut escalations: Vec<(String, String)> = Vec::new();

        if let Some(board) = self.board.clone() {
            if candidates.is_empty() {
                return Vec::new();
            }
            let snapshot = match board.snapshot(cancel).await {
                Ok(s) => s,
                Err(e) => {
                    tracing::warn!(error = %e, "board snapshot failed; skipping polls this round");
                    return Vec::new();
                }
            };

            for id in candidates {
                match board.poll(cancel, &id, &snapshot).await {
                    Ok(PollDecision::Proceed) => {
                        let mut core = self.core.lock().await;
                        core.blocked.remove(&id);
                        drop(core);
                        cleared.push(id);
                    }
                    Ok(PollDecision::NeedInfo { reason }) => {
                        let mut core = self.core.lock().await;
                        let entry = core
                            .blocked
                            .entry(id.clone())
                            .or_insert_with(|| BlockedPhase {
                                reason: reason.clone(),
                                observations: 0,
                            });
                        if entry.reason == reason {
                            entry.observations += 1;
                        } else {
                            entry.reason = reason;
                            entry.observations = 1;
                        }
                        tracing::debug!(phase = %id, reason = %entry.reason, "phase blocked by board");
                    }
                    Ok(PollDecision::Conflict { reason }) => {
                        escalations.push((id, reason));
                    }
                    Err(e) => {
                        tracing::warn!(phase = %id, error = %e, "board poll failed; excluding phase this round");
                    }
                }
            }

            // Blocked phases with nothing else to do get a bounded number of
            // global re-poll rounds before escalation.
            let (in_flight, blocked_ids) = {
                let core = self.core.lock().await;
                (
                    core.tracker.in_flight_count(),
                    core.blocked.keys().cloned().collect::<Vec<_>>(),
                )
            };
            if cleared.is_empty() && in_flight == 0 && !blocked_ids.is_empty() {
                *stale_blocked_rounds += 1;
                if *stale_blocked_rounds > self.cfg.poll_retry_limit {
                    for id in blocked_ids {
                        let reason = {
                            let core = self.core.lock().await;
                            core.blocked
                                .get(&id)
                                .map(|b| b.reason.clone())
                                .unwrap_or_default()
                        };
                        escalations.push((id, format!("still blocked after re-polls: {reason}")));
                    }
                    *stale_blocked_rounds = 0;
                }
            } else if !cleared.is_empty() {
                *stale_blocked_rounds = 0;
            }
        } else {
            cleared = candidates;
        }

        for (id, reason) in escalations {
            self.escalate(cancel, &id, &reason, results).await;
        }

        let mut core = self.core.lock().await;
        let EngineCore {
            tracker,
            registry,
            dag,
            state,
            ..
        } = &mut *core;

        let admission = tracker.filter_eligible(&cleared, registry, dag);
        for id in &admission.failed_deps {
            // Tracker-level propagation only: the stored status stays at
            // created so a later resume may retry once the dep is fixed.
            tracing::warn!(phase = %id, "rejected: a direct dependency failed");
            tracker.mark_failed(id);
        }

        let mut out = Vec::with_capacity(admission.admitted.len());
        for id in &admission.admitted {
            tracker.mark_in_flight(id);
            let spec = registry.get(id).expect("admitted ids are registered").clone();
            let bead_id = state.phase(id).map(|p| p.bead_id.clone()).unwrap_or_default();
            out.push((spec, bead_id));
        }
        out
    }

    /// Escalate a board conflict (or exhausted block) to phase failure and
    /// push it through the gate as a rejection signal.
    async fn escalate(
        &self,
        cancel: &CancellationToken,
        id: &str,
        reason: &str,
        results: &mut Vec<PhaseOutcome>,
    ) {
        tracing::warn!(phase = %id, reason = %reason, "escalating board-blocked phase to failure");
        let spec = {
            let mut core = self.core.lock().await;
            core.blocked.remove(id);
            core.tracker.mark_failed(id);
            core.state.set_phase_state(id, "", PhaseStatus::Failed);
            core.persist();
            core.registry.get(id).cloned()
        };
        self.emit_progress().await;

        results.push(PhaseOutcome {
            phase_id: id.to_string(),
            success: false,
            cost_usd: 0.0,
            cycles_used: 0,
            error: Some(reason.to_string()),
        });

        if let Some(spec) = spec {
            let checkpoint = Checkpoint {
                phase_id: id.to_string(),
                title: spec.title.clone(),
                success: false,
                error: Some(reason.to_string()),
                ..Default::default()
            };
            // The decision is informational here; the failure is recorded.
            let _ = self.gater.phase_gate(cancel, &spec, &checkpoint).await;
        }
    }

    /// Mirror phases into the issue tracker before dispatch: every phase
    /// still `pending` moves to `created` (with a bead id when a client is
    /// attached).
    async fn ensure_tickets(&self, cancel: &CancellationToken) {
        let todo: Vec<(String, String, crate::beads::BeadOpts)> = {
            let core = self.core.lock().await;
            core.registry
                .iter()
                .filter(|spec| core.state.status_of(&spec.id) == PhaseStatus::Pending)
                .map(|spec| (spec.id.clone(), spec.title.clone(), beads::opts_for(spec)))
                .collect()
        };
        if todo.is_empty() {
            return;
        }

        for (id, title, opts) in todo {
            let bead_id = match &self.beads {
                Some(client) => match client.create(cancel, &title, opts).await {
                    Ok(bid) => bid,
                    Err(e) => {
                        tracing::warn!(phase = %id, error = %e, "ticket creation failed; continuing without a bead");
                        String::new()
                    }
                },
                None => String::new(),
            };
            let mut core = self.core.lock().await;
            core.state.set_phase_state(&id, &bead_id, PhaseStatus::Created);
        }

        let core = self.core.lock().await;
        core.persist();
        drop(core);
        self.emit_progress().await;
    }

    /// Spawn a worker for one admitted phase.
    async fn dispatch(
        &self,
        cancel: &CancellationToken,
        mut spec: PhaseSpec,
        bead_id: String,
        done_tx: mpsc::Sender<WorkerDone>,
    ) {
        let id = spec.id.clone();
        let (refactor_tx, refactor_rx) = mpsc::channel::<String>(1);

        {
            let mut core = self.core.lock().await;
            // Adopt a refactor that landed while the phase was waiting.
            if let Some(body) = core.pending_refactors.remove(&id) {
                spec.body = body.clone();
                if let Some(stored) = core.registry.get_mut(&id) {
                    stored.body = body;
                }
            }
            core.refactor_loops.insert(id.clone(), refactor_tx);
            if core.state.status_of(&id) == PhaseStatus::Pending {
                core.state.set_phase_state(&id, &bead_id, PhaseStatus::Created);
            }
            core.state.set_phase_state(&id, &bead_id, PhaseStatus::InProgress);
            core.persist();
        }
        self.emit_progress().await;

        if let Some(board) = &self.board {
            if !spec.scope.is_empty() {
                if let Err(e) = board.claim(cancel, &id, &spec.scope).await {
                    tracing::warn!(phase = %id, error = %e, "board claim failed");
                }
            }
        }

        let execution = runner::resolve_execution(
            &spec,
            &self.manifest,
            self.cfg.global_execution.as_ref(),
        );
        let req = RunRequest {
            phase_id: id.clone(),
            bead_id,
            title: spec.title.clone(),
            body: spec.body.clone(),
            execution,
            refactors: refactor_rx,
        };

        let permit = self
            .sem
            .clone()
            .acquire_owned()
            .await
            .expect("worker semaphore never closes");
        let runner = self.runner.clone();
        let worker_cancel = cancel.clone();

        tokio::spawn(async move {
            let _permit = permit; // held for the worker's lifetime
            let outcome = runner
                .run_phase(&worker_cancel, req)
                .await
                .map_err(|e| e.to_string());
            done_tx
                .send(WorkerDone {
                    phase_id: id,
                    outcome,
                })
                .await
                .ok();
        });
    }

    /// Fold one worker completion into tracker/state, then interpose the
    /// gate. Returns `Stop` when the gate asked for graceful shutdown.
    async fn handle_completion(
        &self,
        cancel: &CancellationToken,
        done: WorkerDone,
        results: &mut Vec<PhaseOutcome>,
        stopping: bool,
    ) -> LoopSignal {
        let id = done.phase_id.clone();
        let (spec, checkpoint) = {
            let mut core = self.core.lock().await;
            core.refactor_loops.remove(&id);
            let failed = done.outcome.is_err();
            core.tracker.finish(&id, failed);

            let checkpoint = match &done.outcome {
                Ok(out) => {
                    core.state.set_phase_state(&id, "", PhaseStatus::Done);
                    if !out.report.is_empty() {
                        core.state.set_report(&id, &out.report);
                    }
                    core.state.add_cost(out.total_cost_usd);
                    Checkpoint {
                        phase_id: id.clone(),
                        title: String::new(),
                        success: true,
                        cost_usd: out.total_cost_usd,
                        cycles_used: out.cycles_used,
                        report: out.report.clone(),
                        base_commit_sha: out.base_commit_sha.clone(),
                        final_commit_sha: out.final_commit_sha.clone(),
                        error: None,
                    }
                }
                Err(e) => {
                    tracing::warn!(phase = %id, error = %e, "phase runner failed");
                    core.state.set_phase_state(&id, "", PhaseStatus::Failed);
                    Checkpoint {
                        phase_id: id.clone(),
                        success: false,
                        error: Some(e.clone()),
                        ..Default::default()
                    }
                }
            };
            core.persist();
            let spec = core.registry.get(&id).cloned();
            (spec, checkpoint)
        };
        self.emit_progress().await;

        let Some(spec) = spec else {
            return LoopSignal::Continue;
        };
        let mut checkpoint = checkpoint;
        checkpoint.title = spec.title.clone();

        results.push(PhaseOutcome {
            phase_id: id.clone(),
            success: checkpoint.success,
            cost_usd: checkpoint.cost_usd,
            cycles_used: checkpoint.cycles_used,
            error: checkpoint.error.clone(),
        });

        // Board bookkeeping happens off the mutex.
        if let Some(board) = &self.board {
            if let Err(e) = board.release(cancel, &id).await {
                tracing::warn!(phase = %id, error = %e, "board release failed");
            }
            if checkpoint.success {
                if let Err(e) = board.publish(cancel, &id, &spec.scope).await {
                    tracing::warn!(phase = %id, error = %e, "board publish failed");
                }
            }
        }

        if let Some(client) = &self.beads {
            let bead_id = {
                let core = self.core.lock().await;
                core.state.phase(&id).map(|p| p.bead_id.clone()).unwrap_or_default()
            };
            if !bead_id.is_empty() {
                if !checkpoint.report.is_empty() {
                    if let Err(e) =
                        client.add_comment(cancel, &bead_id, &checkpoint.report).await
                    {
                        tracing::warn!(phase = %id, error = %e, "bead comment failed");
                    }
                }
                let res = if checkpoint.success {
                    client.close(cancel, &bead_id).await
                } else {
                    client.update(cancel, &bead_id, "failed").await
                };
                if let Err(e) = res {
                    tracing::warn!(phase = %id, error = %e, "bead status update failed");
                }
            }
        }

        let decision = self.gater.phase_gate(cancel, &spec, &checkpoint).await;
        match decision {
            PhaseDecision::Accept => LoopSignal::Continue,
            PhaseDecision::Reject => {
                let mut core = self.core.lock().await;
                core.tracker.mark_failed(&id);
                core.state.set_phase_state(&id, "", PhaseStatus::Failed);
                core.persist();
                drop(core);
                self.emit_progress().await;
                LoopSignal::Continue
            }
            PhaseDecision::Retry => {
                if stopping {
                    return LoopSignal::Continue;
                }
                let mut core = self.core.lock().await;
                core.tracker.reopen(&id);
                core.state.set_phase_state(&id, "", PhaseStatus::Created);
                core.persist();
                drop(core);
                self.emit_progress().await;
                LoopSignal::Continue
            }
            PhaseDecision::Skip => {
                if !stopping {
                    tracing::info!(phase = %id, "gate requested skip; shutting down gracefully");
                }
                LoopSignal::Stop
            }
        }
    }

    /// Mark every non-terminal phase skipped and persist. Called once all
    /// workers have drained.
    async fn skip_remaining(&self) {
        let mut core = self.core.lock().await;
        let ids: Vec<String> = core.registry.ids().map(|s| s.to_string()).collect();
        let mut changed = false;
        for id in ids {
            if core.tracker.is_done(&id) {
                continue;
            }
            let status = core.state.status_of(&id);
            if !status.is_terminal() {
                core.state.set_phase_state(&id, "", PhaseStatus::Skipped);
                changed = true;
            }
        }
        if changed {
            core.persist();
            drop(core);
            self.emit_progress().await;
        }
    }

    async fn summarize(&self, results: Vec<PhaseOutcome>, interrupted: bool) -> RunSummary {
        let core = self.core.lock().await;
        let mut summary = RunSummary {
            results,
            interrupted,
            total_cost_usd: core.state.total_cost_usd,
            ..Default::default()
        };
        for ps in core.state.phases.values() {
            match ps.status {
                PhaseStatus::Done => summary.completed += 1,
                PhaseStatus::Failed => summary.failed += 1,
                PhaseStatus::Skipped => summary.skipped += 1,
                _ => {}
            }
        }
        summary
    }

    async fn emit_progress(&self) {
        let Some(progress) = self.callbacks.progress.clone() else {
            return;
        };
        let update = {
            let core = self.core.lock().await;
            core.progress_snapshot()
        };
        progress(&update);
    }

    fn sentinel(&self) -> Sentinel {
        if self.dir.join("STOP").exists() {
            Sentinel::Stop
        } else if self.dir.join("PAUSE").exists() {
            Sentinel::Pause
        } else {
            Sentinel::None
        }
    }
}

#[derive(Debug, PartialEq, Eq)]
enum LoopSignal {
    Continue,
    Stop,
}

enum LoopEvent {
    Done(Option<WorkerDone>),
    HotAdded(Option<String>),
    Tick,
}

#[derive(Debug, PartialEq, Eq)]
enum Sentinel {
    None,
    Pause,
    Stop,
}

/// Convenience: path of the STOP sentinel for a nebula dir.
pub fn stop_sentinel(dir: &Path) -> PathBuf {
    dir.join("STOP")
}

/// Convenience: path of the PAUSE sentinel for a nebula dir.
pub fn pause_sentinel(dir: &Path) -> PathBuf {
    dir.join("PAUSE")
}
