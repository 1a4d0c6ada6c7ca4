//! Hot reload: directory watching and in-place mutation of a live nebula.
//!
//! A notify-backed watcher feeds debounced change events into a bounded
//! channel; the reloader consumes them and either routes a refactored body
//! to a running phase loop (`modified`) or inserts a brand-new phase into
//! the running DAG (`added`). Removed files are logged and ignored.
//!
//! All graph and registry mutation happens under the orchestrator mutex;
//! the ticket-service call for a hot-added phase happens with the mutex
//! released, exactly like every other collaborator call.

use crate::group::ReloadHandle;
use crate::loader;
use crate::state::PhaseStatus;
use crate::validate;
use anyhow::{Context, Result};
use notify::{Event, EventKind, RecommendedWatcher, RecursiveMode, Watcher};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::time::{Duration, Instant};
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

/// Event channel depth; bursts beyond this apply backpressure to the
/// debounce thread, never to the notify callback.
const CHANGE_CHANNEL_CAPACITY: usize = 16;

/// Minimum quiet period before a file's events are forwarded. Editors write
/// in flurries; forwarding raw events guarantees refactor churn.
pub const DEBOUNCE: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChangeKind {
    Modified,
    Added,
    Removed,
}

#[derive(Debug, Clone)]
pub struct Change {
    pub kind: ChangeKind,
    pub path: PathBuf,
}

/// Watches a nebula directory for phase-file changes.
///
/// notify's callback pushes raw events into a std channel; a debounce
/// thread coalesces per-path flurries and forwards settled changes into the
/// bounded tokio channel the reloader consumes.
pub struct DirWatcher {
    rx: mpsc::Receiver<Change>,
    _watcher: RecommendedWatcher,
}

impl DirWatcher {
    pub fn start(dir: &Path) -> Result<Self> {
        Self::start_with_debounce(dir, DEBOUNCE)
    }

    pub fn start_with_debounce(dir: &Path, debounce: Duration) -> Result<Self> {
        let (raw_tx, raw_rx) = std::sync::mpsc::channel::<(ChangeKind, PathBuf)>();
        let (tx, rx) = mpsc::channel(CHANGE_CHANNEL_CAPACITY);

        let mut watcher = RecommendedWatcher::new(
            move |res: std::result::Result<Event, notify::Error>| match res {
                Ok(event) => {
                    let kind = match event.kind {
                        EventKind::Create(_) => Some(ChangeKind::Added),
                        EventKind::Modify(_) => Some(ChangeKind::Modified),
                        EventKind::Remove(_) => Some(ChangeKind::Removed),
                        _ => None,
                    };
                    if let Some(kind) = kind {
                        for path in event.paths {
                            raw_tx.send((kind, path)).ok();
                        }
                    }
                }
                Err(e) => tracing::warn!(error = %e, "file watcher error"),
            },
            notify::Config::default(),
        )
        .context("failed to create file watcher")?;

        watcher
            .watch(dir, RecursiveMode::NonRecursive)
            .with_context(|| format!("failed to watch {}", dir.display()))?;

        std::thread::spawn(move || {
            Self::debounce_loop(raw_rx, tx, debounce);
        });

        Ok(Self {
            rx,
            _watcher: watcher,
        })
    }

    /// Coalesce per-path events; forward once a path has been quiet for the
    /// debounce window. A create observed before modifications wins; a
    /// remove replaces anything earlier.
    fn debounce_loop(
        raw_rx: std::sync::mpsc::Receiver<(ChangeKind, PathBuf)>,
        tx: mpsc::Sender<Change>,
        debounce: Duration,
    ) {
        let mut settling: HashMap<PathBuf, (ChangeKind, Instant)> = HashMap::new();

        loop {
            match raw_rx.recv_timeout(debounce) {
                Ok((kind, path)) => {
                    if !is_phase_file(&path) {
                        continue;
                    }
                    settling
                        .entry(path)
                        .and_modify(|(existing, at)| {
                            *existing = merge_kind(*existing, kind);
                            *at = Instant::now();
                        })
                        .or_insert((kind, Instant::now()));
                }
                Err(std::sync::mpsc::RecvTimeoutError::Timeout) => {}
                Err(std::sync::mpsc::RecvTimeoutError::Disconnected) => break,
            }

            let now = Instant::now();
            let ready: Vec<PathBuf> = settling
                .iter()
                .filter(|(_, (_, at))| now.duration_since(*at) >= debounce)
                .map(|(p, _)| p.clone())
                .collect();
            for path in ready {
                let (kind, _) = settling.remove(&path).expect("key collected above");
                if tx.blocking_send(Change { kind, path }).is_err() {
                    return;
                }
            }
        }
    }

    /// Receive the next settled change.
    pub async fn next(&mut self) -> Option<Change> {
        self.rx.recv().await
    }

    /// Detach the change stream for direct consumption.
    pub fn into_channel(self) -> (mpsc::Receiver<Change>, RecommendedWatcher) {
        (self.rx, self._watcher)
    }
}

fn is_phase_file(path: &Path) -> bool {
    path.extension().is_some_and(|ext| ext == "md")
}

fn merge_kind(existing: ChangeKind, incoming: ChangeKind) -> ChangeKind {
    match (existing, incoming) {
        // A fresh file being written to is still "added".
        (ChangeKind::Added, ChangeKind::Modified) => ChangeKind::Added,
        (_, kind) => kind,
    }
}

/// Consumes the change stream and mutates the live engine.
pub struct HotReloader {
    handle: ReloadHandle,
}

impl HotReloader {
    pub fn new(handle: ReloadHandle) -> Self {
        Self { handle }
    }

    /// Consume changes until the stream closes or the context is cancelled.
    pub async fn run(self, cancel: CancellationToken, mut changes: mpsc::Receiver<Change>) {
        loop {
            tokio::select! {
                _ = cancel.cancelled() => return,
                change = changes.recv() => {
                    let Some(change) = change else { return };
                    self.apply(&cancel, change).await;
                }
            }
        }
    }

    /// Apply a single settled change.
    pub async fn apply(&self, cancel: &CancellationToken, change: Change) {
        match change.kind {
            ChangeKind::Modified => self.on_modified(cancel, &change.path).await,
            ChangeKind::Added => self.on_added(cancel, &change.path).await,
            ChangeKind::Removed => {
                tracing::info!(path = %change.path.display(), "phase file removed; ignoring");
            }
        }
    }

    /// Refactor: swap the stored body and route it to a running phase loop.
    async fn on_modified(&self, cancel: &CancellationToken, path: &Path) {
        let spec = match loader::parse_phase_file(path, &self.handle.manifest) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "refactor parse failed; dropped");
                return;
            }
        };

        let mut core = self.handle.core.lock().await;
        if !core.registry.contains(&spec.id) {
            // A modify event for an id we have never seen is an add in
            // disguise (editors that write-then-rename produce these).
            drop(core);
            tracing::debug!(phase = %spec.id, "modified file carries unknown id; treating as add");
            self.on_added(cancel, path).await;
            return;
        }

        core.pending_refactors
            .insert(spec.id.clone(), spec.body.clone());

        let dispatched = if let Some(tx) = core.refactor_loops.get(&spec.id) {
            // Non-blocking: on a full channel the newest body is dropped
            // here and the receiver drains to the latest it got.
            match tx.try_send(spec.body.clone()) {
                Ok(()) => {
                    core.pending_refactors.remove(&spec.id);
                    true
                }
                Err(mpsc::error::TrySendError::Full(_)) => false,
                Err(mpsc::error::TrySendError::Closed(_)) => false,
            }
        } else {
            false
        };

        if let Some(stored) = core.registry.get_mut(&spec.id) {
            stored.body = spec.body;
        }
        drop(core);

        tracing::info!(phase = %spec.id, dispatched, "refactor applied");
        if let Some(cb) = &self.handle.callbacks.on_refactor {
            cb(&spec.id, !dispatched);
        }
        self.handle.wake.notify_one();
    }

    /// Hot-add: validate against the live DAG, install blocks edges,
    /// register the phase, create its ticket, and surface it to the
    /// dispatcher when immediately ready.
    async fn on_added(&self, cancel: &CancellationToken, path: &Path) {
        let spec = match loader::parse_phase_file(path, &self.handle.manifest) {
            Ok(spec) => spec,
            Err(e) => {
                tracing::warn!(path = %path.display(), error = %e, "hot-add parse failed; dropped");
                return;
            }
        };
        let id = spec.id.clone();
        let title = spec.title.clone();
        let opts = crate::beads::opts_for(&spec);

        let deps = {
            let mut core = self.handle.core.lock().await;
            let existing: std::collections::HashSet<String> =
                core.registry.ids().map(|s| s.to_string()).collect();

            if let Err(errors) = validate::validate_hot_add(&spec, &existing, &mut core.dag) {
                for err in &errors {
                    tracing::warn!(phase = %id, error = %err, "hot-add rejected");
                }
                return;
            }

            // Resolve blocks: targets already running or finished keep
            // their current dependency list and the edge is dropped.
            let mut spec = spec;
            for target in spec.blocks.clone() {
                if core.tracker.is_in_flight(&target) || core.tracker.is_done(&target) {
                    tracing::warn!(
                        phase = %id,
                        target = %target,
                        "blocks target already started; dropping edge"
                    );
                    core.dag.remove_edge(&target, &id);
                } else if let Some(t) = core.registry.get_mut(&target) {
                    t.depends_on.push(id.clone());
                }
            }

            spec.blocks.retain(|t| {
                core.registry
                    .get(t)
                    .is_some_and(|ts| ts.depends_on.contains(&id))
            });
            let deps = spec.depends_on.clone();
            core.registry.push(spec);
            deps
        };

        // Ticket creation happens with the mutex released.
        let bead_id = match &self.handle.beads {
            Some(client) => match client.create(cancel, &title, opts).await {
                Ok(bid) => Some(bid),
                Err(e) => {
                    tracing::warn!(phase = %id, error = %e, "ticket creation failed; failing hot-added phase");
                    None
                }
            },
            None => Some(String::new()),
        };

        let ready_now = {
            let mut core = self.handle.core.lock().await;
            match bead_id {
                Some(bid) => {
                    core.state.set_phase_state(&id, &bid, PhaseStatus::Pending);
                    core.persist();
                    core.dag.ready(core.tracker.done()).contains(&id)
                }
                None => {
                    core.tracker.mark_failed(&id);
                    core.state.set_phase_state(&id, "", PhaseStatus::Failed);
                    core.persist();
                    false
                }
            }
        };

        if let Some(cb) = &self.handle.callbacks.on_hot_add {
            cb(&id, &title, &deps);
        }
        if ready_now {
            self.handle.hot_added_tx.send(id.clone()).await.ok();
        }
        tracing::info!(phase = %id, ready_now, "phase hot-added");
        self.handle.wake.notify_one();
    }
}
