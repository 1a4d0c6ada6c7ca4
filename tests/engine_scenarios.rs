//! End-to-end engine scenarios driven through the public API with a mock
//! runner: dependency ordering, failure propagation, scope serialization,
//! hot-add, hot-add cycle rejection, and plan rejection.

use anyhow::Result;
use async_trait::async_trait;
use nebula::gate::{AutoPrompter, Gater, PhaseDecision};
use nebula::group::{GroupConfig, WorkerGroup};
use nebula::reload::{Change, ChangeKind, HotReloader};
use nebula::runner::{RunOutcome, RunRequest, Runner};
use nebula::state::{PhaseStatus, State, StateStore};
use nebula::{EngineError, Manifest, Nebula, PhaseSpec};
use std::collections::HashMap;
use std::path::Path;
use std::sync::Arc;
use std::sync::Mutex;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tempfile::tempdir;
use tokio_util::sync::CancellationToken;

/// Mock runner: records call order, tracks peak concurrency, takes per-phase
/// costs, and fails the phases it is told to fail.
struct MockRunner {
    calls: Mutex<Vec<String>>,
    costs: HashMap<String, f64>,
    fail: Vec<String>,
    delay: Duration,
    running: AtomicUsize,
    max_observed: AtomicUsize,
}

impl MockRunner {
    fn new() -> Self {
        Self {
            calls: Mutex::new(Vec::new()),
            costs: HashMap::new(),
            fail: Vec::new(),
            delay: Duration::from_millis(25),
            running: AtomicUsize::new(0),
            max_observed: AtomicUsize::new(0),
        }
    }

    fn with_costs(costs: &[(&str, f64)]) -> Self {
        Self {
            costs: costs.iter().map(|(k, v)| (k.to_string(), *v)).collect(),
            ..Self::new()
        }
    }

    fn failing(ids: &[&str]) -> Self {
        Self {
            fail: ids.iter().map(|s| s.to_string()).collect(),
            ..Self::new()
        }
    }

    fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

#[async_trait]
impl Runner for MockRunner {
    async fn run_phase(&self, _cancel: &CancellationToken, req: RunRequest) -> Result<RunOutcome> {
        self.calls.lock().unwrap().push(req.phase_id.clone());
        let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_observed.fetch_max(now, Ordering::SeqCst);
        tokio::time::sleep(self.delay).await;
        self.running.fetch_sub(1, Ordering::SeqCst);

        if self.fail.contains(&req.phase_id) {
            anyhow::bail!("injected failure for {}", req.phase_id);
        }
        Ok(RunOutcome {
            total_cost_usd: self.costs.get(&req.phase_id).copied().unwrap_or(1.0),
            cycles_used: 1,
            report: format!("{} complete", req.phase_id),
            base_commit_sha: Some("aaaaaaaa".into()),
            final_commit_sha: Some("bbbbbbbb".into()),
        })
    }
}

fn nebula_in(dir: &Path, phases: Vec<PhaseSpec>) -> Nebula {
    let manifest: Manifest = toml::from_str("[nebula]\nname = \"scenario\"\n").unwrap();
    Nebula {
        dir: dir.to_path_buf(),
        manifest,
        phases,
    }
}

fn quick_config(max_workers: usize) -> GroupConfig {
    GroupConfig {
        max_workers,
        sentinel_poll: Duration::from_millis(10),
        ..Default::default()
    }
}

#[tokio::test]
async fn scenario_linear_chain() {
    let dir = tempdir().unwrap();
    let nebula = nebula_in(
        dir.path(),
        vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
            PhaseSpec::new("c", "C").with_deps(&["b"]),
        ],
    );
    let runner = Arc::new(MockRunner::with_costs(&[("a", 1.0), ("b", 2.0), ("c", 3.5)]));
    let mut group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        Gater::trusting(),
        quick_config(4),
    )
    .unwrap();

    let summary = group.run(CancellationToken::new()).await.unwrap();

    assert_eq!(runner.calls(), vec!["a", "b", "c"]);
    assert_eq!(summary.completed, 3);
    assert!((summary.total_cost_usd - 6.5).abs() < 1e-9);

    let state = StateStore::new(dir.path()).load().unwrap();
    for id in ["a", "b", "c"] {
        assert_eq!(state.status_of(id), PhaseStatus::Done);
    }
    assert!((state.total_cost_usd - 6.5).abs() < 1e-9);
}

#[tokio::test]
async fn scenario_failed_dep_propagation() {
    let dir = tempdir().unwrap();
    let nebula = nebula_in(
        dir.path(),
        vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
        ],
    );
    let runner = Arc::new(MockRunner::failing(&["a"]));
    let mut group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        Gater::trusting(),
        quick_config(4),
    )
    .unwrap();

    let summary = group.run(CancellationToken::new()).await.unwrap();

    // b is never dispatched; exactly one result, for a.
    assert_eq!(runner.calls(), vec!["a"]);
    assert_eq!(summary.results.len(), 1);
    assert_eq!(summary.results[0].phase_id, "a");

    let state = StateStore::new(dir.path()).load().unwrap();
    assert_eq!(state.status_of("a"), PhaseStatus::Failed);
    assert_eq!(state.status_of("b"), PhaseStatus::Created);
}

#[tokio::test]
async fn scenario_scope_conflict_serializes_wave() {
    let dir = tempdir().unwrap();
    let nebula = nebula_in(
        dir.path(),
        vec![
            PhaseSpec::new("a", "A").with_scope(&["internal/**"]),
            PhaseSpec::new("b", "B").with_scope(&["internal/loop/**"]),
            PhaseSpec::new("c", "C").with_scope(&["cmd/**"]),
        ],
    );

    // Planning: effective parallelism of the single wave is 2.
    let registry = nebula.registry();
    let dag = nebula::validate::build_dag(&nebula).unwrap();
    let wave: Vec<String> = ["a", "b", "c"].iter().map(|s| s.to_string()).collect();
    assert_eq!(
        nebula::plan::effective_parallelism(&wave, &registry, &dag, 3),
        2
    );

    let runner = Arc::new(MockRunner::new());
    let mut group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        Gater::trusting(),
        quick_config(3),
    )
    .unwrap();

    let summary = group.run(CancellationToken::new()).await.unwrap();

    assert_eq!(summary.completed, 3);
    // Concurrency never exceeded the conflict-free bound.
    assert!(runner.max_observed.load(Ordering::SeqCst) <= 2);
    // b ran strictly after whichever conflicting phase ran first.
    let calls = runner.calls();
    let pos_a = calls.iter().position(|c| c == "a").unwrap();
    let pos_b = calls.iter().position(|c| c == "b").unwrap();
    assert!(pos_b > pos_a);
}

#[tokio::test]
async fn scenario_hot_add_inserts_new_leaf() {
    let dir = tempdir().unwrap();
    let nebula = nebula_in(
        dir.path(),
        vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
        ],
    );
    // A slow runner keeps b in flight long enough for the hot-add to land
    // while the engine is still running.
    let runner = Arc::new(MockRunner {
        delay: Duration::from_millis(150),
        ..MockRunner::new()
    });
    let mut group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        Gater::trusting(),
        quick_config(4),
    )
    .unwrap();

    // Drop the new phase file once a is done, while b is still running.
    let reloader = HotReloader::new(group.reload_handle());
    let phase_path = dir.path().join("c.md");
    let dir_path = dir.path().to_path_buf();
    let driver = tokio::spawn(async move {
        loop {
            let state = StateStore::new(&dir_path).load().unwrap();
            if state.status_of("a") == PhaseStatus::Done {
                break;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        std::fs::write(
            &phase_path,
            "+++\nid = \"c\"\ntitle = \"C\"\ndepends_on = [\"a\"]\n+++\nhot-added work\n",
        )
        .unwrap();
        reloader
            .apply(
                &CancellationToken::new(),
                Change {
                    kind: ChangeKind::Added,
                    path: phase_path,
                },
            )
            .await;
    });

    let summary = group.run(CancellationToken::new()).await.unwrap();
    driver.await.unwrap();

    let calls = runner.calls();
    assert!(calls.contains(&"c".to_string()), "hot-added phase ran: {calls:?}");
    assert_eq!(summary.completed, 3);

    let state = StateStore::new(dir.path()).load().unwrap();
    assert_eq!(state.status_of("c"), PhaseStatus::Done);
}

#[tokio::test]
async fn scenario_hot_add_cycle_is_rejected() {
    let dir = tempdir().unwrap();
    let nebula = nebula_in(
        dir.path(),
        vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
        ],
    );
    let runner = Arc::new(MockRunner::new());
    let group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        Gater::trusting(),
        quick_config(4),
    )
    .unwrap();

    let handle = group.reload_handle();
    let reloader = HotReloader::new(handle);

    // a2 depends on b and blocks a: ValidateHotAdd must report a cycle and
    // leave the live DAG untouched.
    let path = dir.path().join("a2.md");
    std::fs::write(
        &path,
        "+++\nid = \"a2\"\ntitle = \"A2\"\ndepends_on = [\"b\"]\nblocks = [\"a\"]\n+++\n",
    )
    .unwrap();
    reloader
        .apply(
            &CancellationToken::new(),
            Change {
                kind: ChangeKind::Added,
                path,
            },
        )
        .await;

    // Execution continues as if nothing happened.
    let mut group = group;
    let summary = group.run(CancellationToken::new()).await.unwrap();
    assert_eq!(runner.calls(), vec!["a", "b"]);
    assert_eq!(summary.completed, 2);
    let state = StateStore::new(dir.path()).load().unwrap();
    assert_eq!(state.phase("a2"), None);
}

#[tokio::test]
async fn scenario_plan_rejection() {
    let dir = tempdir().unwrap();
    let mut nebula = nebula_in(dir.path(), vec![PhaseSpec::new("a", "A")]);
    nebula.manifest.execution.gate = Some("approve".to_string());

    let runner = Arc::new(MockRunner::new());
    let gater = Gater::new(
        Some("approve".to_string()),
        Arc::new(AutoPrompter::returning(PhaseDecision::Skip)),
    );
    let mut group = WorkerGroup::new(
        &nebula,
        State::empty("scenario"),
        runner.clone(),
        gater,
        quick_config(4),
    )
    .unwrap();

    let err = group.run(CancellationToken::new()).await.unwrap_err();
    assert!(matches!(err, EngineError::PlanRejected));
    // No worker ran and the state file was never written.
    assert!(runner.calls().is_empty());
    assert!(!dir.path().join("nebula.state.toml").exists());
}
