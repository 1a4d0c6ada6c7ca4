//! Execution planning: impact scores, tracks, and effective parallelism.
//!
//! The plan is read-only derived data. Impact ordering is what the
//! dispatcher sorts ready sets by: more transitive dependents first, then
//! higher priority, then id — so unblocking work always outranks cosmetics.

use crate::dag::Dag;
use crate::phase::PhaseRegistry;
use crate::scope;
use serde::Serialize;
use std::collections::BTreeMap;

/// Criticality of one phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct ImpactScore {
    /// Transitive dependents — how much work this phase gates.
    pub dependents: usize,
    pub priority: i64,
    /// Wave index, i.e. dependency depth from the roots.
    pub depth: usize,
}

impl ImpactScore {
    /// Scalar used for display; the ordering itself is field-wise.
    pub fn value(&self) -> i64 {
        self.dependents as i64 * 10 + self.priority + self.depth as i64
    }
}

/// Impact for every node of the graph.
pub fn impact_scores(dag: &Dag) -> BTreeMap<String, ImpactScore> {
    let mut depth_of: BTreeMap<String, usize> = BTreeMap::new();
    for (i, wave) in dag.compute_waves().iter().enumerate() {
        for id in wave {
            depth_of.insert(id.clone(), i);
        }
    }

    dag.node_ids()
        .map(|id| {
            let score = ImpactScore {
                dependents: dag.transitive_dependents(id).len(),
                priority: dag.priority(id).unwrap_or(0),
                depth: depth_of.get(id).copied().unwrap_or(0),
            };
            (id.to_string(), score)
        })
        .collect()
}

/// Sort ids by impact: dependents desc, priority desc, id asc.
pub fn sort_by_impact(ids: &mut [String], scores: &BTreeMap<String, ImpactScore>) {
    ids.sort_by(|a, b| {
        let sa = scores.get(a);
        let sb = scores.get(b);
        let da = sa.map(|s| s.dependents).unwrap_or(0);
        let db = sb.map(|s| s.dependents).unwrap_or(0);
        let pa = sa.map(|s| s.priority).unwrap_or(0);
        let pb = sb.map(|s| s.priority).unwrap_or(0);
        db.cmp(&da).then(pb.cmp(&pa)).then(a.cmp(b))
    });
}

/// Partition the graph into weakly-connected components. Phases in
/// different tracks share no edges in either direction, so workers may be
/// pinned per track. Each track is listed in impact order.
pub fn tracks(dag: &Dag) -> Vec<Vec<String>> {
    let scores = impact_scores(dag);
    let mut assigned: BTreeMap<String, usize> = BTreeMap::new();
    let mut components: Vec<Vec<String>> = Vec::new();

    for id in dag.node_ids() {
        if assigned.contains_key(id) {
            continue;
        }
        let track_idx = components.len();
        let mut members = Vec::new();
        let mut stack = vec![id.to_string()];
        while let Some(cur) = stack.pop() {
            if assigned.contains_key(&cur) {
                continue;
            }
            assigned.insert(cur.clone(), track_idx);
            for next in dag.deps_for(&cur).into_iter().chain(dag.dependents_of(&cur)) {
                if !assigned.contains_key(&next) {
                    stack.push(next);
                }
            }
            members.push(cur);
        }
        sort_by_impact(&mut members, &scores);
        components.push(members);
    }
    components
}

/// Capacity hint for one wave.
///
/// Builds a conflict graph on the wave (scope overlap, no opt-out, not
/// DAG-connected), then takes a greedy maximum independent set in impact
/// order. The result never exceeds `min(|wave|, max_workers)`. Actual
/// admission still happens per round; this is the planning number.
pub fn effective_parallelism(
    wave: &[String],
    registry: &PhaseRegistry,
    dag: &Dag,
    max_workers: usize,
) -> usize {
    let n = wave.len().min(max_workers);
    if n <= 1 {
        return n;
    }

    let scores = impact_scores(dag);
    let mut ordered: Vec<String> = wave.to_vec();
    sort_by_impact(&mut ordered, &scores);

    let mut admitted: Vec<&str> = Vec::new();
    for id in &ordered {
        let Some(spec) = registry.get(id) else {
            continue;
        };
        let conflicts = admitted.iter().any(|other| {
            let other_spec = registry.get(other).expect("admitted ids come from registry");
            scope::specs_conflict(spec, other_spec) && !dag.connected(id, other)
        });
        if !conflicts {
            admitted.push(id);
        }
    }

    n.min(admitted.len())
}

/// Read-only derived plan for a whole nebula.
#[derive(Debug, Clone, Serialize)]
pub struct ExecutionPlan {
    /// Dependency layers; phases within a wave are impact-ordered.
    pub waves: Vec<Vec<String>>,
    /// Weakly-connected partitions.
    pub tracks: Vec<Vec<String>>,
    pub impact: BTreeMap<String, ImpactScore>,
    /// Effective parallelism per wave.
    pub parallelism: Vec<usize>,
    /// Human-readable structural risks.
    pub risks: Vec<String>,
}

impl ExecutionPlan {
    pub fn build(registry: &PhaseRegistry, dag: &Dag, max_workers: usize) -> Self {
        let impact = impact_scores(dag);
        let mut waves = dag.compute_waves();
        for wave in &mut waves {
            sort_by_impact(wave, &impact);
        }
        let tracks = tracks(dag);
        let parallelism: Vec<usize> = waves
            .iter()
            .map(|w| effective_parallelism(w, registry, dag, max_workers))
            .collect();

        let mut risks = Vec::new();
        let total = dag.len();
        for (id, score) in &impact {
            if total > 2 && score.dependents * 2 >= total {
                risks.push(format!(
                    "phase '{id}' gates {} of {} phases; a failure there stops most of the nebula",
                    score.dependents, total
                ));
            }
        }
        for (i, wave) in waves.iter().enumerate() {
            if wave.len() > 1 && parallelism[i] < wave.len().min(max_workers) {
                risks.push(format!(
                    "wave {i} is serialized by scope conflicts ({} of {} phases can run together)",
                    parallelism[i],
                    wave.len()
                ));
            }
        }
        if tracks.len() == 1 && total > 3 {
            risks.push("all phases share one dependency track; no track-level isolation".into());
        }

        Self {
            waves,
            tracks,
            impact,
            parallelism,
            risks,
        }
    }
}
