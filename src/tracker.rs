//! Shared bookkeeping of phase progress and the admission filter.
//!
//! The tracker owns three sets — `done` (terminal, failure included),
//! `failed` (subset of done), and `in_flight` — all mutated only under the
//! orchestrator mutex. Admission applies, in order: terminal/in-flight
//! rejection, failed-dependency propagation, scope conflict against
//! in-flight phases, scope conflict against earlier admissions in the same
//! round. Candidates arrive impact-sorted, so the greedy batch rule prefers
//! higher-impact phases.

use crate::dag::Dag;
use crate::phase::PhaseRegistry;
use crate::scope;
use std::collections::HashSet;

#[derive(Debug, Default)]
pub struct PhaseTracker {
    done: HashSet<String>,
    failed: HashSet<String>,
    in_flight: HashSet<String>,
}

/// Outcome of one admission round.
#[derive(Debug, Default)]
pub struct Admission {
    /// Phases cleared to dispatch, in candidate order.
    pub admitted: Vec<String>,
    /// Phases rejected because a direct dependency failed; the caller marks
    /// these failed+done so their own dependents cascade next round.
    pub failed_deps: Vec<String>,
}

impl PhaseTracker {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn done(&self) -> &HashSet<String> {
        &self.done
    }

    pub fn is_done(&self, id: &str) -> bool {
        self.done.contains(id)
    }

    pub fn is_failed(&self, id: &str) -> bool {
        self.failed.contains(id)
    }

    pub fn is_in_flight(&self, id: &str) -> bool {
        self.in_flight.contains(id)
    }

    pub fn in_flight_count(&self) -> usize {
        self.in_flight.len()
    }

    pub fn in_flight_ids(&self) -> impl Iterator<Item = &str> {
        self.in_flight.iter().map(|s| s.as_str())
    }

    pub fn done_count(&self) -> usize {
        self.done.len()
    }

    pub fn failed_count(&self) -> usize {
        self.failed.len()
    }

    pub fn mark_in_flight(&mut self, id: &str) {
        self.in_flight.insert(id.to_string());
    }

    /// Record a worker's terminal outcome.
    pub fn finish(&mut self, id: &str, failed: bool) {
        self.in_flight.remove(id);
        self.done.insert(id.to_string());
        if failed {
            self.failed.insert(id.to_string());
        }
    }

    /// Mark a phase failed without it ever having run (failed-dep
    /// propagation, board escalation, gate rejection).
    pub fn mark_failed(&mut self, id: &str) {
        self.in_flight.remove(id);
        self.done.insert(id.to_string());
        self.failed.insert(id.to_string());
    }

    /// Re-open a phase for another attempt (gate `retry`).
    pub fn reopen(&mut self, id: &str) {
        self.done.remove(id);
        self.failed.remove(id);
        self.in_flight.remove(id);
    }

    /// Filter impact-sorted candidates down to the admissible subset.
    pub fn filter_eligible(
        &self,
        candidates: &[String],
        registry: &PhaseRegistry,
        dag: &Dag,
    ) -> Admission {
        let mut admission = Admission::default();

        'next: for id in candidates {
            if self.in_flight.contains(id) || self.failed.contains(id) || self.done.contains(id) {
                continue;
            }

            // Failed-dependency propagation.
            if dag
                .deps_for(id)
                .iter()
                .any(|dep| self.failed.contains(dep))
            {
                admission.failed_deps.push(id.clone());
                continue;
            }

            let Some(spec) = registry.get(id) else {
                continue;
            };

            // Conflicts with currently running phases.
            for running in &self.in_flight {
                if let Some(other) = registry.get(running)
                    && scope::specs_conflict(spec, other)
                    && !dag.connected(id, running)
                {
                    continue 'next;
                }
            }

            // Conflicts with phases already admitted this round.
            for earlier in &admission.admitted {
                if let Some(other) = registry.get(earlier)
                    && scope::specs_conflict(spec, other)
                    && !dag.connected(id, earlier)
                {
                    continue 'next;
                }
            }

            admission.admitted.push(id.clone());
        }

        admission
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::PhaseSpec;

    fn setup(specs: Vec<PhaseSpec>) -> (PhaseRegistry, Dag) {
        let mut dag = Dag::new();
        for s in &specs {
            dag.add_node(&s.id, s.priority_or_default());
        }
        for s in &specs {
            for d in &s.depends_on {
                dag.add_edge(&s.id, d).unwrap();
            }
        }
        (PhaseRegistry::new(specs), dag)
    }

    fn ids(v: &[&str]) -> Vec<String> {
        v.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn sets_stay_consistent_through_lifecycle() {
        let mut tracker = PhaseTracker::new();
        tracker.mark_in_flight("a");
        assert!(tracker.is_in_flight("a"));

        tracker.finish("a", false);
        assert!(tracker.is_done("a"));
        assert!(!tracker.is_failed("a"));
        assert!(!tracker.is_in_flight("a"));

        tracker.mark_in_flight("b");
        tracker.finish("b", true);
        assert!(tracker.is_done("b") && tracker.is_failed("b"));

        tracker.reopen("b");
        assert!(!tracker.is_done("b") && !tracker.is_failed("b"));
    }

    #[test]
    fn admission_skips_in_flight_and_terminal() {
        let (registry, dag) = setup(vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B"),
            PhaseSpec::new("c", "C"),
        ]);
        let mut tracker = PhaseTracker::new();
        tracker.mark_in_flight("a");
        tracker.finish("b", true);

        let admission = tracker.filter_eligible(&ids(&["a", "b", "c"]), &registry, &dag);
        assert_eq!(admission.admitted, vec!["c"]);
        assert!(admission.failed_deps.is_empty());
    }

    #[test]
    fn failed_dependency_propagates() {
        let (registry, dag) = setup(vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
        ]);
        let mut tracker = PhaseTracker::new();
        tracker.finish("a", true);

        let admission = tracker.filter_eligible(&ids(&["b"]), &registry, &dag);
        assert!(admission.admitted.is_empty());
        assert_eq!(admission.failed_deps, vec!["b"]);
    }

    #[test]
    fn scope_conflict_with_in_flight_blocks_admission() {
        let (registry, dag) = setup(vec![
            PhaseSpec::new("a", "A").with_scope(&["internal/**"]),
            PhaseSpec::new("b", "B").with_scope(&["internal/loop/**"]),
        ]);
        let mut tracker = PhaseTracker::new();
        tracker.mark_in_flight("a");

        let admission = tracker.filter_eligible(&ids(&["b"]), &registry, &dag);
        assert!(admission.admitted.is_empty());

        // Once a completes, b is admissible.
        tracker.finish("a", false);
        let admission = tracker.filter_eligible(&ids(&["b"]), &registry, &dag);
        assert_eq!(admission.admitted, vec!["b"]);
    }

    #[test]
    fn batch_conflicts_prefer_earlier_higher_impact_candidates() {
        let (registry, dag) = setup(vec![
            PhaseSpec::new("a", "A").with_scope(&["internal/**"]),
            PhaseSpec::new("b", "B").with_scope(&["internal/loop/**"]),
            PhaseSpec::new("c", "C").with_scope(&["cmd/**"]),
        ]);
        let tracker = PhaseTracker::new();

        // Impact-sorted order a, b, c: a wins the conflict, c is disjoint.
        let admission = tracker.filter_eligible(&ids(&["a", "b", "c"]), &registry, &dag);
        assert_eq!(admission.admitted, vec!["a", "c"]);
    }

    #[test]
    fn dag_connected_phases_may_share_scope() {
        let (registry, dag) = setup(vec![
            PhaseSpec::new("a", "A").with_scope(&["internal/**"]),
            PhaseSpec::new("b", "B")
                .with_deps(&["a"])
                .with_scope(&["internal/loop/**"]),
        ]);
        let mut tracker = PhaseTracker::new();
        tracker.mark_in_flight("a");

        // b is dep-connected to a, so the overlap is not a conflict; it is
        // still unreachable until a completes, but admission itself allows it.
        let admission = tracker.filter_eligible(&ids(&["b"]), &registry, &dag);
        assert_eq!(admission.admitted, vec!["b"]);
    }

    #[test]
    fn every_admitted_pair_is_overlap_safe() {
        // Property-style check across a small fixed universe.
        let specs = vec![
            PhaseSpec::new("a", "A").with_scope(&["x/**"]),
            PhaseSpec::new("b", "B").with_scope(&["x/y/**"]),
            PhaseSpec::new("c", "C").with_scope(&["z/**"]),
            PhaseSpec::new("d", "D"),
        ];
        let (registry, dag) = setup(specs);
        let tracker = PhaseTracker::new();
        let admission =
            tracker.filter_eligible(&ids(&["a", "b", "c", "d"]), &registry, &dag);

        for (i, p) in admission.admitted.iter().enumerate() {
            for q in admission.admitted.iter().skip(i + 1) {
                let sp = registry.get(p).unwrap();
                let sq = registry.get(q).unwrap();
                assert!(
                    !scope::specs_conflict(sp, sq) || dag.connected(p, q),
                    "admitted pair {p}/{q} conflicts"
                );
            }
        }
    }
}
