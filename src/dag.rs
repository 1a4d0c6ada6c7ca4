//! Directed acyclic graph over phase ids.
//!
//! Edge direction follows dependency: `A -> B` means A depends on B. Forward
//! and reverse adjacency are kept symmetric inside an arena of node records
//! keyed by id — no pointers back into the graph, so hot mutation under the
//! orchestrator mutex stays simple.
//!
//! Mutations that can fail (`add_edge`) never leave partial state behind:
//! the cycle check runs against the existing edges before anything is
//! inserted.

use crate::errors::DagError;
use std::collections::{BTreeMap, BTreeSet, HashSet};

#[derive(Debug, Clone, Default, PartialEq)]
struct Node {
    priority: i64,
    /// Ids this node depends on (forward edges).
    deps: BTreeSet<String>,
    /// Ids depending on this node (reverse edges).
    rdeps: BTreeSet<String>,
}

/// The dependency graph. `BTreeMap` keeps iteration deterministic, which in
/// turn keeps wave and topological output stable across runs.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Dag {
    nodes: BTreeMap<String, Node>,
}

impl Dag {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.nodes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.nodes.is_empty()
    }

    pub fn contains(&self, id: &str) -> bool {
        self.nodes.contains_key(id)
    }

    pub fn node_ids(&self) -> impl Iterator<Item = &str> {
        self.nodes.keys().map(|k| k.as_str())
    }

    pub fn priority(&self, id: &str) -> Option<i64> {
        self.nodes.get(id).map(|n| n.priority)
    }

    /// Idempotent node insertion; the priority sticks on first insert.
    pub fn add_node(&mut self, id: &str, priority: i64) {
        self.nodes.entry(id.to_string()).or_insert(Node {
            priority,
            deps: BTreeSet::new(),
            rdeps: BTreeSet::new(),
        });
    }

    /// Install `from -> to` (from depends on to).
    ///
    /// Fails with `MissingNode` if either endpoint is absent, and with
    /// `Cycle` if the edge would close a loop (including self-loops). On
    /// failure the graph is unchanged.
    pub fn add_edge(&mut self, from: &str, to: &str) -> Result<(), DagError> {
        if !self.nodes.contains_key(from) {
            return Err(DagError::MissingNode(from.to_string()));
        }
        if !self.nodes.contains_key(to) {
            return Err(DagError::MissingNode(to.to_string()));
        }
        if from == to || self.has_path(to, from) {
            return Err(DagError::Cycle {
                from: from.to_string(),
                to: to.to_string(),
            });
        }

        self.nodes
            .get_mut(from)
            .expect("endpoint checked above")
            .deps
            .insert(to.to_string());
        self.nodes
            .get_mut(to)
            .expect("endpoint checked above")
            .rdeps
            .insert(from.to_string());
        Ok(())
    }

    /// Best-effort edge removal; absent edges and nodes are a no-op.
    pub fn remove_edge(&mut self, from: &str, to: &str) {
        if let Some(node) = self.nodes.get_mut(from) {
            node.deps.remove(to);
        }
        if let Some(node) = self.nodes.get_mut(to) {
            node.rdeps.remove(from);
        }
    }

    /// Best-effort node removal, detaching all incident edges.
    pub fn remove(&mut self, id: &str) {
        let Some(node) = self.nodes.remove(id) else {
            return;
        };
        for dep in node.deps {
            if let Some(n) = self.nodes.get_mut(&dep) {
                n.rdeps.remove(id);
            }
        }
        for rdep in node.rdeps {
            if let Some(n) = self.nodes.get_mut(&rdep) {
                n.deps.remove(id);
            }
        }
    }

    /// Direct dependencies of `id`.
    pub fn deps_for(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.deps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Direct dependents of `id`.
    pub fn dependents_of(&self, id: &str) -> Vec<String> {
        self.nodes
            .get(id)
            .map(|n| n.rdeps.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Directed reachability along dependency edges. `has_path(n, n)` is
    /// false for every node of an acyclic graph.
    pub fn has_path(&self, from: &str, to: &str) -> bool {
        if !self.nodes.contains_key(from) || !self.nodes.contains_key(to) {
            return false;
        }
        let mut seen: HashSet<&str> = HashSet::new();
        let mut stack: Vec<&str> = vec![from];
        while let Some(cur) = stack.pop() {
            let Some(node) = self.nodes.get(cur) else {
                continue;
            };
            for dep in &node.deps {
                if dep == to {
                    return true;
                }
                if seen.insert(dep.as_str()) {
                    stack.push(dep.as_str());
                }
            }
        }
        false
    }

    /// Reachability in either direction.
    pub fn connected(&self, a: &str, b: &str) -> bool {
        self.has_path(a, b) || self.has_path(b, a)
    }

    /// All transitive dependents of `id` (excluding `id` itself).
    pub fn transitive_dependents(&self, id: &str) -> BTreeSet<String> {
        let mut out = BTreeSet::new();
        let mut stack = vec![id.to_string()];
        while let Some(cur) = stack.pop() {
            if let Some(node) = self.nodes.get(&cur) {
                for rdep in &node.rdeps {
                    if out.insert(rdep.clone()) {
                        stack.push(rdep.clone());
                    }
                }
            }
        }
        out
    }

    /// Kahn's algorithm. Dependencies come before dependents; among nodes
    /// that become ready together, higher priority first, then id order.
    pub fn topological_sort(&self) -> Result<Vec<String>, DagError> {
        let mut in_degree: BTreeMap<&str, usize> = self
            .nodes
            .iter()
            .map(|(id, n)| (id.as_str(), n.deps.len()))
            .collect();

        let mut queue: Vec<&str> = in_degree
            .iter()
            .filter(|&(_, &deg)| deg == 0)
            .map(|(&id, _)| id)
            .collect();

        let mut order = Vec::with_capacity(self.nodes.len());
        while !queue.is_empty() {
            queue.sort_by(|a, b| {
                let pa = self.priority(a).unwrap_or(0);
                let pb = self.priority(b).unwrap_or(0);
                pb.cmp(&pa).then_with(|| a.cmp(b))
            });
            let next = queue.remove(0);
            order.push(next.to_string());

            for rdep in &self.nodes[next].rdeps {
                let deg = in_degree.get_mut(rdep.as_str()).expect("known node");
                *deg -= 1;
                if *deg == 0 {
                    queue.push(rdep.as_str());
                }
            }
        }

        if order.len() != self.nodes.len() {
            let stuck: Vec<String> = in_degree
                .iter()
                .filter(|&(_, &deg)| deg > 0)
                .map(|(&id, _)| id.to_string())
                .collect();
            return Err(DagError::CyclicGraph { nodes: stuck });
        }
        Ok(order)
    }

    /// Successive layers of zero-in-degree nodes, each layer virtually
    /// retired before computing the next. Order within a wave is whatever
    /// the map yields; callers re-sort by impact.
    pub fn compute_waves(&self) -> Vec<Vec<String>> {
        let mut waves = Vec::new();
        let mut retired: HashSet<String> = HashSet::new();

        loop {
            let wave: Vec<String> = self
                .nodes
                .iter()
                .filter(|(id, node)| {
                    !retired.contains(id.as_str()) && node.deps.iter().all(|d| retired.contains(d))
                })
                .map(|(id, _)| id.clone())
                .collect();

            if wave.is_empty() {
                break;
            }
            retired.extend(wave.iter().cloned());
            waves.push(wave);
        }
        waves
    }

    /// Ids whose every direct dependency is in `done` and which are not
    /// themselves in `done`.
    pub fn ready(&self, done: &HashSet<String>) -> Vec<String> {
        self.nodes
            .iter()
            .filter(|(id, node)| {
                !done.contains(id.as_str()) && node.deps.iter().all(|d| done.contains(d))
            })
            .map(|(id, _)| id.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn diamond() -> Dag {
        // setup <- core-a, core-b <- integrate
        let mut dag = Dag::new();
        for id in ["setup", "core-a", "core-b", "integrate"] {
            dag.add_node(id, 0);
        }
        dag.add_edge("core-a", "setup").unwrap();
        dag.add_edge("core-b", "setup").unwrap();
        dag.add_edge("integrate", "core-a").unwrap();
        dag.add_edge("integrate", "core-b").unwrap();
        dag
    }

    #[test]
    fn add_node_is_idempotent_and_keeps_first_priority() {
        let mut dag = Dag::new();
        dag.add_node("a", 7);
        dag.add_node("a", 3);
        assert_eq!(dag.len(), 1);
        assert_eq!(dag.priority("a"), Some(7));
    }

    #[test]
    fn add_edge_requires_both_endpoints() {
        let mut dag = Dag::new();
        dag.add_node("a", 0);
        let err = dag.add_edge("a", "missing").unwrap_err();
        assert!(matches!(err, DagError::MissingNode(ref n) if n == "missing"));
        let err = dag.add_edge("missing", "a").unwrap_err();
        assert!(matches!(err, DagError::MissingNode(_)));
    }

    #[test]
    fn add_edge_rejects_self_loop() {
        let mut dag = Dag::new();
        dag.add_node("a", 0);
        assert!(matches!(
            dag.add_edge("a", "a"),
            Err(DagError::Cycle { .. })
        ));
    }

    #[test]
    fn add_edge_establishes_path_and_stays_acyclic() {
        let mut dag = Dag::new();
        dag.add_node("a", 0);
        dag.add_node("b", 0);
        dag.add_node("c", 0);
        dag.add_edge("b", "a").unwrap();
        dag.add_edge("c", "b").unwrap();

        assert!(dag.has_path("c", "a"));
        assert!(!dag.has_path("a", "c"));
        // Closing the loop must fail and leave the graph untouched.
        let before = dag.clone();
        let err = dag.add_edge("a", "c").unwrap_err();
        assert!(matches!(err, DagError::Cycle { .. }));
        assert_eq!(dag, before);
        assert!(dag.topological_sort().is_ok());
    }

    #[test]
    fn no_node_reaches_itself() {
        let dag = diamond();
        for id in ["setup", "core-a", "core-b", "integrate"] {
            assert!(!dag.has_path(id, id));
        }
    }

    #[test]
    fn connected_is_direction_agnostic() {
        let dag = diamond();
        assert!(dag.connected("integrate", "setup"));
        assert!(dag.connected("setup", "integrate"));
        assert!(!dag.connected("core-a", "core-b"));
    }

    #[test]
    fn topological_sort_orders_deps_first() {
        let dag = diamond();
        let order = dag.topological_sort().unwrap();
        let pos = |id: &str| order.iter().position(|x| x == id).unwrap();
        assert!(pos("setup") < pos("core-a"));
        assert!(pos("setup") < pos("core-b"));
        assert!(pos("core-a") < pos("integrate"));
        assert_eq!(order.len(), 4);
    }

    #[test]
    fn topological_sort_prefers_priority_then_id() {
        let mut dag = Dag::new();
        dag.add_node("low", 1);
        dag.add_node("high", 9);
        dag.add_node("also-high", 9);
        let order = dag.topological_sort().unwrap();
        assert_eq!(order, vec!["also-high", "high", "low"]);
    }

    #[test]
    fn waves_layer_by_dependency_depth() {
        let dag = diamond();
        let waves = dag.compute_waves();
        assert_eq!(waves.len(), 3);
        assert_eq!(waves[0], vec!["setup"]);
        assert_eq!(waves[1].len(), 2);
        assert_eq!(waves[2], vec!["integrate"]);
    }

    #[test]
    fn ready_respects_done_set() {
        let dag = diamond();
        let mut done = HashSet::new();
        assert_eq!(dag.ready(&done), vec!["setup"]);

        done.insert("setup".to_string());
        let ready = dag.ready(&done);
        assert_eq!(ready.len(), 2);
        assert!(ready.contains(&"core-a".to_string()));

        done.insert("core-a".to_string());
        done.insert("core-b".to_string());
        assert_eq!(dag.ready(&done), vec!["integrate"]);
    }

    #[test]
    fn remove_detaches_edges() {
        let mut dag = diamond();
        dag.remove("core-a");
        assert!(!dag.contains("core-a"));
        assert_eq!(dag.deps_for("integrate"), vec!["core-b"]);
        assert_eq!(dag.dependents_of("setup"), vec!["core-b"]);
        // Removing again is a no-op.
        dag.remove("core-a");
    }

    #[test]
    fn remove_edge_is_best_effort() {
        let mut dag = diamond();
        dag.remove_edge("integrate", "core-a");
        assert_eq!(dag.deps_for("integrate"), vec!["core-b"]);
        dag.remove_edge("integrate", "ghost");
        dag.remove_edge("ghost", "setup");
    }

    #[test]
    fn transitive_dependents_walks_reverse_edges() {
        let dag = diamond();
        let deps = dag.transitive_dependents("setup");
        assert_eq!(deps.len(), 3);
        assert!(deps.contains("integrate"));
        assert!(dag.transitive_dependents("integrate").is_empty());
    }
}
