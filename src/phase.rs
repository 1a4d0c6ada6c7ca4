//! Phase model for the nebula orchestrator.
//!
//! A `PhaseSpec` is the immutable description of one unit of coding work:
//! its identity, dependency edges, file-ownership scope, gate override, and
//! execution overrides. Specs are parsed once from disk and mutated only
//! through the hot-reload path (body swap on refactor, `depends_on` append
//! when a hot-added phase blocks an existing one).

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::PathBuf;

/// A single phase of a nebula.
///
/// `id` and `title` are required but deserialized with defaults so the
/// validator can report `missing_field` instead of a parse failure.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseSpec {
    /// Unique kebab-case identifier; primary key within the nebula.
    #[serde(default)]
    pub id: String,
    /// Human-readable title.
    #[serde(default)]
    pub title: String,
    /// Markdown body following the frontmatter. Swapped on refactor.
    #[serde(skip)]
    pub body: String,
    /// Work type label (e.g. "feature", "chore"); defaulted from the manifest.
    #[serde(default, rename = "type")]
    pub phase_type: Option<String>,
    /// Scheduling priority; higher runs earlier among ties.
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
    /// Phase ids that must reach a terminal status before this phase starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// Inverse dependency: the listed phases must depend on this one.
    /// Edges are installed by the hot-add path.
    #[serde(default)]
    pub blocks: Vec<String>,
    /// Glob patterns claiming file ownership.
    #[serde(default)]
    pub scope: Vec<String>,
    /// Opts this phase out of overlap-derived exclusion.
    #[serde(default)]
    pub allow_scope_overlap: bool,
    /// Per-phase gate mode override; raw string so the validator can flag
    /// unknown values instead of failing the parse.
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub max_review_cycles: Option<i64>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    /// File this spec was parsed from, for diagnostics.
    #[serde(skip)]
    pub source_file: Option<PathBuf>,
}

impl PhaseSpec {
    /// Minimal constructor used by tests and the architect fallback.
    pub fn new(id: &str, title: &str) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            body: String::new(),
            phase_type: None,
            priority: None,
            labels: Vec::new(),
            assignee: None,
            depends_on: Vec::new(),
            blocks: Vec::new(),
            scope: Vec::new(),
            allow_scope_overlap: false,
            gate: None,
            max_review_cycles: None,
            max_budget_usd: None,
            model: None,
            source_file: None,
        }
    }

    /// Builder-style dependency list.
    pub fn with_deps(mut self, deps: &[&str]) -> Self {
        self.depends_on = deps.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Builder-style scope list.
    pub fn with_scope(mut self, scope: &[&str]) -> Self {
        self.scope = scope.iter().map(|s| s.to_string()).collect();
        self
    }

    /// Effective priority with the engine default of 0.
    pub fn priority_or_default(&self) -> i64 {
        self.priority.unwrap_or(0)
    }
}

/// Indexed collection of phase specs.
///
/// The vector preserves load order (and hot-add append order); the index maps
/// ids to positions. Both are mutated only under the orchestrator mutex.
#[derive(Debug, Default, Clone)]
pub struct PhaseRegistry {
    phases: Vec<PhaseSpec>,
    index: HashMap<String, usize>,
}

impl PhaseRegistry {
    pub fn new(phases: Vec<PhaseSpec>) -> Self {
        let index = phases
            .iter()
            .enumerate()
            .map(|(i, p)| (p.id.clone(), i))
            .collect();
        Self { phases, index }
    }

    pub fn len(&self) -> usize {
        self.phases.len()
    }

    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    pub fn get(&self, id: &str) -> Option<&PhaseSpec> {
        self.index.get(id).and_then(|&i| self.phases.get(i))
    }

    pub fn get_mut(&mut self, id: &str) -> Option<&mut PhaseSpec> {
        let i = *self.index.get(id)?;
        self.phases.get_mut(i)
    }

    pub fn contains(&self, id: &str) -> bool {
        self.index.contains_key(id)
    }

    pub fn iter(&self) -> impl Iterator<Item = &PhaseSpec> {
        self.phases.iter()
    }

    pub fn ids(&self) -> impl Iterator<Item = &str> {
        self.phases.iter().map(|p| p.id.as_str())
    }

    /// Append a spec and index it. Later inserts win the index slot, which
    /// cannot happen for validated input (duplicate ids are rejected first).
    pub fn push(&mut self, spec: PhaseSpec) {
        self.index.insert(spec.id.clone(), self.phases.len());
        self.phases.push(spec);
    }
}
