//! Static validation of a loaded nebula and of hot-added phases.
//!
//! Errors are collected, not short-circuited, so a broken nebula reports
//! everything at once. The cycle and scope-overlap checks need a coherent
//! id graph, so they only run when the earlier checks pass.

use crate::dag::Dag;
use crate::errors::DagError;
use crate::gate::GateMode;
use crate::manifest::Nebula;
use crate::phase::PhaseSpec;
use crate::scope;
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::str::FromStr;

/// Machine-readable error categories.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    MissingField,
    DuplicateId,
    UnknownDep,
    Cycle,
    InvalidGate,
    ScopeOverlap,
    BoundsViolation,
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::MissingField => "missing_field",
            Self::DuplicateId => "duplicate_id",
            Self::UnknownDep => "unknown_dep",
            Self::Cycle => "cycle",
            Self::InvalidGate => "invalid_gate",
            Self::ScopeOverlap => "scope_overlap",
            Self::BoundsViolation => "bounds_violation",
        };
        write!(f, "{s}")
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct ValidationError {
    pub category: Category,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub phase_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub source_file: Option<PathBuf>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub field: Option<String>,
    pub message: String,
}

impl ValidationError {
    fn manifest(category: Category, field: &str, message: String) -> Self {
        Self {
            category,
            phase_id: None,
            source_file: None,
            field: Some(field.to_string()),
            message,
        }
    }

    fn phase(category: Category, spec: &PhaseSpec, field: Option<&str>, message: String) -> Self {
        Self {
            category,
            phase_id: if spec.id.is_empty() {
                None
            } else {
                Some(spec.id.clone())
            },
            source_file: spec.source_file.clone(),
            field: field.map(|f| f.to_string()),
            message,
        }
    }
}

impl std::fmt::Display for ValidationError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "[{}]", self.category)?;
        if let Some(ref id) = self.phase_id {
            write!(f, " phase '{}':", id)?;
        }
        write!(f, " {}", self.message)
    }
}

/// Validate a loaded nebula. An empty result means the nebula is runnable.
pub fn validate(nebula: &Nebula) -> Vec<ValidationError> {
    let mut errors = Vec::new();

    // Manifest-wide checks.
    if nebula.manifest.nebula.name.trim().is_empty() {
        errors.push(ValidationError::manifest(
            Category::MissingField,
            "nebula.name",
            "manifest must set a nebula name".to_string(),
        ));
    }
    if let Some(cycles) = nebula.manifest.execution.max_review_cycles
        && cycles < 0
    {
        errors.push(ValidationError::manifest(
            Category::BoundsViolation,
            "execution.max_review_cycles",
            format!("max_review_cycles must be >= 0, got {cycles}"),
        ));
    }
    if let Some(budget) = nebula.manifest.execution.max_budget_usd
        && budget < 0.0
    {
        errors.push(ValidationError::manifest(
            Category::BoundsViolation,
            "execution.max_budget_usd",
            format!("max_budget_usd must be >= 0, got {budget}"),
        ));
    }
    if let Some(ref gate) = nebula.manifest.execution.gate
        && GateMode::from_str(gate).is_err()
    {
        errors.push(ValidationError::manifest(
            Category::InvalidGate,
            "execution.gate",
            format!("unknown gate mode '{gate}' (expected trust, watch, review, or approve)"),
        ));
    }

    // Per-phase checks.
    let mut first_seen: HashMap<&str, &PhaseSpec> = HashMap::new();
    for spec in &nebula.phases {
        if spec.id.trim().is_empty() {
            errors.push(ValidationError::phase(
                Category::MissingField,
                spec,
                Some("id"),
                "phase is missing an id".to_string(),
            ));
        }
        if spec.title.trim().is_empty() {
            errors.push(ValidationError::phase(
                Category::MissingField,
                spec,
                Some("title"),
                "phase is missing a title".to_string(),
            ));
        }

        if !spec.id.is_empty() {
            if let Some(original) = first_seen.get(spec.id.as_str()) {
                errors.push(ValidationError::phase(
                    Category::DuplicateId,
                    spec,
                    Some("id"),
                    format!(
                        "duplicate phase id '{}' (first declared in {})",
                        spec.id,
                        original
                            .source_file
                            .as_ref()
                            .map(|p| p.display().to_string())
                            .unwrap_or_else(|| "an earlier phase".to_string())
                    ),
                ));
            } else {
                first_seen.insert(spec.id.as_str(), spec);
            }
        }

        if let Some(ref gate) = spec.gate
            && GateMode::from_str(gate).is_err()
        {
            errors.push(ValidationError::phase(
                Category::InvalidGate,
                spec,
                Some("gate"),
                format!("unknown gate mode '{gate}'"),
            ));
        }
        if let Some(cycles) = spec.max_review_cycles
            && cycles < 0
        {
            errors.push(ValidationError::phase(
                Category::BoundsViolation,
                spec,
                Some("max_review_cycles"),
                format!("max_review_cycles must be >= 0, got {cycles}"),
            ));
        }
        if let Some(budget) = spec.max_budget_usd
            && budget < 0.0
        {
            errors.push(ValidationError::phase(
                Category::BoundsViolation,
                spec,
                Some("max_budget_usd"),
                format!("max_budget_usd must be >= 0, got {budget}"),
            ));
        }
    }

    let known: HashSet<&str> = first_seen.keys().copied().collect();
    for spec in &nebula.phases {
        for dep in &spec.depends_on {
            if !known.contains(dep.as_str()) {
                errors.push(ValidationError::phase(
                    Category::UnknownDep,
                    spec,
                    Some("depends_on"),
                    format!("depends on unknown phase '{dep}'"),
                ));
            }
        }
    }

    // A broken id graph has no meaningful cycles or orderings.
    if !errors.is_empty() {
        return errors;
    }

    let dag = match build_dag(nebula) {
        Ok(dag) => dag,
        Err(DagError::Cycle { from, to }) => {
            errors.push(ValidationError {
                category: Category::Cycle,
                phase_id: Some(from.clone()),
                source_file: nebula
                    .phases
                    .iter()
                    .find(|p| p.id == from)
                    .and_then(|p| p.source_file.clone()),
                field: Some("depends_on".to_string()),
                message: format!("dependency '{from}' -> '{to}' closes a cycle"),
            });
            return errors;
        }
        Err(e) => {
            errors.push(ValidationError {
                category: Category::Cycle,
                phase_id: None,
                source_file: None,
                field: None,
                message: e.to_string(),
            });
            return errors;
        }
    };

    // Scope overlap between unordered, non-opted-out phase pairs.
    for (i, a) in nebula.phases.iter().enumerate() {
        for b in nebula.phases.iter().skip(i + 1) {
            if a.allow_scope_overlap || b.allow_scope_overlap {
                continue;
            }
            if a.scope.is_empty() || b.scope.is_empty() {
                continue;
            }
            if dag.connected(&a.id, &b.id) {
                continue;
            }
            if let Some((pa, pb)) = scope::scopes_overlap(&a.scope, &b.scope) {
                errors.push(ValidationError::phase(
                    Category::ScopeOverlap,
                    a,
                    Some("scope"),
                    format!(
                        "scope '{pa}' overlaps '{pb}' of unordered phase '{}'",
                        b.id
                    ),
                ));
            }
        }
    }

    errors
}

/// Build the dependency DAG of a nebula whose ids and deps are known-good.
pub fn build_dag(nebula: &Nebula) -> Result<Dag, DagError> {
    let mut dag = Dag::new();
    for spec in &nebula.phases {
        dag.add_node(&spec.id, spec.priority_or_default());
    }
    for spec in &nebula.phases {
        for dep in &spec.depends_on {
            dag.add_edge(&spec.id, dep)?;
        }
    }
    Ok(dag)
}

/// Validate one hot-added phase against the live graph.
///
/// On success the node, its `depends_on` edges, and the `blocks`-derived
/// reverse edges are all left installed. On any failure every change made
/// here is rolled back and the graph is exactly as before.
pub fn validate_hot_add(
    spec: &PhaseSpec,
    existing_ids: &HashSet<String>,
    dag: &mut Dag,
) -> Result<(), Vec<ValidationError>> {
    let mut errors = Vec::new();

    if spec.id.trim().is_empty() {
        errors.push(ValidationError::phase(
            Category::MissingField,
            spec,
            Some("id"),
            "hot-added phase is missing an id".to_string(),
        ));
    }
    if spec.title.trim().is_empty() {
        errors.push(ValidationError::phase(
            Category::MissingField,
            spec,
            Some("title"),
            "hot-added phase is missing a title".to_string(),
        ));
    }
    if existing_ids.contains(&spec.id) {
        errors.push(ValidationError::phase(
            Category::DuplicateId,
            spec,
            Some("id"),
            format!("phase id '{}' already exists", spec.id),
        ));
    }
    if !errors.is_empty() {
        return Err(errors);
    }

    let added_node = !dag.contains(&spec.id);
    dag.add_node(&spec.id, spec.priority_or_default());

    let mut installed: Vec<(String, String)> = Vec::new();
    let mut rollback = |dag: &mut Dag, installed: &[(String, String)]| {
        for (from, to) in installed {
            dag.remove_edge(from, to);
        }
        if added_node {
            dag.remove(&spec.id);
        }
    };

    for dep in &spec.depends_on {
        match dag.add_edge(&spec.id, dep) {
            Ok(()) => installed.push((spec.id.clone(), dep.clone())),
            Err(e) => {
                rollback(dag, &installed);
                let category = match e {
                    DagError::Cycle { .. } => Category::Cycle,
                    _ => Category::UnknownDep,
                };
                return Err(vec![ValidationError::phase(
                    category,
                    spec,
                    Some("depends_on"),
                    e.to_string(),
                )]);
            }
        }
    }

    for target in &spec.blocks {
        match dag.add_edge(target, &spec.id) {
            Ok(()) => installed.push((target.clone(), spec.id.clone())),
            Err(e) => {
                rollback(dag, &installed);
                let category = match e {
                    DagError::Cycle { .. } => Category::Cycle,
                    _ => Category::UnknownDep,
                };
                return Err(vec![ValidationError::phase(
                    category,
                    spec,
                    Some("blocks"),
                    e.to_string(),
                )]);
            }
        }
    }

    Ok(())
}
