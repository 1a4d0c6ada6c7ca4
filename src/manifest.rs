//! Nebula manifest and aggregate root.
//!
//! `nebula.toml` declares the nebula's identity, per-phase defaults, global
//! execution configuration, prompt context, and external dependencies. The
//! `Nebula` aggregate bundles the manifest with the parsed phase specs and
//! the directory they came from.

use crate::errors::EngineError;
use crate::phase::{PhaseRegistry, PhaseSpec};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Default per-prompt gate timeout in seconds.
pub const DEFAULT_GATE_TIMEOUT_SECS: u64 = 300;
/// Default worker cap when the manifest does not set one.
pub const DEFAULT_MAX_WORKERS: usize = 4;

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Manifest {
    #[serde(default)]
    pub nebula: NebulaSection,
    #[serde(default)]
    pub defaults: Defaults,
    #[serde(default)]
    pub execution: ExecutionConfig,
    #[serde(default)]
    pub context: ContextSection,
    #[serde(default)]
    pub dependencies: DependenciesSection,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct NebulaSection {
    #[serde(default)]
    pub name: String,
    #[serde(default)]
    pub description: String,
}

/// Metadata defaults applied to phases that omit the field.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Defaults {
    #[serde(default, rename = "type")]
    pub phase_type: Option<String>,
    #[serde(default)]
    pub priority: Option<i64>,
    #[serde(default)]
    pub labels: Vec<String>,
    #[serde(default)]
    pub assignee: Option<String>,
}

/// Global execution configuration; every field can be overridden per phase
/// (except `max_workers` and the gate timeout, which are engine-wide).
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ExecutionConfig {
    #[serde(default)]
    pub max_workers: Option<usize>,
    #[serde(default)]
    pub max_review_cycles: Option<i64>,
    #[serde(default)]
    pub max_budget_usd: Option<f64>,
    #[serde(default)]
    pub model: Option<String>,
    /// Manifest-wide gate mode; raw string, validated separately.
    #[serde(default)]
    pub gate: Option<String>,
    #[serde(default)]
    pub gate_timeout_secs: Option<u64>,
}

impl ExecutionConfig {
    pub fn max_workers_or_default(&self) -> usize {
        self.max_workers.unwrap_or(DEFAULT_MAX_WORKERS)
    }

    pub fn gate_timeout(&self) -> std::time::Duration {
        std::time::Duration::from_secs(self.gate_timeout_secs.unwrap_or(DEFAULT_GATE_TIMEOUT_SECS))
    }
}

/// Prompt context shared with the phase runner.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    #[serde(default)]
    pub goals: Vec<String>,
    #[serde(default)]
    pub constraints: Vec<String>,
}

/// External requirements that must hold before any dispatch.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct DependenciesSection {
    /// Requires an attached issue-tracker client.
    #[serde(default)]
    pub requires_beads: bool,
    /// Names of sibling nebulae whose phases must all be done.
    #[serde(default)]
    pub requires_nebulae: Vec<String>,
}

/// The aggregate root: a directory, its manifest, and its phases.
#[derive(Debug, Clone)]
pub struct Nebula {
    pub dir: PathBuf,
    pub manifest: Manifest,
    pub phases: Vec<PhaseSpec>,
}

impl Nebula {
    pub fn name(&self) -> &str {
        &self.manifest.nebula.name
    }

    pub fn registry(&self) -> PhaseRegistry {
        PhaseRegistry::new(self.phases.clone())
    }

    /// Verify `[dependencies]` before any dispatch.
    ///
    /// `requires_beads` needs an attached client; each entry of
    /// `requires_nebulae` needs a sibling directory whose state file reports
    /// every phase done. Both failures are fatal (`unmet-external-dependency`).
    pub fn check_external_deps(&self, beads_attached: bool) -> Result<(), EngineError> {
        if self.manifest.dependencies.requires_beads && !beads_attached {
            return Err(EngineError::UnmetDependency(
                "manifest requires a beads client but none is attached".to_string(),
            ));
        }

        for name in &self.manifest.dependencies.requires_nebulae {
            let sibling = self
                .dir
                .parent()
                .unwrap_or(Path::new("."))
                .join(name)
                .join(crate::state::STATE_FILE_NAME);
            let done = crate::state::StateStore::at(&sibling)
                .load()
                .ok()
                .map(|s| {
                    !s.phases.is_empty()
                        && s.phases.values().all(|p| p.status == crate::state::PhaseStatus::Done)
                })
                .unwrap_or(false);
            if !done {
                return Err(EngineError::UnmetDependency(format!(
                    "required nebula '{}' is not complete",
                    name
                )));
            }
        }

        Ok(())
    }
}

/// Fill phase metadata omitted by the frontmatter from `[defaults]`.
pub fn apply_defaults(spec: &mut PhaseSpec, defaults: &Defaults) {
    if spec.phase_type.is_none() {
        spec.phase_type = defaults.phase_type.clone();
    }
    if spec.priority.is_none() {
        spec.priority = defaults.priority;
    }
    if spec.labels.is_empty() {
        spec.labels = defaults.labels.clone();
    }
    if spec.assignee.is_none() {
        spec.assignee = defaults.assignee.clone();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn manifest_parses_minimal() {
        let m: Manifest = toml::from_str(
            r#"
            [nebula]
            name = "auth-service"
            "#,
        )
        .unwrap();

        assert_eq!(m.nebula.name, "auth-service");
        assert_eq!(m.execution.max_workers_or_default(), DEFAULT_MAX_WORKERS);
        assert!(!m.dependencies.requires_beads);
    }

    #[test]
    fn manifest_parses_full() {
        let m: Manifest = toml::from_str(
            r#"
            [nebula]
            name = "auth-service"
            description = "Authentication stack"

            [defaults]
            type = "feature"
            priority = 2
            labels = ["backend"]

            [execution]
            max_workers = 8
            max_review_cycles = 3
            max_budget_usd = 25.0
            model = "sonnet"
            gate = "review"
            gate_timeout_secs = 60

            [context]
            goals = ["ship auth"]
            constraints = ["no breaking API changes"]

            [dependencies]
            requires_beads = true
            requires_nebulae = ["platform-core"]
            "#,
        )
        .unwrap();

        assert_eq!(m.execution.max_workers, Some(8));
        assert_eq!(m.execution.gate.as_deref(), Some("review"));
        assert_eq!(m.execution.gate_timeout().as_secs(), 60);
        assert_eq!(m.defaults.phase_type.as_deref(), Some("feature"));
        assert_eq!(m.dependencies.requires_nebulae, vec!["platform-core"]);
    }

    #[test]
    fn defaults_fill_only_missing_fields() {
        let defaults = Defaults {
            phase_type: Some("feature".into()),
            priority: Some(5),
            labels: vec!["infra".into()],
            assignee: Some("core-team".into()),
        };

        let mut spec = crate::phase::PhaseSpec::new("x", "X");
        spec.priority = Some(9);
        apply_defaults(&mut spec, &defaults);

        assert_eq!(spec.phase_type.as_deref(), Some("feature"));
        assert_eq!(spec.priority, Some(9));
        assert_eq!(spec.labels, vec!["infra"]);
    }

    #[test]
    fn requires_beads_without_client_is_unmet() {
        let nebula = Nebula {
            dir: PathBuf::from("/tmp/n"),
            manifest: Manifest {
                dependencies: DependenciesSection {
                    requires_beads: true,
                    requires_nebulae: Vec::new(),
                },
                ..Default::default()
            },
            phases: Vec::new(),
        };

        let err = nebula.check_external_deps(false).unwrap_err();
        assert!(matches!(err, EngineError::UnmetDependency(_)));
        assert!(nebula.check_external_deps(true).is_ok());
    }
}
