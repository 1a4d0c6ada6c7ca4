//! Deterministic auto-correction in front of the validator.
//!
//! Each validation category maps to one mechanical fix: derive a missing id
//! from the title, rename a duplicate with a numeric suffix, drop an
//! unknown dependency, clamp negative bounds to zero, reset an invalid gate
//! mode, opt an overlapping pair out of exclusion. Cycles are never
//! auto-corrected. Whatever survives re-validation goes to the architect
//! agent for regeneration, when one is attached.

use crate::manifest::Nebula;
use crate::phase::PhaseSpec;
use crate::validate::{self, Category, ValidationError};
use async_trait::async_trait;

/// One applied correction, for reporting.
#[derive(Debug, Clone)]
pub struct AppliedFix {
    pub category: Category,
    pub phase_id: Option<String>,
    pub description: String,
}

/// External text-generation service that can rewrite a broken phase.
#[async_trait]
pub trait ArchitectAgent: Send + Sync {
    async fn regenerate(
        &self,
        spec: &PhaseSpec,
        errors: &[ValidationError],
    ) -> anyhow::Result<PhaseSpec>;
}

/// Derive a kebab-case id from a phase title.
pub fn kebab_id(title: &str) -> String {
    let mut out = String::with_capacity(title.len());
    let mut last_dash = true;
    for c in title.chars() {
        if c.is_ascii_alphanumeric() {
            out.push(c.to_ascii_lowercase());
            last_dash = false;
        } else if !last_dash {
            out.push('-');
            last_dash = true;
        }
    }
    out.trim_matches('-').to_string()
}

/// Apply every deterministic fix the current error list admits. Returns the
/// fixes applied; callers re-validate afterwards.
pub fn apply_fixes(nebula: &mut Nebula, errors: &[ValidationError]) -> Vec<AppliedFix> {
    let mut applied = Vec::new();

    for err in errors {
        match err.category {
            Category::MissingField => {
                if err.field.as_deref() == Some("id") {
                    // Match by source file first, else by the first id-less phase.
                    let spec = nebula.phases.iter_mut().find(|p| {
                        p.id.is_empty()
                            && (err.source_file.is_none() || p.source_file == err.source_file)
                    });
                    if let Some(spec) = spec
                        && !spec.title.is_empty()
                    {
                        let id = kebab_id(&spec.title);
                        if !id.is_empty() {
                            spec.id = id.clone();
                            applied.push(AppliedFix {
                                category: err.category,
                                phase_id: Some(id.clone()),
                                description: format!("derived id '{id}' from title"),
                            });
                        }
                    }
                }
            }
            Category::DuplicateId => {
                if let Some(ref dup) = err.phase_id {
                    // Rename every later duplicate with a numeric suffix.
                    let mut seen = false;
                    let mut counter = 2usize;
                    let taken: Vec<String> =
                        nebula.phases.iter().map(|p| p.id.clone()).collect();
                    for spec in nebula.phases.iter_mut().filter(|p| p.id == *dup) {
                        if !seen {
                            seen = true;
                            continue;
                        }
                        let mut candidate = format!("{dup}-{counter}");
                        while taken.contains(&candidate) {
                            counter += 1;
                            candidate = format!("{dup}-{counter}");
                        }
                        applied.push(AppliedFix {
                            category: err.category,
                            phase_id: Some(candidate.clone()),
                            description: format!("renamed duplicate '{dup}' to '{candidate}'"),
                        });
                        spec.id = candidate;
                        counter += 1;
                    }
                }
            }
            Category::UnknownDep => {
                if let Some(ref id) = err.phase_id {
                    let known: Vec<String> = nebula.phases.iter().map(|p| p.id.clone()).collect();
                    if let Some(spec) = nebula.phases.iter_mut().find(|p| p.id == *id) {
                        let before = spec.depends_on.len();
                        spec.depends_on.retain(|d| known.contains(d));
                        if spec.depends_on.len() < before {
                            applied.push(AppliedFix {
                                category: err.category,
                                phase_id: Some(id.clone()),
                                description: "dropped unknown dependencies".to_string(),
                            });
                        }
                    }
                }
            }
            Category::BoundsViolation => {
                if let Some(ref id) = err.phase_id {
                    if let Some(spec) = nebula.phases.iter_mut().find(|p| p.id == *id) {
                        if spec.max_review_cycles.is_some_and(|c| c < 0) {
                            spec.max_review_cycles = Some(0);
                        }
                        if spec.max_budget_usd.is_some_and(|b| b < 0.0) {
                            spec.max_budget_usd = Some(0.0);
                        }
                        applied.push(AppliedFix {
                            category: err.category,
                            phase_id: Some(id.clone()),
                            description: "clamped negative bounds to zero".to_string(),
                        });
                    }
                } else {
                    let exec = &mut nebula.manifest.execution;
                    if exec.max_review_cycles.is_some_and(|c| c < 0) {
                        exec.max_review_cycles = Some(0);
                    }
                    if exec.max_budget_usd.is_some_and(|b| b < 0.0) {
                        exec.max_budget_usd = Some(0.0);
                    }
                    applied.push(AppliedFix {
                        category: err.category,
                        phase_id: None,
                        description: "clamped negative manifest bounds to zero".to_string(),
                    });
                }
            }
            Category::InvalidGate => {
                if let Some(ref id) = err.phase_id {
                    if let Some(spec) = nebula.phases.iter_mut().find(|p| p.id == *id) {
                        spec.gate = None;
                        applied.push(AppliedFix {
                            category: err.category,
                            phase_id: Some(id.clone()),
                            description: "cleared invalid gate override".to_string(),
                        });
                    }
                } else {
                    nebula.manifest.execution.gate = None;
                    applied.push(AppliedFix {
                        category: err.category,
                        phase_id: None,
                        description: "cleared invalid manifest gate".to_string(),
                    });
                }
            }
            Category::ScopeOverlap => {
                if let Some(ref id) = err.phase_id {
                    if let Some(spec) = nebula.phases.iter_mut().find(|p| p.id == *id) {
                        spec.allow_scope_overlap = true;
                        applied.push(AppliedFix {
                            category: err.category,
                            phase_id: Some(id.clone()),
                            description: "set allow_scope_overlap".to_string(),
                        });
                    }
                }
            }
            // Never corrected mechanically.
            Category::Cycle => {}
        }
    }

    applied
}

/// Fix-and-revalidate loop: deterministic fixes first, then the architect
/// for whatever remains. Returns the applied fixes, or the errors that
/// survived every correction attempt (cycles always do).
pub async fn fix_or_regenerate(
    nebula: &mut Nebula,
    architect: Option<&dyn ArchitectAgent>,
) -> Result<Vec<AppliedFix>, Vec<ValidationError>> {
    let errors = validate::validate(nebula);
    if errors.is_empty() {
        return Ok(Vec::new());
    }

    let mut applied = apply_fixes(nebula, &errors);
    let mut remaining = validate::validate(nebula);
    if remaining.is_empty() {
        return Ok(applied);
    }

    if remaining.iter().any(|e| e.category == Category::Cycle) {
        return Err(remaining);
    }

    let Some(architect) = architect else {
        return Err(remaining);
    };

    // One regeneration pass per offending phase.
    let offending: Vec<String> = remaining
        .iter()
        .filter_map(|e| e.phase_id.clone())
        .collect();
    for id in offending {
        let Some(pos) = nebula.phases.iter().position(|p| p.id == id) else {
            continue;
        };
        let phase_errors: Vec<ValidationError> = remaining
            .iter()
            .filter(|e| e.phase_id.as_deref() == Some(id.as_str()))
            .cloned()
            .collect();
        match architect.regenerate(&nebula.phases[pos], &phase_errors).await {
            Ok(replacement) => {
                applied.push(AppliedFix {
                    category: phase_errors
                        .first()
                        .map(|e| e.category)
                        .unwrap_or(Category::MissingField),
                    phase_id: Some(replacement.id.clone()),
                    description: format!("regenerated phase '{id}' via architect"),
                });
                nebula.phases[pos] = replacement;
            }
            Err(e) => {
                tracing::warn!(phase = %id, error = %e, "architect regeneration failed");
            }
        }
    }

    remaining = validate::validate(nebula);
    if remaining.is_empty() {
        Ok(applied)
    } else {
        Err(remaining)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::manifest::Manifest;
    use std::path::PathBuf;

    fn nebula_with(phases: Vec<PhaseSpec>) -> Nebula {
        let manifest: Manifest = toml::from_str("[nebula]\nname = \"test\"\n").unwrap();
        Nebula {
            dir: PathBuf::from("/tmp/test"),
            manifest,
            phases,
        }
    }

    #[test]
    fn kebab_id_normalizes_titles() {
        assert_eq!(kebab_id("Core event loop"), "core-event-loop");
        assert_eq!(kebab_id("  DB: schema & migrations!  "), "db-schema-migrations");
        assert_eq!(kebab_id("Already-Kebab"), "already-kebab");
    }

    #[test]
    fn missing_id_is_derived_from_title() {
        let mut nebula = nebula_with(vec![PhaseSpec::new("", "Core Event Loop")]);
        let errors = validate::validate(&nebula);
        let fixes = apply_fixes(&mut nebula, &errors);

        assert_eq!(nebula.phases[0].id, "core-event-loop");
        assert!(fixes.iter().any(|f| f.category == Category::MissingField));
        assert!(validate::validate(&nebula).is_empty());
    }

    #[test]
    fn duplicate_gets_numeric_suffix() {
        let mut nebula = nebula_with(vec![
            PhaseSpec::new("core", "Core"),
            PhaseSpec::new("core", "Core again"),
        ]);
        let errors = validate::validate(&nebula);
        apply_fixes(&mut nebula, &errors);

        assert_eq!(nebula.phases[0].id, "core");
        assert_eq!(nebula.phases[1].id, "core-2");
        assert!(validate::validate(&nebula).is_empty());
    }

    #[test]
    fn unknown_dep_is_dropped() {
        let mut nebula = nebula_with(vec![
            PhaseSpec::new("a", "A"),
            PhaseSpec::new("b", "B").with_deps(&["a", "ghost"]),
        ]);
        let errors = validate::validate(&nebula);
        apply_fixes(&mut nebula, &errors);

        assert_eq!(nebula.phases[1].depends_on, vec!["a"]);
        assert!(validate::validate(&nebula).is_empty());
    }

    #[test]
    fn negative_bounds_are_clamped() {
        let mut spec = PhaseSpec::new("a", "A");
        spec.max_review_cycles = Some(-3);
        spec.max_budget_usd = Some(-1.0);
        let mut nebula = nebula_with(vec![spec]);
        nebula.manifest.execution.max_budget_usd = Some(-5.0);

        let errors = validate::validate(&nebula);
        apply_fixes(&mut nebula, &errors);

        assert_eq!(nebula.phases[0].max_review_cycles, Some(0));
        assert_eq!(nebula.phases[0].max_budget_usd, Some(0.0));
        assert_eq!(nebula.manifest.execution.max_budget_usd, Some(0.0));
        assert!(validate::validate(&nebula).is_empty());
    }

    #[test]
    fn scope_overlap_sets_opt_out() {
        let mut nebula = nebula_with(vec![
            PhaseSpec::new("a", "A").with_scope(&["internal/**"]),
            PhaseSpec::new("b", "B").with_scope(&["internal/loop/**"]),
        ]);
        let errors = validate::validate(&nebula);
        apply_fixes(&mut nebula, &errors);
        assert!(validate::validate(&nebula).is_empty());
    }

    #[tokio::test]
    async fn cycles_are_never_auto_corrected() {
        let mut nebula = nebula_with(vec![
            PhaseSpec::new("a", "A").with_deps(&["b"]),
            PhaseSpec::new("b", "B").with_deps(&["a"]),
        ]);
        let err = fix_or_regenerate(&mut nebula, None).await.unwrap_err();
        assert!(err.iter().any(|e| e.category == Category::Cycle));
    }

    #[tokio::test]
    async fn architect_is_consulted_for_surviving_errors() {
        struct FixingArchitect;

        #[async_trait]
        impl ArchitectAgent for FixingArchitect {
            async fn regenerate(
                &self,
                spec: &PhaseSpec,
                _errors: &[ValidationError],
            ) -> anyhow::Result<PhaseSpec> {
                // Rewrites the phase with a usable title.
                let mut fixed = spec.clone();
                fixed.title = format!("Regenerated {}", spec.id);
                Ok(fixed)
            }
        }

        // Title missing: no deterministic fix applies (id cannot be derived
        // the other way around), so the architect is asked.
        let mut nebula = nebula_with(vec![PhaseSpec::new("a", "")]);
        let fixes = fix_or_regenerate(&mut nebula, Some(&FixingArchitect))
            .await
            .unwrap();
        assert!(fixes.iter().any(|f| f.description.contains("architect")));
        assert_eq!(nebula.phases[0].title, "Regenerated a");
    }
}
