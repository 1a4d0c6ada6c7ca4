//! Loading a nebula from disk.
//!
//! Layout under the nebula directory:
//! - `nebula.toml` — the manifest (required; its absence is fatal)
//! - `*.md` — phase files: TOML frontmatter between `+++` delimiters,
//!   Markdown body after the closing delimiter
//! - `nebula.state.toml` — written by the engine, never read here

use crate::errors::EngineError;
use crate::manifest::{self, Manifest, Nebula};
use crate::phase::PhaseSpec;
use anyhow::{Context, Result, bail};
use std::path::Path;
use walkdir::WalkDir;

const MANIFEST_FILE: &str = "nebula.toml";
const FRONTMATTER_DELIM: &str = "+++";

/// Load the manifest and every phase file in `dir`.
///
/// Phase files are read in lexicographic filename order so load order is
/// stable across platforms. Parse failures in individual phase files are
/// fatal here; semantic problems (missing ids, unknown deps, cycles) are
/// left to the validator.
pub fn load_nebula(dir: &Path) -> Result<Nebula, EngineError> {
    let manifest_path = dir.join(MANIFEST_FILE);
    if !manifest_path.exists() {
        return Err(EngineError::NoManifest(dir.to_path_buf()));
    }

    let manifest = load_manifest(&manifest_path)?;

    let mut files: Vec<_> = WalkDir::new(dir)
        .min_depth(1)
        .max_depth(1)
        .into_iter()
        .filter_map(|e| e.ok())
        .filter(|e| e.file_type().is_file())
        .map(|e| e.into_path())
        .filter(|p| p.extension().is_some_and(|ext| ext == "md"))
        .collect();
    files.sort();

    let mut phases = Vec::with_capacity(files.len());
    for path in files {
        let spec = parse_phase_file(&path, &manifest)
            .with_context(|| format!("failed to load phase file {}", path.display()))?;
        phases.push(spec);
    }

    Ok(Nebula {
        dir: dir.to_path_buf(),
        manifest,
        phases,
    })
}

/// Parse `nebula.toml`.
pub fn load_manifest(path: &Path) -> Result<Manifest, EngineError> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read manifest {}", path.display()))?;
    let manifest: Manifest = toml::from_str(&content)
        .with_context(|| format!("failed to parse manifest {}", path.display()))?;
    Ok(manifest)
}

/// Parse one phase file: frontmatter into a `PhaseSpec`, remainder into its
/// body, manifest defaults filled in.
pub fn parse_phase_file(path: &Path, manifest: &Manifest) -> Result<PhaseSpec> {
    let content = std::fs::read_to_string(path)
        .with_context(|| format!("failed to read {}", path.display()))?;

    let (frontmatter, body) = split_frontmatter(&content)
        .with_context(|| format!("invalid frontmatter in {}", path.display()))?;

    let mut spec: PhaseSpec =
        toml::from_str(frontmatter).context("failed to parse phase frontmatter")?;
    spec.body = body.trim_start_matches('\n').to_string();
    spec.source_file = Some(path.to_path_buf());
    manifest::apply_defaults(&mut spec, &manifest.defaults);

    Ok(spec)
}

/// Split a phase file into its TOML frontmatter and Markdown body.
///
/// The file must begin with a `+++` line; the frontmatter runs until the
/// next `+++` line. Everything after the closing delimiter is the body
/// (possibly empty).
pub fn split_frontmatter(content: &str) -> Result<(&str, &str)> {
    let rest = content
        .strip_prefix(FRONTMATTER_DELIM)
        .and_then(|r| r.strip_prefix('\n').or_else(|| r.strip_prefix("\r\n")))
        .ok_or_else(|| anyhow::anyhow!("phase file must start with a '+++' line"))?;

    let mut offset = 0;
    for line in rest.split_inclusive('\n') {
        if line.trim_end() == FRONTMATTER_DELIM {
            let frontmatter = &rest[..offset];
            let body = &rest[offset + line.len()..];
            return Ok((frontmatter, body));
        }
        offset += line.len();
    }
    bail!("unterminated frontmatter: missing closing '+++'")
}
