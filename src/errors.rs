//! Typed error hierarchy for the nebula engine.
//!
//! Three enums cover the three failure domains:
//! - `DagError` — graph mutations and ordering queries
//! - `StateError` — the on-disk state store
//! - `EngineError` — top-level engine outcomes surfaced to callers
//!
//! Recoverable conditions (runner failures, hot-add rejections, state-save
//! hiccups, gate prompt failures) never appear here: the dispatcher converts
//! them into phase-level status changes and keeps running.

use std::path::PathBuf;
use thiserror::Error;

/// Errors from DAG construction and mutation.
#[derive(Debug, Error)]
pub enum DagError {
    #[error("edge {from} -> {to} would create a cycle")]
    Cycle { from: String, to: String },

    #[error("unknown node '{0}' in graph")]
    MissingNode(String),

    #[error("graph contains a cycle involving: {nodes:?}")]
    CyclicGraph { nodes: Vec<String> },
}

/// Errors from the state store.
#[derive(Debug, Error)]
pub enum StateError {
    #[error("failed to read state file {path}: {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse state file {path}: {source}")]
    Parse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("failed to write state file {path}: {source}")]
    Write {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to serialize state: {0}")]
    Serialize(#[from] toml::ser::Error),
}

/// Top-level engine errors. Only unrecoverable conditions live here.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("no nebula.toml found in {}", .0.display())]
    NoManifest(PathBuf),

    #[error("nebula failed validation with {0} error(s)")]
    Validation(usize),

    #[error("unmet external dependency: {0}")]
    UnmetDependency(String),

    #[error("plan rejected at the approve gate")]
    PlanRejected,

    #[error("execution cancelled with incomplete phases")]
    Cancelled,

    #[error(transparent)]
    Dag(#[from] DagError),

    #[error(transparent)]
    State(#[from] StateError),

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}
