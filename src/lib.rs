//! Nebula: a concurrent orchestrator for multi-phase AI-assisted coding
//! workflows.
//!
//! A *nebula* is a directory of phase files plus a manifest. The engine
//! builds a dependency DAG over the phases, validates it, computes an
//! execution plan (waves, tracks, impact, effective parallelism), and runs
//! phases through an external runner under a bounded worker pool — with
//! human gates interposed on completions, a crash-safe state store, and a
//! hot-reload path that mutates the DAG while it runs.
//!
//! ## Architecture
//!
//! - [`loader`] reads `nebula.toml` and the `+++`-delimited phase files
//! - [`validate`] produces categorized errors; [`autofix`] repairs what it can
//! - [`dag`] and [`plan`] provide the graph and the derived schedule
//! - [`group`] is the dispatch loop; [`tracker`] its admission filter
//! - [`gate`] interposes human decisions; [`reload`] mutates the live graph
//! - [`state`] persists resumable per-phase status atomically
//!
//! The phase runner, issue tracker ("beads"), contract board, and architect
//! agent are collaborator traits ([`runner`], [`beads`], [`board`],
//! [`autofix::ArchitectAgent`]) injected per engine; nothing is global.

pub mod autofix;
pub mod beads;
pub mod board;
pub mod dag;
pub mod errors;
pub mod gate;
pub mod group;
pub mod loader;
pub mod manifest;
pub mod phase;
pub mod plan;
pub mod reload;
pub mod runner;
pub mod scope;
pub mod state;
pub mod tracker;
pub mod validate;

pub use dag::Dag;
pub use errors::{DagError, EngineError, StateError};
pub use gate::{GateMode, Gater, PhaseDecision, PlanDecision};
pub use group::{Callbacks, GroupConfig, RunSummary, WorkerGroup};
pub use manifest::{Manifest, Nebula};
pub use phase::{PhaseRegistry, PhaseSpec};
pub use plan::ExecutionPlan;
pub use state::{PhaseStatus, State, StateStore};
