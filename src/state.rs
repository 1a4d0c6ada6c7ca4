//! Crash-safe TOML state store.
//!
//! The whole state is serialized to `{path}.tmp` and renamed over the real
//! file, so readers never observe a torn write. Saves are best-effort from
//! the dispatcher's point of view: a failed save is logged and the next
//! successful one overwrites it.
//!
//! A prior version of the format stored phases under `[tasks.<id>]`; that
//! section name is still accepted on read and rewritten as `[phases.<id>]`
//! on the next save.

use crate::errors::StateError;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

pub const STATE_FILE_NAME: &str = "nebula.state.toml";
const STATE_VERSION: u32 = 1;

/// Lifecycle of a phase in the store.
///
/// pending -> created -> in_progress -> {done | failed | skipped};
/// a failed phase may go back to created on retry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    /// No external ticket yet.
    #[default]
    Pending,
    /// Ticket exists, work not started.
    Created,
    InProgress,
    Done,
    Failed,
    Skipped,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed | Self::Skipped)
    }

    /// Whether `self -> next` is a legal transition.
    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        match (self, next) {
            (a, b) if *a == b => true,
            (Pending, Created) | (Pending, Skipped) | (Pending, Failed) => true,
            (Created, InProgress) | (Created, Skipped) | (Created, Failed) => true,
            (InProgress, Done) | (InProgress, Failed) | (InProgress, Skipped) => true,
            // Retry path.
            (Failed, Created) => true,
            _ => false,
        }
    }
}

impl std::fmt::Display for PhaseStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Self::Pending => "pending",
            Self::Created => "created",
            Self::InProgress => "in_progress",
            Self::Done => "done",
            Self::Failed => "failed",
            Self::Skipped => "skipped",
        };
        write!(f, "{s}")
    }
}

/// Per-phase persisted record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PhaseState {
    #[serde(default)]
    pub bead_id: String,
    #[serde(default)]
    pub status: PhaseStatus,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<String>,
}

/// The whole persisted state of a nebula run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct State {
    pub version: u32,
    #[serde(default)]
    pub nebula_name: String,
    #[serde(default)]
    pub total_cost_usd: f64,
    #[serde(default, alias = "tasks")]
    pub phases: BTreeMap<String, PhaseState>,
}

impl State {
    pub fn empty(nebula_name: &str) -> Self {
        Self {
            version: STATE_VERSION,
            nebula_name: nebula_name.to_string(),
            total_cost_usd: 0.0,
            phases: BTreeMap::new(),
        }
    }

    pub fn phase(&self, id: &str) -> Option<&PhaseState> {
        self.phases.get(id)
    }

    pub fn status_of(&self, id: &str) -> PhaseStatus {
        self.phases
            .get(id)
            .map(|p| p.status)
            .unwrap_or(PhaseStatus::Pending)
    }

    /// Upsert a phase record. `created_at` sticks from the first insert;
    /// `updated_at` is bumped to now. Illegal transitions are logged and
    /// applied anyway — the dispatcher owns the transition discipline.
    pub fn set_phase_state(&mut self, id: &str, bead_id: &str, status: PhaseStatus) {
        let now = Utc::now();
        match self.phases.get_mut(id) {
            Some(entry) => {
                if !entry.status.can_transition_to(status) {
                    tracing::warn!(
                        phase = id,
                        from = %entry.status,
                        to = %status,
                        "unexpected phase status transition"
                    );
                }
                if !bead_id.is_empty() {
                    entry.bead_id = bead_id.to_string();
                }
                entry.status = status;
                entry.updated_at = now;
            }
            None => {
                self.phases.insert(
                    id.to_string(),
                    PhaseState {
                        bead_id: bead_id.to_string(),
                        status,
                        created_at: now,
                        updated_at: now,
                        report: None,
                    },
                );
            }
        }
    }

    pub fn set_report(&mut self, id: &str, report: &str) {
        if let Some(entry) = self.phases.get_mut(id) {
            entry.report = Some(report.to_string());
            entry.updated_at = Utc::now();
        }
    }

    pub fn add_cost(&mut self, usd: f64) {
        self.total_cost_usd += usd;
    }

    /// Counts used by the progress callback: (terminal, non-terminal).
    pub fn open_closed(&self) -> (usize, usize) {
        let closed = self
            .phases
            .values()
            .filter(|p| p.status.is_terminal())
            .count();
        (self.phases.len() - closed, closed)
    }
}

/// Handle on the state file location.
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    /// Store for a nebula directory (`<dir>/nebula.state.toml`).
    pub fn new(dir: &Path) -> Self {
        Self {
            path: dir.join(STATE_FILE_NAME),
        }
    }

    /// Store at an explicit file path.
    pub fn at(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Load the state; a missing file yields the empty version-1 state, a
    /// parse error is fatal.
    pub fn load(&self) -> Result<State, StateError> {
        let content = match std::fs::read_to_string(&self.path) {
            Ok(c) => c,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Ok(State::empty(""));
            }
            Err(e) => {
                return Err(StateError::Read {
                    path: self.path.clone(),
                    source: e,
                });
            }
        };

        toml::from_str(&content).map_err(|e| StateError::Parse {
            path: self.path.clone(),
            source: e,
        })
    }

    /// Atomic save: write `{path}.tmp`, rename over `{path}`.
    pub fn save(&self, state: &State) -> Result<(), StateError> {
        let serialized = toml::to_string_pretty(state)?;
        let tmp = self.path.with_extension("toml.tmp");
        std::fs::write(&tmp, serialized).map_err(|e| StateError::Write {
            path: tmp.clone(),
            source: e,
        })?;
        std::fs::rename(&tmp, &self.path).map_err(|e| StateError::Write {
            path: self.path.clone(),
            source: e,
        })?;
        Ok(())
    }
}
