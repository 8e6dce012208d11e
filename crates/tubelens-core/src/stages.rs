//! Stage tracking for analysis progress
//!
//! A fixed, ordered list of stages per analysis kind, driven by `stage`
//! events from the server and by local lifecycle transitions.
//!
//! Server-sent transitions are trusted: unknown ids are ignored and
//! regressions (e.g. `completed` back to `active`) are applied as sent.
//! Both cases are logged so a misbehaving server is visible.

use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

/// Static description of one stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub struct StageDefinition {
    pub id: &'static str,
    pub label: &'static str,
    pub description: &'static str,
}

/// Stages of the metadata generation panel
pub const METADATA_STAGES: &[StageDefinition] = &[
    StageDefinition {
        id: "prepare",
        label: "Preparing request",
        description: "Collecting the selected videos and template",
    },
    StageDefinition {
        id: "request",
        label: "Generating metadata",
        description: "Waiting for the model to write titles, descriptions and tags",
    },
    StageDefinition {
        id: "render",
        label: "Formatting results",
        description: "Assembling the generated metadata",
    },
];

/// Stages of the analytics insights panel
pub const INSIGHTS_STAGES: &[StageDefinition] = &[
    StageDefinition {
        id: "prepare",
        label: "Collecting analytics",
        description: "Packaging channel and video statistics",
    },
    StageDefinition {
        id: "request",
        label: "Running analysis",
        description: "Waiting for the model to analyse performance",
    },
    StageDefinition {
        id: "render",
        label: "Building report",
        description: "Assembling the final report",
    },
];

/// Status of a single stage
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StageStatus {
    Pending,
    Active,
    Completed,
    Error,
}

impl StageStatus {
    /// Position in the normal pending -> active -> completed/error progression
    fn rank(self) -> u8 {
        match self {
            StageStatus::Pending => 0,
            StageStatus::Active => 1,
            StageStatus::Completed | StageStatus::Error => 2,
        }
    }
}

impl std::fmt::Display for StageStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StageStatus::Pending => write!(f, "pending"),
            StageStatus::Active => write!(f, "active"),
            StageStatus::Completed => write!(f, "completed"),
            StageStatus::Error => write!(f, "error"),
        }
    }
}

/// A stage definition with its current status
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct StageState {
    #[serde(flatten)]
    pub definition: StageDefinition,
    pub status: StageStatus,
}

/// Finite-state machine over an ordered stage list
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(transparent)]
pub struct StageTracker {
    stages: Vec<StageState>,
}

impl StageTracker {
    /// Create a tracker with every stage pending
    pub fn new(definitions: &[StageDefinition]) -> Self {
        Self {
            stages: definitions
                .iter()
                .map(|definition| StageState {
                    definition: *definition,
                    status: StageStatus::Pending,
                })
                .collect(),
        }
    }

    /// Reset for a new session: first stage active, the rest pending
    pub fn start(&mut self) {
        for (idx, stage) in self.stages.iter_mut().enumerate() {
            stage.status = if idx == 0 {
                StageStatus::Active
            } else {
                StageStatus::Pending
            };
        }
    }

    /// Apply a server-sent transition
    ///
    /// Returns false if the id names no known stage.
    pub fn apply(&mut self, stage_id: &str, status: StageStatus) -> bool {
        let Some(stage) = self.stages.iter_mut().find(|s| s.definition.id == stage_id) else {
            warn!("Ignoring status '{}' for unknown stage '{}'", status, stage_id);
            return false;
        };

        if status.rank() < stage.status.rank() {
            warn!(
                "Stage '{}' regressed from {} to {}",
                stage_id, stage.status, status
            );
        }
        debug!("Stage '{}': {} -> {}", stage_id, stage.status, status);
        stage.status = status;

        let active = self.count(StageStatus::Active);
        if active > 1 {
            warn!("{} stages are active at once", active);
        }
        true
    }

    /// Mark the active stage as failed so the UI shows where it stopped
    ///
    /// Returns the id of the stage that was marked, if any.
    pub fn mark_active_as_error(&mut self) -> Option<&'static str> {
        let stage = self
            .stages
            .iter_mut()
            .find(|s| s.status == StageStatus::Active)?;
        stage.status = StageStatus::Error;
        Some(stage.definition.id)
    }

    /// Show every stage completed at once (no incremental progress available)
    pub fn complete_all(&mut self) {
        for stage in &mut self.stages {
            stage.status = StageStatus::Completed;
        }
    }

    /// Whether any stage has left `pending`; progress UIs render only then
    pub fn any_non_pending(&self) -> bool {
        self.stages.iter().any(|s| s.status != StageStatus::Pending)
    }

    pub fn active_stage(&self) -> Option<&StageState> {
        self.stages.iter().find(|s| s.status == StageStatus::Active)
    }

    pub fn get(&self, stage_id: &str) -> Option<&StageState> {
        self.stages.iter().find(|s| s.definition.id == stage_id)
    }

    pub fn stages(&self) -> &[StageState] {
        &self.stages
    }

    pub fn count(&self, status: StageStatus) -> usize {
        self.stages.iter().filter(|s| s.status == status).count()
    }
}
