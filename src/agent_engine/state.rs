use serde::{Deserialize, Serialize};

use crate::action::coords::ImageDims;
use crate::errors::{PilotError, PilotResult};

/// Lifecycle of one run. `Completed`, `Failed` and `Cancelled` are absorbing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RunStatus {
    Idle,
    Running,
    Paused,
    Cancelled,
    Completed,
    Failed,
}

impl RunStatus {
    pub fn is_terminal(self) -> bool {
        matches!(self, RunStatus::Cancelled | RunStatus::Completed | RunStatus::Failed)
    }

    fn can_become(self, next: RunStatus) -> bool {
        use RunStatus::*;
        match (self, next) {
            (from, _) if from.is_terminal() => false,
            (Idle, Running) => true,
            (Running, Paused) | (Paused, Running) => true,
            (_, to) if to.is_terminal() => true,
            _ => false,
        }
    }
}

/// Run state owned by the agent loop. A new task always gets a new value.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AgentRunState {
    pub status: RunStatus,
    pub step_index: u32,
    pub retry_count: u32,
}

impl Default for AgentRunState {
    fn default() -> Self {
        Self::new()
    }
}

impl AgentRunState {
    pub fn new() -> Self {
        Self {
            status: RunStatus::Idle,
            step_index: 0,
            retry_count: 0,
        }
    }

    pub fn transition(&mut self, next: RunStatus) -> PilotResult<()> {
        if self.status == next {
            return Ok(());
        }
        if !self.status.can_become(next) {
            return Err(PilotError::Agent(format!(
                "invalid run transition {:?} -> {:?}",
                self.status, next
            )));
        }
        tracing::debug!(from = ?self.status, to = ?next, "run status changed");
        self.status = next;
        Ok(())
    }

    pub fn is_terminal(&self) -> bool {
        self.status.is_terminal()
    }
}

/// How a run ended.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "outcome", rename_all = "snake_case")]
pub enum RunOutcome {
    Completed { message: String },
    Failed { reason: String },
    Cancelled,
}

impl RunOutcome {
    pub fn status(&self) -> RunStatus {
        match self {
            RunOutcome::Completed { .. } => RunStatus::Completed,
            RunOutcome::Failed { .. } => RunStatus::Failed,
            RunOutcome::Cancelled => RunStatus::Cancelled,
        }
    }
}

/// Timing and image facts for one loop iteration. Diagnostics only.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StepRecord {
    pub index: u32,
    pub screenshot_ms: u64,
    pub model_ms: u64,
    pub actuation_ms: u64,
    pub total_ms: u64,
    /// Dimensions of the image sent, `None` for text-only turns.
    pub image_dims: Option<ImageDims>,
    pub original_dims: Option<ImageDims>,
    pub image_bytes: usize,
}
