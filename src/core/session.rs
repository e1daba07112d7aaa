//! Session state: goal, branch, cycle counter, checkpoint, and statistics.
//!
//! One session maps onto one dedicated branch and one run of the engine
//! against one goal. The orchestrator exclusively owns the cycle counter and
//! status; everything here is plain data persisted to `state.json`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Session lifecycle status. `Completed` and `Aborted` are terminal; the
/// paused states are resumable.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionStatus {
    Running,
    PausedManual,
    PausedNoAgents,
    PausedError,
    Completed,
    Aborted,
}

impl SessionStatus {
    pub fn is_paused(&self) -> bool {
        matches!(
            self,
            SessionStatus::PausedManual | SessionStatus::PausedNoAgents | SessionStatus::PausedError
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionStatus::Completed | SessionStatus::Aborted)
    }
}

/// Aggregate counters reported in the final result and the status command.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionStats {
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub cycles_completed: u32,
}

/// Cycle-boundary snapshot allowing a future cycle replay; the baseline
/// implementation restarts the interrupted cycle on resume.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Checkpoint {
    pub last_completed_task: Option<String>,
    pub pending_tasks: Vec<String>,
    pub in_progress_tasks: Vec<String>,
    pub cycle_started_at: Option<DateTime<Utc>>,
}

/// One run of the engine against one goal (`state.json`).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Session {
    pub goal: String,
    pub session_id: String,
    pub project_path: String,
    pub status: SessionStatus,
    pub current_cycle: u32,
    pub max_cycles: u32,
    pub branch: String,
    pub checkpoint: Checkpoint,
    pub stats: SessionStats,
    pub started_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Session {
    pub fn new(
        goal: &str,
        session_id: &str,
        project_path: &str,
        branch: &str,
        max_cycles: u32,
    ) -> Self {
        let now = Utc::now();
        Self {
            goal: goal.to_string(),
            session_id: session_id.to_string(),
            project_path: project_path.to_string(),
            status: SessionStatus::Running,
            current_cycle: 0,
            max_cycles,
            branch: branch.to_string(),
            checkpoint: Checkpoint::default(),
            stats: SessionStats::default(),
            started_at: now,
            updated_at: now,
        }
    }

    pub fn touch(&mut self) {
        self.updated_at = Utc::now();
    }
}
