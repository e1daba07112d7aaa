//! Task records and the task store.
//!
//! The store owns the ordered task list and enforces status transitions. Every
//! mutation persists `tasks.json` before returning, so a mutation can fail
//! only on a persistence error. Callers serialize concurrent access by
//! wrapping the store in a mutex; under that lock `claim` is linearizable.

use std::path::{Path, PathBuf};

use anyhow::{Context, Result, anyhow};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::classify::{ErrorCategory, ErrorInfo};
use crate::core::pool::AgentKind;

/// Task lifecycle status. `Completed` and `Failed` are terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    Pending,
    InProgress,
    Completed,
    Failed,
}

impl TaskStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }
}

/// Outcome of one start-to-finish execution of a task by one agent.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AttemptResult {
    Completed,
    Failed,
    Timeout,
    RateLimited,
}

impl From<ErrorCategory> for AttemptResult {
    fn from(category: ErrorCategory) -> Self {
        match category {
            ErrorCategory::Timeout => AttemptResult::Timeout,
            ErrorCategory::RateLimit => AttemptResult::RateLimited,
            _ => AttemptResult::Failed,
        }
    }
}

/// Append-only record of one agent attempt at a task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentAttempt {
    pub agent: AgentKind,
    pub started_at: Option<DateTime<Utc>>,
    pub ended_at: DateTime<Utc>,
    pub result: AttemptResult,
    pub error: Option<String>,
}

/// One unit of work produced by the planner and executed by a worker.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub description: String,
    pub status: TaskStatus,
    pub assigned_agent: Option<AgentKind>,
    pub worker_id: Option<usize>,
    /// Files the task is expected to touch; an empty list stages everything.
    pub files: Vec<String>,
    pub needs_web_search: bool,
    pub created_by: String,
    pub created_at: DateTime<Utc>,
    pub started_at: Option<DateTime<Utc>>,
    pub completed_at: Option<DateTime<Utc>>,
    pub attempts: u32,
    pub max_attempts: u32,
    pub last_error: Option<ErrorInfo>,
    pub agent_history: Vec<AgentAttempt>,
}

/// Ordered collection of tasks with persisted mutations.
#[derive(Debug)]
pub struct TaskStore {
    tasks: Vec<Task>,
    path: PathBuf,
}

impl TaskStore {
    /// Create an empty store persisting to `path`. Writes the initial file.
    pub fn create(path: impl Into<PathBuf>) -> Result<Self> {
        let store = Self {
            tasks: Vec::new(),
            path: path.into(),
        };
        store.persist()?;
        Ok(store)
    }

    /// Load an existing store from `path`.
    pub fn load(path: impl Into<PathBuf>) -> Result<Self> {
        let path = path.into();
        let contents = std::fs::read_to_string(&path)
            .with_context(|| format!("read tasks {}", path.display()))?;
        let tasks: Vec<Task> = serde_json::from_str(&contents)
            .with_context(|| format!("parse tasks {}", path.display()))?;
        Ok(Self { tasks, path })
    }

    pub fn tasks(&self) -> &[Task] {
        &self.tasks
    }

    pub fn get(&self, task_id: &str) -> Option<&Task> {
        self.tasks.iter().find(|t| t.id == task_id)
    }

    fn get_mut(&mut self, task_id: &str) -> Result<&mut Task> {
        self.tasks
            .iter_mut()
            .find(|t| t.id == task_id)
            .ok_or_else(|| anyhow!("unknown task id '{task_id}'"))
    }

    fn next_id(&self) -> String {
        let max = self
            .tasks
            .iter()
            .filter_map(|t| t.id.strip_prefix("task-"))
            .filter_map(|n| n.parse::<u64>().ok())
            .max()
            .unwrap_or(0);
        format!("task-{}", max + 1)
    }

    /// Build a fresh pending task without adding it to the store.
    pub fn create_task(
        &self,
        title: &str,
        description: &str,
        created_by: &str,
        files: Vec<String>,
        max_attempts: u32,
        needs_web_search: bool,
    ) -> Task {
        Task {
            id: self.next_id(),
            title: title.to_string(),
            description: description.to_string(),
            status: TaskStatus::Pending,
            assigned_agent: None,
            worker_id: None,
            files,
            needs_web_search,
            created_by: created_by.to_string(),
            created_at: Utc::now(),
            started_at: None,
            completed_at: None,
            attempts: 0,
            max_attempts,
            last_error: None,
            agent_history: Vec::new(),
        }
    }

    /// Append a task to the store.
    pub fn add(&mut self, task: Task) -> Result<()> {
        debug!(task_id = %task.id, title = %task.title, "adding task");
        self.tasks.push(task);
        self.persist()
    }

    /// Atomically take the first pending task and mark it in progress.
    ///
    /// Returns `None` when nothing is pending. Under the store's outer lock
    /// two concurrent claimers always receive distinct tasks.
    pub fn claim(
        &mut self,
        worker_id: usize,
        agent_kind: Option<AgentKind>,
    ) -> Result<Option<Task>> {
        let Some(task) = self
            .tasks
            .iter_mut()
            .find(|t| t.status == TaskStatus::Pending)
        else {
            return Ok(None);
        };
        task.status = TaskStatus::InProgress;
        task.worker_id = Some(worker_id);
        task.assigned_agent = agent_kind;
        task.started_at = Some(Utc::now());
        task.attempts += 1;
        let claimed = task.clone();
        debug!(task_id = %claimed.id, worker_id, attempt = claimed.attempts, "claimed task");
        self.persist()?;
        Ok(Some(claimed))
    }

    /// Mark a task completed and append its successful attempt.
    pub fn complete(&mut self, task_id: &str, agent: AgentKind) -> Result<()> {
        let task = self.get_mut(task_id)?;
        let started_at = task.started_at;
        task.status = TaskStatus::Completed;
        task.assigned_agent = Some(agent);
        task.completed_at = Some(Utc::now());
        task.agent_history.push(AgentAttempt {
            agent,
            started_at,
            ended_at: Utc::now(),
            result: AttemptResult::Completed,
            error: None,
        });
        self.persist()
    }

    /// Record a failed attempt and set the task's last error.
    ///
    /// Leaves the task in progress; the caller decides between `release` and
    /// `mark_failed` based on the retry policy.
    pub fn record_error(&mut self, task_id: &str, error: ErrorInfo) -> Result<()> {
        let task = self.get_mut(task_id)?;
        task.agent_history.push(AgentAttempt {
            agent: error.agent,
            started_at: task.started_at,
            ended_at: Utc::now(),
            result: AttemptResult::from(error.category),
            error: Some(error.message.clone()),
        });
        task.assigned_agent = Some(error.agent);
        task.last_error = Some(error);
        self.persist()
    }

    /// Return a task to pending and clear its assignment.
    pub fn release(&mut self, task_id: &str) -> Result<()> {
        let task = self.get_mut(task_id)?;
        task.status = TaskStatus::Pending;
        task.worker_id = None;
        task.assigned_agent = None;
        task.started_at = None;
        self.persist()
    }

    /// Move a task to its terminal failed state.
    pub fn mark_failed(&mut self, task_id: &str) -> Result<()> {
        let task = self.get_mut(task_id)?;
        task.status = TaskStatus::Failed;
        task.worker_id = None;
        task.completed_at = Some(Utc::now());
        self.persist()
    }

    /// Release every in-progress task back to pending. Idempotent.
    ///
    /// Safety net at cycle boundaries and on resume.
    pub fn release_stuck(&mut self) -> Result<usize> {
        let mut count = 0;
        for task in &mut self.tasks {
            if task.status == TaskStatus::InProgress {
                task.status = TaskStatus::Pending;
                task.worker_id = None;
                task.assigned_agent = None;
                task.started_at = None;
                count += 1;
            }
        }
        if count > 0 {
            debug!(count, "released stuck tasks");
            self.persist()?;
        }
        Ok(count)
    }

    pub fn count_with_status(&self, status: TaskStatus) -> usize {
        self.tasks.iter().filter(|t| t.status == status).count()
    }

    pub fn len(&self) -> usize {
        self.tasks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.tasks.is_empty()
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn persist(&self) -> Result<()> {
        crate::io::store::write_json_atomic(&self.path, &self.tasks)
            .with_context(|| format!("persist tasks {}", self.path.display()))
    }
}
