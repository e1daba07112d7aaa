//! Dispatch of work onto agents: selection, accounting, and failover.
//!
//! The manager asks the pool for a kind, invokes it, and records the outcome
//! back into the pool. Rate-limited worker executions fail over to a
//! different kind at most once, implemented as an explicit loop over
//! candidates so the bound is structural rather than a recursion depth.

use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use anyhow::Result;
use chrono::{DateTime, Utc};
use tracing::{debug, instrument, warn};

use crate::agents::executor::{AgentInvoker, ExecutionResult, InvokeRequest};
use crate::agents::extract::{Completion, detect_completion};
use crate::core::classify::{ErrorCategory, ErrorInfo, classify, should_reassign};
use crate::core::pool::{AgentKind, AgentPool, Selection};
use crate::core::task::Task;
use crate::io::config::CooldownTable;

/// No agent kind can take work right now. Carries whether the condition is a
/// temporary wait (rate limits) or a pause (nothing left to recover).
#[derive(Debug, Clone)]
pub struct PoolUnavailable {
    pub reason: String,
    pub until: Option<DateTime<Utc>>,
    pub pause: bool,
}

impl std::fmt::Display for PoolUnavailable {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self.until {
            Some(until) => write!(f, "{} (retry after {})", self.reason, until.to_rfc3339()),
            None => f.write_str(&self.reason),
        }
    }
}

impl std::error::Error for PoolUnavailable {}

/// Category for a failed execution. The signal table decides first; a
/// failure whose output never parsed as the kind's structured format is
/// invalid output rather than unknown.
fn failure_category(result: &ExecutionResult, combined: &str) -> ErrorCategory {
    let category = classify(combined, result.exit_code);
    if category == ErrorCategory::Unknown && !result.output_parsed {
        return ErrorCategory::InvalidOutput;
    }
    category
}

/// Outcome of dispatching one task (or raw prompt) to an agent.
#[derive(Debug, Clone)]
pub struct TaskExecution {
    pub result: ExecutionResult,
    pub agent: AgentKind,
    /// Classified failure, when the execution did not succeed.
    pub error: Option<ErrorInfo>,
}

/// Dispatches tasks to selected agents and keeps the pool's health current.
pub struct ExecutorManager {
    pool: Arc<Mutex<AgentPool>>,
    invoker: Arc<dyn AgentInvoker>,
    cooldowns: CooldownTable,
    workdir: PathBuf,
    task_timeout: Duration,
    cycle_timeout: Duration,
}

impl ExecutorManager {
    pub fn new(
        pool: Arc<Mutex<AgentPool>>,
        invoker: Arc<dyn AgentInvoker>,
        cooldowns: CooldownTable,
        workdir: PathBuf,
        task_timeout: Duration,
        cycle_timeout: Duration,
    ) -> Self {
        Self {
            pool,
            invoker,
            cooldowns,
            workdir,
            task_timeout,
            cycle_timeout,
        }
    }

    pub fn pool(&self) -> &Arc<Mutex<AgentPool>> {
        &self.pool
    }

    /// Disable every kind that was not detected on this machine.
    pub fn apply_detection(&self, detected: &[AgentKind]) {
        let mut pool = self.lock_pool();
        for kind in AgentKind::ALL {
            if !detected.contains(&kind) {
                pool.mark_disabled(kind);
            }
        }
    }

    fn lock_pool(&self) -> std::sync::MutexGuard<'_, AgentPool> {
        self.pool.lock().expect("agent pool lock poisoned")
    }

    fn select_agent(&self) -> Result<AgentKind> {
        match self.lock_pool().select(Utc::now()) {
            Selection::Selected(kind) => Ok(kind),
            Selection::Wait { until, reason } => Err(PoolUnavailable {
                reason,
                until: Some(until),
                pause: false,
            }
            .into()),
            Selection::Pause { reason } => Err(PoolUnavailable {
                reason,
                until: None,
                pause: true,
            }
            .into()),
        }
    }

    fn invoke(&self, kind: AgentKind, prompt: &str, label: &str, timeout: Duration) -> ExecutionResult {
        let request = InvokeRequest {
            prompt: prompt.to_string(),
            workdir: self.workdir.clone(),
            timeout,
            label: label.to_string(),
        };
        let started = Instant::now();
        match self.invoker.invoke(kind, &request) {
            Ok(result) => result,
            Err(err) => {
                warn!(kind = %kind, error = %format!("{err:#}"), "invoker failed");
                ExecutionResult::internal_failure(format!("{err:#}"), started.elapsed())
            }
        }
    }

    /// Execute a task's worker prompt on a selected agent.
    ///
    /// On a rate-limited failure the kind is put on cooldown and the dispatch
    /// fails over to a different kind at most once; the task itself is not
    /// re-queued here — the caller decides that based on attempts. Errors are
    /// returned only for pool unavailability, which must stop the cycle.
    #[instrument(skip_all, fields(task_id = %task.id))]
    pub fn execute_task(&self, task: &Task, prompt: &str) -> Result<TaskExecution> {
        let mut failovers = 0usize;
        loop {
            let kind = self.select_agent()?;
            self.lock_pool().mark_busy(kind);
            let result = self.invoke(kind, prompt, &task.id, self.task_timeout);

            let completion = detect_completion(&result.output);
            if result.success && completion != Completion::Failed {
                self.lock_pool().record_success(kind, result.duration);
                return Ok(TaskExecution {
                    result,
                    agent: kind,
                    error: None,
                });
            }

            let combined = result.combined_text();
            let category = failure_category(&result, &combined);
            let message = match &result.error {
                Some(error) if !error.is_empty() => error.clone(),
                _ if completion == Completion::Failed => "agent reported FAILED".to_string(),
                _ => format!("agent {kind} failed ({})", category.as_str()),
            };

            if category == ErrorCategory::RateLimit {
                let cooldown = self.cooldowns.for_kind(kind);
                self.lock_pool()
                    .mark_rate_limited(kind, cooldown, Utc::now(), &message);
                if failovers < 1 && should_reassign(category, task.agent_history.len() + failovers)
                {
                    debug!(from = %kind, "failing over after rate limit");
                    failovers += 1;
                    continue;
                }
            } else {
                self.lock_pool().record_failure(kind, category);
            }

            let info = ErrorInfo::new(category, &message, kind, &combined);
            return Ok(TaskExecution {
                result,
                agent: kind,
                error: Some(info),
            });
        }
    }

    /// Execute a caller-supplied prompt directly (planner/judge).
    ///
    /// Same selection and accounting as task execution, but no worker prompt
    /// wrapper, no completion detection, and no failover: the callers have
    /// their own fallback behavior.
    #[instrument(skip_all, fields(label))]
    pub fn execute_raw(&self, prompt: &str, label: &str) -> Result<(ExecutionResult, AgentKind)> {
        let kind = self.select_agent()?;
        self.lock_pool().mark_busy(kind);
        let result = self.invoke(kind, prompt, label, self.cycle_timeout);

        if result.success {
            self.lock_pool().record_success(kind, result.duration);
        } else {
            let combined = result.combined_text();
            let category = failure_category(&result, &combined);
            let mut pool = self.lock_pool();
            if category == ErrorCategory::RateLimit {
                let cooldown = self.cooldowns.for_kind(kind);
                pool.mark_rate_limited(kind, cooldown, Utc::now(), &combined);
            } else {
                pool.record_failure(kind, category);
            }
        }
        Ok((result, kind))
    }
}
