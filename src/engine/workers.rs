//! Parallel worker stage: claim, execute, commit, repeat.
//!
//! Up to `max_workers` scoped threads each loop over the task store until no
//! pending task remains. Workers share one working tree on one branch; the
//! commit protocol (pull --rebase, stage the task's files, commit) runs under
//! a single critical section so staging never interleaves across workers. A
//! failing or panicking worker releases its task and keeps looping; only pool
//! unavailability stops the stage.

use std::panic::{AssertUnwindSafe, catch_unwind};
use std::sync::Mutex;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};

use anyhow::Result;
use tracing::{debug, error, info, instrument, warn};

use crate::agents::manager::{ExecutorManager, PoolUnavailable};
use crate::core::classify::{ErrorCategory, ErrorInfo, classify, should_retry};
use crate::core::events::{EngineEvent, EventBus};
use crate::core::task::{Task, TaskStatus, TaskStore};
use crate::engine::prompt::PromptPack;
use crate::io::git::Git;

/// Everything a worker needs, shared across the stage's threads.
pub struct WorkerStage<'a> {
    pub store: &'a Mutex<TaskStore>,
    pub manager: &'a ExecutorManager,
    pub prompts: &'a PromptPack,
    pub bus: &'a EventBus,
    pub git: &'a Git,
    /// Serializes pull/stage/commit across workers.
    pub commit_lock: &'a Mutex<()>,
    pub goal: &'a str,
    pub max_workers: usize,
}

/// Counters for one worker stage.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct StageOutcome {
    pub completed: u64,
    pub failed: u64,
}

enum Disposition {
    Completed,
    Failed,
    Released,
}

/// Run workers until the pending queue drains.
///
/// Returns an error only when the agent pool became unavailable (wait or
/// pause); per-task failures are absorbed by the task lifecycle.
#[instrument(skip_all, fields(max_workers = stage.max_workers))]
pub fn execute_all_pending(stage: &WorkerStage<'_>) -> Result<StageOutcome> {
    let completed = AtomicU64::new(0);
    let failed = AtomicU64::new(0);
    let stop = AtomicBool::new(false);
    let fatal: Mutex<Option<anyhow::Error>> = Mutex::new(None);

    std::thread::scope(|scope| {
        for worker_id in 0..stage.max_workers {
            let completed = &completed;
            let failed = &failed;
            let stop = &stop;
            let fatal = &fatal;
            scope.spawn(move || {
                worker_loop(stage, worker_id, completed, failed, stop, fatal);
            });
        }
    });

    if let Some(err) = fatal.lock().expect("fatal slot lock poisoned").take() {
        return Err(err);
    }
    Ok(StageOutcome {
        completed: completed.load(Ordering::SeqCst),
        failed: failed.load(Ordering::SeqCst),
    })
}

fn worker_loop(
    stage: &WorkerStage<'_>,
    worker_id: usize,
    completed: &AtomicU64,
    failed: &AtomicU64,
    stop: &AtomicBool,
    fatal: &Mutex<Option<anyhow::Error>>,
) {
    loop {
        if stop.load(Ordering::SeqCst) {
            return;
        }
        let claimed = {
            let mut store = lock_store(stage.store);
            store.claim(worker_id, None)
        };
        let task = match claimed {
            Ok(Some(task)) => task,
            // Queue drained: this worker is done.
            Ok(None) => return,
            Err(err) => {
                error!(worker_id, error = %format!("{err:#}"), "claim failed");
                set_fatal(fatal, stop, err);
                return;
            }
        };
        info!(worker_id, task_id = %task.id, attempt = task.attempts, "worker picked up task");

        let attempt = catch_unwind(AssertUnwindSafe(|| process_task(stage, &task)));
        match attempt {
            Ok(Ok(Disposition::Completed)) => {
                completed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Ok(Disposition::Failed)) => {
                failed.fetch_add(1, Ordering::SeqCst);
            }
            Ok(Ok(Disposition::Released)) => {}
            Ok(Err(err)) => {
                if err.downcast_ref::<PoolUnavailable>().is_some() {
                    release_if_in_progress(stage, &task.id);
                    set_fatal(fatal, stop, err);
                    return;
                }
                // Engine-side failure: isolate it, free the task, keep going.
                warn!(worker_id, task_id = %task.id, error = %format!("{err:#}"), "worker error; releasing task");
                release_if_in_progress(stage, &task.id);
            }
            Err(_panic) => {
                error!(worker_id, task_id = %task.id, "worker panicked; releasing task");
                release_if_in_progress(stage, &task.id);
            }
        }
    }
}

fn process_task(stage: &WorkerStage<'_>, task: &Task) -> Result<Disposition> {
    let prompt = stage.prompts.render_worker(stage.goal, task);
    let execution = stage.manager.execute_task(task, &prompt)?;

    match execution.error {
        None => {
            if let Err(err) = commit_task(stage, task) {
                // A failing commit counts as a failed attempt, capped like
                // any other failure, so a broken commit step cannot spin a
                // worker forever.
                let message = format!("{err:#}");
                let category = match classify(&message, None) {
                    ErrorCategory::Unknown => ErrorCategory::Crash,
                    other => other,
                };
                warn!(task_id = %task.id, category = category.as_str(), error = %message, "commit failed");
                let info = ErrorInfo::new(category, &message, execution.agent, &message);
                lock_store(stage.store).record_error(&task.id, info)?;
                return dispose_failure(stage, task, category);
            }
            lock_store(stage.store).complete(&task.id, execution.agent)?;
            stage.bus.publish(&EngineEvent::TaskCompleted {
                task_id: task.id.clone(),
            });
            Ok(Disposition::Completed)
        }
        Some(info) => {
            debug!(task_id = %task.id, category = info.category.as_str(), "task attempt failed");
            let category = info.category;
            lock_store(stage.store).record_error(&task.id, info)?;
            dispose_failure(stage, task, category)
        }
    }
}

/// Release the task for another attempt or fail it terminally, honoring the
/// category policy and the task's attempt budget.
fn dispose_failure(
    stage: &WorkerStage<'_>,
    task: &Task,
    category: ErrorCategory,
) -> Result<Disposition> {
    let retryable = match category {
        ErrorCategory::Permission => false,
        // Rate limits are an agent problem, not a task problem: the task
        // goes back to pending as long as attempts remain.
        ErrorCategory::RateLimit => task.attempts < task.max_attempts,
        _ => should_retry(category, task.attempts, task.max_attempts),
    };
    if retryable {
        lock_store(stage.store).release(&task.id)?;
        Ok(Disposition::Released)
    } else {
        lock_store(stage.store).mark_failed(&task.id)?;
        stage.bus.publish(&EngineEvent::TaskFailed {
            task_id: task.id.clone(),
        });
        Ok(Disposition::Failed)
    }
}

/// The per-task commit: pull --rebase, stage the task's files (all changes
/// when the list is empty), commit with the canonical message.
fn commit_task(stage: &WorkerStage<'_>, task: &Task) -> Result<()> {
    let _guard = stage.commit_lock.lock().expect("commit lock poisoned");
    stage.git.pull_rebase()?;
    if task.files.is_empty() {
        stage.git.add_all()?;
    } else {
        stage.git.stage_paths(&task.files)?;
    }
    let committed = stage
        .git
        .commit_staged(&format!("Task completed: {}", task.title))?;
    if !committed {
        debug!(task_id = %task.id, "task produced no changes to commit");
    }
    Ok(())
}

fn release_if_in_progress(stage: &WorkerStage<'_>, task_id: &str) {
    let mut store = lock_store(stage.store);
    if store.get(task_id).map(|t| t.status) == Some(TaskStatus::InProgress) {
        if let Err(err) = store.release(task_id) {
            error!(task_id, error = %format!("{err:#}"), "failed to release task");
        }
    }
}

fn set_fatal(fatal: &Mutex<Option<anyhow::Error>>, stop: &AtomicBool, err: anyhow::Error) {
    stop.store(true, Ordering::SeqCst);
    let mut slot = fatal.lock().expect("fatal slot lock poisoned");
    if slot.is_none() {
        *slot = Some(err);
    }
}

fn lock_store<'a>(store: &'a Mutex<TaskStore>) -> std::sync::MutexGuard<'a, TaskStore> {
    store.lock().expect("task store lock poisoned")
}
