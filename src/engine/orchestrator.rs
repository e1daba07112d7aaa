//! Top-level cycle loop: preconditions, branch setup, planner → workers →
//! wakeup replan → judge, and the final result.
//!
//! The orchestrator exclusively owns the cycle counter and session status.
//! Planner, worker stage, and judge run strictly in sequence within a cycle;
//! parallelism lives entirely inside the worker stage. A pool that cannot
//! supply agents pauses the session instead of failing it, leaving the state
//! directory resumable.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::{Duration, Instant};

use anyhow::{Context, Result, anyhow};
use chrono::Utc;
use tracing::{info, instrument, warn};

use crate::agents::executor::AgentInvoker;
use crate::agents::manager::{ExecutorManager, PoolUnavailable};
use crate::core::events::{EventBus, WakeupController};
use crate::core::pool::{AgentKind, AgentPool, PoolConfig};
use crate::core::session::{Session, SessionStatus};
use crate::core::task::{TaskStatus, TaskStore};
use crate::engine::judge::{Decision, JudgeContext, JudgeRunner};
use crate::engine::planner::{PlannerContext, PlannerRunner};
use crate::engine::prompt::{CycleStats, PromptPack, TaskSummaries};
use crate::engine::workers::{WorkerStage, execute_all_pending};
use crate::io::config::EngineConfig;
use crate::io::git::{Git, check_preconditions};
use crate::io::paths::{STATE_DIR_NAME, StatePaths};
use crate::io::store::{append_operator_log, load_session, write_pool, write_session};

/// Fixed commit message for the state-directory gitignore amendment.
pub const GITIGNORE_COMMIT_MESSAGE: &str = "chore: ignore conductor state directory";

/// Final report of one engine run.
#[derive(Debug, Clone, PartialEq)]
pub struct EngineResult {
    pub status: SessionStatus,
    pub cycles: u32,
    pub tasks_created: u64,
    pub tasks_completed: u64,
    pub tasks_failed: u64,
    pub duration: Duration,
    pub message: String,
}

/// Drives sessions from goal to terminal (or paused) state.
pub struct Orchestrator {
    root: PathBuf,
    config: EngineConfig,
    invoker: Arc<dyn AgentInvoker>,
    available: Vec<AgentKind>,
}

impl Orchestrator {
    pub fn new(
        root: impl Into<PathBuf>,
        config: EngineConfig,
        invoker: Arc<dyn AgentInvoker>,
        available: Vec<AgentKind>,
    ) -> Self {
        Self {
            root: root.into(),
            config,
            invoker,
            available,
        }
    }

    /// Fail fast when version control or agents are missing.
    pub fn initialize(&self) -> Result<()> {
        check_preconditions(&self.root)?;
        let required = self.config.min_available_agents.max(1) as usize;
        if self.available.len() < required {
            return Err(anyhow!(
                "{} agent CLI(s) detected, need at least {required} (install claude, codex, or gemini)",
                self.available.len()
            ));
        }
        Ok(())
    }

    /// Start a new session for `goal` and run it to a terminal or paused state.
    #[instrument(skip_all)]
    pub fn start(&self, goal: &str) -> Result<EngineResult> {
        if goal.trim().is_empty() {
            return Err(anyhow!("goal must not be empty"));
        }
        self.initialize()?;

        let paths = StatePaths::new(&self.root);
        let git = Git::new(&self.root);
        let session_id = generate_session_id(&git)?;
        let branch = format!("conductor/{session_id}");
        git.checkout_or_create_branch(&branch)
            .with_context(|| format!("switch to branch {branch}"))?;
        ensure_state_dir_ignored(&self.root, &git)?;

        let session = Session::new(
            goal,
            &session_id,
            &self.root.to_string_lossy(),
            &branch,
            self.config.max_cycles,
        );
        write_session(&paths, &session)?;
        let store = TaskStore::create(&paths.tasks_path)?;
        let pool = self.new_pool();
        write_pool(&paths, &pool)?;
        append_operator_log(&paths, &format!("session {session_id} started: {goal}"))?;
        info!(session_id = %session_id, branch = %branch, "session started");

        self.run_cycles(&paths, &git, session, store, pool)
    }

    /// Resume a previously paused or interrupted session from its checkpoint.
    ///
    /// Continues from `current_cycle`; never recreates session state.
    #[instrument(skip_all)]
    pub fn resume(&self) -> Result<EngineResult> {
        self.initialize()?;
        let paths = StatePaths::new(&self.root);
        let mut session = load_session(&paths)
            .context("no resumable session (state.json missing or unreadable)")?;
        if session.status.is_terminal() {
            return Err(anyhow!(
                "session {} already finished with status {:?}",
                session.session_id,
                session.status
            ));
        }

        let git = Git::new(&self.root);
        git.checkout_or_create_branch(&session.branch)?;

        let mut store = TaskStore::load(&paths.tasks_path)?;
        let released = store.release_stuck()?;
        if released > 0 {
            info!(released, "released in-progress tasks on resume");
        }
        let mut pool = crate::io::store::load_pool(&paths)?;
        pool.refresh_rate_limits(Utc::now());

        session.status = SessionStatus::Running;
        session.touch();
        write_session(&paths, &session)?;
        write_pool(&paths, &pool)?;
        append_operator_log(
            &paths,
            &format!(
                "session {} resumed at cycle {}",
                session.session_id,
                session.current_cycle + 1
            ),
        )?;

        self.run_cycles(&paths, &git, session, store, pool)
    }

    fn new_pool(&self) -> AgentPool {
        let pool_config = PoolConfig {
            max_consecutive_failures: self.config.max_consecutive_failures,
            cooldown_multiplier: self.config.cooldown_multiplier,
            min_available: self.config.min_available_agents,
            ..PoolConfig::default()
        };
        AgentPool::new(pool_config, |kind| {
            self.config.cooldown_minutes.for_kind(kind)
        })
    }

    fn run_cycles(
        &self,
        paths: &StatePaths,
        git: &Git,
        mut session: Session,
        store: TaskStore,
        pool: AgentPool,
    ) -> Result<EngineResult> {
        let started = Instant::now();
        let store = Mutex::new(store);
        let pool = Arc::new(Mutex::new(pool));
        let bus = Arc::new(EventBus::new());
        let wakeup = WakeupController::attach(&bus, self.config.wakeup_threshold);
        let prompts = PromptPack::new();
        let commit_lock = Mutex::new(());
        let manager = ExecutorManager::new(
            Arc::clone(&pool),
            Arc::clone(&self.invoker),
            self.config.cooldown_minutes,
            self.root.clone(),
            self.config.task_timeout(),
            self.config.cycle_timeout(),
        );
        manager.apply_detection(&self.available);

        let mut message = String::new();

        while session.current_cycle < session.max_cycles
            && session.status == SessionStatus::Running
        {
            // Reload persisted status so an operator edit can pause the loop
            // between cycles.
            if let Ok(on_disk) = load_session(paths) {
                if on_disk.status.is_paused() {
                    session.status = on_disk.status;
                    message = "paused by operator".to_string();
                    break;
                }
            }

            update_checkpoint(&mut session, &lock_store(&store));
            lock_store(&store).release_stuck()?;
            append_operator_log(
                paths,
                &format!("cycle {} of {} started", session.current_cycle + 1, session.max_cycles),
            )?;

            let planner = PlannerRunner {
                manager: &manager,
                prompts: &prompts,
                store: &store,
            };
            let planner_ctx = PlannerContext {
                goal: &session.goal,
                cycle: session.current_cycle,
                max_cycles: session.max_cycles,
                default_max_attempts: self.config.task_max_attempts,
            };

            let planned = match planner.run(&planner_ctx) {
                Ok(tasks) => tasks,
                Err(err) => match as_pool_pause(err) {
                    Ok(reason) => {
                        pause(&mut session, &mut message, reason);
                        break;
                    }
                    Err(err) => return Err(err),
                },
            };
            session.stats.tasks_created += planned.len() as u64;
            wakeup.reset();

            let stage = WorkerStage {
                store: &store,
                manager: &manager,
                prompts: &prompts,
                bus: &bus,
                git,
                commit_lock: &commit_lock,
                goal: &session.goal,
                max_workers: self.config.max_workers,
            };
            if let Err(err) = execute_all_pending(&stage) {
                match as_pool_pause(err) {
                    Ok(reason) => {
                        pause(&mut session, &mut message, reason);
                        break;
                    }
                    Err(err) => return Err(err),
                }
            }

            // Mid-cycle replan: the wakeup signal is consumed exactly once per
            // cycle, here, after the worker stage has joined.
            if wakeup.take_pending() {
                append_operator_log(paths, "planner wakeup: replanning mid-cycle")?;
                match planner.run(&planner_ctx) {
                    Ok(additional) => {
                        session.stats.tasks_created += additional.len() as u64;
                        wakeup.reset();
                        if !additional.is_empty() {
                            if let Err(err) = execute_all_pending(&stage) {
                                match as_pool_pause(err) {
                                    Ok(reason) => {
                                        pause(&mut session, &mut message, reason);
                                        break;
                                    }
                                    Err(err) => return Err(err),
                                }
                            }
                        }
                    }
                    Err(err) => match as_pool_pause(err) {
                        Ok(reason) => {
                            pause(&mut session, &mut message, reason);
                            break;
                        }
                        Err(err) => return Err(err),
                    },
                }
            }

            let (stats, summaries) = {
                let store = lock_store(&store);
                (CycleStats::gather(&store), TaskSummaries::gather(&store))
            };
            session.stats.tasks_completed = stats.completed as u64;
            session.stats.tasks_failed = stats.failed as u64;

            let judge = JudgeRunner {
                manager: &manager,
                prompts: &prompts,
            };
            let judgement = judge.run(&JudgeContext {
                goal: &session.goal,
                cycle: session.current_cycle,
                max_cycles: session.max_cycles,
                stats,
                summaries: &summaries,
            });
            append_operator_log(
                paths,
                &format!(
                    "cycle {} judged: {:?} ({})",
                    session.current_cycle + 1,
                    judgement.decision,
                    judgement.reasoning
                ),
            )?;

            session.current_cycle += 1;
            session.stats.cycles_completed = session.current_cycle;
            session.touch();
            match judgement.decision {
                Decision::Complete => {
                    session.status = SessionStatus::Completed;
                    message = judgement.reasoning;
                }
                Decision::Abort => {
                    session.status = SessionStatus::Aborted;
                    message = judgement.reasoning;
                }
                Decision::Continue => {}
            }

            write_session(paths, &session)?;
            write_pool(paths, &lock_pool(&pool))?;
        }

        if session.status == SessionStatus::Running {
            session.status = SessionStatus::Aborted;
            message = "max cycles reached".to_string();
        }
        session.touch();
        update_checkpoint(&mut session, &lock_store(&store));
        write_session(paths, &session)?;
        write_pool(paths, &lock_pool(&pool))?;

        // Commit whatever the final cycle left behind.
        git.add_all()?;
        git.commit_staged(&format!(
            "Session {}: final state",
            session.session_id
        ))?;

        let result = EngineResult {
            status: session.status,
            cycles: session.current_cycle,
            tasks_created: session.stats.tasks_created,
            tasks_completed: session.stats.tasks_completed,
            tasks_failed: session.stats.tasks_failed,
            duration: started.elapsed(),
            message: final_message(&session, message),
        };
        append_operator_log(paths, &format!("session finished: {}", result.message))?;
        info!(status = ?result.status, cycles = result.cycles, "session finished");
        Ok(result)
    }
}

fn pause(session: &mut Session, message: &mut String, reason: String) {
    warn!(reason = %reason, "pausing session: no agents available");
    session.status = SessionStatus::PausedNoAgents;
    *message = reason;
}

/// Split pool-unavailability (pause the session) from genuine engine errors.
fn as_pool_pause(err: anyhow::Error) -> std::result::Result<String, anyhow::Error> {
    match err.downcast_ref::<PoolUnavailable>() {
        Some(unavailable) => Ok(unavailable.to_string()),
        None => Err(err),
    }
}

fn final_message(session: &Session, detail: String) -> String {
    let prefix = match session.status {
        SessionStatus::Completed => "completed",
        SessionStatus::Aborted => "aborted",
        SessionStatus::PausedManual | SessionStatus::PausedNoAgents | SessionStatus::PausedError => {
            "paused"
        }
        SessionStatus::Running => "running",
    };
    if detail.is_empty() {
        format!("{prefix} after {} cycle(s)", session.current_cycle)
    } else {
        format!("{prefix} after {} cycle(s): {detail}", session.current_cycle)
    }
}

fn update_checkpoint(session: &mut Session, store: &TaskStore) {
    let ids_with = |status: TaskStatus| -> Vec<String> {
        store
            .tasks()
            .iter()
            .filter(|t| t.status == status)
            .map(|t| t.id.clone())
            .collect()
    };
    session.checkpoint.last_completed_task = store
        .tasks()
        .iter()
        .filter(|t| t.status == TaskStatus::Completed)
        .next_back()
        .map(|t| t.id.clone());
    session.checkpoint.pending_tasks = ids_with(TaskStatus::Pending);
    session.checkpoint.in_progress_tasks = ids_with(TaskStatus::InProgress);
    session.checkpoint.cycle_started_at = Some(Utc::now());
}

/// Derive a session id from the HEAD short SHA, unique against existing
/// `conductor/<id>` branches.
fn generate_session_id(git: &Git) -> Result<String> {
    let sha = git.head_short_sha(8)?;
    let base = format!("sess-{sha}");
    for suffix in 1..=999u32 {
        let id = if suffix == 1 {
            base.clone()
        } else {
            format!("{base}-{suffix}")
        };
        if !git.branch_exists(&format!("conductor/{id}"))? {
            return Ok(id);
        }
    }
    Err(anyhow!(
        "unable to generate unique session id from base '{base}' (too many existing branches)"
    ))
}

/// Amend `.gitignore` with the state directory on first use and commit the
/// amendment with the fixed message.
fn ensure_state_dir_ignored(root: &Path, git: &Git) -> Result<()> {
    let entry = format!("{STATE_DIR_NAME}/");
    let path = root.join(".gitignore");
    let existing = if path.exists() {
        fs::read_to_string(&path).with_context(|| format!("read {}", path.display()))?
    } else {
        String::new()
    };
    if existing.lines().any(|line| line.trim() == entry) {
        return Ok(());
    }

    let mut updated = existing;
    if !updated.is_empty() && !updated.ends_with('\n') {
        updated.push('\n');
    }
    updated.push_str(&entry);
    updated.push('\n');
    fs::write(&path, updated).with_context(|| format!("write {}", path.display()))?;

    git.stage_paths(&[".gitignore".to_string()])?;
    git.commit_staged(GITIGNORE_COMMIT_MESSAGE)?;
    Ok(())
}

fn lock_store<'a>(store: &'a Mutex<TaskStore>) -> MutexGuard<'a, TaskStore> {
    store.lock().expect("task store lock poisoned")
}

fn lock_pool(pool: &Arc<Mutex<AgentPool>>) -> MutexGuard<'_, AgentPool> {
    pool.lock().expect("agent pool lock poisoned")
}
