//! Engine-level lifecycle tests driving full sessions with scripted agents.
//!
//! These cover the cycle loop end to end: planning, parallel-stage execution
//! with per-task commits, rate-limit failover, retry across cycles, mid-cycle
//! wakeup replanning, heuristic abort, and resume from a paused session.

use std::sync::Arc;

use chrono::Utc;

use conductor::core::classify::ErrorCategory;
use conductor::core::pool::{AgentKind, AgentPool, AgentStatus, PoolConfig};
use conductor::core::session::{Session, SessionStatus};
use conductor::core::task::{TaskStatus, TaskStore};
use conductor::engine::orchestrator::Orchestrator;
use conductor::io::config::EngineConfig;
use conductor::io::paths::StatePaths;
use conductor::io::store::{load_pool, load_session, write_pool, write_session};
use conductor::test_support::{ScriptedInvoker, ScriptedResponse, TestRepo};

fn all_kinds() -> Vec<AgentKind> {
    vec![AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini]
}

fn plan(tasks: &[(&str, &str, &[&str])]) -> ScriptedResponse {
    let tasks: Vec<serde_json::Value> = tasks
        .iter()
        .map(|(title, description, files)| {
            serde_json::json!({
                "title": title,
                "description": description,
                "files": files,
            })
        })
        .collect();
    ScriptedResponse::ok(
        &serde_json::json!({"analysis": "plan", "tasks": tasks}).to_string(),
    )
}

fn judge(decision: &str, reasoning: &str) -> ScriptedResponse {
    ScriptedResponse::ok(
        &serde_json::json!({
            "decision": decision,
            "reasoning": reasoning,
            "progress_percent": 50,
            "issues": [],
            "recommendations": []
        })
        .to_string(),
    )
}

fn completed() -> ScriptedResponse {
    ScriptedResponse::ok(r#"{"status":"COMPLETED"}"#)
}

/// One goal, one cycle, one worker, one agent task writing one file.
///
/// The commit carries only the listed file, the judge completes the session,
/// and the final counts match.
#[test]
fn greeting_goal_completes_in_one_cycle() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 1,
        max_workers: 1,
        ..EngineConfig::default()
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[("Add greeting", "write a greeting function", &["greet.xx"])]),
        ScriptedResponse::ok_writing_files(
            r#"wrote the function {"status":"COMPLETED"}"#,
            vec![("greet.xx", "greet\n")],
        ),
        judge("COMPLETE", "greeting exists"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("add a greeting function").expect("run");

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.cycles, 1);
    assert_eq!(result.tasks_created, 1);
    assert_eq!(result.tasks_completed, 1);
    assert_eq!(result.tasks_failed, 0);
    assert_eq!(repo.last_commit_message(), "Task completed: Add greeting");
    assert!(repo.files_in_head_commit().contains("greet.xx"));
    assert!(repo.current_branch().starts_with("conductor/"));
    invoker.assert_drained();

    // The state directory reflects the finished session.
    let paths = StatePaths::new(repo.path());
    let session = load_session(&paths).expect("session");
    assert_eq!(session.status, SessionStatus::Completed);
    assert_eq!(session.current_cycle, 1);
    let store = TaskStore::load(&paths.tasks_path).expect("tasks");
    assert_eq!(store.count_with_status(TaskStatus::Completed), 1);
}

/// Rate-limit failover plus retry-after-timeout.
///
/// Three tasks: the first succeeds, the second rate-limits its agent and
/// fails over to a different kind, the third times out once and is released,
/// then succeeds on the retry. The rate-limited kind carries a future
/// cooldown deadline; every task ends completed.
#[test]
fn rate_limit_fails_over_and_timeout_retries() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 2,
        max_workers: 1,
        wakeup_threshold: 10,
        ..EngineConfig::default()
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[
            ("One", "first task", &[]),
            ("Two", "second task", &[]),
            ("Three", "third task", &[]),
        ]),
        completed(),
        ScriptedResponse::failed("429 too many requests", Some(1)),
        completed(),
        ScriptedResponse::failed("agent timed out", Some(124)),
        completed(),
        judge("COMPLETE", "all done"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("three tasks").expect("run");

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.tasks_completed, 3);
    assert_eq!(result.tasks_failed, 0);
    invoker.assert_drained();

    let paths = StatePaths::new(repo.path());
    let pool = load_pool(&paths).expect("pool");
    let rate_limited = pool.kinds_with_status(AgentStatus::RateLimited);
    assert_eq!(rate_limited.len(), 1);
    let state = pool.state(rate_limited[0]);
    assert!(state.available_at.expect("cooldown deadline") > Utc::now());

    // The timed-out task carries two attempts in its history.
    let store = TaskStore::load(&paths.tasks_path).expect("tasks");
    let retried = store
        .tasks()
        .iter()
        .find(|t| t.attempts == 2)
        .expect("a retried task");
    assert_eq!(retried.status, TaskStatus::Completed);
    assert_eq!(retried.agent_history.len(), 2);
}

/// Mid-cycle wakeup: with threshold 2, completing the first plan's tasks
/// triggers one replan inside the same cycle, and the extra tasks run before
/// the judge sees the cycle.
#[test]
fn wakeup_replans_mid_cycle() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 2,
        max_workers: 1,
        wakeup_threshold: 2,
        ..EngineConfig::default()
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[
            ("A", "a", &[]),
            ("B", "b", &[]),
            ("C", "c", &[]),
            ("D", "d", &[]),
        ]),
        completed(),
        completed(),
        completed(),
        completed(),
        // Wakeup observed at end of stage: one replan with two more tasks.
        plan(&[("E", "e", &[]), ("F", "f", &[])]),
        completed(),
        completed(),
        judge("COMPLETE", "six of six done"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("wakeup goal").expect("run");

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.cycles, 1);
    assert_eq!(result.tasks_created, 6);
    assert_eq!(result.tasks_completed, 6);
    invoker.assert_drained();
}

/// Abort on drift: every planned task fails with invalid output, the judge
/// keeps continuing for two cycles, and when its own output stops parsing
/// the heuristic sees a failure majority and aborts.
#[test]
fn failure_majority_aborts_via_heuristic() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 5,
        max_workers: 1,
        wakeup_threshold: 10,
        // Keep kinds in rotation long enough to observe the drift.
        max_consecutive_failures: 50,
        ..EngineConfig::default()
    };
    // Nonzero exit with unparseable output and no stronger signal.
    let invalid_output =
        || ScriptedResponse::unparseable("malformed stream, parse error", Some(2));
    let mut responses = Vec::new();
    for cycle in 0..3 {
        responses.push(plan(&[("X", "x", &[]), ("Y", "y", &[])]));
        // Each task: two attempts released (invalid_output retry cap 2),
        // third attempt terminal.
        for _ in 0..6 {
            responses.push(invalid_output());
        }
        if cycle < 2 {
            responses.push(judge("CONTINUE", "still trying"));
        } else {
            responses.push(ScriptedResponse::ok("the judge rambles, no json today"));
        }
    }
    let invoker = Arc::new(ScriptedInvoker::new(responses));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("doomed goal").expect("run");

    assert_eq!(result.status, SessionStatus::Aborted);
    assert_eq!(result.cycles, 3);
    assert_eq!(result.tasks_created, 6);
    assert_eq!(result.tasks_failed, 6);
    assert!(result.message.contains("heuristic"));
    invoker.assert_drained();

    // Every failure carries the invalid_output category.
    let paths = StatePaths::new(repo.path());
    let store = TaskStore::load(&paths.tasks_path).expect("tasks");
    for task in store.tasks() {
        assert_eq!(task.status, TaskStatus::Failed);
        assert_eq!(task.attempts, 3);
        let error = task.last_error.as_ref().expect("error");
        assert_eq!(error.category, ErrorCategory::InvalidOutput);
    }
}

/// Resume: a session interrupted mid-cycle with one in-progress and two
/// pending tasks continues from its cycle counter; the stuck task is
/// released, the expired rate limit clears, and the loop runs to completion.
#[test]
fn resume_continues_from_checkpoint() {
    let repo = TestRepo::new().expect("repo");
    let paths = StatePaths::new(repo.path());

    // Fabricate an interrupted session: cycle 1 of 2 done, one task stuck in
    // progress, claude rate-limited with an already-expired deadline.
    let mut session = Session::new(
        "finish the feature",
        "sess-resume",
        &repo.path().to_string_lossy(),
        "conductor/sess-resume",
        2,
    );
    session.current_cycle = 1;
    session.status = SessionStatus::PausedError;
    write_session(&paths, &session).expect("write session");

    let mut store = TaskStore::create(&paths.tasks_path).expect("store");
    for title in ["First", "Second", "Third"] {
        let task = store.create_task(title, "work", "planner", Vec::new(), 3, false);
        store.add(task).expect("add");
    }
    store.claim(0, None).expect("claim").expect("task");

    let mut pool = AgentPool::new(PoolConfig::default(), |_| 30.0);
    pool.mark_rate_limited(
        AgentKind::Claude,
        30.0,
        Utc::now() - chrono::Duration::hours(2),
        "stale limit",
    );
    write_pool(&paths, &pool).expect("write pool");

    let config = EngineConfig {
        max_cycles: 2,
        max_workers: 1,
        wakeup_threshold: 10,
        ..EngineConfig::default()
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[]),
        completed(),
        completed(),
        completed(),
        judge("COMPLETE", "feature finished"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.resume().expect("resume");

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.cycles, 2);
    assert_eq!(result.tasks_completed, 3);
    invoker.assert_drained();

    let session = load_session(&paths).expect("session");
    assert_eq!(session.session_id, "sess-resume");
    let pool = load_pool(&paths).expect("pool");
    assert_ne!(
        pool.state(AgentKind::Claude).status,
        AgentStatus::RateLimited
    );
}

/// A terminal session refuses to resume.
#[test]
fn resume_rejects_finished_session() {
    let repo = TestRepo::new().expect("repo");
    let paths = StatePaths::new(repo.path());
    let mut session = Session::new(
        "done",
        "sess-done",
        &repo.path().to_string_lossy(),
        "conductor/sess-done",
        2,
    );
    session.status = SessionStatus::Completed;
    write_session(&paths, &session).expect("write session");

    let orchestrator = Orchestrator::new(
        repo.path(),
        EngineConfig::default(),
        Arc::new(ScriptedInvoker::new(Vec::new())),
        all_kinds(),
    );
    let err = orchestrator.resume().unwrap_err();
    assert!(err.to_string().contains("already finished"));
}

/// Parallel workers drain a queue of disjoint-file tasks; each task gets its
/// own commit and the store is serialized correctly under contention.
#[test]
fn parallel_workers_commit_disjoint_tasks() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 1,
        max_workers: 3,
        wakeup_threshold: 10,
        ..EngineConfig::default()
    };
    // Workers race for the scripted responses, so each response writes all
    // three files; every task still stages only the file it listed.
    let worker_ok = || {
        ScriptedResponse::ok_writing_files(
            r#"{"status":"COMPLETED"}"#,
            vec![
                ("a.txt", "content\n"),
                ("b.txt", "content\n"),
                ("c.txt", "content\n"),
            ],
        )
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[
            ("Write a", "a", &["a.txt"]),
            ("Write b", "b", &["b.txt"]),
            ("Write c", "c", &["c.txt"]),
        ]),
        worker_ok(),
        worker_ok(),
        worker_ok(),
        judge("COMPLETE", "all files written"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("write three files").expect("run");

    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.tasks_completed, 3);
    invoker.assert_drained();

    // Three task commits landed (order unspecified across workers).
    let log = std::process::Command::new("git")
        .args(["log", "--pretty=%s"])
        .current_dir(repo.path())
        .output()
        .expect("git log");
    let log = String::from_utf8_lossy(&log.stdout);
    assert_eq!(log.matches("Task completed:").count(), 3);
}

/// The shared-store mutex makes claims linearizable: under parallel workers
/// no task is ever executed twice when every execution succeeds.
#[test]
fn concurrent_claims_never_duplicate_tasks() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 1,
        max_workers: 3,
        wakeup_threshold: 100,
        ..EngineConfig::default()
    };
    let tasks: Vec<(String, String)> = (0..9)
        .map(|i| (format!("Task {i}"), format!("body {i}")))
        .collect();
    let plan_tasks: Vec<(&str, &str, &[&str])> = tasks
        .iter()
        .map(|(t, d)| (t.as_str(), d.as_str(), &[][..]))
        .collect();

    let mut responses = vec![plan(&plan_tasks)];
    for _ in 0..9 {
        responses.push(completed());
    }
    responses.push(judge("COMPLETE", "nine done"));

    let invoker = Arc::new(ScriptedInvoker::new(responses));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());
    let result = orchestrator.start("nine tasks").expect("run");

    assert_eq!(result.tasks_completed, 9);
    // Exactly 9 worker responses were consumed: no task ran twice.
    invoker.assert_drained();

    let paths = StatePaths::new(repo.path());
    let store = TaskStore::load(&paths.tasks_path).expect("tasks");
    assert!(store.tasks().iter().all(|t| t.attempts == 1));
}

/// Guard against worker threads and the wakeup controller dead-locking on
/// the shared bus: a stage with threshold 1 publishes a wakeup per task.
#[test]
fn wakeup_threshold_one_replans_after_stage() {
    let repo = TestRepo::new().expect("repo");
    let config = EngineConfig {
        max_cycles: 1,
        max_workers: 2,
        wakeup_threshold: 1,
        ..EngineConfig::default()
    };
    let invoker = Arc::new(ScriptedInvoker::new(vec![
        plan(&[("A", "a", &[]), ("B", "b", &[])]),
        completed(),
        completed(),
        // Exactly one replan despite two wakeup signals.
        plan(&[]),
        judge("COMPLETE", "done"),
    ]));
    let orchestrator = Orchestrator::new(repo.path(), config, invoker.clone(), all_kinds());

    let result = orchestrator.start("two quick tasks").expect("run");
    assert_eq!(result.status, SessionStatus::Completed);
    assert_eq!(result.tasks_completed, 2);
    invoker.assert_drained();
}
