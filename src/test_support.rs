//! Test-only helpers: a disposable git repository and scripted agent invokers.
//!
//! Scripted invokers return queued results without spawning processes, which
//! keeps engine tests deterministic and offline.

use std::collections::VecDeque;
use std::fs;
use std::path::Path;
use std::process::Command;
use std::sync::Mutex;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};

use crate::agents::executor::{AgentInvoker, ExecutionResult, InvokeRequest};
use crate::core::pool::AgentKind;

/// A temporary git repository with identity configured and one commit.
pub struct TestRepo {
    temp: tempfile::TempDir,
}

impl TestRepo {
    pub fn new() -> Result<Self> {
        let temp = tempfile::tempdir().context("tempdir")?;
        let root = temp.path();

        run_git(root, &["init", "--initial-branch=main"])?;
        run_git(root, &["config", "user.email", "test@example.com"])?;
        run_git(root, &["config", "user.name", "test"])?;

        fs::write(root.join("README.md"), "hi\n").context("write README")?;
        // Mirror the engine's gitignore amendment so state files stay out of
        // task commits in tests too.
        fs::write(root.join(".gitignore"), ".conductor/\n").context("write gitignore")?;
        run_git(root, &["add", "-A"])?;
        run_git(root, &["commit", "-m", "chore: init"])?;

        Ok(Self { temp })
    }

    pub fn path(&self) -> &Path {
        self.temp.path()
    }

    pub fn last_commit_message(&self) -> String {
        capture_git(self.path(), &["log", "-1", "--pretty=%s"])
    }

    pub fn files_in_head_commit(&self) -> String {
        capture_git(self.path(), &["show", "--name-only", "--pretty=format:", "HEAD"])
    }

    pub fn current_branch(&self) -> String {
        capture_git(self.path(), &["rev-parse", "--abbrev-ref", "HEAD"])
    }
}

fn run_git(root: &Path, args: &[&str]) -> Result<()> {
    let status = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .with_context(|| format!("spawn git {args:?}"))?;
    if !status.status.success() {
        return Err(anyhow!(
            "git {args:?} failed: {}",
            String::from_utf8_lossy(&status.stderr).trim()
        ));
    }
    Ok(())
}

fn capture_git(root: &Path, args: &[&str]) -> String {
    let out = Command::new("git")
        .args(args)
        .current_dir(root)
        .output()
        .expect("run git");
    assert!(out.status.success(), "git {args:?} failed");
    String::from_utf8_lossy(&out.stdout).trim().to_string()
}

/// One scripted agent response, optionally writing files into the workdir
/// before returning (standing in for an agent that edited the tree).
#[derive(Debug, Clone)]
pub struct ScriptedResponse {
    pub success: bool,
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    pub output_parsed: bool,
    pub files_to_write: Vec<(String, String)>,
}

impl ScriptedResponse {
    pub fn ok(output: &str) -> Self {
        Self {
            success: true,
            output: output.to_string(),
            error: None,
            exit_code: Some(0),
            output_parsed: true,
            files_to_write: Vec::new(),
        }
    }

    pub fn ok_writing_files(output: &str, files: Vec<(&str, &str)>) -> Self {
        Self {
            files_to_write: files
                .into_iter()
                .map(|(p, c)| (p.to_string(), c.to_string()))
                .collect(),
            ..Self::ok(output)
        }
    }

    pub fn failed(error: &str, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(error.to_string()),
            exit_code,
            output_parsed: true,
            files_to_write: Vec::new(),
        }
    }

    /// A failure whose output did not parse as the kind's structured format.
    pub fn unparseable(output: &str, exit_code: Option<i32>) -> Self {
        Self {
            success: false,
            output: output.to_string(),
            error: None,
            exit_code,
            output_parsed: false,
            files_to_write: Vec::new(),
        }
    }
}

/// Invoker that drains a queue of scripted responses.
pub struct ScriptedInvoker {
    queue: Mutex<VecDeque<ScriptedResponse>>,
}

impl ScriptedInvoker {
    pub fn new(responses: Vec<ScriptedResponse>) -> Self {
        Self {
            queue: Mutex::new(responses.into()),
        }
    }

    /// Assert every scripted response was consumed.
    pub fn assert_drained(&self) {
        let queue = self.queue.lock().expect("queue lock poisoned");
        assert!(
            queue.is_empty(),
            "{} scripted responses were not consumed",
            queue.len()
        );
    }
}

impl AgentInvoker for ScriptedInvoker {
    fn invoke(&self, _kind: AgentKind, request: &InvokeRequest) -> Result<ExecutionResult> {
        let response = self
            .queue
            .lock()
            .expect("queue lock poisoned")
            .pop_front()
            .ok_or_else(|| anyhow!("scripted invoker exhausted (label '{}')", request.label))?;

        for (path, contents) in &response.files_to_write {
            let full = request.workdir.join(path);
            if let Some(parent) = full.parent() {
                fs::create_dir_all(parent).context("create parent dir")?;
            }
            fs::write(&full, contents).with_context(|| format!("write {}", full.display()))?;
        }

        Ok(ExecutionResult {
            success: response.success,
            output: response.output,
            error: response.error,
            exit_code: response.exit_code,
            output_parsed: response.output_parsed,
            duration: Duration::from_millis(10),
        })
    }
}
