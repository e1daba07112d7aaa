//! Git adapter for the engine.
//!
//! The engine commits deterministically and enforces version-control
//! preconditions, so we keep a small, explicit wrapper around `git`
//! subprocess calls. Only four primitives matter to the orchestration
//! contract: create-or-switch branch, stage files, pull with rebase, commit.

use std::path::{Path, PathBuf};
use std::process::{Command, Output};

use anyhow::{Context, Result, anyhow};
use tracing::{debug, instrument, warn};

/// Minimum supported git version.
pub const MIN_GIT_VERSION: (u32, u32) = (2, 5);

/// Wrapper for executing git commands in a working directory.
#[derive(Debug, Clone)]
pub struct Git {
    workdir: PathBuf,
}

impl Git {
    pub fn new(workdir: impl Into<PathBuf>) -> Self {
        Self {
            workdir: workdir.into(),
        }
    }

    pub fn workdir(&self) -> &Path {
        &self.workdir
    }

    /// Installed git version as (major, minor). Errors when git is missing.
    pub fn version() -> Result<(u32, u32)> {
        let output = Command::new("git")
            .arg("--version")
            .output()
            .context("git is not installed or not on PATH")?;
        let text = String::from_utf8_lossy(&output.stdout);
        parse_git_version(&text)
            .ok_or_else(|| anyhow!("unable to parse git version from '{}'", text.trim()))
    }

    /// Whether the working directory is inside a git repository.
    pub fn is_repository(&self) -> bool {
        self.run(&["rev-parse", "--is-inside-work-tree"])
            .map(|out| out.status.success())
            .unwrap_or(false)
    }

    /// Whether user.name and user.email are configured.
    pub fn identity_configured(&self) -> Result<bool> {
        for key in ["user.name", "user.email"] {
            let out = self.run(&["config", "--get", key])?;
            if !out.status.success() || String::from_utf8_lossy(&out.stdout).trim().is_empty() {
                return Ok(false);
            }
        }
        Ok(true)
    }

    /// Return the current branch name (errors on detached HEAD).
    #[instrument(skip_all)]
    pub fn current_branch(&self) -> Result<String> {
        let out = self.run_capture(&["rev-parse", "--abbrev-ref", "HEAD"])?;
        let name = out.trim().to_string();
        if name == "HEAD" {
            warn!("detached HEAD detected");
            return Err(anyhow!("detached HEAD (refuse to run)"));
        }
        debug!(branch = %name, "current branch");
        Ok(name)
    }

    /// Return the current HEAD short SHA (stable given repo state).
    pub fn head_short_sha(&self, len: usize) -> Result<String> {
        let arg = format!("--short={len}");
        let out = self.run_capture(&["rev-parse", &arg, "HEAD"])?;
        Ok(out.trim().to_string())
    }

    /// Check whether a local branch exists.
    pub fn branch_exists(&self, branch: &str) -> Result<bool> {
        let status = self
            .run(&[
                "show-ref",
                "--verify",
                "--quiet",
                &format!("refs/heads/{branch}"),
            ])?
            .status;
        Ok(status.success())
    }

    /// Create the branch at current HEAD, or switch to it if it exists.
    #[instrument(skip_all, fields(branch))]
    pub fn checkout_or_create_branch(&self, branch: &str) -> Result<()> {
        if self.current_branch()? == branch {
            return Ok(());
        }
        if self.branch_exists(branch)? {
            debug!(branch, "checking out existing branch");
            self.run_checked(&["checkout", branch])?;
        } else {
            debug!(branch, "creating and checking out new branch");
            self.run_checked(&["checkout", "-b", branch])?;
        }
        Ok(())
    }

    /// Pull with rebase from the tracked upstream.
    ///
    /// Returns Ok(false) when the branch has no upstream (local-only session),
    /// which is not an error for the commit protocol.
    #[instrument(skip_all)]
    pub fn pull_rebase(&self) -> Result<bool> {
        let out = self.run(&["pull", "--rebase"])?;
        if out.status.success() {
            return Ok(true);
        }
        let stderr = String::from_utf8_lossy(&out.stderr).to_lowercase();
        if stderr.contains("no tracking information") || stderr.contains("does not appear to be a git repository") {
            debug!("no upstream configured, skipping pull");
            return Ok(false);
        }
        Err(anyhow!("git pull --rebase failed: {}", stderr.trim()))
    }

    /// Stage the given paths. Paths that do not exist are skipped with a
    /// warning so a task listing a file the agent never created cannot fail
    /// the commit.
    pub fn stage_paths(&self, paths: &[String]) -> Result<()> {
        for path in paths {
            if !self.workdir.join(path).exists() {
                warn!(path = %path, "skipping missing path at staging");
                continue;
            }
            self.run_checked(&["add", "--", path])?;
        }
        Ok(())
    }

    /// Stage all changes (respects .gitignore).
    pub fn add_all(&self) -> Result<()> {
        self.run_checked(&["add", "-A"])?;
        Ok(())
    }

    /// True if there is anything staged for commit.
    pub fn has_staged_changes(&self) -> Result<bool> {
        let out = self.run(&["diff", "--cached", "--name-only"])?;
        Ok(!String::from_utf8_lossy(&out.stdout).trim().is_empty())
    }

    /// Commit staged changes with a message.
    ///
    /// If there are no staged changes, this returns Ok(false) and does nothing.
    #[instrument(skip_all)]
    pub fn commit_staged(&self, message: &str) -> Result<bool> {
        if !self.has_staged_changes()? {
            debug!("no staged changes, skipping commit");
            return Ok(false);
        }
        debug!("committing staged changes");
        self.run_checked(&["commit", "-m", message])?;
        Ok(true)
    }

    fn run_capture(&self, args: &[&str]) -> Result<String> {
        let output = self.run_checked(args)?;
        Ok(String::from_utf8_lossy(&output.stdout).to_string())
    }

    fn run_checked(&self, args: &[&str]) -> Result<Output> {
        let output = self.run(args)?;
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return Err(anyhow!("git {} failed: {}", args.join(" "), stderr.trim()));
        }
        Ok(output)
    }

    fn run(&self, args: &[&str]) -> Result<Output> {
        Command::new("git")
            .args(args)
            .current_dir(&self.workdir)
            .output()
            .with_context(|| format!("spawn git {}", args.join(" ")))
    }
}

/// Verify the version-control preconditions for starting a session.
pub fn check_preconditions(root: &Path) -> Result<()> {
    let (major, minor) = Git::version()?;
    if (major, minor) < MIN_GIT_VERSION {
        return Err(anyhow!(
            "git {}.{} is too old (need >= {}.{})",
            major,
            minor,
            MIN_GIT_VERSION.0,
            MIN_GIT_VERSION.1
        ));
    }
    let git = Git::new(root);
    if !git.is_repository() {
        return Err(anyhow!(
            "{} is not a git repository (run `git init` first)",
            root.display()
        ));
    }
    if !git.identity_configured()? {
        return Err(anyhow!(
            "git user.name and user.email must be configured"
        ));
    }
    Ok(())
}

fn parse_git_version(text: &str) -> Option<(u32, u32)> {
    // "git version 2.43.0" or "git version 2.43.0.windows.1"
    let rest = text.trim().strip_prefix("git version ")?;
    let mut parts = rest.split('.');
    let major = parts.next()?.parse().ok()?;
    let minor = parts.next()?.parse().ok()?;
    Some((major, minor))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::test_support::TestRepo;
    use std::fs;

    #[test]
    fn parses_version_strings() {
        assert_eq!(parse_git_version("git version 2.43.0\n"), Some((2, 43)));
        assert_eq!(
            parse_git_version("git version 2.39.5 (Apple Git-154)"),
            Some((2, 39))
        );
        assert_eq!(parse_git_version("nonsense"), None);
    }

    /// Verifies branch creation, switching back, and idempotent re-checkout.
    #[test]
    fn checkout_or_create_branch_round_trips() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        let base = git.current_branch().expect("branch");

        git.checkout_or_create_branch("conductor/sess-1").expect("create");
        assert_eq!(git.current_branch().expect("branch"), "conductor/sess-1");

        // Re-checkout of the current branch is a no-op.
        git.checkout_or_create_branch("conductor/sess-1").expect("noop");

        git.checkout_or_create_branch(&base).expect("switch back");
        git.checkout_or_create_branch("conductor/sess-1").expect("switch existing");
        assert_eq!(git.current_branch().expect("branch"), "conductor/sess-1");
    }

    /// Verifies staged-path commits carry only the listed files.
    #[test]
    fn stage_paths_commits_only_listed_files() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        fs::write(repo.path().join("wanted.txt"), "a\n").expect("write");
        fs::write(repo.path().join("unwanted.txt"), "b\n").expect("write");

        git.stage_paths(&["wanted.txt".to_string(), "ghost.txt".to_string()])
            .expect("stage");
        assert!(git.commit_staged("Task completed: wanted").expect("commit"));

        let out = Command::new("git")
            .args(["show", "--name-only", "--pretty=format:", "HEAD"])
            .current_dir(repo.path())
            .output()
            .expect("git show");
        let shown = String::from_utf8_lossy(&out.stdout);
        assert!(shown.contains("wanted.txt"));
        assert!(!shown.contains("unwanted.txt"));
    }

    /// Verifies pull --rebase reports false without an upstream.
    #[test]
    fn pull_rebase_without_upstream_is_skipped() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.pull_rebase().expect("pull"));
    }

    /// Verifies preconditions pass inside a configured test repository.
    #[test]
    fn preconditions_pass_in_test_repo() {
        let repo = TestRepo::new().expect("repo");
        check_preconditions(repo.path()).expect("preconditions");
    }

    /// Verifies preconditions fail outside a repository.
    #[test]
    fn preconditions_fail_outside_repo() {
        let temp = tempfile::tempdir().expect("tempdir");
        let err = check_preconditions(temp.path()).unwrap_err();
        assert!(err.to_string().contains("not a git repository"));
    }

    #[test]
    fn commit_staged_without_changes_is_noop() {
        let repo = TestRepo::new().expect("repo");
        let git = Git::new(repo.path());
        assert!(!git.commit_staged("empty").expect("commit"));
    }
}
