//! Deterministic classification of agent failures.
//!
//! Maps raw subprocess output and exit code onto a fixed taxonomy, and pairs
//! each category with a recovery policy. Classification is a pure function of
//! its inputs; the policy table is fixed and must not drift.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::core::pool::AgentKind;

/// Maximum bytes of raw output retained in an [`ErrorInfo`] snippet.
pub const OUTPUT_SNIPPET_LIMIT: usize = 500;

/// Failure taxonomy for agent executions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorCategory {
    RateLimit,
    Timeout,
    Crash,
    /// The agent's output never parsed as its structured format. Assigned
    /// by the dispatch layer, not by [`classify`].
    InvalidOutput,
    GitConflict,
    Permission,
    Network,
    Unknown,
}

impl ErrorCategory {
    pub const ALL: [ErrorCategory; 8] = [
        ErrorCategory::RateLimit,
        ErrorCategory::Timeout,
        ErrorCategory::Crash,
        ErrorCategory::InvalidOutput,
        ErrorCategory::GitConflict,
        ErrorCategory::Permission,
        ErrorCategory::Network,
        ErrorCategory::Unknown,
    ];

    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorCategory::RateLimit => "rate_limit",
            ErrorCategory::Timeout => "timeout",
            ErrorCategory::Crash => "crash",
            ErrorCategory::InvalidOutput => "invalid_output",
            ErrorCategory::GitConflict => "git_conflict",
            ErrorCategory::Permission => "permission",
            ErrorCategory::Network => "network",
            ErrorCategory::Unknown => "unknown",
        }
    }
}

/// What the engine should do about a failure of a given category.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryAction {
    Retry,
    Reassign,
    Fail,
    Pause,
}

/// Fixed per-category recovery policy.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct CategoryPolicy {
    pub retry: bool,
    /// Cooldown in minutes before the same agent should be used again.
    pub cooldown_minutes: f64,
    pub max_retries: u32,
    pub allow_failover: bool,
    pub action: RecoveryAction,
}

/// The policy table. Values are part of the engine contract.
pub fn policy(category: ErrorCategory) -> CategoryPolicy {
    use ErrorCategory::*;
    use RecoveryAction::*;
    match category {
        RateLimit => CategoryPolicy {
            retry: false,
            cooldown_minutes: 45.0,
            max_retries: 0,
            allow_failover: true,
            action: Reassign,
        },
        Timeout => CategoryPolicy {
            retry: true,
            cooldown_minutes: 0.0,
            max_retries: 2,
            allow_failover: true,
            action: Retry,
        },
        Crash => CategoryPolicy {
            retry: true,
            cooldown_minutes: 1.0,
            max_retries: 3,
            allow_failover: true,
            action: Retry,
        },
        InvalidOutput => CategoryPolicy {
            retry: true,
            cooldown_minutes: 0.0,
            max_retries: 2,
            allow_failover: false,
            action: Retry,
        },
        GitConflict => CategoryPolicy {
            retry: true,
            cooldown_minutes: 0.0,
            max_retries: 2,
            allow_failover: false,
            action: Retry,
        },
        Permission => CategoryPolicy {
            retry: false,
            cooldown_minutes: 0.0,
            max_retries: 0,
            allow_failover: false,
            action: Fail,
        },
        Network => CategoryPolicy {
            retry: true,
            cooldown_minutes: 0.5,
            max_retries: 5,
            allow_failover: false,
            action: Retry,
        },
        Unknown => CategoryPolicy {
            retry: true,
            cooldown_minutes: 1.0,
            max_retries: 1,
            allow_failover: true,
            action: Retry,
        },
    }
}

const RATE_LIMIT_SIGNALS: [&str; 5] = [
    "rate limit",
    "too many requests",
    "quota exceeded",
    "429",
    "ratelimit",
];
const TIMEOUT_SIGNALS: [&str; 2] = ["timed out", "timeout"];
const PERMISSION_SIGNALS: [&str; 3] = ["permission denied", "access denied", "unauthorized"];
const NETWORK_SIGNALS: [&str; 4] = [
    "connection refused",
    "connection reset",
    "name resolution failed",
    "fetch failed",
];
const GIT_CONFLICT_SIGNALS: [&str; 3] = ["conflict", "merge conflict", "cannot merge"];

/// Classify raw subprocess output and exit code into a category.
///
/// Rules apply first-hit, matching case-insensitively on the output.
pub fn classify(output: &str, exit_code: Option<i32>) -> ErrorCategory {
    let lower = output.to_lowercase();
    let matches_any = |signals: &[&str]| signals.iter().any(|s| lower.contains(s));

    if matches_any(&RATE_LIMIT_SIGNALS) {
        return ErrorCategory::RateLimit;
    }
    if exit_code == Some(124) || matches_any(&TIMEOUT_SIGNALS) {
        return ErrorCategory::Timeout;
    }
    if matches_any(&PERMISSION_SIGNALS) {
        return ErrorCategory::Permission;
    }
    if matches_any(&NETWORK_SIGNALS) {
        return ErrorCategory::Network;
    }
    if matches_any(&GIT_CONFLICT_SIGNALS) {
        return ErrorCategory::GitConflict;
    }
    if exit_code.is_some_and(|code| code != 0) && !lower.contains("error") {
        return ErrorCategory::Crash;
    }
    ErrorCategory::Unknown
}

/// Whether a failed task should go back to pending for another attempt.
///
/// Honors both the task's own `max_attempts` and the category's retry cap.
pub fn should_retry(category: ErrorCategory, attempts: u32, max_attempts: u32) -> bool {
    let p = policy(category);
    p.retry && attempts < max_attempts && attempts <= p.max_retries
}

/// Whether a failure may be handed to a different agent kind.
///
/// Never reassign once a task has accumulated 3 agent attempts.
pub fn should_reassign(category: ErrorCategory, agent_history_len: usize) -> bool {
    policy(category).allow_failover && agent_history_len < 3
}

/// Structured failure record attached to tasks and attempts.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorInfo {
    pub category: ErrorCategory,
    pub message: String,
    pub occurred_at: DateTime<Utc>,
    pub agent: AgentKind,
    /// Truncated raw output for operator diagnosis.
    pub output_snippet: String,
}

impl ErrorInfo {
    pub fn new(category: ErrorCategory, message: &str, agent: AgentKind, output: &str) -> Self {
        Self {
            category,
            message: message.to_string(),
            occurred_at: Utc::now(),
            agent,
            output_snippet: truncate_snippet(output),
        }
    }
}

fn truncate_snippet(output: &str) -> String {
    if output.len() <= OUTPUT_SNIPPET_LIMIT {
        return output.to_string();
    }
    let mut end = OUTPUT_SNIPPET_LIMIT;
    while !output.is_char_boundary(end) {
        end -= 1;
    }
    output[..end].to_string()
}
