//! Agent pool: health tracking and selection among the fixed agent kinds.
//!
//! The pool owns per-kind health records (status, cooldown deadline, rolling
//! success rate, mean duration, consecutive failures) and ranks candidates by
//! health score. Selection takes `now` as a parameter so ranking and cooldown
//! expiry stay deterministic under test.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::core::classify::ErrorCategory;

/// One of the external coding-agent CLIs the engine knows how to invoke.
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum AgentKind {
    Claude,
    Codex,
    Gemini,
}

impl AgentKind {
    /// All kinds in fixed fallback order (also the selection tie-break order).
    pub const ALL: [AgentKind; 3] = [AgentKind::Claude, AgentKind::Codex, AgentKind::Gemini];

    pub fn as_str(&self) -> &'static str {
        match self {
            AgentKind::Claude => "claude",
            AgentKind::Codex => "codex",
            AgentKind::Gemini => "gemini",
        }
    }

    /// Position in the fixed fallback order, used to break score ties.
    pub fn fallback_rank(&self) -> usize {
        AgentKind::ALL
            .iter()
            .position(|k| k == self)
            .unwrap_or(usize::MAX)
    }
}

impl std::fmt::Display for AgentKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Health status of one agent kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AgentStatus {
    Available,
    Busy,
    RateLimited,
    Errored,
    Exhausted,
    Disabled,
}

/// Per-kind health record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentState {
    pub status: AgentStatus,
    /// When a rate-limited kind becomes eligible again.
    pub available_at: Option<DateTime<Utc>>,
    /// Base cooldown applied on rate limit, in minutes.
    pub cooldown_minutes: f64,
    pub success_rate: f64,
    pub mean_duration_secs: f64,
    pub consecutive_failures: u32,
    /// Consecutive rate limits since the last success; escalates the cooldown.
    pub rate_limit_streak: u32,
    pub total_completed: u64,
    pub total_failed: u64,
    pub last_error: Option<String>,
}

impl AgentState {
    pub fn new(cooldown_minutes: f64) -> Self {
        Self {
            status: AgentStatus::Available,
            available_at: None,
            cooldown_minutes,
            success_rate: 1.0,
            mean_duration_secs: 0.0,
            consecutive_failures: 0,
            rate_limit_streak: 0,
            total_completed: 0,
            total_failed: 0,
            last_error: None,
        }
    }

    /// Health score: success rate divided by mean duration (floored at 1s).
    pub fn score(&self) -> f64 {
        self.success_rate / self.mean_duration_secs.max(1.0)
    }

    fn recompute_success_rate(&mut self) {
        let total = self.total_completed + self.total_failed;
        self.success_rate = if total == 0 {
            1.0
        } else {
            self.total_completed as f64 / total as f64
        };
    }
}

/// Fixed pool configuration, persisted alongside the per-kind state.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PoolConfig {
    pub selection_strategy: String,
    pub fallback_order: Vec<AgentKind>,
    pub max_consecutive_failures: u32,
    pub cooldown_multiplier: f64,
    pub min_available: u32,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            selection_strategy: "health_score".to_string(),
            fallback_order: AgentKind::ALL.to_vec(),
            max_consecutive_failures: 3,
            cooldown_multiplier: 1.5,
            min_available: 1,
        }
    }
}

/// Outcome of asking the pool for an agent.
#[derive(Debug, Clone, PartialEq)]
pub enum Selection {
    Selected(AgentKind),
    /// All kinds are rate limited; retry after the earliest deadline.
    Wait {
        until: DateTime<Utc>,
        reason: String,
    },
    /// All kinds are exhausted or disabled; the session must pause.
    Pause { reason: String },
}

/// Health tracking and selection among the fixed set of agent kinds.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentPool {
    pub agents: BTreeMap<AgentKind, AgentState>,
    pub pool_config: PoolConfig,
}

impl AgentPool {
    /// Create a pool with every kind available and the given per-kind cooldowns.
    pub fn new(config: PoolConfig, cooldowns: impl Fn(AgentKind) -> f64) -> Self {
        let agents = AgentKind::ALL
            .iter()
            .map(|&kind| (kind, AgentState::new(cooldowns(kind))))
            .collect();
        Self {
            agents,
            pool_config: config,
        }
    }

    pub fn state(&self, kind: AgentKind) -> &AgentState {
        &self.agents[&kind]
    }

    fn state_mut(&mut self, kind: AgentKind) -> &mut AgentState {
        self.agents.get_mut(&kind).expect("all kinds present")
    }

    /// Move rate-limited kinds whose deadline has passed back to available.
    pub fn refresh_rate_limits(&mut self, now: DateTime<Utc>) {
        for (kind, state) in self.agents.iter_mut() {
            if state.status != AgentStatus::RateLimited {
                continue;
            }
            match state.available_at {
                Some(at) if at <= now => {
                    debug!(kind = %kind, "rate limit expired");
                    state.status = AgentStatus::Available;
                    state.available_at = None;
                }
                _ => {}
            }
        }
    }

    /// Select one agent kind for the next unit of work.
    ///
    /// Available kinds rank first by health score; busy kinds remain eligible
    /// behind them so more workers than installed kinds can still make
    /// progress. Ties break by the fixed fallback order.
    pub fn select(&mut self, now: DateTime<Utc>) -> Selection {
        self.refresh_rate_limits(now);

        let best = |status: AgentStatus| -> Option<AgentKind> {
            self.agents
                .iter()
                .filter(|(_, s)| s.status == status)
                .max_by(|(ak, a), (bk, b)| {
                    a.score()
                        .partial_cmp(&b.score())
                        .unwrap_or(std::cmp::Ordering::Equal)
                        .then(bk.fallback_rank().cmp(&ak.fallback_rank()))
                })
                .map(|(&k, _)| k)
        };

        if let Some(kind) = best(AgentStatus::Available).or_else(|| best(AgentStatus::Busy)) {
            return Selection::Selected(kind);
        }

        let earliest = self
            .agents
            .values()
            .filter(|s| s.status == AgentStatus::RateLimited)
            .filter_map(|s| s.available_at)
            .min();
        if let Some(until) = earliest {
            return Selection::Wait {
                until,
                reason: "all agents rate limited".to_string(),
            };
        }

        Selection::Pause {
            reason: "no agents available (all exhausted, errored, or disabled)".to_string(),
        }
    }

    pub fn mark_busy(&mut self, kind: AgentKind) {
        let state = self.state_mut(kind);
        if state.status == AgentStatus::Available {
            state.status = AgentStatus::Busy;
        }
    }

    pub fn mark_available(&mut self, kind: AgentKind) {
        let state = self.state_mut(kind);
        if matches!(state.status, AgentStatus::Busy | AgentStatus::Available) {
            state.status = AgentStatus::Available;
        }
    }

    pub fn mark_disabled(&mut self, kind: AgentKind) {
        self.state_mut(kind).status = AgentStatus::Disabled;
    }

    pub fn mark_exhausted(&mut self, kind: AgentKind) {
        self.state_mut(kind).status = AgentStatus::Exhausted;
    }

    /// Put a kind on cooldown. The deadline escalates with consecutive rate
    /// limits: `cooldown * multiplier^streak`.
    pub fn mark_rate_limited(
        &mut self,
        kind: AgentKind,
        cooldown_minutes: f64,
        now: DateTime<Utc>,
        error: &str,
    ) {
        let multiplier = self.pool_config.cooldown_multiplier;
        let state = self.state_mut(kind);
        state.cooldown_minutes = cooldown_minutes;
        let factor = multiplier.powi(state.rate_limit_streak as i32);
        let minutes = cooldown_minutes * factor;
        state.status = AgentStatus::RateLimited;
        state.available_at =
            Some(now + chrono::Duration::milliseconds((minutes * 60_000.0) as i64));
        state.rate_limit_streak += 1;
        state.last_error = Some(error.to_string());
        warn!(kind = %kind, minutes, "agent rate limited");
    }

    pub fn record_success(&mut self, kind: AgentKind, duration: Duration) {
        let state = self.state_mut(kind);
        let n = state.total_completed as f64;
        state.mean_duration_secs =
            (state.mean_duration_secs * n + duration.as_secs_f64()) / (n + 1.0);
        state.total_completed += 1;
        state.consecutive_failures = 0;
        state.rate_limit_streak = 0;
        state.last_error = None;
        state.recompute_success_rate();
        if matches!(state.status, AgentStatus::Busy) {
            state.status = AgentStatus::Available;
        }
    }

    pub fn record_failure(&mut self, kind: AgentKind, category: ErrorCategory) {
        let max_consecutive = self.pool_config.max_consecutive_failures;
        let state = self.state_mut(kind);
        state.total_failed += 1;
        state.consecutive_failures += 1;
        state.last_error = Some(category.as_str().to_string());
        state.recompute_success_rate();
        if state.consecutive_failures >= max_consecutive {
            warn!(kind = %kind, failures = state.consecutive_failures, "agent errored out");
            state.status = AgentStatus::Errored;
        } else if matches!(state.status, AgentStatus::Busy) {
            state.status = AgentStatus::Available;
        }
    }

    /// Kinds currently in the given status.
    pub fn kinds_with_status(&self, status: AgentStatus) -> Vec<AgentKind> {
        self.agents
            .iter()
            .filter(|(_, s)| s.status == status)
            .map(|(&k, _)| k)
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pool() -> AgentPool {
        AgentPool::new(PoolConfig::default(), |_| 30.0)
    }

    /// Verifies selection prefers the higher-scored available kind.
    #[test]
    fn select_prefers_higher_score() {
        let mut p = pool();
        // claude: 1 success in 10s; codex: 1 success in 100s.
        p.record_success(AgentKind::Claude, Duration::from_secs(10));
        p.record_success(AgentKind::Codex, Duration::from_secs(100));
        p.record_failure(AgentKind::Gemini, ErrorCategory::Crash);
        p.record_failure(AgentKind::Gemini, ErrorCategory::Crash);
        p.record_failure(AgentKind::Gemini, ErrorCategory::Crash);

        let selection = p.select(Utc::now());
        assert_eq!(selection, Selection::Selected(AgentKind::Claude));
    }

    /// Verifies score ties break by the fixed fallback order.
    #[test]
    fn select_breaks_ties_by_fallback_order() {
        let mut p = pool();
        let selection = p.select(Utc::now());
        assert_eq!(selection, Selection::Selected(AgentKind::Claude));
    }

    /// Verifies all-rate-limited yields Wait with the earliest deadline.
    #[test]
    fn select_waits_when_all_rate_limited() {
        let mut p = pool();
        let now = Utc::now();
        p.mark_rate_limited(AgentKind::Claude, 30.0, now, "429");
        p.mark_rate_limited(AgentKind::Codex, 30.0, now, "429");
        p.mark_rate_limited(AgentKind::Gemini, 30.0, now, "429");

        match p.select(now) {
            Selection::Wait { until, .. } => {
                // gemini/codex share a 30 min cooldown; claude's table may differ.
                assert!(until > now);
            }
            other => panic!("expected Wait, got {other:?}"),
        }
    }

    /// Verifies a rate-limited kind becomes available once the deadline passes.
    #[test]
    fn rate_limit_expires_on_select() {
        let mut p = pool();
        let now = Utc::now();
        p.mark_rate_limited(AgentKind::Claude, 30.0, now, "429");
        p.mark_rate_limited(AgentKind::Codex, 30.0, now, "429");
        p.mark_rate_limited(AgentKind::Gemini, 30.0, now, "429");

        let later = now + chrono::Duration::minutes(31);
        assert_eq!(p.select(later), Selection::Selected(AgentKind::Claude));
    }

    /// Verifies Pause when every kind is disabled or errored.
    #[test]
    fn select_pauses_when_nothing_recoverable() {
        let mut p = pool();
        p.mark_disabled(AgentKind::Claude);
        p.mark_disabled(AgentKind::Codex);
        for _ in 0..3 {
            p.record_failure(AgentKind::Gemini, ErrorCategory::Crash);
        }

        assert!(matches!(p.select(Utc::now()), Selection::Pause { .. }));
    }

    /// Verifies busy kinds stay eligible when no kind is fully available.
    #[test]
    fn busy_kind_is_selectable_as_fallback() {
        let mut p = pool();
        p.mark_disabled(AgentKind::Codex);
        p.mark_disabled(AgentKind::Gemini);
        p.mark_busy(AgentKind::Claude);

        assert_eq!(p.select(Utc::now()), Selection::Selected(AgentKind::Claude));
    }

    /// Verifies success_rate always equals completed / (completed + failed).
    #[test]
    fn success_rate_tracks_totals() {
        let mut p = pool();
        p.record_success(AgentKind::Claude, Duration::from_secs(5));
        p.record_failure(AgentKind::Claude, ErrorCategory::Timeout);
        p.record_success(AgentKind::Claude, Duration::from_secs(15));

        let state = p.state(AgentKind::Claude);
        assert_eq!(state.total_completed, 2);
        assert_eq!(state.total_failed, 1);
        assert!((state.success_rate - 2.0 / 3.0).abs() < 1e-9);
        assert!((state.mean_duration_secs - 10.0).abs() < 1e-9);
    }

    /// Verifies consecutive failures flip a kind to errored at the threshold.
    #[test]
    fn consecutive_failures_error_out() {
        let mut p = pool();
        for _ in 0..3 {
            p.record_failure(AgentKind::Codex, ErrorCategory::Crash);
        }
        assert_eq!(p.state(AgentKind::Codex).status, AgentStatus::Errored);
    }

    /// Verifies the cooldown escalates with consecutive rate limits.
    #[test]
    fn cooldown_escalates_with_streak() {
        let mut p = pool();
        let now = Utc::now();
        p.mark_rate_limited(AgentKind::Claude, 30.0, now, "429");
        let first = p.state(AgentKind::Claude).available_at.expect("deadline");
        p.mark_rate_limited(AgentKind::Claude, 30.0, now, "429");
        let second = p.state(AgentKind::Claude).available_at.expect("deadline");
        assert!(second > first);
    }
}
