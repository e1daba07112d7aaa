//! Judge runner: asks an agent whether the loop should continue.
//!
//! The judge's output is strict JSON; when it fails to parse (or the agent
//! cannot run at all) a deterministic heuristic decides instead, so every
//! cycle always ends with exactly one decision.

use std::sync::LazyLock;

use serde::{Deserialize, Serialize};
use tracing::{debug, instrument, warn};

use crate::agents::manager::ExecutorManager;
use crate::engine::prompt::{CycleStats, PromptPack, TaskSummaries};

/// The judge's verdict for one cycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Decision {
    Continue,
    Complete,
    Abort,
}

/// Parsed judge output.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Judgement {
    pub decision: Decision,
    pub reasoning: String,
    #[serde(default)]
    pub progress_percent: i64,
    #[serde(default)]
    pub issues: Vec<String>,
    #[serde(default)]
    pub recommendations: Vec<String>,
}

static JSON_FENCE_RE: LazyLock<regex::Regex> =
    LazyLock::new(|| regex::Regex::new(r"(?s)```json\s*(.*?)```").expect("json fence regex"));
static DECISION_OBJECT_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#"(?s)\{.*"decision".*\}"#).expect("decision object regex")
});

/// Parse the judge's output as strict JSON, tolerating fenced wrapping.
pub fn parse_judgement(output: &str) -> Option<Judgement> {
    let mut candidates = vec![output.trim().to_string()];
    if let Some(caps) = JSON_FENCE_RE.captures(output) {
        candidates.push(caps[1].to_string());
    }
    if let Some(m) = DECISION_OBJECT_RE.find(output) {
        candidates.push(m.as_str().to_string());
    }
    for candidate in candidates {
        if let Ok(judgement) = serde_json::from_str::<Judgement>(&candidate) {
            return Some(judgement);
        }
    }
    None
}

/// Deterministic decision when no parseable judge output exists.
///
/// Total: every (cycle, stats) input maps to exactly one decision.
pub fn heuristic_decision(current_cycle: u32, max_cycles: u32, stats: &CycleStats) -> Judgement {
    let (decision, reasoning) = if current_cycle >= max_cycles {
        (Decision::Abort, "cycle budget exhausted".to_string())
    } else if stats.total > 0
        && stats.completed + stats.failed == stats.total
        && stats.failed == 0
        && stats.completed >= 1
    {
        (
            Decision::Complete,
            "all tasks terminal, none failed".to_string(),
        )
    } else if stats.total > 0 && (stats.failed as f64) / (stats.total as f64) > 0.5 {
        (
            Decision::Abort,
            "more than half of all tasks failed".to_string(),
        )
    } else {
        (Decision::Continue, "work remains".to_string())
    };

    let progress = if stats.total == 0 {
        0
    } else {
        (stats.completed * 100 / stats.total) as i64
    };

    Judgement {
        decision,
        reasoning: format!("heuristic: {reasoning}"),
        progress_percent: progress,
        issues: Vec::new(),
        recommendations: Vec::new(),
    }
}

/// Inputs for one judge run.
#[derive(Debug, Clone)]
pub struct JudgeContext<'a> {
    pub goal: &'a str,
    pub cycle: u32,
    pub max_cycles: u32,
    pub stats: CycleStats,
    pub summaries: &'a TaskSummaries,
}

/// Runs the judge agent with a heuristic fallback.
pub struct JudgeRunner<'a> {
    pub manager: &'a ExecutorManager,
    pub prompts: &'a PromptPack,
}

impl<'a> JudgeRunner<'a> {
    /// Ask the judge for a decision. Never fails: execution or parse failures
    /// fall back to the heuristic.
    #[instrument(skip_all, fields(cycle = ctx.cycle))]
    pub fn run(&self, ctx: &JudgeContext<'_>) -> Judgement {
        let prompt = self.prompts.render_judge(
            ctx.goal,
            ctx.cycle,
            ctx.max_cycles,
            &ctx.stats,
            ctx.summaries,
        );
        match self.manager.execute_raw(&prompt, "judge") {
            Ok((result, kind)) => match parse_judgement(&result.output) {
                Some(judgement) => {
                    debug!(kind = %kind, decision = ?judgement.decision, "judge decided");
                    judgement
                }
                None => {
                    warn!(kind = %kind, "judge output did not parse; using heuristic");
                    heuristic_decision(ctx.cycle, ctx.max_cycles, &ctx.stats)
                }
            },
            Err(err) => {
                warn!(error = %format!("{err:#}"), "judge execution failed; using heuristic");
                heuristic_decision(ctx.cycle, ctx.max_cycles, &ctx.stats)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stats(completed: usize, failed: usize, pending: usize) -> CycleStats {
        CycleStats {
            completed,
            failed,
            pending,
            total: completed + failed + pending,
        }
    }

    #[test]
    fn parses_strict_judgement() {
        let output = r#"{"decision": "COMPLETE", "reasoning": "goal met",
            "progress_percent": 100, "issues": [], "recommendations": []}"#;
        let judgement = parse_judgement(output).expect("judgement");
        assert_eq!(judgement.decision, Decision::Complete);
        assert_eq!(judgement.progress_percent, 100);
    }

    #[test]
    fn parses_fenced_judgement() {
        let output = "Verdict:\n```json\n{\"decision\": \"ABORT\", \"reasoning\": \"stuck\"}\n```";
        let judgement = parse_judgement(output).expect("judgement");
        assert_eq!(judgement.decision, Decision::Abort);
    }

    #[test]
    fn unparseable_output_yields_none() {
        assert!(parse_judgement("looks good to me, carry on").is_none());
    }

    /// Cycle exhaustion aborts regardless of stats.
    #[test]
    fn heuristic_aborts_on_cycle_exhaustion() {
        let judgement = heuristic_decision(20, 20, &stats(5, 0, 0));
        assert_eq!(judgement.decision, Decision::Abort);
    }

    /// All terminal, none failed, at least one completed → complete.
    #[test]
    fn heuristic_completes_when_all_terminal_and_clean() {
        let judgement = heuristic_decision(2, 20, &stats(3, 0, 0));
        assert_eq!(judgement.decision, Decision::Complete);
        assert_eq!(judgement.progress_percent, 100);
    }

    /// Majority failures abort.
    #[test]
    fn heuristic_aborts_on_failure_majority() {
        let judgement = heuristic_decision(2, 20, &stats(1, 3, 0));
        assert_eq!(judgement.decision, Decision::Abort);
    }

    /// Otherwise continue; zero tasks is a continue, not a complete.
    #[test]
    fn heuristic_continues_otherwise() {
        assert_eq!(
            heuristic_decision(2, 20, &stats(1, 1, 2)).decision,
            Decision::Continue
        );
        assert_eq!(
            heuristic_decision(0, 20, &stats(0, 0, 0)).decision,
            Decision::Continue
        );
    }

    /// The heuristic is total: exactly one decision for every input.
    #[test]
    fn heuristic_is_total_over_a_grid() {
        for cycle in 0..4u32 {
            for completed in 0..4usize {
                for failed in 0..4usize {
                    for pending in 0..4usize {
                        let s = stats(completed, failed, pending);
                        let judgement = heuristic_decision(cycle, 3, &s);
                        // Exactly one decision is always produced.
                        let _ = judgement.decision;
                    }
                }
            }
        }
    }
}
