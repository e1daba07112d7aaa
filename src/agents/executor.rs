//! Execution of a single agent invocation.
//!
//! The [`AgentInvoker`] trait decouples the engine from the actual agent
//! CLIs. The production implementation spawns the kind's subprocess with the
//! prompt on stdin, applies the per-kind extractor, and records the
//! prompt/raw/response capture triple. Tests use scripted invokers that
//! return predetermined results without spawning processes.

use std::path::PathBuf;
use std::time::{Duration, Instant};

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{debug, info, instrument, warn};

use crate::agents::command::build_command;
use crate::agents::extract::extract_output;
use crate::agents::resolve_binary;
use crate::core::pool::AgentKind;
use crate::io::config::ModelConfig;
use crate::io::process::run_command_with_timeout;
use crate::io::prompt_log::record_invocation;

/// Structured outcome of one subprocess run.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,
    /// Extracted agent response text.
    pub output: String,
    pub error: Option<String>,
    pub exit_code: Option<i32>,
    /// False when the kind's structured extractor fell back to raw output.
    /// A failure with an unparseable response classifies as invalid output.
    pub output_parsed: bool,
    #[serde(with = "duration_secs")]
    pub duration: Duration,
}

impl ExecutionResult {
    /// Result representing an engine-side failure to run the agent at all.
    pub fn internal_failure(message: String, duration: Duration) -> Self {
        Self {
            success: false,
            output: String::new(),
            error: Some(message),
            exit_code: None,
            output_parsed: true,
            duration,
        }
    }

    /// Output and error text combined, for classification.
    pub fn combined_text(&self) -> String {
        match &self.error {
            Some(error) if !error.is_empty() => format!("{}\n{}", self.output, error),
            _ => self.output.clone(),
        }
    }
}

mod duration_secs {
    use super::Duration;
    use serde::{Deserialize, Deserializer, Serialize, Serializer};

    pub fn serialize<S: Serializer>(value: &Duration, serializer: S) -> Result<S::Ok, S::Error> {
        value.as_secs_f64().serialize(serializer)
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<Duration, D::Error> {
        let secs = f64::deserialize(deserializer)?;
        Ok(Duration::from_secs_f64(secs))
    }
}

/// Parameters for one agent invocation.
#[derive(Debug, Clone)]
pub struct InvokeRequest {
    pub prompt: String,
    pub workdir: PathBuf,
    pub timeout: Duration,
    /// Short operator-facing label (task id, "planner", "judge").
    pub label: String,
}

/// Abstraction over agent execution backends.
pub trait AgentInvoker: Send + Sync {
    fn invoke(&self, kind: AgentKind, request: &InvokeRequest) -> Result<ExecutionResult>;
}

/// Invoker that spawns the kind's external CLI.
pub struct SubprocessInvoker {
    models: ModelConfig,
    prompts_dir: PathBuf,
    output_limit_bytes: usize,
}

impl SubprocessInvoker {
    pub fn new(models: ModelConfig, prompts_dir: PathBuf, output_limit_bytes: usize) -> Self {
        Self {
            models,
            prompts_dir,
            output_limit_bytes,
        }
    }
}

impl AgentInvoker for SubprocessInvoker {
    #[instrument(skip_all, fields(kind = %kind, label = %request.label, timeout_secs = request.timeout.as_secs()))]
    fn invoke(&self, kind: AgentKind, request: &InvokeRequest) -> Result<ExecutionResult> {
        info!(workdir = %request.workdir.display(), "starting agent");
        let binary = resolve_binary(kind);
        let cmd = build_command(kind, &binary, &self.models, &request.workdir);
        let started = Instant::now();

        let output = run_command_with_timeout(
            cmd,
            Some(request.prompt.as_bytes()),
            request.timeout,
            self.output_limit_bytes,
        )
        .with_context(|| format!("run {} agent", kind))?;
        let duration = started.elapsed();

        let raw_stdout = String::from_utf8_lossy(&output.stdout).to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).to_string();
        let (extracted, parsed) = extract_output(kind, &raw_stdout);

        if let Err(err) = record_invocation(
            &self.prompts_dir,
            kind,
            &request.prompt,
            &raw_stdout,
            &extracted,
        ) {
            warn!(error = %err, "failed to record prompt capture");
        }

        let success = !output.timed_out && output.status.success();
        let error = if output.timed_out {
            warn!(timeout_secs = request.timeout.as_secs(), "agent timed out");
            Some(format!(
                "agent timed out after {}s",
                request.timeout.as_secs()
            ))
        } else if !success {
            let tail: String = stderr.chars().take(2000).collect();
            Some(tail.trim().to_string())
        } else {
            None
        };

        debug!(
            success,
            exit_code = ?output.effective_exit_code(),
            duration_secs = duration.as_secs_f64(),
            "agent finished"
        );
        Ok(ExecutionResult {
            success,
            output: extracted,
            error,
            exit_code: output.effective_exit_code(),
            output_parsed: parsed,
            duration,
        })
    }
}
