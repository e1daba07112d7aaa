//! Per-kind command-line construction.
//!
//! Every kind is invoked non-interactively with automatic approvals and
//! structured output, with the model selection passed as arguments from
//! configuration. The prompt itself always travels over stdin; no kind ever
//! receives it through a shell string.

use std::path::Path;
use std::process::Command;

use crate::core::pool::AgentKind;
use crate::io::config::ModelConfig;

/// Build the subprocess command for one agent kind.
pub fn build_command(
    kind: AgentKind,
    binary: &str,
    models: &ModelConfig,
    workdir: &Path,
) -> Command {
    let mut cmd = Command::new(binary);
    match kind {
        AgentKind::Claude => {
            cmd.arg("-p")
                .arg("--output-format")
                .arg("json")
                .arg("--dangerously-skip-permissions")
                .arg("--model")
                .arg(&models.claude_model);
        }
        AgentKind::Codex => {
            cmd.arg("exec")
                .arg("--json")
                .arg("--sandbox")
                .arg("danger-full-access")
                .arg("--skip-git-repo-check")
                .arg("-c")
                .arg(format!("model_reasoning_effort={}", models.codex_reasoning))
                .arg("-m")
                .arg(&models.codex_model)
                .arg("-");
        }
        AgentKind::Gemini => {
            cmd.arg("--yolo")
                .arg("--output-format")
                .arg("stream-json")
                .arg("-m")
                .arg(&models.gemini_model);
        }
    }
    cmd.current_dir(workdir);
    cmd
}
