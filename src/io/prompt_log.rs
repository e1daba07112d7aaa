//! Prompt capture under `.conductor/prompts/`.
//!
//! For every agent invocation three files share a timestamped prefix:
//! `<kind>-<ts>-prompt.txt` (exact prompt), `<kind>-<ts>-raw.txt` (raw
//! subprocess output), and `<kind>-<ts>-response.txt` (extracted response).
//! Prompt reproducibility is part of the contract with operators, so these
//! are product output, written unconditionally.

use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use chrono::Utc;

use crate::core::pool::AgentKind;

/// Paths of one recorded invocation.
#[derive(Debug, Clone)]
pub struct PromptCapture {
    pub prompt_path: PathBuf,
    pub raw_path: PathBuf,
    pub response_path: PathBuf,
}

/// Persist the prompt/raw/response triple for one agent invocation.
pub fn record_invocation(
    prompts_dir: &Path,
    kind: AgentKind,
    prompt: &str,
    raw: &str,
    response: &str,
) -> Result<PromptCapture> {
    fs::create_dir_all(prompts_dir)
        .with_context(|| format!("create prompts dir {}", prompts_dir.display()))?;
    let ts = Utc::now().format("%Y%m%dT%H%M%S%3f");
    let prefix = format!("{}-{}", kind.as_str(), ts);

    let capture = PromptCapture {
        prompt_path: prompts_dir.join(format!("{prefix}-prompt.txt")),
        raw_path: prompts_dir.join(format!("{prefix}-raw.txt")),
        response_path: prompts_dir.join(format!("{prefix}-response.txt")),
    };
    write_text(&capture.prompt_path, prompt)?;
    write_text(&capture.raw_path, raw)?;
    write_text(&capture.response_path, response)?;
    Ok(capture)
}

fn write_text(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).with_context(|| format!("write {}", path.display()))
}
