//! Per-kind output extraction and worker completion detection.
//!
//! Each agent kind has its own output schema; the extractor variants are a
//! fixed set selected by kind. On parse failure every variant falls back to
//! the raw concatenation with a warning, so a misbehaving agent degrades to
//! keyword-based completion detection instead of failing the task outright.

use std::sync::LazyLock;

use serde_json::Value;
use tracing::warn;

use crate::core::pool::AgentKind;

/// Extract the agent's response text from raw stdout.
///
/// Returns the extracted text and whether structured parsing succeeded.
pub fn extract_output(kind: AgentKind, raw: &str) -> (String, bool) {
    let extracted = match kind {
        AgentKind::Claude => extract_result_envelope(raw),
        AgentKind::Codex => extract_item_stream(raw),
        AgentKind::Gemini => extract_assistant_stream(raw),
    };
    match extracted {
        Some(text) => (text, true),
        None => {
            warn!(kind = %kind, "structured output parse failed, using raw output");
            (raw.trim().to_string(), false)
        }
    }
}

/// Claude: a single JSON envelope `{type: "result", result: string}`.
fn extract_result_envelope(raw: &str) -> Option<String> {
    let value: Value = serde_json::from_str(raw.trim()).ok()?;
    if value.get("type").and_then(Value::as_str) != Some("result") {
        return None;
    }
    value
        .get("result")
        .and_then(Value::as_str)
        .map(str::to_string)
}

/// Codex: a JSONL stream; keep records where `type == "item.completed"` and
/// `item.type == "agent_message"`.
fn extract_item_stream(raw: &str) -> Option<String> {
    let mut messages = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("type").and_then(Value::as_str) != Some("item.completed") {
            continue;
        }
        let Some(item) = value.get("item") else {
            continue;
        };
        if item.get("type").and_then(Value::as_str) != Some("agent_message") {
            continue;
        }
        if let Some(text) = item.get("text").and_then(Value::as_str) {
            messages.push(text.to_string());
        }
    }
    if messages.is_empty() {
        return None;
    }
    Some(messages.join("\n"))
}

/// Gemini: a JSONL stream of messages; keep those with `role == "assistant"`.
fn extract_assistant_stream(raw: &str) -> Option<String> {
    let mut messages = Vec::new();
    for line in raw.lines() {
        let line = line.trim();
        if line.is_empty() {
            continue;
        }
        let Ok(value) = serde_json::from_str::<Value>(line) else {
            continue;
        };
        if value.get("role").and_then(Value::as_str) != Some("assistant") {
            continue;
        }
        let Some(content) = value.get("content") else {
            continue;
        };
        match content {
            Value::String(text) => messages.push(text.clone()),
            other => messages.push(other.to_string()),
        }
    }
    if messages.is_empty() {
        return None;
    }
    Some(messages.join("\n"))
}

/// Worker completion as declared (or implied) by the agent's output.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Completion {
    Completed,
    Failed,
    /// No declaration found; the exit code decides.
    Unknown,
}

static STATUS_RE: LazyLock<regex::Regex> = LazyLock::new(|| {
    regex::Regex::new(r#""status"\s*:\s*"(COMPLETED|FAILED)""#).expect("status regex")
});

const COMPLETION_KEYWORDS: [&str; 4] = ["completed", "successfully", "created file", "wrote file"];

/// Scan extracted worker output for a completion declaration.
///
/// Prefers an explicit `{"status": "COMPLETED"|"FAILED"}` object; falls back
/// to a keyword scan, then Unknown.
pub fn detect_completion(output: &str) -> Completion {
    if let Some(caps) = STATUS_RE.captures(output) {
        return match &caps[1] {
            "COMPLETED" => Completion::Completed,
            _ => Completion::Failed,
        };
    }
    let lower = output.to_lowercase();
    if COMPLETION_KEYWORDS.iter().any(|k| lower.contains(k)) {
        return Completion::Completed;
    }
    Completion::Unknown
}
