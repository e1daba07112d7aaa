//! Persistence helpers: atomic pretty-printed JSON and the operator log.
//!
//! All state files are UTF-8 pretty JSON with a trailing newline, written via
//! temp file + rename so readers never observe a partial write.

use std::fs;
use std::io::Write;
use std::path::Path;

use anyhow::{Context, Result};
use chrono::Utc;
use serde::Serialize;
use serde::de::DeserializeOwned;
use tracing::debug;

use crate::core::pool::AgentPool;
use crate::core::session::Session;
use crate::io::paths::StatePaths;

/// Serialize `value` to pretty JSON and atomically replace `path`.
pub fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let mut buf = serde_json::to_string_pretty(value).context("serialize json")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("json.tmp");
    fs::write(&tmp_path, &buf).with_context(|| format!("write temp {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace {}", path.display()))?;
    Ok(())
}

/// Read and deserialize a JSON file.
pub fn read_json<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let contents =
        fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    serde_json::from_str(&contents).with_context(|| format!("parse {}", path.display()))
}

pub fn load_session(paths: &StatePaths) -> Result<Session> {
    debug!(path = %paths.session_path.display(), "loading session");
    read_json(&paths.session_path)
}

pub fn write_session(paths: &StatePaths, session: &Session) -> Result<()> {
    debug!(session_id = %session.session_id, cycle = session.current_cycle, "writing session");
    write_json_atomic(&paths.session_path, session)
}

pub fn load_pool(paths: &StatePaths) -> Result<AgentPool> {
    read_json(&paths.agents_path)
}

pub fn write_pool(paths: &StatePaths, pool: &AgentPool) -> Result<()> {
    write_json_atomic(&paths.agents_path, pool)
}

/// Append a timestamped line to the operator log under `logs/`.
///
/// Product output, written unconditionally; the format is not a contract.
pub fn append_operator_log(paths: &StatePaths, line: &str) -> Result<()> {
    fs::create_dir_all(&paths.logs_dir)
        .with_context(|| format!("create {}", paths.logs_dir.display()))?;
    let path = paths.logs_dir.join("engine.log");
    let mut file = fs::OpenOptions::new()
        .create(true)
        .append(true)
        .open(&path)
        .with_context(|| format!("open {}", path.display()))?;
    writeln!(file, "{} {}", Utc::now().to_rfc3339(), line)
        .with_context(|| format!("append {}", path.display()))?;
    Ok(())
}
