//! Agent kinds: binary resolution, detection, and execution.

use std::path::PathBuf;
use std::process::Command;
use std::time::Duration;

use tracing::{debug, info};

use crate::core::pool::AgentKind;
use crate::io::process::run_command_with_timeout;

pub mod command;
pub mod executor;
pub mod extract;
pub mod manager;

/// Environment variable overriding the Claude binary location.
pub const CLAUDE_BIN_ENV: &str = "CONDUCTOR_CLAUDE_BIN";

const PROBE_TIMEOUT: Duration = Duration::from_secs(10);

/// Resolve the command used to invoke an agent kind.
///
/// Claude honors the env override first and falls back to the well-known
/// local install location when the PATH probe fails; the other kinds are
/// invoked by bare name from PATH.
pub fn resolve_binary(kind: AgentKind) -> String {
    if kind == AgentKind::Claude {
        if let Ok(path) = std::env::var(CLAUDE_BIN_ENV) {
            if !path.trim().is_empty() {
                return path;
            }
        }
    }
    kind.as_str().to_string()
}

fn well_known_fallback(kind: AgentKind) -> Option<PathBuf> {
    if kind != AgentKind::Claude {
        return None;
    }
    let home = std::env::var_os("HOME")?;
    let path = PathBuf::from(home).join(".claude").join("local").join("claude");
    path.exists().then_some(path)
}

fn probe(binary: &str) -> bool {
    let mut cmd = Command::new(binary);
    cmd.arg("--version");
    match run_command_with_timeout(cmd, None, PROBE_TIMEOUT, 4096) {
        Ok(output) => output.status.success(),
        Err(_) => false,
    }
}

/// Probe each kind's binary and return the kinds that answered.
///
/// Kinds not found here are moved to disabled in the pool by the manager.
pub fn detect_available() -> Vec<AgentKind> {
    let mut available = Vec::new();
    for kind in AgentKind::ALL {
        let binary = resolve_binary(kind);
        let found = if probe(&binary) {
            true
        } else if let Some(fallback) = well_known_fallback(kind) {
            debug!(kind = %kind, path = %fallback.display(), "probing well-known location");
            probe(&fallback.to_string_lossy())
        } else {
            false
        };
        if found {
            info!(kind = %kind, "agent detected");
            available.push(kind);
        } else {
            debug!(kind = %kind, "agent not found");
        }
    }
    available
}
