//! Engine configuration stored under `.conductor/config.toml`.
//!
//! This file is intended to be edited by humans and must remain stable and
//! automatable. Missing fields default to sensible values; per-kind cooldowns
//! and model selections are configuration, not semantics.

use std::fs;
use std::path::Path;
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};

use crate::core::pool::AgentKind;

/// Engine configuration (TOML).
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum planner → workers → judge cycles before aborting.
    pub max_cycles: u32,

    /// Maximum concurrent workers in the worker stage.
    pub max_workers: usize,

    /// Wall-clock budget per worker agent call, in seconds.
    pub task_timeout_secs: u64,

    /// Wall-clock budget per cycle-level agent call (planner/judge), in seconds.
    pub cycle_timeout_secs: u64,

    /// Completed tasks since the last planner run that trigger a wakeup.
    pub wakeup_threshold: u32,

    /// Default attempt budget for newly created tasks.
    pub task_max_attempts: u32,

    /// Consecutive failures before an agent kind is taken out of rotation.
    pub max_consecutive_failures: u32,

    /// Minimum detected agent kinds required to start.
    pub min_available_agents: u32,

    /// Escalation factor applied to repeated rate-limit cooldowns.
    pub cooldown_multiplier: f64,

    /// Truncate captured agent output beyond this many bytes.
    pub output_limit_bytes: usize,

    pub cooldown_minutes: CooldownTable,

    pub models: ModelConfig,
}

/// Per-kind rate-limit cooldowns in minutes.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
#[serde(default)]
pub struct CooldownTable {
    pub claude: f64,
    pub codex: f64,
    pub gemini: f64,
}

impl CooldownTable {
    pub fn for_kind(&self, kind: AgentKind) -> f64 {
        match kind {
            AgentKind::Claude => self.claude,
            AgentKind::Codex => self.codex,
            AgentKind::Gemini => self.gemini,
        }
    }
}

impl Default for CooldownTable {
    fn default() -> Self {
        Self {
            claude: 45.0,
            codex: 30.0,
            gemini: 30.0,
        }
    }
}

/// Per-kind model and reasoning-level selections.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ModelConfig {
    pub claude_model: String,
    pub codex_model: String,
    pub codex_reasoning: String,
    pub gemini_model: String,
}

impl Default for ModelConfig {
    fn default() -> Self {
        ModelPreset::Default.models()
    }
}

/// Named presets fixing model selections across all kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ModelPreset {
    Fast,
    Default,
    Max,
}

impl ModelPreset {
    pub fn models(&self) -> ModelConfig {
        match self {
            ModelPreset::Fast => ModelConfig {
                claude_model: "haiku".to_string(),
                codex_model: "gpt-5-codex".to_string(),
                codex_reasoning: "low".to_string(),
                gemini_model: "gemini-2.5-flash".to_string(),
            },
            ModelPreset::Default => ModelConfig {
                claude_model: "sonnet".to_string(),
                codex_model: "gpt-5-codex".to_string(),
                codex_reasoning: "medium".to_string(),
                gemini_model: "gemini-2.5-pro".to_string(),
            },
            ModelPreset::Max => ModelConfig {
                claude_model: "opus".to_string(),
                codex_model: "gpt-5-codex".to_string(),
                codex_reasoning: "high".to_string(),
                gemini_model: "gemini-2.5-pro".to_string(),
            },
        }
    }
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_cycles: 20,
            max_workers: 3,
            task_timeout_secs: 300,
            cycle_timeout_secs: 600,
            wakeup_threshold: 3,
            task_max_attempts: 3,
            max_consecutive_failures: 3,
            min_available_agents: 1,
            cooldown_multiplier: 1.5,
            output_limit_bytes: 200_000,
            cooldown_minutes: CooldownTable::default(),
            models: ModelConfig::default(),
        }
    }
}

impl EngineConfig {
    pub fn validate(&self) -> Result<()> {
        if self.max_workers == 0 {
            return Err(anyhow!("max_workers must be > 0"));
        }
        if self.task_timeout_secs == 0 || self.cycle_timeout_secs == 0 {
            return Err(anyhow!("timeouts must be > 0"));
        }
        if self.wakeup_threshold == 0 {
            return Err(anyhow!("wakeup_threshold must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.cooldown_multiplier < 1.0 {
            return Err(anyhow!("cooldown_multiplier must be >= 1.0"));
        }
        Ok(())
    }

    /// Replace all model selections with a named preset.
    pub fn apply_preset(&mut self, preset: ModelPreset) {
        self.models = preset.models();
    }

    pub fn task_timeout(&self) -> Duration {
        Duration::from_secs(self.task_timeout_secs)
    }

    pub fn cycle_timeout(&self) -> Duration {
        Duration::from_secs(self.cycle_timeout_secs)
    }
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `EngineConfig::default()`.
pub fn load_config(path: &Path) -> Result<EngineConfig> {
    if !path.exists() {
        let cfg = EngineConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: EngineConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &EngineConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, &buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
