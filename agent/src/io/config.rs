//! Agent configuration stored in `autopentest.toml` at the workspace root.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use anyhow::{Context, Result, anyhow};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::core::planning::ContextWindow;

pub const CONFIG_FILE: &str = "autopentest.toml";

pub const ENV_APPROVAL: &str = "AUTOPENTEST_APPROVAL";
pub const ENV_COMMAND_TIMEOUT: &str = "AUTOPENTEST_COMMAND_TIMEOUT";
pub const ENV_MAX_ITERATIONS: &str = "AUTOPENTEST_MAX_ITERATIONS";

/// Agent configuration (TOML).
///
/// Missing fields take their defaults, and a missing file is the default
/// configuration. Environment overrides are applied on top by
/// [`AgentConfig::apply_env_overrides`].
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct AgentConfig {
    /// Ask the operator before running safe and caution commands.
    pub approval_enabled: bool,

    pub command_timeout_secs: u64,

    /// Upper bound on executed iterations per run.
    pub max_iterations: u32,

    /// Blocked or rejected proposals in a row before the run is abandoned.
    pub max_consecutive_rejections: u32,

    /// Iteration records shown to the planner.
    pub history_window: usize,

    /// Per-stream output bytes shown to the planner for each record.
    pub context_output_limit_bytes: usize,

    /// Per-stream output bytes kept in memory for each command.
    pub output_limit_bytes: usize,

    pub max_parallel: usize,

    /// Time between SIGTERM and SIGKILL when a command times out.
    pub kill_grace_ms: u64,

    /// External rule table replacing the built-in one.
    pub rules_path: Option<PathBuf>,

    pub planner: PlannerConfig,
    pub elevation: ElevationConfig,
    pub retention: RetentionConfig,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct PlannerConfig {
    /// Planner CLI argv; the prompt is written to its stdin.
    pub command: Vec<String>,
    pub timeout_secs: u64,
    pub protocol_retries: u32,
    pub transport_retries: u32,
    /// Initial transport retry delay; doubled on each retry.
    pub backoff_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct ElevationConfig {
    /// Environment variable holding the sudo password, read per call.
    pub credential_env: String,
    /// Extra variables removed from command and planner environments.
    pub scrub_env: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default)]
pub struct RetentionConfig {
    pub older_than_days: u32,
    pub keep_minimum: usize,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            approval_enabled: true,
            command_timeout_secs: 120,
            max_iterations: 15,
            max_consecutive_rejections: 5,
            history_window: 8,
            context_output_limit_bytes: 4000,
            output_limit_bytes: 1_000_000,
            max_parallel: 4,
            kill_grace_ms: 2000,
            rules_path: None,
            planner: PlannerConfig::default(),
            elevation: ElevationConfig::default(),
            retention: RetentionConfig::default(),
        }
    }
}

impl Default for PlannerConfig {
    fn default() -> Self {
        Self {
            command: vec!["codex".to_string(), "exec".to_string(), "-".to_string()],
            timeout_secs: 300,
            protocol_retries: 2,
            transport_retries: 3,
            backoff_ms: 500,
        }
    }
}

impl Default for ElevationConfig {
    fn default() -> Self {
        Self {
            credential_env: "AUTOPENTEST_SUDO_PASSWORD".to_string(),
            scrub_env: Vec::new(),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self {
            older_than_days: 30,
            keep_minimum: 5,
        }
    }
}

impl AgentConfig {
    pub fn validate(&self) -> Result<()> {
        if self.command_timeout_secs == 0 {
            return Err(anyhow!("command_timeout_secs must be > 0"));
        }
        if self.max_iterations == 0 {
            return Err(anyhow!("max_iterations must be > 0"));
        }
        if self.max_consecutive_rejections == 0 {
            return Err(anyhow!("max_consecutive_rejections must be > 0"));
        }
        if self.history_window == 0 {
            return Err(anyhow!("history_window must be > 0"));
        }
        if self.context_output_limit_bytes == 0 {
            return Err(anyhow!("context_output_limit_bytes must be > 0"));
        }
        if self.output_limit_bytes == 0 {
            return Err(anyhow!("output_limit_bytes must be > 0"));
        }
        if self.max_parallel == 0 {
            return Err(anyhow!("max_parallel must be > 0"));
        }
        if self.planner.command.is_empty() || self.planner.command[0].trim().is_empty() {
            return Err(anyhow!("planner.command must be a non-empty array"));
        }
        if self.planner.timeout_secs == 0 {
            return Err(anyhow!("planner.timeout_secs must be > 0"));
        }
        if self.elevation.credential_env.trim().is_empty() {
            return Err(anyhow!("elevation.credential_env must not be empty"));
        }
        Ok(())
    }

    /// Apply `AUTOPENTEST_*` overrides from `lookup` (normally `std::env::var`).
    pub fn apply_env_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<()> {
        if let Some(raw) = lookup(ENV_APPROVAL) {
            self.approval_enabled = parse_flag(&raw)
                .with_context(|| format!("parse {ENV_APPROVAL}={raw}"))?;
            debug!(approval_enabled = self.approval_enabled, "approval overridden from env");
        }
        if let Some(raw) = lookup(ENV_COMMAND_TIMEOUT) {
            self.command_timeout_secs = raw
                .trim()
                .parse()
                .with_context(|| format!("parse {ENV_COMMAND_TIMEOUT}={raw}"))?;
        }
        if let Some(raw) = lookup(ENV_MAX_ITERATIONS) {
            self.max_iterations = raw
                .trim()
                .parse()
                .with_context(|| format!("parse {ENV_MAX_ITERATIONS}={raw}"))?;
        }
        self.validate()
    }

    pub fn command_timeout(&self) -> Duration {
        Duration::from_secs(self.command_timeout_secs)
    }

    pub fn kill_grace(&self) -> Duration {
        Duration::from_millis(self.kill_grace_ms)
    }

    pub fn context_window(&self) -> ContextWindow {
        ContextWindow {
            max_records: self.history_window,
            output_limit_bytes: self.context_output_limit_bytes,
        }
    }

    /// Variables never passed to children: the credential plus `scrub_env`.
    pub fn scrubbed_env(&self) -> Vec<String> {
        let mut vars = vec![self.elevation.credential_env.clone()];
        for var in &self.elevation.scrub_env {
            if !vars.contains(var) {
                vars.push(var.clone());
            }
        }
        vars
    }
}

fn parse_flag(raw: &str) -> Result<bool> {
    match raw.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => Err(anyhow!("expected true/false, got '{other}'")),
    }
}

pub fn config_path(root: &Path) -> PathBuf {
    root.join(CONFIG_FILE)
}

/// Load config from a TOML file.
///
/// If the file is missing, returns `AgentConfig::default()`.
pub fn load_config(path: &Path) -> Result<AgentConfig> {
    if !path.exists() {
        let cfg = AgentConfig::default();
        cfg.validate()?;
        return Ok(cfg);
    }
    let contents = fs::read_to_string(path).with_context(|| format!("read {}", path.display()))?;
    let cfg: AgentConfig =
        toml::from_str(&contents).with_context(|| format!("parse {}", path.display()))?;
    cfg.validate()?;
    Ok(cfg)
}

/// Atomically write config to disk (temp file + rename).
pub fn write_config(path: &Path, cfg: &AgentConfig) -> Result<()> {
    cfg.validate()?;
    let mut buf = toml::to_string_pretty(cfg).context("serialize config toml")?;
    buf.push('\n');
    let parent = path
        .parent()
        .with_context(|| format!("config path missing parent {}", path.display()))?;
    fs::create_dir_all(parent).with_context(|| format!("create directory {}", parent.display()))?;
    let tmp_path = path.with_extension("toml.tmp");
    fs::write(&tmp_path, buf)
        .with_context(|| format!("write temp config {}", tmp_path.display()))?;
    fs::rename(&tmp_path, path).with_context(|| format!("replace config {}", path.display()))?;
    Ok(())
}
