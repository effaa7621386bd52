//! Configuration loading and validation for ThinkLoop.
//!
//! Loads configuration from `~/.thinkloop/config.toml` with environment
//! variable overrides. Everything is validated once, at load time (or by
//! `AgentBuilder::build` for configs assembled in code); downstream code
//! consumes the typed sections without re-checking them.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.thinkloop/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSection,

    #[serde(default)]
    pub thinking: ThinkingSection,

    #[serde(default)]
    pub context: ContextSection,

    #[serde(default)]
    pub planning: PlanningSection,

    #[serde(default)]
    pub dispatch: DispatchSection,

    #[serde(default)]
    pub logging: LoggingSection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSection {
    /// Stable agent id; one is generated when the agent is built if absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    #[serde(default = "default_name")]
    pub name: String,

    #[serde(default = "default_model")]
    pub model: String,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    /// Max tokens per LLM completion
    #[serde(default = "default_completion_tokens")]
    pub max_tokens: u32,

    #[serde(default = "default_session")]
    pub default_session: String,
}

fn default_name() -> String {
    "thinkloop".into()
}
fn default_model() -> String {
    "gpt-4o-mini".into()
}
fn default_temperature() -> f32 {
    0.7
}
fn default_completion_tokens() -> u32 {
    4096
}
fn default_session() -> String {
    "default".into()
}

impl Default for AgentSection {
    fn default() -> Self {
        Self {
            id: None,
            name: default_name(),
            model: default_model(),
            temperature: default_temperature(),
            max_tokens: default_completion_tokens(),
            default_session: default_session(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ThinkingSection {
    #[serde(default = "default_max_steps")]
    pub max_steps: u32,

    #[serde(default)]
    pub enable_reflection: bool,

    /// Dispatch multiple actions proposed in one step concurrently
    #[serde(default)]
    pub enable_parallel_tools: bool,

    /// Store each completed chat turn when a memory backend is attached
    #[serde(default = "default_true")]
    pub persist_turns: bool,
}

fn default_max_steps() -> u32 {
    10
}
fn default_true() -> bool {
    true
}

impl Default for ThinkingSection {
    fn default() -> Self {
        Self {
            max_steps: default_max_steps(),
            enable_reflection: false,
            enable_parallel_tools: false,
            persist_turns: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSection {
    /// Configured context limit in estimated tokens
    #[serde(default = "default_context_tokens")]
    pub max_tokens: usize,

    /// Headroom left for the model's completion
    #[serde(default = "default_reserved_tokens")]
    pub reserved_tokens: usize,

    #[serde(default = "default_chars_per_token")]
    pub chars_per_token: usize,
}

fn default_context_tokens() -> usize {
    128_000
}
fn default_reserved_tokens() -> usize {
    4096
}
fn default_chars_per_token() -> usize {
    4
}

impl Default for ContextSection {
    fn default() -> Self {
        Self {
            max_tokens: default_context_tokens(),
            reserved_tokens: default_reserved_tokens(),
            chars_per_token: default_chars_per_token(),
        }
    }
}

impl ContextSection {
    /// `max_tokens - reserved_tokens`.
    pub fn budget(&self) -> usize {
        self.max_tokens.saturating_sub(self.reserved_tokens)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PlanningSection {
    /// Whole-plan re-executions allowed after an adjustment; 0 disables them
    #[serde(default = "default_max_adjustments")]
    pub max_adjustments: u32,
}

fn default_max_adjustments() -> u32 {
    1
}

impl Default for PlanningSection {
    fn default() -> Self {
        Self {
            max_adjustments: default_max_adjustments(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DispatchSection {
    /// Invocation records kept by the dispatcher
    #[serde(default = "default_history_limit")]
    pub history_limit: usize,
}

fn default_history_limit() -> usize {
    100
}

impl Default for DispatchSection {
    fn default() -> Self {
        Self {
            history_limit: default_history_limit(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingSection {
    /// `EnvFilter` directive, e.g. `info` or `thinkloop_agent=debug`
    #[serde(default = "default_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_level() -> String {
    "info".into()
}

impl Default for LoggingSection {
    fn default() -> Self {
        Self {
            level: default_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.thinkloop/config.toml),
    /// then apply environment overrides:
    /// - `THINKLOOP_MODEL`
    /// - `THINKLOOP_MAX_STEPS`
    /// - `THINKLOOP_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let mut config = Self::load_from(&Self::config_path())?;
        config.apply_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::Read {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config = Self::from_toml(&content).map_err(|e| match e {
            ConfigError::Parse { reason, .. } => ConfigError::Parse {
                path: path.to_path_buf(),
                reason,
            },
            other => other,
        })?;

        tracing::debug!(path = %path.display(), "Loaded config");
        Ok(config)
    }

    /// Parse and validate a TOML document.
    pub fn from_toml(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content).map_err(|e| ConfigError::Parse {
            path: PathBuf::new(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from `lookup` (the process environment in [`load`](Self::load)).
    pub fn apply_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(model) = lookup("THINKLOOP_MODEL") {
            self.agent.model = model;
        }

        if let Some(steps) = lookup("THINKLOOP_MAX_STEPS") {
            self.thinking.max_steps = steps.trim().parse().map_err(|_| {
                ConfigError::Validation(format!("THINKLOOP_MAX_STEPS must be a positive integer, got '{steps}'"))
            })?;
        }

        if let Some(level) = lookup("THINKLOOP_LOG") {
            self.logging.level = level;
        }

        Ok(())
    }

    pub fn config_dir() -> PathBuf {
        dirs_home().join(".thinkloop")
    }

    pub fn config_path() -> PathBuf {
        Self::config_dir().join("config.toml")
    }

    /// Check every section's constraints.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(ConfigError::Validation(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }

        if self.agent.model.trim().is_empty() {
            return Err(ConfigError::Validation("agent.model must not be empty".into()));
        }

        if self.agent.default_session.trim().is_empty() {
            return Err(ConfigError::Validation("agent.default_session must not be empty".into()));
        }

        if self.thinking.max_steps == 0 {
            return Err(ConfigError::Validation("thinking.max_steps must be at least 1".into()));
        }

        if self.context.reserved_tokens >= self.context.max_tokens {
            return Err(ConfigError::Validation(format!(
                "context.reserved_tokens ({}) must be less than context.max_tokens ({})",
                self.context.reserved_tokens, self.context.max_tokens
            )));
        }

        if self.context.chars_per_token == 0 {
            return Err(ConfigError::Validation("context.chars_per_token must be at least 1".into()));
        }

        if self.dispatch.history_limit == 0 {
            return Err(ConfigError::Validation("dispatch.history_limit must be at least 1".into()));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `config init`).
    pub fn default_toml() -> Result<String, ConfigError> {
        Self::default().to_toml()
    }

    pub fn to_toml(&self) -> Result<String, ConfigError> {
        toml::to_string_pretty(self).map_err(|e| ConfigError::Validation(e.to_string()))
    }

    /// Write the default config to `path` unless a file is already there.
    /// Returns whether a file was written.
    pub fn write_default(path: &Path) -> Result<bool, ConfigError> {
        if path.exists() {
            return Ok(false);
        }
        let write_err = |e: std::io::Error| ConfigError::Write {
            path: path.to_path_buf(),
            reason: e.to_string(),
        };
        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(write_err)?;
        }
        std::fs::write(path, Self::default_toml()?).map_err(write_err)?;
        tracing::info!(path = %path.display(), "Wrote default config");
        Ok(true)
    }
}

/// Get the user's home directory.
fn dirs_home() -> PathBuf {
    #[cfg(target_os = "windows")]
    {
        std::env::var("USERPROFILE")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("C:\\Users\\Default"))
    }
    #[cfg(not(target_os = "windows"))]
    {
        std::env::var("HOME")
            .map(PathBuf::from)
            .unwrap_or_else(|_| PathBuf::from("/tmp"))
    }
}

/// Configuration errors.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file at {path}: {reason}")]
    Read { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    Parse { path: PathBuf, reason: String },

    #[error("Failed to write config file at {path}: {reason}")]
    Write { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    Validation(String),
}

impl From<ConfigError> for thinkloop_core::Error {
    fn from(err: ConfigError) -> Self {
        thinkloop_core::Error::Config {
            message: err.to_string(),
        }
    }
}
