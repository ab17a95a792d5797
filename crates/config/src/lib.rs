//! Configuration loading, validation, and logging setup for Codeward.
//!
//! Loads configuration from `~/.codeward/config.toml` with environment
//! variable overrides. Every field has a default, so a missing file is not
//! an error. Validation runs once at load time.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.codeward/config.toml`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub agent: AgentSettings,

    #[serde(default)]
    pub context: ContextSettings,

    #[serde(default)]
    pub tools: ToolSettings,

    #[serde(default)]
    pub approval: ApprovalSettings,

    /// Extension servers keyed by name
    #[serde(default)]
    pub extensions: BTreeMap<String, ExtensionServerConfig>,

    #[serde(default)]
    pub storage: StorageSettings,

    #[serde(default)]
    pub logging: LoggingConfig,
}

// --- Agent loop ---

/// What happens to the calls of the final iteration when the cap is reached.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum IterationCapPolicy {
    /// Dispatch the final iteration's calls, then stop.
    #[default]
    FinishInFlight,
    /// Resolve the final iteration's calls as failed without running them.
    SkipRemaining,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentSettings {
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Issue one reasoning-only call before the loop
    #[serde(default)]
    pub thinking: bool,

    #[serde(default = "default_temperature")]
    pub temperature: f32,

    #[serde(default = "default_completion_timeout")]
    pub completion_timeout_secs: u64,

    #[serde(default)]
    pub cap_policy: IterationCapPolicy,

    #[serde(default = "default_system_prompt")]
    pub system_prompt: String,
}

fn default_max_iterations() -> usize {
    10
}
fn default_temperature() -> f32 {
    0.2
}
fn default_completion_timeout() -> u64 {
    120
}
fn default_system_prompt() -> String {
    "You are Codeward, a coding assistant working inside the user's repository. \
     Use the available tools to inspect and change files. Prefer reading before writing, \
     and explain what you changed when you are done."
        .to_string()
}

impl Default for AgentSettings {
    fn default() -> Self {
        Self {
            max_iterations: default_max_iterations(),
            thinking: false,
            temperature: default_temperature(),
            completion_timeout_secs: default_completion_timeout(),
            cap_policy: IterationCapPolicy::default(),
            system_prompt: default_system_prompt(),
        }
    }
}

// --- Context budget ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ContextSettings {
    /// Token budget for one request payload
    #[serde(default = "default_token_budget")]
    pub token_budget: usize,

    /// Fraction of the budget at which compaction runs
    #[serde(default = "default_compaction_threshold")]
    pub compaction_threshold: f32,

    /// Upper bound on messages kept verbatim by compaction
    #[serde(default = "default_keep_recent")]
    pub keep_recent_max: usize,

    /// Maximum strategies rendered into a payload
    #[serde(default = "default_strategy_cap")]
    pub strategy_cap: usize,

    /// Minimum confidence for reflection to emit a strategy
    #[serde(default = "default_reflection_confidence")]
    pub reflection_confidence: f32,
}

fn default_token_budget() -> usize {
    100_000
}
fn default_compaction_threshold() -> f32 {
    0.8
}
fn default_keep_recent() -> usize {
    10
}
fn default_strategy_cap() -> usize {
    10
}
fn default_reflection_confidence() -> f32 {
    0.6
}

impl Default for ContextSettings {
    fn default() -> Self {
        Self {
            token_budget: default_token_budget(),
            compaction_threshold: default_compaction_threshold(),
            keep_recent_max: default_keep_recent(),
            strategy_cap: default_strategy_cap(),
            reflection_confidence: default_reflection_confidence(),
        }
    }
}

// --- Tools ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ToolSettings {
    #[serde(default = "default_tool_timeout")]
    pub timeout_secs: u64,

    /// Outputs longer than this are truncated before entering the session
    #[serde(default = "default_max_output_chars")]
    pub max_output_chars: usize,

    /// Roots file tools may touch; empty means the current directory
    #[serde(default)]
    pub allowed_roots: Vec<PathBuf>,

    #[serde(default = "default_forbidden_paths")]
    pub forbidden_paths: Vec<PathBuf>,

    /// Programs `run_command` may start; empty allows any
    #[serde(default)]
    pub allowed_commands: Vec<String>,
}

fn default_tool_timeout() -> u64 {
    30
}
fn default_max_output_chars() -> usize {
    30_000
}
fn default_forbidden_paths() -> Vec<PathBuf> {
    ["/etc", "/root", "/proc", "/sys", "/boot"]
        .iter()
        .map(PathBuf::from)
        .collect()
}

impl Default for ToolSettings {
    fn default() -> Self {
        Self {
            timeout_secs: default_tool_timeout(),
            max_output_chars: default_max_output_chars(),
            allowed_roots: Vec::new(),
            forbidden_paths: default_forbidden_paths(),
            allowed_commands: Vec::new(),
        }
    }
}

// --- Approval ---

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ApprovalSettings {
    /// Approve everything without prompting
    #[serde(default)]
    pub auto_approve_all: bool,

    /// Rules installed at startup
    #[serde(default)]
    pub rules: Vec<RuleConfig>,
}

/// A pre-configured auto-approve rule.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RuleConfig {
    pub tool: String,

    /// One of `tool`, `exact`, `glob`
    #[serde(default = "default_rule_kind")]
    pub kind: String,

    /// Argument the rule inspects; defaults to the tool's primary argument
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub argument: Option<String>,

    /// Exact value or glob pattern (unused for `tool`)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub pattern: Option<String>,
}

fn default_rule_kind() -> String {
    "tool".to_string()
}

pub const RULE_KINDS: [&str; 3] = ["tool", "exact", "glob"];

// --- Extensions ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExtensionServerConfig {
    pub command: String,

    #[serde(default)]
    pub args: Vec<String>,

    #[serde(default)]
    pub env: BTreeMap<String, String>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cwd: Option<PathBuf>,

    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_call_timeout_ms")]
    pub call_timeout_ms: u64,
}

fn default_true() -> bool {
    true
}
fn default_call_timeout_ms() -> u64 {
    30_000
}

impl ExtensionServerConfig {
    pub fn new(command: impl Into<String>) -> Self {
        Self {
            command: command.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
            cwd: None,
            enabled: true,
            call_timeout_ms: default_call_timeout_ms(),
        }
    }
}

// --- Storage ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StorageSettings {
    #[serde(default = "default_session_dir")]
    pub session_dir: PathBuf,
}

fn default_session_dir() -> PathBuf {
    AppConfig::config_dir().join("sessions")
}

impl Default for StorageSettings {
    fn default() -> Self {
        Self {
            session_dir: default_session_dir(),
        }
    }
}

// --- Logging ---

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LoggingConfig {
    /// Default filter when `RUST_LOG` is unset
    #[serde(default = "default_log_level")]
    pub level: String,

    #[serde(default)]
    pub json: bool,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            json: false,
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.codeward/config.toml),
    /// then apply environment overrides:
    /// - `CODEWARD_MAX_ITERATIONS`
    /// - `CODEWARD_TOKEN_BUDGET`
    /// - `CODEWARD_SESSION_DIR`
    /// - `CODEWARD_LOG`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_env_overrides(|key| std::env::var(key).ok())?;
        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a specific file path.
    pub fn load_from(path: &Path) -> Result<Self, ConfigError> {
        if !path.exists() {
            tracing::info!("No config file found at {}, using defaults", path.display());
            return Ok(Self::default());
        }

        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        let config: Self = toml::from_str(&content).map_err(|e| ConfigError::ParseError {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;

        config.validate()?;
        Ok(config)
    }

    /// Apply overrides from a variable lookup (the process environment in `load`).
    pub fn apply_env_overrides<F>(&mut self, lookup: F) -> Result<(), ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(v) = lookup("CODEWARD_MAX_ITERATIONS") {
            self.agent.max_iterations = parse_env("CODEWARD_MAX_ITERATIONS", &v)?;
        }
        if let Some(v) = lookup("CODEWARD_TOKEN_BUDGET") {
            self.context.token_budget = parse_env("CODEWARD_TOKEN_BUDGET", &v)?;
        }
        if let Some(v) = lookup("CODEWARD_SESSION_DIR") {
            self.storage.session_dir = PathBuf::from(v);
        }
        if let Some(v) = lookup("CODEWARD_LOG") {
            self.logging.level = v;
        }
        Ok(())
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".codeward")
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.agent.max_iterations == 0 {
            return Err(ConfigError::ValidationError(
                "agent.max_iterations must be at least 1".into(),
            ));
        }
        if !(0.0..=2.0).contains(&self.agent.temperature) {
            return Err(ConfigError::ValidationError(
                "agent.temperature must be between 0.0 and 2.0".into(),
            ));
        }
        if self.context.token_budget == 0 {
            return Err(ConfigError::ValidationError(
                "context.token_budget must be greater than 0".into(),
            ));
        }
        let threshold = self.context.compaction_threshold;
        if threshold <= 0.0 || threshold > 1.0 {
            return Err(ConfigError::ValidationError(
                "context.compaction_threshold must be in (0, 1]".into(),
            ));
        }
        if !(0.0..=1.0).contains(&self.context.reflection_confidence) {
            return Err(ConfigError::ValidationError(
                "context.reflection_confidence must be between 0.0 and 1.0".into(),
            ));
        }
        for rule in &self.approval.rules {
            if !RULE_KINDS.contains(&rule.kind.as_str()) {
                return Err(ConfigError::ValidationError(format!(
                    "approval rule for '{}' has unknown kind '{}'",
                    rule.tool, rule.kind
                )));
            }
            if rule.kind != "tool" && rule.pattern.is_none() {
                return Err(ConfigError::ValidationError(format!(
                    "approval rule for '{}' of kind '{}' needs a pattern",
                    rule.tool, rule.kind
                )));
            }
        }
        for (name, server) in &self.extensions {
            if name.is_empty() || name.contains("__") {
                return Err(ConfigError::ValidationError(format!(
                    "extension server name '{name}' must be non-empty and must not contain '__'"
                )));
            }
            if server.command.trim().is_empty() {
                return Err(ConfigError::ValidationError(format!(
                    "extension server '{name}' has an empty command"
                )));
            }
        }
        Ok(())
    }

    /// Generate a default config TOML string.
    pub fn default_toml() -> String {
        toml::to_string_pretty(&Self::default()).unwrap_or_default()
    }
}

fn parse_env<T: std::str::FromStr>(key: &str, value: &str) -> Result<T, ConfigError> {
    value
        .trim()
        .parse()
        .map_err(|_| ConfigError::ValidationError(format!("{key} has invalid value '{value}'")))
}

/// Install the global tracing subscriber.
///
/// `RUST_LOG` wins over the configured level. Returns an error if a
/// subscriber is already installed.
pub fn init_tracing(logging: &LoggingConfig) -> Result<(), ConfigError> {
    use tracing_subscriber::EnvFilter;

    let filter = EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| EnvFilter::new(logging.level.as_str()));

    let result = if logging.json {
        tracing_subscriber::fmt()
            .json()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    } else {
        tracing_subscriber::fmt()
            .with_env_filter(filter)
            .with_target(false)
            .try_init()
    };
    result.map_err(|e| ConfigError::Logging(e.to_string()))
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
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),

    #[error("Failed to initialise logging: {0}")]
    Logging(String),
}
