//! Configuration loading, validation, and management for Routewise.
//!
//! Loads configuration from `~/.routewise/config.toml` with environment
//! variable overrides. Validates all settings at startup.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// The root configuration structure.
///
/// Maps directly to `~/.routewise/config.toml`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    /// Conversation turns kept verbatim per session
    #[serde(default = "default_memory_window_size")]
    pub memory_window_size: usize,

    /// Turns kept after an overflow compresses the rest (default: half the window)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub memory_retain_recent: Option<usize>,

    /// Capability executions allowed per request
    #[serde(default = "default_max_iterations")]
    pub max_iterations: usize,

    /// Capabilities executed per request when auto-chaining
    #[serde(default = "default_max_chain_depth")]
    pub max_chain_depth: usize,

    #[serde(default = "default_request_timeout_ms")]
    pub request_timeout_ms: u64,

    #[serde(default = "default_capability_timeout_ms")]
    pub capability_timeout_ms: u64,

    #[serde(default = "default_true")]
    pub policy_enabled: bool,

    /// TOML file with `[[policies]]`; built-in defaults when absent
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub policy_file: Option<String>,

    #[serde(default = "default_true")]
    pub reflection_enabled: bool,

    /// Run post-answer reflection off the request path
    #[serde(default = "default_true")]
    pub reflection_async: bool,

    /// Wait before re-checking a throttled capability
    #[serde(default = "default_throttle_delay_ms")]
    pub throttle_delay_ms: u64,

    /// Wait before retrying a timed-out capability
    #[serde(default = "default_retry_backoff_ms")]
    pub retry_backoff_ms: u64,

    /// What a second concurrent request on a busy session does
    #[serde(default)]
    pub busy_policy: BusyPolicy,

    /// Past episodes injected into the enriched query
    #[serde(default = "default_episodic_recall_limit")]
    pub episodic_recall_limit: usize,

    /// Capability consulted when no learned route exists
    #[serde(default = "default_reasoning_capability")]
    pub reasoning_capability: String,

    /// Capability used to compress conversation and episodes
    #[serde(default = "default_summarizer_capability")]
    pub summarizer_capability: String,

    /// Persistence configuration
    #[serde(default)]
    pub storage: StorageConfig,

    /// Document search configuration
    #[serde(default)]
    pub documents: DocumentsConfig,
}

fn default_memory_window_size() -> usize {
    10
}
fn default_max_iterations() -> usize {
    3
}
fn default_max_chain_depth() -> usize {
    2
}
fn default_request_timeout_ms() -> u64 {
    120_000
}
fn default_capability_timeout_ms() -> u64 {
    30_000
}
fn default_throttle_delay_ms() -> u64 {
    1_000
}
fn default_retry_backoff_ms() -> u64 {
    250
}
fn default_episodic_recall_limit() -> usize {
    2
}
fn default_reasoning_capability() -> String {
    "reasoner".into()
}
fn default_summarizer_capability() -> String {
    "summarizer".into()
}
fn default_true() -> bool {
    true
}

/// Behaviour when a request arrives for a session that is already executing.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum BusyPolicy {
    /// Wait for the session slot, bounded by the request timeout
    #[default]
    Queue,
    /// Fail immediately with a busy error
    Reject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// "file" or "memory"
    #[serde(default = "default_storage_backend")]
    pub backend: String,

    /// Root directory for the file backend (default: ~/.routewise/data)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<String>,

    /// Violation records kept in memory by the policy engine
    #[serde(default = "default_violation_log_limit")]
    pub violation_log_limit: usize,
}

fn default_storage_backend() -> String {
    "file".into()
}
fn default_violation_log_limit() -> usize {
    1_000
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            backend: default_storage_backend(),
            data_dir: None,
            violation_log_limit: default_violation_log_limit(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DocumentsConfig {
    /// JSONL file of pre-chunked documents (`{"content", "metadata"}` per line)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub chunks_file: Option<String>,

    #[serde(default = "default_top_k")]
    pub top_k: usize,
}

fn default_top_k() -> usize {
    4
}

impl Default for DocumentsConfig {
    fn default() -> Self {
        Self {
            chunks_file: None,
            top_k: default_top_k(),
        }
    }
}

impl AppConfig {
    /// Load configuration from the default path (~/.routewise/config.toml).
    ///
    /// Environment variables override file values:
    /// - `ROUTEWISE_DATA_DIR`
    /// - `ROUTEWISE_POLICY_FILE`
    /// - `ROUTEWISE_POLICY_ENABLED`
    /// - `ROUTEWISE_REFLECTION_ASYNC`
    pub fn load() -> Result<Self, ConfigError> {
        let config_path = Self::config_dir().join("config.toml");
        let mut config = Self::load_from(&config_path)?;
        config.apply_overrides(|key| std::env::var(key).ok());
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

    /// Apply overrides from a key lookup (the process environment in `load`).
    pub fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(dir) = lookup("ROUTEWISE_DATA_DIR") {
            self.storage.data_dir = Some(dir);
        }
        if let Some(file) = lookup("ROUTEWISE_POLICY_FILE") {
            self.policy_file = Some(file);
        }
        if let Some(flag) = lookup("ROUTEWISE_POLICY_ENABLED").and_then(|v| parse_flag(&v)) {
            self.policy_enabled = flag;
        }
        if let Some(flag) = lookup("ROUTEWISE_REFLECTION_ASYNC").and_then(|v| parse_flag(&v)) {
            self.reflection_async = flag;
        }
    }

    /// Get the configuration directory path.
    pub fn config_dir() -> PathBuf {
        dirs_home().join(".routewise")
    }

    /// Directory used by the file storage backend.
    pub fn data_dir(&self) -> PathBuf {
        self.storage
            .data_dir
            .as_ref()
            .map(PathBuf::from)
            .unwrap_or_else(|| Self::config_dir().join("data"))
    }

    /// Turns retained after a conversation overflow.
    pub fn retain_recent(&self) -> usize {
        self.memory_retain_recent
            .unwrap_or(self.memory_window_size / 2)
    }

    /// Validate the configuration.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.memory_window_size < 2 {
            return Err(ConfigError::ValidationError(
                "memory_window_size must be at least 2".into(),
            ));
        }

        if self.retain_recent() >= self.memory_window_size {
            return Err(ConfigError::ValidationError(
                "memory_retain_recent must be smaller than memory_window_size".into(),
            ));
        }

        if self.max_iterations == 0 || self.max_chain_depth == 0 {
            return Err(ConfigError::ValidationError(
                "max_iterations and max_chain_depth must be > 0".into(),
            ));
        }

        if self.request_timeout_ms == 0 || self.capability_timeout_ms == 0 {
            return Err(ConfigError::ValidationError(
                "timeouts must be > 0".into(),
            ));
        }

        if self.capability_timeout_ms > self.request_timeout_ms {
            return Err(ConfigError::ValidationError(
                "capability_timeout_ms must not exceed request_timeout_ms".into(),
            ));
        }

        if !matches!(self.storage.backend.as_str(), "file" | "memory") {
            return Err(ConfigError::ValidationError(format!(
                "unknown storage backend '{}' (expected 'file' or 'memory')",
                self.storage.backend
            )));
        }

        Ok(())
    }

    /// Generate a default config TOML string (for `init` command).
    pub fn default_toml() -> String {
        let config = Self::default();
        toml::to_string_pretty(&config).unwrap_or_default()
    }
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            memory_window_size: default_memory_window_size(),
            memory_retain_recent: None,
            max_iterations: default_max_iterations(),
            max_chain_depth: default_max_chain_depth(),
            request_timeout_ms: default_request_timeout_ms(),
            capability_timeout_ms: default_capability_timeout_ms(),
            policy_enabled: true,
            policy_file: None,
            reflection_enabled: true,
            reflection_async: true,
            throttle_delay_ms: default_throttle_delay_ms(),
            retry_backoff_ms: default_retry_backoff_ms(),
            busy_policy: BusyPolicy::default(),
            episodic_recall_limit: default_episodic_recall_limit(),
            reasoning_capability: default_reasoning_capability(),
            summarizer_capability: default_summarizer_capability(),
            storage: StorageConfig::default(),
            documents: DocumentsConfig::default(),
        }
    }
}

fn parse_flag(value: &str) -> Option<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Some(true),
        "0" | "false" | "no" | "off" => Some(false),
        _ => None,
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
    ReadError { path: PathBuf, reason: String },

    #[error("Failed to parse config file at {path}: {reason}")]
    ParseError { path: PathBuf, reason: String },

    #[error("Configuration validation failed: {0}")]
    ValidationError(String),
}
