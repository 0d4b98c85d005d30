//! TOML Configuration File Support
//!
//! Centralized configuration loading for the relay, supporting a TOML file at
//! `~/.config/chat-relay/relay.toml`.
//!
//! # Configuration Priority
//!
//! Values are loaded with the following priority (highest first):
//! 1. CLI arguments (via [`ConfigOverrides`])
//! 2. Environment variables
//! 3. TOML configuration file
//! 4. Default values
//!
//! # Example Configuration
//!
//! ```toml
//! [backend]
//! host = "localhost"
//! port = 11434
//! model = "qwen3"
//!
//! [reasoning]
//! enabled = true
//! start_marker = "<think>"
//! end_marker = "</think>"
//!
//! [pools]
//! outbound_threads = 4
//! storage_threads = 2
//!
//! [limits]
//! max_query_chars = 32768
//!
//! [storage]
//! data_dir = "/var/lib/chat-relay"
//!
//! [health]
//! warn_threshold = 5
//! critical_threshold = 20
//! window_secs = 300
//! ```

use std::path::PathBuf;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

// =============================================================================
// Error Types
// =============================================================================

/// Errors that can occur when loading configuration
#[derive(Debug, Error)]
pub enum ConfigError {
    /// Failed to read config file
    #[error("Failed to read config file at {path}: {source}")]
    ReadError {
        /// The path that was attempted
        path: PathBuf,
        /// The underlying IO error
        source: std::io::Error,
    },

    /// Failed to parse TOML
    #[error("Failed to parse TOML config: {0}")]
    ParseError(#[from] toml::de::Error),

    /// Invalid configuration value
    #[error("Invalid configuration: {0}")]
    ValidationError(String),
}

// =============================================================================
// Configuration Source Tracking
// =============================================================================

/// Tracks where a configuration value came from
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum ConfigSource {
    /// Value from command-line argument
    Cli,
    /// Value from environment variable
    Env,
    /// Value from TOML configuration file
    File,
    /// Default value
    Default,
}

impl std::fmt::Display for ConfigSource {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Cli => write!(f, "CLI"),
            Self::Env => write!(f, "environment"),
            Self::File => write!(f, "config file"),
            Self::Default => write!(f, "default"),
        }
    }
}

// =============================================================================
// Resolved Configuration Sections
// =============================================================================

/// Model backend connection settings
#[derive(Clone, Debug, PartialEq)]
pub struct BackendConfig {
    /// Ollama host address
    pub host: String,
    /// Ollama port number
    pub port: u16,
    /// Model to query
    pub model: String,
    /// Sampling temperature (backend default when unset)
    pub temperature: Option<f32>,
    /// System prompt prepended to every query
    pub system_prompt: Option<String>,
    /// Connection timeout for the backend, in seconds
    pub connect_timeout_secs: u64,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            host: "localhost".to_string(),
            port: 11434,
            model: "llama3.2".to_string(),
            temperature: None,
            system_prompt: None,
            connect_timeout_secs: 10,
        }
    }
}

/// Reasoning markup handling
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ReasoningConfig {
    /// Whether reasoning segments are stripped
    pub enabled: bool,
    /// Token opening a reasoning segment
    pub start_marker: String,
    /// Token closing a reasoning segment
    pub end_marker: String,
}

impl Default for ReasoningConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_marker: "<think>".to_string(),
            end_marker: "</think>".to_string(),
        }
    }
}

impl ReasoningConfig {
    /// Enabled configuration with the given markers
    pub fn with_markers(start: impl Into<String>, end: impl Into<String>) -> Self {
        Self {
            enabled: true,
            start_marker: start.into(),
            end_marker: end.into(),
        }
    }
}

/// Worker pool sizing
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct PoolConfig {
    /// Threads for outbound model calls
    pub outbound_threads: usize,
    /// Threads for blocking storage calls
    pub storage_threads: usize,
    /// Buffered tokens per fan-out branch
    pub branch_capacity: usize,
}

impl Default for PoolConfig {
    fn default() -> Self {
        Self {
            outbound_threads: 4,
            storage_threads: 2,
            branch_capacity: 64,
        }
    }
}

/// Limits applied to incoming turns
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct TurnLimits {
    /// Maximum query length in characters
    pub max_query_chars: usize,
}

impl Default for TurnLimits {
    fn default() -> Self {
        Self {
            max_query_chars: 32768,
        }
    }
}

/// Where conversations are kept
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct StorageConfig {
    /// Directory for the file store (in-memory when unset)
    pub data_dir: Option<PathBuf>,
}

/// Persistence health thresholds
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct HealthConfig {
    /// Recent failures at which health degrades to warning
    pub warn_threshold: usize,
    /// Recent failures at which health becomes critical
    pub critical_threshold: usize,
    /// How long a failure counts as recent
    pub window: Duration,
}

impl Default for HealthConfig {
    fn default() -> Self {
        Self {
            warn_threshold: 5,
            critical_threshold: 20,
            window: Duration::from_secs(300),
        }
    }
}

// =============================================================================
// TOML Configuration Structures
// =============================================================================

/// Backend section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct BackendToml {
    /// Ollama host
    pub host: Option<String>,
    /// Ollama port
    pub port: Option<u16>,
    /// Model name
    pub model: Option<String>,
    /// Sampling temperature
    pub temperature: Option<f32>,
    /// System prompt
    pub system_prompt: Option<String>,
    /// Connection timeout in seconds
    pub connect_timeout_secs: Option<u64>,
}

/// Reasoning section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ReasoningToml {
    /// Whether to strip reasoning segments
    pub enabled: Option<bool>,
    /// Opening marker
    pub start_marker: Option<String>,
    /// Closing marker
    pub end_marker: Option<String>,
}

/// Pools section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct PoolsToml {
    /// Outbound worker threads
    pub outbound_threads: Option<usize>,
    /// Storage worker threads
    pub storage_threads: Option<usize>,
    /// Per-branch channel capacity
    pub branch_capacity: Option<usize>,
}

/// Limits section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct LimitsToml {
    /// Maximum query length in characters
    pub max_query_chars: Option<usize>,
}

/// Storage section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct StorageToml {
    /// File store directory
    pub data_dir: Option<PathBuf>,
}

/// Health section of the TOML configuration
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct HealthToml {
    /// Warning threshold
    pub warn_threshold: Option<usize>,
    /// Critical threshold
    pub critical_threshold: Option<usize>,
    /// Sliding window in seconds
    pub window_secs: Option<u64>,
}

/// Top-level TOML configuration structure
#[derive(Clone, Debug, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct RelayToml {
    /// Backend section
    pub backend: BackendToml,
    /// Reasoning section
    pub reasoning: ReasoningToml,
    /// Pools section
    pub pools: PoolsToml,
    /// Limits section
    pub limits: LimitsToml,
    /// Storage section
    pub storage: StorageToml,
    /// Health section
    pub health: HealthToml,
}

// =============================================================================
// Main Configuration Struct
// =============================================================================

/// Resolved relay configuration
///
/// Use [`load_config`] to load with proper priority handling.
#[derive(Clone, Debug)]
pub struct RelayConfig {
    /// Model backend settings
    pub backend: BackendConfig,
    /// Reasoning markup handling
    pub reasoning: ReasoningConfig,
    /// Worker pool sizing
    pub pools: PoolConfig,
    /// Turn limits
    pub limits: TurnLimits,
    /// Conversation storage
    pub storage: StorageConfig,
    /// Persistence health thresholds
    pub health: HealthConfig,
    /// Path to the config file that was loaded (if any)
    pub config_file_path: Option<PathBuf>,
    /// Source of configuration values
    source: ConfigSource,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            backend: BackendConfig::default(),
            reasoning: ReasoningConfig::default(),
            pools: PoolConfig::default(),
            limits: TurnLimits::default(),
            storage: StorageConfig::default(),
            health: HealthConfig::default(),
            config_file_path: None,
            source: ConfigSource::Default,
        }
    }
}

impl RelayConfig {
    /// Get the primary source of this configuration
    #[must_use]
    pub fn source(&self) -> ConfigSource {
        self.source
    }

    /// Set the configuration source
    pub fn set_source(&mut self, source: ConfigSource) {
        self.source = source;
    }

    /// Check cross-field constraints
    ///
    /// # Errors
    ///
    /// Returns [`ConfigError::ValidationError`] describing the first problem.
    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.pools.outbound_threads == 0 || self.pools.storage_threads == 0 {
            return Err(ConfigError::ValidationError(
                "worker pools need at least one thread".to_string(),
            ));
        }
        if self.pools.branch_capacity == 0 {
            return Err(ConfigError::ValidationError(
                "branch_capacity must be positive".to_string(),
            ));
        }
        if self.limits.max_query_chars == 0 {
            return Err(ConfigError::ValidationError(
                "max_query_chars must be positive".to_string(),
            ));
        }
        if self.reasoning.enabled {
            let r = &self.reasoning;
            if r.start_marker.is_empty() || r.end_marker.is_empty() {
                return Err(ConfigError::ValidationError(
                    "reasoning markers must not be empty".to_string(),
                ));
            }
            if r.start_marker == r.end_marker {
                return Err(ConfigError::ValidationError(format!(
                    "reasoning start and end markers are both {:?}",
                    r.start_marker
                )));
            }
        }
        if self.health.warn_threshold > self.health.critical_threshold {
            return Err(ConfigError::ValidationError(
                "warn_threshold exceeds critical_threshold".to_string(),
            ));
        }
        Ok(())
    }
}

// =============================================================================
// Configuration Loading
// =============================================================================

/// Get the default configuration file path
///
/// Returns `$XDG_CONFIG_HOME/chat-relay/relay.toml` or
/// `~/.config/chat-relay/relay.toml` if `XDG_CONFIG_HOME` is not set.
#[must_use]
pub fn default_config_path() -> Option<PathBuf> {
    dirs::config_dir().map(|p| p.join("chat-relay").join("relay.toml"))
}

/// Load configuration from all sources with proper priority
///
/// # Errors
///
/// Returns an error if the config file exists but cannot be parsed, or the
/// merged result fails validation. A missing config file is not an error.
pub fn load_config() -> Result<RelayConfig, ConfigError> {
    load_config_from_path(default_config_path())
}

/// Load configuration from a specific path
///
/// # Errors
///
/// Returns an error if the specified config file cannot be read or parsed,
/// or the merged result fails validation.
pub fn load_config_from_path(path: Option<PathBuf>) -> Result<RelayConfig, ConfigError> {
    let mut config = RelayConfig::default();

    if let Some(ref config_path) = path {
        if config_path.exists() {
            let toml_content =
                std::fs::read_to_string(config_path).map_err(|e| ConfigError::ReadError {
                    path: config_path.clone(),
                    source: e,
                })?;

            let toml_config: RelayToml = toml::from_str(&toml_content)?;
            apply_toml_config(&mut config, &toml_config);
            config.config_file_path = Some(config_path.clone());
            config.source = ConfigSource::File;

            tracing::info!(
                path = %config_path.display(),
                "Loaded configuration from file"
            );
        } else {
            tracing::debug!(
                path = %config_path.display(),
                "Config file not found, using defaults"
            );
        }
    }

    apply_env_config(&mut config);
    config.validate()?;

    Ok(config)
}

/// Apply TOML configuration values to the config struct
fn apply_toml_config(config: &mut RelayConfig, toml: &RelayToml) {
    let backend = &toml.backend;
    if let Some(ref host) = backend.host {
        config.backend.host = host.clone();
    }
    if let Some(port) = backend.port {
        config.backend.port = port;
    }
    if let Some(ref model) = backend.model {
        config.backend.model = model.clone();
    }
    if let Some(temperature) = backend.temperature {
        config.backend.temperature = Some(temperature.clamp(0.0, 2.0));
    }
    if let Some(ref prompt) = backend.system_prompt {
        config.backend.system_prompt = Some(prompt.clone());
    }
    if let Some(timeout) = backend.connect_timeout_secs {
        config.backend.connect_timeout_secs = timeout;
    }

    let reasoning = &toml.reasoning;
    if let Some(enabled) = reasoning.enabled {
        config.reasoning.enabled = enabled;
    }
    if let Some(ref start) = reasoning.start_marker {
        config.reasoning.start_marker = start.clone();
    }
    if let Some(ref end) = reasoning.end_marker {
        config.reasoning.end_marker = end.clone();
    }

    if let Some(threads) = toml.pools.outbound_threads {
        config.pools.outbound_threads = threads;
    }
    if let Some(threads) = toml.pools.storage_threads {
        config.pools.storage_threads = threads;
    }
    if let Some(capacity) = toml.pools.branch_capacity {
        config.pools.branch_capacity = capacity;
    }

    if let Some(max) = toml.limits.max_query_chars {
        config.limits.max_query_chars = max;
    }

    if let Some(ref dir) = toml.storage.data_dir {
        config.storage.data_dir = Some(dir.clone());
    }

    if let Some(warn) = toml.health.warn_threshold {
        config.health.warn_threshold = warn;
    }
    if let Some(critical) = toml.health.critical_threshold {
        config.health.critical_threshold = critical;
    }
    if let Some(secs) = toml.health.window_secs {
        config.health.window = Duration::from_secs(secs);
    }
}

/// Apply environment variable overrides from the process environment
///
/// Environment variables:
/// - `OLLAMA_HOST`, `OLLAMA_PORT`: backend address
/// - `RELAY_MODEL`: model name
/// - `RELAY_SYSTEM_PROMPT`: system prompt
/// - `RELAY_REASONING_ENABLED`: `1`/`true` to strip reasoning segments
/// - `RELAY_REASONING_START`, `RELAY_REASONING_END`: markers
/// - `RELAY_OUTBOUND_THREADS`, `RELAY_STORAGE_THREADS`: pool sizes
/// - `RELAY_MAX_QUERY_CHARS`: query length limit
/// - `RELAY_DATA_DIR`: file store directory
pub fn apply_env_config(config: &mut RelayConfig) {
    apply_env_from(config, |key| std::env::var(key).ok());
}

/// Apply overrides read through `lookup` instead of the process environment
pub fn apply_env_from<F>(config: &mut RelayConfig, lookup: F)
where
    F: Fn(&str) -> Option<String>,
{
    let mut env_applied = false;
    let parse_bool = |v: &str| v == "1" || v.eq_ignore_ascii_case("true");

    if let Some(host) = lookup("OLLAMA_HOST") {
        config.backend.host = host;
        env_applied = true;
    }
    if let Some(port) = lookup("OLLAMA_PORT").and_then(|v| v.parse().ok()) {
        config.backend.port = port;
        env_applied = true;
    }
    if let Some(model) = lookup("RELAY_MODEL") {
        config.backend.model = model;
        env_applied = true;
    }
    if let Some(prompt) = lookup("RELAY_SYSTEM_PROMPT") {
        config.backend.system_prompt = Some(prompt);
        env_applied = true;
    }
    if let Some(enabled) = lookup("RELAY_REASONING_ENABLED") {
        config.reasoning.enabled = parse_bool(&enabled);
        env_applied = true;
    }
    if let Some(start) = lookup("RELAY_REASONING_START") {
        config.reasoning.start_marker = start;
        env_applied = true;
    }
    if let Some(end) = lookup("RELAY_REASONING_END") {
        config.reasoning.end_marker = end;
        env_applied = true;
    }
    if let Some(threads) = lookup("RELAY_OUTBOUND_THREADS").and_then(|v| v.parse().ok()) {
        config.pools.outbound_threads = threads;
        env_applied = true;
    }
    if let Some(threads) = lookup("RELAY_STORAGE_THREADS").and_then(|v| v.parse().ok()) {
        config.pools.storage_threads = threads;
        env_applied = true;
    }
    if let Some(max) = lookup("RELAY_MAX_QUERY_CHARS").and_then(|v| v.parse().ok()) {
        config.limits.max_query_chars = max;
        env_applied = true;
    }
    if let Some(dir) = lookup("RELAY_DATA_DIR") {
        config.storage.data_dir = Some(PathBuf::from(dir));
        env_applied = true;
    }

    if env_applied {
        config.source = ConfigSource::Env;
    }
}

// =============================================================================
// CLI Overrides
// =============================================================================

/// Overrides supplied on the command line
#[derive(Clone, Debug, Default)]
pub struct ConfigOverrides {
    /// Model name
    pub model: Option<String>,
    /// Reasoning stripping on/off
    pub reasoning_enabled: Option<bool>,
    /// File store directory
    pub data_dir: Option<PathBuf>,
}

impl ConfigOverrides {
    /// Create an empty set of overrides
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Override the model
    #[must_use]
    pub fn with_model(mut self, model: String) -> Self {
        self.model = Some(model);
        self
    }

    /// Override reasoning stripping
    #[must_use]
    pub fn with_reasoning_enabled(mut self, enabled: bool) -> Self {
        self.reasoning_enabled = Some(enabled);
        self
    }

    /// Override the file store directory
    #[must_use]
    pub fn with_data_dir(mut self, dir: PathBuf) -> Self {
        self.data_dir = Some(dir);
        self
    }

    /// Apply the overrides, marking the config as CLI-sourced if any applied
    pub fn apply(&self, config: &mut RelayConfig) {
        let mut applied = false;

        if let Some(ref model) = self.model {
            config.backend.model = model.clone();
            applied = true;
        }
        if let Some(enabled) = self.reasoning_enabled {
            config.reasoning.enabled = enabled;
            applied = true;
        }
        if let Some(ref dir) = self.data_dir {
            config.storage.data_dir = Some(dir.clone());
            applied = true;
        }

        if applied {
            config.source = ConfigSource::Cli;
        }
    }
}
