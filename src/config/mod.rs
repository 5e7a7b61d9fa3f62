pub mod validation;

use serde::{Deserialize, Serialize};
use std::time::Duration;

use crate::stream::reasoning::{DEFAULT_REASONING_TAGS, KNOWN_REASONING_FIELDS};

use self::validation::validate_config;

/// Error type for configuration loading and validation.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    Io(#[from] std::io::Error),
    #[error("Failed to parse YAML: {0}")]
    Yaml(#[from] serde_yaml::Error),
    #[error("Config validation error: {0}")]
    Validation(String),
}

/// The single chat-completion endpoint streamed from.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UpstreamConfig {
    #[serde(default = "default_provider")]
    pub provider: String,
    pub base_url: String,
    pub api_key: String,
    pub model: String,
    #[serde(default)]
    pub proxy: Option<String>,
    #[serde(default = "default_chat_path")]
    pub chat_path: String,
}

fn default_provider() -> String {
    "openai".to_string()
}
fn default_chat_path() -> String {
    "/chat/completions".to_string()
}

impl UpstreamConfig {
    /// Full URL of the streaming endpoint.
    #[must_use]
    pub fn endpoint(&self) -> String {
        let base = self.base_url.trim_end_matches('/');
        let path = self.chat_path.trim_start_matches('/');
        format!("{base}/{path}")
    }
}

/// HTTP client settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TransportConfig {
    #[serde(default = "default_timeout")]
    pub timeout: u64,
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: u64,
    #[serde(default = "default_pool_max_idle_per_host")]
    pub pool_max_idle_per_host: usize,
    #[serde(default = "default_pool_idle_timeout_secs")]
    pub pool_idle_timeout_secs: u64,
    #[serde(default)]
    pub use_env_proxy: bool,
}

fn default_timeout() -> u64 {
    180
}
fn default_connect_timeout() -> u64 {
    5
}
fn default_pool_max_idle_per_host() -> usize {
    16
}
fn default_pool_idle_timeout_secs() -> u64 {
    15
}

impl TransportConfig {
    #[must_use]
    pub fn timeout(&self) -> Duration {
        Duration::from_secs(self.timeout)
    }

    #[must_use]
    pub fn connect_timeout(&self) -> Duration {
        Duration::from_secs(self.connect_timeout)
    }
}

impl Default for TransportConfig {
    fn default() -> Self {
        Self {
            timeout: default_timeout(),
            connect_timeout: default_connect_timeout(),
            pool_max_idle_per_host: default_pool_max_idle_per_host(),
            pool_idle_timeout_secs: default_pool_idle_timeout_secs(),
            use_env_proxy: false,
        }
    }
}

/// Per-stream reconstruction settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StreamSettings {
    /// Dedicated reasoning fields, tried in order.
    #[serde(default = "default_reasoning_fields")]
    pub reasoning_fields: Vec<String>,
    /// Inline tag names, without angle brackets.
    #[serde(default = "default_reasoning_tags")]
    pub reasoning_tags: Vec<String>,
    /// Use the accumulated visible text as the final text.
    #[serde(default)]
    pub accumulate_text: bool,
    /// Hold the completion after a finish frame without usage until a usage
    /// frame, `[DONE]`, or end of input.
    #[serde(default = "default_true")]
    pub defer_completion_for_usage: bool,
    #[serde(default)]
    pub estimate_missing_usage: bool,
}

fn default_reasoning_fields() -> Vec<String> {
    KNOWN_REASONING_FIELDS
        .iter()
        .map(|(name, _)| (*name).to_string())
        .collect()
}
fn default_reasoning_tags() -> Vec<String> {
    DEFAULT_REASONING_TAGS
        .iter()
        .map(|tag| (*tag).to_string())
        .collect()
}
fn default_true() -> bool {
    true
}

impl Default for StreamSettings {
    fn default() -> Self {
        Self {
            reasoning_fields: default_reasoning_fields(),
            reasoning_tags: default_reasoning_tags(),
            accumulate_text: false,
            defer_completion_for_usage: true,
            estimate_missing_usage: false,
        }
    }
}

/// Feature flags and settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeaturesConfig {
    #[serde(default = "default_log_level")]
    pub log_level: String,
}

fn default_log_level() -> String {
    "INFO".to_string()
}

impl Default for FeaturesConfig {
    fn default() -> Self {
        Self {
            log_level: default_log_level(),
        }
    }
}

/// Top-level application configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AppConfig {
    pub upstream: UpstreamConfig,
    #[serde(default)]
    pub transport: TransportConfig,
    #[serde(default)]
    pub stream: StreamSettings,
    #[serde(default)]
    pub features: FeaturesConfig,
}

/// Load configuration from a YAML file and validate it.
///
/// # Errors
///
/// Returns [`ConfigError::Io`] when reading the file fails, [`ConfigError::Yaml`]
/// when parsing fails, or [`ConfigError::Validation`] when semantic validation fails.
pub fn load_config(path: &str) -> Result<AppConfig, ConfigError> {
    let contents = std::fs::read_to_string(path)?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
///
/// # Errors
///
/// Returns [`ConfigError::Yaml`] when parsing fails or
/// [`ConfigError::Validation`] when semantic validation fails.
pub fn parse_config(contents: &str) -> Result<AppConfig, ConfigError> {
    let config: AppConfig = serde_yaml::from_str(contents)?;
    validate_config(&config)?;
    Ok(config)
}
