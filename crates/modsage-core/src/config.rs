//! Configuration for the analysis core.
//!
//! Configuration is loaded once from a TOML file (`modsage.toml` by convention)
//! and handed to each component as static parameters. Every field has a
//! default, so a missing file or a partial file is valid.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use modsage_abstraction::{TaskType, TimeoutCategory};
use modsage_models::DEFAULT_BASE_URL;
use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Environment variable overriding `ai.base_url`.
pub const BASE_URL_ENV: &str = "MODSAGE_BASE_URL";

/// Errors that can occur when loading configuration.
#[derive(Debug, Error)]
pub enum ConfigError {
    /// I/O error reading config file.
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// TOML parsing error.
    #[error("TOML parse error: {0}")]
    TomlParse(#[from] toml::de::Error),

    /// Configuration validation error.
    #[error("Configuration validation error: {0}")]
    Validation(String),
}

/// Root configuration.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct AppConfig {
    /// Model server and model selection.
    #[serde(default)]
    pub ai: AiConfig,
    /// Response cache.
    #[serde(default)]
    pub cache: CacheSettings,
    /// Request timeout ceilings.
    #[serde(default)]
    pub timeouts: TimeoutConfig,
    /// Transport retry policy.
    #[serde(default)]
    pub retry: RetryConfig,
    /// Session pooling.
    #[serde(default)]
    pub sessions: SessionConfig,
    /// Streaming behaviour.
    #[serde(default)]
    pub streaming: StreamingConfig,
    /// Metrics retention.
    #[serde(default)]
    pub metrics: MetricsConfig,
}

impl AppConfig {
    /// Parses configuration from TOML text and validates it.
    pub fn from_toml_str(content: &str) -> Result<Self, ConfigError> {
        let config: Self = toml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    /// Applies overrides that come from outside the file.
    pub fn apply_overrides(&mut self, base_url: Option<String>) {
        if let Some(url) = base_url.filter(|u| !u.trim().is_empty()) {
            self.ai.base_url = url;
        }
    }

    /// Validates every section.
    pub fn validate(&self) -> Result<(), ConfigError> {
        self.ai.validate()?;
        self.cache.validate()?;
        self.timeouts.validate()?;

        if self.sessions.max_sessions_per_model == 0 {
            return Err(ConfigError::Validation(
                "sessions.max_sessions_per_model must be greater than 0".to_string(),
            ));
        }
        if self.sessions.health_check_interval_secs == 0 || self.sessions.cleanup_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "session maintenance intervals must be greater than 0".to_string(),
            ));
        }
        if self.streaming.replay_chunk_size == 0 {
            return Err(ConfigError::Validation(
                "streaming.replay_chunk_size must be greater than 0".to_string(),
            ));
        }
        if self.metrics.cleanup_interval_secs == 0 {
            return Err(ConfigError::Validation(
                "metrics.cleanup_interval_secs must be greater than 0".to_string(),
            ));
        }
        Ok(())
    }
}

/// Load configuration from `path`, falling back to defaults when the file is missing.
///
/// The `MODSAGE_BASE_URL` environment variable overrides `ai.base_url`.
///
/// # Errors
/// Returns error if the file exists but cannot be read, parsed or validated.
pub fn load_config(path: &Path) -> Result<AppConfig, ConfigError> {
    let mut config = if path.exists() {
        let content = std::fs::read_to_string(path)?;
        AppConfig::from_toml_str(&content)?
    } else {
        AppConfig::default()
    };

    config.apply_overrides(std::env::var(BASE_URL_ENV).ok());
    Ok(config)
}

/// Model server and model selection settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct AiConfig {
    /// Base URL of the model server.
    pub base_url: String,
    /// Default sampling temperature.
    pub temperature: f32,
    /// Token ceiling shared by prompt budgeting and generation.
    pub max_tokens: u32,
    /// Whether callers may use the streaming entry point.
    pub streaming_enabled: bool,
    /// Small model used for availability probes and warmup.
    pub lightweight_model: String,
    /// Tier name to model name.
    pub model_tiers: BTreeMap<String, String>,
    /// Task name to tier name.
    pub task_tiers: BTreeMap<String, String>,
    /// How long a fetched model list stays valid, in seconds.
    pub model_list_ttl_secs: u64,
}

impl Default for AiConfig {
    fn default() -> Self {
        let model_tiers = [
            ("fast", "llama3.2:3b"),
            ("standard", "llama3.1:8b"),
            ("advanced", "qwen2.5:14b"),
        ];
        let task_tiers = [
            ("quick", "fast"),
            ("summary", "fast"),
            ("conflicts", "standard"),
            ("performance", "standard"),
            ("custom", "standard"),
            ("full", "advanced"),
        ];

        Self {
            base_url: DEFAULT_BASE_URL.to_string(),
            temperature: 0.3,
            max_tokens: 4096,
            streaming_enabled: true,
            lightweight_model: "llama3.2:3b".to_string(),
            model_tiers: model_tiers.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            task_tiers: task_tiers.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect(),
            model_list_ttl_secs: 300,
        }
    }
}

impl AiConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.base_url.trim().is_empty() {
            return Err(ConfigError::Validation("ai.base_url must not be empty".to_string()));
        }
        if !(0.0..=2.0).contains(&self.temperature) {
            return Err(ConfigError::Validation(format!(
                "ai.temperature must be between 0 and 2, got {}",
                self.temperature
            )));
        }
        if self.max_tokens == 0 {
            return Err(ConfigError::Validation("ai.max_tokens must be greater than 0".to_string()));
        }
        for (task, tier) in &self.task_tiers {
            task.parse::<TaskType>().map_err(|e| ConfigError::Validation(e.to_string()))?;
            if !self.model_tiers.contains_key(tier) {
                return Err(ConfigError::Validation(format!(
                    "ai.task_tiers.{task} refers to unknown tier '{tier}'"
                )));
            }
        }
        Ok(())
    }

    /// Model list cache lifetime.
    #[must_use]
    pub fn model_list_ttl(&self) -> Duration {
        Duration::from_secs(self.model_list_ttl_secs)
    }
}

/// Response cache settings.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheSettings {
    /// Whether response caching is enabled.
    #[serde(default = "default_cache_enabled")]
    pub enabled: bool,

    /// Aggregate size cap in megabytes (default: 100).
    #[serde(default = "default_max_size_mb")]
    pub max_size_mb: u64,

    /// Days before an entry expires (default: 7).
    #[serde(default = "default_expiry_days")]
    pub expiry_days: u64,

    /// Directory holding one file per entry.
    #[serde(default = "default_cache_directory")]
    pub directory: PathBuf,
}

fn default_cache_enabled() -> bool {
    true
}

fn default_max_size_mb() -> u64 {
    100
}

fn default_expiry_days() -> u64 {
    7
}

fn default_cache_directory() -> PathBuf {
    PathBuf::from(".modsage").join("cache")
}

impl Default for CacheSettings {
    fn default() -> Self {
        Self {
            enabled: default_cache_enabled(),
            max_size_mb: default_max_size_mb(),
            expiry_days: default_expiry_days(),
            directory: default_cache_directory(),
        }
    }
}

impl CacheSettings {
    fn validate(&self) -> Result<(), ConfigError> {
        if self.max_size_mb == 0 {
            return Err(ConfigError::Validation("cache.max_size_mb must be greater than 0".to_string()));
        }
        if self.expiry_days == 0 {
            return Err(ConfigError::Validation("cache.expiry_days must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// Size cap in bytes.
    #[must_use]
    pub fn max_size_bytes(&self) -> u64 {
        self.max_size_mb.saturating_mul(1024 * 1024)
    }

    /// Default time-to-live of an entry.
    #[must_use]
    pub fn default_ttl(&self) -> Duration {
        Duration::from_secs(self.expiry_days.saturating_mul(24 * 60 * 60))
    }
}

/// Timeout ceilings per task category.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TimeoutConfig {
    /// Ceiling for standard requests, in seconds.
    pub standard_secs: u64,
    /// Ceiling for large requests, in seconds.
    pub large_secs: u64,
    /// Ceiling for complex requests, in seconds.
    pub complex_secs: u64,
    /// Ceiling for health probes, in seconds.
    pub probe_secs: u64,
}

impl Default for TimeoutConfig {
    fn default() -> Self {
        Self { standard_secs: 120, large_secs: 300, complex_secs: 600, probe_secs: 10 }
    }
}

impl TimeoutConfig {
    fn validate(&self) -> Result<(), ConfigError> {
        if [self.standard_secs, self.large_secs, self.complex_secs, self.probe_secs].contains(&0) {
            return Err(ConfigError::Validation("timeouts must be greater than 0".to_string()));
        }
        Ok(())
    }

    /// The ceiling for a task category.
    #[must_use]
    pub fn for_category(&self, category: TimeoutCategory) -> Duration {
        Duration::from_secs(match category {
            TimeoutCategory::Standard => self.standard_secs,
            TimeoutCategory::Large => self.large_secs,
            TimeoutCategory::Complex => self.complex_secs,
        })
    }

    /// The ceiling for a single health probe.
    #[must_use]
    pub fn probe(&self) -> Duration {
        Duration::from_secs(self.probe_secs)
    }
}

/// Exponential backoff policy for retryable server errors.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Maximum number of retries after the first attempt.
    pub max_retries: u32,
    /// Delay before the first retry, in milliseconds.
    pub base_delay_ms: u64,
    /// Upper bound of any single delay, in milliseconds.
    pub max_delay_ms: u64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 3, base_delay_ms: 1000, max_delay_ms: 30_000 }
    }
}

impl RetryConfig {
    /// Delay before retry number `attempt` (0-based): `base * 2^attempt`, capped.
    #[must_use]
    pub fn delay_for(&self, attempt: u32) -> Duration {
        let factor = 1u64.checked_shl(attempt).unwrap_or(u64::MAX);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor).min(self.max_delay_ms))
    }
}

/// Session pool settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SessionConfig {
    /// Concurrent loans allowed per model.
    pub max_sessions_per_model: usize,
    /// Idle time after which a session is evicted, in seconds.
    pub idle_timeout_secs: u64,
    /// Interval of the background health check, in seconds.
    pub health_check_interval_secs: u64,
    /// Interval of the background cleanup, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            max_sessions_per_model: 3,
            idle_timeout_secs: 1800,
            health_check_interval_secs: 300,
            cleanup_interval_secs: 600,
        }
    }
}

impl SessionConfig {
    /// Idle eviction threshold.
    #[must_use]
    pub fn idle_timeout(&self) -> Duration {
        Duration::from_secs(self.idle_timeout_secs)
    }

    /// Health check interval.
    #[must_use]
    pub fn health_check_interval(&self) -> Duration {
        Duration::from_secs(self.health_check_interval_secs)
    }

    /// Cleanup interval.
    #[must_use]
    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }
}

/// Streaming settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct StreamingConfig {
    /// Minimum interval between progress notifications, in milliseconds.
    pub progress_interval_ms: u64,
    /// Whether recoverable chunk errors are retried.
    pub enable_error_recovery: bool,
    /// Recoverable errors tolerated per stream.
    pub max_retries: u32,
    /// Base of the `base * 2^retry` backoff, in milliseconds.
    pub retry_base_delay_ms: u64,
    /// Characters per synthetic chunk when replaying cached text.
    pub replay_chunk_size: usize,
    /// Delay between synthetic chunks, in milliseconds.
    pub replay_delay_ms: u64,
}

impl Default for StreamingConfig {
    fn default() -> Self {
        Self {
            progress_interval_ms: 100,
            enable_error_recovery: true,
            max_retries: 3,
            retry_base_delay_ms: 1000,
            replay_chunk_size: 64,
            replay_delay_ms: 10,
        }
    }
}

/// Metrics retention settings.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// How long recorded metrics are kept, in seconds.
    pub retention_secs: u64,
    /// Interval of the retention sweep, in seconds.
    pub cleanup_interval_secs: u64,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self { retention_secs: 86_400, cleanup_interval_secs: 3600 }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_defaults() {
        let config = AppConfig::default();
        assert_eq!(config.ai.base_url, "http://localhost:11434");
        assert!(config.cache.enabled);
        assert_eq!(config.cache.max_size_bytes(), 100 * 1024 * 1024);
        assert_eq!(config.cache.default_ttl(), Duration::from_secs(7 * 24 * 3600));
        assert_eq!(config.sessions.max_sessions_per_model, 3);
        assert_eq!(config.sessions.health_check_interval(), Duration::from_secs(300));
        assert_eq!(config.sessions.cleanup_interval(), Duration::from_secs(600));
        assert_eq!(config.streaming.progress_interval_ms, 100);
        assert_eq!(config.metrics.cleanup_interval_secs, 3600);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_partial_file_keeps_defaults() {
        let config = AppConfig::from_toml_str(
            r#"
[ai]
base_url = "http://gpu-box:11434"

[cache]
enabled = false
"#,
        )
        .unwrap();

        assert_eq!(config.ai.base_url, "http://gpu-box:11434");
        assert_eq!(config.ai.max_tokens, 4096);
        assert!(!config.cache.enabled);
        assert_eq!(config.cache.expiry_days, 7);
        assert_eq!(config.timeouts, TimeoutConfig::default());
    }

    #[test]
    fn test_unknown_tier_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
[ai.task_tiers]
quick = "turbo"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(msg)) if msg.contains("turbo")));
    }

    #[test]
    fn test_unknown_task_rejected() {
        let result = AppConfig::from_toml_str(
            r#"
[ai.task_tiers]
deep = "fast"
"#,
        );
        assert!(matches!(result, Err(ConfigError::Validation(_))));
    }

    #[test]
    fn test_zero_values_rejected() {
        assert!(AppConfig::from_toml_str("[cache]\nmax_size_mb = 0\n").is_err());
        assert!(AppConfig::from_toml_str("[sessions]\nmax_sessions_per_model = 0\n").is_err());
        assert!(AppConfig::from_toml_str("[timeouts]\nlarge_secs = 0\n").is_err());
        assert!(AppConfig::from_toml_str("[ai]\ntemperature = 3.5\n").is_err());
    }

    #[test]
    fn test_invalid_toml() {
        assert!(matches!(AppConfig::from_toml_str("[ai"), Err(ConfigError::TomlParse(_))));
    }

    #[test]
    fn test_load_config_missing_file_uses_defaults() {
        let temp = TempDir::new().unwrap();
        let config = load_config(&temp.path().join("modsage.toml")).unwrap();
        assert_eq!(config.sessions, SessionConfig::default());
    }

    #[test]
    fn test_load_config_from_file() {
        let temp = TempDir::new().unwrap();
        let path = temp.path().join("modsage.toml");
        std::fs::write(
            &path,
            r#"
[retry]
max_retries = 5
base_delay_ms = 250

[sessions]
max_sessions_per_model = 6
"#,
        )
        .unwrap();

        let config = load_config(&path).unwrap();
        assert_eq!(config.retry.max_retries, 5);
        assert_eq!(config.retry.base_delay_ms, 250);
        assert_eq!(config.sessions.max_sessions_per_model, 6);
    }

    #[test]
    fn test_base_url_override() {
        let mut config = AppConfig::default();
        config.apply_overrides(Some("http://10.1.1.1:11434".to_string()));
        assert_eq!(config.ai.base_url, "http://10.1.1.1:11434");

        config.apply_overrides(Some("  ".to_string()));
        assert_eq!(config.ai.base_url, "http://10.1.1.1:11434");
    }

    #[test]
    fn test_timeouts_per_category() {
        let timeouts = TimeoutConfig::default();
        assert_eq!(timeouts.for_category(TimeoutCategory::Standard), Duration::from_secs(120));
        assert_eq!(timeouts.for_category(TimeoutCategory::Large), Duration::from_secs(300));
        assert_eq!(timeouts.for_category(TimeoutCategory::Complex), Duration::from_secs(600));
    }

    #[test]
    fn test_retry_delay_doubles_and_caps() {
        let retry = RetryConfig { max_retries: 3, base_delay_ms: 1000, max_delay_ms: 5000 };
        assert_eq!(retry.delay_for(0), Duration::from_millis(1000));
        assert_eq!(retry.delay_for(1), Duration::from_millis(2000));
        assert_eq!(retry.delay_for(2), Duration::from_millis(4000));
        assert_eq!(retry.delay_for(3), Duration::from_millis(5000));
        assert_eq!(retry.delay_for(70), Duration::from_millis(5000));
    }
}
