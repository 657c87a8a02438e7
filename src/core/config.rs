use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::core::errors::{JobGraphError, Result};

/// Backoff between attempts of a retryable task failure
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetryStrategy {
    /// Exponential backoff with configurable parameters
    Exponential {
        initial_delay_ms: u64,
        max_delay_ms: u64,
        multiplier: f64,
    },
    /// Linear backoff with fixed delay
    Linear { delay_ms: u64 },
    /// No delay between retries
    Immediate,
}

impl Default for RetryStrategy {
    fn default() -> Self {
        Self::Exponential {
            initial_delay_ms: 500,
            max_delay_ms: 30_000,
            multiplier: 2.0,
        }
    }
}

impl RetryStrategy {
    /// Delay before the given retry (1-based), with up to 10% jitter.
    pub fn delay_for(&self, retry: u32) -> Duration {
        let base_ms = match self {
            RetryStrategy::Exponential {
                initial_delay_ms,
                max_delay_ms,
                multiplier,
            } => {
                let exp = multiplier.powi(retry.saturating_sub(1) as i32);
                (*initial_delay_ms as f64 * exp).min(*max_delay_ms as f64) as u64
            }
            RetryStrategy::Linear { delay_ms } => *delay_ms,
            RetryStrategy::Immediate => 0,
        };
        let jitter = if base_ms >= 10 {
            fastrand::u64(0..=base_ms / 10)
        } else {
            0
        };
        Duration::from_millis(base_ms + jitter)
    }
}

/// Engine configuration with all tuning parameters
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Maximum number of tasks executing at once, across all jobs
    pub max_concurrency: usize,
    /// Per-task handler timeout (None = unbounded)
    pub task_timeout_secs: Option<u64>,
    /// How long an `import/upload` task waits for its file. Also the
    /// lifetime of the upload form. Not subject to `task_timeout_secs`.
    pub upload_timeout_secs: Option<u64>,
    /// Attempts per task, including the first one. Only retryable failures are retried.
    pub max_attempts: u32,
    pub retry_strategy: RetryStrategy,
    /// Capacity of the internal event bus
    pub event_buffer: usize,
    /// Default interval between status polls
    pub poll_interval_ms: u64,
    /// Default polling bound
    pub poll_max_attempts: u32,
    /// Base URL for exported and uploaded results
    pub storage_base_url: String,
    /// Base URL handed out in upload form descriptors
    pub upload_base_url: String,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            max_concurrency: 3,
            task_timeout_secs: Some(300),
            upload_timeout_secs: Some(4 * 60 * 60),
            max_attempts: 1,
            retry_strategy: RetryStrategy::default(),
            event_buffer: 1024,
            poll_interval_ms: 2000,
            poll_max_attempts: 10,
            storage_base_url: "https://storage.jobgraph.local".to_string(),
            upload_base_url: "https://upload.jobgraph.local".to_string(),
        }
    }
}

impl EngineConfig {
    /// Create a new builder for EngineConfig
    pub fn builder() -> EngineConfigBuilder {
        EngineConfigBuilder::new()
    }

    /// Validates configuration values
    pub fn validate(&self) -> Result<()> {
        if self.max_concurrency == 0 {
            return Err(JobGraphError::configuration(
                "max_concurrency must be greater than 0",
            ));
        }
        if self.max_attempts == 0 {
            return Err(JobGraphError::configuration(
                "max_attempts must be greater than 0",
            ));
        }
        for (field, timeout) in [
            ("task_timeout_secs", self.task_timeout_secs),
            ("upload_timeout_secs", self.upload_timeout_secs),
        ] {
            if timeout == Some(0) {
                return Err(JobGraphError::configuration(format!(
                    "{field} must be greater than 0"
                )));
            }
        }
        if self.event_buffer == 0 {
            return Err(JobGraphError::configuration(
                "event_buffer must be greater than 0",
            ));
        }
        if self.poll_max_attempts == 0 {
            return Err(JobGraphError::configuration(
                "poll_max_attempts must be greater than 0",
            ));
        }
        if let RetryStrategy::Exponential {
            initial_delay_ms,
            max_delay_ms,
            multiplier,
        } = &self.retry_strategy
        {
            if *multiplier < 1.0 {
                return Err(JobGraphError::configuration(
                    "retry multiplier must be >= 1.0",
                ));
            }
            if initial_delay_ms > max_delay_ms {
                return Err(JobGraphError::configuration(
                    "initial_delay_ms cannot exceed max_delay_ms",
                ));
            }
        }
        for (field, url) in [
            ("storage_base_url", &self.storage_base_url),
            ("upload_base_url", &self.upload_base_url),
        ] {
            if !(url.starts_with("http://") || url.starts_with("https://")) {
                return Err(JobGraphError::configuration(format!(
                    "{field} must be an http(s) url, got '{url}'"
                )));
            }
        }
        Ok(())
    }

    /// Applies every field set in `overrides` on top of `base`
    pub fn merge(base: &Self, overrides: &ConfigOverrides) -> Result<Self> {
        let merged = Self {
            max_concurrency: overrides.max_concurrency.unwrap_or(base.max_concurrency),
            task_timeout_secs: overrides.task_timeout_secs.unwrap_or(base.task_timeout_secs),
            upload_timeout_secs: overrides
                .upload_timeout_secs
                .unwrap_or(base.upload_timeout_secs),
            max_attempts: overrides.max_attempts.unwrap_or(base.max_attempts),
            retry_strategy: overrides
                .retry_strategy
                .clone()
                .unwrap_or_else(|| base.retry_strategy.clone()),
            event_buffer: overrides.event_buffer.unwrap_or(base.event_buffer),
            poll_interval_ms: overrides.poll_interval_ms.unwrap_or(base.poll_interval_ms),
            poll_max_attempts: overrides.poll_max_attempts.unwrap_or(base.poll_max_attempts),
            storage_base_url: overrides
                .storage_base_url
                .clone()
                .unwrap_or_else(|| base.storage_base_url.clone()),
            upload_base_url: overrides
                .upload_base_url
                .clone()
                .unwrap_or_else(|| base.upload_base_url.clone()),
        };

        merged.validate()?;
        Ok(merged)
    }

    /// Parse a YAML document; omitted fields keep their defaults.
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        let config: EngineConfig = serde_yaml::from_str(yaml)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_yaml_file(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path)
            .map_err(|e| JobGraphError::io(format!("read config {}", path.display()), e))?;
        Self::from_yaml_str(&content)
    }

    pub fn task_timeout(&self) -> Option<Duration> {
        self.task_timeout_secs.map(Duration::from_secs)
    }

    pub fn upload_timeout(&self) -> Option<Duration> {
        self.upload_timeout_secs.map(Duration::from_secs)
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }
}

/// Partial configuration layered over an [`EngineConfig`] by
/// [`EngineConfig::merge`]. Unset fields keep the base value, so an
/// override may also restore a default explicitly.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConfigOverrides {
    pub max_concurrency: Option<usize>,
    /// `Some(None)` lifts the timeout
    pub task_timeout_secs: Option<Option<u64>>,
    pub upload_timeout_secs: Option<Option<u64>>,
    pub max_attempts: Option<u32>,
    pub retry_strategy: Option<RetryStrategy>,
    pub event_buffer: Option<usize>,
    pub poll_interval_ms: Option<u64>,
    pub poll_max_attempts: Option<u32>,
    pub storage_base_url: Option<String>,
    pub upload_base_url: Option<String>,
}

impl ConfigOverrides {
    pub fn from_yaml_str(yaml: &str) -> Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }
}

/// Builder for EngineConfig
pub struct EngineConfigBuilder {
    config: EngineConfig,
}

impl EngineConfigBuilder {
    pub fn new() -> Self {
        Self {
            config: EngineConfig::default(),
        }
    }

    pub fn max_concurrency(mut self, max_concurrency: usize) -> Self {
        self.config.max_concurrency = max_concurrency;
        self
    }

    pub fn task_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.task_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    pub fn upload_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.config.upload_timeout_secs = timeout.map(|t| t.as_secs().max(1));
        self
    }

    pub fn max_attempts(mut self, attempts: u32) -> Self {
        self.config.max_attempts = attempts;
        self
    }

    pub fn retry_strategy(mut self, strategy: RetryStrategy) -> Self {
        self.config.retry_strategy = strategy;
        self
    }

    pub fn event_buffer(mut self, capacity: usize) -> Self {
        self.config.event_buffer = capacity;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn poll_max_attempts(mut self, attempts: u32) -> Self {
        self.config.poll_max_attempts = attempts;
        self
    }

    pub fn storage_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.storage_base_url = url.into();
        self
    }

    pub fn upload_base_url(mut self, url: impl Into<String>) -> Self {
        self.config.upload_base_url = url.into();
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<EngineConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

impl Default for EngineConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_default_config_is_valid() {
        assert!(EngineConfig::default().validate().is_ok());
    }

    #[test]
    fn test_builder_rejects_zero_concurrency() {
        let result = EngineConfig::builder().max_concurrency(0).build();
        assert!(matches!(result, Err(JobGraphError::Configuration { .. })));
    }

    #[test]
    fn test_yaml_keeps_defaults_for_missing_fields() {
        let config = EngineConfig::from_yaml_str(
            "max_concurrency: 8\nretry_strategy: immediate\n",
        )
        .unwrap();
        assert_eq!(config.max_concurrency, 8);
        assert_eq!(config.retry_strategy, RetryStrategy::Immediate);
        assert_eq!(config.poll_max_attempts, 10);
        assert_eq!(config.task_timeout_secs, Some(300));
    }

    #[test]
    fn test_yaml_rejects_bad_url() {
        let result = EngineConfig::from_yaml_str("storage_base_url: ftp://files\n");
        assert!(matches!(result, Err(JobGraphError::Configuration { .. })));
    }

    #[test]
    fn test_merge_prefers_override() {
        let base = EngineConfig::builder().max_concurrency(6).build().unwrap();
        let overrides = ConfigOverrides {
            max_attempts: Some(4),
            ..Default::default()
        };
        let merged = EngineConfig::merge(&base, &overrides).unwrap();
        assert_eq!(merged.max_concurrency, 6);
        assert_eq!(merged.max_attempts, 4);
    }

    #[test]
    fn test_merge_applies_override_equal_to_default() {
        let base = EngineConfig::builder()
            .max_concurrency(6)
            .task_timeout(None)
            .build()
            .unwrap();
        let overrides = ConfigOverrides::from_yaml_str(
            "max_concurrency: 3\ntask_timeout_secs: 300\n",
        )
        .unwrap();
        let merged = EngineConfig::merge(&base, &overrides).unwrap();
        assert_eq!(merged.max_concurrency, 3);
        assert_eq!(merged.task_timeout_secs, Some(300));
        assert_eq!(merged.max_attempts, base.max_attempts);
    }

    #[test]
    fn test_merge_validates_result() {
        let overrides = ConfigOverrides {
            upload_timeout_secs: Some(Some(0)),
            ..Default::default()
        };
        let result = EngineConfig::merge(&EngineConfig::default(), &overrides);
        assert!(matches!(result, Err(JobGraphError::Configuration { .. })));
    }

    #[test]
    fn test_exponential_delay_is_capped() {
        let strategy = RetryStrategy::Exponential {
            initial_delay_ms: 100,
            max_delay_ms: 400,
            multiplier: 2.0,
        };
        assert!(strategy.delay_for(1) >= Duration::from_millis(100));
        assert!(strategy.delay_for(10) <= Duration::from_millis(440));
        assert_eq!(RetryStrategy::Immediate.delay_for(3), Duration::ZERO);
    }
}
