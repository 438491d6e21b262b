//! Engine configuration.
//!
//! 読み込み順（後勝ち）:
//! 1. `EngineConfig::default()`
//! 2. `config/tabula.{toml,yaml,json}`（任意）
//! 3. 環境変数 `TABULA__SECTION__KEY`（例: `TABULA__BATCH__SIZE=50`）

use std::num::{NonZeroU32, NonZeroUsize};
use std::time::Duration;

use config::{Config, Environment, File};
use serde::{Deserialize, Serialize};

use crate::queue::RetryPolicy;

const CONFIG_FILE: &str = "config/tabula";
const ENV_PREFIX: &str = "TABULA";

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error(transparent)]
    Build(#[from] config::ConfigError),

    #[error("invalid value for {field}: {reason}")]
    Invalid { field: &'static str, reason: String },
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    pub queue: QueueConfig,
    pub batch: BatchConfig,
    pub inference: InferenceConfig,
    pub retry: RetryConfig,
    pub persistence: PersistenceConfig,
    pub context: ContextConfig,
    pub telemetry: TelemetryConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct QueueConfig {
    /// Pending tasks accepted before `submit` reports backpressure.
    pub capacity: usize,
}

impl Default for QueueConfig {
    fn default() -> Self {
        Self { capacity: 100 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct BatchConfig {
    /// Records per batch.
    pub size: usize,
    /// Concurrent inference calls per task.
    pub workers: usize,
}

impl Default for BatchConfig {
    fn default() -> Self {
        Self {
            size: 30,
            workers: 4,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct InferenceConfig {
    /// Hard timeout of one call.
    pub timeout_ms: u64,
    /// Calls per batch and round, including the first.
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
    pub max_delay_ms: u64,
    /// Client-side rate limit; unlimited when absent.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub requests_per_minute: Option<u32>,
}

impl Default for InferenceConfig {
    fn default() -> Self {
        Self {
            timeout_ms: 120_000,
            max_attempts: 3,
            base_delay_ms: 1_000,
            multiplier: 2.0,
            max_delay_ms: 60_000,
            requests_per_minute: None,
        }
    }
}

impl InferenceConfig {
    pub fn timeout(&self) -> Duration {
        Duration::from_millis(self.timeout_ms)
    }

    pub fn retry_policy(&self) -> RetryPolicy {
        RetryPolicy::new(
            Duration::from_millis(self.base_delay_ms),
            self.multiplier,
            Duration::from_millis(self.max_delay_ms),
            self.max_attempts,
        )
    }

    pub fn rate_limit(&self) -> Option<NonZeroU32> {
        self.requests_per_minute.and_then(NonZeroU32::new)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Retry rounds for missing or malformed records.
    pub max_retries: u32,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self { max_retries: 2 }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PersistenceConfig {
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub multiplier: f64,
}

impl Default for PersistenceConfig {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay_ms: 500,
            multiplier: 2.0,
        }
    }
}

impl PersistenceConfig {
    pub fn retry_policy(&self) -> RetryPolicy {
        let base = Duration::from_millis(self.base_delay_ms);
        let cap = base.mul_f64(self.multiplier.max(1.0).powi(self.max_attempts as i32));
        RetryPolicy::new(base, self.multiplier, cap, self.max_attempts)
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ContextConfig {
    pub instructions: String,
    pub rules: Vec<String>,
}

impl Default for ContextConfig {
    fn default() -> Self {
        Self {
            instructions: "Classify every record and return the completed table.".to_string(),
            rules: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct TelemetryConfig {
    /// Filter used when `RUST_LOG` is not set.
    pub level: String,
    pub json: bool,
}

impl Default for TelemetryConfig {
    fn default() -> Self {
        Self {
            level: "info".to_string(),
            json: false,
        }
    }
}

impl EngineConfig {
    /// Load from `config/tabula.*` and `TABULA__*` environment variables.
    pub fn load() -> Result<Self, ConfigError> {
        Self::load_from(CONFIG_FILE)
    }

    /// Load with an explicit config file base name (extension optional).
    pub fn load_from(file: &str) -> Result<Self, ConfigError> {
        let defaults = Config::try_from(&EngineConfig::default())?;
        let builder = Config::builder()
            .add_source(defaults)
            .add_source(File::with_name(file).required(false))
            .add_source(
                Environment::with_prefix(ENV_PREFIX)
                    .separator("__")
                    .try_parsing(true),
            );

        let cfg: EngineConfig = builder.build()?.try_deserialize()?;
        cfg.validate()?;
        tracing::debug!(
            batch_size = cfg.batch.size,
            workers = cfg.batch.workers,
            max_retries = cfg.retry.max_retries,
            capacity = cfg.queue.capacity,
            "engine configuration loaded"
        );
        Ok(cfg)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        fn invalid(field: &'static str, reason: &str) -> ConfigError {
            ConfigError::Invalid {
                field,
                reason: reason.to_string(),
            }
        }

        if self.queue.capacity == 0 {
            return Err(invalid("queue.capacity", "must be greater than zero"));
        }
        if self.batch.size == 0 {
            return Err(invalid("batch.size", "must be greater than zero"));
        }
        if self.batch.workers == 0 {
            return Err(invalid("batch.workers", "must be greater than zero"));
        }
        if self.inference.timeout_ms == 0 {
            return Err(invalid("inference.timeout_ms", "must be greater than zero"));
        }
        if self.inference.max_attempts == 0 {
            return Err(invalid("inference.max_attempts", "must be at least 1"));
        }
        if !(self.inference.multiplier >= 1.0) {
            return Err(invalid("inference.multiplier", "must be at least 1.0"));
        }
        if self.persistence.max_attempts == 0 {
            return Err(invalid("persistence.max_attempts", "must be at least 1"));
        }
        if !(self.persistence.multiplier >= 1.0) {
            return Err(invalid("persistence.multiplier", "must be at least 1.0"));
        }
        Ok(())
    }

    pub fn batch_size(&self) -> Result<NonZeroUsize, ConfigError> {
        NonZeroUsize::new(self.batch.size).ok_or(ConfigError::Invalid {
            field: "batch.size",
            reason: "must be greater than zero".to_string(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rstest::rstest;

    #[test]
    fn defaults_are_valid() {
        let cfg = EngineConfig::default();
        assert!(cfg.validate().is_ok());
        assert_eq!(cfg.batch.size, 30);
        assert_eq!(cfg.queue.capacity, 100);
        assert_eq!(cfg.inference.timeout(), Duration::from_secs(120));
        assert_eq!(cfg.inference.rate_limit(), None);
    }

    #[rstest]
    #[case::batch_size("batch.size")]
    #[case::workers("batch.workers")]
    #[case::capacity("queue.capacity")]
    fn zero_sizes_are_rejected(#[case] field: &str) {
        let mut cfg = EngineConfig::default();
        match field {
            "batch.size" => cfg.batch.size = 0,
            "batch.workers" => cfg.batch.workers = 0,
            _ => cfg.queue.capacity = 0,
        }
        let err = cfg.validate().unwrap_err();
        assert!(matches!(err, ConfigError::Invalid { field: f, .. } if f == field));
    }

    #[test]
    fn load_without_file_uses_defaults() {
        let cfg = EngineConfig::load_from("config/does-not-exist").unwrap();
        assert_eq!(cfg.batch.size, EngineConfig::default().batch.size);
        assert_eq!(cfg.retry.max_retries, 2);
    }

    #[test]
    fn retry_policies_follow_sections() {
        let cfg = EngineConfig::default();
        let transport = cfg.inference.retry_policy();
        assert_eq!(transport.max_attempts, 3);
        assert_eq!(transport.next_delay(1), Duration::from_secs(1));
        assert_eq!(transport.max_delay, Duration::from_secs(60));

        let persistence = cfg.persistence.retry_policy();
        assert_eq!(persistence.next_delay(1), Duration::from_millis(500));
        assert_eq!(persistence.next_delay(2), Duration::from_millis(1000));
    }

    #[test]
    fn config_deserializes_partial_sections() {
        let json = r#"{"batch":{"size":10},"inference":{"requests_per_minute":60}}"#;
        let cfg: EngineConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.batch.size, 10);
        assert_eq!(cfg.batch.workers, 4);
        assert_eq!(cfg.inference.rate_limit().map(NonZeroU32::get), Some(60));
    }
}
