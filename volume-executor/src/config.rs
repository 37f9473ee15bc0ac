//! Executor configuration.
//!
//! Every tuning knob has a default so an empty JSON object is a valid
//! configuration. The binary maps its command line flags onto these structs.

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::backoff::Backoff;

/// Dispatcher poll interval in milliseconds
pub const DEFAULT_POLL_INTERVAL_MS: u64 = 2000;
/// Maximum task references per batched status query
pub const DEFAULT_BATCH_SIZE: usize = 100;
/// Abandoned tasks are purged after this long regardless of backend status
pub const DEFAULT_ABANDON_GRACE_SECS: u64 = 600;
/// How long a caller waits for its task before abandoning it
pub const DEFAULT_OPERATION_TIMEOUT_SECS: u64 = 300;
/// Interval between idempotency record cleanup passes
pub const DEFAULT_CLEANUP_INTERVAL_SECS: u64 = 3600;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("invalid configuration: {0}")]
    Invalid(String),

    #[error("failed to parse configuration: {0}")]
    Parse(#[from] serde_json::Error),

    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),
}

/// Task dispatcher tuning.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DispatcherConfig {
    pub poll_interval_ms: u64,
    pub batch_size: usize,
    pub abandon_grace_secs: u64,
}

impl Default for DispatcherConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: DEFAULT_POLL_INTERVAL_MS,
            batch_size: DEFAULT_BATCH_SIZE,
            abandon_grace_secs: DEFAULT_ABANDON_GRACE_SECS,
        }
    }
}

impl DispatcherConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn abandon_grace_period(&self) -> Duration {
        Duration::from_secs(self.abandon_grace_secs)
    }
}

/// Top-level executor configuration.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    pub dispatcher: DispatcherConfig,
    /// Backend submission retries (transient rejections only)
    pub submit_backoff: Backoff,
    /// Retries of a failed batched status query within one poll round
    pub poll_backoff: Backoff,
    /// Optimistic-concurrency retries on idempotency record writes
    pub store_backoff: Backoff,
    /// Record store readiness check at startup
    pub bootstrap_backoff: Backoff,
    pub operation_timeout_secs: u64,
    pub cleanup_interval_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            dispatcher: DispatcherConfig::default(),
            submit_backoff: Backoff::default(),
            poll_backoff: Backoff::new(
                Duration::from_millis(200),
                2,
                Duration::from_secs(2),
                3,
            ),
            store_backoff: Backoff::new(
                Duration::from_millis(50),
                2,
                Duration::from_secs(2),
                8,
            ),
            bootstrap_backoff: Backoff::new(
                Duration::from_millis(500),
                2,
                Duration::from_secs(30),
                10,
            ),
            operation_timeout_secs: DEFAULT_OPERATION_TIMEOUT_SECS,
            cleanup_interval_secs: DEFAULT_CLEANUP_INTERVAL_SECS,
        }
    }
}

impl ExecutorConfig {
    pub fn from_json(json: &str) -> Result<Self, ConfigError> {
        let config: Self = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub async fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let content = tokio::fs::read_to_string(path).await?;
        Self::from_json(&content)
    }

    pub fn operation_timeout(&self) -> Duration {
        Duration::from_secs(self.operation_timeout_secs)
    }

    pub fn cleanup_interval(&self) -> Duration {
        Duration::from_secs(self.cleanup_interval_secs)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.dispatcher.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.poll_interval_ms must be positive".to_string(),
            ));
        }
        if self.dispatcher.batch_size == 0 {
            return Err(ConfigError::Invalid(
                "dispatcher.batch_size must be positive".to_string(),
            ));
        }
        if self.operation_timeout_secs == 0 {
            return Err(ConfigError::Invalid(
                "operation_timeout_secs must be positive".to_string(),
            ));
        }
        if self.cleanup_interval_secs == 0 {
            return Err(ConfigError::Invalid(
                "cleanup_interval_secs must be positive".to_string(),
            ));
        }
        // A task must outlive the caller's wait before it can be purged as abandoned.
        if self.dispatcher.abandon_grace_secs < self.operation_timeout_secs {
            return Err(ConfigError::Invalid(format!(
                "dispatcher.abandon_grace_secs ({}) must be at least operation_timeout_secs ({})",
                self.dispatcher.abandon_grace_secs, self.operation_timeout_secs
            )));
        }
        for (name, backoff) in [
            ("submit_backoff", &self.submit_backoff),
            ("poll_backoff", &self.poll_backoff),
            ("store_backoff", &self.store_backoff),
            ("bootstrap_backoff", &self.bootstrap_backoff),
        ] {
            if backoff.steps == 0 {
                return Err(ConfigError::Invalid(format!("{name}.steps must be positive")));
            }
            if backoff.initial_ms > backoff.max_ms {
                return Err(ConfigError::Invalid(format!(
                    "{name}.initial_ms must not exceed max_ms"
                )));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_is_valid() {
        ExecutorConfig::default().validate().unwrap();
    }

    #[test]
    fn test_empty_json_uses_defaults() {
        let config = ExecutorConfig::from_json("{}").unwrap();
        assert_eq!(config, ExecutorConfig::default());
        assert_eq!(
            config.dispatcher.poll_interval(),
            Duration::from_millis(DEFAULT_POLL_INTERVAL_MS)
        );
    }

    #[test]
    fn test_partial_json_overrides() {
        let config = ExecutorConfig::from_json(
            r#"{"dispatcher": {"batch_size": 25}, "submit_backoff": {"steps": 6}}"#,
        )
        .unwrap();
        assert_eq!(config.dispatcher.batch_size, 25);
        assert_eq!(config.dispatcher.poll_interval_ms, DEFAULT_POLL_INTERVAL_MS);
        assert_eq!(config.submit_backoff.steps, 6);
        assert_eq!(config.submit_backoff.initial_ms, 100);
    }

    #[test]
    fn test_rejects_zero_batch_size() {
        let err = ExecutorConfig::from_json(r#"{"dispatcher": {"batch_size": 0}}"#).unwrap_err();
        assert!(err.to_string().contains("batch_size"));
    }

    #[test]
    fn test_rejects_grace_shorter_than_timeout() {
        let config = ExecutorConfig {
            operation_timeout_secs: 120,
            dispatcher: DispatcherConfig {
                abandon_grace_secs: 60,
                ..Default::default()
            },
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid(_))));
    }

    #[test]
    fn test_rejects_malformed_json() {
        assert!(matches!(
            ExecutorConfig::from_json("{not json"),
            Err(ConfigError::Parse(_))
        ));
    }

    #[tokio::test]
    async fn test_load_from_file() {
        let dir = tempfile::TempDir::new().unwrap();
        let path = dir.path().join("executor.json");
        tokio::fs::write(&path, r#"{"operation_timeout_secs": 30}"#)
            .await
            .unwrap();

        let config = ExecutorConfig::load(&path).await.unwrap();
        assert_eq!(config.operation_timeout(), Duration::from_secs(30));
    }
}
