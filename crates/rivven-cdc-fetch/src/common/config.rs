//! Fetch task configuration
//!
//! ```rust
//! use rivven_cdc_fetch::common::FetchConfig;
//!
//! let config = FetchConfig::builder()
//!     .connector_name("orders-cdc")
//!     .exactly_once(true)
//!     .max_queue_size(4096)
//!     .max_batch_size(512)
//!     .build()
//!     .unwrap();
//!
//! assert!(config.exactly_once);
//! ```

use crate::common::error::{CdcError, Result};
use crate::common::resilience::RetryConfig;
use serde::{Deserialize, Serialize};
use std::time::Duration;

fn default_connector_name() -> String {
    "rivven-cdc".to_string()
}

fn default_max_queue_size() -> usize {
    8192
}

fn default_max_batch_size() -> usize {
    2048
}

fn default_poll_interval_ms() -> u64 {
    500
}

fn default_max_retries() -> i32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    500
}

fn default_max_retry_delay_ms() -> u64 {
    30_000
}

/// Settings shared by every fetch context of one connector.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FetchConfig {
    /// Name used in logs and metric labels
    #[serde(default = "default_connector_name")]
    pub connector_name: String,
    /// Deliver snapshot splits exactly once (buffers the whole split)
    #[serde(default)]
    pub exactly_once: bool,
    /// Queue capacity in records for bounded queues
    #[serde(default = "default_max_queue_size")]
    pub max_queue_size: usize,
    /// Largest batch handed to the consumer
    #[serde(default = "default_max_batch_size")]
    pub max_batch_size: usize,
    /// Soft byte limit for bounded queues (0 = none)
    #[serde(default)]
    pub max_queue_size_in_bytes: usize,
    /// How long a poll waits for records before returning an empty batch
    #[serde(default = "default_poll_interval_ms")]
    pub poll_interval_ms: u64,
    /// Retries of a split on transient errors (-1 = forever, 0 = never)
    #[serde(default = "default_max_retries")]
    pub max_retries: i32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default = "default_max_retry_delay_ms")]
    pub max_retry_delay_ms: u64,
}

impl Default for FetchConfig {
    fn default() -> Self {
        Self {
            connector_name: default_connector_name(),
            exactly_once: false,
            max_queue_size: default_max_queue_size(),
            max_batch_size: default_max_batch_size(),
            max_queue_size_in_bytes: 0,
            poll_interval_ms: default_poll_interval_ms(),
            max_retries: default_max_retries(),
            retry_delay_ms: default_retry_delay_ms(),
            max_retry_delay_ms: default_max_retry_delay_ms(),
        }
    }
}

impl FetchConfig {
    pub fn builder() -> FetchConfigBuilder {
        FetchConfigBuilder::default()
    }

    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    /// Retry policy for transient failures.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig::builder()
            .max_retries(self.max_retries)
            .retry_delay(Duration::from_millis(self.retry_delay_ms))
            .max_delay(Duration::from_millis(self.max_retry_delay_ms))
            .build()
    }

    pub fn validate(&self) -> Result<()> {
        if self.connector_name.trim().is_empty() {
            return Err(CdcError::config("connector_name must not be empty"));
        }
        if self.max_batch_size == 0 {
            return Err(CdcError::config("max_batch_size must be greater than 0"));
        }
        if self.max_queue_size <= self.max_batch_size {
            return Err(CdcError::config(format!(
                "max_queue_size ({}) must be greater than max_batch_size ({})",
                self.max_queue_size, self.max_batch_size
            )));
        }
        if self.poll_interval_ms == 0 {
            return Err(CdcError::config("poll_interval_ms must be greater than 0"));
        }
        if self.max_retries < -1 {
            return Err(CdcError::config("max_retries must be -1, 0 or positive"));
        }
        if self.retry_delay_ms > self.max_retry_delay_ms {
            return Err(CdcError::config(
                "retry_delay_ms must not exceed max_retry_delay_ms",
            ));
        }
        Ok(())
    }
}

/// Builder for [`FetchConfig`].
#[derive(Debug, Clone, Default)]
pub struct FetchConfigBuilder {
    config: FetchConfig,
}

impl FetchConfigBuilder {
    pub fn connector_name(mut self, name: impl Into<String>) -> Self {
        self.config.connector_name = name.into();
        self
    }

    pub fn exactly_once(mut self, enabled: bool) -> Self {
        self.config.exactly_once = enabled;
        self
    }

    pub fn max_queue_size(mut self, size: usize) -> Self {
        self.config.max_queue_size = size;
        self
    }

    pub fn max_batch_size(mut self, size: usize) -> Self {
        self.config.max_batch_size = size;
        self
    }

    pub fn max_queue_size_in_bytes(mut self, bytes: usize) -> Self {
        self.config.max_queue_size_in_bytes = bytes;
        self
    }

    pub fn poll_interval(mut self, interval: Duration) -> Self {
        self.config.poll_interval_ms = interval.as_millis() as u64;
        self
    }

    pub fn max_retries(mut self, retries: i32) -> Self {
        self.config.max_retries = retries;
        self
    }

    pub fn retry_delay(mut self, delay: Duration) -> Self {
        self.config.retry_delay_ms = delay.as_millis() as u64;
        self
    }

    pub fn max_retry_delay(mut self, delay: Duration) -> Self {
        self.config.max_retry_delay_ms = delay.as_millis() as u64;
        self
    }

    /// Build and validate.
    pub fn build(self) -> Result<FetchConfig> {
        self.config.validate()?;
        Ok(self.config)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults_are_valid() {
        let config = FetchConfig::default();
        config.validate().unwrap();
        assert_eq!(config.max_queue_size, 8192);
        assert_eq!(config.max_batch_size, 2048);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert!(!config.exactly_once);
    }

    #[test]
    fn test_deserialize_with_defaults() {
        let config: FetchConfig =
            serde_json::from_str(r#"{"connector_name": "orders", "exactly_once": true}"#).unwrap();
        assert_eq!(config.connector_name, "orders");
        assert!(config.exactly_once);
        assert_eq!(config.max_queue_size, 8192);
        assert_eq!(config.max_queue_size_in_bytes, 0);
    }

    #[test]
    fn test_validation() {
        assert!(FetchConfig::builder().max_batch_size(0).build().is_err());
        assert!(FetchConfig::builder()
            .max_queue_size(100)
            .max_batch_size(100)
            .build()
            .is_err());
        assert!(FetchConfig::builder()
            .poll_interval(Duration::ZERO)
            .build()
            .is_err());
        assert!(FetchConfig::builder().connector_name(" ").build().is_err());
        assert!(FetchConfig::builder().max_retries(-2).build().is_err());

        let err = FetchConfig::builder().max_batch_size(0).build().unwrap_err();
        assert!(matches!(err, CdcError::Config(_)));
    }

    #[test]
    fn test_retry_config() {
        let config = FetchConfig::builder()
            .max_retries(5)
            .retry_delay(Duration::from_millis(10))
            .max_retry_delay(Duration::from_millis(40))
            .build()
            .unwrap();
        let retry = config.retry_config();
        assert_eq!(retry.max_retries(), 5);
        assert_eq!(retry.delay_for_attempt(5), Duration::from_millis(40));
    }
}
