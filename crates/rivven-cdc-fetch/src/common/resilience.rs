//! Retry primitives for split fetching
//!
//! A failed attempt on a split is retried on a *fresh* fetch context from the
//! last checkpointed offset. This module decides whether and when.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::time::Duration;

/// Transient failure kinds a runner may retry on.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RetriableErrorType {
    /// The log connection or stream dropped
    ConnectionLost,
    ConnectionRefused,
    Timeout,
    /// Any other error classified as transient
    TemporaryFailure,
}

impl RetriableErrorType {
    pub const ALL: [RetriableErrorType; 4] = [
        Self::ConnectionLost,
        Self::ConnectionRefused,
        Self::Timeout,
        Self::TemporaryFailure,
    ];

    /// Every kind; the set a runner retries on unless told otherwise.
    pub fn defaults() -> HashSet<Self> {
        HashSet::from(Self::ALL)
    }
}

/// How often, and how far apart, a split attempt is retried.
///
/// Delays double per attempt from `retry_delay` up to `max_delay`. With a
/// non-zero jitter each delay is spread by up to `jitter * delay` in either
/// direction, deterministically per attempt number.
///
/// ```rust
/// use rivven_cdc_fetch::common::{RetriableErrorType, RetryConfig};
/// use std::time::Duration;
///
/// let retry = RetryConfig::builder()
///     .max_retries(5)
///     .retry_delay(Duration::from_millis(200))
///     .max_delay(Duration::from_secs(10))
///     .build();
///
/// assert_eq!(retry.max_retries(), 5);
/// assert_eq!(retry.delay_for_attempt(3), Duration::from_millis(1600));
/// assert!(retry.is_retriable(&RetriableErrorType::ConnectionLost));
/// ```
#[derive(Debug, Clone)]
pub struct RetryConfig {
    /// `-1` retries forever, `0` never retries
    max_retries: i32,
    retry_delay: Duration,
    max_delay: Duration,
    jitter: f64,
    retriable_errors: HashSet<RetriableErrorType>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            retry_delay: Duration::from_millis(500),
            max_delay: Duration::from_secs(30),
            jitter: 0.0,
            retriable_errors: RetriableErrorType::defaults(),
        }
    }
}

impl RetryConfig {
    pub fn builder() -> RetryConfigBuilder {
        RetryConfigBuilder {
            config: Self::default(),
        }
    }

    /// A policy that fails on the first error.
    pub fn disabled() -> Self {
        Self {
            max_retries: 0,
            ..Self::default()
        }
    }

    pub fn max_retries(&self) -> i32 {
        self.max_retries
    }

    pub fn retry_delay(&self) -> Duration {
        self.retry_delay
    }

    pub fn max_delay(&self) -> Duration {
        self.max_delay
    }

    pub fn is_enabled(&self) -> bool {
        self.max_retries != 0
    }

    pub fn is_retriable(&self, error_type: &RetriableErrorType) -> bool {
        self.retriable_errors.contains(error_type)
    }

    /// Whether another attempt is allowed after `retries_so_far` retries.
    pub fn should_retry(&self, retries_so_far: u32) -> bool {
        match u32::try_from(self.max_retries) {
            Ok(limit) => retries_so_far < limit,
            Err(_) => self.max_retries == -1,
        }
    }

    /// Delay before retry number `retries_so_far + 1`.
    pub fn delay_for_attempt(&self, retries_so_far: u32) -> Duration {
        let factor = 1u32.checked_shl(retries_so_far).unwrap_or(u32::MAX);
        let delay = self.retry_delay.saturating_mul(factor).min(self.max_delay);
        if self.jitter <= 0.0 {
            return delay;
        }
        // golden-ratio sequence in [0, 1), mapped to [-1, 1)
        let spread = ((retries_so_far as f64 * 0.618_033_988_749_895).fract() * 2.0) - 1.0;
        let secs = delay.as_secs_f64() * (1.0 + self.jitter * spread);
        Duration::from_secs_f64(secs.max(0.0))
    }
}

/// Builder for [`RetryConfig`], starting from the defaults.
#[derive(Debug, Clone)]
pub struct RetryConfigBuilder {
    config: RetryConfig,
}

impl RetryConfigBuilder {
    pub fn max_retries(mut self, value: i32) -> Self {
        self.config.max_retries = value;
        self
    }

    pub fn retry_delay(mut self, value: Duration) -> Self {
        self.config.retry_delay = value;
        self
    }

    pub fn max_delay(mut self, value: Duration) -> Self {
        self.config.max_delay = value;
        self
    }

    /// Clamped to `0.0..=1.0`.
    pub fn jitter(mut self, value: f64) -> Self {
        self.config.jitter = value.clamp(0.0, 1.0);
        self
    }

    pub fn retriable_errors(
        mut self,
        errors: impl IntoIterator<Item = RetriableErrorType>,
    ) -> Self {
        self.config.retriable_errors = errors.into_iter().collect();
        self
    }

    pub fn build(self) -> RetryConfig {
        self.config
    }
}
