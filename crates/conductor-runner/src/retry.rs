use std::time::Duration;

use conductor_core::config::RetryConfig;

use crate::error::FailureClass;
use crate::graph::RetrySpec;

/// Effective retry policy for one node.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
}

impl RetryPolicy {
    pub fn from_config(config: &RetryConfig) -> Self {
        Self {
            max_attempts: config.max_attempts.max(1),
            initial_backoff_ms: config.initial_backoff_ms,
            max_backoff_ms: config.max_backoff_ms,
        }
    }

    /// Apply a node's overrides on top of the defaults.
    pub fn merged(self, spec: Option<&RetrySpec>) -> Self {
        let Some(spec) = spec else {
            return self;
        };
        Self {
            max_attempts: spec.max_attempts.unwrap_or(self.max_attempts).max(1),
            initial_backoff_ms: spec.initial_backoff_ms.unwrap_or(self.initial_backoff_ms),
            max_backoff_ms: spec.max_backoff_ms.unwrap_or(self.max_backoff_ms),
        }
    }

    /// Transient failures retry until `max_attempts` is used up. Terminal ones never do.
    pub fn should_retry(&self, attempts_made: u32, class: FailureClass) -> bool {
        class == FailureClass::Transient && attempts_made < self.max_attempts
    }

    /// Delay before the attempt following failed attempt number `attempts_made`.
    pub fn backoff(&self, attempts_made: u32) -> Duration {
        calculate_backoff(attempts_made.saturating_sub(1), self)
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::from_config(&RetryConfig::default())
    }
}

fn calculate_backoff(attempt: u32, policy: &RetryPolicy) -> Duration {
    let ms = policy
        .initial_backoff_ms
        .saturating_mul(2u64.saturating_pow(attempt))
        .min(policy.max_backoff_ms);
    // Add jitter: 0.8x to 1.2x
    let jitter = 0.8 + rand::random::<f64>() * 0.4;
    Duration::from_millis((ms as f64 * jitter) as u64)
}
