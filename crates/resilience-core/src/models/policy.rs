//! Retry policy model and its merge rules

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{Error, Result};

/// Backoff and attempt limits applied to one task
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts allowed, first one included
    pub max_attempts: u32,
    /// Delay before the second attempt (ms)
    pub initial_delay_ms: u64,
    /// Upper bound of the pre-jitter delay (ms)
    pub max_delay_ms: u64,
    /// Exponential growth factor
    pub backoff_multiplier: f64,
    /// Whether to randomize delays
    pub jitter: bool,
    /// Relative jitter amplitude, 0.1 = +/-10%
    pub jitter_range: f64,
    /// Whether failures under this policy may be retried at all
    pub recoverable: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_delay_ms: 1_000,
            max_delay_ms: 30_000,
            backoff_multiplier: 2.0,
            jitter: true,
            jitter_range: 0.1,
            recoverable: true,
        }
    }
}

impl RetryPolicy {
    /// Apply an override on top of this policy. Unset fields keep their value.
    #[must_use]
    pub fn merge(&self, over: &PolicyOverride) -> Self {
        Self {
            max_attempts: over.max_attempts.unwrap_or(self.max_attempts),
            initial_delay_ms: over.initial_delay_ms.unwrap_or(self.initial_delay_ms),
            max_delay_ms: over.max_delay_ms.unwrap_or(self.max_delay_ms),
            backoff_multiplier: over.backoff_multiplier.unwrap_or(self.backoff_multiplier),
            jitter: over.jitter.unwrap_or(self.jitter),
            jitter_range: over.jitter_range.unwrap_or(self.jitter_range),
            recoverable: over.recoverable.unwrap_or(self.recoverable),
        }
    }

    /// Delay after the given failed attempt (1-based), before jitter.
    ///
    /// `min(initial * multiplier^(attempt-1), max)`; non-decreasing in `attempt`.
    pub fn base_delay(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(i32::MAX as u32) as i32;
        let raw = self.initial_delay_ms as f64 * self.backoff_multiplier.powi(exponent);
        let capped = if raw.is_finite() {
            raw.min(self.max_delay_ms as f64)
        } else {
            self.max_delay_ms as f64
        };
        Duration::from_millis(capped.max(0.0) as u64)
    }

    /// Check that the policy is usable
    pub fn validate(&self) -> Result<()> {
        if self.max_attempts == 0 {
            return Err(Error::validation("max_attempts must be at least 1"));
        }
        if !(self.backoff_multiplier >= 1.0) {
            return Err(Error::validation(format!(
                "backoff_multiplier must be >= 1.0 (got {})",
                self.backoff_multiplier
            )));
        }
        if !(0.0..=1.0).contains(&self.jitter_range) {
            return Err(Error::validation(format!(
                "jitter_range must be within [0, 1] (got {})",
                self.jitter_range
            )));
        }
        if self.initial_delay_ms > self.max_delay_ms {
            return Err(Error::validation(format!(
                "initial_delay_ms ({}) exceeds max_delay_ms ({})",
                self.initial_delay_ms, self.max_delay_ms
            )));
        }
        Ok(())
    }
}

/// Partial policy; `None` fields inherit from the base
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PolicyOverride {
    pub max_attempts: Option<u32>,
    pub initial_delay_ms: Option<u64>,
    pub max_delay_ms: Option<u64>,
    pub backoff_multiplier: Option<f64>,
    pub jitter: Option<bool>,
    pub jitter_range: Option<f64>,
    pub recoverable: Option<bool>,
}

impl PolicyOverride {
    #[must_use]
    pub fn max_attempts(mut self, n: u32) -> Self {
        self.max_attempts = Some(n);
        self
    }

    #[must_use]
    pub fn initial_delay_ms(mut self, ms: u64) -> Self {
        self.initial_delay_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn max_delay_ms(mut self, ms: u64) -> Self {
        self.max_delay_ms = Some(ms);
        self
    }

    #[must_use]
    pub fn backoff_multiplier(mut self, factor: f64) -> Self {
        self.backoff_multiplier = Some(factor);
        self
    }

    #[must_use]
    pub fn jitter(mut self, enabled: bool) -> Self {
        self.jitter = Some(enabled);
        self
    }

    #[must_use]
    pub fn jitter_range(mut self, range: f64) -> Self {
        self.jitter_range = Some(range);
        self
    }

    #[must_use]
    pub fn recoverable(mut self, recoverable: bool) -> Self {
        self.recoverable = Some(recoverable);
        self
    }
}
