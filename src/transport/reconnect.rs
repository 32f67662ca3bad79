//! Reconnection backoff.
//!
//! The connection state machine only relies on the two-method
//! [`ReconnectionPolicy`] contract: `next()` right before scheduling a retry,
//! `reset()` after a successful hello.

use std::fmt;
use std::time::Duration;

use rand::Rng;

use crate::core::{
    ConfigError, DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_FACTOR,
    DEFAULT_RECONNECT_JITTER, DEFAULT_RECONNECT_MAX_DELAY, MIN_RECONNECT_DELAY,
};

/// Stateful backoff calculator.
pub trait ReconnectionPolicy: Send + fmt::Debug {
    /// Delay before the next reconnect attempt. Never zero.
    fn next(&mut self) -> Duration;

    /// Forget previous attempts.
    fn reset(&mut self);

    /// Check the policy parameters. Called once at client construction.
    fn validate(&self) -> Result<(), ConfigError> {
        Ok(())
    }
}

/// Exponential backoff capped at a maximum, with optional jitter.
///
/// The `n`th delay is `min(base * factor^n, max)`, blended with a uniform
/// sample of `[0, delay]` by the jitter ratio.
#[derive(Debug, Clone)]
pub struct ExponentialReconnectionPolicy {
    base_delay: Duration,
    max_delay: Duration,
    factor: f64,
    jitter: f64,
    attempt: u32,
}

impl Default for ExponentialReconnectionPolicy {
    fn default() -> Self {
        Self::new(DEFAULT_RECONNECT_BASE_DELAY, DEFAULT_RECONNECT_MAX_DELAY)
    }
}

impl ExponentialReconnectionPolicy {
    /// Create a policy doubling from `base_delay` up to `max_delay`.
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
            factor: DEFAULT_RECONNECT_FACTOR,
            jitter: DEFAULT_RECONNECT_JITTER,
            attempt: 0,
        }
    }

    /// Set the growth factor.
    #[must_use]
    pub fn factor(mut self, factor: f64) -> Self {
        self.factor = factor;
        self
    }

    /// Set the jitter ratio (0.0 disables jitter).
    #[must_use]
    pub fn jitter(mut self, jitter: f64) -> Self {
        self.jitter = jitter;
        self
    }

    /// Number of delays handed out since the last reset.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Un-jittered delay for the given attempt.
    fn capped_delay(&self, attempt: u32) -> f64 {
        let base = self.base_delay.as_secs_f64();
        let max = self.max_delay.as_secs_f64();
        let exponent = i32::try_from(attempt).unwrap_or(i32::MAX);
        (base * self.factor.powi(exponent)).min(max)
    }
}

impl ReconnectionPolicy for ExponentialReconnectionPolicy {
    fn next(&mut self) -> Duration {
        let capped = self.capped_delay(self.attempt);
        self.attempt = self.attempt.saturating_add(1);

        let delay = if self.jitter == 0.0 {
            capped
        } else {
            let sample = rand::thread_rng().gen_range(0.0..=capped);
            capped * (1.0 - self.jitter) + sample * self.jitter
        };

        Duration::from_secs_f64(delay)
            .min(self.max_delay)
            .max(MIN_RECONNECT_DELAY)
    }

    fn reset(&mut self) {
        self.attempt = 0;
    }

    fn validate(&self) -> Result<(), ConfigError> {
        let invalid = |msg: &str| Err(ConfigError::InvalidReconnectionPolicy(msg.to_string()));

        if self.base_delay.is_zero() {
            return invalid("base delay must be > 0");
        }
        if self.max_delay < self.base_delay {
            return invalid("max delay must be >= base delay");
        }
        if self.factor < 1.0 || !self.factor.is_finite() {
            return invalid("backoff factor must be >= 1.0");
        }
        if !(0.0..=1.0).contains(&self.jitter) {
            return invalid("jitter must be between 0.0 and 1.0");
        }
        Ok(())
    }
}
