//! Centralized retry policy with exponential backoff.
//!
//! Every component that talks to something that can fail transiently
//! (page analyzer, model invoker, store, broker) goes through
//! [`RetryPolicy::run`]. Whether an error is worth another attempt is
//! decided by the [`Retryable`] impl of the error type.

use std::fmt::Display;
use std::thread;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::db::DatabaseError;
use crate::error::{BrokerError, CapabilityError};
use crate::store::StoreError;

/// Classifies errors into "try again" and "give up now".
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for CapabilityError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for DatabaseError {
    fn is_retryable(&self) -> bool {
        self.is_transient()
    }
}

impl Retryable for StoreError {
    fn is_retryable(&self) -> bool {
        match self {
            StoreError::Database(e) => e.is_transient(),
            _ => false,
        }
    }
}

impl Retryable for BrokerError {
    fn is_retryable(&self) -> bool {
        matches!(self, BrokerError::Unavailable(_))
    }
}

/// Bounded exponential backoff.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Total attempts including the first one. Always at least 1.
    pub max_attempts: u32,
    pub initial_backoff_ms: u64,
    pub max_backoff_ms: u64,
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            initial_backoff_ms: 200,
            max_backoff_ms: 5_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// A policy that retries `max_attempts` times without sleeping.
    pub fn immediate(max_attempts: u32) -> Self {
        Self {
            max_attempts,
            initial_backoff_ms: 0,
            max_backoff_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Startup connection policy: 10 attempts, 5 s apart.
    pub fn startup() -> Self {
        Self {
            max_attempts: 10,
            initial_backoff_ms: 5_000,
            max_backoff_ms: 5_000,
            multiplier: 1.0,
        }
    }

    /// Delay to wait after the given failed attempt (1-indexed).
    pub fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let millis = self.initial_backoff_ms as f64 * self.multiplier.max(1.0).powi(exponent);
        Duration::from_millis(millis.min(self.max_backoff_ms as f64) as u64)
    }

    fn attempts(&self) -> u32 {
        self.max_attempts.max(1)
    }

    /// Runs `op` until it succeeds, fails with a non-retryable error, or
    /// the attempt budget is spent. The closure receives the attempt number
    /// starting at 1. The last error is returned on failure.
    pub fn run<T, E, F>(&self, operation: &str, mut op: F) -> Result<T, E>
    where
        E: Retryable + Display,
        F: FnMut(u32) -> Result<T, E>,
    {
        let attempts = self.attempts();
        let mut attempt = 1;
        loop {
            match op(attempt) {
                Ok(value) => return Ok(value),
                Err(e) if e.is_retryable() && attempt < attempts => {
                    let delay = self.backoff_for(attempt);
                    log::warn!(
                        "{} failed (attempt {}/{}), retrying in {:?}: {}",
                        operation,
                        attempt,
                        attempts,
                        delay,
                        e
                    );
                    if !delay.is_zero() {
                        thread::sleep(delay);
                    }
                    attempt += 1;
                }
                Err(e) => {
                    if e.is_retryable() {
                        log::error!("{} gave up after {} attempts: {}", operation, attempt, e);
                    } else {
                        log::debug!("{} failed permanently: {}", operation, e);
                    }
                    return Err(e);
                }
            }
        }
    }
}
