// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Retry logic with exponential backoff.
//!
//! Provides configurable retry behavior for transient failures.
//! Different presets are available for different use cases.
//!
//! # Example
//!
//! ```
//! use room_sync::RetryConfig;
//! use std::time::Duration;
//!
//! // Startup: fail fast on bad config
//! let startup = RetryConfig::startup();
//! assert_eq!(startup.max_retries, Some(5));
//!
//! // Watch feeds and the syncer never give up
//! let watch = RetryConfig::watch();
//! assert_eq!(watch.max_retries, None);
//! assert_eq!(watch.max_delay, Duration::from_secs(3));
//! ```

use std::future::Future;
use std::time::Duration;
use tokio::time::sleep;
use tracing::{info, warn};

/// Configuration for connection/operation retry behavior.
///
/// Use the preset constructors for common patterns:
/// - [`RetryConfig::startup()`] - Fast-fail for initial connections
/// - [`RetryConfig::watch()`] - Infinite retry for watch feeds and the syncer
#[derive(Debug, Clone)]
pub struct RetryConfig {
    pub initial_delay: Duration,
    pub max_delay: Duration,
    pub factor: f64,
    pub max_retries: Option<usize>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self::watch()
    }
}

impl RetryConfig {
    /// Fast-fail retry for initial startup connection.
    /// Attempts 5 times with exponential backoff, failing after ~5 seconds.
    #[must_use]
    pub fn startup() -> Self {
        Self {
            max_retries: Some(5),
            initial_delay: Duration::from_millis(200),
            max_delay: Duration::from_secs(2),
            factor: 2.0,
        }
    }

    /// Infinite retry with a short floor and a 3 second ceiling.
    /// Used by room watch feeds and by the syncer, which sit off the hot path
    /// and must outlive any store or database outage.
    #[must_use]
    pub fn watch() -> Self {
        Self::unbounded(Duration::from_millis(10), Duration::from_secs(3))
    }

    /// Infinite retry between the given bounds.
    #[must_use]
    pub fn unbounded(initial_delay: Duration, max_delay: Duration) -> Self {
        Self {
            max_retries: None,
            initial_delay,
            max_delay,
            factor: 2.0,
        }
    }

    /// Fast retry for tests (minimal delays)
    #[cfg(test)]
    pub fn test() -> Self {
        Self {
            max_retries: Some(3),
            initial_delay: Duration::from_millis(1),
            max_delay: Duration::from_millis(10),
            factor: 2.0,
        }
    }
}

/// Exponential delay sequence derived from a [`RetryConfig`].
///
/// Loops that own their own retry flow (watch feeds, the syncer) keep one of
/// these around and call [`Backoff::reset`] after every success.
#[derive(Debug, Clone)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
    attempts: usize,
}

impl Backoff {
    #[must_use]
    pub fn new(config: RetryConfig) -> Self {
        let next = config.initial_delay;
        Self { config, next, attempts: 0 }
    }

    /// Delay to wait before the next attempt; grows the following one.
    pub fn next_delay(&mut self) -> Duration {
        let delay = self.next;
        self.attempts += 1;
        self.next = self.next.mul_f64(self.config.factor).min(self.config.max_delay);
        delay
    }

    /// Failures recorded since the last reset.
    #[must_use]
    pub fn attempts(&self) -> usize {
        self.attempts
    }

    /// Whether the configured retry budget is used up.
    #[must_use]
    pub fn exhausted(&self) -> bool {
        matches!(self.config.max_retries, Some(max) if self.attempts >= max)
    }

    pub fn reset(&mut self) {
        self.next = self.config.initial_delay;
        self.attempts = 0;
    }
}

/// Run `operation` until it succeeds or `config`'s retry budget is spent,
/// sleeping between attempts. The last error is returned on exhaustion.
pub async fn retry<F, Fut, T, E>(
    operation_name: &str,
    config: &RetryConfig,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut backoff = Backoff::new(config.clone());
    loop {
        let err = match operation().await {
            Ok(val) => {
                if backoff.attempts() > 0 {
                    info!(operation = operation_name, retries = backoff.attempts(), "Operation recovered");
                }
                return Ok(val);
            }
            Err(err) => err,
        };

        let delay = backoff.next_delay();
        if backoff.exhausted() {
            warn!(operation = operation_name, attempts = backoff.attempts(), error = %err, "Giving up");
            return Err(err);
        }
        warn!(
            operation = operation_name,
            attempt = backoff.attempts(),
            max_retries = ?config.max_retries,
            delay_ms = delay.as_millis() as u64,
            error = %err,
            "Operation failed, retrying"
        );
        sleep(delay).await;
    }
}
