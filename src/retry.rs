//! Retry policy, backoff and sleeping.
//!
//! [`RetryConfig`] describes how long to wait between attempts: a fixed
//! interval, or exponential backoff with jitter to avoid a thundering herd of
//! masters polling the store in lockstep. Waiting goes through the
//! [`Sleeper`] trait so protocol code can be tested without a wall clock.
//!
//! # Example
//!
//! ```ignore
//! use kmm::retry::{retry_with_backoff, RetryConfig};
//!
//! let store = retry_with_backoff(
//!     &RetryConfig::with_max_attempts(5),
//!     "connect_etcd",
//!     || EtcdStore::connect(&settings),
//! ).await?;
//! ```

use std::time::Duration;

use async_trait::async_trait;
use rand::Rng;
use tracing::{error, warn};

/// Poll interval used when none is configured
pub const DEFAULT_POLL_INTERVAL: Duration = Duration::from_secs(20);

/// How to space out repeated attempts
#[derive(Clone, Debug, PartialEq)]
pub struct RetryConfig {
    /// Maximum number of attempts (0 = infinite); used by [`retry_with_backoff`]
    pub max_attempts: u32,
    /// Delay before the second attempt
    pub initial_delay: Duration,
    /// Upper bound for any single delay
    pub max_delay: Duration,
    /// Growth factor per attempt (1.0 = fixed interval)
    pub backoff_multiplier: f64,
    /// Scale each delay by a random factor in 0.5..1.5
    pub jitter: bool,
    /// Upper bound on the total time spent waiting (None = unbounded)
    pub max_wait: Option<Duration>,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: 0, // infinite
            initial_delay: Duration::from_millis(100),
            max_delay: Duration::from_secs(30),
            backoff_multiplier: 2.0,
            jitter: true,
            max_wait: None,
        }
    }
}

impl RetryConfig {
    /// Create a config with a maximum number of attempts
    pub fn with_max_attempts(attempts: u32) -> Self {
        Self {
            max_attempts: attempts,
            ..Default::default()
        }
    }

    /// Create a config that retries forever (infinite attempts)
    pub fn infinite() -> Self {
        Self::default()
    }

    /// Wait exactly `interval` between attempts
    pub fn fixed(interval: Duration) -> Self {
        Self {
            max_attempts: 0,
            initial_delay: interval,
            max_delay: interval,
            backoff_multiplier: 1.0,
            jitter: false,
            max_wait: None,
        }
    }

    /// Exponential backoff with jitter between `initial` and `max`
    pub fn exponential(initial: Duration, max: Duration) -> Self {
        Self {
            initial_delay: initial,
            max_delay: max,
            ..Default::default()
        }
    }

    /// Bound the total time spent waiting
    pub fn with_max_wait(mut self, max_wait: Duration) -> Self {
        self.max_wait = Some(max_wait);
        self
    }

    /// Start a fresh backoff sequence
    pub fn backoff(&self) -> Backoff {
        Backoff {
            config: self.clone(),
            next: self.initial_delay,
            waited: Duration::ZERO,
        }
    }
}

/// Stateful delay sequence produced by a [`RetryConfig`]
#[derive(Clone, Debug)]
pub struct Backoff {
    config: RetryConfig,
    next: Duration,
    waited: Duration,
}

impl Backoff {
    /// The next delay, or `None` once the wait budget is spent.
    ///
    /// The final delay is trimmed so the total never exceeds `max_wait`.
    pub fn next_delay(&mut self) -> Option<Duration> {
        let mut delay = self.next;
        if self.config.jitter {
            let factor = rand::thread_rng().gen_range(0.5..1.5);
            delay = self.scaled(delay, factor);
        }

        if let Some(max_wait) = self.config.max_wait {
            let remaining = max_wait.saturating_sub(self.waited);
            if remaining.is_zero() {
                return None;
            }
            delay = delay.min(remaining);
        }

        self.waited = self.waited.saturating_add(delay);
        self.next = self
            .scaled(self.next, self.config.backoff_multiplier)
            .min(self.config.max_delay);
        Some(delay)
    }

    /// `delay * factor`, falling back to `max_delay` when the product does
    /// not fit in a `Duration`
    fn scaled(&self, delay: Duration, factor: f64) -> Duration {
        Duration::try_from_secs_f64(delay.as_secs_f64() * factor).unwrap_or(self.config.max_delay)
    }

    /// Total delay handed out so far
    pub fn waited(&self) -> Duration {
        self.waited
    }
}

/// Suspends the current task between attempts
#[async_trait]
pub trait Sleeper: Send + Sync {
    /// Wait for `duration`
    async fn sleep(&self, duration: Duration);
}

/// [`Sleeper`] backed by the tokio timer
#[derive(Clone, Copy, Debug, Default)]
pub struct TokioSleeper;

#[async_trait]
impl Sleeper for TokioSleeper {
    async fn sleep(&self, duration: Duration) {
        tokio::time::sleep(duration).await;
    }
}

/// Execute an async operation with exponential backoff and jitter.
///
/// Retries indefinitely (or up to max_attempts if set) until success.
///
/// # Arguments
/// * `config` - Retry configuration
/// * `operation_name` - Name for logging purposes
/// * `operation` - The async operation to retry
///
/// # Returns
/// The result of the operation, or the last error if max_attempts is exhausted.
pub async fn retry_with_backoff<F, Fut, T, E>(
    config: &RetryConfig,
    operation_name: &str,
    mut operation: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: std::future::Future<Output = Result<T, E>>,
    E: std::fmt::Display,
{
    let mut attempt = 0u32;
    let mut backoff = config.backoff();

    loop {
        attempt += 1;

        match operation().await {
            Ok(result) => return Ok(result),
            Err(e) => {
                let exhausted = config.max_attempts > 0 && attempt >= config.max_attempts;
                let delay = if exhausted { None } else { backoff.next_delay() };

                let Some(delay) = delay else {
                    error!(
                        operation = %operation_name,
                        attempt = attempt,
                        error = %e,
                        "Operation failed after max retries"
                    );
                    return Err(e);
                };

                warn!(
                    operation = %operation_name,
                    attempt = attempt,
                    error = %e,
                    delay_ms = delay.as_millis(),
                    "Operation failed, retrying"
                );

                tokio::time::sleep(delay).await;
            }
        }
    }
}
