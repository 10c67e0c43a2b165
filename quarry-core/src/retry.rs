//! Retry policy and backoff math shared by queries and mutations.
//!
//! Attempts are counted in failures: the first failure is attempt `1`. A
//! policy of `Count(n)` therefore allows up to `n + 1` invocations in total.

use crate::constants::{DEFAULT_RETRY_BASE_DELAY_MS, DEFAULT_RETRY_MAX_DELAY_MS};
use crate::QueryError;
use std::fmt;
use std::sync::Arc;
use std::time::Duration;

/// Decides whether a failed attempt is retried. Receives the failure count
/// (starting at 1) and the error.
pub type RetryPredicate = Arc<dyn Fn(u32, &QueryError) -> bool + Send + Sync>;

/// Computes the wait before retrying after the given failure count.
pub type RetryDelayFn = Arc<dyn Fn(u32) -> Duration + Send + Sync>;

/// Whether to retry a failed fetch or mutation.
#[derive(Clone)]
pub enum RetryPolicy {
    /// Fail on the first error.
    Never,
    /// Retry up to this many times.
    Count(u32),
    /// Retry until success or cancellation.
    Always,
    /// Ask a predicate after every failure.
    Predicate(RetryPredicate),
}

impl RetryPolicy {
    /// Build a predicate-driven policy.
    pub fn predicate<F>(f: F) -> Self
    where
        F: Fn(u32, &QueryError) -> bool + Send + Sync + 'static,
    {
        Self::Predicate(Arc::new(f))
    }

    /// Whether another attempt is authorized after `failures` failures.
    ///
    /// Cancellation is never retried regardless of policy.
    pub fn should_retry(&self, failures: u32, error: &QueryError) -> bool {
        if error.is_cancelled() {
            return false;
        }
        match self {
            Self::Never => false,
            Self::Count(max) => failures <= *max,
            Self::Always => true,
            Self::Predicate(f) => f(failures, error),
        }
    }
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self::Count(crate::constants::DEFAULT_RETRY_COUNT)
    }
}

impl From<u32> for RetryPolicy {
    fn from(count: u32) -> Self {
        if count == 0 {
            Self::Never
        } else {
            Self::Count(count)
        }
    }
}

impl From<bool> for RetryPolicy {
    fn from(retry: bool) -> Self {
        if retry {
            Self::Always
        } else {
            Self::Never
        }
    }
}

impl fmt::Debug for RetryPolicy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Never => f.write_str("Never"),
            Self::Count(n) => f.debug_tuple("Count").field(n).finish(),
            Self::Always => f.write_str("Always"),
            Self::Predicate(_) => f.write_str("Predicate(<fn>)"),
        }
    }
}

/// Wait between attempts.
#[derive(Clone)]
pub enum RetryDelay {
    Fixed(Duration),
    /// `base * 2^(failures - 1)`, capped at `max`.
    Exponential { base: Duration, max: Duration },
    Custom(RetryDelayFn),
}

impl RetryDelay {
    pub fn exponential(base: Duration, max: Duration) -> Self {
        Self::Exponential { base, max }
    }

    pub fn custom<F>(f: F) -> Self
    where
        F: Fn(u32) -> Duration + Send + Sync + 'static,
    {
        Self::Custom(Arc::new(f))
    }

    /// Delay before the attempt that follows `failures` failures.
    pub fn delay_for(&self, failures: u32) -> Duration {
        match self {
            Self::Fixed(delay) => *delay,
            Self::Exponential { base, max } => {
                let exponent = failures.saturating_sub(1).min(31);
                base.checked_mul(1u32 << exponent)
                    .map_or(*max, |delay| delay.min(*max))
            }
            Self::Custom(f) => f(failures),
        }
    }
}

impl Default for RetryDelay {
    fn default() -> Self {
        Self::Exponential {
            base: Duration::from_millis(DEFAULT_RETRY_BASE_DELAY_MS),
            max: Duration::from_millis(DEFAULT_RETRY_MAX_DELAY_MS),
        }
    }
}

impl From<Duration> for RetryDelay {
    fn from(delay: Duration) -> Self {
        Self::Fixed(delay)
    }
}

impl fmt::Debug for RetryDelay {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Fixed(d) => f.debug_tuple("Fixed").field(d).finish(),
            Self::Exponential { base, max } => f
                .debug_struct("Exponential")
                .field("base", base)
                .field("max", max)
                .finish(),
            Self::Custom(_) => f.write_str("Custom(<fn>)"),
        }
    }
}
