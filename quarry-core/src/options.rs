//! Query and mutation configuration.
//!
//! [`DefaultOptions`] is the client-wide record. Per-call [`QueryOptions`]
//! only carry what the call site wants to override; resolving the two yields
//! a complete [`ResolvedOptions`] in which call-site values win.

use crate::constants::*;
use crate::{ConfigError, QuarryError, QuarryResult, RetryDelay, RetryPolicy};
use std::time::Duration;

/// Duration used to express "never" for stale and cache windows.
pub const NEVER: Duration = Duration::MAX;

/// Per-call query options. `None` means "use the client default".
#[derive(Debug, Clone, Default)]
pub struct QueryOptions {
    /// Automatic fetching (subscribe, invalidate, focus, interval) is off when false.
    pub enabled: Option<bool>,
    pub stale_time: Option<Duration>,
    pub cache_time: Option<Duration>,
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
    pub refetch_on_window_focus: Option<bool>,
    pub refetch_on_reconnect: Option<bool>,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: Option<bool>,
    pub structural_sharing: Option<bool>,
}

impl QueryOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_enabled(mut self, enabled: bool) -> Self {
        self.enabled = Some(enabled);
        self
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = Some(stale_time);
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = Some(cache_time);
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }

    pub fn with_refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = Some(enabled);
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = Some(enabled);
        self
    }

    pub fn with_refetch_interval(mut self, interval: Duration) -> Self {
        self.refetch_interval = Some(interval);
        self
    }

    pub fn with_refetch_interval_in_background(mut self, enabled: bool) -> Self {
        self.refetch_interval_in_background = Some(enabled);
        self
    }

    pub fn with_structural_sharing(mut self, enabled: bool) -> Self {
        self.structural_sharing = Some(enabled);
        self
    }

    /// Overlay `other` on top of `self`; fields set in `other` win.
    pub fn merge(&self, other: &QueryOptions) -> QueryOptions {
        QueryOptions {
            enabled: other.enabled.or(self.enabled),
            stale_time: other.stale_time.or(self.stale_time),
            cache_time: other.cache_time.or(self.cache_time),
            retry: other.retry.clone().or_else(|| self.retry.clone()),
            retry_delay: other.retry_delay.clone().or_else(|| self.retry_delay.clone()),
            refetch_on_window_focus: other.refetch_on_window_focus.or(self.refetch_on_window_focus),
            refetch_on_reconnect: other.refetch_on_reconnect.or(self.refetch_on_reconnect),
            refetch_interval: other.refetch_interval.or(self.refetch_interval),
            refetch_interval_in_background: other
                .refetch_interval_in_background
                .or(self.refetch_interval_in_background),
            structural_sharing: other.structural_sharing.or(self.structural_sharing),
        }
    }
}

/// Per-mutation options. `None` means "use the client default".
#[derive(Debug, Clone, Default)]
pub struct MutationOptions {
    pub retry: Option<RetryPolicy>,
    pub retry_delay: Option<RetryDelay>,
}

impl MutationOptions {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = Some(retry.into());
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = Some(retry_delay.into());
        self
    }
}

/// Fully-populated query options, produced by [`DefaultOptions::resolve`].
#[derive(Debug, Clone)]
pub struct ResolvedOptions {
    pub enabled: bool,
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub refetch_on_window_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval: Option<Duration>,
    pub refetch_interval_in_background: bool,
    pub structural_sharing: bool,
}

impl ResolvedOptions {
    /// Whether fresh data should be timed out at all.
    pub fn has_stale_timer(&self) -> bool {
        !self.stale_time.is_zero() && self.stale_time != NEVER
    }
}

impl Default for ResolvedOptions {
    fn default() -> Self {
        DefaultOptions::default().resolve(&QueryOptions::default())
    }
}

/// Fully-populated mutation options.
#[derive(Debug, Clone)]
pub struct ResolvedMutationOptions {
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
}

impl Default for ResolvedMutationOptions {
    fn default() -> Self {
        DefaultOptions::default().resolve_mutation(&MutationOptions::default())
    }
}

/// Client-wide defaults merged into every query and mutation.
#[derive(Debug, Clone)]
pub struct DefaultOptions {
    pub stale_time: Duration,
    pub cache_time: Duration,
    pub retry: RetryPolicy,
    pub retry_delay: RetryDelay,
    pub mutation_retry: RetryPolicy,
    pub refetch_on_window_focus: bool,
    pub refetch_on_reconnect: bool,
    pub refetch_interval_in_background: bool,
    pub structural_sharing: bool,
    /// Period of the cache-wide sweep started by the client.
    pub gc_interval: Duration,
}

impl Default for DefaultOptions {
    fn default() -> Self {
        Self {
            stale_time: Duration::from_millis(DEFAULT_STALE_TIME_MS),
            cache_time: Duration::from_millis(DEFAULT_CACHE_TIME_MS),
            retry: RetryPolicy::from(DEFAULT_RETRY_COUNT),
            retry_delay: RetryDelay::default(),
            mutation_retry: RetryPolicy::from(DEFAULT_MUTATION_RETRY_COUNT),
            refetch_on_window_focus: true,
            refetch_on_reconnect: true,
            refetch_interval_in_background: false,
            structural_sharing: true,
            gc_interval: Duration::from_millis(DEFAULT_GC_INTERVAL_MS),
        }
    }
}

impl DefaultOptions {
    pub fn new() -> Self {
        Self::default()
    }

    /// Create from environment variables with fallback to defaults.
    ///
    /// Environment variables:
    /// - `QUARRY_STALE_TIME_MS` (default: 0)
    /// - `QUARRY_CACHE_TIME_MS` (default: 300000)
    /// - `QUARRY_RETRY`: a count, `true`/`always` or `false`/`never` (default: 3)
    /// - `QUARRY_RETRY_DELAY_MS`: exponential backoff base (default: 1000)
    /// - `QUARRY_RETRY_MAX_DELAY_MS`: exponential backoff cap (default: 30000)
    /// - `QUARRY_REFETCH_ON_WINDOW_FOCUS` (default: true)
    /// - `QUARRY_REFETCH_ON_RECONNECT` (default: true)
    /// - `QUARRY_GC_INTERVAL_MS` (default: 60000)
    pub fn from_env() -> Self {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    /// Same as [`DefaultOptions::from_env`] with a custom variable source.
    pub fn from_lookup<F>(lookup: F) -> Self
    where
        F: Fn(&str) -> Option<String>,
    {
        let defaults = Self::default();
        let millis = |name: &str, fallback: u64| {
            Duration::from_millis(
                lookup(name)
                    .and_then(|s| s.trim().parse().ok())
                    .unwrap_or(fallback),
            )
        };
        let flag = |name: &str, fallback: bool| {
            lookup(name)
                .map(|s| s.trim().to_lowercase() != "false")
                .unwrap_or(fallback)
        };

        let retry = lookup("QUARRY_RETRY")
            .and_then(|s| parse_retry(&s))
            .unwrap_or(defaults.retry);

        Self {
            stale_time: millis("QUARRY_STALE_TIME_MS", DEFAULT_STALE_TIME_MS),
            cache_time: millis("QUARRY_CACHE_TIME_MS", DEFAULT_CACHE_TIME_MS),
            retry,
            retry_delay: RetryDelay::Exponential {
                base: millis("QUARRY_RETRY_DELAY_MS", DEFAULT_RETRY_BASE_DELAY_MS),
                max: millis("QUARRY_RETRY_MAX_DELAY_MS", DEFAULT_RETRY_MAX_DELAY_MS),
            },
            mutation_retry: defaults.mutation_retry,
            refetch_on_window_focus: flag("QUARRY_REFETCH_ON_WINDOW_FOCUS", true),
            refetch_on_reconnect: flag("QUARRY_REFETCH_ON_RECONNECT", true),
            refetch_interval_in_background: defaults.refetch_interval_in_background,
            structural_sharing: defaults.structural_sharing,
            gc_interval: millis("QUARRY_GC_INTERVAL_MS", DEFAULT_GC_INTERVAL_MS),
        }
    }

    pub fn with_stale_time(mut self, stale_time: Duration) -> Self {
        self.stale_time = stale_time;
        self
    }

    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.cache_time = cache_time;
        self
    }

    pub fn with_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.retry = retry.into();
        self
    }

    pub fn with_retry_delay(mut self, retry_delay: impl Into<RetryDelay>) -> Self {
        self.retry_delay = retry_delay.into();
        self
    }

    pub fn with_mutation_retry(mut self, retry: impl Into<RetryPolicy>) -> Self {
        self.mutation_retry = retry.into();
        self
    }

    pub fn with_refetch_on_window_focus(mut self, enabled: bool) -> Self {
        self.refetch_on_window_focus = enabled;
        self
    }

    pub fn with_refetch_on_reconnect(mut self, enabled: bool) -> Self {
        self.refetch_on_reconnect = enabled;
        self
    }

    pub fn with_structural_sharing(mut self, enabled: bool) -> Self {
        self.structural_sharing = enabled;
        self
    }

    pub fn with_gc_interval(mut self, interval: Duration) -> Self {
        self.gc_interval = interval;
        self
    }

    /// Validate the configuration.
    ///
    /// Validates:
    /// - gc_interval is positive
    /// - exponential backoff base is positive and not above its cap
    /// - fixed retry delay is not `NEVER`
    pub fn validate(&self) -> QuarryResult<()> {
        if self.gc_interval.is_zero() {
            return Err(invalid("gc_interval", &self.gc_interval, "gc_interval must be positive"));
        }

        match &self.retry_delay {
            RetryDelay::Exponential { base, max } => {
                if base.is_zero() {
                    return Err(invalid("retry_delay.base", base, "backoff base must be positive"));
                }
                if base > max {
                    return Err(invalid(
                        "retry_delay.base",
                        base,
                        "backoff base must not exceed backoff max",
                    ));
                }
            }
            RetryDelay::Fixed(delay) if *delay == NEVER => {
                return Err(invalid("retry_delay", delay, "fixed retry delay must be finite"));
            }
            _ => {}
        }

        Ok(())
    }

    /// Merge per-call options over these defaults.
    pub fn resolve(&self, options: &QueryOptions) -> ResolvedOptions {
        ResolvedOptions {
            enabled: options.enabled.unwrap_or(true),
            stale_time: options.stale_time.unwrap_or(self.stale_time),
            cache_time: options.cache_time.unwrap_or(self.cache_time),
            retry: options.retry.clone().unwrap_or_else(|| self.retry.clone()),
            retry_delay: options
                .retry_delay
                .clone()
                .unwrap_or_else(|| self.retry_delay.clone()),
            refetch_on_window_focus: options
                .refetch_on_window_focus
                .unwrap_or(self.refetch_on_window_focus),
            refetch_on_reconnect: options
                .refetch_on_reconnect
                .unwrap_or(self.refetch_on_reconnect),
            refetch_interval: options.refetch_interval.filter(|d| !d.is_zero()),
            refetch_interval_in_background: options
                .refetch_interval_in_background
                .unwrap_or(self.refetch_interval_in_background),
            structural_sharing: options.structural_sharing.unwrap_or(self.structural_sharing),
        }
    }

    /// Merge per-mutation options over these defaults.
    pub fn resolve_mutation(&self, options: &MutationOptions) -> ResolvedMutationOptions {
        ResolvedMutationOptions {
            retry: options
                .retry
                .clone()
                .unwrap_or_else(|| self.mutation_retry.clone()),
            retry_delay: options
                .retry_delay
                .clone()
                .unwrap_or_else(|| self.retry_delay.clone()),
        }
    }
}

fn parse_retry(raw: &str) -> Option<RetryPolicy> {
    match raw.trim().to_lowercase().as_str() {
        "true" | "always" => Some(RetryPolicy::Always),
        "false" | "never" => Some(RetryPolicy::Never),
        other => other.parse::<u32>().ok().map(RetryPolicy::from),
    }
}

fn invalid(field: &str, value: &Duration, reason: &str) -> QuarryError {
    QuarryError::Config(ConfigError::InvalidValue {
        field: field.to_string(),
        value: format!("{:?}", value),
        reason: reason.to_string(),
    })
}
