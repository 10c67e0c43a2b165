//! Default values for QUARRY configuration.

/// Data is considered stale as soon as it lands.
pub const DEFAULT_STALE_TIME_MS: u64 = 0;

/// Retention window for unobserved queries (5 minutes).
pub const DEFAULT_CACHE_TIME_MS: u64 = 5 * 60 * 1000;

/// Retries for failed query fetches.
pub const DEFAULT_RETRY_COUNT: u32 = 3;

/// Retries for failed mutations. Writes are not retried unless asked.
pub const DEFAULT_MUTATION_RETRY_COUNT: u32 = 0;

/// Base delay for exponential backoff.
pub const DEFAULT_RETRY_BASE_DELAY_MS: u64 = 1000;

/// Upper bound for exponential backoff.
pub const DEFAULT_RETRY_MAX_DELAY_MS: u64 = 30_000;

/// Period of the cache-wide garbage collection sweep.
pub const DEFAULT_GC_INTERVAL_MS: u64 = 60_000;
