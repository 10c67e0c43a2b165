//! QUARRY Cache - Async Query Cache Engine
//!
//! Keyed cache entries that de-duplicate concurrent fetches, retry with
//! backoff, track staleness, notify observers and collect themselves once
//! unobserved. [`QueryClient`] is the usual entry point; [`Mutation`] runs
//! one-shot writes alongside it.
//!
//! All timers and fetches run as tasks on the ambient tokio runtime. Without
//! a runtime, reads and direct writes still work but fetches fail with
//! [`QueryError::NoRuntime`].

pub mod cache;
pub mod client;
pub mod environment;
pub mod gc;
pub mod global;
pub mod mutation;
pub mod observer;
pub mod query;
pub mod query_fn;
pub mod signal;

mod retryer;
mod sync;

pub use cache::{AnyQuery, QueryCache};
pub use client::QueryClient;
pub use environment::Environment;
pub use gc::{GcHandle, GcSweepMetrics, GcSweepSnapshot};
pub use global::{
    get_query_client, has_query_client, replace_query_client, set_query_client, take_query_client,
};
pub use mutation::{Mutation, MutationHooks};
pub use observer::{Observer, Subscription};
pub use query::{Query, Updater};
pub use query_fn::{MutationFn, QueryContext, QueryFn};
pub use signal::{AbortController, AbortSignal};

// Re-export core types so most callers need only this crate
pub use quarry_core::{
    query_key, CacheStats, ConfigError, DefaultOptions, FetchStatus, MutationOptions,
    MutationState, MutationStatus, QuarryError, QuarryResult, QueryData, QueryError, QueryKey,
    QueryOptions, QueryResult, QueryState, QueryStatus, ResolvedMutationOptions, ResolvedOptions,
    RetryDelay, RetryPolicy, Timestamp, NEVER,
};
