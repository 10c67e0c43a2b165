//! QUARRY Core - Query Cache Types
//!
//! Pure data types shared by the cache engine: keys and their canonical
//! identity, state snapshots, options and defaults, retry policy math and
//! errors. Nothing in this crate spawns tasks or touches a runtime.

pub mod constants;
pub mod error;
pub mod key;
pub mod options;
pub mod retry;
pub mod state;
pub mod stats;

use chrono::{DateTime, Utc};

/// Wall-clock timestamp stored in state snapshots.
pub type Timestamp = DateTime<Utc>;

pub use error::{ConfigError, QuarryError, QuarryResult, QueryError, QueryResult};
pub use key::{canonicalize, keys_equal, QueryKey};
pub use options::{
    DefaultOptions, MutationOptions, QueryOptions, ResolvedMutationOptions, ResolvedOptions, NEVER,
};
pub use retry::{RetryDelay, RetryDelayFn, RetryPolicy, RetryPredicate};
pub use state::{FetchStatus, MutationState, MutationStatus, QueryData, QueryState, QueryStatus};
pub use stats::CacheStats;

#[doc(hidden)]
pub mod __private {
    pub use serde_json;
}
