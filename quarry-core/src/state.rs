//! State snapshots for queries and mutations.
//!
//! Status and fetch activity are stored as enums; the boolean accessors are
//! derived from them so that exactly one of idle / loading / success / error
//! can ever describe a snapshot.

use crate::{QueryError, Timestamp};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Marker for values that can live in the query cache.
///
/// `PartialEq` lets the cache keep the previous value when a refetch
/// produces identical data (structural sharing).
pub trait QueryData: Clone + PartialEq + Send + Sync + 'static {}

impl<T> QueryData for T where T: Clone + PartialEq + Send + Sync + 'static {}

/// Result lifecycle of a query.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum QueryStatus {
    /// Never fetched, no data.
    #[default]
    Idle,
    /// First fetch in flight, no data yet.
    Loading,
    /// Last settle stored data.
    Success,
    /// Last settle stored an error.
    Error,
}

/// Whether a fetch is currently running, independent of [`QueryStatus`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum FetchStatus {
    #[default]
    Idle,
    Fetching,
}

/// Immutable snapshot of one query's state.
#[derive(Debug, Clone, PartialEq)]
pub struct QueryState<T> {
    /// Last successfully fetched (or explicitly set) value.
    pub data: Option<T>,
    /// Last terminal failure; cleared when a new fetch starts or data is set.
    pub error: Option<QueryError>,
    pub status: QueryStatus,
    pub fetch_status: FetchStatus,
    /// Cached data should be considered outdated.
    pub stale: bool,
    pub data_updated_at: Option<Timestamp>,
    pub error_updated_at: Option<Timestamp>,
    /// Number of fetches started over the query's lifetime.
    pub fetch_count: u32,
    /// Consecutive terminal failures since the last success.
    pub failure_count: u32,
    /// Bumped every time the stored data actually changes.
    pub data_version: u64,
}

impl<T> QueryState<T> {
    /// Fresh idle state. A query without data is always stale.
    pub fn new() -> Self {
        Self {
            data: None,
            error: None,
            status: QueryStatus::Idle,
            fetch_status: FetchStatus::Idle,
            stale: true,
            data_updated_at: None,
            error_updated_at: None,
            fetch_count: 0,
            failure_count: 0,
            data_version: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == QueryStatus::Idle
    }

    /// First fetch in flight with no data to show.
    pub fn is_loading(&self) -> bool {
        self.status == QueryStatus::Loading
    }

    /// Any fetch in flight, first or background.
    pub fn is_fetching(&self) -> bool {
        self.fetch_status == FetchStatus::Fetching
    }

    pub fn is_stale(&self) -> bool {
        self.stale
    }

    pub fn is_success(&self) -> bool {
        self.status == QueryStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == QueryStatus::Error
    }

    pub fn has_data(&self) -> bool {
        self.data.is_some()
    }

    /// The later of `data_updated_at` and `error_updated_at`.
    pub fn updated_at(&self) -> Option<Timestamp> {
        match (self.data_updated_at, self.error_updated_at) {
            (Some(d), Some(e)) => Some(d.max(e)),
            (d, e) => d.or(e),
        }
    }
}

impl<T> Default for QueryState<T> {
    fn default() -> Self {
        Self::new()
    }
}

// ============================================================================
// MUTATIONS
// ============================================================================

/// Lifecycle of a mutation run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
pub enum MutationStatus {
    #[default]
    Idle,
    Loading,
    Success,
    Error,
}

/// Snapshot of a mutation runner.
#[derive(Debug, Clone, PartialEq)]
pub struct MutationState<V, T> {
    pub status: MutationStatus,
    pub data: Option<T>,
    pub error: Option<QueryError>,
    /// Variables of the current or last run.
    pub variables: Option<V>,
    /// Identifier of the current or last run (UUIDv7, time-sortable).
    pub submission_id: Option<Uuid>,
    pub submitted_at: Option<Timestamp>,
    pub failure_count: u32,
}

impl<V, T> MutationState<V, T> {
    pub fn new() -> Self {
        Self {
            status: MutationStatus::Idle,
            data: None,
            error: None,
            variables: None,
            submission_id: None,
            submitted_at: None,
            failure_count: 0,
        }
    }

    pub fn is_idle(&self) -> bool {
        self.status == MutationStatus::Idle
    }

    pub fn is_loading(&self) -> bool {
        self.status == MutationStatus::Loading
    }

    pub fn is_success(&self) -> bool {
        self.status == MutationStatus::Success
    }

    pub fn is_error(&self) -> bool {
        self.status == MutationStatus::Error
    }
}

impl<V, T> Default for MutationState<V, T> {
    fn default() -> Self {
        Self::new()
    }
}
