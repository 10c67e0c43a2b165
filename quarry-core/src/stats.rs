//! Aggregate cache statistics.

use serde::{Deserialize, Serialize};

/// Point-in-time counts over every entry in a cache.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStats {
    /// Entries currently registered.
    pub total_queries: usize,
    /// Entries with at least one observer.
    pub active_queries: usize,
    /// Entries the next sweep would remove.
    pub gc_ready_queries: usize,
    /// Entries with a fetch in flight.
    pub fetching_queries: usize,
}

impl CacheStats {
    /// Entries without observers.
    pub fn inactive_queries(&self) -> usize {
        self.total_queries.saturating_sub(self.active_queries)
    }

    /// Fraction of entries that are observed (0.0 to 1.0).
    pub fn active_ratio(&self) -> f64 {
        if self.total_queries == 0 {
            0.0
        } else {
            self.active_queries as f64 / self.total_queries as f64
        }
    }
}
