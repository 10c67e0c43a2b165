//! Registry of queries keyed by canonical key.
//!
//! Entries of different data types live side by side behind the type-erased
//! [`AnyQuery`] trait and are downcast back to [`Query<T>`] on access.
//! Registry locks are never held while calling into an entry: operations
//! snapshot the entries they touch, release the lock, then act.

use crate::environment::Environment;
use crate::gc::{spawn_gc_sweep, GcHandle};
use crate::query::{panic_message, GcHook, Query};
use crate::sync;
use futures_util::future::BoxFuture;
use quarry_core::{
    canonicalize, CacheStats, QuarryResult, QueryData, QueryError, QueryKey, QueryResult,
    ResolvedOptions,
};
use std::any::Any;
use std::collections::HashMap;
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::{Arc, RwLock, Weak};
use std::time::Duration;
use tokio::time::Instant;

/// Type-erased view of a [`Query<T>`].
pub trait AnyQuery: Send + Sync + 'static {
    fn key(&self) -> &QueryKey;
    fn hash(&self) -> &str;
    fn data_type(&self) -> &'static str;
    fn observer_count(&self) -> usize;
    fn is_fetching(&self) -> bool;
    fn is_stale(&self) -> bool;
    fn invalidate(&self);
    fn cancel(&self);
    fn destroy(&self);
    fn can_be_garbage_collected(&self, now: Instant) -> bool;
    /// Start (or join) a refetch if observed and enabled.
    fn refetch_if_observed(&self) -> Option<BoxFuture<'static, QueryResult<()>>>;
    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync>;
}

impl<T: QueryData> AnyQuery for Query<T> {
    fn key(&self) -> &QueryKey {
        Query::key(self)
    }

    fn hash(&self) -> &str {
        Query::hash(self)
    }

    fn data_type(&self) -> &'static str {
        std::any::type_name::<T>()
    }

    fn observer_count(&self) -> usize {
        Query::observer_count(self)
    }

    fn is_fetching(&self) -> bool {
        Query::is_fetching(self)
    }

    fn is_stale(&self) -> bool {
        Query::is_stale(self)
    }

    fn invalidate(&self) {
        Query::invalidate(self)
    }

    fn cancel(&self) {
        Query::cancel(self)
    }

    fn destroy(&self) {
        Query::destroy(self)
    }

    fn can_be_garbage_collected(&self, now: Instant) -> bool {
        Query::can_be_garbage_collected(self, now)
    }

    fn refetch_if_observed(&self) -> Option<BoxFuture<'static, QueryResult<()>>> {
        Query::refetch_if_observed(self)
    }

    fn into_any(self: Arc<Self>) -> Arc<dyn Any + Send + Sync> {
        self
    }
}

fn downcast<T: QueryData>(entry: Arc<dyn AnyQuery>) -> QueryResult<Arc<Query<T>>> {
    let hash = entry.hash().to_string();
    entry
        .into_any()
        .downcast::<Query<T>>()
        .map_err(|_| QueryError::TypeMismatch {
            key: hash,
            expected: std::any::type_name::<T>(),
        })
}

/// Map from canonical key to query.
pub struct QueryCache {
    queries: RwLock<HashMap<String, Arc<dyn AnyQuery>>>,
    environment: Environment,
    weak_self: Weak<QueryCache>,
}

impl QueryCache {
    pub fn new() -> Arc<Self> {
        Self::with_environment(Environment::new())
    }

    /// Queries built by this cache listen to `environment` for refetch triggers.
    pub fn with_environment(environment: Environment) -> Arc<Self> {
        Arc::new_cyclic(|weak| Self {
            queries: RwLock::new(HashMap::new()),
            environment,
            weak_self: weak.clone(),
        })
    }

    pub fn environment(&self) -> &Environment {
        &self.environment
    }

    fn snapshot(&self, key: Option<&QueryKey>) -> Vec<Arc<dyn AnyQuery>> {
        let queries = sync::read(&self.queries, "query cache");
        match key {
            Some(key) => queries.get(&canonicalize(key)).cloned().into_iter().collect(),
            None => queries.values().cloned().collect(),
        }
    }

    fn gc_hook(&self) -> GcHook {
        let cache = self.weak_self.clone();
        Arc::new(move |hash: &str| {
            if let Some(cache) = cache.upgrade() {
                cache.remove_if_collectable(hash);
            }
        })
    }

    // ------------------------------------------------------------------------
    // Registry
    // ------------------------------------------------------------------------

    /// Look up an entry. Fails if it holds a different data type.
    pub fn get<T: QueryData>(&self, key: &QueryKey) -> QueryResult<Option<Arc<Query<T>>>> {
        self.snapshot(Some(key)).pop().map(downcast::<T>).transpose()
    }

    /// Get or create the entry for `key`. `options` apply only on creation.
    pub fn build<T: QueryData>(
        &self,
        key: &QueryKey,
        options: ResolvedOptions,
    ) -> QueryResult<Arc<Query<T>>> {
        let hash = canonicalize(key);
        if let Some(existing) = sync::read(&self.queries, "query cache").get(&hash).cloned() {
            return downcast(existing);
        }

        let mut queries = sync::write(&self.queries, "query cache");
        if let Some(existing) = queries.get(&hash).cloned() {
            drop(queries);
            return downcast(existing);
        }
        let query = Query::build(
            key.clone(),
            options,
            self.environment.clone(),
            Some(self.gc_hook()),
        );
        queries.insert(hash.clone(), query.clone() as Arc<dyn AnyQuery>);
        tracing::debug!(key = %hash, total = queries.len(), "Query created");
        Ok(query)
    }

    /// Register `query`, destroying any different entry it replaces.
    pub fn insert<T: QueryData>(&self, query: Arc<Query<T>>) {
        let hash = query.hash().to_string();
        let previous = sync::write(&self.queries, "query cache")
            .insert(hash, query.clone() as Arc<dyn AnyQuery>);
        if let Some(previous) = previous {
            let same = std::ptr::eq(
                Arc::as_ptr(&previous) as *const (),
                Arc::as_ptr(&query) as *const (),
            );
            if !same {
                previous.destroy();
            }
        }
    }

    /// Remove and destroy the entry for `key`. Returns true if one existed.
    pub fn remove(&self, key: &QueryKey) -> bool {
        let removed = sync::write(&self.queries, "query cache").remove(&canonicalize(key));
        match removed {
            Some(query) => {
                query.destroy();
                true
            }
            None => false,
        }
    }

    pub fn contains(&self, key: &QueryKey) -> bool {
        sync::read(&self.queries, "query cache").contains_key(&canonicalize(key))
    }

    pub fn len(&self) -> usize {
        sync::read(&self.queries, "query cache").len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn keys(&self) -> Vec<QueryKey> {
        self.snapshot(None).iter().map(|q| q.key().clone()).collect()
    }

    /// Type-erased entries matching `key`, or every entry for `None`.
    pub fn find_all(&self, key: Option<&QueryKey>) -> Vec<Arc<dyn AnyQuery>> {
        self.snapshot(key)
    }

    // ------------------------------------------------------------------------
    // Bulk operations
    // ------------------------------------------------------------------------

    /// Invalidate the entry for `key`. Returns true if one existed.
    pub fn invalidate(&self, key: &QueryKey) -> bool {
        self.invalidate_matching(Some(key)) > 0
    }

    /// Invalidate every entry. Observed ones refetch.
    pub fn invalidate_all(&self) -> usize {
        self.invalidate_matching(None)
    }

    pub(crate) fn invalidate_matching(&self, key: Option<&QueryKey>) -> usize {
        let entries = self.snapshot(key);
        for query in &entries {
            query.invalidate();
        }
        entries.len()
    }

    /// Cancel in-flight fetches. Returns how many were running.
    pub fn cancel(&self, key: Option<&QueryKey>) -> usize {
        let mut cancelled = 0;
        for query in self.snapshot(key) {
            if query.is_fetching() {
                query.cancel();
                cancelled += 1;
            }
        }
        cancelled
    }

    /// Refetch observed, enabled entries and wait for all of them.
    /// Returns how many refetched.
    pub async fn refetch_observed(&self, key: Option<&QueryKey>) -> usize {
        let pending: Vec<_> = self
            .snapshot(key)
            .into_iter()
            .filter_map(|query| query.refetch_if_observed())
            .collect();
        let count = pending.len();
        for result in futures_util::future::join_all(pending).await {
            if let Err(err) = result {
                tracing::debug!(error = %err, "Refetch failed");
            }
        }
        count
    }

    /// Remove and destroy entries matching `key` (all for `None`).
    pub fn remove_matching(&self, key: Option<&QueryKey>) -> usize {
        let removed: Vec<Arc<dyn AnyQuery>> = {
            let mut queries = sync::write(&self.queries, "query cache");
            match key {
                Some(key) => queries.remove(&canonicalize(key)).into_iter().collect(),
                None => queries.drain().map(|(_, query)| query).collect(),
            }
        };
        for query in &removed {
            query.destroy();
        }
        removed.len()
    }

    /// Remove and destroy every entry.
    pub fn clear(&self) {
        let removed = self.remove_matching(None);
        tracing::debug!(removed, "Query cache cleared");
    }

    /// Number of entries with a fetch in flight.
    pub fn is_fetching(&self) -> usize {
        self.snapshot(None).iter().filter(|q| q.is_fetching()).count()
    }

    pub fn stats(&self) -> CacheStats {
        self.stats_at(Instant::now())
    }

    pub fn stats_at(&self, now: Instant) -> CacheStats {
        let entries = self.snapshot(None);
        let mut stats = CacheStats {
            total_queries: entries.len(),
            ..CacheStats::default()
        };
        for query in &entries {
            if query.observer_count() > 0 {
                stats.active_queries += 1;
            }
            if query.is_fetching() {
                stats.fetching_queries += 1;
            }
            if query.can_be_garbage_collected(now) {
                stats.gc_ready_queries += 1;
            }
        }
        stats
    }

    // ------------------------------------------------------------------------
    // Garbage collection
    // ------------------------------------------------------------------------

    /// Remove every collectable entry. Returns the number removed.
    pub fn gc(&self) -> usize {
        self.gc_at(Instant::now())
    }

    /// Sweep as if the clock read `now`.
    pub fn gc_at(&self, now: Instant) -> usize {
        let mut removed = 0;
        for query in self.snapshot(None) {
            let collectable =
                catch_unwind(AssertUnwindSafe(|| query.can_be_garbage_collected(now)));
            match collectable {
                Ok(true) => {
                    if self.evict(&query) {
                        removed += 1;
                    }
                }
                Ok(false) => {}
                Err(panic) => tracing::warn!(
                    key = %query.hash(),
                    panic = %panic_message(panic.as_ref()),
                    "GC check panicked, skipping entry"
                ),
            }
        }

        if removed > 0 {
            tracing::info!(removed, remaining = self.len(), "Query cache GC removed entries");
        } else {
            tracing::trace!("Query cache GC found nothing to remove");
        }
        removed
    }

    /// Remove `query` if it is still the registered entry for its key.
    fn evict(&self, query: &Arc<dyn AnyQuery>) -> bool {
        {
            let mut queries = sync::write(&self.queries, "query cache");
            let registered = queries.get(query.hash()).is_some_and(|current| {
                std::ptr::eq(
                    Arc::as_ptr(current) as *const (),
                    Arc::as_ptr(query) as *const (),
                )
            });
            if !registered {
                return false;
            }
            queries.remove(query.hash());
        }

        if let Err(panic) = catch_unwind(AssertUnwindSafe(|| query.destroy())) {
            tracing::warn!(
                key = %query.hash(),
                panic = %panic_message(panic.as_ref()),
                "Destroy panicked during GC"
            );
        }
        true
    }

    /// Called from an entry's GC timer.
    pub(crate) fn remove_if_collectable(&self, hash: &str) {
        let Some(query) = sync::read(&self.queries, "query cache").get(hash).cloned() else {
            return;
        };
        if query.can_be_garbage_collected(Instant::now()) && self.evict(&query) {
            tracing::debug!(key = %hash, "Query garbage collected");
        }
    }

    /// Start a recurring sweep every `period`. Dropping the handle stops it.
    pub fn schedule_gc(&self, period: Duration) -> QuarryResult<GcHandle> {
        spawn_gc_sweep(self.weak_self.clone(), period)
    }
}

impl std::fmt::Debug for QueryCache {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryCache")
            .field("queries", &self.len())
            .finish_non_exhaustive()
    }
}
