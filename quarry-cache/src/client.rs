//! Client façade over a [`QueryCache`].
//!
//! The client owns the cache, the client-wide [`DefaultOptions`], the focus
//! and connectivity [`Environment`] and, once started, the recurring GC
//! sweep. It holds no cached data itself. Cloning is cheap; clones share
//! everything.

use crate::cache::QueryCache;
use crate::environment::Environment;
use crate::gc::GcHandle;
use crate::mutation::{Mutation, MutationHooks};
use crate::observer::{Observer, Subscription};
use crate::query::{Query, Updater};
use crate::query_fn::{MutationFn, QueryFn};
use crate::sync;
use quarry_core::{
    CacheStats, DefaultOptions, MutationOptions, QuarryResult, QueryData, QueryKey, QueryOptions,
    QueryResult, QueryState, ResolvedOptions,
};
use std::sync::{Arc, Mutex, RwLock};

struct ClientInner {
    cache: Arc<QueryCache>,
    defaults: RwLock<DefaultOptions>,
    environment: Environment,
    gc: Mutex<Option<GcHandle>>,
}

/// Entry point for reading, writing and invalidating cached queries.
#[derive(Clone)]
pub struct QueryClient {
    inner: Arc<ClientInner>,
}

impl QueryClient {
    pub fn new() -> Self {
        Self::with_defaults(DefaultOptions::default())
    }

    pub fn with_defaults(defaults: DefaultOptions) -> Self {
        let environment = Environment::new();
        Self {
            inner: Arc::new(ClientInner {
                cache: QueryCache::with_environment(environment.clone()),
                defaults: RwLock::new(defaults),
                environment,
                gc: Mutex::new(None),
            }),
        }
    }

    /// Validate `defaults` before building the client.
    pub fn try_with_defaults(defaults: DefaultOptions) -> QuarryResult<Self> {
        defaults.validate()?;
        Ok(Self::with_defaults(defaults))
    }

    /// Build from `QUARRY_*` environment variables.
    pub fn from_env() -> QuarryResult<Self> {
        Self::try_with_defaults(DefaultOptions::from_env())
    }

    pub fn cache(&self) -> &Arc<QueryCache> {
        &self.inner.cache
    }

    pub fn environment(&self) -> &Environment {
        &self.inner.environment
    }

    pub fn default_options(&self) -> DefaultOptions {
        sync::read(&self.inner.defaults, "client defaults").clone()
    }

    /// Replace the defaults. Existing entries keep their resolved options
    /// until the next call that passes options for them.
    pub fn set_default_options(&self, defaults: DefaultOptions) -> QuarryResult<()> {
        defaults.validate()?;
        *sync::write(&self.inner.defaults, "client defaults") = defaults;
        Ok(())
    }

    /// Merge per-call options over the client defaults.
    pub fn resolve(&self, options: &QueryOptions) -> ResolvedOptions {
        sync::read(&self.inner.defaults, "client defaults").resolve(options)
    }

    // ------------------------------------------------------------------------
    // GC sweep
    // ------------------------------------------------------------------------

    /// Start the recurring sweep at the configured `gc_interval`. No-op if
    /// already running. Requires a tokio runtime and a nonzero interval.
    pub fn start_gc(&self) -> QuarryResult<()> {
        let mut gc = sync::lock(&self.inner.gc, "client gc");
        if gc.as_ref().is_some_and(GcHandle::is_running) {
            return Ok(());
        }
        let period = self.default_options().gc_interval;
        *gc = Some(self.inner.cache.schedule_gc(period)?);
        Ok(())
    }

    /// Stop the recurring sweep if it is running.
    pub fn stop_gc(&self) {
        let handle = sync::lock(&self.inner.gc, "client gc").take();
        drop(handle);
    }

    pub fn is_gc_running(&self) -> bool {
        sync::lock(&self.inner.gc, "client gc")
            .as_ref()
            .is_some_and(GcHandle::is_running)
    }

    // ------------------------------------------------------------------------
    // Reads
    // ------------------------------------------------------------------------

    fn prepare<T, F>(
        &self,
        key: &QueryKey,
        options: &QueryOptions,
        query_fn: F,
    ) -> QueryResult<(Arc<Query<T>>, ResolvedOptions)>
    where
        T: QueryData,
        F: QueryFn<T>,
    {
        let resolved = self.resolve(options);
        let query = self.inner.cache.build::<T>(key, resolved.clone())?;
        query.set_options(resolved.clone());
        query.set_query_fn(Arc::new(query_fn));
        Ok((query, resolved))
    }

    /// Create the entry if absent, then fetch (joining an in-flight fetch).
    pub async fn fetch_query<T, F>(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        query_fn: F,
    ) -> QueryResult<T>
    where
        T: QueryData,
        F: QueryFn<T>,
    {
        let key = key.into();
        let (query, _) = self.prepare(&key, &options, query_fn)?;
        query.fetch().await
    }

    /// Cache-first read: return fresh cached data, otherwise fetch.
    pub async fn ensure_query_data<T, F>(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        query_fn: F,
    ) -> QueryResult<T>
    where
        T: QueryData,
        F: QueryFn<T>,
    {
        let key = key.into();
        let (query, _) = self.prepare(&key, &options, query_fn)?;
        if let Some(data) = query.fresh_data() {
            tracing::debug!(key = %query.hash(), "Serving fresh cached data");
            return Ok(data);
        }
        query.fetch().await
    }

    /// Warm the cache. Failures are recorded in the entry's state only.
    pub async fn prefetch_query<T, F>(&self, key: impl Into<QueryKey>, options: QueryOptions, query_fn: F)
    where
        T: QueryData,
        F: QueryFn<T>,
    {
        let key = key.into();
        let result: QueryResult<T> = self.fetch_query(key.clone(), options, query_fn).await;
        if let Err(err) = result {
            tracing::debug!(key = %key, error = %err, "Prefetch failed");
        }
    }

    pub fn get_query_data<T: QueryData>(&self, key: &QueryKey) -> QueryResult<Option<T>> {
        Ok(self.inner.cache.get::<T>(key)?.and_then(|query| query.data()))
    }

    pub fn get_query_state<T: QueryData>(&self, key: &QueryKey) -> QueryResult<Option<QueryState<T>>> {
        Ok(self.inner.cache.get::<T>(key)?.map(|query| query.state()))
    }

    /// The typed entry for `key`, if present.
    pub fn get_query<T: QueryData>(&self, key: &QueryKey) -> QueryResult<Option<Arc<Query<T>>>> {
        self.inner.cache.get::<T>(key)
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Write data directly, creating the entry if needed. Returns the
    /// stored value.
    pub fn set_query_data<T: QueryData>(
        &self,
        key: &QueryKey,
        updater: impl Into<Updater<T>>,
        mark_stale: bool,
    ) -> QueryResult<T> {
        let query = self
            .inner
            .cache
            .build::<T>(key, self.resolve(&QueryOptions::default()))?;
        Ok(query.set_data(updater, mark_stale))
    }

    /// Mark matching entries stale; observed ones refetch in the background.
    /// Returns how many entries matched.
    pub fn invalidate_queries(&self, key: Option<&QueryKey>) -> usize {
        let matched = self.inner.cache.invalidate_matching(key);
        tracing::debug!(key = ?key.map(QueryKey::canonical), matched, "Invalidated queries");
        matched
    }

    /// Refetch observed, enabled entries and wait for them to settle.
    pub async fn refetch_queries(&self, key: Option<&QueryKey>) -> usize {
        self.inner.cache.refetch_observed(key).await
    }

    pub fn cancel_queries(&self, key: Option<&QueryKey>) -> usize {
        self.inner.cache.cancel(key)
    }

    pub fn remove_queries(&self, key: Option<&QueryKey>) -> usize {
        self.inner.cache.remove_matching(key)
    }

    /// Whether any cached entry has a fetch in flight. The count is in
    /// [`CacheStats::fetching_queries`].
    pub fn is_fetching(&self) -> bool {
        self.inner.cache.is_fetching() > 0
    }

    pub fn stats(&self) -> CacheStats {
        self.inner.cache.stats()
    }

    /// Remove and destroy every entry.
    pub fn clear(&self) {
        self.inner.cache.clear();
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Observe `key`, fetching with `query_fn` when stale.
    pub fn subscribe<T, F, O>(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        query_fn: F,
        observer: O,
    ) -> QueryResult<Subscription>
    where
        T: QueryData,
        F: QueryFn<T>,
        O: Observer<QueryState<T>>,
    {
        let key = key.into();
        let (query, resolved) = self.prepare(&key, &options, query_fn)?;
        Ok(query.subscribe(observer, resolved))
    }

    /// Observe `key` using whatever query function the entry already has.
    pub fn observe<T, O>(
        &self,
        key: impl Into<QueryKey>,
        options: QueryOptions,
        observer: O,
    ) -> QueryResult<Subscription>
    where
        T: QueryData,
        O: Observer<QueryState<T>>,
    {
        let key = key.into();
        let resolved = self.resolve(&options);
        let query = self.inner.cache.build::<T>(&key, resolved.clone())?;
        Ok(query.subscribe(observer, resolved))
    }

    // ------------------------------------------------------------------------
    // Mutations
    // ------------------------------------------------------------------------

    /// A mutation runner using the client's mutation defaults.
    pub fn mutation<V, T, F>(&self, mutation_fn: F, options: MutationOptions) -> Mutation<V, T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: MutationFn<V, T>,
    {
        self.mutation_with_hooks(mutation_fn, options, MutationHooks::new())
    }

    pub fn mutation_with_hooks<V, T, F>(
        &self,
        mutation_fn: F,
        options: MutationOptions,
        hooks: MutationHooks<V, T>,
    ) -> Mutation<V, T>
    where
        V: Clone + Send + Sync + 'static,
        T: Clone + Send + Sync + 'static,
        F: MutationFn<V, T>,
    {
        let resolved = self.default_options().resolve_mutation(&options);
        Mutation::with_hooks(mutation_fn, resolved, hooks)
    }
}

impl Default for QueryClient {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for QueryClient {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("QueryClient")
            .field("cache", &self.inner.cache)
            .field("gc_running", &self.is_gc_running())
            .finish_non_exhaustive()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query_fn::QueryContext;
    use quarry_core::{query_key, QuarryError, QueryError};
    use std::time::Duration;

    #[test]
    fn test_try_with_defaults_validates() {
        let bad = DefaultOptions::default().with_gc_interval(Duration::ZERO);
        assert!(QueryClient::try_with_defaults(bad).is_err());
        assert!(QueryClient::try_with_defaults(DefaultOptions::default()).is_ok());
    }

    #[test]
    fn test_resolve_applies_defaults() {
        let client = QueryClient::with_defaults(DefaultOptions::default().with_stale_time(Duration::from_secs(3)));
        let resolved = client.resolve(&QueryOptions::new());
        assert_eq!(resolved.stale_time, Duration::from_secs(3));
        let resolved = client.resolve(&QueryOptions::new().with_stale_time(Duration::from_secs(1)));
        assert_eq!(resolved.stale_time, Duration::from_secs(1));
    }

    #[test]
    fn test_set_query_data_creates_placeholder_entry() {
        let client = QueryClient::new();
        let key = query_key!["settings"];
        let stored = client.set_query_data::<String>(&key, "dark".to_string(), false).unwrap();
        assert_eq!(stored, "dark");
        assert_eq!(client.get_query_data::<String>(&key).unwrap(), Some("dark".to_string()));

        let query = client.get_query::<String>(&key).unwrap().unwrap();
        assert!(!query.has_query_fn());
        assert!(matches!(
            client.get_query_data::<u32>(&key),
            Err(QueryError::TypeMismatch { .. })
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_query_always_runs_query_fn() {
        let client = QueryClient::new();
        let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
        let first = client
            .fetch_query(["n"], options.clone(), |_ctx: QueryContext| async { Ok::<u32, QueryError>(1) })
            .await
            .unwrap();
        let second = client
            .fetch_query(["n"], options, |_ctx: QueryContext| async { Ok::<u32, QueryError>(2) })
            .await
            .unwrap();
        assert_eq!((first, second), (1, 2));
    }

    #[tokio::test(start_paused = true)]
    async fn test_ensure_query_data_serves_fresh_data() {
        let client = QueryClient::new();
        let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
        let first = client
            .ensure_query_data(["n"], options.clone(), |_ctx: QueryContext| async { Ok::<u32, QueryError>(1) })
            .await
            .unwrap();
        let second = client
            .ensure_query_data(["n"], options, |_ctx: QueryContext| async { Ok::<u32, QueryError>(2) })
            .await
            .unwrap();
        assert_eq!((first, second), (1, 1));
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_query_data_goes_stale_with_default_stale_time() {
        let client = QueryClient::new();
        let key = query_key!["user", "1"];
        client.set_query_data::<u32>(&key, 1, false).unwrap();
        assert!(client.get_query_state::<u32>(&key).unwrap().unwrap().stale);

        tokio::time::sleep(Duration::from_secs(60)).await;
        let value = client
            .ensure_query_data(key.clone(), QueryOptions::new(), |_ctx: QueryContext| async {
                Ok::<u32, QueryError>(2)
            })
            .await
            .unwrap();
        assert_eq!(value, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_and_stop_gc() {
        let client = QueryClient::new();
        client.start_gc().unwrap();
        client.start_gc().unwrap();
        assert!(client.is_gc_running());
        client.stop_gc();
        assert!(!client.is_gc_running());
    }

    #[tokio::test(start_paused = true)]
    async fn test_start_gc_rejects_zero_interval() {
        let client = QueryClient::with_defaults(DefaultOptions::default().with_gc_interval(Duration::ZERO));
        assert!(matches!(client.start_gc(), Err(QuarryError::Config(_))));
        assert!(!client.is_gc_running());
    }
}
