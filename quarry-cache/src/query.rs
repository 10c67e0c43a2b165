//! A single cached query.
//!
//! [`Query`] owns one key's state machine, its in-flight fetch, its timers
//! (staleness, garbage collection, refetch interval), its environment
//! listener and its observers. All mutable state sits behind one mutex that
//! is never held across an await point; observers are notified after the
//! guard has been released.
//!
//! Every fetch runs as its own spawned task and is stamped with a monotonic
//! generation. A result is applied only if its generation still owns the
//! in-flight slot, so a cancelled or superseded attempt can never overwrite
//! newer state.

use crate::environment::Environment;
use crate::observer::{dispatch, notify_one, Observer, ObserverEntry, Subscription};
use crate::query_fn::{QueryContext, QueryFn};
use crate::retryer::run_with_retry;
use crate::signal::{AbortController, AbortSignal};
use crate::sync;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use quarry_core::{
    canonicalize, FetchStatus, QueryData, QueryError, QueryKey, QueryResult, QueryState,
    QueryStatus, ResolvedOptions, RetryDelay, RetryPolicy,
};
use std::any::Any;
use std::fmt;
use std::future::Future;
use std::panic::AssertUnwindSafe;
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::task::AbortHandle;
use tokio::time::Instant;
use uuid::Uuid;

/// Pending result shared by every caller joined onto one fetch.
pub(crate) type SharedFetch<T> = Shared<BoxFuture<'static, QueryResult<T>>>;

/// Called with the canonical key when an entry's GC timer fires.
pub(crate) type GcHook = Arc<dyn Fn(&str) + Send + Sync>;

// ============================================================================
// UPDATER
// ============================================================================

/// New data for [`Query::set_data`]: a literal value or a function of the
/// current data.
pub enum Updater<T> {
    Value(T),
    Fn(Box<dyn FnOnce(Option<&T>) -> T + Send>),
}

impl<T> Updater<T> {
    pub fn value(value: T) -> Self {
        Self::Value(value)
    }

    /// Derive the new value from the current one (`None` if absent).
    pub fn with<F>(f: F) -> Self
    where
        F: FnOnce(Option<&T>) -> T + Send + 'static,
    {
        Self::Fn(Box::new(f))
    }

    pub fn apply(self, current: Option<&T>) -> T {
        match self {
            Self::Value(value) => value,
            Self::Fn(f) => f(current),
        }
    }
}

impl<T> From<T> for Updater<T> {
    fn from(value: T) -> Self {
        Self::Value(value)
    }
}

impl<T: fmt::Debug> fmt::Debug for Updater<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Value(value) => f.debug_tuple("Value").field(value).finish(),
            Self::Fn(_) => f.write_str("Fn(<fn>)"),
        }
    }
}

// ============================================================================
// INTERNAL STATE
// ============================================================================

#[derive(Debug, Clone, Copy)]
enum Trigger {
    Focus,
    Reconnect,
}

impl Trigger {
    fn as_str(self) -> &'static str {
        match self {
            Self::Focus => "window_focus",
            Self::Reconnect => "reconnect",
        }
    }
}

struct ObserverSlot<T> {
    entry: ObserverEntry<QueryState<T>>,
    options: ResolvedOptions,
}

struct InFlight<T> {
    generation: u64,
    shared: SharedFetch<T>,
    controller: AbortController,
    task: AbortHandle,
}

#[derive(Default)]
struct Timers {
    stale: Option<AbortHandle>,
    gc: Option<AbortHandle>,
    interval: Option<AbortHandle>,
    environment: Option<AbortHandle>,
}

impl Timers {
    fn abort_all(&mut self) {
        cancel_timer(&mut self.stale);
        cancel_timer(&mut self.gc);
        cancel_timer(&mut self.interval);
        cancel_timer(&mut self.environment);
    }
}

fn cancel_timer(slot: &mut Option<AbortHandle>) {
    if let Some(handle) = slot.take() {
        handle.abort();
    }
}

struct QueryInner<T> {
    state: QueryState<T>,
    options: ResolvedOptions,
    query_fn: Option<Arc<dyn QueryFn<T>>>,
    observers: Vec<ObserverSlot<T>>,
    in_flight: Option<InFlight<T>>,
    generation: u64,
    /// Monotonic instant of the last settle or write; drives GC eligibility.
    last_updated: Option<Instant>,
    stale_epoch: u64,
    timers: Timers,
    destroyed: bool,
}

impl<T: QueryData> QueryInner<T> {
    /// Automatic fetching is allowed: enabled, observed, and fetchable.
    fn wants_fetch(&self) -> bool {
        !self.destroyed
            && self.options.enabled
            && self.query_fn.is_some()
            && self.observers.iter().any(|slot| slot.options.enabled)
    }

    /// Smallest nonzero interval any observer asked for.
    fn effective_interval(&self) -> Option<Duration> {
        self.observers
            .iter()
            .filter_map(|slot| slot.options.refetch_interval)
            .filter(|period| !period.is_zero())
            .min()
    }

    fn interval_in_background(&self) -> bool {
        self.observers.iter().any(|slot| {
            slot.options.refetch_interval.is_some_and(|period| !period.is_zero())
                && slot.options.refetch_interval_in_background
        })
    }

    fn store_data(&mut self, data: T) {
        let unchanged =
            self.options.structural_sharing && self.state.data.as_ref() == Some(&data);
        if !unchanged {
            self.state.data = Some(data);
            self.state.data_version = self.state.data_version.wrapping_add(1);
        }
    }

    fn notification(&self) -> Option<Notification<T>> {
        if self.observers.is_empty() {
            return None;
        }
        Some(Notification {
            observers: self.observers.iter().map(|slot| slot.entry.clone()).collect(),
            state: self.state.clone(),
        })
    }
}

struct Notification<T> {
    observers: Vec<ObserverEntry<QueryState<T>>>,
    state: QueryState<T>,
}

// ============================================================================
// QUERY
// ============================================================================

/// One cache entry: state, in-flight fetch, timers and observers for a key.
pub struct Query<T: QueryData> {
    key: QueryKey,
    hash: String,
    environment: Environment,
    gc_hook: Option<GcHook>,
    weak_self: Weak<Query<T>>,
    inner: Mutex<QueryInner<T>>,
}

impl<T: QueryData> Query<T> {
    /// Create a standalone query. Standalone queries are never collected;
    /// their GC timer only exists when owned by a [`crate::QueryCache`].
    pub fn new(key: QueryKey, options: ResolvedOptions, environment: Environment) -> Arc<Self> {
        Self::build(key, options, environment, None)
    }

    pub(crate) fn build(
        key: QueryKey,
        options: ResolvedOptions,
        environment: Environment,
        gc_hook: Option<GcHook>,
    ) -> Arc<Self> {
        let hash = canonicalize(&key);
        Arc::new_cyclic(|weak| Self {
            key,
            hash,
            environment,
            gc_hook,
            weak_self: weak.clone(),
            inner: Mutex::new(QueryInner {
                state: QueryState::new(),
                options,
                query_fn: None,
                observers: Vec::new(),
                in_flight: None,
                generation: 0,
                last_updated: None,
                stale_epoch: 0,
                timers: Timers::default(),
                destroyed: false,
            }),
        })
    }

    fn lock(&self) -> MutexGuard<'_, QueryInner<T>> {
        sync::lock(&self.inner, "query")
    }

    fn deliver(&self, notification: Option<Notification<T>>) {
        if let Some(Notification { observers, state }) = notification {
            dispatch(&observers, &state, &self.hash);
        }
    }

    pub fn key(&self) -> &QueryKey {
        &self.key
    }

    /// Canonical string identity of the key.
    pub fn hash(&self) -> &str {
        &self.hash
    }

    pub fn state(&self) -> QueryState<T> {
        self.lock().state.clone()
    }

    pub fn data(&self) -> Option<T> {
        self.lock().state.data.clone()
    }

    /// Data that is present and not stale.
    pub fn fresh_data(&self) -> Option<T> {
        let inner = self.lock();
        if inner.state.stale {
            None
        } else {
            inner.state.data.clone()
        }
    }

    pub fn options(&self) -> ResolvedOptions {
        self.lock().options.clone()
    }

    /// Replace the entry-level options. Timers pick them up on their next arm.
    pub fn set_options(&self, options: ResolvedOptions) {
        self.lock().options = options;
    }

    pub fn set_query_fn(&self, query_fn: Arc<dyn QueryFn<T>>) {
        self.lock().query_fn = Some(query_fn);
    }

    pub fn has_query_fn(&self) -> bool {
        self.lock().query_fn.is_some()
    }

    pub fn observer_count(&self) -> usize {
        self.lock().observers.len()
    }

    pub fn is_fetching(&self) -> bool {
        self.lock().in_flight.is_some()
    }

    pub fn is_stale(&self) -> bool {
        self.lock().state.stale
    }

    pub fn is_destroyed(&self) -> bool {
        self.lock().destroyed
    }

    // ------------------------------------------------------------------------
    // Fetching
    // ------------------------------------------------------------------------

    /// Fetch now, or join the fetch already in flight.
    pub async fn fetch(&self) -> QueryResult<T> {
        let shared = self.start_fetch()?;
        shared.await
    }

    /// Like [`Query::fetch`], but refuses when the entry is disabled.
    pub async fn refetch(&self) -> QueryResult<T> {
        if !self.lock().options.enabled {
            return Err(QueryError::Disabled {
                key: self.hash.clone(),
            });
        }
        self.fetch().await
    }

    pub(crate) fn start_fetch(&self) -> QueryResult<SharedFetch<T>> {
        let (shared, notification) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Err(QueryError::Cancelled);
            }
            if let Some(in_flight) = &inner.in_flight {
                tracing::debug!(key = %self.hash, generation = in_flight.generation, "Joining in-flight fetch");
                return Ok(in_flight.shared.clone());
            }

            let query_fn = inner.query_fn.clone().ok_or_else(|| QueryError::MissingQueryFn {
                key: self.hash.clone(),
            })?;
            let handle = Handle::try_current()
                .map_err(|_| QueryError::NoRuntime { operation: "fetch" })?;

            inner.generation += 1;
            let generation = inner.generation;
            let controller = AbortController::new();
            let task = handle.spawn(run_fetch(
                self.weak_self.clone(),
                self.key.clone(),
                self.hash.clone(),
                generation,
                query_fn,
                inner.options.retry.clone(),
                inner.options.retry_delay.clone(),
                controller.signal(),
            ));
            let abort = task.abort_handle();
            let hash = self.hash.clone();
            let shared = async move {
                match task.await {
                    Ok(result) => result,
                    Err(err) if err.is_cancelled() => Err(QueryError::Cancelled),
                    Err(err) => Err(QueryError::TaskFailed {
                        key: hash,
                        reason: err.to_string(),
                    }),
                }
            }
            .boxed()
            .shared();

            if inner.state.data.is_none() {
                inner.state.status = QueryStatus::Loading;
            } else if inner.state.status == QueryStatus::Error {
                inner.state.status = QueryStatus::Success;
            }
            inner.state.fetch_status = FetchStatus::Fetching;
            inner.state.fetch_count = inner.state.fetch_count.saturating_add(1);
            inner.state.error = None;
            cancel_timer(&mut inner.timers.gc);
            inner.in_flight = Some(InFlight {
                generation,
                shared: shared.clone(),
                controller,
                task: abort,
            });

            tracing::debug!(
                key = %self.hash,
                generation,
                fetch_count = inner.state.fetch_count,
                "Fetch started"
            );
            (shared, inner.notification())
        };
        self.deliver(notification);
        Ok(shared)
    }

    fn background_fetch(&self, reason: &'static str) {
        match self.start_fetch() {
            Ok(_) => tracing::debug!(key = %self.hash, reason, "Background fetch triggered"),
            Err(err) => {
                tracing::debug!(key = %self.hash, reason, error = %err, "Background fetch not started")
            }
        }
    }

    /// Apply a fetch result. Returns false if the attempt was superseded.
    fn settle(&self, generation: u64, result: &QueryResult<T>) -> bool {
        let notification = {
            let mut inner = self.lock();
            let owner = inner.in_flight.as_ref().map(|f| f.generation);
            if inner.destroyed || owner != Some(generation) {
                tracing::debug!(key = %self.hash, generation, "Discarding superseded fetch result");
                return false;
            }

            inner.in_flight = None;
            inner.state.fetch_status = FetchStatus::Idle;
            match result {
                Ok(data) => {
                    inner.store_data(data.clone());
                    inner.state.status = QueryStatus::Success;
                    inner.state.error = None;
                    inner.state.failure_count = 0;
                    inner.state.data_updated_at = Some(Utc::now());
                    inner.state.stale = inner.options.stale_time.is_zero();
                    inner.last_updated = Some(Instant::now());
                    self.arm_stale_timer(&mut inner);
                    self.arm_interval_timer(&mut inner);
                    tracing::debug!(
                        key = %self.hash,
                        generation,
                        data_version = inner.state.data_version,
                        "Fetch succeeded"
                    );
                }
                Err(QueryError::Cancelled) => {
                    if inner.state.status == QueryStatus::Loading {
                        inner.state.status = QueryStatus::Idle;
                    }
                    tracing::debug!(key = %self.hash, generation, "Fetch cancelled by query function");
                }
                Err(err) => {
                    inner.state.status = QueryStatus::Error;
                    inner.state.error = Some(err.clone());
                    inner.state.failure_count = inner.state.failure_count.saturating_add(1);
                    inner.state.error_updated_at = Some(Utc::now());
                    inner.last_updated = Some(Instant::now());
                    tracing::debug!(
                        key = %self.hash,
                        generation,
                        failure_count = inner.state.failure_count,
                        error = %err,
                        "Fetch failed"
                    );
                }
            }

            if inner.observers.is_empty() {
                self.arm_gc_timer(&mut inner);
            }
            inner.notification()
        };
        self.deliver(notification);
        true
    }

    // ------------------------------------------------------------------------
    // Writes
    // ------------------------------------------------------------------------

    /// Mark stale and, if observed and enabled, refetch in the background.
    pub fn invalidate(&self) {
        let (notification, refetch) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            cancel_timer(&mut inner.timers.stale);
            inner.state.stale = true;
            (inner.notification(), inner.wants_fetch())
        };
        self.deliver(notification);
        if refetch {
            self.background_fetch("invalidate");
        }
    }

    /// Overwrite the data synchronously. Returns the stored value.
    ///
    /// The write opens a new staleness window, so with a zero `stale_time`
    /// the data is stale at once, as it would be after a fetch.
    ///
    /// An in-flight fetch is not cancelled; if it succeeds later its result
    /// replaces this write.
    pub fn set_data(&self, updater: impl Into<Updater<T>>, mark_stale: bool) -> T {
        let current = self.data();
        let next = updater.into().apply(current.as_ref());

        let notification = {
            let mut inner = self.lock();
            if inner.destroyed {
                return next;
            }
            inner.store_data(next.clone());
            inner.state.status = QueryStatus::Success;
            inner.state.error = None;
            inner.state.data_updated_at = Some(Utc::now());
            inner.state.stale = mark_stale || inner.options.stale_time.is_zero();
            inner.last_updated = Some(Instant::now());
            self.arm_stale_timer(&mut inner);
            if inner.observers.is_empty() {
                self.arm_gc_timer(&mut inner);
            }
            tracing::debug!(key = %self.hash, mark_stale, "Query data set");
            inner.notification()
        };
        self.deliver(notification);
        next
    }

    /// Abort the in-flight fetch, if any. Data and error are left as they were.
    pub fn cancel(&self) {
        let notification = {
            let mut inner = self.lock();
            let Some(in_flight) = inner.in_flight.take() else {
                return;
            };
            in_flight.controller.abort();
            in_flight.task.abort();

            inner.state.fetch_status = FetchStatus::Idle;
            if inner.state.status == QueryStatus::Loading {
                inner.state.status = QueryStatus::Idle;
            }
            if inner.observers.is_empty() {
                self.arm_gc_timer(&mut inner);
            }
            tracing::debug!(key = %self.hash, generation = in_flight.generation, "Fetch cancelled");
            inner.notification()
        };
        self.deliver(notification);
    }

    /// Toggle automatic fetching. Enabling an observed, stale entry fetches.
    pub fn set_enabled(&self, enabled: bool) {
        let fetch = {
            let mut inner = self.lock();
            let was_enabled = inner.options.enabled;
            inner.options.enabled = enabled;
            for slot in &mut inner.observers {
                slot.options.enabled = enabled;
            }
            enabled
                && !was_enabled
                && inner.state.stale
                && inner.in_flight.is_none()
                && inner.wants_fetch()
        };
        if fetch {
            self.background_fetch("enabled");
        }
    }

    // ------------------------------------------------------------------------
    // Observers
    // ------------------------------------------------------------------------

    /// Register an observer and deliver the current state to it right away.
    ///
    /// A stale, enabled entry with a query function starts a background fetch.
    pub fn subscribe<O>(&self, observer: O, options: ResolvedOptions) -> Subscription
    where
        O: Observer<QueryState<T>>,
    {
        let id = Uuid::now_v7();
        let entry = ObserverEntry {
            id,
            observer: Arc::new(observer),
        };

        let (snapshot, fetch) = {
            let mut inner = self.lock();
            if inner.destroyed {
                return Subscription::detached(id);
            }
            let interval_before = inner.effective_interval();
            inner.observers.push(ObserverSlot {
                entry: entry.clone(),
                options,
            });
            cancel_timer(&mut inner.timers.gc);
            self.arm_environment_listener(&mut inner);
            if inner.effective_interval() != interval_before {
                self.arm_interval_timer(&mut inner);
            }
            let fetch = inner.state.stale && inner.in_flight.is_none() && inner.wants_fetch();
            (inner.state.clone(), fetch)
        };

        notify_one(&entry, &snapshot, &self.hash);
        if fetch {
            self.background_fetch("subscribe");
        }

        let weak = self.weak_self.clone();
        Subscription::new(id, move || {
            if let Some(query) = weak.upgrade() {
                query.remove_observer(id);
            }
        })
    }

    fn remove_observer(&self, id: Uuid) {
        let mut inner = self.lock();
        let interval_before = inner.effective_interval();
        let before = inner.observers.len();
        inner.observers.retain(|slot| slot.entry.id != id);
        if inner.observers.len() == before {
            return;
        }

        if inner.observers.is_empty() {
            cancel_timer(&mut inner.timers.environment);
            cancel_timer(&mut inner.timers.interval);
            self.arm_gc_timer(&mut inner);
        } else if inner.effective_interval() != interval_before {
            self.arm_interval_timer(&mut inner);
        }
    }

    // ------------------------------------------------------------------------
    // Lifecycle
    // ------------------------------------------------------------------------

    /// Unobserved, idle, settled at least once, and older than `cache_time`.
    pub fn can_be_garbage_collected(&self, now: Instant) -> bool {
        let inner = self.lock();
        !inner.destroyed
            && inner.observers.is_empty()
            && inner.in_flight.is_none()
            && inner
                .last_updated
                .is_some_and(|at| now.saturating_duration_since(at) > inner.options.cache_time)
    }

    /// Abort timers and any in-flight fetch and drop observers. Idempotent.
    pub fn destroy(&self) {
        let observers = {
            let mut inner = self.lock();
            if inner.destroyed {
                return;
            }
            inner.destroyed = true;
            inner.generation += 1;
            if let Some(in_flight) = inner.in_flight.take() {
                in_flight.controller.abort();
                in_flight.task.abort();
            }
            inner.state.fetch_status = FetchStatus::Idle;
            inner.timers.abort_all();
            tracing::debug!(key = %self.hash, "Query destroyed");
            std::mem::take(&mut inner.observers)
        };
        drop(observers);
    }

    // ------------------------------------------------------------------------
    // Timers
    // ------------------------------------------------------------------------

    fn spawn_timer<F>(&self, timer: &'static str, future: F) -> Option<AbortHandle>
    where
        F: Future<Output = ()> + Send + 'static,
    {
        match Handle::try_current() {
            Ok(handle) => Some(handle.spawn(future).abort_handle()),
            Err(_) => {
                tracing::debug!(key = %self.hash, timer, "No async runtime, timer skipped");
                None
            }
        }
    }

    fn arm_stale_timer(&self, inner: &mut QueryInner<T>) {
        cancel_timer(&mut inner.timers.stale);
        inner.stale_epoch += 1;
        if inner.state.stale || !inner.options.has_stale_timer() {
            return;
        }
        let epoch = inner.stale_epoch;
        let wait = inner.options.stale_time;
        let weak = self.weak_self.clone();
        inner.timers.stale = self.spawn_timer("stale", async move {
            tokio::time::sleep(wait).await;
            if let Some(query) = weak.upgrade() {
                query.expire(epoch);
            }
        });
    }

    fn expire(&self, epoch: u64) {
        let notification = {
            let mut inner = self.lock();
            if inner.destroyed || inner.stale_epoch != epoch || inner.state.stale {
                return;
            }
            inner.timers.stale = None;
            inner.state.stale = true;
            tracing::trace!(key = %self.hash, "Query data went stale");
            inner.notification()
        };
        self.deliver(notification);
    }

    fn arm_gc_timer(&self, inner: &mut QueryInner<T>) {
        cancel_timer(&mut inner.timers.gc);
        let Some(hook) = self.gc_hook.clone() else {
            return;
        };
        if inner.destroyed {
            return;
        }
        // A cache_time of NEVER overflows here and leaves no timer.
        let Some(wait) = inner.options.cache_time.checked_add(Duration::from_millis(1)) else {
            return;
        };
        let weak = self.weak_self.clone();
        inner.timers.gc = self.spawn_timer("gc", async move {
            tokio::time::sleep(wait).await;
            let Some(query) = weak.upgrade() else {
                return;
            };
            let hash = query.hash.clone();
            drop(query);
            hook(&hash);
        });
    }

    fn arm_interval_timer(&self, inner: &mut QueryInner<T>) {
        cancel_timer(&mut inner.timers.interval);
        if inner.destroyed {
            return;
        }
        let Some(period) = inner.effective_interval() else {
            return;
        };
        let weak = self.weak_self.clone();
        inner.timers.interval = self.spawn_timer("interval", async move {
            loop {
                tokio::time::sleep(period).await;
                let Some(query) = weak.upgrade() else {
                    break;
                };
                query.on_interval_tick();
            }
        });
    }

    fn on_interval_tick(&self) {
        let fetch = {
            let inner = self.lock();
            inner.wants_fetch() && (self.environment.is_focused() || inner.interval_in_background())
        };
        if fetch {
            self.background_fetch("interval");
        } else {
            tracing::trace!(key = %self.hash, "Interval refetch skipped");
        }
    }

    fn arm_environment_listener(&self, inner: &mut QueryInner<T>) {
        if inner.timers.environment.is_some() || inner.destroyed {
            return;
        }
        let weak = self.weak_self.clone();
        let mut focus = self.environment.watch_focus();
        let mut online = self.environment.watch_online();
        inner.timers.environment = self.spawn_timer("environment", async move {
            loop {
                let trigger = tokio::select! {
                    changed = focus.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let focused = *focus.borrow_and_update();
                        focused.then_some(Trigger::Focus)
                    }
                    changed = online.changed() => {
                        if changed.is_err() {
                            break;
                        }
                        let online_now = *online.borrow_and_update();
                        online_now.then_some(Trigger::Reconnect)
                    }
                };
                let Some(trigger) = trigger else {
                    continue;
                };
                let Some(query) = weak.upgrade() else {
                    break;
                };
                query.on_environment(trigger);
            }
        });
    }

    fn on_environment(&self, trigger: Trigger) {
        let fetch = {
            let inner = self.lock();
            inner.state.stale
                && inner.wants_fetch()
                && inner.observers.iter().any(|slot| {
                    slot.options.enabled
                        && match trigger {
                            Trigger::Focus => slot.options.refetch_on_window_focus,
                            Trigger::Reconnect => slot.options.refetch_on_reconnect,
                        }
                })
        };
        if fetch {
            self.background_fetch(trigger.as_str());
        }
    }

    // ------------------------------------------------------------------------
    // Type-erased helpers for the cache
    // ------------------------------------------------------------------------

    /// Refetch if observed and enabled, joining an in-flight fetch.
    pub(crate) fn refetch_if_observed(&self) -> Option<BoxFuture<'static, QueryResult<()>>> {
        if !self.lock().wants_fetch() {
            return None;
        }
        Some(match self.start_fetch() {
            Ok(shared) => shared.map(|result| result.map(|_| ())).boxed(),
            Err(err) => async move { Err(err) }.boxed(),
        })
    }
}

impl<T: QueryData> fmt::Debug for Query<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Query")
            .field("key", &self.hash)
            .field("data_type", &std::any::type_name::<T>())
            .finish_non_exhaustive()
    }
}

impl<T: QueryData> Drop for Query<T> {
    fn drop(&mut self) {
        let inner = match self.inner.get_mut() {
            Ok(inner) => inner,
            Err(poisoned) => poisoned.into_inner(),
        };
        if let Some(in_flight) = inner.in_flight.take() {
            in_flight.controller.abort();
            in_flight.task.abort();
        }
        inner.timers.abort_all();
    }
}

/// Body of a spawned fetch task.
#[allow(clippy::too_many_arguments)]
async fn run_fetch<T: QueryData>(
    query: Weak<Query<T>>,
    key: QueryKey,
    hash: String,
    generation: u64,
    query_fn: Arc<dyn QueryFn<T>>,
    retry: RetryPolicy,
    delay: RetryDelay,
    signal: AbortSignal,
) -> QueryResult<T> {
    let attempts = run_with_retry(&hash, &retry, &delay, &signal, |attempt| {
        let ctx = QueryContext {
            key: key.clone(),
            attempt,
            signal: signal.clone(),
        };
        let query_fn = Arc::clone(&query_fn);
        async move { query_fn.call(ctx).await }
    });

    let result = match AssertUnwindSafe(attempts).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(QueryError::TaskFailed {
            key: hash.clone(),
            reason: panic_message(panic.as_ref()),
        }),
    };

    match query.upgrade() {
        Some(query) if query.settle(generation, &result) => result,
        _ => Err(QueryError::Cancelled),
    }
}

pub(crate) fn panic_message(payload: &(dyn Any + Send)) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        (*message).to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "panic".to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use quarry_core::{query_key, DefaultOptions, QueryOptions};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn resolved(options: QueryOptions) -> ResolvedOptions {
        DefaultOptions::default()
            .with_retry(0u32)
            .resolve(&options)
    }

    fn counting_query(
        options: QueryOptions,
        delay: Duration,
    ) -> (Arc<Query<u32>>, Arc<AtomicU32>) {
        let calls = Arc::new(AtomicU32::new(0));
        let counter = Arc::clone(&calls);
        let query = Query::new(query_key!["counter"], resolved(options), Environment::new());
        query.set_query_fn(Arc::new(move |_ctx: QueryContext| {
            let counter = Arc::clone(&counter);
            async move {
                tokio::time::sleep(delay).await;
                Ok::<_, QueryError>(counter.fetch_add(1, Ordering::SeqCst) + 1)
            }
        }));
        (query, calls)
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_interval_never_polls() {
        let (query, calls) = counting_query(QueryOptions::new(), Duration::from_millis(10));
        let mut options = query.options();
        options.refetch_interval = Some(Duration::ZERO);
        let _sub = query.subscribe(|_: &QueryState<u32>| {}, options);

        tokio::time::sleep(Duration::from_secs(1)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert!(!query.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_set_data_with_zero_stale_time_is_stale() {
        let query: Arc<Query<u8>> = Query::new(query_key!["w"], resolved(QueryOptions::new()), Environment::new());
        query.set_data(1, false);
        assert!(query.is_stale());

        let windowed: Arc<Query<u8>> = Query::new(
            query_key!["w"],
            resolved(QueryOptions::new().with_stale_time(Duration::from_secs(5))),
            Environment::new(),
        );
        windowed.set_data(1, false);
        assert!(!windowed.is_stale());
        tokio::time::sleep(Duration::from_secs(6)).await;
        assert!(windowed.is_stale());
    }

    #[test]
    fn test_updater_apply() {
        assert_eq!(Updater::value(3).apply(Some(&1)), 3);
        assert_eq!(Updater::with(|old: Option<&i32>| old.copied().unwrap_or(0) + 1).apply(Some(&1)), 2);
        assert_eq!(Updater::from(9).apply(None), 9);
        assert_eq!(format!("{:?}", Updater::<i32>::with(|_| 0)), "Fn(<fn>)");
    }

    #[tokio::test(start_paused = true)]
    async fn test_fetch_transitions_to_success() {
        let (query, _) = counting_query(QueryOptions::new(), Duration::from_millis(10));
        assert!(query.state().is_idle());

        let pending = query.start_fetch().unwrap();
        let state = query.state();
        assert!(state.is_loading());
        assert!(state.is_fetching());
        assert_eq!(state.fetch_count, 1);

        assert_eq!(pending.await, Ok(1));
        let state = query.state();
        assert!(state.is_success());
        assert!(!state.is_fetching());
        assert_eq!(state.data, Some(1));
        assert!(state.is_stale(), "default stale_time is zero");
        assert!(state.data_updated_at.is_some());
    }

    #[tokio::test(start_paused = true)]
    async fn test_concurrent_fetches_are_deduplicated() {
        let (query, calls) = counting_query(QueryOptions::new(), Duration::from_millis(50));
        let (a, b) = tokio::join!(query.fetch(), query.fetch());
        assert_eq!(a, Ok(1));
        assert_eq!(b, Ok(1));
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn test_missing_query_fn() {
        let query: Arc<Query<u32>> = Query::new(query_key!["none"], resolved(QueryOptions::new()), Environment::new());
        assert!(matches!(query.fetch().await, Err(QueryError::MissingQueryFn { .. })));
        assert!(query.state().is_idle());
    }

    #[test]
    fn test_fetch_without_runtime_is_an_error() {
        let (query, _) = counting_query(QueryOptions::new(), Duration::ZERO);
        assert!(matches!(
            query.start_fetch().map(|_| ()),
            Err(QueryError::NoRuntime { .. })
        ));
        assert!(!query.is_fetching());
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_discards_result() {
        let (query, _) = counting_query(QueryOptions::new(), Duration::from_secs(1));
        let pending = query.start_fetch().unwrap();
        query.cancel();

        assert!(!query.is_fetching());
        assert!(query.state().is_idle());
        assert_eq!(pending.await, Err(QueryError::Cancelled));

        tokio::time::sleep(Duration::from_secs(2)).await;
        assert_eq!(query.data(), None);
    }

    #[tokio::test(start_paused = true)]
    async fn test_stale_timer_expires_data() {
        let (query, _) = counting_query(
            QueryOptions::new().with_stale_time(Duration::from_secs(5)),
            Duration::ZERO,
        );
        query.fetch().await.unwrap();
        assert!(!query.is_stale());

        tokio::time::sleep(Duration::from_secs(4)).await;
        assert!(!query.is_stale());
        tokio::time::sleep(Duration::from_secs(2)).await;
        assert!(query.is_stale());
    }

    #[tokio::test(start_paused = true)]
    async fn test_structural_sharing_keeps_version() {
        let query: Arc<Query<String>> = Query::new(query_key!["s"], resolved(QueryOptions::new()), Environment::new());
        query.set_data("a".to_string(), false);
        let version = query.state().data_version;
        query.set_data("a".to_string(), false);
        assert_eq!(query.state().data_version, version);
        query.set_data("b".to_string(), false);
        assert_eq!(query.state().data_version, version + 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_without_structural_sharing_every_write_bumps_version() {
        let query: Arc<Query<u8>> = Query::new(
            query_key!["s"],
            resolved(QueryOptions::new().with_structural_sharing(false)),
            Environment::new(),
        );
        query.set_data(1, false);
        query.set_data(1, false);
        assert_eq!(query.state().data_version, 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_subscribe_delivers_state_and_fetches() {
        let (query, calls) = counting_query(QueryOptions::new(), Duration::from_millis(10));
        let seen = Arc::new(Mutex::new(Vec::new()));
        let sink = Arc::clone(&seen);
        let sub = query.subscribe(
            move |state: &QueryState<u32>| sink.lock().unwrap().push(state.status),
            query.options(),
        );

        tokio::time::sleep(Duration::from_millis(20)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
        assert_eq!(
            *seen.lock().unwrap(),
            vec![QueryStatus::Idle, QueryStatus::Loading, QueryStatus::Success]
        );
        assert_eq!(query.observer_count(), 1);

        sub.unsubscribe();
        assert_eq!(query.observer_count(), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_disabled_subscribe_does_not_fetch() {
        let (query, calls) = counting_query(QueryOptions::new().with_enabled(false), Duration::ZERO);
        let _sub = query.subscribe(|_: &QueryState<u32>| {}, query.options());
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 0);
        assert!(matches!(query.refetch().await, Err(QueryError::Disabled { .. })));

        query.set_enabled(true);
        tokio::time::sleep(Duration::from_millis(10)).await;
        assert_eq!(calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_garbage_collection_eligibility() {
        let (query, _) = counting_query(
            QueryOptions::new().with_cache_time(Duration::from_secs(10)),
            Duration::ZERO,
        );
        assert!(!query.can_be_garbage_collected(Instant::now() + Duration::from_secs(3600)));

        query.fetch().await.unwrap();
        let now = Instant::now();
        assert!(!query.can_be_garbage_collected(now + Duration::from_secs(10)));
        assert!(query.can_be_garbage_collected(now + Duration::from_secs(11)));

        let _sub = query.subscribe(|_: &QueryState<u32>| {}, query.options());
        assert!(!query.can_be_garbage_collected(now + Duration::from_secs(11)));
    }

    #[tokio::test(start_paused = true)]
    async fn test_destroy_is_idempotent_and_final() {
        let (query, _) = counting_query(QueryOptions::new(), Duration::from_secs(1));
        let pending = query.start_fetch().unwrap();
        query.destroy();
        query.destroy();

        assert!(query.is_destroyed());
        assert_eq!(pending.await, Err(QueryError::Cancelled));
        assert!(matches!(query.fetch().await, Err(QueryError::Cancelled)));
        let sub = query.subscribe(|_: &QueryState<u32>| {}, query.options());
        assert!(!sub.is_active());
    }

    #[tokio::test(start_paused = true)]
    async fn test_panicking_query_fn_becomes_task_failure() {
        let query: Arc<Query<u32>> = Query::new(query_key!["p"], resolved(QueryOptions::new()), Environment::new());
        query.set_query_fn(Arc::new(|_ctx: QueryContext| async move {
            if true {
                panic!("query function exploded");
            }
            Ok::<u32, QueryError>(0)
        }));

        let err = query.fetch().await.unwrap_err();
        assert!(matches!(err, QueryError::TaskFailed { ref reason, .. } if reason.contains("exploded")));
        assert!(query.state().is_error());
        assert_eq!(query.state().failure_count, 1);
    }

    #[test]
    fn test_panic_message() {
        assert_eq!(panic_message(&"static"), "static");
        assert_eq!(panic_message(&String::from("owned")), "owned");
        assert_eq!(panic_message(&5u8), "panic");
    }
}
