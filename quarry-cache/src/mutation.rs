//! Mutation runner.
//!
//! A [`Mutation`] runs one write-style operation at a time with the same
//! retry and backoff behavior as query fetches. Concurrent `mutate` calls
//! while a run is in flight join that run. Each run gets a generation; a
//! run that was superseded by [`Mutation::reset`] still completes for its
//! caller, but its result no longer touches state or hooks.

use crate::observer::{dispatch, notify_one, Observer, ObserverEntry, Subscription};
use crate::query::panic_message;
use crate::query_fn::MutationFn;
use crate::retryer::run_with_retry;
use crate::signal::AbortSignal;
use crate::sync;
use chrono::Utc;
use futures_util::future::{BoxFuture, FutureExt, Shared};
use quarry_core::{
    MutationState, MutationStatus, QueryError, QueryResult, ResolvedMutationOptions,
};
use std::panic::{catch_unwind, AssertUnwindSafe};
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, Weak};
use tokio::runtime::Handle;
use uuid::Uuid;

type SharedRun<T> = Shared<BoxFuture<'static, QueryResult<T>>>;

type BeforeHook<V> = Arc<dyn Fn(&V) + Send + Sync>;
type SuccessHook<V, T> = Arc<dyn Fn(&T, &V) + Send + Sync>;
type ErrorHook<V> = Arc<dyn Fn(&QueryError, &V) + Send + Sync>;
type SettledHook<V, T> = Arc<dyn Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync>;

/// Lifecycle callbacks for a [`Mutation`].
pub struct MutationHooks<V, T> {
    on_mutate: Option<BeforeHook<V>>,
    on_success: Option<SuccessHook<V, T>>,
    on_error: Option<ErrorHook<V>>,
    on_settled: Option<SettledHook<V, T>>,
}

impl<V, T> MutationHooks<V, T> {
    pub fn new() -> Self {
        Self {
            on_mutate: None,
            on_success: None,
            on_error: None,
            on_settled: None,
        }
    }

    /// Runs before the mutation function, with the run's variables.
    pub fn on_mutate<F>(mut self, f: F) -> Self
    where
        F: Fn(&V) + Send + Sync + 'static,
    {
        self.on_mutate = Some(Arc::new(f));
        self
    }

    pub fn on_success<F>(mut self, f: F) -> Self
    where
        F: Fn(&T, &V) + Send + Sync + 'static,
    {
        self.on_success = Some(Arc::new(f));
        self
    }

    pub fn on_error<F>(mut self, f: F) -> Self
    where
        F: Fn(&QueryError, &V) + Send + Sync + 'static,
    {
        self.on_error = Some(Arc::new(f));
        self
    }

    /// Runs after `on_success` or `on_error`.
    pub fn on_settled<F>(mut self, f: F) -> Self
    where
        F: Fn(Option<&T>, Option<&QueryError>, &V) + Send + Sync + 'static,
    {
        self.on_settled = Some(Arc::new(f));
        self
    }
}

impl<V, T> Default for MutationHooks<V, T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<V, T> Clone for MutationHooks<V, T> {
    fn clone(&self) -> Self {
        Self {
            on_mutate: self.on_mutate.clone(),
            on_success: self.on_success.clone(),
            on_error: self.on_error.clone(),
            on_settled: self.on_settled.clone(),
        }
    }
}

fn run_hook(name: &'static str, hook: impl FnOnce()) {
    if let Err(panic) = catch_unwind(AssertUnwindSafe(hook)) {
        tracing::warn!(hook = name, panic = %panic_message(panic.as_ref()), "Mutation hook panicked");
    }
}

struct MutationRun<V, T> {
    state: MutationState<V, T>,
    generation: u64,
    in_flight: Option<SharedRun<T>>,
    observers: Vec<ObserverEntry<MutationState<V, T>>>,
}

struct MutationShared<V, T> {
    mutation_fn: Arc<dyn MutationFn<V, T>>,
    options: ResolvedMutationOptions,
    hooks: MutationHooks<V, T>,
    run: Mutex<MutationRun<V, T>>,
}

impl<V, T> MutationShared<V, T> {
    fn lock(&self) -> MutexGuard<'_, MutationRun<V, T>> {
        sync::lock(&self.run, "mutation")
    }
}

/// Runs a write-style async operation with retry and lifecycle state.
pub struct Mutation<V, T> {
    shared: Arc<MutationShared<V, T>>,
}

impl<V, T> Clone for Mutation<V, T> {
    fn clone(&self) -> Self {
        Self {
            shared: Arc::clone(&self.shared),
        }
    }
}

impl<V, T> Mutation<V, T>
where
    V: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    pub fn new<F>(mutation_fn: F, options: ResolvedMutationOptions) -> Self
    where
        F: MutationFn<V, T>,
    {
        Self::with_hooks(mutation_fn, options, MutationHooks::new())
    }

    pub fn with_hooks<F>(
        mutation_fn: F,
        options: ResolvedMutationOptions,
        hooks: MutationHooks<V, T>,
    ) -> Self
    where
        F: MutationFn<V, T>,
    {
        Self {
            shared: Arc::new(MutationShared {
                mutation_fn: Arc::new(mutation_fn),
                options,
                hooks,
                run: Mutex::new(MutationRun {
                    state: MutationState::new(),
                    generation: 0,
                    in_flight: None,
                    observers: Vec::new(),
                }),
            }),
        }
    }

    pub fn state(&self) -> MutationState<V, T> {
        self.shared.lock().state.clone()
    }

    pub fn is_loading(&self) -> bool {
        self.shared.lock().in_flight.is_some()
    }

    /// Run the mutation, or join the run already in flight (whose variables
    /// then win over `variables`). `on_mutate` runs on the spawned task
    /// before the first attempt.
    pub async fn mutate(&self, variables: V) -> QueryResult<T> {
        let run = self.start(variables)?;
        run.await
    }

    fn start(&self, variables: V) -> QueryResult<SharedRun<T>> {
        let (run, notification) = {
            let mut inner = self.shared.lock();
            if let Some(run) = &inner.in_flight {
                tracing::debug!("Joining in-flight mutation");
                return Ok(run.clone());
            }
            let handle = Handle::try_current()
                .map_err(|_| QueryError::NoRuntime { operation: "mutate" })?;

            inner.generation += 1;
            let generation = inner.generation;
            let submission_id = Uuid::now_v7();
            inner.state = MutationState {
                status: MutationStatus::Loading,
                data: None,
                error: None,
                variables: Some(variables.clone()),
                submission_id: Some(submission_id),
                submitted_at: Some(Utc::now()),
                failure_count: 0,
            };

            let task = handle.spawn(run_mutation(
                Arc::downgrade(&self.shared),
                generation,
                submission_id,
                variables,
            ));
            let run = async move {
                match task.await {
                    Ok(result) => result,
                    Err(err) if err.is_cancelled() => Err(QueryError::Cancelled),
                    Err(err) => Err(QueryError::TaskFailed {
                        key: submission_id.to_string(),
                        reason: err.to_string(),
                    }),
                }
            }
            .boxed()
            .shared();

            tracing::debug!(submission_id = %submission_id, generation, "Mutation started");
            inner.in_flight = Some(run.clone());
            (run, (inner.observers.clone(), inner.state.clone()))
        };
        dispatch(&notification.0, &notification.1, "mutation");
        Ok(run)
    }

    /// Return to idle, discarding variables and results. A run in flight
    /// keeps going but its outcome is no longer recorded.
    pub fn reset(&self) {
        let notification = {
            let mut inner = self.shared.lock();
            inner.generation += 1;
            inner.in_flight = None;
            inner.state = MutationState::new();
            (inner.observers.clone(), inner.state.clone())
        };
        dispatch(&notification.0, &notification.1, "mutation");
    }

    /// Register an observer and deliver the current state to it right away.
    pub fn subscribe<O>(&self, observer: O) -> Subscription
    where
        O: Observer<MutationState<V, T>>,
    {
        let id = Uuid::now_v7();
        let entry = ObserverEntry {
            id,
            observer: Arc::new(observer),
        };
        let snapshot = {
            let mut inner = self.shared.lock();
            inner.observers.push(entry.clone());
            inner.state.clone()
        };
        notify_one(&entry, &snapshot, "mutation");

        let weak: Weak<MutationShared<V, T>> = Arc::downgrade(&self.shared);
        Subscription::new(id, move || {
            if let Some(shared) = weak.upgrade() {
                shared.lock().observers.retain(|o| o.id != id);
            }
        })
    }

    pub fn observer_count(&self) -> usize {
        self.shared.lock().observers.len()
    }
}

impl<V, T> std::fmt::Debug for Mutation<V, T> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Mutation")
            .field("status", &self.shared.lock().state.status)
            .finish_non_exhaustive()
    }
}

async fn run_mutation<V, T>(
    shared: Weak<MutationShared<V, T>>,
    generation: u64,
    submission_id: Uuid,
    variables: V,
) -> QueryResult<T>
where
    V: Clone + Send + Sync + 'static,
    T: Clone + Send + Sync + 'static,
{
    let Some(owner) = shared.upgrade() else {
        return Err(QueryError::Cancelled);
    };
    let mutation_fn = Arc::clone(&owner.mutation_fn);
    let options = owner.options.clone();
    if let Some(hook) = &owner.hooks.on_mutate {
        run_hook("on_mutate", || hook(&variables));
    }
    drop(owner);

    let label = submission_id.to_string();
    let signal = AbortSignal::never();
    let failed = Arc::new(AtomicU32::new(0));
    let attempts = run_with_retry(&label, &options.retry, &options.retry_delay, &signal, |failures| {
        if failures > 0 {
            record_retry(&shared, generation, failures);
        }
        let mutation_fn = Arc::clone(&mutation_fn);
        let variables = variables.clone();
        let failed = Arc::clone(&failed);
        async move {
            let result = mutation_fn.call(variables).await;
            if result.is_err() {
                failed.fetch_add(1, Ordering::SeqCst);
            }
            result
        }
    });
    let result = match AssertUnwindSafe(attempts).catch_unwind().await {
        Ok(result) => result,
        Err(panic) => Err(QueryError::TaskFailed {
            key: label.clone(),
            reason: panic_message(panic.as_ref()),
        }),
    };

    if let Some(owner) = shared.upgrade() {
        settle(&owner, generation, &variables, &result, failed.load(Ordering::SeqCst));
    }
    result
}

/// Publish the failure count of a run that is about to retry.
fn record_retry<V, T>(shared: &Weak<MutationShared<V, T>>, generation: u64, failures: u32)
where
    V: Clone + 'static,
    T: Clone + 'static,
{
    let Some(owner) = shared.upgrade() else {
        return;
    };
    let notification = {
        let mut inner = owner.lock();
        if inner.generation != generation {
            return;
        }
        inner.state.failure_count = failures;
        (inner.observers.clone(), inner.state.clone())
    };
    dispatch(&notification.0, &notification.1, "mutation");
}

fn settle<V, T>(
    shared: &MutationShared<V, T>,
    generation: u64,
    variables: &V,
    result: &QueryResult<T>,
    failures: u32,
) where
    V: Clone + 'static,
    T: Clone + 'static,
{
    let notification = {
        let mut inner = shared.lock();
        if inner.generation != generation {
            tracing::debug!(generation, "Discarding result of reset mutation");
            return;
        }
        inner.in_flight = None;
        match result {
            Ok(data) => {
                inner.state.status = MutationStatus::Success;
                inner.state.data = Some(data.clone());
                inner.state.error = None;
                inner.state.failure_count = 0;
            }
            Err(err) => {
                inner.state.status = MutationStatus::Error;
                inner.state.error = Some(err.clone());
                // A panicking attempt never reaches the counter.
                inner.state.failure_count = failures.max(1);
                tracing::debug!(generation, error = %err, "Mutation failed");
            }
        }
        (inner.observers.clone(), inner.state.clone())
    };

    let hooks = &shared.hooks;
    match result {
        Ok(data) => {
            if let Some(hook) = &hooks.on_success {
                run_hook("on_success", || hook(data, variables));
            }
            if let Some(hook) = &hooks.on_settled {
                run_hook("on_settled", || hook(Some(data), None, variables));
            }
        }
        Err(err) => {
            if let Some(hook) = &hooks.on_error {
                run_hook("on_error", || hook(err, variables));
            }
            if let Some(hook) = &hooks.on_settled {
                run_hook("on_settled", || hook(None, Some(err), variables));
            }
        }
    }
    dispatch(&notification.0, &notification.1, "mutation");
}
