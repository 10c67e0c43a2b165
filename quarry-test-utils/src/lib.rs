//! QUARRY Test Utilities
//!
//! Centralized test infrastructure for the QUARRY workspace:
//! - Proptest generators for query keys
//! - Scripted query and mutation functions
//! - Recording observers
//! - Test fixtures and assertions

pub use quarry_cache::{
    AbortSignal, MutationFn, Observer, QueryClient, QueryContext, QueryFn,
};
pub use quarry_core::{
    DefaultOptions, QueryError, QueryKey, QueryOptions, QueryResult, QueryState, QueryStatus,
    RetryDelay,
};

use async_trait::async_trait;
use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex, MutexGuard};
use std::time::Duration;

// ============================================================================
// TRACING
// ============================================================================

/// Install a `fmt` subscriber honoring `RUST_LOG`. Safe to call from every test.
pub fn init_test_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_test_writer()
        .try_init();
}

// ============================================================================
// MOCK FUNCTIONS
// ============================================================================

pub mod mocks {
    //! Query and mutation functions with scripted outcomes.

    use super::*;

    /// Query function that fails a set number of times, then yields values.
    ///
    /// Each success returns the next scripted value; the last one repeats.
    /// Clones share the call counter.
    #[derive(Debug, Clone)]
    pub struct ScriptedFetcher<T> {
        values: Arc<Vec<T>>,
        failures: u32,
        delay: Option<Duration>,
        calls: Arc<AtomicU32>,
        successes: Arc<AtomicU32>,
    }

    impl<T> ScriptedFetcher<T> {
        pub fn new(value: T) -> Self {
            Self::sequence(vec![value])
        }

        pub fn sequence(values: Vec<T>) -> Self {
            Self {
                values: Arc::new(values),
                failures: 0,
                delay: None,
                calls: Arc::new(AtomicU32::new(0)),
                successes: Arc::new(AtomicU32::new(0)),
            }
        }

        /// Fail the first `failures` calls.
        pub fn failing(mut self, failures: u32) -> Self {
            self.failures = failures;
            self
        }

        /// Sleep before every call. Aborts early if the fetch is cancelled.
        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        /// Calls started so far, across all clones.
        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }
    }

    #[async_trait]
    impl<T> QueryFn<T> for ScriptedFetcher<T>
    where
        T: Clone + Send + Sync + 'static,
    {
        async fn call(&self, ctx: QueryContext) -> QueryResult<T> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            if let Some(delay) = self.delay {
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = ctx.signal.aborted() => return Err(QueryError::Cancelled),
                }
            }
            if call < self.failures {
                return Err(QueryError::fetch(format!(
                    "scripted failure {} of {} for {}",
                    call + 1,
                    self.failures,
                    ctx.key
                )));
            }

            let success = self.successes.fetch_add(1, Ordering::SeqCst) as usize;
            let last = self.values.len().checked_sub(1).ok_or_else(|| {
                QueryError::fetch(format!("no scripted values for {}", ctx.key))
            })?;
            Ok(self.values[success.min(last)].clone())
        }
    }

    /// Mutation function that echoes its variables after `failures` errors,
    /// recording every call.
    #[derive(Debug, Clone)]
    pub struct ScriptedMutation<V> {
        failures: u32,
        delay: Option<Duration>,
        calls: Arc<AtomicU32>,
        received: Arc<Mutex<Vec<V>>>,
    }

    impl<V> ScriptedMutation<V> {
        pub fn new() -> Self {
            Self {
                failures: 0,
                delay: None,
                calls: Arc::new(AtomicU32::new(0)),
                received: Arc::new(Mutex::new(Vec::new())),
            }
        }

        pub fn failing(mut self, failures: u32) -> Self {
            self.failures = failures;
            self
        }

        pub fn with_delay(mut self, delay: Duration) -> Self {
            self.delay = Some(delay);
            self
        }

        pub fn calls(&self) -> u32 {
            self.calls.load(Ordering::SeqCst)
        }

        /// Variables of every call, in order.
        pub fn received(&self) -> Vec<V>
        where
            V: Clone,
        {
            lock(&self.received).clone()
        }
    }

    impl<V> Default for ScriptedMutation<V> {
        fn default() -> Self {
            Self::new()
        }
    }

    #[async_trait]
    impl<V> MutationFn<V, V> for ScriptedMutation<V>
    where
        V: Clone + Send + Sync + 'static,
    {
        async fn call(&self, variables: V) -> QueryResult<V> {
            let call = self.calls.fetch_add(1, Ordering::SeqCst);
            lock(&self.received).push(variables.clone());
            if let Some(delay) = self.delay {
                tokio::time::sleep(delay).await;
            }
            if call < self.failures {
                return Err(QueryError::fetch(format!("scripted mutation failure {}", call + 1)));
            }
            Ok(variables)
        }
    }

    /// Observer that keeps every state it is handed.
    #[derive(Debug)]
    pub struct RecordingObserver<S> {
        states: Arc<Mutex<Vec<S>>>,
    }

    impl<S> Clone for RecordingObserver<S> {
        fn clone(&self) -> Self {
            Self {
                states: Arc::clone(&self.states),
            }
        }
    }

    impl<S> Default for RecordingObserver<S> {
        fn default() -> Self {
            Self {
                states: Arc::new(Mutex::new(Vec::new())),
            }
        }
    }

    impl<S: Clone> RecordingObserver<S> {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn states(&self) -> Vec<S> {
            lock(&self.states).clone()
        }

        pub fn last(&self) -> Option<S> {
            lock(&self.states).last().cloned()
        }

        pub fn len(&self) -> usize {
            lock(&self.states).len()
        }

        pub fn is_empty(&self) -> bool {
            lock(&self.states).is_empty()
        }
    }

    impl<S> Observer<S> for RecordingObserver<S>
    where
        S: Clone + Send + Sync + 'static,
    {
        fn notify(&self, state: &S) {
            lock(&self.states).push(state.clone());
        }
    }

    fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
        mutex.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

// ============================================================================
// PROPTEST GENERATORS
// ============================================================================

pub mod generators {
    //! Proptest strategies for query keys.

    use super::*;
    use proptest::prelude::*;
    use serde_json::{Map, Value};

    /// Short identifier used for object property names and string parts.
    pub fn arb_identifier() -> impl Strategy<Value = String> {
        "[a-z][a-z0-9_]{0,7}"
    }

    /// A JSON scalar. Floats are left out so equality stays exact.
    pub fn arb_scalar() -> impl Strategy<Value = Value> {
        prop_oneof![
            Just(Value::Null),
            any::<bool>().prop_map(Value::Bool),
            any::<i64>().prop_map(Value::from),
            arb_identifier().prop_map(Value::String),
        ]
    }

    /// A key part: scalars, arrays and objects nested up to a few levels.
    pub fn arb_key_part() -> impl Strategy<Value = Value> {
        arb_scalar().prop_recursive(3, 24, 4, |inner| {
            prop_oneof![
                prop::collection::vec(inner.clone(), 0..4).prop_map(Value::Array),
                prop::collection::btree_map(arb_identifier(), inner, 0..4)
                    .prop_map(|entries| Value::Object(entries.into_iter().collect())),
            ]
        })
    }

    pub fn arb_query_key() -> impl Strategy<Value = QueryKey> {
        prop::collection::vec(arb_key_part(), 0..5).prop_map(QueryKey::new)
    }

    /// A key paired with a copy whose objects list their properties in
    /// reverse insertion order at every depth.
    pub fn arb_permuted_key_pair() -> impl Strategy<Value = (QueryKey, QueryKey)> {
        arb_query_key().prop_map(|key| {
            let permuted = QueryKey::new(key.parts().iter().map(reverse_object_order).collect());
            (key, permuted)
        })
    }

    /// Copy `value` with every object's properties inserted in reverse order.
    pub fn reverse_object_order(value: &Value) -> Value {
        match value {
            Value::Object(map) => {
                let mut reversed = Map::new();
                for (name, nested) in map.iter().rev() {
                    reversed.insert(name.clone(), reverse_object_order(nested));
                }
                Value::Object(reversed)
            }
            Value::Array(items) => Value::Array(items.iter().map(reverse_object_order).collect()),
            scalar => scalar.clone(),
        }
    }
}

// ============================================================================
// TEST FIXTURES
// ============================================================================

pub mod fixtures {
    //! Pre-built values for common scenarios.

    use super::*;
    use serde_json::{json, Value};

    /// Defaults with a short fixed retry delay so retry tests stay quick.
    pub fn fast_retry_defaults() -> DefaultOptions {
        DefaultOptions::default().with_retry_delay(RetryDelay::Fixed(Duration::from_millis(10)))
    }

    /// Client on [`fast_retry_defaults`].
    pub fn test_client() -> QueryClient {
        QueryClient::with_defaults(fast_retry_defaults())
    }

    pub fn user_key(id: u64) -> QueryKey {
        QueryKey::new(vec![json!("user"), json!(id.to_string())])
    }

    pub fn user(id: u64, name: &str) -> Value {
        json!({ "id": id, "name": name })
    }
}

// ============================================================================
// CUSTOM ASSERTIONS
// ============================================================================

pub mod assertions {
    //! Assertions over query state snapshots.

    use super::*;
    use std::fmt::Debug;

    /// Assert the state holds `expected` and is not stale.
    #[track_caller]
    pub fn assert_fresh<T: PartialEq + Debug>(state: &QueryState<T>, expected: &T) {
        assert_eq!(state.data.as_ref(), Some(expected), "unexpected data in {:?}", state);
        assert!(!state.stale, "expected fresh data, got stale state: {:?}", state);
    }

    /// Assert the state holds `expected` and is stale.
    #[track_caller]
    pub fn assert_stale<T: PartialEq + Debug>(state: &QueryState<T>, expected: &T) {
        assert_eq!(state.data.as_ref(), Some(expected), "unexpected data in {:?}", state);
        assert!(state.stale, "expected stale data, got fresh state: {:?}", state);
    }

    #[track_caller]
    pub fn assert_status<T: Debug>(state: &QueryState<T>, status: QueryStatus) {
        assert_eq!(state.status, status, "unexpected status in {:?}", state);
    }

    /// Assert the state settled with a terminal error.
    #[track_caller]
    pub fn assert_failed<T: Debug>(state: &QueryState<T>) {
        assert_eq!(state.status, QueryStatus::Error, "expected error status in {:?}", state);
        assert!(state.error.is_some(), "expected an error in {:?}", state);
        assert!(!state.is_fetching(), "expected settled state, still fetching: {:?}", state);
    }
}

// ============================================================================
// TESTS
// ============================================================================
