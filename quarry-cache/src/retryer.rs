//! Retry loop shared by query fetches and mutations.

use crate::signal::AbortSignal;
use quarry_core::{QueryError, QueryResult, RetryDelay, RetryPolicy};
use std::future::Future;

/// Run `attempt` until it succeeds, the policy gives up, or `signal` fires.
///
/// `attempt` receives the number of failures so far. Waits between attempts
/// race against the signal so a cancelled fetch never sleeps out its delay.
pub(crate) async fn run_with_retry<T, F, Fut>(
    label: &str,
    policy: &RetryPolicy,
    delay: &RetryDelay,
    signal: &AbortSignal,
    mut attempt: F,
) -> QueryResult<T>
where
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = QueryResult<T>>,
{
    let mut failures = 0u32;
    loop {
        if signal.is_aborted() {
            return Err(QueryError::Cancelled);
        }

        let error = match attempt(failures).await {
            Ok(value) => return Ok(value),
            Err(error) => error,
        };

        if signal.is_aborted() {
            return Err(QueryError::Cancelled);
        }

        failures = failures.saturating_add(1);
        if !policy.should_retry(failures, &error) {
            tracing::debug!(key = %label, failures, error = %error, "Giving up after failure");
            return Err(error);
        }

        let wait = delay.delay_for(failures);
        tracing::warn!(
            key = %label,
            attempt = failures,
            delay_ms = wait.as_millis() as u64,
            error = %error,
            "Attempt failed, retrying"
        );

        tokio::select! {
            _ = signal.aborted() => return Err(QueryError::Cancelled),
            _ = tokio::time::sleep(wait) => {}
        }
    }
}
