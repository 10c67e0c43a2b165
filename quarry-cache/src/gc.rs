//! Recurring garbage-collection sweep.
//!
//! Entries arm their own GC timer when they lose their last observer; the
//! sweep is the backstop that catches anything those timers missed (entries
//! written without a runtime, options changed after arming, and so on).

use crate::cache::QueryCache;
use quarry_core::{ConfigError, QuarryResult, QueryError};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;
use tokio::runtime::Handle;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tokio::time::{interval_at, Instant, MissedTickBehavior};

// ============================================================================
// METRICS
// ============================================================================

/// Counters for one sweep task.
#[derive(Debug, Default)]
pub struct GcSweepMetrics {
    /// Sweeps completed since the task started
    pub sweeps: AtomicU64,

    /// Entries removed across all sweeps
    pub queries_removed: AtomicU64,
}

impl GcSweepMetrics {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> GcSweepSnapshot {
        GcSweepSnapshot {
            sweeps: self.sweeps.load(Ordering::Relaxed),
            queries_removed: self.queries_removed.load(Ordering::Relaxed),
        }
    }
}

/// Sweep metrics at a point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct GcSweepSnapshot {
    pub sweeps: u64,
    pub queries_removed: u64,
}

// ============================================================================
// HANDLE
// ============================================================================

/// Owns a running sweep. Dropping the handle stops the sweep.
#[derive(Debug)]
pub struct GcHandle {
    shutdown_tx: watch::Sender<bool>,
    task: Option<JoinHandle<()>>,
    metrics: Arc<GcSweepMetrics>,
    period: Duration,
}

impl GcHandle {
    pub fn period(&self) -> Duration {
        self.period
    }

    pub fn metrics(&self) -> GcSweepSnapshot {
        self.metrics.snapshot()
    }

    pub fn is_running(&self) -> bool {
        self.task.as_ref().is_some_and(|task| !task.is_finished())
    }

    /// Signal shutdown and wait for the task to exit.
    pub async fn shutdown(mut self) -> GcSweepSnapshot {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            if let Err(err) = task.await {
                tracing::warn!(error = %err, "GC sweep task ended abnormally");
            }
        }
        self.metrics.snapshot()
    }
}

impl Drop for GcHandle {
    fn drop(&mut self) {
        let _ = self.shutdown_tx.send(true);
        if let Some(task) = self.task.take() {
            task.abort();
        }
    }
}

// ============================================================================
// BACKGROUND TASK
// ============================================================================

/// Spawn the sweep on the ambient runtime. `period` must be nonzero.
pub(crate) fn spawn_gc_sweep(cache: Weak<QueryCache>, period: Duration) -> QuarryResult<GcHandle> {
    if period.is_zero() {
        return Err(ConfigError::InvalidValue {
            field: "gc_interval".to_string(),
            value: format!("{:?}", period),
            reason: "gc_interval must be positive".to_string(),
        }
        .into());
    }
    let handle = Handle::try_current().map_err(|_| QueryError::NoRuntime {
        operation: "gc sweep",
    })?;
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let metrics = Arc::new(GcSweepMetrics::new());
    let task = handle.spawn(gc_sweep_task(cache, period, shutdown_rx, Arc::clone(&metrics)));

    Ok(GcHandle {
        shutdown_tx,
        task: Some(task),
        metrics,
        period,
    })
}

/// Sweep `cache` every `period` until shutdown or until the cache is dropped.
async fn gc_sweep_task(
    cache: Weak<QueryCache>,
    period: Duration,
    mut shutdown_rx: watch::Receiver<bool>,
    metrics: Arc<GcSweepMetrics>,
) {
    // The first tick of a plain `interval` fires immediately; start one period out.
    let mut sweep_interval = interval_at(Instant::now() + period, period);
    sweep_interval.set_missed_tick_behavior(MissedTickBehavior::Skip);

    tracing::info!(period_ms = period.as_millis() as u64, "Query cache GC task started");

    loop {
        tokio::select! {
            changed = shutdown_rx.changed() => {
                if changed.is_err() || *shutdown_rx.borrow() {
                    tracing::info!("Query cache GC task shutting down");
                    break;
                }
            }

            _ = sweep_interval.tick() => {
                let Some(cache) = cache.upgrade() else {
                    tracing::info!("Query cache dropped, GC task exiting");
                    break;
                };
                let removed = cache.gc();
                metrics.sweeps.fetch_add(1, Ordering::Relaxed);
                metrics.queries_removed.fetch_add(removed as u64, Ordering::Relaxed);
            }
        }
    }

    let snapshot = metrics.snapshot();
    tracing::info!(
        sweeps = snapshot.sweeps,
        queries_removed = snapshot.queries_removed,
        "Query cache GC task completed"
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::query::Query;
    use quarry_core::{query_key, DefaultOptions, QuarryError, QueryOptions};

    #[test]
    fn test_metrics_snapshot() {
        let metrics = GcSweepMetrics::new();
        metrics.sweeps.fetch_add(2, Ordering::Relaxed);
        metrics.queries_removed.fetch_add(5, Ordering::Relaxed);
        assert_eq!(
            metrics.snapshot(),
            GcSweepSnapshot {
                sweeps: 2,
                queries_removed: 5
            }
        );
    }

    #[test]
    fn test_requires_runtime() {
        let cache = QueryCache::new();
        assert!(matches!(
            cache.schedule_gc(Duration::from_secs(1)),
            Err(QuarryError::Query(QueryError::NoRuntime { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_zero_period_is_rejected() {
        let cache = QueryCache::new();
        assert!(matches!(
            cache.schedule_gc(Duration::ZERO),
            Err(QuarryError::Config(ConfigError::InvalidValue { .. }))
        ));
    }

    #[tokio::test(start_paused = true)]
    async fn test_sweep_removes_expired_entries() {
        let cache = QueryCache::new();
        let options = DefaultOptions::default()
            .resolve(&QueryOptions::new().with_cache_time(Duration::from_secs(5)));
        // Standalone queries carry no GC timer, so only the sweep can remove this one.
        cache.insert(Query::<u8>::new(query_key!["swept"], options, cache.environment().clone()));
        cache.get::<u8>(&query_key!["swept"]).unwrap().unwrap().set_data(1, false);

        let handle = cache.schedule_gc(Duration::from_secs(10)).unwrap();
        assert!(handle.is_running());
        assert_eq!(handle.period(), Duration::from_secs(10));

        tokio::time::sleep(Duration::from_secs(11)).await;
        assert!(cache.is_empty());

        let snapshot = handle.shutdown().await;
        assert_eq!(snapshot.sweeps, 1);
        assert_eq!(snapshot.queries_removed, 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_drop_stops_sweep() {
        let cache = QueryCache::new();
        let handle = cache.schedule_gc(Duration::from_secs(1)).unwrap();
        drop(handle);
        tokio::time::sleep(Duration::from_secs(3)).await;
        assert!(cache.is_empty());
    }
}
