//! Cache maintenance tests: garbage collection, invalidation, bulk refetch,
//! removal and stats.

use quarry_cache::{query_key, DefaultOptions, QueryClient, QueryOptions, QueryState};
use quarry_test_utils::fixtures;
use quarry_test_utils::mocks::{RecordingObserver, ScriptedFetcher};
use std::time::Duration;
use tokio::time::Instant;

fn short_cache_client() -> QueryClient {
    QueryClient::with_defaults(
        fixtures::fast_retry_defaults().with_cache_time(Duration::from_secs(10)),
    )
}

async fn settle() {
    tokio::time::sleep(Duration::from_millis(1)).await;
}

// ============================================================================
// GARBAGE COLLECTION
// ============================================================================

#[tokio::test(start_paused = true)]
async fn unobserved_entries_expire_after_cache_time() {
    let client = short_cache_client();
    let fetcher = ScriptedFetcher::new(1_u32);
    let key = query_key!["unobserved"];

    let _: u32 = client.fetch_query(key.clone(), QueryOptions::new(), fetcher).await.unwrap();
    assert!(client.cache().contains(&key));

    tokio::time::sleep(Duration::from_secs(9)).await;
    assert!(client.cache().contains(&key));

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!client.cache().contains(&key));
}

#[tokio::test(start_paused = true)]
async fn observed_entries_are_never_collected() {
    let client = short_cache_client();
    let key = query_key!["observed"];
    let observer = RecordingObserver::<QueryState<u32>>::new();
    let subscription = client
        .subscribe(key.clone(), QueryOptions::new(), ScriptedFetcher::new(1_u32), observer.clone())
        .unwrap();
    settle().await;
    assert_eq!(client.get_query_data::<u32>(&key).unwrap(), Some(1));

    tokio::time::sleep(Duration::from_secs(60)).await;
    assert_eq!(client.cache().gc_at(Instant::now() + Duration::from_secs(3600)), 0);
    assert!(client.cache().contains(&key));

    // Losing the last observer starts the countdown.
    subscription.unsubscribe();
    tokio::time::sleep(Duration::from_secs(11)).await;
    assert!(!client.cache().contains(&key));
}

#[tokio::test(start_paused = true)]
async fn manual_sweep_removes_only_expired_entries() {
    let client = QueryClient::with_defaults(
        DefaultOptions::default().with_cache_time(Duration::from_secs(30)),
    );
    let old = query_key!["old"];
    let young = query_key!["young"];

    client.set_query_data::<u32>(&old, 1, false).unwrap();
    tokio::time::advance(Duration::from_secs(20)).await;
    client.set_query_data::<u32>(&young, 2, false).unwrap();

    let later = Instant::now() + Duration::from_secs(15);
    assert_eq!(client.cache().stats_at(later).gc_ready_queries, 1);
    assert_eq!(client.cache().gc_at(later), 1);
    assert!(!client.cache().contains(&old));
    assert!(client.cache().contains(&young));
}

#[tokio::test(start_paused = true)]
async fn recurring_sweep_runs_on_gc_interval() {
    let client = QueryClient::with_defaults(
        DefaultOptions::default()
            .with_cache_time(Duration::from_secs(5))
            .with_gc_interval(Duration::from_secs(60)),
    );
    client.start_gc().unwrap();
    assert!(client.is_gc_running());

    // A standalone query carries no timer of its own; only the sweep can collect it.
    let key = query_key!["standalone"];
    let query = quarry_cache::Query::<u32>::new(
        key.clone(),
        client.resolve(&QueryOptions::new()),
        client.environment().clone(),
    );
    query.set_data(3, false);
    client.cache().insert(query);

    tokio::time::sleep(Duration::from_secs(59)).await;
    assert!(client.cache().contains(&key));
    tokio::time::sleep(Duration::from_secs(2)).await;
    assert!(!client.cache().contains(&key));

    client.stop_gc();
    assert!(!client.is_gc_running());
}

// ============================================================================
// INVALIDATION & REFETCH
// ============================================================================

#[tokio::test(start_paused = true)]
async fn invalidate_all_refetches_only_observed_entries() {
    let client = fixtures::test_client();
    let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
    let observed = ScriptedFetcher::new(1_u32);
    let unobserved = ScriptedFetcher::new(2_u32);

    let _subscription = client
        .subscribe(
            query_key!["observed"],
            options.clone(),
            observed.clone(),
            RecordingObserver::<QueryState<u32>>::new(),
        )
        .unwrap();
    let _: u32 = client
        .fetch_query(query_key!["unobserved"], options, unobserved.clone())
        .await
        .unwrap();
    settle().await;
    assert_eq!((observed.calls(), unobserved.calls()), (1, 1));

    assert_eq!(client.invalidate_queries(None), 2);
    settle().await;

    assert_eq!(observed.calls(), 2);
    assert_eq!(unobserved.calls(), 1);
    assert!(client.get_query_state::<u32>(&query_key!["unobserved"]).unwrap().unwrap().stale);
    assert!(!client.get_query_state::<u32>(&query_key!["observed"]).unwrap().unwrap().stale);
}

#[tokio::test(start_paused = true)]
async fn invalidate_single_key() {
    let client = fixtures::test_client();
    let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
    let a = ScriptedFetcher::new(1_u32);
    let b = ScriptedFetcher::new(2_u32);
    let _sa = client
        .subscribe(query_key!["a"], options.clone(), a.clone(), RecordingObserver::<QueryState<u32>>::new())
        .unwrap();
    let _sb = client
        .subscribe(query_key!["b"], options, b.clone(), RecordingObserver::<QueryState<u32>>::new())
        .unwrap();
    settle().await;

    assert_eq!(client.invalidate_queries(Some(&query_key!["a"])), 1);
    assert_eq!(client.invalidate_queries(Some(&query_key!["missing"])), 0);
    settle().await;

    assert_eq!((a.calls(), b.calls()), (2, 1));
}

#[tokio::test(start_paused = true)]
async fn refetch_queries_waits_for_observed_entries() {
    let client = fixtures::test_client();
    let options = QueryOptions::new().with_stale_time(Duration::from_secs(60));
    let observed = ScriptedFetcher::sequence(vec![1_u32, 2]).with_delay(Duration::from_millis(50));
    let unobserved = ScriptedFetcher::new(9_u32);

    let _subscription = client
        .subscribe(
            query_key!["observed"],
            options.clone(),
            observed.clone(),
            RecordingObserver::<QueryState<u32>>::new(),
        )
        .unwrap();
    let _: u32 = client
        .fetch_query(query_key!["unobserved"], options, unobserved.clone())
        .await
        .unwrap();
    tokio::time::sleep(Duration::from_millis(100)).await;

    assert_eq!(client.refetch_queries(None).await, 1);
    assert_eq!(client.get_query_data::<u32>(&query_key!["observed"]).unwrap(), Some(2));
    assert_eq!(unobserved.calls(), 1);
}

// ============================================================================
// REMOVAL & STATS
// ============================================================================

#[tokio::test(start_paused = true)]
async fn remove_and_clear_destroy_entries() {
    let client = fixtures::test_client();
    client.set_query_data::<u32>(&query_key!["a"], 1, false).unwrap();
    client.set_query_data::<u32>(&query_key!["b"], 2, false).unwrap();
    let a = client.get_query::<u32>(&query_key!["a"]).unwrap().unwrap();

    assert_eq!(client.remove_queries(Some(&query_key!["a"])), 1);
    assert!(a.is_destroyed());
    assert_eq!(client.get_query_data::<u32>(&query_key!["a"]).unwrap(), None);

    client.clear();
    assert!(client.cache().is_empty());
}

#[tokio::test(start_paused = true)]
async fn stats_track_observed_and_fetching_entries() {
    let client = fixtures::test_client();
    let slow = ScriptedFetcher::new(1_u32).with_delay(Duration::from_secs(1));
    let _subscription = client
        .subscribe(query_key!["slow"], QueryOptions::new(), slow, RecordingObserver::<QueryState<u32>>::new())
        .unwrap();
    client.set_query_data::<u32>(&query_key!["idle"], 1, false).unwrap();

    let stats = client.stats();
    assert_eq!(stats.total_queries, 2);
    assert_eq!(stats.active_queries, 1);
    assert_eq!(stats.fetching_queries, 1);
    assert_eq!(stats.inactive_queries(), 1);
    assert!(client.is_fetching());

    tokio::time::sleep(Duration::from_secs(2)).await;
    assert_eq!(client.stats().fetching_queries, 0);
    assert!(!client.is_fetching());
}
