//! Process-wide client. Everything touching the global slot lives in one
//! test so ordering between tests cannot matter.

use quarry_cache::{
    get_query_client, has_query_client, query_key, replace_query_client, set_query_client,
    take_query_client, DefaultOptions, QueryClient, QueryOptions,
};
use quarry_test_utils::mocks::ScriptedFetcher;
use std::time::Duration;

#[tokio::test(start_paused = true)]
async fn global_client_single_writer_rule() {
    assert!(!has_query_client());

    let configured = QueryClient::with_defaults(
        DefaultOptions::default().with_stale_time(Duration::from_secs(30)),
    );
    assert!(set_query_client(configured));
    assert!(!set_query_client(QueryClient::new()));
    assert_eq!(get_query_client().default_options().stale_time, Duration::from_secs(30));

    // Clones share one cache.
    let fetcher = ScriptedFetcher::new(10_u32);
    let value: u32 = get_query_client()
        .fetch_query(query_key!["global"], QueryOptions::new(), fetcher.clone())
        .await
        .unwrap();
    assert_eq!(value, 10);
    let again: u32 = get_query_client()
        .ensure_query_data(query_key!["global"], QueryOptions::new(), fetcher.clone())
        .await
        .unwrap();
    assert_eq!(again, 10);
    assert_eq!(fetcher.calls(), 1);

    let previous = replace_query_client(QueryClient::new()).unwrap();
    assert_eq!(previous.get_query_data::<u32>(&query_key!["global"]).unwrap(), Some(10));
    assert_eq!(get_query_client().get_query_data::<u32>(&query_key!["global"]).unwrap(), None);

    assert!(take_query_client().is_some());
    assert!(!has_query_client());
    let _ = get_query_client();
    assert!(has_query_client());
}
