use crate::suite::fixture::fixture_with;
use crate::suite::fixture::seed_store;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use vdiff_search::Backends;
use vdiff_search::SearchConfig;
use vdiff_search::SearchEngine;
use vdiff_search::SearchError;

fn fast_config() -> SearchConfig {
    SearchConfig {
        primary_refresh_secs: 1,
        classification_refresh_secs: 1,
        snapshot_refresh_secs: 1,
        snapshot_corpora: vec!["gm".to_string()],
        ..Default::default()
    }
}

fn refresher_names(engine: &SearchEngine) -> Vec<String> {
    engine
        .cache_status()
        .refreshers
        .into_iter()
        .map(|status| status.name)
        .collect()
}

#[tokio::test]
async fn start_background_warms_every_cache() {
    let f = fixture_with(fast_config()).await;
    f.engine.start_background().await;

    assert_eq!(
        refresher_names(&f.engine),
        vec!["classification", "primary_digests", "snapshot:gm"]
    );
    let status = f.engine.cache_status();
    assert!(
        status
            .refreshers
            .iter()
            .all(|r| r.last_success.is_some() && r.consecutive_failures == 0)
    );
    // A, B, N for square; C, D for circle; E for tri.
    assert_eq!(status.digests_on_primary, 6);
    assert_eq!(status.ignored_traces, 0);
    assert_eq!(status.snapshots.len(), 1);

    f.engine.shutdown().await;
}

#[tokio::test(start_paused = true)]
async fn failing_refreshers_keep_serving_stale_data() {
    let f = fixture_with(fast_config()).await;
    f.engine.start_background().await;
    f.store.set_unavailable(true);

    tokio::time::sleep(Duration::from_millis(1_500)).await;

    let status = f.engine.cache_status();
    for refresher in &status.refreshers {
        assert!(refresher.consecutive_failures >= 1, "{}", refresher.name);
        assert!(refresher.last_error.is_some(), "{}", refresher.name);
        assert!(refresher.last_success.is_some(), "{}", refresher.name);
    }
    assert_eq!(status.digests_on_primary, 6);
    assert_eq!(status.snapshots.len(), 1);

    f.store.set_unavailable(false);
    f.engine.refresh_now().await.unwrap();
    let status = f.engine.cache_status();
    assert!(status.refreshers.iter().all(|r| r.consecutive_failures == 0));

    f.engine.shutdown().await;
}

#[tokio::test]
async fn refresh_now_reports_the_failure() {
    let f = fixture_with(SearchConfig::default()).await;
    f.store.set_unavailable(true);
    let result = f.engine.refresh_now().await;
    assert!(matches!(result, Err(SearchError::Store(_))));

    let status = f.engine.cache_status();
    assert_eq!(status.refreshers.len(), 2);
    assert!(status.refreshers.iter().all(|r| r.consecutive_failures == 1));
    assert_eq!(status.digests_on_primary, 0);
}

#[tokio::test]
async fn start_background_survives_an_unavailable_store() {
    let f = fixture_with(fast_config()).await;
    f.store.set_unavailable(true);
    f.engine.start_background().await;
    assert_eq!(f.engine.cache_status().refreshers.len(), 3);
    f.engine.shutdown().await;
}

#[tokio::test]
async fn shutdown_without_background_is_a_no_op() {
    let (store, ..) = seed_store().await;
    let engine = SearchEngine::new(SearchConfig::default(), Backends::from_store(store)).unwrap();
    engine.shutdown().await;
    assert!(engine.cache_status().refreshers.is_empty());
}

#[tokio::test]
async fn zero_intervals_are_rejected() {
    let (store, ..) = seed_store().await;
    let config = SearchConfig {
        snapshot_refresh_secs: 0,
        ..Default::default()
    };
    let result = SearchEngine::new(config, Backends::from_store(Arc::clone(&store)));
    assert!(matches!(result, Err(SearchError::InvalidConfig(_))));
}
