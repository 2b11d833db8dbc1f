use crate::suite::fixture::fixture;
use crate::suite::fixture::params;
use crate::suite::fixture::token;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use vdiff_search::Backends;
use vdiff_search::LabelFilter;
use vdiff_search::Metric;
use vdiff_search::RefLabel;
use vdiff_search::RgbaBand;
use vdiff_search::SearchConfig;
use vdiff_search::SearchEngine;
use vdiff_search::SearchError;
use vdiff_search::SearchQuery;
use vdiff_search::SearchResponse;
use vdiff_search::SortOrder;
use vdiff_search::TraceFilter;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::Digest;
use vdiff_trace_store::InMemoryStore;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::RuleSetMatcher;

fn digests(response: &SearchResponse) -> Vec<&str> {
    response
        .results
        .iter()
        .map(|r| r.digest.as_str())
        .collect()
}

#[test_log::test(tokio::test)]
async fn untriaged_results_sorted_by_closest_reference() {
    let f = fixture().await;
    let response = f
        .engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &token())
        .await
        .unwrap();

    assert_eq!(digests(&response), vec!["D", "B"]);
    assert_eq!(response.size, 2);
    assert_eq!(response.commits.len(), 3);

    let b = &response.results[1];
    assert_eq!(b.test, "square");
    assert_eq!(b.label, Label::Untriaged);
    assert_eq!(b.closest_ref, Some(RefLabel::Negative));
    assert_eq!(b.ref_diffs.negative.as_ref().unwrap().digest, Digest::from("N"));
    assert_eq!(b.ref_diffs.positive.as_ref().unwrap().digest, Digest::from("A"));
    assert_eq!(
        b.paramset.get("os").map(|v| v.iter().cloned().collect::<Vec<_>>()),
        Some(vec!["linux".to_string()])
    );
}

#[tokio::test]
async fn identical_requests_give_identical_responses() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.labels = LabelFilter::all();
    let first = f.engine.search(&query, &token()).await.unwrap();
    let second = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(first, second);
}

#[tokio::test]
async fn trace_group_marks_history_and_primary_digest() {
    let f = fixture().await;
    let response = f
        .engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &token())
        .await
        .unwrap();
    let b = &response.results[1];
    let group = &b.trace_group;

    assert_eq!(group.traces.len(), 1);
    assert_eq!(group.traces[0].id, f.square_linux);
    assert_eq!(group.traces[0].digest_indices, vec![1, 1, 0]);
    let palette: Vec<(&str, Label)> = group
        .digests
        .iter()
        .map(|d| (d.digest.as_str(), d.label))
        .collect();
    assert_eq!(palette, vec![("B", Label::Untriaged), ("A", Label::Positive)]);
    assert_eq!(group.other_bucket, None);
}

#[tokio::test]
async fn pages_concatenate_to_the_full_result_list() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.labels = LabelFilter::all();
    let full = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(full.size, 5);

    let mut paged = Vec::new();
    for offset in (0..full.size).step_by(2) {
        query.offset = offset;
        query.limit = 2;
        let page = f.engine.search(&query, &token()).await.unwrap();
        assert_eq!(page.size, full.size);
        assert_eq!(page.offset, offset);
        let flagged = page
            .bulk_triage_delta_infos
            .iter()
            .filter(|info| info.in_current_search_results_page)
            .count();
        assert_eq!(flagged, page.results.len());
        assert_eq!(page.bulk_triage_delta_infos.len(), full.size);
        paged.extend(page.results);
    }
    assert_eq!(paged, full.results);
}

#[tokio::test]
async fn offset_past_the_end_is_an_empty_page() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.offset = 10;
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.size, 2);
    assert_eq!(response.offset, 2);
}

#[tokio::test]
async fn rgba_band_drops_results_outside_it() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.rgba_band = RgbaBand::new(10, 50);
    let response = f.engine.search(&query, &token()).await.unwrap();
    // B's closest reference differs by at most 5 per channel.
    assert_eq!(digests(&response), vec!["D"]);
}

#[tokio::test]
async fn descending_sort_and_percent_metric() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.sort = SortOrder::Descending;
    query.metric = Metric::Percent;
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["B", "D"]);
    assert_eq!(response.results[0].ref_diffs.negative.as_ref().unwrap().query_metric, 2.0);
}

#[tokio::test]
async fn right_side_constraints_limit_references() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm").with("name", "square"));
    query.right.constraints = ParamSet::new().with("os", "mac");
    let response = f.engine.search(&query, &token()).await.unwrap();
    let b = &response.results[0];
    // N is only produced on win, so only A qualifies.
    assert_eq!(b.closest_ref, Some(RefLabel::Positive));
    assert!(b.ref_diffs.negative.is_none());
}

#[tokio::test]
async fn must_have_reference_drops_unreferenced_results() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("svg"));
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["E"]);
    assert!(response.results[0].closest_ref.is_none());

    query.must_have_reference = true;
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn at_head_only_sees_newest_values() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm").at_head());
    query.labels = LabelFilter::all();
    let response = f.engine.search(&query, &token()).await.unwrap();
    let mut seen = digests(&response);
    seen.sort_unstable();
    assert_eq!(seen, vec!["A", "B", "D", "N"]);
}

#[tokio::test]
async fn label_filter_selects_triaged_digests() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.labels = LabelFilter {
        positive: true,
        negative: false,
        untriaged: false,
    };
    let response = f.engine.search(&query, &token()).await.unwrap();
    let mut seen = digests(&response);
    seen.sort_unstable();
    assert_eq!(seen, vec!["A", "C"]);
}

#[tokio::test]
async fn malformed_filters_are_rejected() {
    let f = fixture().await;
    let empty = SearchQuery::new(TraceFilter::corpus(""));
    assert!(matches!(
        f.engine.search(&empty, &token()).await,
        Err(SearchError::InvalidFilter(_))
    ));

    let bad_key = SearchQuery::new(TraceFilter::corpus("gm").with("bad key", "x"));
    assert!(matches!(
        f.engine.search(&bad_key, &token()).await,
        Err(SearchError::InvalidFilter(_))
    ));

    let mut bad_band = SearchQuery::new(TraceFilter::corpus("gm"));
    bad_band.rgba_band = RgbaBand::new(50, 10);
    assert!(matches!(
        f.engine.search(&bad_band, &token()).await,
        Err(SearchError::InvalidFilter(_))
    ));
}

#[tokio::test]
async fn cancelled_token_stops_the_search() {
    let f = fixture().await;
    let cancelled = token();
    cancelled.cancel();
    let result = f
        .engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &cancelled)
        .await;
    assert!(matches!(result, Err(SearchError::Cancelled)));
}

#[tokio::test]
async fn store_outage_surfaces_as_store_error() {
    let f = fixture().await;
    f.store.set_unavailable(true);
    let result = f
        .engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &token())
        .await;
    assert!(matches!(result, Err(SearchError::Store(_))));
}

#[tokio::test]
async fn empty_store_is_no_data() {
    let store = Arc::new(InMemoryStore::new());
    let engine = SearchEngine::new(SearchConfig::default(), Backends::from_store(store)).unwrap();
    let result = engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &token())
        .await;
    assert!(matches!(result, Err(SearchError::NoData)));
}

#[tokio::test]
async fn invalid_config_is_rejected() {
    let store = Arc::new(InMemoryStore::new());
    let config = SearchConfig {
        window_length: 0,
        ..Default::default()
    };
    let result = SearchEngine::new(config, Backends::from_store(store));
    assert!(matches!(result, Err(SearchError::InvalidConfig(_))));
}

#[tokio::test]
async fn ignored_traces_hidden_unless_requested() {
    let (store, ..) = crate::suite::fixture::seed_store().await;
    let backends = Backends::from_store(Arc::clone(&store)).with_ignore_rules(Arc::new(
        RuleSetMatcher::new(vec![ParamSet::new().with("os", "linux")]),
    ));
    let engine = SearchEngine::new(SearchConfig::default(), backends).unwrap();
    engine.refresh_now().await.unwrap();

    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    let response = engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());

    query.filter.include_ignored = true;
    let response = engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["D", "B"]);
}

#[tokio::test]
async fn public_view_fails_closed_until_classified() {
    let (store, ..) = crate::suite::fixture::seed_store().await;
    let backends = Backends::from_store(Arc::clone(&store)).with_public_rules(Arc::new(
        RuleSetMatcher::new(vec![ParamSet::new().with("name", "circle")]),
    ));
    let engine = SearchEngine::new(SearchConfig::public(), backends).unwrap();

    let query = SearchQuery::new(TraceFilter::corpus("gm"));
    let response = engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());

    engine.refresh_now().await.unwrap();
    let response = engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["D"]);
}

fn public_engine(store: Arc<InMemoryStore>) -> SearchEngine {
    let public = ParamSet::new().with("os", "linux").with("os", "mac");
    let backends = Backends::from_store(store)
        .with_public_rules(Arc::new(RuleSetMatcher::new(vec![public])));
    SearchEngine::new(SearchConfig::public(), backends).unwrap()
}

#[tokio::test]
async fn public_view_hides_references_of_hidden_traces() {
    let (store, ..) = crate::suite::fixture::seed_store().await;
    let engine = public_engine(store);
    engine.refresh_now().await.unwrap();

    let response = engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm")), &token())
        .await
        .unwrap();
    assert_eq!(digests(&response), vec!["D", "B"]);

    // N is only produced on win, which is not public.
    let b = &response.results[1];
    assert!(b.ref_diffs.negative.is_none());
    assert_eq!(b.closest_ref, Some(RefLabel::Positive));
    assert_eq!(b.ref_diffs.positive.as_ref().unwrap().digest, Digest::from("A"));
}

#[tokio::test]
async fn reference_less_results_come_last_in_both_directions() {
    let f = fixture().await;
    let star = f
        .store
        .add_trace(params(&[("name", "star"), ("source_type", "gm"), ("os", "linux")]))
        .await;
    f.store.record(&star, &CommitId::from("c2"), "S").await;

    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["D", "B", "S"]);

    query.sort = SortOrder::Descending;
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["B", "D", "S"]);
    assert!(response.results[2].closest_ref.is_none());
}

#[tokio::test]
async fn changelist_search_skips_digests_already_on_primary() {
    let f = fixture().await;
    let scope = ChangelistScope::new("gerrit", "123");
    f.store.add_changelist(scope.clone()).await;
    f.store.record_changelist(&scope, &f.square_linux, "B").await;
    f.store.record_changelist(&scope, &f.square_linux, "F").await;
    f.engine.refresh_now().await.unwrap();

    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.changelist = Some(scope.clone());
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert_eq!(digests(&response), vec!["F"]);

    query.include_digests_on_primary = true;
    let response = f.engine.search(&query, &token()).await.unwrap();
    let mut seen = digests(&response);
    seen.sort_unstable();
    assert_eq!(seen, vec!["B", "F"]);

    // A changelist-only label takes precedence over the primary one.
    f.store
        .set_changelist_label(&scope, &f.square, "F", Label::Positive)
        .await;
    query.include_digests_on_primary = false;
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());
}

#[tokio::test]
async fn unknown_changelist_is_not_found() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.changelist = Some(ChangelistScope::new("gerrit", "404"));
    assert!(matches!(
        f.engine.search(&query, &token()).await,
        Err(SearchError::NotFound(_))
    ));
}

#[tokio::test]
async fn options_params_join_the_result_paramset() {
    let f = fixture().await;
    let options = f
        .store
        .add_options(params(&[("ext", "png")]))
        .await;
    f.store
        .record_with_options(&f.square_linux, &CommitId::from("c2"), "B", Some(options))
        .await;

    let response = f
        .engine
        .search(&SearchQuery::new(TraceFilter::corpus("gm").with("name", "square")), &token())
        .await
        .unwrap();
    assert!(
        response.results[0]
            .paramset
            .get("ext")
            .is_some_and(|values| values.contains("png"))
    );
}
