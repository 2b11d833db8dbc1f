use crate::suite::fixture::fixture;
use crate::suite::fixture::seed_store;
use crate::suite::fixture::token;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use vdiff_search::Backends;
use vdiff_search::RefLabel;
use vdiff_search::SearchConfig;
use vdiff_search::SearchEngine;
use vdiff_search::SearchError;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::RuleSetMatcher;

fn values(set: &vdiff_trace_store::ParamSet, key: &str) -> Vec<String> {
    set.get(key)
        .map(|values| values.iter().cloned().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn details_carry_history_and_references() {
    let f = fixture().await;
    let details = f
        .engine
        .digest_details(&f.square, &Digest::from("B"), None, &token())
        .await
        .unwrap();

    assert_eq!(details.commits.len(), 3);
    let result = &details.result;
    assert_eq!(result.digest, Digest::from("B"));
    assert_eq!(result.test, "square");
    assert_eq!(result.label, Label::Untriaged);
    assert_eq!(result.closest_ref, Some(RefLabel::Negative));
    assert_eq!(result.trace_group.traces.len(), 1);
    assert_eq!(result.trace_group.traces[0].digest_indices, vec![1, 1, 0]);
    assert_eq!(values(&result.paramset, "os"), vec!["linux"]);
}

#[tokio::test]
async fn details_of_a_triaged_digest_list_every_producing_trace() {
    let f = fixture().await;
    let details = f
        .engine
        .digest_details(&f.square, &Digest::from("A"), None, &token())
        .await
        .unwrap();
    assert_eq!(details.result.label, Label::Positive);
    assert_eq!(details.result.trace_group.traces.len(), 2);
    assert_eq!(values(&details.result.paramset, "os"), vec!["linux", "mac"]);
}

#[tokio::test]
async fn details_for_unknown_grouping_or_digest_are_not_found() {
    let f = fixture().await;
    let unknown = f
        .engine
        .digest_details(&GroupingId::from("nope"), &Digest::from("B"), None, &token())
        .await;
    assert!(matches!(unknown, Err(SearchError::NotFound(_))));

    let unseen = f
        .engine
        .digest_details(&f.square, &Digest::from("Z"), None, &token())
        .await
        .unwrap();
    assert!(unseen.result.trace_group.traces.is_empty());
    assert!(unseen.result.closest_ref.is_none());
}

#[tokio::test]
async fn details_resolve_changelist_labels() {
    let f = fixture().await;
    let scope = ChangelistScope::new("gerrit", "77");
    f.store.add_changelist(scope.clone()).await;
    f.store.record_changelist(&scope, &f.square_linux, "F").await;
    f.store
        .set_changelist_label(&scope, &f.square, "F", Label::Negative)
        .await;

    let details = f
        .engine
        .digest_details(&f.square, &Digest::from("F"), Some(&scope), &token())
        .await
        .unwrap();
    assert_eq!(details.result.label, Label::Negative);
    assert_eq!(values(&details.result.paramset, "os"), vec!["linux"]);
}

#[tokio::test]
async fn comparison_pairs_both_sides_with_their_metric() {
    let f = fixture().await;
    let comparison = f
        .engine
        .digest_comparison(&f.square, &Digest::from("B"), &Digest::from("A"), None, &token())
        .await
        .unwrap();

    assert_eq!(comparison.grouping_id, f.square);
    assert_eq!(comparison.metric.combined_metric, 0.5);
    assert_eq!(comparison.metric.max_rgba_diffs, [20, 10, 0, 0]);
    assert_eq!(comparison.left.label, Label::Untriaged);
    assert_eq!(comparison.right.label, Label::Positive);
    assert_eq!(values(&comparison.left.paramset, "os"), vec!["linux"]);
    assert_eq!(values(&comparison.right.paramset, "os"), vec!["linux", "mac"]);
}

#[tokio::test]
async fn comparison_without_a_metric_row_is_not_found() {
    let f = fixture().await;
    let reversed = f
        .engine
        .digest_comparison(&f.square, &Digest::from("A"), &Digest::from("B"), None, &token())
        .await;
    assert!(matches!(reversed, Err(SearchError::NotFound(_))));
}

async fn public_engine_without_win() -> (SearchEngine, GroupingId) {
    let (store, square, ..) = seed_store().await;
    let public = ParamSet::new().with("os", "linux").with("os", "mac");
    let backends = Backends::from_store(Arc::clone(&store))
        .with_public_rules(Arc::new(RuleSetMatcher::new(vec![public])));
    let engine = SearchEngine::new(SearchConfig::public(), backends).unwrap();
    engine.refresh_now().await.unwrap();
    (engine, square)
}

#[tokio::test]
async fn public_details_need_a_visible_producer() {
    let (engine, square) = public_engine_without_win().await;

    let hidden = engine
        .digest_details(&square, &Digest::from("N"), None, &token())
        .await;
    assert!(matches!(hidden, Err(SearchError::NotFound(_))));

    let details = engine
        .digest_details(&square, &Digest::from("B"), None, &token())
        .await
        .unwrap();
    assert_eq!(details.result.closest_ref, Some(RefLabel::Positive));
    assert!(details.result.ref_diffs.negative.is_none());
}

#[tokio::test]
async fn public_comparison_needs_both_sides_visible() {
    let (engine, square) = public_engine_without_win().await;

    let hidden = engine
        .digest_comparison(&square, &Digest::from("B"), &Digest::from("N"), None, &token())
        .await;
    assert!(matches!(hidden, Err(SearchError::NotFound(_))));

    let comparison = engine
        .digest_comparison(&square, &Digest::from("B"), &Digest::from("A"), None, &token())
        .await
        .unwrap();
    assert_eq!(values(&comparison.right.paramset, "os"), vec!["linux", "mac"]);
}
