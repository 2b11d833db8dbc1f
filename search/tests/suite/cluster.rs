use crate::suite::fixture::fixture;
use crate::suite::fixture::seed_store;
use crate::suite::fixture::token;
use pretty_assertions::assert_eq;
use std::sync::Arc;
use vdiff_search::Backends;
use vdiff_search::LabelFilter;
use vdiff_search::SearchConfig;
use vdiff_search::SearchEngine;
use vdiff_search::SearchError;
use vdiff_search::TraceFilter;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::RuleSetMatcher;

fn values(set: &ParamSet, key: &str) -> Vec<String> {
    set.get(key)
        .map(|values| values.iter().cloned().collect())
        .unwrap_or_default()
}

#[tokio::test]
async fn cluster_links_digests_of_one_test() {
    let f = fixture().await;
    let cluster = f
        .engine
        .cluster(
            &TraceFilter::corpus("gm").with("name", "square"),
            LabelFilter::all(),
            &token(),
        )
        .await
        .unwrap();

    let nodes: Vec<(&str, Label)> = cluster
        .nodes
        .iter()
        .map(|n| (n.digest.as_str(), n.label))
        .collect();
    assert_eq!(
        nodes,
        vec![
            ("A", Label::Positive),
            ("B", Label::Untriaged),
            ("N", Label::Negative),
        ]
    );
    let links: Vec<(usize, usize, f32)> = cluster
        .links
        .iter()
        .map(|l| (l.source, l.target, l.distance))
        .collect();
    assert_eq!(links, vec![(0, 1, 5.0), (1, 2, 2.0)]);

    assert_eq!(values(&cluster.paramset, "os"), vec!["linux", "mac", "win"]);
    let by_digest: Vec<(&str, Vec<String>)> = cluster
        .paramsets_by_digest
        .iter()
        .map(|(digest, set)| (digest.as_str(), values(set, "os")))
        .collect();
    assert_eq!(
        by_digest,
        vec![
            ("A", vec!["linux".to_string(), "mac".to_string()]),
            ("B", vec!["linux".to_string()]),
            ("N", vec!["win".to_string()]),
        ]
    );
}

#[tokio::test]
async fn cluster_respects_the_label_filter() {
    let f = fixture().await;
    let cluster = f
        .engine
        .cluster(
            &TraceFilter::corpus("gm").with("name", "square"),
            LabelFilter::default(),
            &token(),
        )
        .await
        .unwrap();
    assert_eq!(cluster.nodes.len(), 1);
    assert!(cluster.links.is_empty());
}

#[tokio::test]
async fn cluster_requires_a_test_name() {
    let f = fixture().await;
    let result = f
        .engine
        .cluster(&TraceFilter::corpus("gm"), LabelFilter::all(), &token())
        .await;
    assert!(matches!(result, Err(SearchError::InvalidFilter(_))));
}

#[tokio::test]
async fn paramset_unions_every_corpus() {
    let f = fixture().await;
    let paramset = f.engine.paramset(&token()).await.unwrap();
    assert_eq!(values(&paramset, "name"), vec!["circle", "square", "tri"]);
    assert_eq!(values(&paramset, "source_type"), vec!["gm", "svg"]);
    assert_eq!(values(&paramset, "os"), vec!["linux", "mac", "win"]);
}

#[tokio::test]
async fn public_paramset_only_covers_visible_corpora() {
    let (store, ..) = seed_store().await;
    let backends = Backends::from_store(Arc::clone(&store)).with_public_rules(Arc::new(
        RuleSetMatcher::new(vec![ParamSet::new().with("source_type", "svg")]),
    ));
    let engine = SearchEngine::new(SearchConfig::public(), backends).unwrap();

    assert!(engine.paramset(&token()).await.unwrap().is_empty());

    engine.refresh_now().await.unwrap();
    let paramset = engine.paramset(&token()).await.unwrap();
    assert_eq!(values(&paramset, "source_type"), vec!["svg"]);
    assert_eq!(values(&paramset, "name"), vec!["tri"]);
}

#[tokio::test]
async fn changelist_paramset_covers_its_observations() {
    let f = fixture().await;
    let scope = ChangelistScope::new("gerrit", "5");
    f.store.add_changelist(scope.clone()).await;
    f.store.record_changelist(&scope, &f.square_linux, "F").await;

    let paramset = f.engine.changelist_paramset(&scope, &token()).await.unwrap();
    assert_eq!(values(&paramset, "name"), vec!["square"]);
    assert_eq!(values(&paramset, "os"), vec!["linux"]);

    let missing = f
        .engine
        .changelist_paramset(&ChangelistScope::new("gerrit", "6"), &token())
        .await;
    assert!(matches!(missing, Err(SearchError::NotFound(_))));
}

#[tokio::test]
async fn counts_split_each_test_by_label() {
    let f = fixture().await;
    let counts = f
        .engine
        .count_digests_by_test(&TraceFilter::corpus("gm"), &token())
        .await
        .unwrap();
    assert_eq!(counts.len(), 2);

    let square = counts.iter().find(|c| c.grouping_id == f.square).unwrap();
    assert_eq!(
        (square.positive, square.negative, square.untriaged, square.total),
        (1, 1, 1, 3)
    );
    assert_eq!(square.grouping.get("name").map(String::as_str), Some("square"));

    let circle = counts.iter().find(|c| c.grouping_id == f.circle).unwrap();
    assert_eq!(
        (circle.positive, circle.negative, circle.untriaged, circle.total),
        (1, 0, 1, 2)
    );
}

#[tokio::test]
async fn counts_honor_constraints() {
    let f = fixture().await;
    let counts = f
        .engine
        .count_digests_by_test(&TraceFilter::corpus("gm").with("os", "mac"), &token())
        .await
        .unwrap();
    assert_eq!(counts.len(), 1);
    assert_eq!((counts[0].positive, counts[0].total), (1, 1));
}

#[tokio::test]
async fn symmetric_metrics_give_a_single_link() {
    let f = fixture().await;
    f.store
        .set_metric_symmetric(crate::suite::fixture::metric("A", "N", 0.9, 9.0, 90))
        .await;
    let cluster = f
        .engine
        .cluster(
            &TraceFilter::corpus("gm").with("name", "square"),
            LabelFilter::all(),
            &token(),
        )
        .await
        .unwrap();
    let links: Vec<(usize, usize, f32)> = cluster
        .links
        .iter()
        .map(|l| (l.source, l.target, l.distance))
        .collect();
    assert_eq!(links, vec![(0, 1, 5.0), (0, 2, 9.0), (1, 2, 2.0)]);
}
