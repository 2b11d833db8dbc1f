use crate::suite::fixture::add_commit;
use crate::suite::fixture::fixture;
use crate::suite::fixture::params;
use crate::suite::fixture::token;
use pretty_assertions::assert_eq;
use vdiff_search::SearchError;
use vdiff_search::SearchQuery;
use vdiff_search::TraceFilter;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::Digest;
use vdiff_trace_store::Label;

#[test_log::test(tokio::test)]
async fn untriaged_digests_are_blamed_on_the_commit_that_changed_them() {
    let f = fixture().await;
    let summary = f.engine.blame("gm", &token()).await.unwrap();

    assert_eq!(summary.corpus, "gm");
    assert_eq!(summary.commits.len(), 3);
    assert_eq!(summary.entries.len(), 1);

    let entry = &summary.entries[0];
    assert_eq!(entry.commit_range, "c1:c2");
    assert_eq!(entry.total_untriaged_digests, 2);
    let commits: Vec<&str> = entry.commits.iter().map(|c| c.id.as_str()).collect();
    assert_eq!(commits, vec!["c1", "c2"]);

    let groupings: Vec<(&str, usize)> = entry
        .affected_groupings
        .iter()
        .map(|g| (g.sample_digest.as_str(), g.untriaged_digests))
        .collect();
    assert_eq!(groupings, vec![("B", 1), ("D", 1)]);
    assert_eq!(entry.affected_groupings[0].grouping_id, f.square);
    assert_eq!(entry.affected_groupings[1].grouping_id, f.circle);
    assert_eq!(
        entry.affected_groupings[0].evidence,
        vec![(f.square_linux.clone(), Digest::from("B"))]
    );
}

#[tokio::test]
async fn digest_present_since_before_the_window_blames_the_first_commit() {
    let f = fixture().await;
    let summary = f.engine.blame("svg", &token()).await.unwrap();
    let ranges: Vec<&str> = summary
        .entries
        .iter()
        .map(|e| e.commit_range.as_str())
        .collect();
    assert_eq!(ranges, vec!["c0"]);
    assert_eq!(summary.entries[0].affected_groupings[0].sample_digest, Digest::from("E"));
}

#[tokio::test]
async fn triaging_removes_a_digest_from_blame() {
    let f = fixture().await;
    f.store.set_label(&f.square, "B", Label::Negative).await;
    let summary = f.engine.blame("gm", &token()).await.unwrap();
    let entry = summary.entry("c1:c2").unwrap();
    assert_eq!(entry.total_untriaged_digests, 1);
    assert_eq!(entry.affected_groupings[0].grouping_id, f.circle);
}

#[tokio::test]
async fn separate_changes_get_separate_entries() {
    let f = fixture().await;
    add_commit(&f.store, "c3", 1).await;
    // circle linux moves on from D to G; square keeps B.
    let circle_linux = f
        .store
        .add_trace(params(&[("name", "circle"), ("source_type", "gm"), ("os", "linux")]))
        .await;
    f.store
        .record(&circle_linux, &CommitId::from("c3"), "G")
        .await;

    let summary = f.engine.blame("gm", &token()).await.unwrap();
    let ranges: Vec<(&str, usize)> = summary
        .entries
        .iter()
        .map(|e| (e.commit_range.as_str(), e.total_untriaged_digests))
        .collect();
    // Both entries count one digest, so they sort by range.
    assert_eq!(ranges, vec![("c1:c2", 1), ("c2:c3", 1)]);
}

#[tokio::test]
async fn blame_id_search_returns_exactly_the_entry_evidence() {
    let f = fixture().await;
    let mut query = SearchQuery::new(TraceFilter::corpus("gm"));
    query.blame_id = Some("c1:c2".to_string());
    let response = f.engine.search(&query, &token()).await.unwrap();
    let digests: Vec<&str> = response.results.iter().map(|r| r.digest.as_str()).collect();
    assert_eq!(digests, vec!["D", "B"]);

    query.blame_id = Some("c0:c1".to_string());
    let response = f.engine.search(&query, &token()).await.unwrap();
    assert!(response.results.is_empty());
    assert_eq!(response.size, 0);
}

#[tokio::test]
async fn blame_rejects_an_empty_corpus() {
    let f = fixture().await;
    assert!(matches!(
        f.engine.blame("", &token()).await,
        Err(SearchError::InvalidFilter(_))
    ));
}
