//! Shared seeded store for the engine tests.
//!
//! Corpus `gm`, commits c0..c2 on tile 0:
//!
//! | test   | os    | c0 | c1 | c2 |
//! |--------|-------|----|----|----|
//! | square | linux | A  | A  | B  |
//! | square | mac   | A  | A  | A  |
//! | square | win   | N  | N  | N  |
//! | circle | linux | C  | C  | D  |
//!
//! Corpus `svg`: `tri` on linux only produced E at c2.
//!
//! A and C are positive, N is negative; B, D and E are untriaged.

use chrono::TimeZone;
use chrono::Utc;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use vdiff_search::Backends;
use vdiff_search::SearchConfig;
use vdiff_search::SearchEngine;
use vdiff_trace_store::Commit;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::DiffMetric;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::InMemoryStore;
use vdiff_trace_store::Label;
use vdiff_trace_store::Params;
use vdiff_trace_store::TileId;
use vdiff_trace_store::TraceId;

pub struct Fixture {
    pub store: Arc<InMemoryStore>,
    pub engine: SearchEngine,
    pub square: GroupingId,
    pub circle: GroupingId,
    pub square_linux: TraceId,
}

pub fn params(pairs: &[(&str, &str)]) -> Params {
    pairs
        .iter()
        .map(|(k, v)| ((*k).to_string(), (*v).to_string()))
        .collect()
}

pub fn token() -> CancellationToken {
    CancellationToken::new()
}

pub async fn add_commit(store: &InMemoryStore, id: &str, tile: u32) {
    let commit = Commit {
        id: CommitId::from(id),
        hash: format!("{id}-hash"),
        timestamp: Utc
            .timestamp_opt(1_700_000_000 + i64::from(tile), 0)
            .single()
            .unwrap(),
        author: "dev@example.com".to_string(),
        subject: format!("change {id}"),
    };
    store.add_commit(commit, TileId(tile)).await;
}

pub async fn record_run(store: &InMemoryStore, trace: &TraceId, digests: &[&str]) {
    for (i, digest) in digests.iter().enumerate() {
        store.record(trace, &CommitId::from(format!("c{i}")), *digest).await;
    }
}

pub fn metric(left: &str, right: &str, combined: f32, percent: f32, max: u8) -> DiffMetric {
    DiffMetric {
        left: Digest::from(left),
        right: Digest::from(right),
        num_pixels_diff: (percent * 100.0) as u64,
        percent_pixels_diff: percent,
        max_rgba_diffs: [max, max / 2, 0, 0],
        combined_metric: combined,
        dimensions_differ: false,
    }
}

pub fn square_params(os: &str) -> Params {
    params(&[("name", "square"), ("source_type", "gm"), ("os", os)])
}

pub async fn seed_store() -> (Arc<InMemoryStore>, GroupingId, GroupingId, TraceId) {
    let store = Arc::new(InMemoryStore::new());
    for id in ["c0", "c1", "c2"] {
        add_commit(&store, id, 0).await;
    }

    let square_linux = store.add_trace(square_params("linux")).await;
    let square_mac = store.add_trace(square_params("mac")).await;
    let square_win = store.add_trace(square_params("win")).await;
    let circle_linux = store
        .add_trace(params(&[
            ("name", "circle"),
            ("source_type", "gm"),
            ("os", "linux"),
        ]))
        .await;
    let tri_linux = store
        .add_trace(params(&[("name", "tri"), ("source_type", "svg"), ("os", "linux")]))
        .await;

    record_run(&store, &square_linux, &["A", "A", "B"]).await;
    record_run(&store, &square_mac, &["A", "A", "A"]).await;
    record_run(&store, &square_win, &["N", "N", "N"]).await;
    record_run(&store, &circle_linux, &["C", "C", "D"]).await;
    store.record(&tri_linux, &CommitId::from("c2"), "E").await;

    let square = GroupingId::from_params(&square_params("linux"));
    let circle = GroupingId::from_params(&params(&[("name", "circle"), ("source_type", "gm")]));
    store.set_label(&square, "A", Label::Positive).await;
    store.set_label(&square, "N", Label::Negative).await;
    store.set_label(&circle, "C", Label::Positive).await;

    store.set_metric(metric("B", "A", 0.5, 5.0, 20)).await;
    store.set_metric(metric("B", "N", 0.2, 2.0, 5)).await;
    store.set_metric(metric("D", "C", 0.1, 1.0, 30)).await;

    (store, square, circle, square_linux)
}

pub async fn fixture_with(config: SearchConfig) -> Fixture {
    let (store, square, circle, square_linux) = seed_store().await;
    let engine = SearchEngine::new(config, Backends::from_store(Arc::clone(&store))).unwrap();
    Fixture {
        store,
        engine,
        square,
        circle,
        square_linux,
    }
}

pub async fn fixture() -> Fixture {
    fixture_with(SearchConfig::default()).await
}
