use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use std::collections::BTreeMap;
use vdiff_trace_store::Commit;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::DiffMetric;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::Params;
use vdiff_trace_store::TraceId;

/// The label of a reference digest. Untriaged digests are never references.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum RefLabel {
    Positive,
    Negative,
}

impl From<RefLabel> for Label {
    fn from(label: RefLabel) -> Self {
        match label {
            RefLabel::Positive => Label::Positive,
            RefLabel::Negative => Label::Negative,
        }
    }
}

/// Distance from a result digest to one reference digest.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RefDiff {
    pub digest: Digest,
    pub label: RefLabel,
    /// Value of the metric the query selected.
    pub query_metric: f32,
    pub combined_metric: f32,
    pub percent_pixels_diff: f32,
    pub num_pixels_diff: u64,
    pub max_rgba_diffs: [u8; 4],
    pub dimensions_differ: bool,
}

impl RefDiff {
    pub(crate) fn from_metric(metric: &DiffMetric, label: RefLabel, query_metric: f32) -> Self {
        Self {
            digest: metric.right.clone(),
            label,
            query_metric,
            combined_metric: metric.combined_metric,
            percent_pixels_diff: metric.percent_pixels_diff,
            num_pixels_diff: metric.num_pixels_diff,
            max_rgba_diffs: metric.max_rgba_diffs,
            dimensions_differ: metric.dimensions_differ,
        }
    }

    pub fn max_channel_diff(&self) -> u8 {
        self.max_rgba_diffs.iter().copied().max().unwrap_or(0)
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RefDiffs {
    pub positive: Option<RefDiff>,
    pub negative: Option<RefDiff>,
}

impl RefDiffs {
    pub fn get(&self, label: RefLabel) -> Option<&RefDiff> {
        match label {
            RefLabel::Positive => self.positive.as_ref(),
            RefLabel::Negative => self.negative.as_ref(),
        }
    }
}

/// Palette entry of a trace group.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DigestStatus {
    pub digest: Digest,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Trace {
    pub id: TraceId,
    /// One entry per window commit; `-1` marks a missing observation.
    pub digest_indices: Vec<i32>,
    pub params: Params,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceGroup {
    pub traces: Vec<Trace>,
    /// `digests[i]` is the digest drawn with index `i`.
    pub digests: Vec<DigestStatus>,
    /// Index shared by every digest that did not get its own.
    pub other_bucket: Option<i32>,
    pub total_digests: usize,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResult {
    pub digest: Digest,
    pub grouping_id: GroupingId,
    pub test: String,
    pub label: Label,
    pub paramset: ParamSet,
    pub trace_group: TraceGroup,
    pub ref_diffs: RefDiffs,
    pub closest_ref: Option<RefLabel>,
}

/// Enough identity to bulk-label every result of a search, regardless of
/// which page is displayed.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkTriageDeltaInfo {
    pub grouping: Params,
    pub grouping_id: GroupingId,
    pub digest: Digest,
    pub label_before: Label,
    pub closest_diff_label: Option<RefLabel>,
    pub in_current_search_results_page: bool,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchResponse {
    pub results: Vec<SearchResult>,
    pub offset: usize,
    /// Number of results before pagination.
    pub size: usize,
    pub commits: Vec<Commit>,
    pub bulk_triage_delta_infos: Vec<BulkTriageDeltaInfo>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestDetails {
    pub result: SearchResult,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestSide {
    pub digest: Digest,
    pub label: Label,
    pub paramset: ParamSet,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DigestComparison {
    pub grouping_id: GroupingId,
    pub left: DigestSide,
    pub right: DigestSide,
    pub metric: DiffMetric,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AffectedGrouping {
    pub grouping_id: GroupingId,
    pub grouping: Params,
    pub untriaged_digests: usize,
    pub sample_digest: Digest,
    /// `(trace, digest)` pairs this grouping contributed.
    pub evidence: Vec<(TraceId, Digest)>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameEntry {
    /// A commit id, or `start:end` for an inclusive range.
    pub commit_range: String,
    pub total_untriaged_digests: usize,
    pub affected_groupings: Vec<AffectedGrouping>,
    pub commits: Vec<Commit>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlameSummary {
    pub corpus: String,
    pub entries: Vec<BlameEntry>,
    pub commits: Vec<Commit>,
}

impl BlameSummary {
    pub fn entry(&self, commit_range: &str) -> Option<&BlameEntry> {
        self.entries
            .iter()
            .find(|entry| entry.commit_range == commit_range)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ClusterNode {
    pub digest: Digest,
    pub grouping_id: GroupingId,
    pub label: Label,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ClusterLink {
    /// Indices into [`ClusterResponse::nodes`].
    pub source: usize,
    pub target: usize,
    /// Percent of pixels that differ.
    pub distance: f32,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClusterResponse {
    pub nodes: Vec<ClusterNode>,
    pub links: Vec<ClusterLink>,
    pub paramsets_by_digest: BTreeMap<Digest, ParamSet>,
    pub paramset: ParamSet,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TestCounts {
    pub grouping_id: GroupingId,
    pub grouping: Params,
    pub positive: usize,
    pub negative: usize,
    pub untriaged: usize,
    pub total: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusStatus {
    pub corpus: String,
    pub untriaged_count: usize,
    pub ok: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StatusOverview {
    pub last_commit: Option<CommitId>,
    pub corpora: Vec<CorpusStatus>,
}

/// Health of one background refresher.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RefresherStatus {
    pub name: String,
    pub last_success: Option<DateTime<Utc>>,
    pub consecutive_failures: u32,
    pub last_error: Option<String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotStatus {
    pub corpus: String,
    pub built_at: DateTime<Utc>,
    pub window_first_commit: CommitId,
    pub window_last_commit: CommitId,
    pub traces_at_head: usize,
    pub untriaged_at_head: usize,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct CacheStatus {
    pub refreshers: Vec<RefresherStatus>,
    pub snapshots: Vec<SnapshotStatus>,
    pub digests_on_primary: usize,
    pub ignored_traces: usize,
    pub visible_traces: usize,
    pub cached_trace_params: usize,
    pub cached_options_params: usize,
    pub cached_grouping_params: usize,
    pub cached_paramsets: usize,
}
