use crate::error::StoreResult;
use crate::model::ChangelistScope;
use crate::model::CommitId;
use crate::model::CommitWithTile;
use crate::model::DiffMetric;
use crate::model::Digest;
use crate::model::GroupingDigest;
use crate::model::GroupingId;
use crate::model::HistoryRow;
use crate::model::Label;
use crate::model::OptionsId;
use crate::model::ParamSet;
use crate::model::Params;
use crate::model::TileId;
use crate::model::TraceId;
use crate::model::TraceObservation;
use crate::model::TraceQuery;
use async_trait::async_trait;
use std::collections::HashMap;

/// Read-side access to traces, commits and parameter metadata.
#[async_trait]
pub trait TraceStore: Send + Sync {
    /// The most recent `limit` commits that have data, newest first.
    async fn recent_commits_with_data(&self, limit: usize) -> StoreResult<Vec<CommitWithTile>>;

    /// Every distinct observation at or after `query.first_commit` on traces
    /// matching the corpus and constraints.
    async fn query_traces(&self, query: &TraceQuery) -> StoreResult<Vec<TraceObservation>>;

    /// The newest observation of each matching trace, provided it lies at or
    /// after `query.first_commit`.
    async fn values_at_head(&self, query: &TraceQuery) -> StoreResult<Vec<TraceObservation>>;

    /// Parameter maps for the given traces. Unknown ids are omitted.
    async fn trace_params(&self, ids: &[TraceId]) -> StoreResult<HashMap<TraceId, Params>>;

    async fn options_params(&self, ids: &[OptionsId]) -> StoreResult<HashMap<OptionsId, Params>>;

    async fn grouping_params(
        &self,
        ids: &[GroupingId],
    ) -> StoreResult<HashMap<GroupingId, Params>>;

    /// History cells for the given traces starting at `first_commit`.
    async fn trace_history(
        &self,
        ids: &[TraceId],
        first_commit: &CommitId,
    ) -> StoreResult<Vec<HistoryRow>>;

    /// Distinct (trace, digest) pairs the grouping produced in tiles
    /// `>= first_tile` on traces whose params match `constraints`, sorted.
    async fn grouping_trace_digests(
        &self,
        grouping: &GroupingId,
        constraints: &ParamSet,
        first_tile: TileId,
    ) -> StoreResult<Vec<(TraceId, Digest)>>;

    /// Every (grouping, digest) pair seen on the primary branch in tiles
    /// `>= first_tile`.
    async fn digests_on_primary(&self, first_tile: TileId) -> StoreResult<Vec<GroupingDigest>>;

    /// All known traces with their parameters.
    async fn all_traces(&self) -> StoreResult<Vec<(TraceId, Params)>>;

    /// Parameter maps (trace params merged with options params) of every
    /// observation in tiles `>= first_tile`.
    async fn params_in_window(&self, first_tile: TileId) -> StoreResult<Vec<Params>>;

    /// Observations produced by the changelist's patchsets, or `None` when
    /// the changelist is unknown.
    async fn changelist_observations(
        &self,
        scope: &ChangelistScope,
    ) -> StoreResult<Option<Vec<TraceObservation>>>;
}

/// Triage labels. Pairs that were never labeled are absent from results.
#[async_trait]
pub trait ExpectationStore: Send + Sync {
    async fn labels(&self, keys: &[GroupingDigest]) -> StoreResult<HashMap<GroupingDigest, Label>>;

    /// Labels set on the changelist only; these override primary labels.
    async fn changelist_labels(
        &self,
        scope: &ChangelistScope,
        keys: &[GroupingDigest],
    ) -> StoreResult<HashMap<GroupingDigest, Label>>;
}

/// Precomputed pairwise diff metrics.
#[async_trait]
pub trait DiffMetricStore: Send + Sync {
    /// Rows for every `(left, right)` combination that has been computed.
    /// Missing pairs are simply not returned.
    async fn metrics(&self, lefts: &[Digest], rights: &[Digest]) -> StoreResult<Vec<DiffMetric>>;
}
