//! In-memory implementation of every store trait.
//!
//! Used by tests and by embedders that load a snapshot of the backing data
//! up front. Query semantics match what the engine expects from a real
//! tabular store.

use crate::error::StoreError;
use crate::error::StoreResult;
use crate::model::ChangelistScope;
use crate::model::Commit;
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
use crate::model::CORPUS_FIELD;
use crate::model::grouping_params;
use crate::store::DiffMetricStore;
use crate::store::ExpectationStore;
use crate::store::TraceStore;
use async_trait::async_trait;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::atomic::AtomicBool;
use std::sync::atomic::AtomicUsize;
use std::sync::atomic::Ordering;
use tokio::sync::RwLock;
use tracing::debug;

#[derive(Debug, Clone)]
struct TraceRecord {
    params: Params,
    grouping_id: GroupingId,
}

impl TraceRecord {
    fn corpus(&self) -> Option<&str> {
        self.params.get(CORPUS_FIELD).map(String::as_str)
    }
}

#[derive(Debug, Clone)]
struct Cell {
    digest: Digest,
    options_id: Option<OptionsId>,
}

#[derive(Debug, Default)]
struct ChangelistData {
    observations: Vec<TraceObservation>,
    labels: HashMap<GroupingDigest, Label>,
}

#[derive(Debug, Default)]
struct State {
    /// Oldest first.
    commits: Vec<CommitWithTile>,
    commit_pos: HashMap<CommitId, usize>,
    traces: BTreeMap<TraceId, TraceRecord>,
    values: BTreeMap<TraceId, BTreeMap<usize, Cell>>,
    groupings: HashMap<GroupingId, Params>,
    options: HashMap<OptionsId, Params>,
    labels: HashMap<GroupingDigest, Label>,
    changelists: HashMap<ChangelistScope, ChangelistData>,
    metrics: HashMap<(Digest, Digest), DiffMetric>,
}

impl State {
    fn position(&self, commit: &CommitId) -> StoreResult<usize> {
        self.commit_pos
            .get(commit)
            .copied()
            .ok_or_else(|| StoreError::Query(format!("unknown commit {commit}")))
    }

    fn tile_at(&self, pos: usize) -> TileId {
        self.commits
            .get(pos)
            .map(|commit| commit.tile)
            .unwrap_or_default()
    }

    fn trace_matches(&self, record: &TraceRecord, query: &TraceQuery) -> bool {
        record.corpus() == Some(query.corpus.as_str()) && query.constraints.matches(&record.params)
    }

    fn observation(&self, trace_id: &TraceId, record: &TraceRecord, cell: &Cell) -> TraceObservation {
        TraceObservation {
            trace_id: trace_id.clone(),
            grouping_id: record.grouping_id.clone(),
            digest: cell.digest.clone(),
            options_id: cell.options_id.clone(),
        }
    }
}

/// Thread-safe in-memory store.
#[derive(Debug, Default)]
pub struct InMemoryStore {
    state: RwLock<State>,
    unavailable: AtomicBool,
    head_queries: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent call fail with [`StoreError::Unavailable`].
    pub fn set_unavailable(&self, unavailable: bool) {
        self.unavailable.store(unavailable, Ordering::SeqCst);
    }

    /// Number of `values_at_head` calls served so far.
    pub fn head_query_count(&self) -> usize {
        self.head_queries.load(Ordering::SeqCst)
    }

    /// Appends a commit. Commits must be added oldest first.
    pub async fn add_commit(&self, commit: Commit, tile: TileId) {
        let mut state = self.state.write().await;
        let pos = state.commits.len();
        state.commit_pos.insert(commit.id.clone(), pos);
        state.commits.push(CommitWithTile { commit, tile });
    }

    /// Registers a trace and its grouping; returns the derived trace id.
    pub async fn add_trace(&self, params: Params) -> TraceId {
        let trace_id = TraceId::from_params(&params);
        let grouping_id = GroupingId::from_params(&params);
        let mut state = self.state.write().await;
        state
            .groupings
            .entry(grouping_id.clone())
            .or_insert_with(|| grouping_params(&params));
        state.traces.insert(
            trace_id.clone(),
            TraceRecord {
                params,
                grouping_id,
            },
        );
        trace_id
    }

    pub async fn add_options(&self, params: Params) -> OptionsId {
        let options_id = OptionsId::from_params(&params);
        self.state
            .write()
            .await
            .options
            .insert(options_id.clone(), params);
        options_id
    }

    pub async fn record(&self, trace: &TraceId, commit: &CommitId, digest: impl Into<Digest>) {
        self.record_with_options(trace, commit, digest, None).await;
    }

    pub async fn record_with_options(
        &self,
        trace: &TraceId,
        commit: &CommitId,
        digest: impl Into<Digest>,
        options_id: Option<OptionsId>,
    ) {
        let mut state = self.state.write().await;
        let Some(pos) = state.commit_pos.get(commit).copied() else {
            debug!("ignoring observation for unknown commit {commit}");
            return;
        };
        state.values.entry(trace.clone()).or_default().insert(
            pos,
            Cell {
                digest: digest.into(),
                options_id,
            },
        );
    }

    pub async fn set_label(&self, grouping: &GroupingId, digest: impl Into<Digest>, label: Label) {
        let key = GroupingDigest::new(grouping.clone(), digest.into());
        self.state.write().await.labels.insert(key, label);
    }

    pub async fn add_changelist(&self, scope: ChangelistScope) {
        self.state
            .write()
            .await
            .changelists
            .entry(scope)
            .or_default();
    }

    pub async fn record_changelist(
        &self,
        scope: &ChangelistScope,
        trace: &TraceId,
        digest: impl Into<Digest>,
    ) {
        let mut state = self.state.write().await;
        let Some(grouping_id) = state
            .traces
            .get(trace)
            .map(|record| record.grouping_id.clone())
        else {
            debug!("ignoring changelist observation for unknown trace {trace}");
            return;
        };
        state
            .changelists
            .entry(scope.clone())
            .or_default()
            .observations
            .push(TraceObservation {
                trace_id: trace.clone(),
                grouping_id,
                digest: digest.into(),
                options_id: None,
            });
    }

    pub async fn set_changelist_label(
        &self,
        scope: &ChangelistScope,
        grouping: &GroupingId,
        digest: impl Into<Digest>,
        label: Label,
    ) {
        let key = GroupingDigest::new(grouping.clone(), digest.into());
        self.state
            .write()
            .await
            .changelists
            .entry(scope.clone())
            .or_default()
            .labels
            .insert(key, label);
    }

    /// Stores a metric row for `(metric.left, metric.right)` only.
    pub async fn set_metric(&self, metric: DiffMetric) {
        let key = (metric.left.clone(), metric.right.clone());
        self.state.write().await.metrics.insert(key, metric);
    }

    /// Stores the row in both directions.
    pub async fn set_metric_symmetric(&self, metric: DiffMetric) {
        let mut reversed = metric.clone();
        std::mem::swap(&mut reversed.left, &mut reversed.right);
        self.set_metric(metric).await;
        self.set_metric(reversed).await;
    }

    fn check_available(&self) -> StoreResult<()> {
        if self.unavailable.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("in-memory store offline".to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl TraceStore for InMemoryStore {
    async fn recent_commits_with_data(&self, limit: usize) -> StoreResult<Vec<CommitWithTile>> {
        self.check_available()?;
        let state = self.state.read().await;
        let with_data: BTreeSet<usize> = state
            .values
            .values()
            .flat_map(|cells| cells.keys().copied())
            .collect();
        Ok(with_data
            .iter()
            .rev()
            .take(limit)
            .filter_map(|pos| state.commits.get(*pos).cloned())
            .collect())
    }

    async fn query_traces(&self, query: &TraceQuery) -> StoreResult<Vec<TraceObservation>> {
        self.check_available()?;
        let state = self.state.read().await;
        let first = state.position(&query.first_commit)?;
        let mut out = BTreeSet::new();
        for (trace_id, record) in &state.traces {
            if !state.trace_matches(record, query) {
                continue;
            }
            let Some(cells) = state.values.get(trace_id) else {
                continue;
            };
            for cell in cells.range(first..).map(|(_, cell)| cell) {
                out.insert(state.observation(trace_id, record, cell));
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn values_at_head(&self, query: &TraceQuery) -> StoreResult<Vec<TraceObservation>> {
        self.check_available()?;
        self.head_queries.fetch_add(1, Ordering::SeqCst);
        let state = self.state.read().await;
        let first = state.position(&query.first_commit)?;
        let mut out = Vec::new();
        for (trace_id, record) in &state.traces {
            if !state.trace_matches(record, query) {
                continue;
            }
            let newest = state
                .values
                .get(trace_id)
                .and_then(|cells| cells.range(first..).next_back());
            if let Some((_, cell)) = newest {
                out.push(state.observation(trace_id, record, cell));
            }
        }
        Ok(out)
    }

    async fn trace_params(&self, ids: &[TraceId]) -> StoreResult<HashMap<TraceId, Params>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| {
                state
                    .traces
                    .get(id)
                    .map(|record| (id.clone(), record.params.clone()))
            })
            .collect())
    }

    async fn options_params(&self, ids: &[OptionsId]) -> StoreResult<HashMap<OptionsId, Params>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.options.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }

    async fn grouping_params(
        &self,
        ids: &[GroupingId],
    ) -> StoreResult<HashMap<GroupingId, Params>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(ids
            .iter()
            .filter_map(|id| state.groupings.get(id).map(|p| (id.clone(), p.clone())))
            .collect())
    }

    async fn trace_history(
        &self,
        ids: &[TraceId],
        first_commit: &CommitId,
    ) -> StoreResult<Vec<HistoryRow>> {
        self.check_available()?;
        let state = self.state.read().await;
        let first = state.position(first_commit)?;
        let mut rows = Vec::new();
        for id in ids {
            let Some(cells) = state.values.get(id) else {
                continue;
            };
            for (pos, cell) in cells.range(first..) {
                if let Some(commit) = state.commits.get(*pos) {
                    rows.push(HistoryRow {
                        trace_id: id.clone(),
                        commit_id: commit.commit.id.clone(),
                        digest: cell.digest.clone(),
                    });
                }
            }
        }
        Ok(rows)
    }

    async fn grouping_trace_digests(
        &self,
        grouping: &GroupingId,
        constraints: &ParamSet,
        first_tile: TileId,
    ) -> StoreResult<Vec<(TraceId, Digest)>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = BTreeSet::new();
        for (trace_id, record) in &state.traces {
            if &record.grouping_id != grouping || !constraints.matches(&record.params) {
                continue;
            }
            let Some(cells) = state.values.get(trace_id) else {
                continue;
            };
            for (pos, cell) in cells {
                if state.tile_at(*pos) >= first_tile {
                    out.insert((trace_id.clone(), cell.digest.clone()));
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn digests_on_primary(&self, first_tile: TileId) -> StoreResult<Vec<GroupingDigest>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = BTreeSet::new();
        for (trace_id, cells) in &state.values {
            let Some(record) = state.traces.get(trace_id) else {
                continue;
            };
            for (pos, cell) in cells {
                if state.tile_at(*pos) >= first_tile {
                    out.insert(GroupingDigest::new(
                        record.grouping_id.clone(),
                        cell.digest.clone(),
                    ));
                }
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn all_traces(&self) -> StoreResult<Vec<(TraceId, Params)>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .traces
            .iter()
            .map(|(id, record)| (id.clone(), record.params.clone()))
            .collect())
    }

    async fn params_in_window(&self, first_tile: TileId) -> StoreResult<Vec<Params>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = BTreeSet::new();
        for (trace_id, cells) in &state.values {
            let Some(record) = state.traces.get(trace_id) else {
                continue;
            };
            for (pos, cell) in cells {
                if state.tile_at(*pos) < first_tile {
                    continue;
                }
                let mut params = record.params.clone();
                if let Some(options) = cell
                    .options_id
                    .as_ref()
                    .and_then(|id| state.options.get(id))
                {
                    params.extend(options.iter().map(|(k, v)| (k.clone(), v.clone())));
                }
                out.insert(params);
            }
        }
        Ok(out.into_iter().collect())
    }

    async fn changelist_observations(
        &self,
        scope: &ChangelistScope,
    ) -> StoreResult<Option<Vec<TraceObservation>>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(state
            .changelists
            .get(scope)
            .map(|data| data.observations.clone()))
    }
}

#[async_trait]
impl ExpectationStore for InMemoryStore {
    async fn labels(&self, keys: &[GroupingDigest]) -> StoreResult<HashMap<GroupingDigest, Label>> {
        self.check_available()?;
        let state = self.state.read().await;
        Ok(keys
            .iter()
            .filter_map(|key| state.labels.get(key).map(|label| (key.clone(), *label)))
            .collect())
    }

    async fn changelist_labels(
        &self,
        scope: &ChangelistScope,
        keys: &[GroupingDigest],
    ) -> StoreResult<HashMap<GroupingDigest, Label>> {
        self.check_available()?;
        let state = self.state.read().await;
        let Some(data) = state.changelists.get(scope) else {
            return Ok(HashMap::new());
        };
        Ok(keys
            .iter()
            .filter_map(|key| data.labels.get(key).map(|label| (key.clone(), *label)))
            .collect())
    }
}

#[async_trait]
impl DiffMetricStore for InMemoryStore {
    async fn metrics(&self, lefts: &[Digest], rights: &[Digest]) -> StoreResult<Vec<DiffMetric>> {
        self.check_available()?;
        let state = self.state.read().await;
        let mut out = Vec::new();
        for left in lefts {
            for right in rights {
                if left == right {
                    continue;
                }
                if let Some(metric) = state.metrics.get(&(left.clone(), right.clone())) {
                    out.push(metric.clone());
                }
            }
        }
        Ok(out)
    }
}
