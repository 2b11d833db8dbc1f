//! Filter resolution.
//!
//! One code path serves windowed, at-head and changelist requests; the
//! request shape only changes where observations come from. Every source is
//! then put through the same corpus, constraint, ignore and visibility
//! filtering.

use crate::cache::VisibilityCache;
use crate::error::Result;
use crate::error::SearchError;
use crate::metadata::MetadataCache;
use crate::query::TraceFilter;
use crate::result::BlameSummary;
use crate::snapshot::SnapshotStore;
use crate::window::WindowContext;
use std::collections::BTreeSet;
use tracing::debug;
use vdiff_trace_store::CORPUS_FIELD;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::OptionsId;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceObservation;
use vdiff_trace_store::TraceStore;

/// Where a match came from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum MatchSource {
    Window,
    Head,
    Changelist,
    Blame,
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct MatchResult {
    pub trace_id: TraceId,
    pub grouping_id: GroupingId,
    pub digest: Digest,
    pub options_id: Option<OptionsId>,
    pub source: MatchSource,
}

impl MatchResult {
    fn from_observation(obs: TraceObservation, source: MatchSource) -> Self {
        Self {
            trace_id: obs.trace_id,
            grouping_id: obs.grouping_id,
            digest: obs.digest,
            options_id: obs.options_id,
            source,
        }
    }

    pub fn key(&self) -> GroupingDigest {
        GroupingDigest::new(self.grouping_id.clone(), self.digest.clone())
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct MatchOptions<'a> {
    pub changelist: Option<&'a ChangelistScope>,
    /// For changelists: keep digests already produced on the primary branch.
    pub include_digests_on_primary: bool,
}

pub struct TraceMatcher<'a> {
    pub store: &'a dyn TraceStore,
    pub visibility: &'a VisibilityCache,
    pub metadata: &'a MetadataCache,
    pub snapshots: &'a SnapshotStore,
}

impl TraceMatcher<'_> {
    /// Distinct matches, sorted.
    pub async fn matches(
        &self,
        window: &WindowContext,
        filter: &TraceFilter,
        options: MatchOptions<'_>,
    ) -> Result<Vec<MatchResult>> {
        let raw = match options.changelist {
            Some(scope) => self.changelist_matches(filter, scope, options).await?,
            None if filter.at_head_only => self.head_matches(window, filter).await?,
            None => self
                .store
                .query_traces(&window.trace_query(&filter.corpus, &filter.constraints))
                .await?
                .into_iter()
                .map(|obs| MatchResult::from_observation(obs, MatchSource::Window))
                .collect(),
        };
        let matches = self.post_filter(raw, filter.include_ignored);
        debug!(
            corpus = %filter.corpus,
            at_head = filter.at_head_only,
            matches = matches.len(),
            "resolved trace filter"
        );
        Ok(matches)
    }

    /// Untriaged-at-head observations from the corpus snapshot, when one was
    /// built for `window`.
    pub fn snapshot_untriaged(
        &self,
        window: &WindowContext,
        corpus: &str,
        include_ignored: bool,
    ) -> Option<Vec<MatchResult>> {
        let snapshot = self.snapshots.for_window(corpus, window)?;
        let raw = snapshot
            .untriaged_at_head
            .iter()
            .cloned()
            .map(|obs| MatchResult::from_observation(obs, MatchSource::Head))
            .collect();
        Some(self.post_filter(raw, include_ignored))
    }

    async fn head_matches(
        &self,
        window: &WindowContext,
        filter: &TraceFilter,
    ) -> Result<Vec<MatchResult>> {
        let Some(snapshot) = self.snapshots.for_window(&filter.corpus, window) else {
            return Ok(self
                .store
                .values_at_head(&window.trace_query(&filter.corpus, &filter.constraints))
                .await?
                .into_iter()
                .map(|obs| MatchResult::from_observation(obs, MatchSource::Head))
                .collect());
        };
        debug!(corpus = %filter.corpus, "serving at-head match from snapshot");
        if filter.constraints.is_empty() {
            return Ok(snapshot
                .traces_at_head
                .iter()
                .cloned()
                .map(|obs| MatchResult::from_observation(obs, MatchSource::Head))
                .collect());
        }
        let ids: Vec<TraceId> = snapshot
            .traces_at_head
            .iter()
            .map(|obs| obs.trace_id.clone())
            .collect();
        let params = self.metadata.trace_params(self.store, &ids).await?;
        Ok(snapshot
            .traces_at_head
            .iter()
            .filter(|obs| {
                params
                    .get(&obs.trace_id)
                    .is_some_and(|p| filter.constraints.matches(p))
            })
            .cloned()
            .map(|obs| MatchResult::from_observation(obs, MatchSource::Head))
            .collect())
    }

    async fn changelist_matches(
        &self,
        filter: &TraceFilter,
        scope: &ChangelistScope,
        options: MatchOptions<'_>,
    ) -> Result<Vec<MatchResult>> {
        let observations = self
            .store
            .changelist_observations(scope)
            .await?
            .ok_or_else(|| SearchError::NotFound(format!("changelist {scope}")))?;
        let ids: Vec<TraceId> = observations
            .iter()
            .map(|obs| obs.trace_id.clone())
            .collect();
        let params = self.metadata.trace_params(self.store, &ids).await?;
        let on_primary = self.visibility.digests_on_primary();
        Ok(observations
            .into_iter()
            .filter(|obs| {
                params.get(&obs.trace_id).is_some_and(|p| {
                    p.get(CORPUS_FIELD) == Some(&filter.corpus) && filter.constraints.matches(p)
                })
            })
            .filter(|obs| {
                options.include_digests_on_primary
                    || !on_primary.contains(&GroupingDigest::new(
                        obs.grouping_id.clone(),
                        obs.digest.clone(),
                    ))
            })
            .map(|obs| MatchResult::from_observation(obs, MatchSource::Changelist))
            .collect())
    }

    fn post_filter(&self, raw: Vec<MatchResult>, include_ignored: bool) -> Vec<MatchResult> {
        let classification = self.visibility.classification();
        raw.into_iter()
            .filter(|m| include_ignored || !classification.is_ignored(&m.trace_id))
            .filter(|m| classification.is_visible(&m.trace_id))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect()
    }
}

/// The exact evidence recorded on one blame entry; unknown ids match nothing.
pub fn blame_evidence(summary: &BlameSummary, blame_id: &str) -> Vec<MatchResult> {
    let Some(entry) = summary.entry(blame_id) else {
        debug!(blame_id, "blame id not present in current summary");
        return Vec::new();
    };
    entry
        .affected_groupings
        .iter()
        .flat_map(|grouping| {
            grouping
                .evidence
                .iter()
                .map(move |(trace_id, digest)| MatchResult {
                    trace_id: trace_id.clone(),
                    grouping_id: grouping.grouping_id.clone(),
                    digest: digest.clone(),
                    options_id: None,
                    source: MatchSource::Blame,
                })
        })
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}
