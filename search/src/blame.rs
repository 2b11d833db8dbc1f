//! Attributes untriaged digests at head to the commit ranges that introduced
//! them.

use crate::error::Result;
use crate::error::SearchError;
use crate::fanout::bounded_fan_out;
use crate::history::AlignedHistory;
use crate::history::align_histories;
use crate::matcher::MatchResult;
use crate::metadata::MetadataCache;
use crate::result::AffectedGrouping;
use crate::result::BlameEntry;
use crate::result::BlameSummary;
use crate::window::WindowContext;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::HistoryRow;
use vdiff_trace_store::Params;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceStore;

/// Where a blame interval begins. `BeforeWindow` orders before every index.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum BlameStart {
    BeforeWindow,
    At(usize),
}

/// The digest changed somewhere after `start` and no later than `end`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub struct BlameInterval {
    pub start: BlameStart,
    pub end: usize,
}

impl BlameInterval {
    fn overlaps(self, later: BlameInterval) -> bool {
        match later.start {
            BlameStart::BeforeWindow => true,
            BlameStart::At(start) => start < self.end,
        }
    }
}

/// Interval for one trace whose newest observation is `target`.
///
/// Walks back over the run of `target` ending at the newest observation;
/// missing cells do not break the run. Returns `None` when the trace's
/// newest observation is something else.
pub fn trace_interval(history: &[Option<Digest>], target: &Digest) -> Option<BlameInterval> {
    let (end, newest) = history
        .iter()
        .enumerate()
        .rev()
        .find_map(|(i, cell)| cell.as_ref().map(|digest| (i, digest)))?;
    if newest != target {
        return None;
    }
    let start = history
        .iter()
        .take(end)
        .enumerate()
        .rev()
        .find_map(|(i, cell)| match cell {
            Some(digest) if digest != target => Some(BlameStart::At(i)),
            _ => None,
        })
        .unwrap_or(BlameStart::BeforeWindow);
    Some(BlameInterval { start, end })
}

/// Folds the intervals of every trace producing one digest.
///
/// Intervals are taken in (start, end) order. An overlapping interval widens
/// the current one; a disjoint one is dropped, so the earliest run wins.
pub fn merge_intervals(mut intervals: Vec<BlameInterval>) -> Option<BlameInterval> {
    intervals.sort();
    let mut merged = intervals.into_iter();
    let first = merged.next()?;
    Some(merged.fold(first, |current, next| {
        if current.overlaps(next) {
            BlameInterval {
                start: current.start,
                end: current.end.max(next.end),
            }
        } else {
            current
        }
    }))
}

/// Entry id and suspect commits for an interval. Intervals that begin
/// before the window, or that have no width, collapse onto the window's
/// first commit.
fn commit_range(window: &WindowContext, interval: BlameInterval) -> (String, Vec<usize>) {
    match interval.start {
        BlameStart::At(start) if interval.end > start => {
            let id = |index: usize| {
                window
                    .commit_at(index)
                    .map(|commit| commit.id.to_string())
                    .unwrap_or_default()
            };
            (
                format!("{}:{}", id(start), id(interval.end)),
                (start..=interval.end).collect(),
            )
        }
        _ => (window.first_commit().to_string(), vec![0]),
    }
}

/// Per (grouping, digest): the merged interval and the traces producing it.
pub type PairIntervals = BTreeMap<GroupingDigest, (BlameInterval, BTreeSet<TraceId>)>;

/// Computes each untriaged pair's interval from aligned histories.
pub fn pair_intervals(
    untriaged: &[MatchResult],
    histories: &HashMap<TraceId, AlignedHistory>,
) -> PairIntervals {
    let mut per_pair: BTreeMap<GroupingDigest, (Vec<BlameInterval>, BTreeSet<TraceId>)> =
        BTreeMap::new();
    for m in untriaged {
        let Some(interval) = histories
            .get(&m.trace_id)
            .and_then(|history| trace_interval(history, &m.digest))
        else {
            continue;
        };
        let (intervals, traces) = per_pair.entry(m.key()).or_default();
        intervals.push(interval);
        traces.insert(m.trace_id.clone());
    }
    per_pair
        .into_iter()
        .filter_map(|(key, (intervals, traces))| {
            merge_intervals(intervals).map(|interval| (key, (interval, traces)))
        })
        .collect()
}

#[derive(Default)]
struct EntryBuilder {
    commits: Vec<usize>,
    groupings: BTreeMap<GroupingId, BTreeMap<Digest, BTreeSet<TraceId>>>,
}

/// Groups pairs by commit range and orders entries, groupings and evidence.
pub fn summarize(
    window: &WindowContext,
    corpus: &str,
    pairs: PairIntervals,
    grouping_params: &HashMap<GroupingId, Params>,
) -> BlameSummary {
    let mut by_range: BTreeMap<String, EntryBuilder> = BTreeMap::new();
    for (key, (interval, traces)) in pairs {
        let (range, commits) = commit_range(window, interval);
        let builder = by_range.entry(range).or_default();
        builder.commits = commits;
        builder
            .groupings
            .entry(key.grouping)
            .or_default()
            .entry(key.digest)
            .or_default()
            .extend(traces);
    }

    let mut entries: Vec<BlameEntry> = by_range
        .into_iter()
        .map(|(commit_range, builder)| {
            let mut affected: Vec<AffectedGrouping> = builder
                .groupings
                .into_iter()
                .filter_map(|(grouping_id, digests)| {
                    let sample_digest = digests.keys().next()?.clone();
                    let untriaged_digests = digests.len();
                    let evidence = digests
                        .into_iter()
                        .flat_map(|(digest, traces)| {
                            traces.into_iter().map(move |trace| (trace, digest.clone()))
                        })
                        .collect::<BTreeSet<_>>()
                        .into_iter()
                        .collect();
                    Some(AffectedGrouping {
                        grouping: grouping_params
                            .get(&grouping_id)
                            .cloned()
                            .unwrap_or_default(),
                        grouping_id,
                        untriaged_digests,
                        sample_digest,
                        evidence,
                    })
                })
                .collect();
            affected.sort_by(|a, b| {
                b.untriaged_digests
                    .cmp(&a.untriaged_digests)
                    .then_with(|| a.sample_digest.cmp(&b.sample_digest))
                    .then_with(|| a.grouping_id.cmp(&b.grouping_id))
            });
            BlameEntry {
                total_untriaged_digests: affected.iter().map(|g| g.untriaged_digests).sum(),
                affected_groupings: affected,
                commits: builder
                    .commits
                    .iter()
                    .filter_map(|index| window.commit_at(*index).cloned())
                    .collect(),
                commit_range,
            }
        })
        .collect();
    entries.sort_by(|a, b| {
        b.total_untriaged_digests
            .cmp(&a.total_untriaged_digests)
            .then_with(|| a.commit_range.cmp(&b.commit_range))
    });

    BlameSummary {
        corpus: corpus.to_string(),
        entries,
        commits: window.commits().to_vec(),
    }
}

/// Fetches history for the untriaged matches and builds the summary.
pub struct BlameEngine<'a> {
    pub store: Arc<dyn TraceStore>,
    pub metadata: &'a MetadataCache,
    pub batch_size: usize,
    pub max_concurrent: usize,
}

impl BlameEngine<'_> {
    pub async fn summarize(
        &self,
        window: &WindowContext,
        corpus: &str,
        untriaged: &[MatchResult],
    ) -> Result<BlameSummary> {
        let ids: Vec<TraceId> = untriaged
            .iter()
            .map(|m| m.trace_id.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let rows = self.histories(&ids, window.first_commit()).await?;
        let histories = align_histories(window, &ids, rows);
        let pairs = pair_intervals(untriaged, &histories);

        let groupings: Vec<GroupingId> = pairs
            .keys()
            .map(|key| key.grouping.clone())
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let grouping_params = self
            .metadata
            .grouping_params(self.store.as_ref(), &groupings)
            .await?;
        debug!(
            corpus,
            traces = ids.len(),
            pairs = pairs.len(),
            "computed blame intervals"
        );
        Ok(summarize(window, corpus, pairs, &grouping_params))
    }

    async fn histories(&self, ids: &[TraceId], first_commit: &CommitId) -> Result<Vec<HistoryRow>> {
        let batches: Vec<Vec<TraceId>> = ids
            .chunks(self.batch_size.max(1))
            .map(<[TraceId]>::to_vec)
            .collect();
        let fetched = bounded_fan_out(batches, self.max_concurrent, |batch: Vec<TraceId>| {
            let store = Arc::clone(&self.store);
            let first_commit = first_commit.clone();
            async move {
                store
                    .trace_history(&batch, &first_commit)
                    .await
                    .map_err(SearchError::from)
            }
        })
        .await?;
        Ok(fetched.into_iter().flatten().collect())
    }
}
