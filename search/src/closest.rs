use crate::cache::TraceClassification;
use crate::error::Result;
use crate::fanout::bounded_fan_out;
use crate::labels::effective_labels;
use crate::query::Metric;
use crate::query::RgbaBand;
use crate::query::SortOrder;
use crate::result::BulkTriageDeltaInfo;
use crate::result::RefDiff;
use crate::result::RefDiffs;
use crate::result::RefLabel;
use std::cmp::Ordering;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::ops::Range;
use std::sync::Arc;
use tracing::debug;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::DiffMetric;
use vdiff_trace_store::DiffMetricStore;
use vdiff_trace_store::Digest;
use vdiff_trace_store::ExpectationStore;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::Params;
use vdiff_trace_store::TileId;
use vdiff_trace_store::TraceStore;

/// A left digest with its nearest references.
#[derive(Debug, Clone, PartialEq)]
pub struct ResolvedDigest {
    pub key: GroupingDigest,
    pub label: Label,
    pub ref_diffs: RefDiffs,
    pub closest_ref: Option<RefLabel>,
}

impl ResolvedDigest {
    pub fn closest(&self) -> Option<&RefDiff> {
        self.closest_ref.and_then(|label| self.ref_diffs.get(label))
    }

    fn sort_metric(&self) -> f32 {
        self.closest()
            .map_or(f32::INFINITY, |reference| reference.query_metric)
    }
}

/// Which digests may serve as references, and how distance is measured.
#[derive(Debug, Clone)]
pub struct ReferenceScope {
    pub constraints: ParamSet,
    pub first_tile: TileId,
    pub metric: Metric,
    pub changelist: Option<ChangelistScope>,
    /// Only digests produced by at least one visible trace are references.
    pub classification: Arc<TraceClassification>,
}

#[derive(Clone)]
pub struct ClosestDiffResolver {
    store: Arc<dyn TraceStore>,
    expectations: Arc<dyn ExpectationStore>,
    diffs: Arc<dyn DiffMetricStore>,
    max_concurrent_groupings: usize,
}

impl ClosestDiffResolver {
    pub fn new(
        store: Arc<dyn TraceStore>,
        expectations: Arc<dyn ExpectationStore>,
        diffs: Arc<dyn DiffMetricStore>,
        max_concurrent_groupings: usize,
    ) -> Self {
        Self {
            store,
            expectations,
            diffs,
            max_concurrent_groupings,
        }
    }

    /// Finds the closest positive and negative reference of every left
    /// digest. Lefts are deduplicated and processed one grouping per task;
    /// the output is ordered by (grouping, digest).
    pub async fn resolve(
        &self,
        lefts: &HashMap<GroupingDigest, Label>,
        scope: &ReferenceScope,
    ) -> Result<Vec<ResolvedDigest>> {
        let mut by_grouping: BTreeMap<GroupingId, BTreeSet<Digest>> = BTreeMap::new();
        for key in lefts.keys() {
            by_grouping
                .entry(key.grouping.clone())
                .or_default()
                .insert(key.digest.clone());
        }
        debug!(
            groupings = by_grouping.len(),
            digests = lefts.len(),
            "resolving closest references"
        );

        let per_grouping = bounded_fan_out(
            by_grouping.into_iter().collect(),
            self.max_concurrent_groupings,
            |(grouping, digests): (GroupingId, BTreeSet<Digest>)| {
                let resolver = self.clone();
                let scope = scope.clone();
                async move {
                    let digests: Vec<Digest> = digests.into_iter().collect();
                    resolver
                        .grouping_refs(&grouping, &digests, &scope)
                        .await
                        .map(|refs| (grouping, refs))
                }
            },
        )
        .await?;

        let mut resolved = BTreeMap::new();
        for (grouping, refs) in per_grouping {
            for (digest, ref_diffs) in refs {
                let key = GroupingDigest::new(grouping.clone(), digest);
                let label = lefts.get(&key).copied().unwrap_or_default();
                let closest_ref = pick_closest(&ref_diffs);
                resolved.insert(
                    key.clone(),
                    ResolvedDigest {
                        key,
                        label,
                        ref_diffs,
                        closest_ref,
                    },
                );
            }
        }
        Ok(resolved.into_values().collect())
    }

    async fn grouping_refs(
        &self,
        grouping: &GroupingId,
        lefts: &[Digest],
        scope: &ReferenceScope,
    ) -> Result<Vec<(Digest, RefDiffs)>> {
        let candidates: BTreeSet<Digest> = self
            .store
            .grouping_trace_digests(grouping, &scope.constraints, scope.first_tile)
            .await?
            .into_iter()
            .filter(|(trace, _)| scope.classification.is_visible(trace))
            .map(|(_, digest)| digest)
            .collect();
        let keys: Vec<GroupingDigest> = candidates
            .iter()
            .map(|digest| GroupingDigest::new(grouping.clone(), digest.clone()))
            .collect();
        let labels =
            effective_labels(self.expectations.as_ref(), scope.changelist.as_ref(), &keys)
                .await?;
        let references: HashMap<Digest, RefLabel> = labels
            .into_iter()
            .filter_map(|(key, label)| match label {
                Label::Positive => Some((key.digest, RefLabel::Positive)),
                Label::Negative => Some((key.digest, RefLabel::Negative)),
                Label::Untriaged => None,
            })
            .collect();

        let rows = if references.is_empty() {
            Vec::new()
        } else {
            let mut rights: Vec<Digest> = references.keys().cloned().collect();
            rights.sort();
            self.diffs.metrics(lefts, &rights).await?
        };

        let mut best: HashMap<(&Digest, RefLabel), &DiffMetric> = HashMap::new();
        for row in &rows {
            if row.left == row.right {
                continue;
            }
            let Some(label) = references.get(&row.right).copied() else {
                continue;
            };
            best.entry((&row.left, label))
                .and_modify(|current| {
                    if compare_refs(scope.metric, row, *current) == Ordering::Less {
                        *current = row;
                    }
                })
                .or_insert(row);
        }

        Ok(lefts
            .iter()
            .map(|left| {
                let pick = |label: RefLabel| {
                    best.get(&(left, label))
                        .map(|row| RefDiff::from_metric(row, label, scope.metric.value(row)))
                };
                let ref_diffs = RefDiffs {
                    positive: pick(RefLabel::Positive),
                    negative: pick(RefLabel::Negative),
                };
                (left.clone(), ref_diffs)
            })
            .collect())
    }
}

/// Ascending metric, then ascending max channel diff, then digest.
fn compare_refs(metric: Metric, a: &DiffMetric, b: &DiffMetric) -> Ordering {
    metric
        .value(a)
        .total_cmp(&metric.value(b))
        .then_with(|| a.max_channel_diff().cmp(&b.max_channel_diff()))
        .then_with(|| a.right.cmp(&b.right))
}

/// The only reference present, or the nearer one; positive wins ties.
pub fn pick_closest(refs: &RefDiffs) -> Option<RefLabel> {
    match (&refs.positive, &refs.negative) {
        (None, None) => None,
        (Some(_), None) => Some(RefLabel::Positive),
        (None, Some(_)) => Some(RefLabel::Negative),
        (Some(positive), Some(negative)) => {
            if negative.query_metric < positive.query_metric {
                Some(RefLabel::Negative)
            } else {
                Some(RefLabel::Positive)
            }
        }
    }
}

/// Drops results without a reference when one is required, and results
/// whose closest reference falls outside an active RGBA band.
pub fn apply_reference_filters(
    results: Vec<ResolvedDigest>,
    must_have_reference: bool,
    band: RgbaBand,
) -> Vec<ResolvedDigest> {
    results
        .into_iter()
        .filter(|result| {
            let closest = result.closest();
            if must_have_reference && closest.is_none() {
                return false;
            }
            if band.is_active() {
                return closest.is_some_and(|reference| band.contains(reference.max_channel_diff()));
            }
            true
        })
        .collect()
}

/// Orders by the closest reference's metric. Results without a reference
/// come last in either direction. Ties always break on left digest, then
/// grouping id, ascending.
pub fn sort_results(results: &mut [ResolvedDigest], order: SortOrder) {
    results.sort_by(|a, b| {
        let by_metric = a.sort_metric().total_cmp(&b.sort_metric());
        let by_metric = match order {
            SortOrder::Ascending => by_metric,
            SortOrder::Descending => by_metric.reverse(),
        };
        a.closest()
            .is_none()
            .cmp(&b.closest().is_none())
            .then(by_metric)
            .then_with(|| a.key.digest.cmp(&b.key.digest))
            .then_with(|| a.key.grouping.cmp(&b.key.grouping))
    });
}

pub fn page_range(len: usize, offset: usize, limit: usize) -> Range<usize> {
    let start = offset.min(len);
    let end = start.saturating_add(limit).min(len);
    start..end
}

/// One record per sorted result; only those inside `page` are flagged as
/// being on the current page.
pub fn bulk_triage_infos(
    sorted: &[ResolvedDigest],
    page: &Range<usize>,
    grouping_params: &HashMap<GroupingId, Params>,
) -> Vec<BulkTriageDeltaInfo> {
    sorted
        .iter()
        .enumerate()
        .map(|(i, result)| BulkTriageDeltaInfo {
            grouping: grouping_params
                .get(&result.key.grouping)
                .cloned()
                .unwrap_or_default(),
            grouping_id: result.key.grouping.clone(),
            digest: result.key.digest.clone(),
            label_before: result.label,
            closest_diff_label: result.closest_ref,
            in_current_search_results_page: page.contains(&i),
        })
        .collect()
}
