use crate::error::Result;
use crate::matcher::MatchResult;
use crate::result::ClusterLink;
use crate::result::ClusterNode;
use crate::result::ClusterResponse;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use vdiff_trace_store::DiffMetricStore;
use vdiff_trace_store::Digest;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::Label;
use vdiff_trace_store::OptionsId;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::Params;
use vdiff_trace_store::TraceId;

/// Parameters a match was produced with: its trace's params plus any
/// per-observation options.
pub(crate) fn observation_params(
    m: &MatchResult,
    trace_params: &HashMap<TraceId, Params>,
    options_params: &HashMap<OptionsId, Params>,
) -> ParamSet {
    let mut set = ParamSet::new();
    if let Some(params) = trace_params.get(&m.trace_id) {
        set.add_params(params);
    }
    if let Some(params) = m.options_id.as_ref().and_then(|id| options_params.get(id)) {
        set.add_params(params);
    }
    set
}

/// Builds the digest graph of the matched traces.
///
/// Nodes are ordered by (grouping, digest). Links only join digests of the
/// same grouping and only where a metric exists in either direction; when
/// both directions exist the smaller distance is used.
pub async fn build_cluster(
    diffs: &dyn DiffMetricStore,
    matches: &[MatchResult],
    labels: &HashMap<GroupingDigest, Label>,
    trace_params: &HashMap<TraceId, Params>,
    options_params: &HashMap<OptionsId, Params>,
) -> Result<ClusterResponse> {
    let keys: BTreeSet<GroupingDigest> = matches.iter().map(MatchResult::key).collect();
    let nodes: Vec<ClusterNode> = keys
        .iter()
        .map(|key| ClusterNode {
            digest: key.digest.clone(),
            grouping_id: key.grouping.clone(),
            label: labels.get(key).copied().unwrap_or_default(),
        })
        .collect();

    let mut paramsets_by_digest: BTreeMap<Digest, ParamSet> = BTreeMap::new();
    let mut paramset = ParamSet::new();
    for m in matches {
        let params = observation_params(m, trace_params, options_params);
        paramset.union(&params);
        paramsets_by_digest
            .entry(m.digest.clone())
            .or_default()
            .union(&params);
    }

    let digests: Vec<Digest> = keys
        .iter()
        .map(|key| key.digest.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let rows = if digests.len() < 2 {
        Vec::new()
    } else {
        diffs.metrics(&digests, &digests).await?
    };

    let mut positions: HashMap<&Digest, Vec<usize>> = HashMap::new();
    for (index, node) in nodes.iter().enumerate() {
        positions.entry(&node.digest).or_default().push(index);
    }
    let mut distances: BTreeMap<(usize, usize), f32> = BTreeMap::new();
    for row in rows.iter().filter(|row| row.left != row.right) {
        let (Some(lefts), Some(rights)) = (positions.get(&row.left), positions.get(&row.right))
        else {
            continue;
        };
        for &left in lefts {
            for &right in rights {
                if nodes[left].grouping_id != nodes[right].grouping_id {
                    continue;
                }
                let pair = (left.min(right), left.max(right));
                distances
                    .entry(pair)
                    .and_modify(|distance| *distance = distance.min(row.percent_pixels_diff))
                    .or_insert(row.percent_pixels_diff);
            }
        }
    }
    let links = distances
        .into_iter()
        .map(|((source, target), distance)| ClusterLink {
            source,
            target,
            distance,
        })
        .collect();

    Ok(ClusterResponse {
        nodes,
        links,
        paramsets_by_digest,
        paramset,
    })
}
