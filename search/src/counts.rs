use crate::result::TestCounts;
use std::collections::BTreeMap;
use std::collections::HashMap;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::Label;
use vdiff_trace_store::Params;

/// Distinct digests per grouping, split by label, ordered by grouping id.
pub fn count_by_grouping(
    labels: &HashMap<GroupingDigest, Label>,
    grouping_params: &HashMap<GroupingId, Params>,
) -> Vec<TestCounts> {
    let mut counts: BTreeMap<&GroupingId, TestCounts> = BTreeMap::new();
    for (key, label) in labels {
        let entry = counts.entry(&key.grouping).or_insert_with(|| TestCounts {
            grouping_id: key.grouping.clone(),
            grouping: grouping_params
                .get(&key.grouping)
                .cloned()
                .unwrap_or_default(),
            positive: 0,
            negative: 0,
            untriaged: 0,
            total: 0,
        });
        match label {
            Label::Positive => entry.positive += 1,
            Label::Negative => entry.negative += 1,
            Label::Untriaged => entry.untriaged += 1,
        }
        entry.total += 1;
    }
    counts.into_values().collect()
}
