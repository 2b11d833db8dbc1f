use crate::error::Result;
use std::collections::HashMap;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::ExpectationStore;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::Label;

/// Label of every key, with changelist overrides layered over the primary
/// expectations. Keys never labeled come back untriaged.
pub async fn effective_labels(
    expectations: &dyn ExpectationStore,
    changelist: Option<&ChangelistScope>,
    keys: &[GroupingDigest],
) -> Result<HashMap<GroupingDigest, Label>> {
    if keys.is_empty() {
        return Ok(HashMap::new());
    }
    let mut labels = expectations.labels(keys).await?;
    if let Some(scope) = changelist {
        labels.extend(expectations.changelist_labels(scope, keys).await?);
    }
    Ok(keys
        .iter()
        .map(|key| (key.clone(), labels.get(key).copied().unwrap_or_default()))
        .collect())
}
