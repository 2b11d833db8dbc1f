//! Parameter summaries over the window and over changelists.

use crate::cache::TraceClassification;
use crate::cluster::observation_params;
use crate::error::Result;
use crate::error::SearchError;
use crate::matcher::MatchResult;
use crate::matcher::MatchSource;
use crate::metadata::CorpusParamSets;
use crate::metadata::MetadataCache;
use crate::window::WindowContext;
use std::collections::BTreeSet;
use std::sync::Arc;
use tracing::debug;
use vdiff_trace_store::CORPUS_FIELD;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::OptionsId;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceStore;

const PRIMARY_KEY: &str = "primary";

fn changelist_key(scope: &ChangelistScope) -> String {
    format!("cl:{scope}")
}

/// Buckets parameter maps by their corpus. Maps without a corpus are dropped.
pub fn group_by_corpus<I>(params: I) -> CorpusParamSets
where
    I: IntoIterator<Item = ParamSet>,
{
    let mut sets = CorpusParamSets::new();
    for set in params {
        let Some(corpora) = set.get(CORPUS_FIELD) else {
            continue;
        };
        for corpus in corpora.clone() {
            sets.entry(corpus).or_default().union(&set);
        }
    }
    sets
}

/// Union of the corpora the caller may see.
pub fn visible_union(sets: &CorpusParamSets, classification: &TraceClassification) -> ParamSet {
    let mut union = ParamSet::new();
    for (corpus, set) in sets {
        if classification.is_corpus_visible(corpus) {
            union.union(set);
        }
    }
    union
}

/// Per-corpus paramsets for the primary branch over `window`.
pub async fn primary_paramsets(
    store: &dyn TraceStore,
    metadata: &MetadataCache,
    window: &WindowContext,
) -> Result<Arc<CorpusParamSets>> {
    if let Some(cached) = metadata.paramsets(PRIMARY_KEY) {
        return Ok(cached);
    }
    let params = store.params_in_window(window.first_tile()).await?;
    let sets = Arc::new(group_by_corpus(
        params.iter().map(ParamSet::from_params),
    ));
    debug!(corpora = sets.len(), "computed primary paramsets");
    metadata.insert_paramsets(PRIMARY_KEY.to_string(), Arc::clone(&sets));
    Ok(sets)
}

/// Per-corpus paramsets over the observations of one changelist.
pub async fn changelist_paramsets(
    store: &dyn TraceStore,
    metadata: &MetadataCache,
    scope: &ChangelistScope,
) -> Result<Arc<CorpusParamSets>> {
    let key = changelist_key(scope);
    if let Some(cached) = metadata.paramsets(&key) {
        return Ok(cached);
    }
    let observations = store
        .changelist_observations(scope)
        .await?
        .ok_or_else(|| SearchError::NotFound(format!("changelist {scope}")))?;
    let matches: Vec<MatchResult> = observations
        .into_iter()
        .map(|obs| MatchResult {
            trace_id: obs.trace_id,
            grouping_id: obs.grouping_id,
            digest: obs.digest,
            options_id: obs.options_id,
            source: MatchSource::Changelist,
        })
        .collect();

    let trace_ids: Vec<TraceId> = matches
        .iter()
        .map(|m| m.trace_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let option_ids: Vec<OptionsId> = matches
        .iter()
        .filter_map(|m| m.options_id.clone())
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect();
    let trace_params = metadata.trace_params(store, &trace_ids).await?;
    let options_params = if option_ids.is_empty() {
        Default::default()
    } else {
        metadata.options_params(store, &option_ids).await?
    };

    let sets = Arc::new(group_by_corpus(
        matches
            .iter()
            .map(|m| observation_params(m, &trace_params, &options_params)),
    ));
    metadata.insert_paramsets(key, Arc::clone(&sets));
    Ok(sets)
}
