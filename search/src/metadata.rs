use crate::config::SearchConfig;
use crate::error::Result;
use std::collections::BTreeMap;
use std::collections::HashMap;
use std::collections::HashSet;
use std::hash::Hash;
use std::num::NonZeroUsize;
use std::sync::Arc;
use tracing::trace;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::OptionsId;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::Params;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceStore;
use vdiff_utils_cache::BlockingLruCache;
use vdiff_utils_cache::TtlCache;

/// Paramset summaries keyed by corpus.
pub type CorpusParamSets = BTreeMap<String, ParamSet>;

/// Bounded caches in front of the store's parameter lookups.
///
/// Groupings are immutable once created, so their entries are only ever
/// evicted for capacity. Whole paramset summaries expire after a TTL.
pub struct MetadataCache {
    traces: BlockingLruCache<TraceId, Params>,
    options: BlockingLruCache<OptionsId, Params>,
    groupings: BlockingLruCache<GroupingId, Params>,
    paramsets: TtlCache<String, Arc<CorpusParamSets>>,
}

fn capacity(size: usize) -> NonZeroUsize {
    NonZeroUsize::new(size).unwrap_or(NonZeroUsize::MIN)
}

impl MetadataCache {
    pub fn new(config: &SearchConfig) -> Self {
        Self {
            traces: BlockingLruCache::new(capacity(config.trace_params_cache_size)),
            options: BlockingLruCache::new(capacity(config.options_params_cache_size)),
            groupings: BlockingLruCache::new(capacity(config.grouping_params_cache_size)),
            paramsets: TtlCache::new(config.paramset_ttl(), config.paramset_cache_entries),
        }
    }

    pub async fn trace_params(
        &self,
        store: &dyn TraceStore,
        ids: &[TraceId],
    ) -> Result<HashMap<TraceId, Params>> {
        let (mut found, misses) = split(&self.traces, ids);
        if !misses.is_empty() {
            trace!(misses = misses.len(), "fetching trace params");
            let fetched = store.trace_params(&misses).await?;
            absorb(&self.traces, fetched, &mut found);
        }
        Ok(found)
    }

    pub async fn options_params(
        &self,
        store: &dyn TraceStore,
        ids: &[OptionsId],
    ) -> Result<HashMap<OptionsId, Params>> {
        let (mut found, misses) = split(&self.options, ids);
        if !misses.is_empty() {
            let fetched = store.options_params(&misses).await?;
            absorb(&self.options, fetched, &mut found);
        }
        Ok(found)
    }

    pub async fn grouping_params(
        &self,
        store: &dyn TraceStore,
        ids: &[GroupingId],
    ) -> Result<HashMap<GroupingId, Params>> {
        let (mut found, misses) = split(&self.groupings, ids);
        if !misses.is_empty() {
            let fetched = store.grouping_params(&misses).await?;
            absorb(&self.groupings, fetched, &mut found);
        }
        Ok(found)
    }

    pub fn paramsets(&self, key: &str) -> Option<Arc<CorpusParamSets>> {
        self.paramsets.get(key)
    }

    pub fn insert_paramsets(&self, key: String, value: Arc<CorpusParamSets>) {
        self.paramsets.insert(key, value);
    }

    pub fn cached_trace_params(&self) -> usize {
        self.traces.len()
    }

    pub fn cached_options_params(&self) -> usize {
        self.options.len()
    }

    pub fn cached_grouping_params(&self) -> usize {
        self.groupings.len()
    }

    pub fn cached_paramsets(&self) -> usize {
        self.paramsets.len()
    }
}

fn split<K>(cache: &BlockingLruCache<K, Params>, ids: &[K]) -> (HashMap<K, Params>, Vec<K>)
where
    K: Hash + Eq + Clone,
{
    let mut unique: Vec<&K> = Vec::with_capacity(ids.len());
    let mut seen = HashSet::new();
    for id in ids {
        if seen.insert(id) {
            unique.push(id);
        }
    }
    let (hits, misses) = cache.partition(unique);
    (hits.into_iter().collect(), misses)
}

fn absorb<K>(
    cache: &BlockingLruCache<K, Params>,
    fetched: HashMap<K, Params>,
    into: &mut HashMap<K, Params>,
) where
    K: Hash + Eq + Clone,
{
    for (id, params) in fetched {
        cache.insert(id.clone(), params.clone());
        into.insert(id, params);
    }
}
