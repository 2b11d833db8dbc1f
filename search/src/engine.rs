use crate::blame::BlameEngine;
use crate::cache::VisibilityCache;
use crate::closest::ClosestDiffResolver;
use crate::closest::ReferenceScope;
use crate::closest::ResolvedDigest;
use crate::closest::apply_reference_filters;
use crate::closest::bulk_triage_infos;
use crate::closest::page_range;
use crate::closest::sort_results;
use crate::cluster::build_cluster;
use crate::cluster::observation_params;
use crate::config::SearchConfig;
use crate::counts::count_by_grouping;
use crate::error::Result;
use crate::error::SearchError;
use crate::history::align_histories;
use crate::history::build_trace_group;
use crate::labels::effective_labels;
use crate::matcher::MatchOptions;
use crate::matcher::MatchResult;
use crate::matcher::TraceMatcher;
use crate::matcher::blame_evidence;
use crate::metadata::MetadataCache;
use crate::paramset::changelist_paramsets;
use crate::paramset::primary_paramsets;
use crate::paramset::visible_union;
use crate::query::LabelFilter;
use crate::query::Metric;
use crate::query::SearchQuery;
use crate::query::TraceFilter;
use crate::query::validate_changelist;
use crate::refresh::RefreshTracker;
use crate::refresh::run_once;
use crate::refresh::spawn_refresh_loop;
use crate::result::BlameSummary;
use crate::result::CacheStatus;
use crate::result::ClusterResponse;
use crate::result::CorpusStatus;
use crate::result::DigestComparison;
use crate::result::DigestDetails;
use crate::result::DigestSide;
use crate::result::SearchResponse;
use crate::result::SearchResult;
use crate::result::StatusOverview;
use crate::result::TestCounts;
use crate::snapshot::SnapshotStore;
use crate::window::WindowContext;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::future::Future;
use std::sync::Arc;
use std::sync::Mutex;
use std::time::Duration;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::debug;
use tracing::info;
use tracing::warn;
use vdiff_async_utils::OrCancelExt;
use vdiff_trace_store::CORPUS_FIELD;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::DiffMetricStore;
use vdiff_trace_store::Digest;
use vdiff_trace_store::ExpectationStore;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::GroupingId;
use vdiff_trace_store::Label;
use vdiff_trace_store::OptionsId;
use vdiff_trace_store::PRIMARY_KEY_FIELD;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::Params;
use vdiff_trace_store::ParamsMatcher;
use vdiff_trace_store::RuleSetMatcher;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceStore;

const PRIMARY_REFRESHER: &str = "primary_digests";
const CLASSIFICATION_REFRESHER: &str = "classification";

fn snapshot_refresher(corpus: &str) -> String {
    format!("snapshot:{corpus}")
}

/// Everything the engine reads from.
#[derive(Clone)]
pub struct Backends {
    pub traces: Arc<dyn TraceStore>,
    pub expectations: Arc<dyn ExpectationStore>,
    pub diffs: Arc<dyn DiffMetricStore>,
    /// Traces matching these rules are ignored unless a filter asks for them.
    pub ignore_rules: Arc<dyn ParamsMatcher>,
    /// In public view, only traces matching these rules are visible.
    pub public_rules: Arc<dyn ParamsMatcher>,
}

impl Backends {
    /// One store serving traces, expectations and metrics, with no ignore
    /// rules and nothing public.
    pub fn from_store<S>(store: Arc<S>) -> Self
    where
        S: TraceStore + ExpectationStore + DiffMetricStore + 'static,
    {
        Self {
            traces: store.clone(),
            expectations: store.clone(),
            diffs: store,
            ignore_rules: Arc::new(RuleSetMatcher::default()),
            public_rules: Arc::new(RuleSetMatcher::default()),
        }
    }

    pub fn with_ignore_rules(mut self, rules: Arc<dyn ParamsMatcher>) -> Self {
        self.ignore_rules = rules;
        self
    }

    pub fn with_public_rules(mut self, rules: Arc<dyn ParamsMatcher>) -> Self {
        self.public_rules = rules;
        self
    }
}

/// Query and analysis front end over the trace, expectation and diff stores.
///
/// Every read operation takes a [`CancellationToken`]; cancelling it drops
/// the operation along with any store calls and fan-out tasks in flight.
#[derive(Clone)]
pub struct SearchEngine {
    inner: Arc<Inner>,
}

struct Inner {
    config: SearchConfig,
    backends: Backends,
    visibility: VisibilityCache,
    metadata: MetadataCache,
    snapshots: SnapshotStore,
    resolver: ClosestDiffResolver,
    tracker: Arc<RefreshTracker>,
    shutdown: CancellationToken,
    background: Mutex<Vec<JoinHandle<()>>>,
}

impl SearchEngine {
    pub fn new(config: SearchConfig, backends: Backends) -> Result<Self> {
        config.validate().map_err(SearchError::InvalidConfig)?;
        let resolver = ClosestDiffResolver::new(
            Arc::clone(&backends.traces),
            Arc::clone(&backends.expectations),
            Arc::clone(&backends.diffs),
            config.max_concurrent_groupings,
        );
        Ok(Self {
            inner: Arc::new(Inner {
                visibility: VisibilityCache::new(config.public_view),
                metadata: MetadataCache::new(&config),
                snapshots: SnapshotStore::new(),
                resolver,
                tracker: Arc::new(RefreshTracker::new()),
                shutdown: CancellationToken::new(),
                background: Mutex::new(Vec::new()),
                backends,
                config,
            }),
        })
    }

    pub fn config(&self) -> &SearchConfig {
        &self.inner.config
    }

    pub async fn search(
        &self,
        query: &SearchQuery,
        token: &CancellationToken,
    ) -> Result<SearchResponse> {
        self.inner.search(query).or_cancel(token).await?
    }

    pub async fn digest_details(
        &self,
        grouping: &GroupingId,
        digest: &Digest,
        changelist: Option<&ChangelistScope>,
        token: &CancellationToken,
    ) -> Result<DigestDetails> {
        self.inner
            .digest_details(grouping, digest, changelist)
            .or_cancel(token)
            .await?
    }

    pub async fn digest_comparison(
        &self,
        grouping: &GroupingId,
        left: &Digest,
        right: &Digest,
        changelist: Option<&ChangelistScope>,
        token: &CancellationToken,
    ) -> Result<DigestComparison> {
        self.inner
            .digest_comparison(grouping, left, right, changelist)
            .or_cancel(token)
            .await?
    }

    pub async fn blame(&self, corpus: &str, token: &CancellationToken) -> Result<BlameSummary> {
        self.inner.blame(corpus).or_cancel(token).await?
    }

    /// Digest graph for one test. The filter must name the test.
    pub async fn cluster(
        &self,
        filter: &TraceFilter,
        labels: LabelFilter,
        token: &CancellationToken,
    ) -> Result<ClusterResponse> {
        self.inner.cluster(filter, labels).or_cancel(token).await?
    }

    pub async fn paramset(&self, token: &CancellationToken) -> Result<ParamSet> {
        self.inner.paramset().or_cancel(token).await?
    }

    pub async fn changelist_paramset(
        &self,
        scope: &ChangelistScope,
        token: &CancellationToken,
    ) -> Result<ParamSet> {
        self.inner
            .changelist_paramset(scope)
            .or_cancel(token)
            .await?
    }

    pub async fn count_digests_by_test(
        &self,
        filter: &TraceFilter,
        token: &CancellationToken,
    ) -> Result<Vec<TestCounts>> {
        self.inner.count_digests_by_test(filter).or_cancel(token).await?
    }

    pub async fn status_overview(&self, token: &CancellationToken) -> Result<StatusOverview> {
        self.inner.status_overview().or_cancel(token).await?
    }

    /// Runs every refresher once. All of them run even if one fails; the
    /// first failure is returned.
    pub async fn refresh_now(&self) -> Result<()> {
        let inner = &self.inner;
        let mut outcomes = vec![
            run_once(
                &inner.tracker,
                CLASSIFICATION_REFRESHER,
                inner.refresh_classification(),
            )
            .await,
            run_once(&inner.tracker, PRIMARY_REFRESHER, inner.refresh_primary()).await,
        ];
        for corpus in &inner.config.snapshot_corpora {
            outcomes.push(
                run_once(
                    &inner.tracker,
                    &snapshot_refresher(corpus),
                    inner.refresh_snapshot(corpus),
                )
                .await,
            );
        }
        outcomes.into_iter().collect()
    }

    /// Populates the caches and starts the periodic refreshers. A failing
    /// initial refresh leaves the engine serving with empty caches.
    pub async fn start_background(&self) {
        if let Err(err) = self.refresh_now().await {
            warn!(error = %err, "initial cache refresh failed");
        }
        let inner = &self.inner;
        let mut handles = vec![
            self.spawn_refresher(
                CLASSIFICATION_REFRESHER.to_string(),
                inner.config.classification_refresh_interval(),
                |inner| async move { inner.refresh_classification().await },
            ),
            self.spawn_refresher(
                PRIMARY_REFRESHER.to_string(),
                inner.config.primary_refresh_interval(),
                |inner| async move { inner.refresh_primary().await },
            ),
        ];
        for corpus in &inner.config.snapshot_corpora {
            let corpus = corpus.clone();
            handles.push(self.spawn_refresher(
                snapshot_refresher(&corpus),
                inner.config.snapshot_refresh_interval(),
                move |inner| {
                    let corpus = corpus.clone();
                    async move { inner.refresh_snapshot(&corpus).await }
                },
            ));
        }
        info!(refreshers = handles.len(), "background refreshers started");
        lock_background(&inner.background).extend(handles);
    }

    fn spawn_refresher<F, Fut>(&self, name: String, period: Duration, refresh: F) -> JoinHandle<()>
    where
        F: Fn(Arc<Inner>) -> Fut + Send + 'static,
        Fut: Future<Output = Result<()>> + Send + 'static,
    {
        let inner = Arc::clone(&self.inner);
        spawn_refresh_loop(
            name,
            period,
            Arc::clone(&self.inner.tracker),
            self.inner.shutdown.clone(),
            move || refresh(Arc::clone(&inner)),
        )
    }

    /// Stops the background refreshers and waits for them to exit.
    pub async fn shutdown(&self) {
        self.inner.shutdown.cancel();
        let handles = std::mem::take(&mut *lock_background(&self.inner.background));
        for handle in handles {
            if let Err(err) = handle.await {
                warn!(error = %err, "refresher did not stop cleanly");
            }
        }
    }

    pub fn cache_status(&self) -> CacheStatus {
        let inner = &self.inner;
        let classification = inner.visibility.classification();
        CacheStatus {
            refreshers: inner.tracker.statuses(),
            snapshots: inner.snapshots.statuses(),
            digests_on_primary: inner.visibility.digests_on_primary().len(),
            ignored_traces: classification.ignored_count(),
            visible_traces: classification.visible_count(),
            cached_trace_params: inner.metadata.cached_trace_params(),
            cached_options_params: inner.metadata.cached_options_params(),
            cached_grouping_params: inner.metadata.cached_grouping_params(),
            cached_paramsets: inner.metadata.cached_paramsets(),
        }
    }
}

fn lock_background(
    background: &Mutex<Vec<JoinHandle<()>>>,
) -> std::sync::MutexGuard<'_, Vec<JoinHandle<()>>> {
    match background.lock() {
        Ok(guard) => guard,
        Err(poisoned) => poisoned.into_inner(),
    }
}

fn distinct<T: Ord + Clone, I: IntoIterator<Item = T>>(items: I) -> Vec<T> {
    items
        .into_iter()
        .collect::<BTreeSet<_>>()
        .into_iter()
        .collect()
}

impl Inner {
    fn traces(&self) -> &dyn TraceStore {
        self.backends.traces.as_ref()
    }

    fn expectations(&self) -> &dyn ExpectationStore {
        self.backends.expectations.as_ref()
    }

    fn matcher(&self) -> TraceMatcher<'_> {
        TraceMatcher {
            store: self.traces(),
            visibility: &self.visibility,
            metadata: &self.metadata,
            snapshots: &self.snapshots,
        }
    }

    async fn window(&self) -> Result<WindowContext> {
        WindowContext::resolve(self.traces(), self.config.window_length).await
    }

    fn page_limit(&self, requested: usize) -> usize {
        let limit = if requested == 0 {
            self.config.default_page_size
        } else {
            requested
        };
        limit.min(self.config.max_page_size)
    }

    async fn refresh_primary(&self) -> Result<()> {
        self.visibility
            .refresh_primary(self.traces(), self.config.window_length)
            .await
    }

    async fn refresh_classification(&self) -> Result<()> {
        self.visibility
            .refresh_classification(
                self.traces(),
                self.backends.ignore_rules.as_ref(),
                self.backends.public_rules.as_ref(),
            )
            .await
    }

    async fn refresh_snapshot(&self, corpus: &str) -> Result<()> {
        self.snapshots
            .rebuild(
                self.traces(),
                self.expectations(),
                self.config.window_length,
                corpus,
            )
            .await
    }

    fn warn_if_primary_stale(&self, window: &WindowContext) {
        let primary = self.visibility.digests_on_primary();
        if primary.window_first_commit() != Some(window.first_commit()) {
            warn!(
                window_first_commit = %window.first_commit(),
                cached_first_commit = ?primary.window_first_commit(),
                "primary-branch digest cache is stale"
            );
        }
    }

    async fn search(&self, query: &SearchQuery) -> Result<SearchResponse> {
        query.validate()?;
        let window = self.window().await?;

        let matches = match &query.blame_id {
            Some(blame_id) => {
                let summary = self
                    .blame_in_window(&window, &query.filter.corpus, query.filter.include_ignored)
                    .await?;
                blame_evidence(&summary, blame_id)
            }
            None => {
                if query.changelist.is_some() && !query.include_digests_on_primary {
                    self.warn_if_primary_stale(&window);
                }
                let options = MatchOptions {
                    changelist: query.changelist.as_ref(),
                    include_digests_on_primary: query.include_digests_on_primary,
                };
                self.matcher()
                    .matches(&window, &query.filter, options)
                    .await?
            }
        };

        let keys = distinct(matches.iter().map(MatchResult::key));
        let lefts: HashMap<GroupingDigest, Label> =
            effective_labels(self.expectations(), query.changelist.as_ref(), &keys)
                .await?
                .into_iter()
                .filter(|(_, label)| query.labels.accepts(*label))
                .collect();

        let scope = ReferenceScope {
            constraints: query.right.constraints.clone(),
            first_tile: window.first_tile(),
            metric: query.metric,
            changelist: query.changelist.clone(),
            classification: self.visibility.classification(),
        };
        let resolved = self.resolver.resolve(&lefts, &scope).await?;
        let mut resolved =
            apply_reference_filters(resolved, query.must_have_reference, query.rgba_band);
        sort_results(&mut resolved, query.sort);

        let page = page_range(resolved.len(), query.offset, self.page_limit(query.limit));
        let groupings = distinct(resolved.iter().map(|r| r.key.grouping.clone()));
        let grouping_params = self
            .metadata
            .grouping_params(self.traces(), &groupings)
            .await?;
        let bulk_triage_delta_infos = bulk_triage_infos(&resolved, &page, &grouping_params);

        let results = self
            .build_results(
                &window,
                &resolved[page.clone()],
                &matches,
                &grouping_params,
                query.changelist.as_ref(),
            )
            .await?;
        debug!(
            corpus = %query.filter.corpus,
            matches = matches.len(),
            size = resolved.len(),
            page = results.len(),
            "search complete"
        );

        Ok(SearchResponse {
            results,
            offset: page.start,
            size: resolved.len(),
            commits: window.commits().to_vec(),
            bulk_triage_delta_infos,
        })
    }

    /// Expands resolved digests into full results: paramsets, trace groups
    /// with aligned histories, and the test name.
    async fn build_results(
        &self,
        window: &WindowContext,
        page: &[ResolvedDigest],
        matches: &[MatchResult],
        grouping_params: &HashMap<GroupingId, Params>,
        changelist: Option<&ChangelistScope>,
    ) -> Result<Vec<SearchResult>> {
        if page.is_empty() {
            return Ok(Vec::new());
        }
        let page_keys: BTreeSet<&GroupingDigest> = page.iter().map(|r| &r.key).collect();
        let mut producing: BTreeMap<GroupingDigest, Vec<&MatchResult>> = BTreeMap::new();
        for m in matches {
            let key = m.key();
            if page_keys.contains(&key) {
                producing.entry(key).or_default().push(m);
            }
        }

        let trace_ids: Vec<TraceId> =
            distinct(producing.values().flatten().map(|m| m.trace_id.clone()));
        let option_ids: Vec<OptionsId> =
            distinct(producing.values().flatten().filter_map(|m| m.options_id.clone()));
        let trace_params = self.metadata.trace_params(self.traces(), &trace_ids).await?;
        let options_params = if option_ids.is_empty() {
            HashMap::new()
        } else {
            self.metadata
                .options_params(self.traces(), &option_ids)
                .await?
        };
        let rows = if trace_ids.is_empty() {
            Vec::new()
        } else {
            self.traces()
                .trace_history(&trace_ids, window.first_commit())
                .await?
        };
        let histories = align_histories(window, &trace_ids, rows);

        let mut history_keys: BTreeSet<GroupingDigest> = BTreeSet::new();
        for (key, producers) in &producing {
            for m in producers {
                let Some(history) = histories.get(&m.trace_id) else {
                    continue;
                };
                for digest in history.iter().flatten() {
                    history_keys.insert(GroupingDigest::new(key.grouping.clone(), digest.clone()));
                }
            }
        }
        let history_keys: Vec<GroupingDigest> = history_keys.into_iter().collect();
        let mut labels_by_grouping: HashMap<GroupingId, HashMap<Digest, Label>> = HashMap::new();
        let history_labels =
            effective_labels(self.expectations(), changelist, &history_keys).await?;
        for (key, label) in history_labels {
            labels_by_grouping
                .entry(key.grouping)
                .or_default()
                .insert(key.digest, label);
        }

        Ok(page
            .iter()
            .map(|resolved| {
                let producers = producing
                    .get(&resolved.key)
                    .map(Vec::as_slice)
                    .unwrap_or_default();
                let traces: Vec<(TraceId, Params)> =
                    distinct(producers.iter().map(|m| m.trace_id.clone()))
                        .into_iter()
                        .map(|id| {
                            let params = trace_params.get(&id).cloned().unwrap_or_default();
                            (id, params)
                        })
                        .collect();
                let mut paramset = ParamSet::new();
                for m in producers {
                    paramset.union(&observation_params(m, &trace_params, &options_params));
                }
                let mut labels = labels_by_grouping
                    .get(&resolved.key.grouping)
                    .cloned()
                    .unwrap_or_default();
                labels.insert(resolved.key.digest.clone(), resolved.label);

                SearchResult {
                    digest: resolved.key.digest.clone(),
                    grouping_id: resolved.key.grouping.clone(),
                    test: grouping_params
                        .get(&resolved.key.grouping)
                        .and_then(|params| params.get(PRIMARY_KEY_FIELD))
                        .cloned()
                        .unwrap_or_default(),
                    label: resolved.label,
                    paramset,
                    trace_group: build_trace_group(
                        &resolved.key.digest,
                        &traces,
                        &histories,
                        &labels,
                        window.len(),
                    ),
                    ref_diffs: resolved.ref_diffs.clone(),
                    closest_ref: resolved.closest_ref,
                }
            })
            .collect())
    }

    /// The (corpus, test) filter selecting every trace of a grouping.
    async fn grouping_filter(&self, grouping: &GroupingId) -> Result<(Params, TraceFilter)> {
        let params = self
            .metadata
            .grouping_params(self.traces(), std::slice::from_ref(grouping))
            .await?
            .remove(grouping)
            .ok_or_else(|| SearchError::NotFound(format!("grouping {grouping}")))?;
        let corpus = params
            .get(CORPUS_FIELD)
            .cloned()
            .ok_or_else(|| SearchError::NotFound(format!("corpus of grouping {grouping}")))?;
        let mut filter = TraceFilter::corpus(corpus);
        if let Some(test) = params.get(PRIMARY_KEY_FIELD) {
            filter.constraints.insert(PRIMARY_KEY_FIELD, test.clone());
        }
        filter.include_ignored = true;
        Ok((params, filter))
    }

    async fn digest_details(
        &self,
        grouping: &GroupingId,
        digest: &Digest,
        changelist: Option<&ChangelistScope>,
    ) -> Result<DigestDetails> {
        if let Some(scope) = changelist {
            validate_changelist(scope)?;
        }
        let window = self.window().await?;
        let (params, filter) = self.grouping_filter(grouping).await?;
        let key = GroupingDigest::new(grouping.clone(), digest.clone());

        let options = MatchOptions {
            changelist,
            include_digests_on_primary: true,
        };
        let matches: Vec<MatchResult> = self
            .matcher()
            .matches(&window, &filter, options)
            .await?
            .into_iter()
            .filter(|m| m.key() == key)
            .collect();
        if self.visibility.public_view() && matches.is_empty() {
            return Err(SearchError::NotFound(format!("digest {digest}")));
        }

        let label = effective_labels(self.expectations(), changelist, std::slice::from_ref(&key))
            .await?
            .remove(&key)
            .unwrap_or_default();
        let scope = ReferenceScope {
            constraints: ParamSet::new(),
            first_tile: window.first_tile(),
            metric: Metric::default(),
            changelist: changelist.cloned(),
            classification: self.visibility.classification(),
        };
        let resolved = self
            .resolver
            .resolve(&HashMap::from([(key.clone(), label)]), &scope)
            .await?
            .pop()
            .unwrap_or_else(|| ResolvedDigest {
                key,
                label,
                ref_diffs: Default::default(),
                closest_ref: None,
            });

        let grouping_params = HashMap::from([(grouping.clone(), params)]);
        let mut results = self
            .build_results(
                &window,
                std::slice::from_ref(&resolved),
                &matches,
                &grouping_params,
                changelist,
            )
            .await?;
        let result = results
            .pop()
            .ok_or_else(|| SearchError::NotFound(format!("digest {digest}")))?;
        Ok(DigestDetails {
            result,
            commits: window.commits().to_vec(),
        })
    }

    async fn digest_comparison(
        &self,
        grouping: &GroupingId,
        left: &Digest,
        right: &Digest,
        changelist: Option<&ChangelistScope>,
    ) -> Result<DigestComparison> {
        if let Some(scope) = changelist {
            validate_changelist(scope)?;
        }
        let metric = self
            .backends
            .diffs
            .metrics(std::slice::from_ref(left), std::slice::from_ref(right))
            .await?
            .into_iter()
            .find(|row| &row.left == left && &row.right == right)
            .ok_or_else(|| SearchError::NotFound(format!("diff {left} vs {right}")))?;

        let window = self.window().await?;
        let (_, filter) = self.grouping_filter(grouping).await?;
        let options = MatchOptions {
            changelist,
            include_digests_on_primary: true,
        };
        let matches = self.matcher().matches(&window, &filter, options).await?;
        if self.visibility.public_view() {
            for digest in [left, right] {
                if !matches.iter().any(|m| &m.digest == digest) {
                    return Err(SearchError::NotFound(format!("digest {digest}")));
                }
            }
        }

        let keys = [
            GroupingDigest::new(grouping.clone(), left.clone()),
            GroupingDigest::new(grouping.clone(), right.clone()),
        ];
        let labels = effective_labels(self.expectations(), changelist, &keys).await?;
        let trace_ids = distinct(matches.iter().map(|m| m.trace_id.clone()));
        let option_ids = distinct(matches.iter().filter_map(|m| m.options_id.clone()));
        let trace_params = self.metadata.trace_params(self.traces(), &trace_ids).await?;
        let options_params = if option_ids.is_empty() {
            HashMap::new()
        } else {
            self.metadata
                .options_params(self.traces(), &option_ids)
                .await?
        };

        let side = |key: &GroupingDigest| {
            let mut paramset = ParamSet::new();
            for m in matches.iter().filter(|m| m.digest == key.digest) {
                paramset.union(&observation_params(m, &trace_params, &options_params));
            }
            DigestSide {
                digest: key.digest.clone(),
                label: labels.get(key).copied().unwrap_or_default(),
                paramset,
            }
        };
        Ok(DigestComparison {
            grouping_id: grouping.clone(),
            left: side(&keys[0]),
            right: side(&keys[1]),
            metric,
        })
    }

    /// Observations untriaged at head, from the corpus snapshot when one
    /// matches the window. Snapshot labels are rechecked since triage may
    /// have happened after the build.
    async fn untriaged_at_head(
        &self,
        window: &WindowContext,
        corpus: &str,
        include_ignored: bool,
    ) -> Result<Vec<MatchResult>> {
        let matcher = self.matcher();
        let candidates = match matcher.snapshot_untriaged(window, corpus, include_ignored) {
            Some(candidates) => candidates,
            None => {
                let mut filter = TraceFilter::corpus(corpus).at_head();
                filter.include_ignored = include_ignored;
                matcher
                    .matches(window, &filter, MatchOptions::default())
                    .await?
            }
        };
        let keys = distinct(candidates.iter().map(MatchResult::key));
        let labels = effective_labels(self.expectations(), None, &keys).await?;
        Ok(candidates
            .into_iter()
            .filter(|m| labels.get(&m.key()).copied().unwrap_or_default() == Label::Untriaged)
            .collect())
    }

    async fn blame_in_window(
        &self,
        window: &WindowContext,
        corpus: &str,
        include_ignored: bool,
    ) -> Result<BlameSummary> {
        let untriaged = self
            .untriaged_at_head(window, corpus, include_ignored)
            .await?;
        BlameEngine {
            store: Arc::clone(&self.backends.traces),
            metadata: &self.metadata,
            batch_size: self.config.history_batch_size,
            max_concurrent: self.config.max_concurrent_groupings,
        }
        .summarize(window, corpus, &untriaged)
        .await
    }

    async fn blame(&self, corpus: &str) -> Result<BlameSummary> {
        TraceFilter::corpus(corpus).validate()?;
        let window = self.window().await?;
        self.blame_in_window(&window, corpus, false).await
    }

    async fn cluster(&self, filter: &TraceFilter, labels: LabelFilter) -> Result<ClusterResponse> {
        filter.validate()?;
        if !filter.constraints.contains_key(PRIMARY_KEY_FIELD) {
            return Err(SearchError::InvalidFilter(format!(
                "cluster requires a {PRIMARY_KEY_FIELD:?} constraint"
            )));
        }
        let window = self.window().await?;
        let matches = self
            .matcher()
            .matches(&window, filter, MatchOptions::default())
            .await?;
        let keys = distinct(matches.iter().map(MatchResult::key));
        let key_labels = effective_labels(self.expectations(), None, &keys).await?;
        let matches: Vec<MatchResult> = matches
            .into_iter()
            .filter(|m| labels.accepts(key_labels.get(&m.key()).copied().unwrap_or_default()))
            .collect();

        let trace_ids = distinct(matches.iter().map(|m| m.trace_id.clone()));
        let option_ids = distinct(matches.iter().filter_map(|m| m.options_id.clone()));
        let trace_params = self.metadata.trace_params(self.traces(), &trace_ids).await?;
        let options_params = if option_ids.is_empty() {
            HashMap::new()
        } else {
            self.metadata
                .options_params(self.traces(), &option_ids)
                .await?
        };
        build_cluster(
            self.backends.diffs.as_ref(),
            &matches,
            &key_labels,
            &trace_params,
            &options_params,
        )
        .await
    }

    async fn paramset(&self) -> Result<ParamSet> {
        let window = self.window().await?;
        let sets = primary_paramsets(self.traces(), &self.metadata, &window).await?;
        Ok(visible_union(&sets, &self.visibility.classification()))
    }

    async fn changelist_paramset(&self, scope: &ChangelistScope) -> Result<ParamSet> {
        validate_changelist(scope)?;
        let sets = changelist_paramsets(self.traces(), &self.metadata, scope).await?;
        Ok(visible_union(&sets, &self.visibility.classification()))
    }

    async fn count_digests_by_test(&self, filter: &TraceFilter) -> Result<Vec<TestCounts>> {
        filter.validate()?;
        let window = self.window().await?;
        let matches = self
            .matcher()
            .matches(&window, filter, MatchOptions::default())
            .await?;
        let keys = distinct(matches.iter().map(MatchResult::key));
        let labels = effective_labels(self.expectations(), None, &keys).await?;
        let groupings = distinct(keys.iter().map(|key| key.grouping.clone()));
        let grouping_params = self
            .metadata
            .grouping_params(self.traces(), &groupings)
            .await?;
        Ok(count_by_grouping(&labels, &grouping_params))
    }

    async fn status_overview(&self) -> Result<StatusOverview> {
        let window = self.window().await?;
        let mut corpora = Vec::new();
        for corpus in self.visibility.classification().corpora() {
            let untriaged = self.untriaged_at_head(&window, &corpus, false).await?;
            let untriaged_count = untriaged
                .iter()
                .map(MatchResult::key)
                .collect::<BTreeSet<_>>()
                .len();
            corpora.push(CorpusStatus {
                ok: untriaged_count == 0,
                untriaged_count,
                corpus,
            });
        }
        Ok(StatusOverview {
            last_commit: window.commits().last().map(|commit| commit.id.clone()),
            corpora,
        })
    }
}
