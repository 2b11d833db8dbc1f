//! Background-refreshed visibility state.
//!
//! Every set lives behind its own `RwLock<Arc<_>>`. Readers clone the `Arc`
//! and drop the guard immediately; writers build the replacement off-lock
//! and hold the write guard only for the pointer swap.

use crate::error::Result;
use crate::window::WindowContext;
use chrono::DateTime;
use chrono::Utc;
use std::collections::BTreeSet;
use std::collections::HashSet;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::debug;
use vdiff_trace_store::CORPUS_FIELD;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::ParamsMatcher;
use vdiff_trace_store::TraceId;
use vdiff_trace_store::TraceStore;

/// (grouping, digest) pairs seen on the primary branch inside the window.
#[derive(Debug, Default)]
pub struct PrimaryDigests {
    digests: HashSet<GroupingDigest>,
    window_first_commit: Option<CommitId>,
    refreshed_at: Option<DateTime<Utc>>,
}

impl PrimaryDigests {
    pub fn contains(&self, key: &GroupingDigest) -> bool {
        self.digests.contains(key)
    }

    pub fn len(&self) -> usize {
        self.digests.len()
    }

    pub fn is_empty(&self) -> bool {
        self.digests.is_empty()
    }

    pub fn window_first_commit(&self) -> Option<&CommitId> {
        self.window_first_commit.as_ref()
    }

    pub fn refreshed_at(&self) -> Option<DateTime<Utc>> {
        self.refreshed_at
    }
}

/// Result of running the ignore and visibility matchers over every trace.
#[derive(Debug)]
pub struct TraceClassification {
    public_view: bool,
    loaded: bool,
    ignored: HashSet<TraceId>,
    visible_traces: HashSet<TraceId>,
    visible_corpora: BTreeSet<String>,
    corpora: BTreeSet<String>,
}

impl TraceClassification {
    pub(crate) fn empty(public_view: bool) -> Self {
        Self {
            public_view,
            loaded: false,
            ignored: HashSet::new(),
            visible_traces: HashSet::new(),
            visible_corpora: BTreeSet::new(),
            corpora: BTreeSet::new(),
        }
    }

    pub fn is_ignored(&self, trace: &TraceId) -> bool {
        self.ignored.contains(trace)
    }

    /// Public deployments hide everything until the first classification
    /// pass has completed.
    pub fn is_visible(&self, trace: &TraceId) -> bool {
        !self.public_view || (self.loaded && self.visible_traces.contains(trace))
    }

    pub fn is_corpus_visible(&self, corpus: &str) -> bool {
        !self.public_view || (self.loaded && self.visible_corpora.contains(corpus))
    }

    /// Corpora the caller may see.
    pub fn corpora(&self) -> Vec<String> {
        self.corpora
            .iter()
            .filter(|corpus| self.is_corpus_visible(corpus))
            .cloned()
            .collect()
    }

    pub fn ignored_count(&self) -> usize {
        self.ignored.len()
    }

    pub fn visible_count(&self) -> usize {
        self.visible_traces.len()
    }
}

pub struct VisibilityCache {
    public_view: bool,
    primary: RwLock<Arc<PrimaryDigests>>,
    classification: RwLock<Arc<TraceClassification>>,
}

impl VisibilityCache {
    pub fn new(public_view: bool) -> Self {
        Self {
            public_view,
            primary: RwLock::new(Arc::new(PrimaryDigests::default())),
            classification: RwLock::new(Arc::new(TraceClassification::empty(public_view))),
        }
    }

    pub fn public_view(&self) -> bool {
        self.public_view
    }

    pub fn digests_on_primary(&self) -> Arc<PrimaryDigests> {
        match self.primary.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn classification(&self) -> Arc<TraceClassification> {
        match self.classification.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    /// Recomputes the primary-branch digest set for the current window.
    pub async fn refresh_primary(&self, store: &dyn TraceStore, window_length: usize) -> Result<()> {
        let window = WindowContext::resolve(store, window_length).await?;
        let digests: HashSet<GroupingDigest> = store
            .digests_on_primary(window.first_tile())
            .await?
            .into_iter()
            .collect();
        debug!(
            digests = digests.len(),
            first_commit = %window.first_commit(),
            "refreshed primary-branch digests"
        );
        let next = Arc::new(PrimaryDigests {
            digests,
            window_first_commit: Some(window.first_commit().clone()),
            refreshed_at: Some(Utc::now()),
        });
        match self.primary.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }

    /// Re-evaluates ignore rules and, for public deployments, the visibility
    /// policy over every known trace.
    pub async fn refresh_classification(
        &self,
        store: &dyn TraceStore,
        ignore: &dyn ParamsMatcher,
        visibility: &dyn ParamsMatcher,
    ) -> Result<()> {
        let traces = store.all_traces().await?;
        let mut next = TraceClassification::empty(self.public_view);
        for (trace_id, params) in traces {
            let corpus = params.get(CORPUS_FIELD).cloned();
            if let Some(corpus) = &corpus {
                next.corpora.insert(corpus.clone());
            }
            if ignore.matches(&params) {
                next.ignored.insert(trace_id.clone());
            }
            if self.public_view && visibility.matches(&params) {
                next.visible_traces.insert(trace_id);
                if let Some(corpus) = corpus {
                    next.visible_corpora.insert(corpus);
                }
            }
        }
        next.loaded = true;
        debug!(
            corpora = next.corpora.len(),
            ignored = next.ignored.len(),
            visible = next.visible_traces.len(),
            "refreshed trace classification"
        );
        let next = Arc::new(next);
        match self.classification.write() {
            Ok(mut guard) => *guard = next,
            Err(poisoned) => *poisoned.into_inner() = next,
        }
        Ok(())
    }
}
