//! Materialized per-corpus head snapshots.
//!
//! Snapshots only accelerate at-head reads. A consumer takes one only when
//! it was built for the same window as its own request and otherwise goes
//! to the store directly.

use crate::error::Result;
use crate::labels::effective_labels;
use crate::result::SnapshotStatus;
use crate::window::WindowContext;
use chrono::DateTime;
use chrono::Utc;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::collections::HashMap;
use std::sync::Arc;
use std::sync::RwLock;
use tracing::debug;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::ExpectationStore;
use vdiff_trace_store::GroupingDigest;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::TraceObservation;
use vdiff_trace_store::TraceStore;

#[derive(Debug, Clone, PartialEq)]
pub struct HeadSnapshot {
    pub corpus: String,
    pub built_at: DateTime<Utc>,
    pub window_first_commit: CommitId,
    pub window_last_commit: CommitId,
    /// Newest observation of every trace in the corpus.
    pub traces_at_head: Vec<TraceObservation>,
    /// The subset of `traces_at_head` whose digest was untriaged at build time.
    pub untriaged_at_head: Vec<TraceObservation>,
}

impl HeadSnapshot {
    pub async fn build(
        store: &dyn TraceStore,
        expectations: &dyn ExpectationStore,
        window: &WindowContext,
        corpus: &str,
    ) -> Result<Self> {
        let query = window.trace_query(corpus, &ParamSet::new());
        let mut traces_at_head = store.values_at_head(&query).await?;
        traces_at_head.sort();

        let keys: Vec<GroupingDigest> = traces_at_head
            .iter()
            .map(|obs| GroupingDigest::new(obs.grouping_id.clone(), obs.digest.clone()))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        let labels = effective_labels(expectations, None, &keys).await?;
        let untriaged_at_head = traces_at_head
            .iter()
            .filter(|obs| {
                let key = GroupingDigest::new(obs.grouping_id.clone(), obs.digest.clone());
                labels.get(&key).copied().unwrap_or_default() == Label::Untriaged
            })
            .cloned()
            .collect();

        Ok(Self {
            corpus: corpus.to_string(),
            built_at: Utc::now(),
            window_first_commit: window.first_commit().clone(),
            window_last_commit: window.last_commit().clone(),
            traces_at_head,
            untriaged_at_head,
        })
    }

    pub fn matches_window(&self, window: &WindowContext) -> bool {
        &self.window_first_commit == window.first_commit()
            && &self.window_last_commit == window.last_commit()
    }
}

#[derive(Default)]
pub struct SnapshotStore {
    snapshots: RwLock<Arc<HashMap<String, Arc<HeadSnapshot>>>>,
}

impl SnapshotStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn current(&self) -> Arc<HashMap<String, Arc<HeadSnapshot>>> {
        match self.snapshots.read() {
            Ok(guard) => Arc::clone(&*guard),
            Err(poisoned) => Arc::clone(&*poisoned.into_inner()),
        }
    }

    pub fn get(&self, corpus: &str) -> Option<Arc<HeadSnapshot>> {
        self.current().get(corpus).cloned()
    }

    /// The corpus snapshot, provided it was built for `window`.
    pub fn for_window(&self, corpus: &str, window: &WindowContext) -> Option<Arc<HeadSnapshot>> {
        self.get(corpus)
            .filter(|snapshot| snapshot.matches_window(window))
    }

    pub fn install(&self, snapshot: HeadSnapshot) {
        debug!(
            corpus = %snapshot.corpus,
            traces = snapshot.traces_at_head.len(),
            untriaged = snapshot.untriaged_at_head.len(),
            "installing head snapshot"
        );
        let snapshot = Arc::new(snapshot);
        loop {
            let base = self.current();
            let mut next = (*base).clone();
            next.insert(snapshot.corpus.clone(), Arc::clone(&snapshot));

            let mut guard = match self.snapshots.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            // Another corpus was installed meanwhile; rebase onto it.
            if Arc::ptr_eq(&*guard, &base) {
                *guard = Arc::new(next);
                return;
            }
        }
    }

    /// Rebuilds the snapshot for one corpus against the current window.
    pub async fn rebuild(
        &self,
        store: &dyn TraceStore,
        expectations: &dyn ExpectationStore,
        window_length: usize,
        corpus: &str,
    ) -> Result<()> {
        let window = WindowContext::resolve(store, window_length).await?;
        let snapshot = HeadSnapshot::build(store, expectations, &window, corpus).await?;
        self.install(snapshot);
        Ok(())
    }

    pub fn statuses(&self) -> Vec<SnapshotStatus> {
        let current = self.current();
        let by_corpus: BTreeMap<&String, SnapshotStatus> = current
            .values()
            .map(|snapshot| {
                (
                    &snapshot.corpus,
                    SnapshotStatus {
                        corpus: snapshot.corpus.clone(),
                        built_at: snapshot.built_at,
                        window_first_commit: snapshot.window_first_commit.clone(),
                        window_last_commit: snapshot.window_last_commit.clone(),
                        traces_at_head: snapshot.traces_at_head.len(),
                        untriaged_at_head: snapshot.untriaged_at_head.len(),
                    },
                )
            })
            .collect();
        by_corpus.into_values().collect()
    }
}
