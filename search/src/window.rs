use crate::error::Result;
use crate::error::SearchError;
use std::collections::HashMap;
use vdiff_trace_store::Commit;
use vdiff_trace_store::CommitId;
use vdiff_trace_store::CommitWithTile;
use vdiff_trace_store::ParamSet;
use vdiff_trace_store::TileId;
use vdiff_trace_store::TraceQuery;
use vdiff_trace_store::TraceStore;

/// The sliding window of recent commits a single request operates on.
///
/// Resolved once per request and passed by reference to every later stage,
/// so all stages agree on the same boundaries.
#[derive(Debug, Clone, PartialEq)]
pub struct WindowContext {
    /// Oldest first.
    commits: Vec<Commit>,
    tiles: Vec<TileId>,
    index: HashMap<CommitId, usize>,
    first_commit: CommitId,
    last_commit: CommitId,
}

impl WindowContext {
    /// Reads the most recent `length` commits with data.
    pub async fn resolve(store: &dyn TraceStore, length: usize) -> Result<Self> {
        let mut newest_first = store.recent_commits_with_data(length).await?;
        newest_first.truncate(length);
        newest_first.reverse();
        Self::from_commits(newest_first)
    }

    /// Builds a window from commits ordered oldest first.
    pub fn from_commits(commits: Vec<CommitWithTile>) -> Result<Self> {
        let (Some(first), Some(last)) = (commits.first(), commits.last()) else {
            return Err(SearchError::NoData);
        };
        let first_commit = first.commit.id.clone();
        let last_commit = last.commit.id.clone();
        let index = commits
            .iter()
            .enumerate()
            .map(|(i, c)| (c.commit.id.clone(), i))
            .collect();
        let (commits, tiles) = commits.into_iter().map(|c| (c.commit, c.tile)).unzip();
        Ok(Self {
            commits,
            tiles,
            index,
            first_commit,
            last_commit,
        })
    }

    pub fn commits(&self) -> &[Commit] {
        &self.commits
    }

    pub fn len(&self) -> usize {
        self.commits.len()
    }

    pub fn is_empty(&self) -> bool {
        self.commits.is_empty()
    }

    pub fn index_of(&self, commit: &CommitId) -> Option<usize> {
        self.index.get(commit).copied()
    }

    pub fn commit_at(&self, index: usize) -> Option<&Commit> {
        self.commits.get(index)
    }

    /// Earliest commit in the window; the store-level "as of" boundary.
    pub fn first_commit(&self) -> &CommitId {
        &self.first_commit
    }

    /// The newest commit of the window.
    pub fn last_commit(&self) -> &CommitId {
        &self.last_commit
    }

    /// Tile containing the earliest commit.
    pub fn first_tile(&self) -> TileId {
        self.tiles.first().copied().unwrap_or_default()
    }

    pub fn trace_query(&self, corpus: &str, constraints: &ParamSet) -> TraceQuery {
        TraceQuery {
            corpus: corpus.to_string(),
            constraints: constraints.clone(),
            first_commit: self.first_commit().clone(),
            first_tile: self.first_tile(),
        }
    }
}
