/*!
Query and analysis engine over visual-diff test results.

[`SearchEngine`] answers searches over the window of recent commits,
resolves each result's closest positive and negative references, builds
per-trace histories for display, and attributes untriaged digests to the
commit ranges that introduced them. Reads go through the store traits of
`vdiff_trace_store`; background refreshers keep the visibility caches and
per-corpus head snapshots warm.
*/

mod blame;
mod cache;
mod closest;
mod cluster;
mod config;
mod counts;
mod engine;
mod error;
mod fanout;
mod history;
mod labels;
mod matcher;
mod metadata;
mod paramset;
mod query;
mod refresh;
mod result;
mod snapshot;
mod window;

pub use blame::BlameInterval;
pub use blame::BlameStart;
pub use blame::merge_intervals;
pub use blame::trace_interval;
pub use config::SearchConfig;
pub use engine::Backends;
pub use engine::SearchEngine;
pub use error::Result;
pub use error::SearchError;
pub use history::DigestPalette;
pub use history::MAX_DISTINCT_DIGESTS;
pub use history::assign_digest_indices;
pub use matcher::MatchResult;
pub use matcher::MatchSource;
pub use query::LabelFilter;
pub use query::Metric;
pub use query::RgbaBand;
pub use query::RightFilter;
pub use query::SearchQuery;
pub use query::SortOrder;
pub use query::TraceFilter;
pub use result::AffectedGrouping;
pub use result::BlameEntry;
pub use result::BlameSummary;
pub use result::BulkTriageDeltaInfo;
pub use result::CacheStatus;
pub use result::ClusterLink;
pub use result::ClusterNode;
pub use result::ClusterResponse;
pub use result::CorpusStatus;
pub use result::DigestComparison;
pub use result::DigestDetails;
pub use result::DigestSide;
pub use result::DigestStatus;
pub use result::RefDiff;
pub use result::RefDiffs;
pub use result::RefLabel;
pub use result::RefresherStatus;
pub use result::SearchResponse;
pub use result::SearchResult;
pub use result::SnapshotStatus;
pub use result::StatusOverview;
pub use result::TestCounts;
pub use result::Trace;
pub use result::TraceGroup;
pub use window::WindowContext;
