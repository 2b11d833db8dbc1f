/*!
Data model and storage seams for the visual-diff query engine.

The engine reads traces, triage labels and precomputed diff metrics through
the async traits in this crate. [`InMemoryStore`] implements all of them and
is what the engine's tests run against.
*/

mod error;
mod matcher;
mod memory;
mod model;
mod store;

pub use error::StoreError;
pub use error::StoreResult;
pub use matcher::ParamsMatcher;
pub use matcher::RuleSetMatcher;
pub use memory::InMemoryStore;
pub use model::CORPUS_FIELD;
pub use model::ChangelistScope;
pub use model::Commit;
pub use model::CommitId;
pub use model::CommitWithTile;
pub use model::DiffMetric;
pub use model::Digest;
pub use model::GROUPING_FIELDS;
pub use model::GroupingDigest;
pub use model::GroupingId;
pub use model::HistoryRow;
pub use model::Label;
pub use model::OptionsId;
pub use model::PRIMARY_KEY_FIELD;
pub use model::ParamSet;
pub use model::Params;
pub use model::TileId;
pub use model::TraceId;
pub use model::TraceObservation;
pub use model::TraceQuery;
pub use model::grouping_params;
pub use store::DiffMetricStore;
pub use store::ExpectationStore;
pub use store::TraceStore;
