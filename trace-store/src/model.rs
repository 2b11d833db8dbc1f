use chrono::DateTime;
use chrono::Utc;
use serde::Deserialize;
use serde::Serialize;
use sha2::Digest as _;
use sha2::Sha256;
use std::collections::BTreeMap;
use std::collections::BTreeSet;
use std::fmt;

/// Key holding the corpus a trace belongs to.
pub const CORPUS_FIELD: &str = "source_type";

/// Key holding the test name; together with the corpus it forms the grouping.
pub const PRIMARY_KEY_FIELD: &str = "name";

/// Keys that make up a grouping, in canonical order.
pub const GROUPING_FIELDS: [&str; 2] = [PRIMARY_KEY_FIELD, CORPUS_FIELD];

macro_rules! string_id {
    ($(#[$meta:meta])* $name:ident) => {
        $(#[$meta])*
        #[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
        #[serde(transparent)]
        pub struct $name(String);

        impl $name {
            pub fn new(value: impl Into<String>) -> Self {
                Self(value.into())
            }

            pub fn as_str(&self) -> &str {
                &self.0
            }
        }

        impl fmt::Display for $name {
            fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
                f.write_str(&self.0)
            }
        }

        impl From<&str> for $name {
            fn from(value: &str) -> Self {
                Self(value.to_string())
            }
        }

        impl From<String> for $name {
            fn from(value: String) -> Self {
                Self(value)
            }
        }
    };
}

string_id!(
    /// Stable identity of a trace, derived from its full parameter map.
    TraceId
);
string_id!(
    /// Identity of a family of directly comparable traces.
    GroupingId
);
string_id!(
    /// Identity of an optional per-observation parameter map.
    OptionsId
);
string_id!(
    /// Content identity of a rendered image.
    Digest
);
string_id!(CommitId);

impl TraceId {
    pub fn from_params(params: &Params) -> Self {
        Self(hash_params(params))
    }
}

impl GroupingId {
    pub fn from_params(params: &Params) -> Self {
        Self(hash_params(&grouping_params(params)))
    }
}

impl OptionsId {
    pub fn from_params(params: &Params) -> Self {
        Self(hash_params(params))
    }
}

/// Coarse storage partition. Tiles never decrease along the commit order.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(transparent)]
pub struct TileId(pub u32);

pub type Params = BTreeMap<String, String>;

/// Extracts the canonical grouping subset of a trace's parameters.
pub fn grouping_params(params: &Params) -> Params {
    GROUPING_FIELDS
        .iter()
        .filter_map(|key| {
            params
                .get(*key)
                .map(|value| ((*key).to_string(), value.clone()))
        })
        .collect()
}

fn hash_params(params: &Params) -> String {
    let mut hasher = Sha256::new();
    for (key, value) in params {
        hasher.update(key.as_bytes());
        hasher.update([0u8]);
        hasher.update(value.as_bytes());
        hasher.update([0xffu8]);
    }
    hasher
        .finalize()
        .iter()
        .take(16)
        .map(|byte| format!("{byte:02x}"))
        .collect()
}

/// Key to a set of allowed values. Values within a key are alternatives,
/// separate keys must all be satisfied.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ParamSet(BTreeMap<String, BTreeSet<String>>);

impl ParamSet {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_params(params: &Params) -> Self {
        let mut set = Self::new();
        set.add_params(params);
        set
    }

    pub fn insert(&mut self, key: impl Into<String>, value: impl Into<String>) {
        self.0.entry(key.into()).or_default().insert(value.into());
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.insert(key, value);
        self
    }

    pub fn add_params(&mut self, params: &Params) {
        for (key, value) in params {
            self.insert(key.clone(), value.clone());
        }
    }

    pub fn union(&mut self, other: &ParamSet) {
        for (key, values) in &other.0 {
            self.0
                .entry(key.clone())
                .or_default()
                .extend(values.iter().cloned());
        }
    }

    pub fn get(&self, key: &str) -> Option<&BTreeSet<String>> {
        self.0.get(key)
    }

    pub fn remove(&mut self, key: &str) -> Option<BTreeSet<String>> {
        self.0.remove(key)
    }

    pub fn contains_key(&self, key: &str) -> bool {
        self.0.contains_key(key)
    }

    pub fn keys(&self) -> impl Iterator<Item = &String> {
        self.0.keys()
    }

    pub fn iter(&self) -> impl Iterator<Item = (&String, &BTreeSet<String>)> {
        self.0.iter()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    /// True when every key of the set is present in `params` with one of its
    /// allowed values.
    pub fn matches(&self, params: &Params) -> bool {
        self.0.iter().all(|(key, allowed)| {
            params
                .get(key)
                .is_some_and(|value| allowed.contains(value))
        })
    }
}

impl<K, V> FromIterator<(K, V)> for ParamSet
where
    K: Into<String>,
    V: Into<String>,
{
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        let mut set = Self::new();
        for (key, value) in iter {
            set.insert(key, value);
        }
        set
    }
}

/// Triage classification of a (grouping, digest) pair.
#[derive(
    Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize,
)]
#[serde(rename_all = "lowercase")]
pub enum Label {
    #[default]
    Untriaged,
    Positive,
    Negative,
}

impl fmt::Display for Label {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let text = match self {
            Label::Untriaged => "untriaged",
            Label::Positive => "positive",
            Label::Negative => "negative",
        };
        f.write_str(text)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct GroupingDigest {
    pub grouping: GroupingId,
    pub digest: Digest,
}

impl GroupingDigest {
    pub fn new(grouping: GroupingId, digest: Digest) -> Self {
        Self { grouping, digest }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Commit {
    pub id: CommitId,
    pub hash: String,
    pub timestamp: DateTime<Utc>,
    pub author: String,
    pub subject: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CommitWithTile {
    pub commit: Commit,
    pub tile: TileId,
}

/// One (trace, digest) observation, as returned by trace queries.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct TraceObservation {
    pub trace_id: TraceId,
    pub grouping_id: GroupingId,
    pub digest: Digest,
    #[serde(default)]
    pub options_id: Option<OptionsId>,
}

/// A single cell of a trace's history.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryRow {
    pub trace_id: TraceId,
    pub commit_id: CommitId,
    pub digest: Digest,
}

/// Precomputed comparison of two digests.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DiffMetric {
    pub left: Digest,
    pub right: Digest,
    pub num_pixels_diff: u64,
    pub percent_pixels_diff: f32,
    pub max_rgba_diffs: [u8; 4],
    pub combined_metric: f32,
    pub dimensions_differ: bool,
}

impl DiffMetric {
    pub fn max_channel_diff(&self) -> u8 {
        self.max_rgba_diffs.iter().copied().max().unwrap_or(0)
    }
}

/// Identifies a changelist in a code review system.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct ChangelistScope {
    pub system: String,
    pub changelist_id: String,
}

impl ChangelistScope {
    pub fn new(system: impl Into<String>, changelist_id: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            changelist_id: changelist_id.into(),
        }
    }
}

impl fmt::Display for ChangelistScope {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}", self.system, self.changelist_id)
    }
}

/// Store-level trace scan request. The window bounds are resolved by the
/// caller; the store only evaluates them.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TraceQuery {
    pub corpus: String,
    pub constraints: ParamSet,
    pub first_commit: CommitId,
    pub first_tile: TileId,
}
