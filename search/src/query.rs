use crate::error::Result;
use crate::error::SearchError;
use serde::Deserialize;
use serde::Serialize;
use vdiff_trace_store::ChangelistScope;
use vdiff_trace_store::DiffMetric;
use vdiff_trace_store::Label;
use vdiff_trace_store::ParamSet;

/// Which traces a request is about.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TraceFilter {
    pub corpus: String,
    #[serde(default)]
    pub constraints: ParamSet,
    #[serde(default)]
    pub include_ignored: bool,
    /// Only the newest observation of each trace instead of the whole window.
    #[serde(default)]
    pub at_head_only: bool,
}

impl TraceFilter {
    pub fn corpus(corpus: impl Into<String>) -> Self {
        Self {
            corpus: corpus.into(),
            ..Default::default()
        }
    }

    pub fn with(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.constraints.insert(key, value);
        self
    }

    pub fn at_head(mut self) -> Self {
        self.at_head_only = true;
        self
    }

    pub fn validate(&self) -> Result<()> {
        if self.corpus.trim().is_empty() {
            return Err(SearchError::InvalidFilter("corpus is required".to_string()));
        }
        validate_value("corpus", &self.corpus)?;
        validate_constraints(&self.constraints)
    }
}

/// Which labels a request wants back.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct LabelFilter {
    #[serde(default)]
    pub positive: bool,
    #[serde(default)]
    pub negative: bool,
    #[serde(default = "default_true")]
    pub untriaged: bool,
}

fn default_true() -> bool {
    true
}

impl Default for LabelFilter {
    fn default() -> Self {
        Self {
            positive: false,
            negative: false,
            untriaged: true,
        }
    }
}

impl LabelFilter {
    pub fn all() -> Self {
        Self {
            positive: true,
            negative: true,
            untriaged: true,
        }
    }

    pub fn accepts(self, label: Label) -> bool {
        match label {
            Label::Positive => self.positive,
            Label::Negative => self.negative,
            Label::Untriaged => self.untriaged,
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    #[default]
    Ascending,
    Descending,
}

/// Which diff metric drives reference selection and ordering.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Metric {
    #[default]
    Combined,
    Percent,
}

impl Metric {
    pub fn value(self, metric: &DiffMetric) -> f32 {
        match self {
            Metric::Combined => metric.combined_metric,
            Metric::Percent => metric.percent_pixels_diff,
        }
    }
}

/// Inclusive bounds on the closest reference's max per-channel difference.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct RgbaBand {
    pub min: u8,
    pub max: u8,
}

impl Default for RgbaBand {
    fn default() -> Self {
        Self { min: 0, max: 255 }
    }
}

impl RgbaBand {
    pub fn new(min: u8, max: u8) -> Self {
        Self { min, max }
    }

    /// The full `[0, 255]` band filters nothing.
    pub fn is_active(self) -> bool {
        self.min > 0 || self.max < 255
    }

    pub fn contains(self, value: u8) -> bool {
        (self.min..=self.max).contains(&value)
    }
}

/// Restricts which digests are eligible as references.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct RightFilter {
    #[serde(default)]
    pub constraints: ParamSet,
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SearchQuery {
    pub filter: TraceFilter,
    #[serde(default)]
    pub labels: LabelFilter,
    #[serde(default)]
    pub right: RightFilter,
    #[serde(default)]
    pub must_have_reference: bool,
    #[serde(default)]
    pub sort: SortOrder,
    #[serde(default)]
    pub metric: Metric,
    #[serde(default)]
    pub rgba_band: RgbaBand,
    #[serde(default)]
    pub offset: usize,
    /// Zero means the configured default page size.
    #[serde(default)]
    pub limit: usize,
    #[serde(default)]
    pub changelist: Option<ChangelistScope>,
    /// Keep changelist digests that were already seen on the primary branch.
    #[serde(default)]
    pub include_digests_on_primary: bool,
    #[serde(default)]
    pub blame_id: Option<String>,
}

impl SearchQuery {
    pub fn new(filter: TraceFilter) -> Self {
        Self {
            filter,
            ..Default::default()
        }
    }

    /// Rejects malformed input before anything reaches the store.
    pub fn validate(&self) -> Result<()> {
        self.filter.validate()?;
        validate_constraints(&self.right.constraints)?;
        if self.rgba_band.min > self.rgba_band.max {
            return Err(SearchError::InvalidFilter(format!(
                "rgba band [{}, {}] is empty",
                self.rgba_band.min, self.rgba_band.max
            )));
        }
        if let Some(scope) = &self.changelist {
            validate_changelist(scope)?;
        }
        if let Some(id) = &self.blame_id {
            validate_blame_id(id)?;
        }
        Ok(())
    }
}

pub(crate) fn validate_changelist(scope: &ChangelistScope) -> Result<()> {
    validate_value("changelist system", &scope.system)?;
    validate_value("changelist id", &scope.changelist_id)
}

fn validate_constraints(constraints: &ParamSet) -> Result<()> {
    for (key, values) in constraints.iter() {
        validate_key(key)?;
        if values.is_empty() {
            return Err(SearchError::InvalidFilter(format!(
                "key {key:?} has no values"
            )));
        }
        for value in values {
            validate_value(key, value)?;
        }
    }
    Ok(())
}

fn validate_key(key: &str) -> Result<()> {
    let valid = !key.is_empty()
        && key
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(SearchError::InvalidFilter(format!("invalid key {key:?}")))
    }
}

fn validate_value(key: &str, value: &str) -> Result<()> {
    let valid = !value.is_empty()
        && value
            .chars()
            .all(|c| !c.is_control() && !matches!(c, '\'' | '"' | '\\' | ';' | '`'));
    if valid {
        Ok(())
    } else {
        Err(SearchError::InvalidFilter(format!(
            "invalid value {value:?} for {key}"
        )))
    }
}

/// A blame range id is a single commit id or `start:end`.
fn validate_blame_id(id: &str) -> Result<()> {
    let mut parts = id.split(':');
    let valid = parts.clone().count() <= 2
        && parts.all(|part| {
            !part.is_empty()
                && part
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'))
        });
    if valid {
        Ok(())
    } else {
        Err(SearchError::InvalidFilter(format!("invalid blame id {id:?}")))
    }
}
