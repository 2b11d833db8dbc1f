use crate::error::Result;
use crate::error::SearchError;
use serde::Deserialize;
use serde::Serialize;
use std::path::Path;
use std::time::Duration;

/// Configuration for the search engine and its background refreshers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct SearchConfig {
    /// Number of most recent commits with data that make up the window
    #[serde(default = "default_window_length")]
    pub window_length: usize,

    /// Seconds between refreshes of the primary-branch digest set
    #[serde(default = "default_primary_refresh_secs")]
    pub primary_refresh_secs: u64,

    /// Seconds between ignore/visibility classification passes
    #[serde(default = "default_classification_refresh_secs")]
    pub classification_refresh_secs: u64,

    /// Seconds between rebuilds of the per-corpus head snapshots
    #[serde(default = "default_snapshot_refresh_secs")]
    pub snapshot_refresh_secs: u64,

    /// Corpora that get a materialized head snapshot
    #[serde(default)]
    pub snapshot_corpora: Vec<String>,

    /// How long a computed paramset summary stays valid
    #[serde(default = "default_paramset_ttl_secs")]
    pub paramset_ttl_secs: u64,

    #[serde(default = "default_paramset_cache_entries")]
    pub paramset_cache_entries: usize,

    #[serde(default = "default_trace_params_cache_size")]
    pub trace_params_cache_size: usize,

    #[serde(default = "default_options_params_cache_size")]
    pub options_params_cache_size: usize,

    #[serde(default = "default_grouping_params_cache_size")]
    pub grouping_params_cache_size: usize,

    /// Upper bound on concurrently running per-grouping sub-queries
    #[serde(default = "default_max_concurrent_groupings")]
    pub max_concurrent_groupings: usize,

    /// Traces per history request issued by the blame engine
    #[serde(default = "default_history_batch_size")]
    pub history_batch_size: usize,

    /// Restrict every response to publicly visible traces and corpora
    #[serde(default)]
    pub public_view: bool,

    #[serde(default = "default_page_size")]
    pub default_page_size: usize,

    #[serde(default = "default_max_page_size")]
    pub max_page_size: usize,
}

fn default_window_length() -> usize {
    100
}

fn default_primary_refresh_secs() -> u64 {
    60
}

fn default_classification_refresh_secs() -> u64 {
    300
}

fn default_snapshot_refresh_secs() -> u64 {
    120
}

fn default_paramset_ttl_secs() -> u64 {
    60
}

fn default_paramset_cache_entries() -> usize {
    64
}

fn default_trace_params_cache_size() -> usize {
    100_000
}

fn default_options_params_cache_size() -> usize {
    10_000
}

fn default_grouping_params_cache_size() -> usize {
    10_000
}

fn default_max_concurrent_groupings() -> usize {
    16
}

fn default_history_batch_size() -> usize {
    512
}

fn default_page_size() -> usize {
    50
}

fn default_max_page_size() -> usize {
    200
}

impl Default for SearchConfig {
    fn default() -> Self {
        Self {
            window_length: default_window_length(),
            primary_refresh_secs: default_primary_refresh_secs(),
            classification_refresh_secs: default_classification_refresh_secs(),
            snapshot_refresh_secs: default_snapshot_refresh_secs(),
            snapshot_corpora: Vec::new(),
            paramset_ttl_secs: default_paramset_ttl_secs(),
            paramset_cache_entries: default_paramset_cache_entries(),
            trace_params_cache_size: default_trace_params_cache_size(),
            options_params_cache_size: default_options_params_cache_size(),
            grouping_params_cache_size: default_grouping_params_cache_size(),
            max_concurrent_groupings: default_max_concurrent_groupings(),
            history_batch_size: default_history_batch_size(),
            public_view: false,
            default_page_size: default_page_size(),
            max_page_size: default_max_page_size(),
        }
    }
}

impl SearchConfig {
    /// Validate configuration
    pub fn validate(&self) -> std::result::Result<(), String> {
        if self.window_length == 0 {
            return Err("window_length must be > 0".to_string());
        }

        for (name, secs) in [
            ("primary_refresh_secs", self.primary_refresh_secs),
            ("classification_refresh_secs", self.classification_refresh_secs),
            ("snapshot_refresh_secs", self.snapshot_refresh_secs),
            ("paramset_ttl_secs", self.paramset_ttl_secs),
        ] {
            if secs == 0 {
                return Err(format!("{name} must be > 0"));
            }
        }

        for (name, size) in [
            ("paramset_cache_entries", self.paramset_cache_entries),
            ("trace_params_cache_size", self.trace_params_cache_size),
            ("options_params_cache_size", self.options_params_cache_size),
            ("grouping_params_cache_size", self.grouping_params_cache_size),
            ("max_concurrent_groupings", self.max_concurrent_groupings),
            ("history_batch_size", self.history_batch_size),
        ] {
            if size == 0 {
                return Err(format!("{name} must be > 0"));
            }
        }

        if self.default_page_size == 0 {
            return Err("default_page_size must be > 0".to_string());
        }

        if self.default_page_size > self.max_page_size {
            return Err(format!(
                "default_page_size ({}) cannot exceed max_page_size ({})",
                self.default_page_size, self.max_page_size
            ));
        }

        if self.snapshot_corpora.iter().any(|corpus| corpus.trim().is_empty()) {
            return Err("snapshot_corpora cannot contain empty names".to_string());
        }

        Ok(())
    }

    /// Config for a deployment that only serves publicly visible data
    pub fn public() -> Self {
        Self {
            public_view: true,
            ..Default::default()
        }
    }

    /// Parse a TOML document; missing keys take their defaults.
    pub fn from_toml_str(text: &str) -> Result<Self> {
        let config: Self =
            toml::from_str(text).map_err(|err| SearchError::InvalidConfig(err.to_string()))?;
        config.validate().map_err(SearchError::InvalidConfig)?;
        Ok(config)
    }

    /// Load from a TOML file and apply `VDIFF_*` environment overrides.
    pub fn load(path: &Path) -> Result<Self> {
        let text = std::fs::read_to_string(path).map_err(|err| {
            SearchError::InvalidConfig(format!("failed to read {}: {err}", path.display()))
        })?;
        let config = Self::from_toml_str(&text)?.with_env_overrides();
        config.validate().map_err(SearchError::InvalidConfig)?;
        Ok(config)
    }

    pub fn with_env_overrides(self) -> Self {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Self {
        if let Some(length) = lookup("VDIFF_WINDOW_LENGTH")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            self.window_length = length;
        }
        if let Some(public) = lookup("VDIFF_PUBLIC_VIEW")
            .map(|value| value.trim().to_ascii_lowercase())
            .and_then(|value| match value.as_str() {
                "0" | "false" | "off" => Some(false),
                "1" | "true" | "on" => Some(true),
                _ => None,
            })
        {
            self.public_view = public;
        }
        if let Some(limit) = lookup("VDIFF_MAX_CONCURRENT_GROUPINGS")
            .and_then(|value| value.trim().parse::<usize>().ok())
            .filter(|value| *value > 0)
        {
            self.max_concurrent_groupings = limit;
        }
        if let Some(corpora) = lookup("VDIFF_SNAPSHOT_CORPORA") {
            self.snapshot_corpora = corpora
                .split(',')
                .map(str::trim)
                .filter(|corpus| !corpus.is_empty())
                .map(str::to_string)
                .collect();
        }
        self
    }

    pub fn primary_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.primary_refresh_secs)
    }

    pub fn classification_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.classification_refresh_secs)
    }

    pub fn snapshot_refresh_interval(&self) -> Duration {
        Duration::from_secs(self.snapshot_refresh_secs)
    }

    pub fn paramset_ttl(&self) -> Duration {
        Duration::from_secs(self.paramset_ttl_secs)
    }
}
