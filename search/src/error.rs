use thiserror::Error;
use vdiff_async_utils::CancelErr;
use vdiff_trace_store::StoreError;

#[derive(Error, Debug)]
pub enum SearchError {
    #[error("No commits with data in the window")]
    NoData,

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid filter: {0}")]
    InvalidFilter(String),

    #[error("Store error: {0}")]
    Store(#[from] StoreError),

    #[error("Operation cancelled")]
    Cancelled,

    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),

    #[error("Background task failed: {0}")]
    Task(String),
}

impl From<CancelErr> for SearchError {
    fn from(_: CancelErr) -> Self {
        SearchError::Cancelled
    }
}

pub type Result<T> = std::result::Result<T, SearchError>;
