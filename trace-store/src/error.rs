use thiserror::Error;

/// Errors surfaced by backing store implementations
#[derive(Debug, Error)]
pub enum StoreError {
    /// The store could not be reached
    #[error("Store unavailable: {0}")]
    Unavailable(String),

    /// A query was rejected or failed while running
    #[error("Query failed: {0}")]
    Query(String),

    /// Stored data could not be decoded
    #[error("Corrupt data: {0}")]
    Corrupt(String),
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
