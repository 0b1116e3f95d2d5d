//! The unified error taxonomy surfaced at every external boundary of the core. Internal
//! plumbing keeps using `anyhow::Result` with `.context(...)`, exactly as the teacher does
//! throughout its engine; this enum only exists at the edges callers actually branch on.

use wharf_executor::PoolError;
use wharf_store::StoreError;

#[derive(Debug, thiserror::Error)]
pub enum WharfError {
    #[error("invalid request: {0}")]
    InvalidRequest(String),
    #[error("dependency error: {message}")]
    DependencyError { message: String, cycle: Option<Vec<String>> },
    #[error("not found: {0}")]
    NotFound(String),
    #[error("no backend has available capacity")]
    NoCapacity,
    #[error("no backend matches the requested arch/labels")]
    NoMatch,
    #[error("executor failure: {0}")]
    ExecutorFailure(String),
    #[error("storage failure: {0}")]
    StorageFailure(String),
    #[error("transient error: {0}")]
    Transient(String),
}

impl From<StoreError> for WharfError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::NotFound(id) => WharfError::NotFound(id),
            StoreError::DependencyError { message, cycle } => {
                WharfError::DependencyError { message, cycle: if cycle.is_empty() { None } else { Some(cycle) } }
            }
            StoreError::Transient(e) => WharfError::Transient(e.to_string()),
        }
    }
}

impl From<PoolError> for WharfError {
    fn from(err: PoolError) -> Self {
        match err {
            PoolError::NoCapacity => WharfError::NoCapacity,
            PoolError::NoMatch => WharfError::NoMatch,
            other => WharfError::InvalidRequest(other.to_string()),
        }
    }
}
