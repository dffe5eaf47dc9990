use metalayer_core::{CoreError, ValidationError};
use metalayer_storage::StorageError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error("overlay {key} was modified concurrently: expected version {expected:?}, found {found:?}")]
    Conflict {
        key: String,
        expected: Option<u64>,
        found: Option<u64>,
    },

    #[error("not found: {0}")]
    NotFound(String),

    #[error("merge for {key} still has {count} unresolved conflict(s)")]
    UnresolvedConflicts { key: String, count: usize },

    #[error("configuration error: {0}")]
    Config(String),

    #[error(transparent)]
    Storage(StorageError),

    #[error(transparent)]
    Core(#[from] CoreError),
}

impl From<StorageError> for EngineError {
    fn from(err: StorageError) -> Self {
        match err {
            StorageError::VersionConflict {
                key,
                expected,
                found,
            } => Self::Conflict {
                key,
                expected,
                found,
            },
            StorageError::NotFound(what) => Self::NotFound(what),
            other => Self::Storage(other),
        }
    }
}
