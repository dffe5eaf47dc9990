use thiserror::Error;

#[derive(Debug, Error)]
pub enum CoreError {
    #[error("serialization error: {0}")]
    Serialization(String),

    #[error("invalid path {path:?}: {reason}")]
    InvalidPath { path: String, reason: String },

    #[error("invalid pattern {pattern:?}: {reason}")]
    InvalidPattern { pattern: String, reason: String },

    #[error("invalid owner: user-scoped overlays require a non-empty owner")]
    InvalidOwner,

    #[error("invalid overlay: {0}")]
    InvalidOverlay(String),

    #[error("no open conflict at path: {0}")]
    UnknownConflict(String),
}
