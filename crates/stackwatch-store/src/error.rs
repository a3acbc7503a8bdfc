//! Store error types.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("not found: {0}")]
    NotFound(String),

    #[error("I/O error at {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to decode {path}: {source}")]
    Decode {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },

    #[error("failed to encode record: {0}")]
    Encode(#[from] serde_json::Error),

    #[error("pending record for {0} no longer matches")]
    Superseded(String),

    #[error("record for {0} has no run path")]
    MissingRunPath(String),

    #[error(transparent)]
    Core(#[from] stackwatch_core::Error),
}

impl StoreError {
    pub(crate) fn io(path: impl Into<PathBuf>, source: std::io::Error) -> Self {
        StoreError::Io {
            path: path.into(),
            source,
        }
    }

    /// A concurrent actor moved or replaced the record first. Callers treat
    /// this as a benign race, never as a failure.
    pub fn is_race(&self) -> bool {
        match self {
            StoreError::NotFound(_) | StoreError::Superseded(_) => true,
            StoreError::Io { source, .. } => source.kind() == std::io::ErrorKind::NotFound,
            _ => false,
        }
    }
}

pub type StoreResult<T> = std::result::Result<T, StoreError>;
