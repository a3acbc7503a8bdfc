//! Scheduler error types.

use stackwatch_store::StoreError;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum RunnerError {
    #[error(transparent)]
    Store(#[from] StoreError),

    #[error(transparent)]
    Core(#[from] stackwatch_core::Error),

    #[error("failed to watch pending directory: {0}")]
    Watch(#[from] notify::Error),
}

impl RunnerError {
    /// Lost a race against a concurrent actor (see [`StoreError::is_race`]).
    pub fn is_race(&self) -> bool {
        matches!(self, RunnerError::Store(e) if e.is_race())
    }
}

pub type RunnerResult<T> = std::result::Result<T, RunnerError>;
