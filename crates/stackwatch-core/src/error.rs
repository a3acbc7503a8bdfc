//! Error types for Stackwatch.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum Error {
    #[error("invalid stack name {name:?}: {reason}")]
    InvalidName { name: String, reason: &'static str },

    #[error("invalid run path: {0}")]
    InvalidRunPath(String),

    #[error("not found: {0}")]
    NotFound(String),

    #[error("execution failed: {0}")]
    ExecutionFailed(String),

    #[error("process control failed for pid {pid}: {message}")]
    Process { pid: u32, message: String },

    #[error("internal error: {0}")]
    Internal(String),
}

pub type Result<T> = std::result::Result<T, Error>;
