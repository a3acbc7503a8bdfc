//! Executor and process-probe traits.
//!
//! Executors start a stack's build command as a child process on this host
//! and hand back its pid together with a future that resolves on exit.

use async_trait::async_trait;
use futures::future::BoxFuture;
use std::collections::HashMap;
use std::path::PathBuf;

use crate::{JobStatus, Result, StackName};

/// Specification for one build run.
#[derive(Debug, Clone)]
pub struct BuildSpec {
    /// Stack being built.
    pub stack: StackName,
    /// Shell command line, run via `sh -c`.
    pub command: String,
    /// Project directory the command runs in.
    pub working_dir: PathBuf,
    /// Combined stdout/stderr are appended here.
    pub log_path: PathBuf,
    /// Extra environment variables.
    pub env: HashMap<String, String>,
}

/// How a build process ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum BuildExit {
    /// Exit status 0.
    Succeeded,
    /// Non-zero exit status, or terminated by a signal.
    Failed {
        exit_code: Option<i32>,
        signal: Option<i32>,
    },
    /// The process could not be waited on.
    Lost { message: String },
}

impl BuildExit {
    /// Terminal job status for this outcome.
    pub fn job_status(&self) -> JobStatus {
        match self {
            BuildExit::Succeeded => JobStatus::Done,
            BuildExit::Failed { .. } => JobStatus::DoneWithError,
            BuildExit::Lost { .. } => JobStatus::Error,
        }
    }

    pub fn describe(&self) -> String {
        match self {
            BuildExit::Succeeded => "exited with status 0".to_string(),
            BuildExit::Failed {
                exit_code: Some(code),
                ..
            } => format!("exited with status {}", code),
            BuildExit::Failed {
                signal: Some(signal),
                ..
            } => format!("terminated by signal {}", signal),
            BuildExit::Failed { .. } => "exited abnormally".to_string(),
            BuildExit::Lost { message } => format!("lost track of process: {}", message),
        }
    }
}

/// Handle to a spawned build.
pub struct BuildHandle {
    /// OS process id (also the process-group id).
    pub pid: u32,
    /// Drains the build's output into its log and resolves once the process
    /// has exited. Nothing is written to the log until this is first polled.
    pub exit: BoxFuture<'static, BuildExit>,
}

impl std::fmt::Debug for BuildHandle {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BuildHandle")
            .field("pid", &self.pid)
            .finish_non_exhaustive()
    }
}

/// Trait for build executors.
#[async_trait]
pub trait Executor: Send + Sync {
    /// Name of this executor.
    fn name(&self) -> &'static str;

    /// Spawn a build. Fails with [`crate::Error::ExecutionFailed`] when the
    /// process could not be created.
    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle>;
}

/// Host process control used for liveness checks and cancellation.
pub trait ProcessProbe: Send + Sync {
    /// Whether a process with this pid exists. Must have no side effects.
    fn is_alive(&self, pid: u32) -> bool;

    /// Best-effort termination request (SIGTERM to the process group).
    fn terminate(&self, pid: u32) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_exit_classification() {
        assert_eq!(BuildExit::Succeeded.job_status(), JobStatus::Done);
        assert_eq!(
            BuildExit::Failed {
                exit_code: Some(1),
                signal: None
            }
            .job_status(),
            JobStatus::DoneWithError
        );
        assert_eq!(
            BuildExit::Failed {
                exit_code: None,
                signal: Some(15)
            }
            .job_status(),
            JobStatus::DoneWithError
        );
        assert_eq!(
            BuildExit::Lost {
                message: "wait failed".to_string()
            }
            .job_status(),
            JobStatus::Error
        );
    }

    #[test]
    fn test_exit_description() {
        let exit = BuildExit::Failed {
            exit_code: Some(2),
            signal: None,
        };
        assert_eq!(exit.describe(), "exited with status 2");
    }
}
