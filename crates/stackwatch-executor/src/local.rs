//! Local process executor.
//!
//! Runs the build command through the configured shell in the stack's
//! project directory. The child leads its own process group so the whole
//! build tree can be signalled at once. Standard output and standard error
//! are appended to the run's log as they arrive.

use async_trait::async_trait;
use futures::FutureExt;
use stackwatch_core::executor::*;
use stackwatch_core::{Error, Result};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::Stdio;
use std::time::Duration;
use tokio::fs::{File, OpenOptions};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWriteExt};
use tokio::process::{Child, Command};
use tokio::time::Instant;
use tracing::{debug, info, warn};

const READ_BUFFER: usize = 8 * 1024;

/// How long output is still copied once the build process has exited.
const DRAIN_GRACE: Duration = Duration::from_secs(2);

/// Executor that spawns builds as child processes of this host.
#[derive(Debug, Clone)]
pub struct LocalProcessExecutor {
    shell: PathBuf,
}

impl LocalProcessExecutor {
    pub fn new(shell: impl Into<PathBuf>) -> Self {
        Self {
            shell: shell.into(),
        }
    }
}

impl Default for LocalProcessExecutor {
    fn default() -> Self {
        Self::new("/bin/sh")
    }
}

#[async_trait]
impl Executor for LocalProcessExecutor {
    fn name(&self) -> &'static str {
        "local"
    }

    async fn spawn(&self, spec: BuildSpec) -> Result<BuildHandle> {
        let log = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&spec.log_path)
            .await
            .map_err(|e| {
                Error::ExecutionFailed(format!(
                    "cannot open log {}: {}",
                    spec.log_path.display(),
                    e
                ))
            })?;

        let mut cmd = Command::new(&self.shell);
        cmd.arg("-c")
            .arg(&spec.command)
            .current_dir(&spec.working_dir)
            .envs(&spec.env)
            .env("STACKWATCH_STACK", spec.stack.as_str())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .process_group(0);

        let child = cmd.spawn().map_err(|e| {
            Error::ExecutionFailed(format!(
                "cannot start {} in {}: {}",
                self.shell.display(),
                spec.working_dir.display(),
                e
            ))
        })?;
        let pid = child
            .id()
            .ok_or_else(|| Error::ExecutionFailed("process exited before start".to_string()))?;

        info!(stack = %spec.stack, pid, command = %spec.command, "Build process started");

        Ok(BuildHandle {
            pid,
            exit: supervise(child, log).boxed(),
        })
    }
}

/// Copy both output pipes into the log while waiting for the child. Output
/// still open after the child exits (a backgrounded process holding the
/// pipes) is copied for [`DRAIN_GRACE`] and then abandoned.
async fn supervise(mut child: Child, mut log: File) -> BuildExit {
    let pid = child.id();
    let mut stdout = child.stdout.take();
    let mut stderr = child.stderr.take();
    let mut out_buf = vec![0u8; READ_BUFFER];
    let mut err_buf = vec![0u8; READ_BUFFER];

    let mut status = None;
    let drain = tokio::time::sleep(Duration::MAX);
    tokio::pin!(drain);

    while status.is_none() || stdout.is_some() || stderr.is_some() {
        tokio::select! {
            read = read_some(&mut stdout, &mut out_buf), if stdout.is_some() => {
                match read {
                    Ok(0) | Err(_) => stdout = None,
                    Ok(n) => write_log(&mut log, &out_buf[..n]).await,
                }
            }
            read = read_some(&mut stderr, &mut err_buf), if stderr.is_some() => {
                match read {
                    Ok(0) | Err(_) => stderr = None,
                    Ok(n) => write_log(&mut log, &err_buf[..n]).await,
                }
            }
            result = child.wait(), if status.is_none() => {
                status = Some(result);
                drain.as_mut().reset(Instant::now() + DRAIN_GRACE);
            }
            _ = &mut drain, if status.is_some() => {
                debug!(pid = ?pid, "Output still open after exit, detaching");
                break;
            }
        }
    }

    let exit = match status {
        Some(Ok(status)) if status.success() => BuildExit::Succeeded,
        Some(Ok(status)) => BuildExit::Failed {
            exit_code: status.code(),
            signal: status.signal(),
        },
        Some(Err(e)) => BuildExit::Lost {
            message: e.to_string(),
        },
        None => BuildExit::Lost {
            message: "process was not waited for".to_string(),
        },
    };
    debug!(pid = ?pid, outcome = %exit.describe(), "Build process exited");
    exit
}

async fn read_some<R: AsyncRead + Unpin>(
    pipe: &mut Option<R>,
    buf: &mut [u8],
) -> std::io::Result<usize> {
    match pipe {
        Some(pipe) => pipe.read(buf).await,
        None => Ok(0),
    }
}

async fn write_log(log: &mut File, bytes: &[u8]) {
    let result = async {
        log.write_all(bytes).await?;
        log.flush().await
    };
    if let Err(e) = result.await {
        warn!(error = %e, "Failed to write build output");
    }
}
