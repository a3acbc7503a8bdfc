//! Host process control via POSIX signals.

use nix::errno::Errno;
use nix::sys::signal::{Signal, kill, killpg};
use nix::unistd::Pid;
use stackwatch_core::executor::ProcessProbe;
use stackwatch_core::{Error, Result};
use tracing::debug;

/// [`ProcessProbe`] backed by `kill(2)`.
#[derive(Debug, Clone, Copy, Default)]
pub struct UnixProcessProbe;

fn to_pid(pid: u32) -> Option<Pid> {
    i32::try_from(pid).ok().filter(|p| *p > 0).map(Pid::from_raw)
}

impl ProcessProbe for UnixProcessProbe {
    fn is_alive(&self, pid: u32) -> bool {
        let Some(pid) = to_pid(pid) else {
            return false;
        };
        // Signal 0 only checks existence and permission.
        match kill(pid, None) {
            Ok(()) => true,
            Err(Errno::EPERM) => true,
            Err(_) => false,
        }
    }

    /// SIGTERM to the process group led by `pid`, falling back to the
    /// process alone when it leads no group. A process that is already gone
    /// is not an error.
    fn terminate(&self, pid: u32) -> Result<()> {
        let Some(target) = to_pid(pid) else {
            return Err(Error::Process {
                pid,
                message: "not a valid pid".to_string(),
            });
        };

        let result = match killpg(target, Signal::SIGTERM) {
            Err(Errno::ESRCH) => kill(target, Signal::SIGTERM),
            other => other,
        };

        match result {
            Ok(()) => {
                debug!(pid, "Sent SIGTERM");
                Ok(())
            }
            Err(Errno::ESRCH) => {
                debug!(pid, "Process already gone");
                Ok(())
            }
            Err(errno) => Err(Error::Process {
                pid,
                message: errno.desc().to_string(),
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::os::unix::process::ExitStatusExt;

    #[test]
    fn test_own_process_is_alive() {
        assert!(UnixProcessProbe.is_alive(std::process::id()));
    }

    #[test]
    fn test_invalid_pids_are_dead() {
        assert!(!UnixProcessProbe.is_alive(0));
        assert!(!UnixProcessProbe.is_alive(u32::MAX));
        assert!(!UnixProcessProbe.is_alive(i32::MAX as u32));
    }

    #[tokio::test]
    async fn test_terminate_kills_process_group() {
        let mut child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg("sleep 30 & sleep 30")
            .process_group(0)
            .spawn()
            .unwrap();
        let pid = child.id().unwrap();
        assert!(UnixProcessProbe.is_alive(pid));

        UnixProcessProbe.terminate(pid).unwrap();
        let status = child.wait().await.unwrap();
        assert_eq!(status.signal(), Some(Signal::SIGTERM as i32));
        assert!(!UnixProcessProbe.is_alive(pid));
    }

    #[test]
    fn test_terminate_gone_process_is_ok() {
        assert!(UnixProcessProbe.terminate(i32::MAX as u32).is_ok());
        assert!(UnixProcessProbe.terminate(0).is_err());
    }
}
