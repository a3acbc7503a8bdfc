//! Supervisor: owns the dispatcher and reaper tasks of one daemon.

use stackwatch_config::SystemConfig;
use stackwatch_executor::{LocalProcessExecutor, UnixProcessProbe};
use stackwatch_store::RecordStore;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::oneshot;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use crate::dispatcher::Dispatcher;
use crate::reaper::Reaper;
use crate::runner::{JobRunner, RunnerConfig};

/// Running dispatcher and reaper. Builds already running when the
/// supervisor shuts down are left alone; the next daemon's reaper
/// reconciles them.
pub struct Supervisor {
    runner: JobRunner,
    cancel: CancellationToken,
    tasks: Vec<JoinHandle<()>>,
}

impl Supervisor {
    /// Runner for this host: builds run through the configured shell,
    /// liveness is probed with signals.
    pub fn runner_for(config: &SystemConfig, store: Arc<RecordStore>) -> JobRunner {
        JobRunner::new(
            store,
            Arc::new(LocalProcessExecutor::new(&config.shell)),
            Arc::new(UnixProcessProbe),
            RunnerConfig::from(config),
        )
    }

    /// Spawn the dispatcher and the reaper.
    pub fn start(runner: JobRunner, reaper_interval: Duration) -> Self {
        let cancel = CancellationToken::new();

        let (scanned_tx, scanned_rx) = oneshot::channel();
        let dispatcher = Dispatcher::new(runner.clone()).on_scanned(scanned_tx);
        let dispatch_cancel = cancel.clone();
        let dispatch_task = tokio::spawn(async move {
            if let Err(e) = dispatcher.run(dispatch_cancel).await {
                error!(error = %e, "Dispatcher exited");
            }
        });

        // Requests left from before a restart belong to the startup scan,
        // so the first sweep waits for it. A dispatcher that failed to start
        // drops the sender and the reaper runs anyway.
        let reaper = Reaper::new(runner.clone(), reaper_interval);
        let reaper_cancel = cancel.clone();
        let reaper_task = tokio::spawn(async move {
            tokio::select! {
                _ = reaper_cancel.cancelled() => return,
                _ = scanned_rx => {}
            }
            reaper.run(reaper_cancel).await;
        });

        info!(interval_secs = reaper_interval.as_secs(), "Supervisor started");
        Self {
            runner,
            cancel,
            tasks: vec![dispatch_task, reaper_task],
        }
    }

    pub fn runner(&self) -> &JobRunner {
        &self.runner
    }

    /// Stop both loops and wait for them to return.
    pub async fn shutdown(self) {
        self.cancel.cancel();
        for task in self.tasks {
            let _ = task.await;
        }
        info!("Supervisor stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{FakeProbe, harness};
    use stackwatch_core::{JobStatus, StackName};

    #[tokio::test]
    async fn test_start_and_shutdown() {
        let h = harness("echo ok", Arc::new(FakeProbe::default())).await;
        h.add_project("web");
        let supervisor = Supervisor::start(h.runner.clone(), Duration::from_secs(30));
        tokio::time::sleep(Duration::from_millis(200)).await;

        supervisor
            .runner()
            .store()
            .submit(&StackName::new("web").unwrap())
            .await
            .unwrap();

        let mut done = false;
        for _ in 0..100 {
            let archived = h.store.list_archive().await.unwrap();
            if archived.iter().any(|r| r.status == JobStatus::Done) {
                done = true;
                break;
            }
            tokio::time::sleep(Duration::from_millis(100)).await;
        }
        assert!(done, "build was not archived as done");

        tokio::time::timeout(Duration::from_secs(5), supervisor.shutdown())
            .await
            .unwrap();
    }

    #[tokio::test]
    async fn test_request_from_before_restart_is_built() {
        for _ in 0..5 {
            let h = harness("echo ok", Arc::new(FakeProbe::default())).await;
            h.add_project("web");
            let name = StackName::new("web").unwrap();
            h.store.submit(&name).await.unwrap();

            // Older than one reaper interval, as after a long outage.
            let stale = std::time::SystemTime::now() - Duration::from_secs(120);
            std::fs::File::options()
                .write(true)
                .open(h.store.pending_path(&name))
                .unwrap()
                .set_modified(stale)
                .unwrap();

            let supervisor = Supervisor::start(h.runner.clone(), Duration::from_secs(30));
            let mut archived = Vec::new();
            for _ in 0..100 {
                archived = h.store.list_archive().await.unwrap();
                if !archived.is_empty() {
                    break;
                }
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
            supervisor.shutdown().await;

            assert_eq!(archived.len(), 1);
            assert_eq!(archived[0].status, JobStatus::Done);
        }
    }

    #[test]
    fn test_runner_for_config() {
        let config = stackwatch_config::parse_system_config(r#"build-command "make""#).unwrap();
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::new(dir.path().join("jobs"), dir.path().join("logs")));
        let runner = Supervisor::runner_for(&config, store.clone());
        assert!(Arc::ptr_eq(runner.store(), &store));
    }
}
