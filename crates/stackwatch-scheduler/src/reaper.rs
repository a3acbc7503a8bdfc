//! Reaper: periodic reconciliation of pending records with live processes.
//!
//! The only path by which a run whose process vanished without a finalize
//! (daemon restart, host reboot, OOM kill) leaves the pending store.

use chrono::Utc;
use stackwatch_core::{JobRecord, JobStatus};
use std::time::{Duration, SystemTime};
use tokio::time::MissedTickBehavior;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::runner::JobRunner;
use crate::RunnerResult;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct SweepReport {
    pub inspected: usize,
    pub reaped: usize,
}

pub struct Reaper {
    runner: JobRunner,
    interval: Duration,
}

impl Reaper {
    pub fn new(runner: JobRunner, interval: Duration) -> Self {
        Self { runner, interval }
    }

    /// Sweep every `interval` until cancelled. The first sweep runs at once.
    pub async fn run(self, cancel: CancellationToken) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                _ = ticker.tick() => match self.sweep().await {
                    Ok(report) if report.reaped > 0 => {
                        info!(inspected = report.inspected, reaped = report.reaped, "Reaper sweep");
                    }
                    Ok(_) => {}
                    Err(e) => warn!(error = %e, "Reaper sweep failed"),
                },
            }
        }
        info!("Reaper stopped");
    }

    /// One pass over the pending store. Idempotent: records archived by an
    /// earlier pass, or concurrently by someone else, are not touched again.
    pub async fn sweep(&self) -> RunnerResult<SweepReport> {
        let mut report = SweepReport::default();

        for record in self.runner.store().list_pending().await? {
            report.inspected += 1;
            if self.keep(&record).await {
                continue;
            }
            match self.reap(record).await {
                Ok(true) => report.reaped += 1,
                Ok(false) => {}
                Err(e) if e.is_race() => debug!(error = %e, "Reap lost a race"),
                Err(e) => warn!(error = %e, "Failed to reap record"),
            }
        }

        Ok(report)
    }

    async fn keep(&self, record: &JobRecord) -> bool {
        // Liveness wins over whatever `status` claims.
        if let Some(pid) = record.pid {
            if self.runner.probe().is_alive(pid) {
                return true;
            }
        }
        if let Some(run_path) = &record.run_path {
            if self.runner.is_supervised(run_path).await {
                return true;
            }
        }
        if record.status == JobStatus::Pending {
            // Requests get one interval to be picked up by the dispatcher.
            return self.is_recent(record).await;
        }
        false
    }

    async fn is_recent(&self, record: &JobRecord) -> bool {
        match self.runner.store().pending_modified(&record.name).await {
            Ok(modified) => SystemTime::now()
                .duration_since(modified)
                .map(|age| age < self.interval)
                .unwrap_or(true),
            Err(_) => true,
        }
    }

    /// Mark `record` killed and archive it, unless it changed since listing.
    async fn reap(&self, listed: JobRecord) -> RunnerResult<bool> {
        let store = self.runner.store();
        let mut record = store.get(&listed.name).await?;
        if record != listed {
            debug!(stack = %record.name, "Record changed since listing, skipping");
            return Ok(false);
        }

        let run_path = match record.run_path.clone() {
            Some(run_path) => run_path,
            None => {
                let run_path = store.allocate_run_path(&record.name, Utc::now()).await?;
                record.assign_run(run_path.clone());
                run_path
            }
        };
        let message = match record.pid {
            Some(pid) => format!("build killed: process {} no longer exists", pid),
            None => "build killed: request was never started".to_string(),
        };
        store.append_log(&run_path.log_path(), &message).await?;

        let pid = record.pid;
        record.mark_terminal(JobStatus::Killed);
        store.put(&record).await?;
        store.archive(&record).await?;

        info!(stack = %record.name, pid = ?pid, run = %run_path, "Reaped orphaned record");
        Ok(true)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::runner::tests::{FakeProbe, harness};
    use stackwatch_core::StackName;
    use std::sync::Arc;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    #[tokio::test]
    async fn test_dead_pid_is_reaped_once() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        let run = h.store.allocate_run_path(&name("web"), Utc::now()).await.unwrap();
        let mut record = JobRecord::new(name("web"));
        record.assign_run(run.clone());
        record.mark_running(999_999);
        h.store.put(&record).await.unwrap();

        let reaper = Reaper::new(h.runner.clone(), Duration::from_secs(30));
        let first = reaper.sweep().await.unwrap();
        assert_eq!(first, SweepReport { inspected: 1, reaped: 1 });

        let archived = h.store.get_archived(run.stem()).await.unwrap();
        assert_eq!(archived.status, JobStatus::Killed);
        assert_eq!(archived.pid, None);
        let log = std::fs::read_to_string(run.log_path()).unwrap();
        assert!(log.contains("no longer exists"));

        let second = reaper.sweep().await.unwrap();
        assert_eq!(second, SweepReport::default());
        assert_eq!(h.store.list_archive().await.unwrap().len(), 1);
    }

    #[tokio::test]
    async fn test_live_pid_is_kept_despite_status() {
        let probe = Arc::new(FakeProbe::default());
        probe.alive.lock().unwrap().insert(777);
        let h = harness("true", probe).await;

        let mut record = JobRecord::new(name("web"));
        record.status = JobStatus::Done; // corrupted
        record.pid = Some(777);
        h.store.put(&record).await.unwrap();

        let reaper = Reaper::new(h.runner.clone(), Duration::from_secs(30));
        let report = reaper.sweep().await.unwrap();
        assert_eq!(report, SweepReport { inspected: 1, reaped: 0 });
        assert_eq!(h.store.get(&name("web")).await.unwrap(), record);
    }

    #[tokio::test]
    async fn test_fresh_request_waits_for_dispatch() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        h.store.submit(&name("web")).await.unwrap();

        let patient = Reaper::new(h.runner.clone(), Duration::from_secs(30));
        assert_eq!(patient.sweep().await.unwrap().reaped, 0);

        tokio::time::sleep(Duration::from_millis(50)).await;
        let impatient = Reaper::new(h.runner.clone(), Duration::from_millis(10));
        assert_eq!(impatient.sweep().await.unwrap().reaped, 1);

        let archived = h.store.list_archive().await.unwrap();
        assert_eq!(archived[0].status, JobStatus::Killed);
        assert!(archived[0].run_path.is_some());
    }

    #[tokio::test]
    async fn test_supervised_run_is_kept() {
        let h = harness("sleep 2", Arc::new(FakeProbe::default())).await;
        h.add_project("web");
        h.store.submit(&name("web")).await.unwrap();
        let crate::runner::DispatchOutcome::Started(build) =
            h.runner.dispatch(&name("web")).await.unwrap()
        else {
            panic!("expected a started build");
        };

        // The fake probe reports every pid dead; only the registry protects the run.
        let reaper = Reaper::new(h.runner.clone(), Duration::from_millis(1));
        assert_eq!(reaper.sweep().await.unwrap().reaped, 0);

        let outcome = build.completion.await.unwrap();
        assert_eq!(
            outcome,
            crate::runner::FinalizeOutcome::Archived(JobStatus::Done)
        );
    }

    #[tokio::test]
    async fn test_run_stops_on_cancel() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        let cancel = CancellationToken::new();
        let task = tokio::spawn(Reaper::new(h.runner.clone(), Duration::from_secs(30)).run(cancel.clone()));
        cancel.cancel();
        tokio::time::timeout(Duration::from_secs(5), task)
            .await
            .unwrap()
            .unwrap();
    }
}
