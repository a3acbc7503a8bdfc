//! Job runner: the per-trigger state machine.
//!
//! `DuplicateCheck → Reject | Dispatch → Run → Finalize → Archived`
//!
//! There is no lock around a stack's record. At most one live process per
//! stack is kept by killing the previous run before starting the next one,
//! and every step that finds the record moved on by someone else backs off
//! as a race loss.

use chrono::Utc;
use stackwatch_config::SystemConfig;
use stackwatch_core::executor::{BuildExit, BuildSpec, Executor, ProcessProbe};
use stackwatch_core::{JobRecord, JobStatus, RunPath, StackName};
use stackwatch_store::{RecordStore, StoreError};
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::{debug, error, info, warn};

use crate::{RunnerError, RunnerResult};

/// What the runner needs to know about the host.
#[derive(Debug, Clone)]
pub struct RunnerConfig {
    pub projects_root: PathBuf,
    pub build_command: String,
}

impl RunnerConfig {
    /// Project directory of a stack; its existence gates the build.
    pub fn project_dir(&self, name: &StackName) -> PathBuf {
        self.projects_root.join(name.as_str())
    }
}

impl From<&SystemConfig> for RunnerConfig {
    fn from(config: &SystemConfig) -> Self {
        Self {
            projects_root: config.projects_root.clone(),
            build_command: config.build_command.clone(),
        }
    }
}

/// Result of handling one trigger.
#[derive(Debug)]
pub enum DispatchOutcome {
    /// No pending request for the stack: already handled, archived, or not
    /// readable yet.
    Skipped,
    /// Project directory missing; archived as `error` without spawning.
    Rejected { archived: PathBuf },
    /// The build process could not be started; archived as `error`.
    SpawnFailed { archived: PathBuf },
    /// Build running under a supervisory task.
    Started(RunningBuild),
}

/// A build handed to its supervisory task.
#[derive(Debug)]
pub struct RunningBuild {
    pub pid: u32,
    pub run_path: RunPath,
    /// Resolves once the run has been finalized.
    pub completion: JoinHandle<FinalizeOutcome>,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FinalizeOutcome {
    Archived(JobStatus),
    /// The pending record no longer belonged to this run.
    RaceLost,
}

/// Drives triggers through the job state machine.
#[derive(Clone)]
pub struct JobRunner {
    store: Arc<RecordStore>,
    executor: Arc<dyn Executor>,
    probe: Arc<dyn ProcessProbe>,
    config: Arc<RunnerConfig>,
    supervised: Arc<Mutex<HashSet<RunPath>>>,
}

impl JobRunner {
    pub fn new(
        store: Arc<RecordStore>,
        executor: Arc<dyn Executor>,
        probe: Arc<dyn ProcessProbe>,
        config: RunnerConfig,
    ) -> Self {
        Self {
            store,
            executor,
            probe,
            config: Arc::new(config),
            supervised: Arc::new(Mutex::new(HashSet::new())),
        }
    }

    pub fn store(&self) -> &Arc<RecordStore> {
        &self.store
    }

    pub fn probe(&self) -> &Arc<dyn ProcessProbe> {
        &self.probe
    }

    /// Whether a supervisory task of this process still owns `run_path`.
    pub async fn is_supervised(&self, run_path: &RunPath) -> bool {
        self.supervised.lock().await.contains(run_path)
    }

    /// Handle the pending record of `name`. Only records in `pending`
    /// status are acted on, so status updates never re-trigger a build.
    pub async fn dispatch(&self, name: &StackName) -> RunnerResult<DispatchOutcome> {
        let mut record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_race() => {
                debug!(stack = %name, "Pending record vanished before dispatch");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(StoreError::Decode { path, source }) => {
                debug!(path = %path.display(), error = %source, "Pending record not decodable yet");
                return Ok(DispatchOutcome::Skipped);
            }
            Err(e) => return Err(e.into()),
        };
        if record.status != JobStatus::Pending {
            debug!(stack = %name, status = %record.status, "Record not pending, ignoring");
            return Ok(DispatchOutcome::Skipped);
        }

        if record.has_previous_run() {
            self.supersede(record).await?;
            record = JobRecord::new(name.clone());
            self.store.put(&record).await?;
        }

        let project_dir = self.config.project_dir(name);
        if !tokio::fs::metadata(&project_dir)
            .await
            .map(|m| m.is_dir())
            .unwrap_or(false)
        {
            let archived = self
                .fail(
                    record,
                    &format!("project directory {} does not exist", project_dir.display()),
                )
                .await?;
            warn!(stack = %name, dir = %project_dir.display(), "Rejected build: no project directory");
            return Ok(DispatchOutcome::Rejected { archived });
        }

        self.start(record, project_dir).await
    }

    /// DuplicateCheck: retire the run a newer trigger superseded.
    async fn supersede(&self, mut previous: JobRecord) -> RunnerResult<()> {
        if let Some(pid) = previous.pid {
            if self.probe.is_alive(pid) {
                info!(stack = %previous.name, pid, "Killing superseded build");
                if let Err(e) = self.probe.terminate(pid) {
                    warn!(stack = %previous.name, pid, error = %e, "Failed to signal superseded build");
                }
            }
        }

        let Some(run_path) = previous.run_path.clone() else {
            // Nothing was ever started for this request.
            return Ok(());
        };
        previous.mark_terminal(JobStatus::Killed);
        self.store
            .append_log(&run_path.log_path(), "build killed: superseded by a newer trigger")
            .await?;
        self.store.put(&previous).await?;
        match self.store.archive(&previous).await {
            Ok(_) => Ok(()),
            Err(e) if e.is_race() => {
                debug!(stack = %previous.name, run = %run_path, "Superseded run already archived");
                Ok(())
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Reject or spawn failure: archive as `error` with a diagnostic.
    async fn fail(&self, mut record: JobRecord, message: &str) -> RunnerResult<PathBuf> {
        let run_path = match record.run_path.clone() {
            Some(run_path) => run_path,
            None => {
                let run_path = self
                    .store
                    .allocate_run_path(&record.name, Utc::now())
                    .await?;
                record.assign_run(run_path.clone());
                run_path
            }
        };
        self.store.append_log(&run_path.log_path(), message).await?;
        record.mark_terminal(JobStatus::Error);
        self.store.put(&record).await?;
        Ok(self.store.archive(&record).await?)
    }

    async fn start(&self, mut record: JobRecord, project_dir: PathBuf) -> RunnerResult<DispatchOutcome> {
        let name = record.name.clone();
        let run_path = self.store.allocate_run_path(&name, Utc::now()).await?;
        record.assign_run(run_path.clone());
        let log_path = run_path.log_path();

        let spec = BuildSpec {
            stack: name.clone(),
            command: self.config.build_command.clone(),
            working_dir: project_dir,
            log_path: log_path.clone(),
            env: HashMap::from([(
                "STACKWATCH_LOG".to_string(),
                log_path.display().to_string(),
            )]),
        };

        self.supervised.lock().await.insert(run_path.clone());
        let handle = match self.executor.spawn(spec).await {
            Ok(handle) => handle,
            Err(e) => {
                self.supervised.lock().await.remove(&run_path);
                error!(stack = %name, error = %e, "Failed to start build");
                let archived = self
                    .fail(record, &format!("failed to start build: {}", e))
                    .await?;
                return Ok(DispatchOutcome::SpawnFailed { archived });
            }
        };

        let pid = handle.pid;
        record.mark_running(pid);
        if let Err(e) = self.store.put(&record).await {
            // Without a running record nobody could finalize or reap this build.
            let _ = self.probe.terminate(pid);
            self.supervised.lock().await.remove(&run_path);
            return Err(e.into());
        }
        info!(stack = %name, pid, run = %run_path, "Build running");

        let runner = self.clone();
        let task_run_path = run_path.clone();
        let completion = tokio::spawn(async move {
            let exit = handle.exit.await;
            let outcome = match runner.finalize(&name, &task_run_path, &exit).await {
                Ok(outcome) => outcome,
                Err(e) => {
                    error!(stack = %name, run = %task_run_path, error = %e, "Failed to finalize build");
                    FinalizeOutcome::RaceLost
                }
            };
            runner.supervised.lock().await.remove(&task_run_path);
            outcome
        });

        Ok(DispatchOutcome::Started(RunningBuild {
            pid,
            run_path,
            completion,
        }))
    }

    /// Record the exit of the build for `run_path` and archive it. A no-op
    /// when the pending record has moved on to another run or state.
    pub async fn finalize(
        &self,
        name: &StackName,
        run_path: &RunPath,
        exit: &BuildExit,
    ) -> RunnerResult<FinalizeOutcome> {
        let mut record = match self.store.get(name).await {
            Ok(record) => record,
            Err(e) if e.is_race() => {
                debug!(stack = %name, run = %run_path, "Record gone before finalize");
                return Ok(FinalizeOutcome::RaceLost);
            }
            Err(e) => return Err(e.into()),
        };
        if record.status != JobStatus::Running || record.run_path.as_ref() != Some(run_path) {
            debug!(stack = %name, run = %run_path, status = %record.status, "Run superseded before finalize");
            return Ok(FinalizeOutcome::RaceLost);
        }

        let status = exit.job_status();
        self.store
            .append_log(&run_path.log_path(), &format!("build {}", exit.describe()))
            .await?;
        record.mark_terminal(status);
        self.store.put(&record).await?;

        match self.store.archive(&record).await {
            Ok(_) => {
                info!(stack = %name, run = %run_path, status = %status, "Build finished");
                Ok(FinalizeOutcome::Archived(status))
            }
            Err(e) if e.is_race() => {
                debug!(stack = %name, run = %run_path, "Lost archive race");
                Ok(FinalizeOutcome::RaceLost)
            }
            Err(e) => Err(RunnerError::Store(e)),
        }
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stackwatch_executor::{LocalProcessExecutor, UnixProcessProbe};
    use std::path::Path;

    /// Probe with a scripted set of live pids.
    #[derive(Default)]
    pub(crate) struct FakeProbe {
        pub alive: std::sync::Mutex<HashSet<u32>>,
        pub terminated: std::sync::Mutex<Vec<u32>>,
    }

    impl ProcessProbe for FakeProbe {
        fn is_alive(&self, pid: u32) -> bool {
            self.alive.lock().unwrap().contains(&pid)
        }

        fn terminate(&self, pid: u32) -> stackwatch_core::Result<()> {
            self.alive.lock().unwrap().remove(&pid);
            self.terminated.lock().unwrap().push(pid);
            Ok(())
        }
    }

    pub(crate) struct Harness {
        pub dir: tempfile::TempDir,
        pub store: Arc<RecordStore>,
        pub runner: JobRunner,
    }

    pub(crate) async fn harness(command: &str, probe: Arc<dyn ProcessProbe>) -> Harness {
        let dir = tempfile::tempdir().unwrap();
        let store = Arc::new(RecordStore::new(
            dir.path().join("data/jobs"),
            dir.path().join("data/logs"),
        ));
        store.ensure_layout().await.unwrap();
        std::fs::create_dir_all(dir.path().join("projects")).unwrap();

        let runner = JobRunner::new(
            store.clone(),
            Arc::new(LocalProcessExecutor::default()),
            probe,
            RunnerConfig {
                projects_root: dir.path().join("projects"),
                build_command: command.to_string(),
            },
        );
        Harness { dir, store, runner }
    }

    impl Harness {
        pub fn add_project(&self, name: &str) {
            std::fs::create_dir_all(self.dir.path().join("projects").join(name)).unwrap();
        }
    }

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    fn archived(outcome: &DispatchOutcome) -> &Path {
        match outcome {
            DispatchOutcome::Rejected { archived } | DispatchOutcome::SpawnFailed { archived } => {
                archived
            }
            other => panic!("expected an archived outcome, got {:?}", other),
        }
    }

    async fn started(h: &Harness, stack: &str) -> RunningBuild {
        h.store.submit(&name(stack)).await.unwrap();
        match h.runner.dispatch(&name(stack)).await.unwrap() {
            DispatchOutcome::Started(build) => build,
            other => panic!("expected a started build, got {:?}", other),
        }
    }

    #[test]
    fn test_project_dir_joins_name() {
        let config = RunnerConfig {
            projects_root: PathBuf::from("/srv"),
            build_command: "make".to_string(),
        };
        assert_eq!(config.project_dir(&name("web")), PathBuf::from("/srv/web"));
    }

    #[tokio::test]
    async fn test_missing_project_dir_is_rejected() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        h.store.submit(&name("missing-stack")).await.unwrap();

        let outcome = h.runner.dispatch(&name("missing-stack")).await.unwrap();
        let path = archived(&outcome).to_path_buf();
        let record = h.store.get_archived(path.file_stem().unwrap().to_str().unwrap()).await.unwrap();

        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.pid, None);
        assert!(h.store.list_pending().await.unwrap().is_empty());
        let log = std::fs::read_to_string(record.log_path.unwrap()).unwrap();
        assert!(log.contains("does not exist"));
    }

    #[tokio::test]
    async fn test_successful_build_is_done() {
        let h = harness("echo compiled", Arc::new(UnixProcessProbe)).await;
        h.add_project("web");

        let build = started(&h, "web").await;
        let running = h.store.get(&name("web")).await.unwrap();
        assert_eq!(running.status, JobStatus::Running);
        assert_eq!(running.pid, Some(build.pid));

        let outcome = build.completion.await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Archived(JobStatus::Done));

        let record = h.store.get_archived(build.run_path.stem()).await.unwrap();
        assert_eq!(record.status, JobStatus::Done);
        assert_eq!(record.pid, None);
        let log = std::fs::read_to_string(build.run_path.log_path()).unwrap();
        assert!(log.starts_with("compiled\n"));
        assert!(!h.runner.is_supervised(&build.run_path).await);
    }

    #[tokio::test]
    async fn test_failing_build_is_done_with_error() {
        let h = harness("echo broken; exit 1", Arc::new(UnixProcessProbe)).await;
        h.add_project("web");

        let build = started(&h, "web").await;
        let outcome = build.completion.await.unwrap();
        assert_eq!(outcome, FinalizeOutcome::Archived(JobStatus::DoneWithError));

        let record = h.store.get_archived(build.run_path.stem()).await.unwrap();
        assert_eq!(record.status, JobStatus::DoneWithError);
        let log = std::fs::read_to_string(build.run_path.log_path()).unwrap();
        assert!(log.contains("broken"));
        assert!(log.contains("exited with status 1"));
    }

    #[tokio::test]
    async fn test_second_trigger_kills_first_run() {
        let h = harness("echo started; sleep 30", Arc::new(UnixProcessProbe)).await;
        h.add_project("web");

        let first = started(&h, "web").await;
        let second = started(&h, "web").await;
        assert_ne!(first.run_path, second.run_path);
        assert_eq!(h.store.list_pending().await.unwrap().len(), 1);

        assert_eq!(first.completion.await.unwrap(), FinalizeOutcome::RaceLost);
        let killed = h.store.get_archived(first.run_path.stem()).await.unwrap();
        assert_eq!(killed.status, JobStatus::Killed);
        assert_eq!(killed.pid, None);

        let current = h.store.get(&name("web")).await.unwrap();
        assert_eq!(current.status, JobStatus::Running);
        assert_eq!(current.pid, Some(second.pid));

        UnixProcessProbe.terminate(second.pid).unwrap();
        assert_eq!(
            second.completion.await.unwrap(),
            FinalizeOutcome::Archived(JobStatus::DoneWithError)
        );
        assert!(h.store.list_pending().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_spawn_failure_is_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut h = harness("true", Arc::new(FakeProbe::default())).await;
        h.runner = JobRunner::new(
            h.store.clone(),
            Arc::new(LocalProcessExecutor::new(dir.path().join("no-shell"))),
            Arc::new(FakeProbe::default()),
            RunnerConfig {
                projects_root: h.dir.path().join("projects"),
                build_command: "true".to_string(),
            },
        );
        h.add_project("web");
        h.store.submit(&name("web")).await.unwrap();

        let outcome = h.runner.dispatch(&name("web")).await.unwrap();
        assert!(matches!(outcome, DispatchOutcome::SpawnFailed { .. }));
        let path = archived(&outcome).to_path_buf();
        let record = h
            .store
            .get_archived(path.file_stem().unwrap().to_str().unwrap())
            .await
            .unwrap();
        assert_eq!(record.status, JobStatus::Error);
        assert_eq!(record.pid, None);
    }

    #[tokio::test]
    async fn test_non_pending_records_are_skipped() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        assert!(matches!(
            h.runner.dispatch(&name("ghost")).await.unwrap(),
            DispatchOutcome::Skipped
        ));

        let mut record = JobRecord::new(name("web"));
        record.status = JobStatus::Running;
        h.store.put(&record).await.unwrap();
        assert!(matches!(
            h.runner.dispatch(&name("web")).await.unwrap(),
            DispatchOutcome::Skipped
        ));
    }

    #[tokio::test]
    async fn test_finalize_of_foreign_run_is_race() {
        let h = harness("true", Arc::new(FakeProbe::default())).await;
        let foreign = h.store.allocate_run_path(&name("web"), Utc::now()).await.unwrap();
        let mine = h.store.allocate_run_path(&name("web"), Utc::now()).await.unwrap();

        let mut record = JobRecord::new(name("web"));
        record.assign_run(foreign);
        record.mark_running(42);
        h.store.put(&record).await.unwrap();

        let outcome = h
            .runner
            .finalize(&name("web"), &mine, &BuildExit::Succeeded)
            .await
            .unwrap();
        assert_eq!(outcome, FinalizeOutcome::RaceLost);
        assert_eq!(h.store.get(&name("web")).await.unwrap(), record);

        let gone = h
            .runner
            .finalize(&name("api"), &mine, &BuildExit::Succeeded)
            .await
            .unwrap();
        assert_eq!(gone, FinalizeOutcome::RaceLost);
    }

    #[tokio::test]
    async fn test_supersede_dead_previous_run() {
        let probe = Arc::new(FakeProbe::default());
        let h = harness("true", probe.clone()).await;
        h.add_project("web");

        let run = h.store.allocate_run_path(&name("web"), Utc::now()).await.unwrap();
        let mut stale = JobRecord::new(name("web"));
        stale.assign_run(run.clone());
        stale.pid = Some(4242);
        h.store.put(&stale).await.unwrap();

        let outcome = h.runner.dispatch(&name("web")).await.unwrap();
        let DispatchOutcome::Started(build) = outcome else {
            panic!("expected a started build");
        };
        assert!(probe.terminated.lock().unwrap().is_empty());
        assert_eq!(
            h.store.get_archived(run.stem()).await.unwrap().status,
            JobStatus::Killed
        );
        build.completion.await.unwrap();
    }
}
