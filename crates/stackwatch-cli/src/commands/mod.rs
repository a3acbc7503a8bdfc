//! CLI command implementations.

pub mod jobs;
pub mod tail;

use anyhow::{Context, Result};
use serde_json::json;
use stackwatch_config::{SystemConfig, resolve_system_config};
use stackwatch_core::{ArchiveKey, JobRecord, StackName};
use stackwatch_scheduler::{Reaper, Supervisor};
use stackwatch_store::RecordStore;
use std::path::Path;
use std::sync::Arc;

use crate::output::{OutputFormat, describe, format_or_json};

pub(crate) fn open_store(config: &SystemConfig) -> RecordStore {
    RecordStore::new(config.pending_dir(), config.archive_dir())
}

pub async fn trigger(config: &SystemConfig, stack: &str, format: OutputFormat) -> Result<()> {
    let name = StackName::new(stack)?;
    let store = open_store(config);
    store
        .ensure_layout()
        .await
        .context("Failed to create data directories")?;

    let record = store.submit(&name).await?;
    format_or_json(format, &record, || {
        if record.has_previous_run() {
            println!("Build of {} requested; the running build will be replaced", name);
        } else {
            println!("Build of {} requested", name);
        }
    })
}

pub async fn show(config: &SystemConfig, target: &str, format: OutputFormat) -> Result<()> {
    let record = lookup(&open_store(config), target).await?;
    format_or_json(format, &record, || println!("{}", describe(&record)))
}

/// Run ids (`{timestamp}-{stack}`) name archived runs, anything else a pending job.
async fn lookup(store: &RecordStore, target: &str) -> Result<JobRecord> {
    if ArchiveKey::parse(target).is_ok() {
        return store
            .get_archived(target)
            .await
            .with_context(|| format!("No finished run {}", target));
    }
    let name = StackName::new(target)?;
    store
        .get(&name)
        .await
        .with_context(|| format!("No pending job for {}", name))
}

/// One reaper sweep. Builds supervised by a running server are protected by
/// their live pid.
pub async fn reap(config: &SystemConfig, format: OutputFormat) -> Result<()> {
    let store = Arc::new(open_store(config));
    let runner = Supervisor::runner_for(config, store);
    let report = Reaper::new(runner, config.reaper_interval).sweep().await?;

    let data = json!({ "inspected": report.inspected, "reaped": report.reaped });
    format_or_json(format, &data, || {
        println!(
            "Inspected {} pending job(s), reaped {}",
            report.inspected, report.reaped
        );
    })
}

pub fn validate(path: Option<&Path>, format: OutputFormat) -> Result<()> {
    let config = resolve_system_config(path).context("Configuration error")?;
    format_or_json(format, &config, || {
        println!("Configuration is valid");
        println!("  projects root:  {}", config.projects_root.display());
        println!("  data dir:       {}", config.data_dir.display());
        println!("  build command:  {}", config.build_command);
        println!("  listen:         {}", config.listen);
        println!("  reaper every:   {}s", config.reaper_interval.as_secs());
    })
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use stackwatch_core::JobStatus;

    pub(crate) fn config(dir: &Path) -> SystemConfig {
        let mut config = SystemConfig::default();
        config.data_dir = dir.join("data");
        config.projects_root = dir.join("projects");
        config
    }

    #[tokio::test]
    async fn test_trigger_then_lookup_pending() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());

        trigger(&config, "web", OutputFormat::Json).await.unwrap();
        let record = lookup(&open_store(&config), "web").await.unwrap();
        assert_eq!(record.status, JobStatus::Pending);
    }

    #[tokio::test]
    async fn test_trigger_rejects_bad_name() {
        let dir = tempfile::tempdir().unwrap();
        assert!(trigger(&config(dir.path()), "../web", OutputFormat::Text).await.is_err());
    }

    #[tokio::test]
    async fn test_lookup_archived_run() {
        let dir = tempfile::tempdir().unwrap();
        let store = open_store(&config(dir.path()));
        store.ensure_layout().await.unwrap();

        let name = StackName::new("web").unwrap();
        let run = store.allocate_run_path(&name, chrono::Utc::now()).await.unwrap();
        let mut record = JobRecord::new(name);
        record.assign_run(run.clone());
        record.mark_terminal(JobStatus::Done);
        store.put(&record).await.unwrap();
        store.archive(&record).await.unwrap();

        assert_eq!(lookup(&store, run.stem()).await.unwrap(), record);
        assert!(lookup(&store, "web").await.is_err());
    }

    #[tokio::test]
    async fn test_reap_archives_stale_job() {
        let dir = tempfile::tempdir().unwrap();
        let config = config(dir.path());
        let store = open_store(&config);
        store.ensure_layout().await.unwrap();

        let mut record = JobRecord::new(StackName::new("web").unwrap());
        record.mark_running(i32::MAX as u32);
        store.put(&record).await.unwrap();

        reap(&config, OutputFormat::Text).await.unwrap();
        assert!(store.list_pending().await.unwrap().is_empty());
        assert_eq!(store.list_archive().await.unwrap()[0].status, JobStatus::Killed);
    }

    #[test]
    fn test_validate_file() {
        let dir = tempfile::tempdir().unwrap();
        let good = dir.path().join("good.kdl");
        std::fs::write(&good, r#"build-command "make""#).unwrap();
        let bad = dir.path().join("bad.kdl");
        std::fs::write(&bad, "reaper-interval-secs 0").unwrap();

        assert!(validate(Some(good.as_path()), OutputFormat::Text).is_ok());
        assert!(validate(Some(bad.as_path()), OutputFormat::Text).is_err());
    }
}
