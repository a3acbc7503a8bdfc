//! `stackwatch tail`: print a run's log, optionally following it.

use anyhow::{Context, Result, bail};
use stackwatch_config::SystemConfig;
use stackwatch_core::{ArchiveKey, StackName};
use stackwatch_store::{RecordStore, TailCursor, TailMode, TailService};
use std::io::Write;
use std::path::PathBuf;

use super::open_store;

pub async fn tail(config: &SystemConfig, run: &str, follow: bool) -> Result<()> {
    let store = open_store(config);
    let (stem, path) = resolve(&store, run).await?;
    let service = TailService::new(config.tail.initial_bytes, config.tail.initial_lines);

    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);
    let mut cursor: Option<TailCursor> = None;

    loop {
        // Checked before reading so the final output is never missed.
        let finished = store.get_archived(&stem).await.is_ok();

        let chunk = match service.tail(&path, cursor.as_ref()).await {
            Ok(chunk) => chunk,
            Err(e) if e.is_gone() && cursor.is_some() => {
                eprintln!("[log removed]");
                return Ok(());
            }
            Err(e) if e.is_gone() => bail!("No log for run {}", stem),
            Err(e) => return Err(e.into()),
        };

        if chunk.mode == TailMode::Initial {
            if cursor.is_some() {
                eprintln!("[log was rewritten, showing it again]");
            } else if chunk.truncated {
                eprintln!("[earlier output omitted]");
            }
        }
        let mut stdout = std::io::stdout().lock();
        stdout.write_all(chunk.content.as_bytes())?;
        stdout.flush()?;
        drop(stdout);

        let unchanged = chunk.mode == TailMode::Unchanged;
        cursor = Some(chunk.cursor);
        if !follow || (finished && unchanged) {
            return Ok(());
        }

        tokio::select! {
            _ = tokio::time::sleep(config.tail.poll_interval) => {}
            _ = &mut ctrl_c => return Ok(()),
        }
    }
}

/// A run id names its log directly. A stack name follows the run its
/// pending record points at.
async fn resolve(store: &RecordStore, run: &str) -> Result<(String, PathBuf)> {
    if ArchiveKey::parse(run).is_ok() {
        return Ok((run.to_string(), store.log_path_for(run)?));
    }

    let name = StackName::new(run)?;
    let record = store
        .get(&name)
        .await
        .with_context(|| format!("No pending job for {}", name))?;
    match record.run_path {
        Some(run_path) => Ok((run_path.stem().to_string(), run_path.log_path())),
        None => bail!("Build of {} has not started yet", name),
    }
}
