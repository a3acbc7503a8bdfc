//! Dispatcher: turns new pending records into builds.

use notify::event::{AccessKind, AccessMode};
use notify::{Event, EventKind, RecursiveMode, Watcher};
use stackwatch_core::{JobStatus, StackName};
use std::path::PathBuf;
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::runner::{DispatchOutcome, JobRunner};
use crate::RunnerResult;

const EVENT_BUFFER: usize = 256;

/// Watches the pending directory and hands each new request to the runner.
///
/// Events are handled one at a time by a single task, and the runner marks a
/// record `running` before it returns, so repeated notifications for the
/// same write start at most one build.
pub struct Dispatcher {
    runner: JobRunner,
    scanned: Option<oneshot::Sender<()>>,
}

impl Dispatcher {
    pub fn new(runner: JobRunner) -> Self {
        Self {
            runner,
            scanned: None,
        }
    }

    /// Signal `tx` once every request waiting at startup has been handled.
    pub fn on_scanned(mut self, tx: oneshot::Sender<()>) -> Self {
        self.scanned = Some(tx);
        self
    }

    /// Run until `cancel` fires.
    pub async fn run(mut self, cancel: CancellationToken) -> RunnerResult<()> {
        let store = self.runner.store().clone();
        let (tx, mut rx) = mpsc::channel::<PathBuf>(EVENT_BUFFER);

        let mut watcher = notify::recommended_watcher(move |res: notify::Result<Event>| match res {
            Ok(event) if is_relevant(&event.kind) => {
                for path in event.paths {
                    let _ = tx.blocking_send(path);
                }
            }
            Ok(_) => {}
            Err(e) => warn!(error = %e, "Pending directory watch error"),
        })?;
        watcher.watch(store.pending_dir(), RecursiveMode::NonRecursive)?;
        info!(dir = %store.pending_dir().display(), "Watching for build requests");

        // Requests that arrived while no dispatcher was running.
        for record in store.list_pending().await? {
            if record.status == JobStatus::Pending {
                self.handle(&record.name).await;
            }
        }
        if let Some(tx) = self.scanned.take() {
            let _ = tx.send(());
        }

        loop {
            tokio::select! {
                _ = cancel.cancelled() => break,
                path = rx.recv() => {
                    let Some(path) = path else { break };
                    if let Some(name) = store.pending_name(&path) {
                        self.handle(&name).await;
                    }
                }
            }
        }

        drop(watcher);
        info!("Dispatcher stopped");
        Ok(())
    }

    async fn handle(&self, name: &StackName) {
        match self.runner.dispatch(name).await {
            Ok(DispatchOutcome::Skipped) => {}
            Ok(DispatchOutcome::Started(build)) => {
                debug!(stack = %name, pid = build.pid, "Dispatched build");
            }
            Ok(outcome) => debug!(stack = %name, ?outcome, "Request settled without a build"),
            Err(e) if e.is_race() => debug!(stack = %name, error = %e, "Dispatch lost a race"),
            Err(e) => error!(stack = %name, error = %e, "Dispatch failed"),
        }
    }
}

/// Creations, renames into place and completed writes. Status updates are
/// also reported, the runner ignores records that are no longer pending.
fn is_relevant(kind: &EventKind) -> bool {
    matches!(
        kind,
        EventKind::Create(_)
            | EventKind::Modify(_)
            | EventKind::Access(AccessKind::Close(AccessMode::Write))
    )
}
