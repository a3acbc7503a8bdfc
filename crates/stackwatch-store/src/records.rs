//! Record store: job records as JSON files keyed by stack name.
//!
//! Layout:
//! - `{pending}/{name}.json`: at most one record per stack, awaiting or executing
//! - `{archive}/{timestamp}-{name}.json`: terminal records, never mutated again
//! - `{archive}/{timestamp}-{name}.log`: combined output of each run

use chrono::{DateTime, Utc};
use stackwatch_core::{ArchiveKey, JobRecord, RunPath, StackName};
use std::path::{Path, PathBuf};
use std::time::SystemTime;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tracing::{debug, info, warn};

use crate::tail::identity;
use crate::{StoreError, StoreResult};

const RECORD_EXT: &str = "json";

/// Upper bound on same-second runs of one stack.
const MAX_RUNS_PER_SECOND: u32 = 10_000;

/// File a tail request refers to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TailTarget {
    /// Log of a run, by archive stem (`{timestamp}-{name}`).
    Log(String),
    /// Pending record of a stack.
    Record(StackName),
    /// Archived record, by stem.
    Archived(String),
}

/// Filesystem-backed job record store.
#[derive(Debug, Clone)]
pub struct RecordStore {
    pending_dir: PathBuf,
    archive_dir: PathBuf,
}

impl RecordStore {
    pub fn new(pending_dir: impl Into<PathBuf>, archive_dir: impl Into<PathBuf>) -> Self {
        Self {
            pending_dir: pending_dir.into(),
            archive_dir: archive_dir.into(),
        }
    }

    pub fn pending_dir(&self) -> &Path {
        &self.pending_dir
    }

    pub fn archive_dir(&self) -> &Path {
        &self.archive_dir
    }

    /// Create both store directories if missing.
    pub async fn ensure_layout(&self) -> StoreResult<()> {
        for dir in [&self.pending_dir, &self.archive_dir] {
            fs::create_dir_all(dir)
                .await
                .map_err(|e| StoreError::io(dir, e))?;
        }
        Ok(())
    }

    pub fn pending_path(&self, name: &StackName) -> PathBuf {
        self.pending_dir.join(format!("{}.{}", name, RECORD_EXT))
    }

    /// Stack name of a path reported from the pending directory, if it names
    /// a record file. Hidden files (in-flight writes) never qualify.
    pub fn pending_name(&self, path: &Path) -> Option<StackName> {
        if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXT) {
            return None;
        }
        let stem = path.file_stem()?.to_str()?;
        StackName::new(stem).ok()
    }

    /// Write or replace the pending record.
    ///
    /// The record is written to a hidden temporary file, synced and renamed
    /// over the target, so readers see either the old or the new record and
    /// never a mixture.
    pub async fn put(&self, record: &JobRecord) -> StoreResult<()> {
        let path = self.pending_path(&record.name);
        let tmp = self
            .pending_dir
            .join(format!(".{}.{}.tmp", record.name, uuid::Uuid::new_v4()));

        let mut bytes = serde_json::to_vec_pretty(record)?;
        bytes.push(b'\n');

        let write = async {
            let mut file = fs::File::create(&tmp).await?;
            file.write_all(&bytes).await?;
            file.sync_all().await?;
            fs::rename(&tmp, &path).await
        };
        if let Err(e) = write.await {
            let _ = fs::remove_file(&tmp).await;
            return Err(StoreError::io(&path, e));
        }

        debug!(stack = %record.name, status = %record.status, pid = ?record.pid, "Record persisted");
        Ok(())
    }

    /// Load the pending record of a stack.
    pub async fn get(&self, name: &StackName) -> StoreResult<JobRecord> {
        let path = self.pending_path(name);
        read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("pending record for {}", name)))
    }

    /// Register a trigger for `name`.
    ///
    /// A pending record that already exists keeps its pid and run paths so
    /// the runner can find and supersede the run in progress.
    pub async fn submit(&self, name: &StackName) -> StoreResult<JobRecord> {
        let mut record = JobRecord::new(name.clone());

        match self.get(name).await {
            Ok(existing) => {
                record.pid = existing.pid;
                record.run_path = existing.run_path;
                record.log_path = existing.log_path;
            }
            Err(e) if e.is_race() => {}
            Err(StoreError::Decode { path, source }) => {
                warn!(path = %path.display(), error = %source, "Replacing unreadable pending record");
            }
            Err(e) => return Err(e),
        }

        self.put(&record).await?;
        info!(stack = %name, supersedes = ?record.pid, "Build requested");
        Ok(record)
    }

    /// Pending records, most recently modified first. Unreadable files are skipped.
    pub async fn list_pending(&self) -> StoreResult<Vec<JobRecord>> {
        let mut entries = Vec::new();
        for path in self.record_files(&self.pending_dir).await? {
            if self.pending_name(&path).is_none() {
                continue;
            }
            let modified = match fs::metadata(&path).await.and_then(|m| m.modified()) {
                Ok(modified) => modified,
                Err(_) => continue, // archived while listing
            };
            if let Some(record) = read_listed(&path).await {
                entries.push((modified, record));
            }
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, record)| record).collect())
    }

    /// Archived records, newest run first (ordered by the timestamp in the file name).
    pub async fn list_archive(&self) -> StoreResult<Vec<JobRecord>> {
        let mut entries = Vec::new();
        for path in self.record_files(&self.archive_dir).await? {
            let Some(key) = path
                .file_stem()
                .and_then(|s| s.to_str())
                .and_then(|s| ArchiveKey::parse(s).ok())
            else {
                continue;
            };
            if let Some(record) = read_listed(&path).await {
                entries.push((key, record));
            }
        }

        entries.sort_by(|a, b| b.0.cmp(&a.0));
        Ok(entries.into_iter().map(|(_, record)| record).collect())
    }

    /// Load an archived record by stem.
    pub async fn get_archived(&self, stem: &str) -> StoreResult<JobRecord> {
        let path = self.archived_path(stem)?;
        read_record(&path)
            .await?
            .ok_or_else(|| StoreError::NotFound(format!("archived record {}", stem)))
    }

    /// Move the pending record to its archive location (`{run_path}.json`).
    ///
    /// Fails with a race error ([`StoreError::is_race`]) if the pending file
    /// is gone or now holds a different record. Only the file that was
    /// checked is archived: a record written over the pending path while the
    /// move is in flight is put back.
    pub async fn archive(&self, record: &JobRecord) -> StoreResult<PathBuf> {
        let run_path = record
            .run_path
            .as_ref()
            .ok_or_else(|| StoreError::MissingRunPath(record.name.to_string()))?;
        let from = self.pending_path(&record.name);
        let to = run_path.record_path();

        let checked = self.check_pending(&from, record).await?;
        self.move_checked(&record.name, &from, &to, checked).await?;

        info!(stack = %record.name, status = %record.status, archived = %to.display(), "Record archived");
        Ok(to)
    }

    /// Inode of the pending file, provided it holds exactly `record`. The
    /// contents are read from the same handle the inode is taken from.
    async fn check_pending(&self, from: &Path, record: &JobRecord) -> StoreResult<Option<u64>> {
        let mut file = match fs::File::open(from).await {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                return Err(StoreError::NotFound(format!("pending record for {}", record.name)));
            }
            Err(e) => return Err(StoreError::io(from, e)),
        };
        let meta = file.metadata().await.map_err(|e| StoreError::io(from, e))?;
        let mut bytes = Vec::new();
        file.read_to_end(&mut bytes)
            .await
            .map_err(|e| StoreError::io(from, e))?;

        let on_disk: JobRecord = serde_json::from_slice(&bytes).map_err(|source| StoreError::Decode {
            path: from.to_path_buf(),
            source,
        })?;
        if on_disk != *record {
            return Err(StoreError::Superseded(record.name.to_string()));
        }
        Ok(identity(&meta))
    }

    /// Rename `from` to `to` and confirm the moved file is the one checked.
    async fn move_checked(
        &self,
        name: &StackName,
        from: &Path,
        to: &Path,
        checked: Option<u64>,
    ) -> StoreResult<()> {
        fs::rename(from, to)
            .await
            .map_err(|e| StoreError::io(from, e))?;

        let moved = fs::metadata(to).await.map_err(|e| StoreError::io(to, e))?;
        match (checked, identity(&moved)) {
            (Some(checked), Some(moved)) if checked != moved => {}
            _ => return Ok(()),
        }

        // A newer record replaced the checked one before the rename. Restore
        // it unless an even newer one already took its place.
        match fs::hard_link(to, from).await {
            Ok(()) => {}
            Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => {
                debug!(stack = %name, "Newer pending record already in place");
            }
            Err(e) => return Err(StoreError::io(from, e)),
        }
        fs::remove_file(to).await.map_err(|e| StoreError::io(to, e))?;

        warn!(stack = %name, "Pending record replaced while archiving, restored");
        Err(StoreError::Superseded(name.to_string()))
    }

    /// Reserve a run path unique to this run and create its empty log file.
    ///
    /// The stem is `{timestamp}-{name}` at second granularity; runs of the
    /// same stack within one second get an increasing sequence suffix.
    pub async fn allocate_run_path(
        &self,
        name: &StackName,
        started_at: DateTime<Utc>,
    ) -> StoreResult<RunPath> {
        for seq in 0..MAX_RUNS_PER_SECOND {
            let key = ArchiveKey::new(name.clone(), started_at, seq);
            let run_path = RunPath::new(&self.archive_dir, &key);
            if fs::try_exists(run_path.record_path()).await.unwrap_or(false) {
                continue;
            }

            let log_path = run_path.log_path();
            match fs::OpenOptions::new()
                .write(true)
                .create_new(true)
                .open(&log_path)
                .await
            {
                Ok(_) => return Ok(run_path),
                Err(e) if e.kind() == std::io::ErrorKind::AlreadyExists => continue,
                Err(e) => return Err(StoreError::io(&log_path, e)),
            }
        }

        Err(StoreError::io(
            &self.archive_dir,
            std::io::Error::other(format!("no free run path for {}", name)),
        ))
    }

    /// Append a diagnostic line to a run's log.
    pub async fn append_log(&self, log_path: &Path, message: &str) -> StoreResult<()> {
        let line = format!(
            "[stackwatch {}] {}\n",
            Utc::now().format("%Y-%m-%d %H:%M:%S"),
            message
        );
        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(log_path)
            .await
            .map_err(|e| StoreError::io(log_path, e))?;
        file.write_all(line.as_bytes())
            .await
            .map_err(|e| StoreError::io(log_path, e))?;
        Ok(())
    }

    /// Last modification time of a pending record.
    pub async fn pending_modified(&self, name: &StackName) -> StoreResult<SystemTime> {
        let path = self.pending_path(name);
        fs::metadata(&path)
            .await
            .and_then(|m| m.modified())
            .map_err(|e| StoreError::io(&path, e))
    }

    /// Log file of an archived run, by stem.
    pub fn log_path_for(&self, stem: &str) -> StoreResult<PathBuf> {
        let key = ArchiveKey::parse(stem)?;
        Ok(RunPath::new(&self.archive_dir, &key).log_path())
    }

    fn archived_path(&self, stem: &str) -> StoreResult<PathBuf> {
        let key = ArchiveKey::parse(stem)?;
        Ok(RunPath::new(&self.archive_dir, &key).record_path())
    }

    /// Path of the file behind a tail target. Stems are validated, so the
    /// result always stays inside the store.
    pub fn resolve_tail_target(&self, target: &TailTarget) -> StoreResult<PathBuf> {
        match target {
            TailTarget::Log(stem) => self.log_path_for(stem),
            TailTarget::Record(name) => Ok(self.pending_path(name)),
            TailTarget::Archived(stem) => self.archived_path(stem),
        }
    }

    async fn record_files(&self, dir: &Path) -> StoreResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        let mut entries = match fs::read_dir(dir).await {
            Ok(entries) => entries,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(files),
            Err(e) => return Err(StoreError::io(dir, e)),
        };

        while let Some(entry) = entries
            .next_entry()
            .await
            .map_err(|e| StoreError::io(dir, e))?
        {
            let path = entry.path();
            let hidden = path
                .file_name()
                .and_then(|n| n.to_str())
                .is_none_or(|n| n.starts_with('.'));
            if !hidden && path.extension().and_then(|e| e.to_str()) == Some(RECORD_EXT) {
                files.push(path);
            }
        }
        Ok(files)
    }
}

/// Read and decode one record; `None` if the file does not exist.
async fn read_record(path: &Path) -> StoreResult<Option<JobRecord>> {
    let bytes = match fs::read(path).await {
        Ok(bytes) => bytes,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
        Err(e) => return Err(StoreError::io(path, e)),
    };
    serde_json::from_slice(&bytes)
        .map(Some)
        .map_err(|source| StoreError::Decode {
            path: path.to_path_buf(),
            source,
        })
}

async fn read_listed(path: &Path) -> Option<JobRecord> {
    match read_record(path).await {
        Ok(record) => record,
        Err(e) => {
            warn!(path = %path.display(), error = %e, "Skipping unreadable record");
            None
        }
    }
}
