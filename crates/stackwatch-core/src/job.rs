//! Job records: the persisted state of one build attempt for a stack.

use chrono::{DateTime, NaiveDateTime, Timelike, Utc};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

use crate::{Error, Result, StackName};

/// Timestamp format used in archived file names.
pub const TIMESTAMP_FORMAT: &str = "%Y%m%d%H%M%S";

/// Job status. Closed set: decoding any other tag is an error.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    #[default]
    Pending,
    Running,
    Done,
    Error,
    DoneWithError,
    Killed,
}

impl JobStatus {
    /// Terminal statuses are written exactly once, right before archiving.
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            JobStatus::Done | JobStatus::Error | JobStatus::DoneWithError | JobStatus::Killed
        )
    }

    pub fn is_success(&self) -> bool {
        matches!(self, JobStatus::Done)
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobStatus::Pending => write!(f, "pending"),
            JobStatus::Running => write!(f, "running"),
            JobStatus::Done => write!(f, "done"),
            JobStatus::Error => write!(f, "error"),
            JobStatus::DoneWithError => write!(f, "done_with_error"),
            JobStatus::Killed => write!(f, "killed"),
        }
    }
}

/// Identity of one run, recoverable from an archived file name alone:
/// `{timestamp}[.{seq}]-{name}`.
///
/// Field order matters: the derived ordering sorts chronologically, with
/// `seq` breaking ties between runs started within the same second.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct ArchiveKey {
    pub timestamp: NaiveDateTime,
    pub seq: u32,
    pub name: StackName,
}

impl ArchiveKey {
    pub fn new(name: StackName, started_at: DateTime<Utc>, seq: u32) -> Self {
        let timestamp = started_at.naive_utc();
        // Second granularity, so the key survives a round trip through the file name.
        let timestamp = timestamp.with_nanosecond(0).unwrap_or(timestamp);
        Self {
            timestamp,
            seq,
            name,
        }
    }

    /// File stem shared by the archived record and its log.
    pub fn stem(&self) -> String {
        let ts = self.timestamp.format(TIMESTAMP_FORMAT);
        if self.seq == 0 {
            format!("{}-{}", ts, self.name)
        } else {
            format!("{}.{}-{}", ts, self.seq, self.name)
        }
    }

    /// Parse a file stem produced by [`ArchiveKey::stem`].
    pub fn parse(stem: &str) -> Result<Self> {
        let invalid = || Error::InvalidRunPath(stem.to_string());

        let (stamp, name) = stem.split_once('-').ok_or_else(invalid)?;
        let (ts, seq) = match stamp.split_once('.') {
            Some((ts, seq)) => (ts, seq.parse::<u32>().map_err(|_| invalid())?),
            None => (stamp, 0),
        };
        let timestamp =
            NaiveDateTime::parse_from_str(ts, TIMESTAMP_FORMAT).map_err(|_| invalid())?;
        let name = StackName::new(name)?;

        Ok(Self {
            timestamp,
            seq,
            name,
        })
    }
}

/// Per-run path prefix: archive directory plus the run's file stem.
/// The log lives at `{run_path}.log`, the archived record at `{run_path}.json`.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RunPath(PathBuf);

impl RunPath {
    pub fn new(archive_dir: &Path, key: &ArchiveKey) -> Self {
        Self(archive_dir.join(key.stem()))
    }

    pub fn as_path(&self) -> &Path {
        &self.0
    }

    /// File stem (`{timestamp}-{name}`), or empty if the path has no file name.
    pub fn stem(&self) -> &str {
        self.0
            .file_name()
            .and_then(|n| n.to_str())
            .unwrap_or_default()
    }

    pub fn key(&self) -> Result<ArchiveKey> {
        ArchiveKey::parse(self.stem())
    }

    pub fn log_path(&self) -> PathBuf {
        self.with_extension("log")
    }

    pub fn record_path(&self) -> PathBuf {
        self.with_extension("json")
    }

    // `Path::with_extension` would treat `.N` in `{ts}.N-{name}` as an extension.
    fn with_extension(&self, ext: &str) -> PathBuf {
        let mut os = self.0.clone().into_os_string();
        os.push(".");
        os.push(ext);
        PathBuf::from(os)
    }
}

impl std::fmt::Display for RunPath {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0.display())
    }
}

/// Persisted state of one job.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobRecord {
    /// Stack identifier and storage key.
    pub name: StackName,
    /// Missing in a bare filesystem drop (`{"name": "web"}`), which is a fresh request.
    #[serde(default)]
    pub status: JobStatus,
    /// Process-group leader of the in-flight build.
    #[serde(default)]
    pub pid: Option<u32>,
    /// Append-only output file of the current run.
    #[serde(default)]
    pub log_path: Option<PathBuf>,
    #[serde(default)]
    pub run_path: Option<RunPath>,
}

impl JobRecord {
    /// A fresh request for `name`.
    pub fn new(name: StackName) -> Self {
        Self {
            name,
            status: JobStatus::Pending,
            pid: None,
            log_path: None,
            run_path: None,
        }
    }

    /// True when this record still references an earlier run, i.e. it was
    /// written by a trigger that superseded a run in progress.
    pub fn has_previous_run(&self) -> bool {
        self.pid.is_some() || self.run_path.is_some()
    }

    /// Status/pid combinations a reader may observe.
    pub fn is_consistent(&self) -> bool {
        match self.status {
            JobStatus::Running => self.pid.is_some() && self.run_path.is_some(),
            status if status.is_terminal() => self.pid.is_none(),
            _ => true,
        }
    }

    pub fn assign_run(&mut self, run_path: RunPath) {
        self.log_path = Some(run_path.log_path());
        self.run_path = Some(run_path);
    }

    pub fn mark_running(&mut self, pid: u32) {
        self.status = JobStatus::Running;
        self.pid = Some(pid);
    }

    /// Move to a terminal status; the pid is cleared in the same step.
    pub fn mark_terminal(&mut self, status: JobStatus) {
        debug_assert!(status.is_terminal(), "{status} is not terminal");
        self.status = status;
        self.pid = None;
    }

    /// Where this record lands once archived.
    pub fn archived_path(&self) -> Option<PathBuf> {
        self.run_path.as_ref().map(RunPath::record_path)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::TimeZone;

    fn name(s: &str) -> StackName {
        StackName::new(s).unwrap()
    }

    #[test]
    fn test_status_serializes_snake_case() {
        let json = serde_json::to_string(&JobStatus::DoneWithError).unwrap();
        assert_eq!(json, r#""done_with_error""#);
    }

    #[test]
    fn test_unknown_status_is_decode_error() {
        let result = serde_json::from_str::<JobRecord>(r#"{"name":"web","status":"paused"}"#);
        assert!(result.is_err());
    }

    #[test]
    fn test_bare_drop_decodes_as_pending() {
        let record: JobRecord = serde_json::from_str(r#"{"name":"web"}"#).unwrap();
        assert_eq!(record, JobRecord::new(name("web")));
    }

    #[test]
    fn test_record_round_trip() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 1).unwrap();
        let key = ArchiveKey::new(name("web"), started, 0);
        let mut record = JobRecord::new(name("web"));
        record.assign_run(RunPath::new(Path::new("/data/logs"), &key));
        record.mark_running(4242);

        let json = serde_json::to_string(&record).unwrap();
        let decoded: JobRecord = serde_json::from_str(&json).unwrap();
        assert_eq!(decoded, record);
        assert_eq!(
            decoded.log_path.as_deref(),
            Some(Path::new("/data/logs/20240309140501-web.log"))
        );
    }

    #[test]
    fn test_truncated_record_fails_decode() {
        let record = JobRecord::new(name("web"));
        let json = serde_json::to_string(&record).unwrap();
        let truncated = &json[..json.len() / 2];
        assert!(serde_json::from_str::<JobRecord>(truncated).is_err());
    }

    #[test]
    fn test_archive_key_round_trip_with_seq() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 1).unwrap();
        let key = ArchiveKey::new(name("api-gw"), started, 2);
        assert_eq!(key.stem(), "20240309140501.2-api-gw");
        assert_eq!(ArchiveKey::parse(&key.stem()).unwrap(), key);
    }

    #[test]
    fn test_archive_key_orders_chronologically() {
        let t0 = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 1).unwrap();
        let t1 = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 2).unwrap();
        let a = ArchiveKey::new(name("web"), t0, 0);
        let b = ArchiveKey::new(name("web"), t0, 10);
        let c = ArchiveKey::new(name("web"), t1, 0);
        assert!(a < b);
        assert!(b < c);
    }

    #[test]
    fn test_archive_key_rejects_garbage() {
        assert!(ArchiveKey::parse("web").is_err());
        assert!(ArchiveKey::parse("notadate-web").is_err());
        assert!(ArchiveKey::parse("20240309140501.x-web").is_err());
    }

    #[test]
    fn test_run_path_extensions_keep_seq() {
        let started = Utc.with_ymd_and_hms(2024, 3, 9, 14, 5, 1).unwrap();
        let key = ArchiveKey::new(name("web"), started, 1);
        let run = RunPath::new(Path::new("/logs"), &key);
        assert_eq!(run.log_path(), Path::new("/logs/20240309140501.1-web.log"));
        assert_eq!(run.record_path(), Path::new("/logs/20240309140501.1-web.json"));
        assert_eq!(run.key().unwrap(), key);
    }

    #[test]
    fn test_consistency_rules() {
        let mut record = JobRecord::new(name("web"));
        assert!(record.is_consistent());

        record.status = JobStatus::Running;
        assert!(!record.is_consistent());

        let key = ArchiveKey::new(name("web"), Utc::now(), 0);
        record.assign_run(RunPath::new(Path::new("/logs"), &key));
        record.mark_running(7);
        assert!(record.is_consistent());

        record.mark_terminal(JobStatus::Done);
        assert!(record.is_consistent());
        assert_eq!(record.pid, None);
    }
}
