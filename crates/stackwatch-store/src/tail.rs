//! Incremental reads of growing files.
//!
//! Delta mode: the caller hands back the cursor of its previous chunk and
//! receives only the bytes appended since. Any sign that the file is no
//! longer the one the cursor describes (shrunk, replaced, or too far ahead)
//! re-synchronizes with a bounded initial read.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use thiserror::Error;
use tokio::fs;
use tokio::io::{AsyncReadExt, AsyncSeekExt};

#[derive(Debug, Error)]
pub enum TailError {
    /// The file disappeared. Observers should stop polling.
    #[error("tail source is gone: {0}")]
    SourceGone(PathBuf),

    #[error("I/O error while tailing {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
}

impl TailError {
    pub fn is_gone(&self) -> bool {
        matches!(self, TailError::SourceGone(_))
    }

    fn from_io(path: &Path, source: std::io::Error) -> Self {
        if source.kind() == std::io::ErrorKind::NotFound {
            TailError::SourceGone(path.to_path_buf())
        } else {
            TailError::Io {
                path: path.to_path_buf(),
                source,
            }
        }
    }
}

/// Position of an observer in a file, as returned with every chunk.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct TailCursor {
    /// Bytes consumed so far.
    pub offset: u64,
    /// File size at the time of the read.
    pub size: u64,
    /// Modification time in milliseconds since the Unix epoch.
    pub modified_ms: i64,
    /// Inode on Unix; detects replacement by rename.
    #[serde(default)]
    pub identity: Option<u64>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TailMode {
    /// Bounded history; replaces whatever the observer had.
    Initial,
    /// Bytes appended since the cursor.
    Delta,
    /// Nothing changed since the cursor.
    Unchanged,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TailChunk {
    pub content: String,
    pub size: u64,
    pub last_modified: Option<DateTime<Utc>>,
    pub cursor: TailCursor,
    pub mode: TailMode,
    /// Older history was cut from an initial read.
    pub truncated: bool,
}

#[derive(Debug, Clone)]
pub struct TailService {
    initial_bytes: u64,
    initial_lines: usize,
}

impl Default for TailService {
    fn default() -> Self {
        Self::new(64 * 1024, 1000)
    }
}

struct Snapshot {
    size: u64,
    modified_ms: i64,
    identity: Option<u64>,
}

impl TailService {
    pub fn new(initial_bytes: u64, initial_lines: usize) -> Self {
        Self {
            initial_bytes: initial_bytes.max(1),
            initial_lines: initial_lines.max(1),
        }
    }

    /// Read what is new in `path` relative to `cursor`.
    pub async fn tail(
        &self,
        path: &Path,
        cursor: Option<&TailCursor>,
    ) -> Result<TailChunk, TailError> {
        let meta = fs::metadata(path)
            .await
            .map_err(|e| TailError::from_io(path, e))?;
        let snapshot = Snapshot {
            size: meta.len(),
            modified_ms: meta
                .modified()
                .ok()
                .map(|t| DateTime::<Utc>::from(t).timestamp_millis())
                .unwrap_or_default(),
            identity: identity(&meta),
        };

        match cursor {
            Some(cursor) if self.continues(cursor, &snapshot) => {
                if cursor.size == snapshot.size && cursor.modified_ms == snapshot.modified_ms {
                    Ok(self.chunk(String::new(), cursor.offset, &snapshot, TailMode::Unchanged, false))
                } else {
                    self.read_delta(path, cursor.offset, &snapshot).await
                }
            }
            _ => self.read_initial(path, &snapshot).await,
        }
    }

    /// Whether the file is still the one `cursor` was taken from and the
    /// gap is small enough to send as a delta.
    fn continues(&self, cursor: &TailCursor, snapshot: &Snapshot) -> bool {
        let same_file = match (cursor.identity, snapshot.identity) {
            (Some(a), Some(b)) => a == b,
            _ => true,
        };
        same_file
            && snapshot.size >= cursor.size
            && snapshot.size >= cursor.offset
            && snapshot.size - cursor.offset <= self.initial_bytes
    }

    async fn read_delta(
        &self,
        path: &Path,
        offset: u64,
        snapshot: &Snapshot,
    ) -> Result<TailChunk, TailError> {
        let bytes = read_range(path, offset, snapshot.size).await?;
        let complete = complete_utf8_len(&bytes);
        let content = String::from_utf8_lossy(&bytes[..complete]).into_owned();
        Ok(self.chunk(
            content,
            offset + complete as u64,
            snapshot,
            TailMode::Delta,
            false,
        ))
    }

    async fn read_initial(&self, path: &Path, snapshot: &Snapshot) -> Result<TailChunk, TailError> {
        let start = snapshot.size.saturating_sub(self.initial_bytes);
        let bytes = read_range(path, start, snapshot.size).await?;

        let mut skip = 0;
        if start > 0 {
            // Drop the partial first line.
            skip = bytes
                .iter()
                .position(|&b| b == b'\n')
                .map_or(bytes.len(), |i| i + 1);
        }
        skip += last_lines_start(&bytes[skip..], self.initial_lines);

        let body = &bytes[skip..];
        let complete = complete_utf8_len(body);
        let content = String::from_utf8_lossy(&body[..complete]).into_owned();
        let offset = start + (skip + complete) as u64;

        Ok(self.chunk(content, offset, snapshot, TailMode::Initial, start + skip as u64 > 0))
    }

    fn chunk(
        &self,
        content: String,
        offset: u64,
        snapshot: &Snapshot,
        mode: TailMode,
        truncated: bool,
    ) -> TailChunk {
        TailChunk {
            content,
            size: snapshot.size,
            last_modified: DateTime::from_timestamp_millis(snapshot.modified_ms),
            cursor: TailCursor {
                offset,
                size: snapshot.size,
                modified_ms: snapshot.modified_ms,
                identity: snapshot.identity,
            },
            mode,
            truncated,
        }
    }
}

async fn read_range(path: &Path, start: u64, end: u64) -> Result<Vec<u8>, TailError> {
    let mut file = fs::File::open(path)
        .await
        .map_err(|e| TailError::from_io(path, e))?;
    file.seek(SeekFrom::Start(start))
        .await
        .map_err(|e| TailError::from_io(path, e))?;

    let mut bytes = Vec::with_capacity(end.saturating_sub(start) as usize);
    file.take(end.saturating_sub(start))
        .read_to_end(&mut bytes)
        .await
        .map_err(|e| TailError::from_io(path, e))?;
    Ok(bytes)
}

/// Offset in `bytes` where the last `lines` lines begin. A trailing
/// newline does not open a new line.
fn last_lines_start(bytes: &[u8], lines: usize) -> usize {
    let body = bytes.strip_suffix(b"\n").unwrap_or(bytes);
    let mut seen = 0;
    for (i, &b) in body.iter().enumerate().rev() {
        if b == b'\n' {
            seen += 1;
            if seen == lines {
                return i + 1;
            }
        }
    }
    0
}

/// Length of the prefix of `bytes` that does not end inside a multi-byte
/// UTF-8 sequence.
fn complete_utf8_len(bytes: &[u8]) -> usize {
    let len = bytes.len();
    for back in 1..=len.min(4) {
        let b = bytes[len - back];
        if b & 0b1100_0000 == 0b1000_0000 {
            continue; // continuation byte
        }
        let needed = match b {
            b if b & 0b1000_0000 == 0 => 1,
            b if b & 0b1110_0000 == 0b1100_0000 => 2,
            b if b & 0b1111_0000 == 0b1110_0000 => 3,
            b if b & 0b1111_1000 == 0b1111_0000 => 4,
            _ => return len, // invalid lead byte; let lossy decoding handle it
        };
        return if back < needed { len - back } else { len };
    }
    len
}

#[cfg(unix)]
pub(crate) fn identity(meta: &std::fs::Metadata) -> Option<u64> {
    use std::os::unix::fs::MetadataExt;
    Some(meta.ino())
}

#[cfg(not(unix))]
pub(crate) fn identity(_meta: &std::fs::Metadata) -> Option<u64> {
    None
}
