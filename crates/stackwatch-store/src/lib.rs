//! Filesystem persistence for Stackwatch.
//!
//! Provides the record store (pending and archive areas) and the tail
//! service used to observe growing log and record files.

pub mod error;
pub mod records;
pub mod tail;

pub use error::{StoreError, StoreResult};
pub use records::{RecordStore, TailTarget};
pub use tail::{TailChunk, TailCursor, TailError, TailMode, TailService};
