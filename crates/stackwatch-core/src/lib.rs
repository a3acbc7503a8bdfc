//! Core domain types and traits for the Stackwatch build supervisor.
//!
//! This crate contains:
//! - Stack names and run paths
//! - The job record and its status machine
//! - Executor and process-probe traits
//! - The shared error type

pub mod error;
pub mod executor;
pub mod job;
pub mod name;

pub use error::{Error, Result};
pub use job::{ArchiveKey, JobRecord, JobStatus, RunPath};
pub use name::StackName;
