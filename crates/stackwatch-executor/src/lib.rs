//! Build execution backends for Stackwatch.
//!
//! Provides:
//! - [`LocalProcessExecutor`]: runs the build command as a host child process
//! - [`UnixProcessProbe`]: liveness checks and termination by pid

pub mod local;
pub mod process;

pub use local::LocalProcessExecutor;
pub use process::UnixProcessProbe;
pub use stackwatch_core::executor::{BuildExit, BuildHandle, BuildSpec, Executor, ProcessProbe};
