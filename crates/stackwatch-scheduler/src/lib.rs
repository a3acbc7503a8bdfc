//! Job lifecycle engine for Stackwatch.
//!
//! - [`JobRunner`]: duplicate check, reject, dispatch and finalize
//! - [`Dispatcher`]: watches the pending directory for new requests
//! - [`Reaper`]: archives records whose process is gone
//! - [`Supervisor`]: starts and stops the dispatcher and reaper together

pub mod dispatcher;
pub mod error;
pub mod reaper;
pub mod runner;
pub mod supervisor;

pub use dispatcher::Dispatcher;
pub use error::{RunnerError, RunnerResult};
pub use reaper::{Reaper, SweepReport};
pub use runner::{DispatchOutcome, FinalizeOutcome, JobRunner, RunnerConfig, RunningBuild};
pub use supervisor::Supervisor;
