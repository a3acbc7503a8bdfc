//! HTTP server for Stackwatch.
//!
//! Accepts build triggers by webhook and serves job records, run history
//! and log tails.

pub mod error;
pub mod routes;
pub mod state;

pub use state::AppState;
