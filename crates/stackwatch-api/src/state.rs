//! Application state.

use stackwatch_config::SystemConfig;
use stackwatch_store::{RecordStore, TailService};
use std::sync::Arc;
use std::time::Duration;

/// Shared application state.
#[derive(Clone)]
pub struct AppState {
    pub store: Arc<RecordStore>,
    pub tail: TailService,
    /// Poll period of SSE tails.
    pub poll_interval: Duration,
    /// Webhooks must be signed with this secret when set.
    pub webhook_secret: Option<Arc<str>>,
}

impl AppState {
    pub fn new(config: &SystemConfig, store: Arc<RecordStore>) -> Self {
        Self {
            store,
            tail: TailService::new(config.tail.initial_bytes, config.tail.initial_lines),
            poll_interval: config.tail.poll_interval,
            webhook_secret: config.webhook_secret.as_deref().map(Arc::from),
        }
    }
}
