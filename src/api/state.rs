//! Application state for the API server

use crate::{Config, JobManager};
use std::sync::Arc;

/// Shared application state accessible to all route handlers
///
/// Cloned per request; both fields are Arc-wrapped.
#[derive(Clone)]
pub struct AppState {
    /// The job manager handling every request
    pub manager: Arc<JobManager>,

    /// Configuration (read-only)
    pub config: Arc<Config>,
}

impl AppState {
    /// Create a new AppState
    pub fn new(manager: Arc<JobManager>, config: Arc<Config>) -> Self {
        Self { manager, config }
    }
}
