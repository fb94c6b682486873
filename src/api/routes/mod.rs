//! Route handlers for the REST API
//!
//! Handlers are organized by domain:
//! - [`jobs`] - Job submission, control and queries
//! - [`system`] - Health, events, OpenAPI

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::types::{JobId, JobMeta};

mod jobs;
mod system;

pub use jobs::*;
pub use system::*;

/// Request body for POST /jobs
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct AddJobRequest {
    /// Page URLs in reading order
    pub urls: Vec<String>,

    /// Descriptive metadata for the item
    #[serde(default)]
    pub meta: JobMeta,

    /// Request headers sent with every page request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,
}

/// Response body for POST /jobs
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct AddJobResponse {
    /// ID of the new job
    pub id: JobId,
}

/// Response body for POST /jobs/clear-completed
#[derive(Debug, Deserialize, Serialize, utoipa::ToSchema)]
pub struct ClearCompletedResponse {
    /// Number of jobs removed from the table
    pub removed: usize,
}
