//! Database layer for vault-ingest
//!
//! Handles SQLite persistence for job records, the pending-cleanup ledger and
//! runtime state.
//!
//! ## Submodules
//!
//! Methods on [`Database`] are organized by domain:
//! - [`migrations`] - Database lifecycle, schema migrations
//! - [`jobs`] - Job record upserts and queries
//! - [`cleanup`] - Pending-cleanup ledger
//! - [`state`] - Runtime state (shutdown tracking)

use sqlx::{FromRow, sqlite::SqlitePool};

mod cleanup;
mod jobs;
mod migrations;
mod state;

/// Kind of a pending-cleanup ledger entry
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum CleanupKind {
    /// A directory to purge recursively
    Folder,
    /// A single file to delete
    File,
}

impl CleanupKind {
    /// Stored name
    pub fn as_str(&self) -> &'static str {
        match self {
            CleanupKind::Folder => "folder",
            CleanupKind::File => "file",
        }
    }
}

/// Persisted job record
///
/// List-valued fields are stored as JSON text. `created_at` is Unix
/// milliseconds.
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct JobRecord {
    /// Job ID
    pub id: i64,
    /// Display name
    pub name: String,
    /// Status name (see [`JobStatus::as_str`](crate::types::JobStatus::as_str))
    pub status: String,
    /// Last status message
    pub message: String,
    /// Progress 0.0..=1.0
    pub progress: f64,
    /// Scratch directory
    pub temp_dir: String,
    /// Destination directory
    pub final_dir: String,
    /// Page URLs, JSON array of strings
    pub direct_urls: String,
    /// Fetch cursor
    pub direct_index: i64,
    /// Pages skipped so far
    pub direct_skipped: i64,
    /// Resolved extension per page, JSON array of strings or nulls
    pub direct_exts: String,
    /// Request headers, JSON object
    pub headers: String,
    /// Descriptive metadata, JSON object
    pub meta: String,
    /// Caller metadata file to delete once the job is finalized
    pub meta_path: Option<String>,
    /// Whether finalization has started
    pub post_processed: bool,
    /// Key mode of the temp files (`vault` or `random`)
    pub encryption: Option<String>,
    /// Unix milliseconds
    pub created_at: i64,
}

/// Pending-cleanup ledger entry
#[derive(Debug, Clone, PartialEq, FromRow)]
pub struct PendingCleanup {
    /// Absolute path to delete
    pub path: String,
    /// `folder` or `file`
    pub kind: String,
    /// Unix seconds
    pub created_at: i64,
}

/// Database handle for vault-ingest
pub struct Database {
    pool: SqlitePool,
}

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
