//! Core types for vault-ingest

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::PathBuf;
use utoipa::ToSchema;

/// Unique identifier for an ingestion job
///
/// Assigned monotonically; the sequence continues across restarts.
#[derive(
    Clone, Copy, Debug, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize, ToSchema,
)]
#[serde(transparent)]
pub struct JobId(pub i64);

impl JobId {
    /// Create a new JobId
    pub fn new(id: i64) -> Self {
        Self(id)
    }

    /// Get the inner i64 value
    pub fn get(&self) -> i64 {
        self.0
    }
}

impl From<i64> for JobId {
    fn from(id: i64) -> Self {
        Self(id)
    }
}

impl From<JobId> for i64 {
    fn from(id: JobId) -> Self {
        id.0
    }
}

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl std::str::FromStr for JobId {
    type Err = std::num::ParseIntError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(s.parse()?))
    }
}

impl sqlx::Type<sqlx::Sqlite> for JobId {
    fn type_info() -> sqlx::sqlite::SqliteTypeInfo {
        <i64 as sqlx::Type<sqlx::Sqlite>>::type_info()
    }

    fn compatible(ty: &sqlx::sqlite::SqliteTypeInfo) -> bool {
        <i64 as sqlx::Type<sqlx::Sqlite>>::compatible(ty)
    }
}

impl<'q> sqlx::Encode<'q, sqlx::Sqlite> for JobId {
    fn encode_by_ref(
        &self,
        buf: &mut Vec<sqlx::sqlite::SqliteArgumentValue<'q>>,
    ) -> Result<sqlx::encode::IsNull, Box<dyn std::error::Error + Send + Sync>> {
        sqlx::Encode::<sqlx::Sqlite>::encode_by_ref(&self.0, buf)
    }
}

impl<'r> sqlx::Decode<'r, sqlx::Sqlite> for JobId {
    fn decode(value: sqlx::sqlite::SqliteValueRef<'r>) -> Result<Self, sqlx::error::BoxDynError> {
        let id = <i64 as sqlx::Decode<sqlx::Sqlite>>::decode(value)?;
        Ok(Self(id))
    }
}

/// Job status
///
/// `starting → downloading → finalizing → moving → cleaning → completed`, with
/// `stopped` reachable from the fetch phase and `failed` from any non-terminal
/// state.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum JobStatus {
    /// Directories allocated, fetch loop about to run
    Starting,
    /// Fetch loop running
    Downloading,
    /// Fetching done, waiting to move
    Finalizing,
    /// Content mover running
    Moving,
    /// Removing the temp directory
    Cleaning,
    /// Ingested into the library
    Completed,
    /// Unrecoverable error
    Failed,
    /// Cooperatively cancelled; may be restarted
    Stopped,
}

impl JobStatus {
    /// Stable lowercase name, as stored in the database
    pub fn as_str(&self) -> &'static str {
        match self {
            JobStatus::Starting => "starting",
            JobStatus::Downloading => "downloading",
            JobStatus::Finalizing => "finalizing",
            JobStatus::Moving => "moving",
            JobStatus::Cleaning => "cleaning",
            JobStatus::Completed => "completed",
            JobStatus::Failed => "failed",
            JobStatus::Stopped => "stopped",
        }
    }

    /// Parse a stored status name; unknown values hydrate as `Starting`
    pub fn parse(s: &str) -> Self {
        match s {
            "downloading" => JobStatus::Downloading,
            "finalizing" => JobStatus::Finalizing,
            "moving" => JobStatus::Moving,
            "cleaning" => JobStatus::Cleaning,
            "completed" => JobStatus::Completed,
            "failed" => JobStatus::Failed,
            "stopped" => JobStatus::Stopped,
            _ => JobStatus::Starting,
        }
    }

    /// Statuses belonging to the fetch phase
    pub fn is_fetch_phase(&self) -> bool {
        matches!(self, JobStatus::Starting | JobStatus::Downloading)
    }

    /// Statuses belonging to finalization
    pub fn is_finalization_phase(&self) -> bool {
        matches!(
            self,
            JobStatus::Finalizing | JobStatus::Moving | JobStatus::Cleaning
        )
    }
}

impl std::fmt::Display for JobStatus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Descriptive metadata supplied with a job
///
/// Known fields are typed; anything else the caller sends is preserved and
/// written into the item's metadata record.
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobMeta {
    /// Display name of the item
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub comic_name: Option<String>,

    /// Alternative title
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,

    /// Author or artist
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub author: Option<String>,

    /// Free-form tags
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub tags: Vec<String>,

    /// Identifier of the item on the source site
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub gallery_id: Option<String>,

    /// Page the URLs were scraped from; sent as `referer` when the caller did
    /// not supply one
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub source_url: Option<String>,

    /// Any other caller-supplied fields
    #[serde(flatten)]
    #[schema(value_type = Object)]
    pub extra: BTreeMap<String, serde_json::Value>,
}

/// Per-job options for [`JobManager::add_direct_download`](crate::JobManager::add_direct_download)
#[derive(Clone, Debug, Default, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct DirectDownloadOptions {
    /// Request headers sent with every page request
    #[serde(default)]
    pub headers: BTreeMap<String, String>,

    /// Caller-side metadata file to delete once the item is finalized
    #[serde(default, skip_serializing_if = "Option::is_none")]
    #[schema(value_type = Option<String>)]
    pub meta_path: Option<PathBuf>,
}

/// Public view of a job, suitable for a UI to poll or subscribe to
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct JobSnapshot {
    /// Job ID
    pub id: JobId,
    /// Display name (`"(loading…)"` until known)
    pub name: String,
    /// Current status
    pub status: JobStatus,
    /// Human-readable status message
    pub message: String,
    /// Progress 0.0..=1.0
    pub progress: f64,
    /// Pages handled so far (e.g., "3 pages")
    pub downloaded: String,
    /// Total pages (e.g., "12 pages")
    pub total: String,
    /// Scratch directory
    #[schema(value_type = String)]
    pub temp_dir: PathBuf,
    /// Destination directory in the library
    #[schema(value_type = String)]
    pub final_dir: PathBuf,
    /// When the job was created
    pub created_at: DateTime<Utc>,
    /// Whether descriptive metadata was supplied
    pub meta_captured: bool,
}

/// Event emitted by the job manager
///
/// Subscribe via [`JobManager::subscribe`](crate::JobManager::subscribe).
#[derive(Clone, Debug, Serialize, Deserialize, ToSchema)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Event {
    /// A job changed (status, message or progress)
    JobUpdated {
        /// Current job view
        job: JobSnapshot,
    },

    /// A job was removed from the table
    JobRemoved {
        /// Job ID
        id: JobId,
    },

    /// The library content changed (item finalized, job cleaned up)
    LibraryChanged {
        /// When the change happened
        at: DateTime<Utc>,
    },

    /// The manager is shutting down
    Shutdown,
}
