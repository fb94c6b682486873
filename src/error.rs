//! Error types for vault-ingest
//!
//! This module provides error handling for the library, including:
//! - Domain-specific error types (Cipher, Job, Database)
//! - Classification of cipher failures into fatal and skippable
//! - HTTP status code mapping and structured error bodies for the control API

use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use thiserror::Error;
use utoipa::ToSchema;

/// Result type alias for vault-ingest operations
pub type Result<T> = std::result::Result<T, Error>;

/// Main error type for vault-ingest
///
/// Each variant carries enough context to produce the human-readable message that
/// ends up on a job record.
#[derive(Debug, Error)]
pub enum Error {
    /// Configuration error with context about which setting is invalid
    #[error("configuration error: {message}")]
    Config {
        /// Human-readable error message describing the configuration issue
        message: String,
        /// The configuration key that caused the error (e.g., "library_root")
        key: Option<String>,
    },

    /// Database operation failed
    #[error("database error: {0}")]
    Database(#[from] DatabaseError),

    /// SQLx database error
    #[error("database error: {0}")]
    Sqlx(#[from] sqlx::Error),

    /// Streaming cipher or vault failure
    #[error("{0}")]
    Cipher(#[from] CipherError),

    /// Job-related error
    #[error("{0}")]
    Job(#[from] JobError),

    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// Shutdown in progress - not accepting new jobs
    #[error("shutdown in progress: not accepting new jobs")]
    ShuttingDown,

    /// Network error
    #[error("network error: {0}")]
    Network(#[from] reqwest::Error),

    /// Serialization error
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// API server error
    #[error("API server error: {0}")]
    ApiServerError(String),

    /// Other error
    #[error("{0}")]
    Other(String),
}

impl Error {
    /// Whether this error must abort the whole job rather than skip a single page
    pub fn is_fatal(&self) -> bool {
        match self {
            Error::Cipher(e) => e.is_fatal(),
            _ => false,
        }
    }
}

/// Database-related errors
#[derive(Debug, Error)]
pub enum DatabaseError {
    /// Failed to connect to database
    #[error("failed to connect to database: {0}")]
    ConnectionFailed(String),

    /// Failed to run migrations
    #[error("failed to run migrations: {0}")]
    MigrationFailed(String),

    /// Query failed
    #[error("query failed: {0}")]
    QueryFailed(String),
}

/// Streaming cipher and vault errors
#[derive(Debug, Error)]
pub enum CipherError {
    /// Writing ciphertext to disk failed (disk full, permissions, ...)
    #[error("failed to write encrypted output {path}: {reason}")]
    Write {
        /// The output file that could not be written
        path: PathBuf,
        /// The underlying I/O failure
        reason: String,
    },

    /// Reading the plaintext source failed (network body, input file)
    #[error("failed to read plaintext source: {0}")]
    Source(String),

    /// Authentication tag or associated data did not verify
    #[error("authentication failed for {path}")]
    AuthFailed {
        /// The ciphertext that failed verification
        path: PathBuf,
    },

    /// Neither the sidecar nor its backup exists
    #[error("Missing encryption metadata: {path}")]
    MetadataMissing {
        /// The expected primary sidecar path
        path: PathBuf,
    },

    /// Sidecar exists but is unreadable or carries wrong-length fields
    #[error("Invalid encryption metadata for {path}: {reason}")]
    MetadataInvalid {
        /// The sidecar that failed validation
        path: PathBuf,
        /// What was wrong with it
        reason: String,
    },

    /// Sidecar schema version is not understood
    #[error("Unsupported encryption metadata version: {version}")]
    UnsupportedMetadataVersion {
        /// The version found in the record
        version: i64,
    },

    /// The vault is initialized but no master key is loaded
    #[error("Vault is locked. Unlock before finalizing downloads.")]
    VaultLocked,

    /// The vault has never been initialized
    #[error("Vault required for encrypted data.")]
    VaultUninitialized,

    /// A vault file does not carry the expected header
    #[error("invalid encrypted file format: {0}")]
    InvalidFormat(String),
}

impl CipherError {
    /// Fatal errors abort a job; everything else is treated as a per-page skip
    pub fn is_fatal(&self) -> bool {
        matches!(self, CipherError::Write { .. })
    }

    /// Short machine-readable code, also used in mover reports
    pub fn code(&self) -> &'static str {
        match self {
            CipherError::Write { .. } => "write_failed",
            CipherError::Source(_) => "source_failed",
            CipherError::AuthFailed { .. } => "auth_failed",
            CipherError::MetadataMissing { .. } => "metadata_missing",
            CipherError::MetadataInvalid { .. } => "metadata_invalid",
            CipherError::UnsupportedMetadataVersion { .. } => "unsupported_metadata_version",
            CipherError::VaultLocked => "vault_locked",
            CipherError::VaultUninitialized => "vault_uninitialized",
            CipherError::InvalidFormat(_) => "invalid_format",
        }
    }
}

/// Job-related errors
#[derive(Debug, Error)]
pub enum JobError {
    /// Job not found in the job table
    #[error("Job not found: {id}")]
    NotFound {
        /// The job ID that was not found
        id: i64,
    },

    /// Cannot perform operation in current state
    #[error("{reason}")]
    InvalidState {
        /// The job ID that is in an invalid state for the operation
        id: i64,
        /// The operation that was attempted (e.g., "stop", "start")
        operation: String,
        /// The current status that prevents the operation
        current_state: String,
        /// Human-readable refusal shown to the user
        reason: String,
    },

    /// The submitted URL list was empty
    #[error("No images found for direct download.")]
    NoImages,

    /// The temp directory backing a job is gone
    #[error("temp directory missing: {path}")]
    TempDirMissing {
        /// The job ID
        id: i64,
        /// Where the temp directory was expected
        path: PathBuf,
    },

    /// The job carries no page URLs
    #[error("missing image list for job {id}")]
    MissingImageList {
        /// The job ID
        id: i64,
    },

    /// Finalization could not move every page even after the retry pass
    #[error(
        "Image move incomplete. Moved={moved}, found={found}, skipped={skipped}. Keeping temp folder: {}.{}",
        .temp_dir.display(),
        first_error_suffix(.first_error)
    )]
    MoveIncomplete {
        /// Files that reached the final directory
        moved: usize,
        /// Files found in the temp directory
        found: usize,
        /// Files that failed
        skipped: usize,
        /// The temp directory that is being kept
        temp_dir: PathBuf,
        /// First per-file error, if any
        first_error: Option<String>,
    },

    /// A folder given for import does not exist
    #[error("Source folder does not exist: {}", .path.display())]
    ImportSourceMissing {
        /// The folder that was given
        path: PathBuf,
    },

    /// A folder given for import holds no supported images
    #[error("No image files found in {}.", .path.display())]
    ImportNoImages {
        /// The folder that was scanned
        path: PathBuf,
    },

    /// No page of an imported folder made it into the library
    #[error("Failed to encrypt and copy image files from {}.{}", .path.display(), first_error_suffix(.first_error))]
    ImportFailed {
        /// The folder that was imported
        path: PathBuf,
        /// First per-file error, if any
        first_error: Option<String>,
    },
}

fn first_error_suffix(first_error: &Option<String>) -> String {
    first_error
        .as_deref()
        .map(|e| format!(" First error: {e}"))
        .unwrap_or_default()
}

/// API error response format
///
/// # Example JSON Response
///
/// ```json
/// {
///   "error": {
///     "code": "job_not_found",
///     "message": "Job not found: 12",
///     "details": { "job_id": 12 }
///   }
/// }
/// ```
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ApiError {
    /// The error details
    pub error: ErrorDetail,
}

/// Detailed error information for API responses
#[derive(Debug, Clone, Serialize, Deserialize, ToSchema)]
pub struct ErrorDetail {
    /// Machine-readable error code (e.g., "not_found", "invalid_state")
    pub code: String,

    /// Human-readable error message
    pub message: String,

    /// Optional additional context about the error
    #[serde(skip_serializing_if = "Option::is_none")]
    pub details: Option<serde_json::Value>,
}

impl ApiError {
    /// Create a new API error with code and message
    pub fn new(code: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            error: ErrorDetail {
                code: code.into(),
                message: message.into(),
                details: None,
            },
        }
    }

    /// Create a "not found" error
    pub fn not_found(resource: impl Into<String>) -> Self {
        Self::new("not_found", format!("{} not found", resource.into()))
    }

    /// Create a "validation error" error
    pub fn validation(message: impl Into<String>) -> Self {
        Self::new("validation_error", message)
    }
}

/// Convert errors to HTTP status codes for API responses
pub trait ToHttpStatus {
    /// Get the HTTP status code for this error
    fn status_code(&self) -> u16;

    /// Get the machine-readable error code
    fn error_code(&self) -> &str;
}

impl ToHttpStatus for Error {
    fn status_code(&self) -> u16 {
        match self {
            Error::Config { .. } => 400,

            Error::Job(JobError::NotFound { .. }) => 404,
            Error::Job(JobError::InvalidState { .. }) => 409,
            Error::Job(JobError::NoImages) => 422,
            Error::Job(JobError::TempDirMissing { .. }) => 410,
            Error::Job(JobError::MissingImageList { .. }) => 422,
            Error::Job(JobError::MoveIncomplete { .. }) => 500,
            Error::Job(JobError::ImportSourceMissing { .. }) => 404,
            Error::Job(JobError::ImportNoImages { .. }) => 422,
            Error::Job(JobError::ImportFailed { .. }) => 500,

            // Locked vault needs user action, not a retry
            Error::Cipher(CipherError::VaultLocked) => 423,
            Error::Cipher(CipherError::VaultUninitialized) => 423,
            Error::Cipher(_) => 500,

            Error::Database(_) | Error::Sqlx(_) => 500,
            Error::Io(_) => 500,
            Error::Serialization(_) => 500,
            Error::ApiServerError(_) => 500,
            Error::Other(_) => 500,

            Error::Network(_) => 502,

            Error::ShuttingDown => 503,
        }
    }

    fn error_code(&self) -> &str {
        match self {
            Error::Config { .. } => "config_error",
            Error::Database(_) | Error::Sqlx(_) => "database_error",
            Error::Cipher(e) => e.code(),
            Error::Job(e) => match e {
                JobError::NotFound { .. } => "job_not_found",
                JobError::InvalidState { .. } => "invalid_state",
                JobError::NoImages => "no_images",
                JobError::TempDirMissing { .. } => "temp_dir_missing",
                JobError::MissingImageList { .. } => "missing_image_list",
                JobError::MoveIncomplete { .. } => "move_incomplete",
                JobError::ImportSourceMissing { .. } => "import_source_missing",
                JobError::ImportNoImages { .. } => "no_images",
                JobError::ImportFailed { .. } => "import_failed",
            },
            Error::Io(_) => "io_error",
            Error::ShuttingDown => "shutting_down",
            Error::Network(_) => "network_error",
            Error::Serialization(_) => "serialization_error",
            Error::ApiServerError(_) => "api_server_error",
            Error::Other(_) => "internal_error",
        }
    }
}

impl From<Error> for ApiError {
    fn from(error: Error) -> Self {
        let code = error.error_code().to_string();
        let message = error.to_string();

        let details = match &error {
            Error::Job(JobError::NotFound { id }) => Some(serde_json::json!({
                "job_id": id,
            })),
            Error::Job(JobError::InvalidState {
                id,
                operation,
                current_state,
                ..
            }) => Some(serde_json::json!({
                "job_id": id,
                "operation": operation,
                "current_state": current_state,
            })),
            Error::Job(JobError::TempDirMissing { id, path }) => Some(serde_json::json!({
                "job_id": id,
                "path": path,
            })),
            Error::Job(JobError::MoveIncomplete {
                moved,
                found,
                skipped,
                temp_dir,
                ..
            }) => Some(serde_json::json!({
                "moved": moved,
                "found": found,
                "skipped": skipped,
                "temp_dir": temp_dir,
            })),
            _ => None,
        };

        ApiError {
            error: ErrorDetail {
                code,
                message,
                details,
            },
        }
    }
}
