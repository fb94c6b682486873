//! # vault-ingest
//!
//! Crash-recoverable ingestion of downloaded page images into an encrypted
//! content vault.
//!
//! Pages are streamed straight from the network through AES-256-GCM into a
//! per-job temp directory, so plaintext never touches disk. Once every page is
//! fetched, the mover re-encrypts them into the library under vault-derived
//! keys, writes encrypted index and metadata records and removes the temp
//! directory. Jobs survive restarts: the fetch cursor, page list and key mode
//! are persisted in SQLite and interrupted jobs resume where they left off.
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use vault_ingest::{Config, DirectDownloadOptions, JobManager, JobMeta, MasterKeyVault};
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let vault = Arc::new(MasterKeyVault::unlocked([7; 32]));
//!     let manager = JobManager::new(Config::default(), vault).await?;
//!
//!     let mut events = manager.subscribe();
//!     tokio::spawn(async move {
//!         while let Ok(event) = events.recv().await {
//!             println!("Event: {:?}", event);
//!         }
//!     });
//!
//!     let meta = JobMeta {
//!         comic_name: Some("Volume 1".to_string()),
//!         ..Default::default()
//!     };
//!     let id = manager
//!         .add_direct_download(
//!             vec!["https://example.com/1.jpg".to_string()],
//!             meta,
//!             DirectDownloadOptions::default(),
//!         )
//!         .await?;
//!     println!("queued job {id}");
//!
//!     Ok(())
//! }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::unwrap_used)]
#![warn(clippy::expect_used)]

/// REST API module
pub mod api;
/// Best-effort deletion with a persisted retry ledger
pub mod cleanup;
/// Configuration types
pub mod config;
/// Streaming AES-256-GCM and per-file sidecars
pub mod crypto;
/// Database persistence layer
pub mod db;
/// Error types
pub mod error;
/// Library records: index, metadata, page entries
pub mod library;
/// Ingestion job manager
pub mod manager;
/// Content mover (temp pages into vault files)
pub mod mover;
/// Retry logic with exponential backoff
pub mod retry;
/// Core types and events
pub mod types;
/// Utility functions
pub mod utils;
/// Vault collaborator
pub mod vault;

// Re-export commonly used types
pub use config::Config;
pub use db::Database;
pub use error::{
    ApiError, CipherError, DatabaseError, Error, ErrorDetail, JobError, Result, ToHttpStatus,
};
pub use manager::{ImportOutcome, JobManager};
pub use types::{DirectDownloadOptions, Event, JobId, JobMeta, JobSnapshot, JobStatus};
pub use vault::{MasterKeyVault, NoVault, Vault};

/// Helper function to run the manager with graceful signal handling.
///
/// Waits for a termination signal and then calls the manager's `shutdown()` method.
///
/// - **Unix:** listens for SIGTERM and SIGINT, with fallbacks if signal registration fails.
/// - **Windows/other:** listens for Ctrl+C via `tokio::signal::ctrl_c()`.
///
/// # Example
///
/// ```no_run
/// use std::sync::Arc;
/// use vault_ingest::{Config, JobManager, MasterKeyVault, run_with_shutdown};
///
/// #[tokio::main]
/// async fn main() -> Result<(), Box<dyn std::error::Error>> {
///     let vault = Arc::new(MasterKeyVault::locked());
///     let manager = JobManager::new(Config::default(), vault).await?;
///
///     run_with_shutdown(manager).await?;
///
///     Ok(())
/// }
/// ```
pub async fn run_with_shutdown(manager: JobManager) -> Result<()> {
    wait_for_signal().await;
    manager.shutdown().await
}

#[cfg(unix)]
async fn wait_for_signal() {
    use tokio::signal::unix::{SignalKind, signal};

    // Registration can fail in restricted environments (containers, tests)
    let sigterm_result = signal(SignalKind::terminate());
    let sigint_result = signal(SignalKind::interrupt());

    match (sigterm_result, sigint_result) {
        (Ok(mut sigterm), Ok(mut sigint)) => {
            tokio::select! {
                _ = sigterm.recv() => {
                    tracing::info!("Received SIGTERM signal");
                }
                _ = sigint.recv() => {
                    tracing::info!("Received SIGINT signal (Ctrl+C)");
                }
            }
        }
        (Err(e), _) => {
            tracing::warn!(error = %e, "Could not register SIGTERM handler, waiting for SIGINT only");
            if let Ok(mut sigint) = signal(SignalKind::interrupt()) {
                sigint.recv().await;
                tracing::info!("Received SIGINT signal (Ctrl+C)");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
        (_, Err(e)) => {
            tracing::warn!(error = %e, "Could not register SIGINT handler, waiting for SIGTERM only");
            if let Ok(mut sigterm) = signal(SignalKind::terminate()) {
                sigterm.recv().await;
                tracing::info!("Received SIGTERM signal");
            } else {
                tracing::error!("Could not register any signal handlers, using ctrl_c fallback");
                tokio::signal::ctrl_c().await.ok();
            }
        }
    }
}

#[cfg(not(unix))]
async fn wait_for_signal() {
    match tokio::signal::ctrl_c().await {
        Ok(()) => {
            tracing::info!("Received Ctrl+C signal");
        }
        Err(e) => {
            tracing::error!(error = %e, "Failed to listen for Ctrl+C signal");
        }
    }
}
