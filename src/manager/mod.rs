//! Ingestion job manager split into focused submodules.
//!
//! The `JobManager` struct and its methods are organized by domain:
//! - [`job`] - In-memory job record and its persisted form
//! - [`fetch`] - Job submission and the sequential page fetch loop
//! - [`pipeline`] - Finalization: move, index, cleanup
//! - [`control`] - Stop/start/remove and queries
//! - [`import`] - Local folder import
//! - [`lifecycle`] - Startup recovery and shutdown coordination

mod control;
mod fetch;
mod import;
mod job;
mod lifecycle;
mod pipeline;

// unwrap/expect are acceptable in tests for concise failure-on-error assertions
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
pub(crate) mod test_helpers;
#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;

use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, AtomicI64, Ordering};

use crate::config::Config;
use crate::crypto::DirectCipher;
use crate::db::Database;
use crate::error::{Error, JobError, Result};
use crate::types::{Event, JobId};
use crate::vault::Vault;

use job::Job;

pub use import::ImportOutcome;

/// Tracks which jobs currently have a fetch loop or pipeline running
#[derive(Clone, Default)]
pub(crate) struct ActiveTasks {
    inner: Arc<std::sync::Mutex<HashSet<JobId>>>,
}

impl ActiveTasks {
    /// Claim `id`; `None` if a task for it is already running
    pub(crate) fn claim(&self, id: JobId) -> Option<ActiveGuard> {
        let mut set = self.inner.lock().unwrap_or_else(|e| e.into_inner());
        if !set.insert(id) {
            return None;
        }
        Some(ActiveGuard {
            id,
            inner: self.inner.clone(),
        })
    }

    pub(crate) fn len(&self) -> usize {
        self.inner.lock().unwrap_or_else(|e| e.into_inner()).len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub(crate) fn contains(&self, id: JobId) -> bool {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .contains(&id)
    }
}

/// Releases a claimed job when dropped
pub(crate) struct ActiveGuard {
    id: JobId,
    inner: Arc<std::sync::Mutex<HashSet<JobId>>>,
}

impl Drop for ActiveGuard {
    fn drop(&mut self) {
        self.inner
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .remove(&self.id);
    }
}

/// Main job manager instance (cloneable - all fields are Arc-wrapped)
#[derive(Clone)]
pub struct JobManager {
    /// Database instance for persistence
    /// Public for integration tests to query job records
    pub db: Arc<Database>,
    /// Event broadcast channel sender (multiple subscribers supported)
    pub(crate) event_tx: tokio::sync::broadcast::Sender<Event>,
    /// Configuration
    pub(crate) config: Arc<Config>,
    /// Vault collaborator
    pub(crate) vault: Arc<dyn Vault>,
    /// Sidecar cipher for temp pages
    pub(crate) cipher: DirectCipher,
    /// HTTP client for page fetches
    pub(crate) http: reqwest::Client,
    /// Job table; the single writer of job state
    pub(crate) jobs: Arc<tokio::sync::Mutex<HashMap<JobId, Job>>>,
    /// Next job ID
    pub(crate) next_id: Arc<AtomicI64>,
    /// Flag to indicate whether new jobs are accepted (set to false during shutdown)
    pub(crate) accepting_new: Arc<AtomicBool>,
    /// Jobs with a running fetch loop or pipeline
    pub(crate) active: ActiveTasks,
}

impl JobManager {
    /// Create a new JobManager instance
    ///
    /// This initializes all core components:
    /// - Creates the library root
    /// - Opens/creates the SQLite database and runs migrations
    /// - Loads persisted jobs, recovers orphaned temp directories and sweeps
    ///   the pending-cleanup ledger
    /// - Resumes interrupted jobs
    pub async fn new(config: Config, vault: Arc<dyn Vault>) -> Result<Self> {
        let manager = Self::build(config, vault).await?;

        if manager.db.was_unclean_shutdown().await? {
            tracing::warn!("previous session did not shut down cleanly");
        }
        manager.db.set_clean_start().await?;

        manager.load_jobs().await?;
        manager.recover_temp_dirs().await;
        manager.sweep_pending_cleanup().await;
        let resumed = manager.resume_jobs().await?;
        if resumed > 0 {
            tracing::info!(resumed, "resumed interrupted jobs");
        }

        Ok(manager)
    }

    /// Construct the manager without touching persisted jobs
    pub(crate) async fn build(config: Config, vault: Arc<dyn Vault>) -> Result<Self> {
        let library_root = config.library_root().clone();
        tokio::fs::create_dir_all(&library_root)
            .await
            .map_err(|e| {
                Error::Io(std::io::Error::new(
                    e.kind(),
                    format!(
                        "Failed to create library root '{}': {}",
                        library_root.display(),
                        e
                    ),
                ))
            })?;

        let db = Database::new(&config.persistence.database_path).await?;

        // Create broadcast channel with buffer size of 1000 events
        let (event_tx, _rx) = tokio::sync::broadcast::channel(1000);

        let http = reqwest::Client::builder()
            .user_agent(config.fetch.user_agent.clone())
            .timeout(config.fetch.request_timeout)
            .build()?;

        let cipher = DirectCipher::new(
            vault.clone(),
            library_root,
            config.crypto.upgrade_random_on_read,
        );

        Ok(Self {
            db: Arc::new(db),
            event_tx,
            config: Arc::new(config),
            vault,
            cipher,
            http,
            jobs: Arc::new(tokio::sync::Mutex::new(HashMap::new())),
            next_id: Arc::new(AtomicI64::new(1)),
            accepting_new: Arc::new(AtomicBool::new(true)),
            active: ActiveTasks::default(),
        })
    }

    /// Subscribe to job events
    ///
    /// Multiple subscribers are supported. Each subscriber receives all events independently.
    /// Events are buffered, but if a subscriber falls behind by more than 1000 events,
    /// it will receive a `RecvError::Lagged` error.
    ///
    /// # Examples
    ///
    /// ```no_run
    /// use std::sync::Arc;
    /// use vault_ingest::{Config, JobManager, MasterKeyVault};
    ///
    /// #[tokio::main]
    /// async fn main() -> Result<(), Box<dyn std::error::Error>> {
    ///     let vault = Arc::new(MasterKeyVault::unlocked([7; 32]));
    ///     let manager = JobManager::new(Config::default(), vault).await?;
    ///
    ///     let mut events = manager.subscribe();
    ///     tokio::spawn(async move {
    ///         while let Ok(event) = events.recv().await {
    ///             println!("Event: {:?}", event);
    ///         }
    ///     });
    ///
    ///     Ok(())
    /// }
    /// ```
    pub fn subscribe(&self) -> tokio::sync::broadcast::Receiver<Event> {
        self.event_tx.subscribe()
    }

    /// Get the current configuration
    pub fn get_config(&self) -> Arc<Config> {
        Arc::clone(&self.config)
    }

    /// The vault this manager encrypts into
    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.vault
    }

    /// Emit an event to all subscribers
    ///
    /// If there are no active subscribers, the event is silently dropped.
    pub(crate) fn emit_event(&self, event: Event) {
        self.event_tx.send(event).ok();
    }

    pub(crate) fn emit_library_changed(&self) {
        self.emit_event(Event::LibraryChanged {
            at: chrono::Utc::now(),
        });
    }

    pub(crate) fn is_accepting(&self) -> bool {
        self.accepting_new.load(Ordering::SeqCst)
    }

    /// Mutate a job, persist it and broadcast the new snapshot
    ///
    /// The table lock is held across the write so records land in the
    /// database in the same order as the changes.
    pub(crate) async fn update_job<R>(&self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Result<R> {
        let mut jobs = self.jobs.lock().await;
        let job = jobs
            .get_mut(&id)
            .ok_or(Error::Job(JobError::NotFound { id: id.0 }))?;
        let result = f(job);
        let record = job.to_record();
        let snapshot = job.snapshot();

        if let Err(e) = self.db.upsert_job(&record).await {
            tracing::warn!(job_id = %id, error = %e, "failed to persist job");
        }
        drop(jobs);

        self.emit_event(Event::JobUpdated { job: snapshot });
        Ok(result)
    }

    /// Read a job without changing it
    pub(crate) async fn read_job<R>(&self, id: JobId, f: impl FnOnce(&Job) -> R) -> Result<R> {
        let jobs = self.jobs.lock().await;
        let job = jobs
            .get(&id)
            .ok_or(Error::Job(JobError::NotFound { id: id.0 }))?;
        Ok(f(job))
    }

    /// Set status and message in one update
    pub(crate) async fn set_status(
        &self,
        id: JobId,
        status: crate::types::JobStatus,
        message: impl Into<String>,
    ) -> Result<()> {
        let message = message.into();
        self.update_job(id, move |job| {
            job.status = status;
            job.message = message;
        })
        .await
    }

    /// Spawn the REST API server in a background task
    pub fn spawn_api_server(&self) -> tokio::task::JoinHandle<Result<()>> {
        let manager = Arc::new(self.clone());
        let config = self.config.clone();

        tokio::spawn(async move { crate::api::start_api_server(manager, config).await })
    }
}
