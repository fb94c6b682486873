//! Startup recovery and shutdown coordination.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::Ordering;
use std::time::Duration;

use crate::cleanup::{PurgeOptions, purge_folder_best_effort};
use crate::crypto::read_temp_encryption_info;
use crate::error::Result;
use crate::types::{Event, JobId, JobStatus};
use crate::utils::{list_temp_dirs, path_exists};

use super::JobManager;
use super::job::Job;

/// How long shutdown waits for fetch loops and pipelines to wind down
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(30);

/// What resume decided for one job
enum ResumeAction {
    Fetch,
    Finalize(Option<String>),
    Skip,
}

impl JobManager {
    /// Load persisted jobs into the table
    ///
    /// The ID sequence continues after the highest stored ID.
    pub(crate) async fn load_jobs(&self) -> Result<()> {
        let records = self.db.list_jobs().await?;
        let max_id = self.db.max_job_id().await?;
        self.next_id.store(max_id + 1, Ordering::SeqCst);

        let mut jobs = self.jobs.lock().await;
        for record in records {
            let job = Job::from_record(record);
            jobs.insert(job.id, job);
        }
        tracing::debug!(jobs = jobs.len(), next_id = max_id + 1, "loaded persisted jobs");
        Ok(())
    }

    /// Restart every job that was interrupted mid-flight
    ///
    /// Finalization-phase jobs re-run the pipeline; fetch-phase jobs re-enter
    /// the fetch loop, which skips pages already on disk. Returns how many
    /// jobs were resumed.
    pub(crate) async fn resume_jobs(&self) -> Result<usize> {
        let candidates: Vec<(JobId, JobStatus, bool, PathBuf, bool, usize)> = {
            let jobs = self.jobs.lock().await;
            let mut list: Vec<_> = jobs
                .values()
                .filter(|job| job.status.is_fetch_phase() || job.status.is_finalization_phase())
                .map(|job| {
                    (
                        job.id,
                        job.status,
                        job.post_processed,
                        job.temp_dir.clone(),
                        job.direct_urls.is_empty(),
                        job.direct_skipped,
                    )
                })
                .collect();
            list.sort_by_key(|c| c.0);
            list
        };

        let mut resumed = 0;
        for (id, status, post_processed, temp_dir, no_urls, skipped) in candidates {
            let action = if status.is_finalization_phase() || post_processed {
                self.prepare_finalize_resume(id, &temp_dir, skipped).await?
            } else {
                self.prepare_fetch_resume(id, &temp_dir, no_urls).await?
            };

            match action {
                ResumeAction::Fetch => {
                    tracing::info!(job_id = %id, "resuming direct download");
                    self.spawn_direct_job(id);
                    resumed += 1;
                }
                ResumeAction::Finalize(note) => {
                    tracing::info!(job_id = %id, "resuming finalization");
                    self.spawn_pipeline(id, note);
                    resumed += 1;
                }
                ResumeAction::Skip => {}
            }
        }
        Ok(resumed)
    }

    async fn prepare_finalize_resume(
        &self,
        id: JobId,
        temp_dir: &std::path::Path,
        skipped: usize,
    ) -> Result<ResumeAction> {
        if !path_exists(temp_dir).await {
            tracing::warn!(job_id = %id, temp_dir = ?temp_dir, "cannot resume finalization");
            self.set_status(id, JobStatus::Failed, "Resume failed: temp directory missing.")
                .await?;
            return Ok(ResumeAction::Skip);
        }
        self.update_job(id, |job| {
            job.post_processed = true;
            job.status = JobStatus::Finalizing;
            job.message = "Resuming finalization after restart…".to_string();
        })
        .await?;
        Ok(ResumeAction::Finalize(
            (skipped > 0).then(|| format!("Skipped {skipped} page(s)")),
        ))
    }

    async fn prepare_fetch_resume(
        &self,
        id: JobId,
        temp_dir: &std::path::Path,
        no_urls: bool,
    ) -> Result<ResumeAction> {
        if no_urls {
            self.set_status(id, JobStatus::Failed, "Resume failed: missing image list.")
                .await?;
            return Ok(ResumeAction::Skip);
        }
        if !path_exists(temp_dir).await {
            self.set_status(id, JobStatus::Failed, "Resume failed: temp directory missing.")
                .await?;
            return Ok(ResumeAction::Skip);
        }
        if self.vault.is_initialized() && !self.vault.is_unlocked() {
            self.update_job(id, |job| {
                job.stop_requested = true;
                job.status = JobStatus::Stopped;
                job.message = "Vault is locked. Unlock to resume download.".to_string();
            })
            .await?;
            return Ok(ResumeAction::Skip);
        }
        self.set_status(id, JobStatus::Starting, "Resuming direct download…")
            .await?;
        Ok(ResumeAction::Fetch)
    }

    /// Purge orphaned temp directories and annotate live ones
    ///
    /// A `tmp_*` directory owned by no job, or by a completed one, is purged.
    /// A failed job's temp directory still exists only because failure cleanup
    /// kept it, so it stays. A live job whose encryption mode was never
    /// recorded gets it from the first sidecar in its temp directory.
    pub(crate) async fn recover_temp_dirs(&self) {
        let owners: HashMap<PathBuf, (JobId, JobStatus, bool)> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .map(|job| {
                    (
                        job.temp_dir.clone(),
                        (job.id, job.status, job.encryption.is_some()),
                    )
                })
                .collect()
        };

        let options = PurgeOptions {
            timeout: self.config.cleanup.purge_timeout,
            register_trash: true,
        };
        for dir in list_temp_dirs(self.config.library_root()).await {
            match owners.get(&dir) {
                None => {
                    tracing::info!(path = ?dir, "purging orphaned temp directory");
                    purge_folder_best_effort(&self.db, &dir, options).await;
                }
                Some((id, JobStatus::Completed, _)) => {
                    tracing::info!(job_id = %id, path = ?dir, "purging temp directory of completed job");
                    purge_folder_best_effort(&self.db, &dir, options).await;
                }
                Some((_, JobStatus::Failed, _)) => {}
                Some((id, _, false)) => {
                    if let Some(info) = read_temp_encryption_info(&dir).await {
                        let id = *id;
                        tracing::debug!(job_id = %id, key_mode = %info.key_mode, "recorded temp encryption mode");
                        self.update_job(id, |job| job.encryption = Some(info.key_mode))
                            .await
                            .ok();
                    }
                }
                Some(_) => {}
            }
        }
    }

    /// Gracefully shut down the manager
    ///
    /// This method performs a graceful shutdown sequence:
    /// 1. Stops accepting new jobs
    /// 2. Cancels every in-flight page request
    /// 3. Waits (bounded) for fetch loops and pipelines to return
    /// 4. Persists every job
    /// 5. Marks the shutdown clean and emits [`Event::Shutdown`]
    ///
    /// Interrupted jobs keep their status and resume on the next start.
    pub async fn shutdown(&self) -> Result<()> {
        tracing::info!("Initiating graceful shutdown");

        self.accepting_new.store(false, Ordering::SeqCst);
        {
            let jobs = self.jobs.lock().await;
            for job in jobs.values() {
                job.cancel.cancel();
            }
        }

        let wait = async {
            while !self.active.is_empty() {
                tokio::time::sleep(Duration::from_millis(50)).await;
            }
        };
        if tokio::time::timeout(SHUTDOWN_TIMEOUT, wait).await.is_err() {
            tracing::warn!(
                active = self.active.len(),
                "Timeout waiting for jobs to stop, proceeding with shutdown"
            );
        }

        if let Err(e) = self.persist_all_jobs().await {
            tracing::error!(error = %e, "Failed to persist final state during shutdown");
        }

        if let Err(e) = self.db.set_clean_shutdown().await {
            tracing::error!(error = %e, "Failed to mark clean shutdown in database");
        } else {
            tracing::info!("Marked clean shutdown in database");
        }

        self.emit_event(Event::Shutdown);
        tracing::info!("Shutdown complete");
        Ok(())
    }

    async fn persist_all_jobs(&self) -> Result<()> {
        let jobs = self.jobs.lock().await;
        for job in jobs.values() {
            self.db.upsert_job(&job.to_record()).await?;
        }
        Ok(())
    }
}
