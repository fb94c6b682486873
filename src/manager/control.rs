//! Job control: stop, start, remove, and queries.

use tokio_util::sync::CancellationToken;

use crate::error::{Error, JobError, Result};
use crate::types::{Event, JobId, JobSnapshot, JobStatus};
use crate::utils::path_exists;

use super::JobManager;
use super::job::Job;
use super::pipeline::FailureCleanup;

fn invalid_state(job: &Job, operation: &str, reason: &str) -> Error {
    Error::Job(JobError::InvalidState {
        id: job.id.0,
        operation: operation.to_string(),
        current_state: job.status.to_string(),
        reason: reason.to_string(),
    })
}

impl JobManager {
    /// Stop a job that is still fetching
    ///
    /// Sets the stop flag and cancels the in-flight request; the fetch loop
    /// notices at its next boundary. The job keeps its temp directory and can
    /// be restarted with [`start_job_from_stop`](Self::start_job_from_stop).
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] if the job does not exist
    /// - [`JobError::InvalidState`] if the job is completed, failed or already
    ///   finalizing
    ///
    /// # Examples
    ///
    /// ```no_run
    /// # use vault_ingest::*;
    /// # async fn example(manager: JobManager, id: JobId) -> Result<()> {
    /// manager.stop_job(id).await?;
    /// # Ok(())
    /// # }
    /// ```
    pub async fn stop_job(&self, id: JobId) -> Result<()> {
        let refusal = self
            .read_job(id, |job| {
                if job.status == JobStatus::Completed {
                    Some(invalid_state(job, "stop", "Job is already completed."))
                } else if job.status == JobStatus::Failed {
                    Some(invalid_state(job, "stop", "Job has failed."))
                } else if job.post_processed || job.status.is_finalization_phase() {
                    Some(invalid_state(job, "stop", "Job is finalizing/moving."))
                } else {
                    None
                }
            })
            .await?;
        if let Some(e) = refusal {
            return Err(e);
        }

        self.update_job(id, |job| {
            job.stop_requested = true;
            job.cancel.cancel();
            job.status = JobStatus::Stopped;
            job.message = "Stopped.".to_string();
        })
        .await?;
        tracing::info!(job_id = %id, "job stopped");
        Ok(())
    }

    /// Restart a stopped job from its saved cursor
    ///
    /// Pages already on disk are skipped by the fetch loop. A job whose temp
    /// directory or URL list is gone is marked failed instead.
    ///
    /// # Errors
    ///
    /// - [`JobError::NotFound`] if the job does not exist
    /// - [`JobError::InvalidState`] if the job is completed or finalizing
    /// - [`JobError::TempDirMissing`] / [`JobError::MissingImageList`] when the
    ///   job cannot be resumed
    /// - [`Error::ShuttingDown`] during shutdown
    pub async fn start_job_from_stop(&self, id: JobId) -> Result<()> {
        let (refusal, temp_dir, has_urls) = self
            .read_job(id, |job| {
                let refusal = if job.status == JobStatus::Completed {
                    Some(invalid_state(job, "start", "Job is already completed."))
                } else if job.post_processed || job.status.is_finalization_phase() {
                    Some(invalid_state(job, "start", "Job is finalizing/moving."))
                } else {
                    None
                };
                (refusal, job.temp_dir.clone(), !job.direct_urls.is_empty())
            })
            .await?;
        if let Some(e) = refusal {
            return Err(e);
        }

        if !path_exists(&temp_dir).await {
            self.set_status(id, JobStatus::Failed, "Start failed: temp directory missing.")
                .await?;
            return Err(JobError::TempDirMissing {
                id: id.0,
                path: temp_dir,
            }
            .into());
        }
        if !has_urls {
            self.set_status(id, JobStatus::Failed, "Start failed: missing image list.")
                .await?;
            return Err(JobError::MissingImageList { id: id.0 }.into());
        }
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        self.update_job(id, |job| {
            job.stop_requested = false;
            job.cancel = CancellationToken::new();
            job.status = JobStatus::Starting;
            job.message = "Starting…".to_string();
        })
        .await?;
        tracing::info!(job_id = %id, "job restarted");
        self.spawn_direct_job(id);
        Ok(())
    }

    /// Remove a job from the table and the store
    ///
    /// A job that did not complete is stopped first and, with
    /// `delete_on_fail`, its directories are purged. Completed items stay in
    /// the library.
    pub async fn remove_job(&self, id: JobId) -> Result<()> {
        let completed = self
            .read_job(id, |job| job.status == JobStatus::Completed)
            .await?;
        if !completed {
            self.cleanup_on_failure(id, FailureCleanup::Purge).await;
        }

        self.jobs.lock().await.remove(&id);
        self.db.delete_job(id).await?;
        self.emit_event(Event::JobRemoved { id });
        tracing::info!(job_id = %id, "job removed");
        Ok(())
    }

    /// Same as [`remove_job`](Self::remove_job)
    pub async fn cancel_job(&self, id: JobId) -> Result<()> {
        self.remove_job(id).await
    }

    /// Remove every job that has not completed
    ///
    /// Returns how many jobs were removed.
    pub async fn cancel_all_jobs(&self) -> usize {
        let ids: Vec<JobId> = {
            let jobs = self.jobs.lock().await;
            jobs.values()
                .filter(|job| job.status != JobStatus::Completed)
                .map(|job| job.id)
                .collect()
        };

        let mut removed = 0;
        for id in ids {
            match self.remove_job(id).await {
                Ok(()) => removed += 1,
                Err(e) => tracing::warn!(job_id = %id, error = %e, "failed to cancel job"),
            }
        }
        removed
    }

    /// Drop completed jobs from the table and the store
    ///
    /// Their library items are untouched. Returns how many jobs were cleared.
    pub async fn clear_completed_jobs(&self) -> Result<usize> {
        let ids: Vec<JobId> = {
            let mut jobs = self.jobs.lock().await;
            let ids: Vec<JobId> = jobs
                .values()
                .filter(|job| job.status == JobStatus::Completed)
                .map(|job| job.id)
                .collect();
            for id in &ids {
                jobs.remove(id);
            }
            ids
        };

        for id in &ids {
            self.db.delete_job(*id).await?;
            self.emit_event(Event::JobRemoved { id: *id });
        }
        Ok(ids.len())
    }

    /// Snapshots of every job, oldest first
    pub async fn list_jobs(&self) -> Vec<JobSnapshot> {
        let jobs = self.jobs.lock().await;
        let mut snapshots: Vec<JobSnapshot> = jobs.values().map(Job::snapshot).collect();
        snapshots.sort_by_key(|s| s.id);
        snapshots
    }

    /// Snapshot of one job
    pub async fn get_job(&self, id: JobId) -> Result<JobSnapshot> {
        self.read_job(id, Job::snapshot).await
    }

    /// Whether any job is fetching and has not been asked to stop
    ///
    /// Always false after [`shutdown`](Self::shutdown): the saved statuses
    /// stay resumable, but nothing runs in this process any more.
    pub async fn has_active_downloads(&self) -> bool {
        if !self.is_accepting() {
            return false;
        }
        self.jobs
            .lock()
            .await
            .values()
            .any(|job| job.status.is_fetch_phase() && !job.stop_requested)
    }

    /// Whether any job is fetching or finalizing
    pub async fn has_in_progress_downloads(&self) -> bool {
        self.jobs.lock().await.values().any(|job| {
            job.status.is_fetch_phase() || job.status.is_finalization_phase()
        })
    }
}
