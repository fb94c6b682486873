//! Finalization: move pages into the library, write records, clean up.

use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::cleanup::{
    PurgeOptions, purge_folder_best_effort, register_pending_file, run_pending_cleanup_sweep,
    run_pending_file_cleanup_sweep, try_delete_file_with_retries,
};
use crate::crypto::{meta_backup_path, meta_path};
use crate::error::{CipherError, Error, JobError, Result};
use crate::library::{
    INDEX_FILE, IndexRecord, METADATA_FILE, MetadataRecord, PageEntry, list_page_files,
    write_encrypted_json,
};
use crate::mover::{MoveOptions, MoveProgress, MoveReport, detect_source, move_to_vault};
use crate::types::{JobId, JobMeta, JobStatus};
use crate::utils::{list_files_recursive, path_exists};

use super::JobManager;
use super::fetch::{PageResult, build_headers};

/// What failure cleanup leaves on disk
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum FailureCleanup {
    /// Purge the temp and final directories
    Purge,
    /// Purge the temp directory; keep a final directory that holds moved pages
    KeepMoved,
    /// Keep the temp directory and any moved pages
    KeepAll,
}

impl FailureCleanup {
    fn after_finalize_error(error: &Error) -> Self {
        if preserves_temp(error) {
            Self::KeepAll
        } else {
            Self::KeepMoved
        }
    }
}

/// Errors after which the temp directory is kept for inspection or retry
fn preserves_temp(error: &Error) -> bool {
    matches!(
        error,
        Error::Job(JobError::MoveIncomplete { .. })
            | Error::Cipher(CipherError::VaultLocked)
            | Error::Cipher(CipherError::VaultUninitialized)
    )
}

fn failure_message(error: &Error) -> String {
    if preserves_temp(error) {
        error.to_string()
    } else {
        format!("Finalization failed: {error}")
    }
}

fn completion_message(
    moved: usize,
    total: usize,
    purge_ok: bool,
    trashed: bool,
    note: Option<&str>,
) -> String {
    let cleanup = if trashed {
        "Temp cleanup delayed (moved to trash)."
    } else if purge_ok {
        "Temp cleaned."
    } else {
        "Temp cleanup failed."
    };
    let mut message = format!("Completed. Moved {moved}/{total}. {cleanup}");
    if let Some(note) = note {
        message.push_str(&format!(" {note}."));
    }
    message
}

/// Page entries gathered across mover passes, keyed by output file name
pub(crate) fn collect_entries(report: &MoveReport, entries: &mut HashMap<String, PageEntry>) {
    for page in report.results.iter().filter_map(|r| r.page.as_ref()) {
        entries.insert(page.file.clone(), page.clone());
    }
}

impl JobManager {
    /// Run the pipeline for `id` in a background task
    pub(crate) fn spawn_pipeline(&self, id: JobId, note: Option<String>) {
        let manager = self.clone();
        tokio::spawn(async move {
            let Some(_guard) = manager.active.claim(id) else {
                debug!(job_id = %id, "pipeline already running");
                return;
            };
            manager.post_download_pipeline(id, note).await;
        });
    }

    /// Finalize a fully fetched job
    ///
    /// Failures are recorded on the job. During shutdown the job is left as
    /// it is so finalization resumes on the next start.
    pub(crate) async fn post_download_pipeline(&self, id: JobId, note: Option<String>) {
        let Err(e) = self.finalize(id, note.as_deref()).await else {
            return;
        };

        if matches!(e, Error::Job(JobError::NotFound { .. })) {
            debug!(job_id = %id, "job removed during finalization");
            return;
        }
        if !self.is_accepting() {
            info!(job_id = %id, error = %e, "finalization interrupted by shutdown");
            return;
        }

        error!(job_id = %id, error = %e, "finalization failed");
        self.cleanup_on_failure(id, FailureCleanup::after_finalize_error(&e))
            .await;
        if let Err(status_err) = self
            .set_status(id, JobStatus::Failed, failure_message(&e))
            .await
        {
            debug!(job_id = %id, error = %status_err, "job removed during failure cleanup");
        }
    }

    async fn finalize(&self, id: JobId, note: Option<&str>) -> Result<()> {
        let message = match note {
            Some(note) => format!("Finalizing… ({note})"),
            None => "Finalizing…".to_string(),
        };
        self.set_status(id, JobStatus::Finalizing, message).await?;
        tokio::time::sleep(self.config.finalize.settle_delay).await;

        if !self.vault.is_initialized() || !self.vault.is_unlocked() {
            return Err(CipherError::VaultLocked.into());
        }

        let (temp_dir, final_dir) = self
            .read_job(id, |job| (job.temp_dir.clone(), job.final_dir.clone()))
            .await?;
        if !path_exists(&temp_dir).await {
            return Err(JobError::TempDirMissing {
                id: id.0,
                path: temp_dir,
            }
            .into());
        }

        self.set_status(id, JobStatus::Moving, "Moving pages into the library…")
            .await?;

        let mut entries = HashMap::new();
        let mut report = self
            .move_pages(id, &temp_dir, &final_dir, self.config.mover.concurrency)
            .await?;
        collect_entries(&report, &mut entries);

        if report.moved == 0 || report.skipped > 0 {
            warn!(
                job_id = %id,
                moved = report.moved,
                skipped = report.skipped,
                "page move incomplete, retrying"
            );
            let refetched = self.refetch_implausible_pages(id, &report).await?;
            debug!(job_id = %id, refetched, "retry pass");
            report = self
                .move_pages(id, &temp_dir, &final_dir, self.config.mover.retry_concurrency)
                .await?;
            collect_entries(&report, &mut entries);

            if report.moved == 0 || report.skipped > 0 {
                return Err(JobError::MoveIncomplete {
                    moved: report.moved,
                    found: report.total,
                    skipped: report.skipped,
                    temp_dir,
                    first_error: report.first_error,
                }
                .into());
            }
        }

        if report.plaintext_fallbacks > 0 {
            warn!(
                job_id = %id,
                count = report.plaintext_fallbacks,
                "encrypted temp pages were plaintext images"
            );
        }

        self.write_records(id, &final_dir, &report, entries).await?;

        if let Some(path) = self.read_job(id, |job| job.meta_path.clone()).await? {
            self.delete_meta_file(&path).await;
        }

        self.set_status(id, JobStatus::Cleaning, "Cleaning up temp folder…")
            .await?;
        let purge = purge_folder_best_effort(
            &self.db,
            &temp_dir,
            PurgeOptions {
                timeout: self.config.cleanup.purge_timeout,
                register_trash: true,
            },
        )
        .await;

        self.sweep_pending_cleanup().await;
        self.emit_library_changed();

        // Completed is the last thing observers see
        let message =
            completion_message(report.moved, report.total, purge.ok, purge.trashed, note);
        self.update_job(id, |job| {
            job.status = JobStatus::Completed;
            job.progress = 1.0;
            job.message = message;
        })
        .await?;
        info!(job_id = %id, moved = report.moved, final_dir = ?final_dir, "job completed");
        Ok(())
    }

    /// One mover pass over the pages the fetch loop recorded
    ///
    /// The input list always covers every recorded page, moved or not, so each
    /// page keeps the same output position in every pass.
    async fn move_pages(
        &self,
        id: JobId,
        temp_dir: &Path,
        final_dir: &Path,
        concurrency: usize,
    ) -> Result<MoveReport> {
        let only_files: Vec<PathBuf> = self
            .read_job(id, |job| {
                job.fetched_pages().into_iter().map(|(_, p)| p).collect()
            })
            .await?;

        let source = detect_source(
            temp_dir,
            Some(&only_files),
            self.config.mover.plain_probe_limit,
        )
        .await;

        let (tx, mut rx) = mpsc::unbounded_channel::<MoveProgress>();
        let forwarder = {
            let manager = self.clone();
            tokio::spawn(async move {
                while let Some(p) = rx.recv().await {
                    let verb = if p.skipped { "Scanning/Skipping…" } else { "Moving…" };
                    let progress = p.done as f64 / p.total.max(1) as f64;
                    let update = manager.update_job(id, |job| {
                        job.message = format!("{verb} ({}/{})", p.done, p.total);
                        job.progress = progress;
                    });
                    if update.await.is_err() {
                        break;
                    }
                }
            })
        };

        let options = MoveOptions {
            delete_originals: true,
            flatten: true,
            only_files: Some(only_files),
            concurrency,
            on_progress: Some(Arc::new(move |p| {
                tx.send(p).ok();
            })),
        };
        let result = move_to_vault(&self.cipher, source, temp_dir, final_dir, &options).await;
        drop(options);
        forwarder.await.ok();
        result
    }

    /// Re-fetch pages whose temp file is missing, truncated or lacks a sidecar
    ///
    /// After a pass that moved nothing every page is a candidate; otherwise
    /// only the pages that failed. A page that cannot be re-fetched keeps its
    /// recorded extension. Returns how many pages were re-fetched.
    async fn refetch_implausible_pages(&self, id: JobId, report: &MoveReport) -> Result<usize> {
        let (urls, headers, temp_dir, exts, fetched, token) = self
            .read_job(id, |job| {
                (
                    job.direct_urls.clone(),
                    build_headers(&job.headers, &job.meta),
                    job.temp_dir.clone(),
                    job.direct_exts.clone(),
                    job.fetched_pages(),
                    job.cancel.clone(),
                )
            })
            .await?;
        let total = urls.len();

        let candidates: Vec<usize> = if report.moved == 0 {
            (0..total).collect()
        } else {
            let by_path: HashMap<&PathBuf, usize> = fetched.iter().map(|(i, p)| (p, *i)).collect();
            let failed: HashSet<usize> = report
                .results
                .iter()
                .filter(|r| r.out.is_none())
                .filter_map(|r| by_path.get(&r.src).copied())
                .collect();
            let mut failed: Vec<usize> = failed.into_iter().collect();
            failed.sort_unstable();
            failed
        };

        let mut refetched = 0;
        for index in candidates {
            let stale = exts[index]
                .as_deref()
                .map(|ext| super::job::page_path(&temp_dir, index, total, ext));
            if let Some(path) = &stale
                && !self.is_implausible_page(path).await
            {
                continue;
            }
            if let Some(path) = &stale {
                super::fetch::remove_page_files(path).await;
            }

            debug!(job_id = %id, index, "re-fetching page");
            match self
                .fetch_page_to_temp(&urls[index], index, total, &headers, &temp_dir, &token)
                .await
            {
                PageResult::Written { ext, key_mode } => {
                    self.update_job(id, |job| {
                        job.direct_exts[index] = Some(ext);
                        job.encryption.get_or_insert(key_mode);
                    })
                    .await?;
                    refetched += 1;
                }
                PageResult::Fatal(e) => return Err(e),
                PageResult::Skipped(reason) => {
                    warn!(job_id = %id, index, reason = %reason, "page re-fetch failed");
                }
                PageResult::Cancelled | PageResult::VaultLocked => {
                    warn!(job_id = %id, index, "page re-fetch interrupted");
                    break;
                }
            }
        }
        Ok(refetched)
    }

    async fn is_implausible_page(&self, path: &Path) -> bool {
        let size = match tokio::fs::metadata(path).await {
            Ok(m) if m.is_file() => m.len(),
            _ => return true,
        };
        if size < self.config.fetch.min_plausible_page_bytes {
            return true;
        }
        !path_exists(&meta_path(path)).await && !path_exists(&meta_backup_path(path)).await
    }

    async fn write_records(
        &self,
        id: JobId,
        final_dir: &Path,
        report: &MoveReport,
        entries: HashMap<String, PageEntry>,
    ) -> Result<()> {
        let (meta, name) = self
            .read_job(id, |job| (job.meta.clone(), job.name.clone()))
            .await?;
        let title = meta.title.clone().or(meta.comic_name.clone()).or(Some(name));
        self.write_item_records(final_dir, meta, title, "direct", report, entries)
            .await
            .map(|_| ())
    }

    /// Write the metadata record and page index of an item directory
    ///
    /// The index lists exactly the pages on disk; `entries` only supplies
    /// what is known about them. Returns the number of indexed pages.
    pub(crate) async fn write_item_records(
        &self,
        final_dir: &Path,
        meta: JobMeta,
        title: Option<String>,
        download_source: &str,
        report: &MoveReport,
        mut entries: HashMap<String, PageEntry>,
    ) -> Result<usize> {
        let root = self.config.library_root();
        let now = chrono::Utc::now().to_rfc3339();

        let metadata = MetadataRecord {
            v: 1,
            meta,
            final_dir: final_dir.to_path_buf(),
            download_source: download_source.to_string(),
            moved: report.moved,
            scanned: report.total,
            saved_at: now.clone(),
        };
        let vault = self.vault.as_ref();
        write_encrypted_json(vault, root, final_dir, METADATA_FILE, &metadata).await?;

        let page_entries: Vec<PageEntry> = list_page_files(final_dir)
            .await
            .into_iter()
            .map(|file| entries.remove(&file).unwrap_or_else(|| PageEntry::bare(file)))
            .collect();
        let pages = page_entries.len();
        let index = IndexRecord::new(title, page_entries, now);
        write_encrypted_json(vault, root, final_dir, INDEX_FILE, &index).await?;
        Ok(pages)
    }

    async fn delete_meta_file(&self, path: &Path) {
        let cleanup = &self.config.cleanup;
        if !try_delete_file_with_retries(path, cleanup.file_delete_attempts, &cleanup.delete_retry)
            .await
        {
            warn!(path = ?path, "could not delete caller metadata file, deferring");
            register_pending_file(&self.db, path).await;
        }
    }

    /// Stop a failed job and remove what it left behind
    ///
    /// Runs before the job is marked failed, so a `Failed` status is only
    /// seen once the folders are settled. Pages already moved into the item
    /// exist nowhere else; unless `mode` is [`FailureCleanup::Purge`] a final
    /// directory holding any is kept.
    pub(crate) async fn cleanup_on_failure(&self, id: JobId, mode: FailureCleanup) {
        let Ok((temp_dir, final_dir, meta_file)) = self
            .update_job(id, |job| {
                job.stop_requested = true;
                job.cancel.cancel();
                (job.temp_dir.clone(), job.final_dir.clone(), job.meta_path.clone())
            })
            .await
        else {
            return;
        };

        if self.config.library.delete_on_fail {
            let options = PurgeOptions {
                timeout: self.config.cleanup.purge_timeout,
                register_trash: true,
            };
            if mode != FailureCleanup::KeepAll {
                purge_folder_best_effort(&self.db, &temp_dir, options).await;
            }
            let moved = list_files_recursive(&final_dir).await.len();
            if mode == FailureCleanup::Purge || moved == 0 {
                purge_folder_best_effort(&self.db, &final_dir, options).await;
            } else {
                warn!(job_id = %id, final_dir = ?final_dir, moved, "keeping partially moved item");
            }
            if let Some(path) = meta_file {
                self.delete_meta_file(&path).await;
            }
        }

        self.sweep_pending_cleanup().await;
        self.emit_library_changed();
    }

    /// Sweep both pending-cleanup ledgers
    pub(crate) async fn sweep_pending_cleanup(&self) {
        let cleanup = &self.config.cleanup;
        run_pending_cleanup_sweep(&self.db, cleanup.purge_timeout).await;
        run_pending_file_cleanup_sweep(
            &self.db,
            cleanup.sweep_file_attempts,
            &cleanup.delete_retry,
        )
        .await;
    }
}
