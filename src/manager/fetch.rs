//! Job submission and the sequential page fetch loop.

use futures::StreamExt;
use reqwest::StatusCode;
use reqwest::header::{HeaderMap, HeaderName, HeaderValue, REFERER};
use std::collections::BTreeMap;
use std::path::Path;
use std::sync::atomic::Ordering;
use tokio_util::io::StreamReader;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::crypto::{KeyKind, meta_backup_path, meta_path};
use crate::error::{CipherError, Error, JobError, Result};
use crate::types::{DirectDownloadOptions, JobId, JobMeta, JobStatus};
use crate::utils::{
    FINAL_DIR_PREFIX, TEMP_DIR_PREFIX, image_ext_from_url, now_millis, strip_double_extension,
};

use super::JobManager;
use super::job::{Job, find_existing_page, page_path};
use super::pipeline::FailureCleanup;

/// What happened to one page request
pub(crate) enum PageResult {
    /// Page encrypted into the temp directory
    Written {
        /// Resolved extension, with dot
        ext: String,
        /// Key mode of the temp file
        key_mode: KeyKind,
    },
    /// Page could not be fetched or encrypted; the job goes on
    Skipped(String),
    /// The job's cancellation token fired
    Cancelled,
    /// The vault is initialized but locked
    VaultLocked,
    /// Error that aborts the job
    Fatal(Error),
}

/// How a fetch loop ended
enum LoopEnd {
    /// Every page was handled
    Completed,
    /// Stopped by request, cancellation or a locked vault
    Stopped,
    /// Cancelled by shutdown; the job stays resumable as it is
    Interrupted,
}

fn downloading_message(name: &str, skipped: usize) -> String {
    if skipped > 0 {
        format!("Downloading: {name} (skipped {skipped})")
    } else {
        format!("Downloading: {name}")
    }
}

fn fetch_progress(index: usize, total: usize) -> f64 {
    if total == 0 {
        0.0
    } else {
        (index as f64 / total as f64).clamp(0.0, 1.0)
    }
}

/// Build the request headers for a job
///
/// Adds `referer` from `meta.source_url` when the caller did not supply one.
/// Headers that are not valid HTTP are dropped.
pub(crate) fn build_headers(headers: &BTreeMap<String, String>, meta: &JobMeta) -> HeaderMap {
    let mut map = HeaderMap::new();
    for (name, value) in headers {
        match (
            HeaderName::from_bytes(name.trim().as_bytes()),
            HeaderValue::from_str(value),
        ) {
            (Ok(name), Ok(value)) => {
                map.insert(name, value);
            }
            _ => warn!(header = %name, "dropping invalid request header"),
        }
    }
    if !map.contains_key(REFERER)
        && let Some(source) = meta.source_url.as_deref()
        && let Ok(value) = HeaderValue::from_str(source)
    {
        map.insert(REFERER, value);
    }
    map
}

impl JobManager {
    /// Submit a list of page URLs as a new job
    ///
    /// Empty URLs are dropped; an empty list is refused with
    /// [`JobError::NoImages`]. The temp and final directories are created, the
    /// job is persisted and announced, then the fetch loop is spawned.
    pub async fn add_direct_download(
        &self,
        urls: Vec<String>,
        meta: JobMeta,
        options: DirectDownloadOptions,
    ) -> Result<JobId> {
        let urls: Vec<String> = urls
            .into_iter()
            .map(|u| u.trim().to_string())
            .filter(|u| !u.is_empty())
            .collect();
        if urls.is_empty() {
            return Err(JobError::NoImages.into());
        }
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }

        let id = JobId(self.next_id.fetch_add(1, Ordering::SeqCst));
        let millis = now_millis();
        let root = self.config.library_root();
        let temp_dir = root.join(format!("{TEMP_DIR_PREFIX}{millis}_{id}"));
        let final_dir = root.join(format!("{FINAL_DIR_PREFIX}{millis}_{id}"));
        tokio::fs::create_dir_all(&temp_dir).await?;
        tokio::fs::create_dir_all(&final_dir).await?;

        let total = urls.len();
        let name = Job::display_name(&meta);
        let job = Job {
            id,
            name: name.clone(),
            status: JobStatus::Starting,
            message: "Starting…".to_string(),
            progress: 0.0,
            temp_dir,
            final_dir,
            direct_urls: urls,
            direct_index: 0,
            direct_skipped: 0,
            direct_exts: vec![None; total],
            headers: options.headers,
            meta,
            meta_path: options.meta_path,
            post_processed: false,
            stop_requested: false,
            encryption: None,
            created_at: chrono::Utc::now(),
            cancel: CancellationToken::new(),
        };
        let record = job.to_record();
        let snapshot = job.snapshot();

        self.jobs.lock().await.insert(id, job);
        if let Err(e) = self.db.upsert_job(&record).await {
            self.jobs.lock().await.remove(&id);
            return Err(e);
        }
        self.emit_event(crate::types::Event::JobUpdated { job: snapshot });

        info!(job_id = %id, pages = total, name = %name, "direct download added");
        self.spawn_direct_job(id);
        Ok(id)
    }

    /// Run the fetch loop for `id` in a background task
    pub(crate) fn spawn_direct_job(&self, id: JobId) {
        let manager = self.clone();
        tokio::spawn(async move { manager.start_direct_job(id).await });
    }

    /// Fetch every remaining page of a job, then finalize it
    ///
    /// At most one loop runs per job; a second call while one is active
    /// returns immediately.
    pub(crate) async fn start_direct_job(&self, id: JobId) {
        let Some(_guard) = self.active.claim(id) else {
            debug!(job_id = %id, "fetch loop already running");
            return;
        };

        match self.run_fetch_loop(id).await {
            Ok(LoopEnd::Completed) => {
                let skipped = match self
                    .update_job(id, |job| {
                        job.post_processed = true;
                        job.status = JobStatus::Finalizing;
                        job.message = "Direct download complete. Finalizing…".to_string();
                        job.direct_skipped
                    })
                    .await
                {
                    Ok(skipped) => skipped,
                    Err(_) => return,
                };
                let note = (skipped > 0).then(|| format!("Skipped {skipped} page(s)"));
                self.post_download_pipeline(id, note).await;
            }
            Ok(LoopEnd::Stopped) => {
                info!(job_id = %id, "direct download stopped");
            }
            Ok(LoopEnd::Interrupted) => {
                info!(job_id = %id, "direct download interrupted by shutdown");
            }
            Err(Error::Job(JobError::NotFound { .. })) => {
                debug!(job_id = %id, "job removed while fetching");
            }
            Err(e) => {
                error!(job_id = %id, error = %e, "direct download failed");
                self.cleanup_on_failure(id, FailureCleanup::Purge).await;
                let message = format!("Direct download failed: {e}");
                if let Err(status_err) = self.set_status(id, JobStatus::Failed, message).await {
                    debug!(job_id = %id, error = %status_err, "job removed during failure cleanup");
                }
            }
        }
    }

    async fn run_fetch_loop(&self, id: JobId) -> Result<LoopEnd> {
        let (urls, headers, temp_dir, name, start) = self
            .read_job(id, |job| {
                (
                    job.direct_urls.clone(),
                    build_headers(&job.headers, &job.meta),
                    job.temp_dir.clone(),
                    job.name.clone(),
                    job.direct_index,
                )
            })
            .await?;
        if urls.is_empty() {
            return Err(JobError::MissingImageList { id: id.0 }.into());
        }
        let total = urls.len();

        // The filesystem is authoritative; the saved cursor is only a hint
        let cached_exts = self.read_job(id, |job| job.direct_exts.clone()).await?;
        let cached = |index: usize| cached_exts.get(index).cloned().flatten();
        let mut cursor = start.min(total);
        let mut found = Vec::new();
        for index in 0..cursor {
            if cached(index).is_none()
                && let Some(ext) = find_existing_page(&temp_dir, index, total, None).await
            {
                found.push((index, ext));
            }
        }
        while cursor < total {
            match find_existing_page(&temp_dir, cursor, total, cached(cursor).as_deref()).await {
                Some(ext) => {
                    found.push((cursor, ext));
                    cursor += 1;
                }
                None => break,
            }
        }

        self.update_job(id, |job| {
            job.direct_exts.resize(total, None);
            for (index, ext) in found {
                job.direct_exts[index] = Some(ext);
            }
            job.direct_index = cursor;
            job.status = JobStatus::Downloading;
            job.progress = fetch_progress(cursor, total);
            job.message = downloading_message(&name, job.direct_skipped);
        })
        .await?;

        for index in cursor..total {
            let (stop, token, cached) = self
                .read_job(id, |job| {
                    (
                        job.stop_requested,
                        job.cancel.clone(),
                        job.direct_exts[index].clone(),
                    )
                })
                .await?;
            if stop || token.is_cancelled() {
                return self.end_interrupted(id).await;
            }

            if let Some(ext) = find_existing_page(&temp_dir, index, total, cached.as_deref()).await
            {
                debug!(job_id = %id, index, "page already on disk");
                self.update_job(id, |job| {
                    job.direct_exts[index] = Some(ext);
                    job.direct_index = index + 1;
                    job.progress = fetch_progress(index + 1, total);
                })
                .await?;
                continue;
            }

            match self
                .fetch_page_to_temp(&urls[index], index, total, &headers, &temp_dir, &token)
                .await
            {
                PageResult::Written { ext, key_mode } => {
                    debug!(job_id = %id, index, ext = %ext, "page stored");
                    self.update_job(id, |job| {
                        job.direct_exts[index] = Some(ext);
                        job.encryption.get_or_insert(key_mode);
                        job.direct_index = index + 1;
                        job.progress = fetch_progress(index + 1, total);
                        job.message = downloading_message(&name, job.direct_skipped);
                    })
                    .await?;
                }
                PageResult::Skipped(reason) => {
                    warn!(job_id = %id, index, url = %urls[index], reason = %reason, "skipping page");
                    self.update_job(id, |job| {
                        job.direct_skipped += 1;
                        job.direct_index = index + 1;
                        job.progress = fetch_progress(index + 1, total);
                        job.message = downloading_message(&name, job.direct_skipped);
                    })
                    .await?;
                }
                PageResult::Cancelled => return self.end_interrupted(id).await,
                PageResult::VaultLocked => {
                    self.update_job(id, |job| {
                        job.stop_requested = true;
                        job.status = JobStatus::Stopped;
                        job.message = "Vault is locked. Unlock to resume download.".to_string();
                    })
                    .await?;
                    return Ok(LoopEnd::Stopped);
                }
                PageResult::Fatal(e) => return Err(e),
            }
        }

        let stop = self.read_job(id, |job| job.stop_requested).await?;
        if stop {
            return self.end_interrupted(id).await;
        }
        Ok(LoopEnd::Completed)
    }

    /// Stop on request; during shutdown leave the job as it is so it resumes
    async fn end_interrupted(&self, id: JobId) -> Result<LoopEnd> {
        if !self.is_accepting() {
            return Ok(LoopEnd::Interrupted);
        }
        self.set_status(id, JobStatus::Stopped, "Stopped.").await?;
        Ok(LoopEnd::Stopped)
    }

    /// Fetch one page and stream it into the temp directory
    ///
    /// A 404 is retried once with a doubled extension stripped. The request
    /// and the encryption both race the job's cancellation token; a cancelled
    /// page leaves nothing on disk.
    pub(crate) async fn fetch_page_to_temp(
        &self,
        url: &str,
        index: usize,
        total: usize,
        headers: &HeaderMap,
        temp_dir: &Path,
        token: &CancellationToken,
    ) -> PageResult {
        let response = tokio::select! {
            biased;
            _ = token.cancelled() => return PageResult::Cancelled,
            response = self.request_page(url, headers) => response,
        };
        let response = match response {
            Ok(response) => response,
            Err(reason) => return PageResult::Skipped(reason),
        };

        let ext = image_ext_from_url(response.url().as_str());
        let path = page_path(temp_dir, index, total, &ext);
        let rel_path = self.cipher.rel_path(&path);

        let body = response
            .bytes_stream()
            .map(|chunk| chunk.map_err(std::io::Error::other));
        let mut reader = StreamReader::new(Box::pin(body));

        let encrypted = tokio::select! {
            biased;
            _ = token.cancelled() => None,
            result = self.cipher.encrypt_stream_to_file(&rel_path, &mut reader, &path) => Some(result),
        };

        let outcome = match encrypted {
            None => {
                remove_page_files(&path).await;
                return PageResult::Cancelled;
            }
            Some(Ok(outcome)) => outcome,
            Some(Err(CipherError::VaultLocked)) => return PageResult::VaultLocked,
            Some(Err(e)) if e.is_fatal() => return PageResult::Fatal(e.into()),
            Some(Err(e)) => return PageResult::Skipped(e.to_string()),
        };

        if let Err(e) = self.cipher.write_meta(&path, &outcome).await {
            remove_page_files(&path).await;
            return if e.is_fatal() {
                PageResult::Fatal(e.into())
            } else {
                PageResult::Skipped(e.to_string())
            };
        }

        PageResult::Written {
            ext,
            key_mode: outcome.key_mode.kind(),
        }
    }

    async fn request_page(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> std::result::Result<reqwest::Response, String> {
        let response = self.send(url, headers).await?;
        if response.status() == StatusCode::NOT_FOUND
            && let Some(alternate) = strip_double_extension(url)
        {
            debug!(url = %url, alternate = %alternate, "page not found, retrying without doubled extension");
            return check_status(self.send(&alternate, headers).await?);
        }
        check_status(response)
    }

    async fn send(
        &self,
        url: &str,
        headers: &HeaderMap,
    ) -> std::result::Result<reqwest::Response, String> {
        self.http
            .get(url)
            .headers(headers.clone())
            .send()
            .await
            .map_err(|e| e.to_string())
    }
}

fn check_status(response: reqwest::Response) -> std::result::Result<reqwest::Response, String> {
    let status = response.status();
    if status.is_success() {
        Ok(response)
    } else {
        Err(format!("HTTP {status}"))
    }
}

/// Remove a temp page with its sidecar and backup
pub(crate) async fn remove_page_files(path: &Path) {
    for file in [path.to_path_buf(), meta_path(path), meta_backup_path(path)] {
        tokio::fs::remove_file(&file).await.ok();
    }
}
