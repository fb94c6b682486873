//! In-memory job record and its persisted form.

use chrono::{DateTime, TimeZone, Utc};
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use tokio_util::sync::CancellationToken;

use crate::crypto::{KeyKind, meta_path};
use crate::db::JobRecord;
use crate::mover::ALLOWED_EXTENSIONS;
use crate::types::{JobId, JobMeta, JobSnapshot, JobStatus};
use crate::utils::page_file_name;

/// Name shown while a job has no display name
const LOADING_NAME: &str = "(loading…)";

/// Name used when the caller supplied neither a comic name nor a gallery ID
pub(crate) const DEFAULT_JOB_NAME: &str = "Direct download";

/// One ingestion job
#[derive(Clone, Debug)]
pub(crate) struct Job {
    pub(crate) id: JobId,
    pub(crate) name: String,
    pub(crate) status: JobStatus,
    pub(crate) message: String,
    pub(crate) progress: f64,
    pub(crate) temp_dir: PathBuf,
    pub(crate) final_dir: PathBuf,
    pub(crate) direct_urls: Vec<String>,
    pub(crate) direct_index: usize,
    pub(crate) direct_skipped: usize,
    pub(crate) direct_exts: Vec<Option<String>>,
    pub(crate) headers: BTreeMap<String, String>,
    pub(crate) meta: JobMeta,
    pub(crate) meta_path: Option<PathBuf>,
    pub(crate) post_processed: bool,
    pub(crate) stop_requested: bool,
    pub(crate) encryption: Option<KeyKind>,
    pub(crate) created_at: DateTime<Utc>,
    pub(crate) cancel: CancellationToken,
}

impl Job {
    pub(crate) fn display_name(meta: &JobMeta) -> String {
        meta.comic_name
            .as_deref()
            .or(meta.gallery_id.as_deref())
            .map(str::trim)
            .filter(|n| !n.is_empty())
            .unwrap_or(DEFAULT_JOB_NAME)
            .to_string()
    }

    pub(crate) fn total(&self) -> usize {
        self.direct_urls.len()
    }

    /// Temp path of page `index` for extension `ext`
    pub(crate) fn page_path(&self, index: usize, ext: &str) -> PathBuf {
        page_path(&self.temp_dir, index, self.total(), ext)
    }

    /// Temp paths of every page fetched so far, in page order
    pub(crate) fn fetched_pages(&self) -> Vec<(usize, PathBuf)> {
        self.direct_exts
            .iter()
            .enumerate()
            .filter_map(|(i, ext)| ext.as_deref().map(|ext| (i, self.page_path(i, ext))))
            .collect()
    }

    pub(crate) fn snapshot(&self) -> JobSnapshot {
        let total = self.total();
        JobSnapshot {
            id: self.id,
            name: if self.name.is_empty() {
                LOADING_NAME.to_string()
            } else {
                self.name.clone()
            },
            status: self.status,
            message: self.message.clone(),
            progress: self.progress,
            downloaded: format!("{} pages", self.direct_index.min(total)),
            total: format!("{} pages", total),
            temp_dir: self.temp_dir.clone(),
            final_dir: self.final_dir.clone(),
            created_at: self.created_at,
            meta_captured: self.meta != JobMeta::default(),
        }
    }

    pub(crate) fn to_record(&self) -> JobRecord {
        JobRecord {
            id: self.id.0,
            name: self.name.clone(),
            status: self.status.as_str().to_string(),
            message: self.message.clone(),
            progress: self.progress,
            temp_dir: self.temp_dir.to_string_lossy().into_owned(),
            final_dir: self.final_dir.to_string_lossy().into_owned(),
            direct_urls: to_json(&self.direct_urls, "[]"),
            direct_index: self.direct_index as i64,
            direct_skipped: self.direct_skipped as i64,
            direct_exts: to_json(&self.direct_exts, "[]"),
            headers: to_json(&self.headers, "{}"),
            meta: to_json(&self.meta, "{}"),
            meta_path: self
                .meta_path
                .as_ref()
                .map(|p| p.to_string_lossy().into_owned()),
            post_processed: self.post_processed,
            encryption: self.encryption.map(|k| k.as_str().to_string()),
            created_at: self.created_at.timestamp_millis(),
        }
    }

    /// Rebuild a job from its persisted record
    ///
    /// Unparseable list fields hydrate as empty; resume logic treats a job with
    /// no URLs as unrecoverable.
    pub(crate) fn from_record(record: JobRecord) -> Self {
        let direct_urls: Vec<String> = from_json(&record.direct_urls, record.id, "direct_urls");
        let mut direct_exts: Vec<Option<String>> =
            from_json(&record.direct_exts, record.id, "direct_exts");
        direct_exts.resize(direct_urls.len(), None);

        Self {
            id: JobId(record.id),
            name: record.name,
            status: JobStatus::parse(&record.status),
            message: record.message,
            progress: record.progress.clamp(0.0, 1.0),
            temp_dir: PathBuf::from(record.temp_dir),
            final_dir: PathBuf::from(record.final_dir),
            direct_index: usize::try_from(record.direct_index).unwrap_or(0),
            direct_skipped: usize::try_from(record.direct_skipped).unwrap_or(0),
            direct_urls,
            direct_exts,
            headers: from_json(&record.headers, record.id, "headers"),
            meta: from_json(&record.meta, record.id, "meta"),
            meta_path: record.meta_path.map(PathBuf::from),
            post_processed: record.post_processed,
            stop_requested: false,
            encryption: record.encryption.as_deref().and_then(KeyKind::parse),
            created_at: Utc
                .timestamp_millis_opt(record.created_at)
                .single()
                .unwrap_or_else(Utc::now),
            cancel: CancellationToken::new(),
        }
    }
}

/// Temp path of page `index` out of `total`
pub(crate) fn page_path(temp_dir: &Path, index: usize, total: usize, ext: &str) -> PathBuf {
    temp_dir.join(page_file_name(index, total, ext))
}

/// Extension of page `index` if a complete page (file plus sidecar) is on disk
///
/// The cached extension is checked first, then every extension the fetch loop
/// can produce.
pub(crate) async fn find_existing_page(
    temp_dir: &Path,
    index: usize,
    total: usize,
    cached: Option<&str>,
) -> Option<String> {
    let mut candidates: Vec<String> = cached.map(str::to_string).into_iter().collect();
    candidates.extend(
        ALLOWED_EXTENSIONS
            .iter()
            .chain([".gif"].iter())
            .map(|e| e.to_string()),
    );

    for ext in candidates {
        let path = page_path(temp_dir, index, total, &ext);
        let file_ok = tokio::fs::metadata(&path)
            .await
            .map(|m| m.is_file())
            .unwrap_or(false);
        if file_ok && crate::utils::path_exists(&meta_path(&path)).await {
            return Some(ext);
        }
    }
    None
}

fn to_json<T: serde::Serialize + ?Sized>(value: &T, fallback: &str) -> String {
    serde_json::to_string(value).unwrap_or_else(|_| fallback.to_string())
}

fn from_json<T: serde::de::DeserializeOwned + Default>(raw: &str, id: i64, field: &str) -> T {
    match serde_json::from_str(raw) {
        Ok(value) => value,
        Err(e) => {
            tracing::warn!(job_id = id, field, error = %e, "unreadable job field, using default");
            T::default()
        }
    }
}
