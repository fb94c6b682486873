//! Import of a local folder of plaintext images as a new library item.

use serde_json::Value;
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use tracing::{info, warn};

use crate::cleanup::{PurgeOptions, purge_folder_best_effort};
use crate::error::{CipherError, Error, JobError, Result};
use crate::library::{PageEntry, list_page_files, validate_page_entries};
use crate::mover::{MoveOptions, MoveSource, list_inputs, move_to_vault};
use crate::types::JobMeta;
use crate::utils::{FINAL_DIR_PREFIX, now_millis, random_hex};

use super::JobManager;
use super::pipeline::collect_entries;

/// Result of [`JobManager::import_local_folder`]
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ImportOutcome {
    /// The new item directory
    pub final_dir: PathBuf,
    /// Pages in the item's index
    pub pages: usize,
    /// Source images that could not be imported
    pub skipped: usize,
}

impl JobManager {
    /// Encrypt the images of `dir` into a new item directory
    ///
    /// The source folder is left untouched. `index_hint` is page index data
    /// from elsewhere, such as an exported item. Hinted entries that name no
    /// file of the new item are dropped; the rest only fill in dimensions that
    /// could not be measured. A folder without a title in `meta` is named
    /// after itself.
    ///
    /// # Errors
    ///
    /// Fails without leaving an item behind when the vault is not usable, the
    /// folder is missing or holds no images, or no page could be encrypted.
    pub async fn import_local_folder(
        &self,
        dir: &Path,
        mut meta: JobMeta,
        index_hint: Option<Vec<Value>>,
    ) -> Result<ImportOutcome> {
        if !self.is_accepting() {
            return Err(Error::ShuttingDown);
        }
        if !self.vault.is_initialized() {
            return Err(CipherError::VaultUninitialized.into());
        }
        if !self.vault.is_unlocked() {
            return Err(CipherError::VaultLocked.into());
        }
        if !tokio::fs::metadata(dir).await.is_ok_and(|m| m.is_dir()) {
            return Err(JobError::ImportSourceMissing {
                path: dir.to_path_buf(),
            }
            .into());
        }
        if list_inputs(dir, None).await.is_empty() {
            return Err(JobError::ImportNoImages {
                path: dir.to_path_buf(),
            }
            .into());
        }

        if meta.title.is_none() && meta.comic_name.is_none() {
            meta.comic_name = dir
                .file_name()
                .map(|name| name.to_string_lossy().into_owned());
        }
        let title = meta.title.clone().or(meta.comic_name.clone());

        let root = self.config.library_root();
        let final_dir = root.join(format!("{FINAL_DIR_PREFIX}{}_{}", now_millis(), random_hex(8)));
        tokio::fs::create_dir_all(&final_dir).await?;

        match self
            .import_into(dir, &final_dir, meta, title, index_hint)
            .await
        {
            Ok(outcome) => {
                info!(
                    source = ?dir,
                    final_dir = ?final_dir,
                    pages = outcome.pages,
                    skipped = outcome.skipped,
                    "folder imported"
                );
                self.emit_library_changed();
                Ok(outcome)
            }
            Err(e) => {
                warn!(source = ?dir, error = %e, "folder import failed");
                let options = PurgeOptions {
                    timeout: self.config.cleanup.purge_timeout,
                    register_trash: true,
                };
                purge_folder_best_effort(&self.db, &final_dir, options).await;
                Err(e)
            }
        }
    }

    async fn import_into(
        &self,
        dir: &Path,
        final_dir: &Path,
        meta: JobMeta,
        title: Option<String>,
        index_hint: Option<Vec<Value>>,
    ) -> Result<ImportOutcome> {
        let options = MoveOptions {
            delete_originals: false,
            flatten: true,
            only_files: None,
            concurrency: self.config.mover.concurrency,
            on_progress: None,
        };
        let report = move_to_vault(&self.cipher, MoveSource::Plain, dir, final_dir, &options).await?;
        if report.moved == 0 {
            return Err(JobError::ImportFailed {
                path: dir.to_path_buf(),
                first_error: report.first_error,
            }
            .into());
        }

        let mut entries: HashMap<String, PageEntry> = HashMap::new();
        collect_entries(&report, &mut entries);
        if let Some(hint) = index_hint {
            let files = list_page_files(final_dir).await;
            for hinted in validate_page_entries(&hint, &files) {
                match entries.get_mut(&hinted.file) {
                    Some(measured) if measured.w.is_none() || measured.h.is_none() => {
                        measured.w = hinted.w;
                        measured.h = hinted.h;
                    }
                    Some(_) => {}
                    None => {
                        entries.insert(hinted.file.clone(), hinted);
                    }
                }
            }
        }

        let pages = self
            .write_item_records(final_dir, meta, title, "import", &report, entries)
            .await?;
        Ok(ImportOutcome {
            final_dir: final_dir.to_path_buf(),
            pages,
            skipped: report.skipped,
        })
    }
}
