//! Best-effort deletion of temp folders and stray files
//!
//! Deletes here never fail a job. A folder that cannot be removed in time is
//! renamed out of the way into a `trash_*` sibling and recorded in the
//! pending-cleanup ledger; files that resist deletion are recorded too. Both
//! ledgers are swept at startup and after every finalization.

use crate::config::RetryConfig;
use crate::db::{CleanupKind, Database};
use crate::retry::with_backoff;
use crate::utils::{now_millis, path_exists, random_hex};
use std::path::{Path, PathBuf};
use std::time::Duration;
use tokio::fs;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Options for [`purge_folder_best_effort`]
#[derive(Clone, Copy, Debug)]
pub struct PurgeOptions {
    /// How long the recursive delete may run
    pub timeout: Duration,
    /// Rename to a trash folder and register it when the delete fails
    pub register_trash: bool,
}

impl Default for PurgeOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(2500),
            register_trash: true,
        }
    }
}

/// Result of [`purge_folder_best_effort`]
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct PurgeOutcome {
    /// The folder is gone from its original location
    pub ok: bool,
    /// The folder was moved to a trash path instead of deleted
    pub trashed: bool,
    /// Where the folder was moved
    pub trash_path: Option<PathBuf>,
}

/// Delete a folder recursively, falling back to rename-to-trash
///
/// A missing folder counts as deleted. The delete runs on the blocking pool
/// and races against `options.timeout`; on timeout or error the folder is
/// renamed to `<parent>/trash_<millis>_<rand8>_<basename>` and the new path
/// is added to the ledger when `options.register_trash` is set.
///
/// A blocking delete cannot be cancelled. After a timeout it runs on against
/// the old path and is watched until it ends; whatever it has not reached by
/// then was moved to trash with the folder.
pub async fn purge_folder_best_effort(
    db: &Database,
    path: &Path,
    options: PurgeOptions,
) -> PurgeOutcome {
    purge_folder_with(db, path, options, |p| {
        tokio::task::spawn_blocking(move || std::fs::remove_dir_all(&p))
    })
    .await
}

async fn purge_folder_with<F>(
    db: &Database,
    path: &Path,
    options: PurgeOptions,
    remove: F,
) -> PurgeOutcome
where
    F: FnOnce(PathBuf) -> JoinHandle<std::io::Result<()>>,
{
    if !path_exists(path).await {
        return PurgeOutcome {
            ok: true,
            ..Default::default()
        };
    }

    let mut delete = remove(path.to_path_buf());
    let failure = match tokio::time::timeout(options.timeout, &mut delete).await {
        Ok(Ok(Ok(()))) => {
            debug!(?path, "folder removed");
            return PurgeOutcome {
                ok: true,
                ..Default::default()
            };
        }
        Ok(Ok(Err(e))) if e.kind() == std::io::ErrorKind::NotFound => {
            return PurgeOutcome {
                ok: true,
                ..Default::default()
            };
        }
        Ok(Ok(Err(e))) => e.to_string(),
        Ok(Err(e)) => format!("delete task failed: {e}"),
        Err(_) => {
            watch_late_delete(path.to_path_buf(), delete);
            format!("timed out after {} ms", options.timeout.as_millis())
        }
    };

    if !options.register_trash {
        warn!(?path, error = %failure, "failed to remove folder");
        return PurgeOutcome::default();
    }

    let Some(trash) = trash_path_for(path) else {
        warn!(?path, error = %failure, "failed to remove folder");
        return PurgeOutcome::default();
    };

    match fs::rename(path, &trash).await {
        Ok(()) => {
            info!(?path, trash = ?trash, error = %failure, "folder moved to trash for later cleanup");
            register_pending_folder(db, &trash).await;
            PurgeOutcome {
                ok: true,
                trashed: true,
                trash_path: Some(trash),
            }
        }
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            // The delete finished while we were timing out
            PurgeOutcome {
                ok: true,
                ..Default::default()
            }
        }
        Err(e) => {
            warn!(?path, error = %e, "failed to remove folder or move it to trash");
            PurgeOutcome::default()
        }
    }
}

/// Log how a delete that outlived its timeout ended
fn watch_late_delete(path: PathBuf, delete: JoinHandle<std::io::Result<()>>) {
    tokio::spawn(async move {
        match delete.await {
            Ok(Ok(())) => debug!(?path, "timed-out folder delete finished"),
            Ok(Err(e)) => debug!(?path, error = %e, "timed-out folder delete stopped"),
            Err(e) => warn!(?path, error = %e, "timed-out folder delete task failed"),
        }
    });
}

fn trash_path_for(path: &Path) -> Option<PathBuf> {
    let parent = path.parent()?;
    let base = path.file_name()?.to_string_lossy();
    Some(parent.join(format!("trash_{}_{}_{}", now_millis(), random_hex(8), base)))
}

/// Delete a file, retrying with backoff
///
/// Makes up to `attempts` tries, waiting `schedule.initial_delay` and growing
/// by `schedule.backoff_multiplier` between them. A missing file counts as
/// deleted.
pub async fn try_delete_file_with_retries(
    path: &Path,
    attempts: u32,
    schedule: &RetryConfig,
) -> bool {
    let schedule = RetryConfig {
        max_attempts: attempts.saturating_sub(1),
        ..schedule.clone()
    };

    let result = with_backoff(&schedule, || async {
        match fs::remove_file(path).await {
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(()),
            other => other,
        }
    })
    .await;

    match result {
        Ok(()) => true,
        Err(e) => {
            debug!(?path, error = %e, attempts, "file delete failed");
            false
        }
    }
}

/// Add a folder to the pending-cleanup ledger
pub async fn register_pending_folder(db: &Database, path: &Path) {
    if let Err(e) = db
        .add_pending_cleanup(&path.to_string_lossy(), CleanupKind::Folder)
        .await
    {
        warn!(?path, error = %e, "failed to register pending folder cleanup");
    }
}

/// Add a file to the pending-cleanup ledger
pub async fn register_pending_file(db: &Database, path: &Path) {
    if let Err(e) = db
        .add_pending_cleanup(&path.to_string_lossy(), CleanupKind::File)
        .await
    {
        warn!(?path, error = %e, "failed to register pending file cleanup");
    }
}

/// Purge every folder in the ledger; returns how many entries were cleared
///
/// No trash fallback here: an entry stays in the ledger until its folder is
/// really gone.
pub async fn run_pending_cleanup_sweep(db: &Database, timeout: Duration) -> usize {
    let entries = match db.list_pending_cleanup(CleanupKind::Folder).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "failed to read pending folder cleanup");
            return 0;
        }
    };

    let mut cleared = 0;
    for entry in entries {
        let path = PathBuf::from(&entry.path);
        let options = PurgeOptions {
            timeout,
            register_trash: false,
        };
        let outcome = purge_folder_best_effort(db, &path, options).await;
        if outcome.ok && !path_exists(&path).await {
            if let Err(e) = db.remove_pending_cleanup(&entry.path).await {
                warn!(path = ?path, error = %e, "failed to drop pending cleanup entry");
                continue;
            }
            cleared += 1;
        }
    }

    if cleared > 0 {
        info!(cleared, "pending folder cleanup swept");
    }
    cleared
}

/// Delete every file in the ledger; returns how many entries were cleared
pub async fn run_pending_file_cleanup_sweep(
    db: &Database,
    attempts: u32,
    schedule: &RetryConfig,
) -> usize {
    let entries = match db.list_pending_cleanup(CleanupKind::File).await {
        Ok(entries) => entries,
        Err(e) => {
            warn!(error = %e, "failed to read pending file cleanup");
            return 0;
        }
    };

    let mut cleared = 0;
    for entry in entries {
        let path = PathBuf::from(&entry.path);
        if try_delete_file_with_retries(&path, attempts, schedule).await {
            if let Err(e) = db.remove_pending_cleanup(&entry.path).await {
                warn!(path = ?path, error = %e, "failed to drop pending cleanup entry");
                continue;
            }
            cleared += 1;
        }
    }

    if cleared > 0 {
        info!(cleared, "pending file cleanup swept");
    }
    cleared
}
