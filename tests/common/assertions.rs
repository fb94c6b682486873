//! Custom test assertions for integration tests

use std::path::Path;
use std::time::Duration;
use vault_ingest::library::{INDEX_FILE, IndexRecord, read_encrypted_json};
use vault_ingest::utils::relative_slash_path;
use vault_ingest::{Event, JobId, JobManager, JobSnapshot, JobStatus};

/// Result of waiting for a job to settle
#[derive(Debug)]
pub enum WaitResult {
    /// The job reached `completed`
    Completed(JobSnapshot),
    /// The job reached `failed`
    Failed(JobSnapshot),
    /// Timeout waiting for a terminal state
    Timeout,
    /// Channel closed unexpectedly
    ChannelClosed,
}

/// Wait for a job to reach a terminal state, following the event stream
///
/// Checks the current snapshot first so a job that finished before the
/// subscription is still reported.
pub async fn wait_for_terminal(manager: &JobManager, id: JobId, timeout: Duration) -> WaitResult {
    let mut events = manager.subscribe();

    if let Ok(snapshot) = manager.get_job(id).await
        && let Some(result) = terminal(snapshot)
    {
        return result;
    }

    let result = tokio::time::timeout(timeout, async {
        loop {
            match events.recv().await {
                Ok(Event::JobUpdated { job }) if job.id == id => {
                    if let Some(result) = terminal(job) {
                        return result;
                    }
                }
                Ok(_) => continue,
                Err(tokio::sync::broadcast::error::RecvError::Lagged(_)) => {
                    if let Ok(snapshot) = manager.get_job(id).await
                        && let Some(result) = terminal(snapshot)
                    {
                        return result;
                    }
                }
                Err(_) => return WaitResult::ChannelClosed,
            }
        }
    })
    .await;

    result.unwrap_or(WaitResult::Timeout)
}

fn terminal(snapshot: JobSnapshot) -> Option<WaitResult> {
    match snapshot.status {
        JobStatus::Completed => Some(WaitResult::Completed(snapshot)),
        JobStatus::Failed => Some(WaitResult::Failed(snapshot)),
        _ => None,
    }
}

/// Assert the job completed and return its final snapshot
pub async fn assert_job_completed(manager: &JobManager, id: JobId) -> JobSnapshot {
    match wait_for_terminal(manager, id, Duration::from_secs(15)).await {
        WaitResult::Completed(snapshot) => snapshot,
        other => panic!("job {id} did not complete: {other:?}"),
    }
}

/// Decrypt a finalized page through the manager's vault
pub async fn read_page(manager: &JobManager, final_dir: &Path, name: &str) -> Vec<u8> {
    let root = manager.get_config().library_root().clone();
    let rel = relative_slash_path(&root, &final_dir.join(name));
    manager
        .vault()
        .decrypt_file(&rel, &final_dir.join(format!("{name}.enc")))
        .await
        .expect("page should decrypt")
}

/// Decrypt and parse an item's index record
pub async fn read_index(manager: &JobManager, final_dir: &Path) -> IndexRecord {
    let root = manager.get_config().library_root().clone();
    read_encrypted_json(manager.vault().as_ref(), &root, final_dir, INDEX_FILE)
        .await
        .expect("index should decrypt")
}

/// Assert a directory holds exactly these file names
pub fn assert_files_exactly(dir: &Path, expected: &[&str]) {
    let mut found: Vec<String> = std::fs::read_dir(dir)
        .expect("directory should exist")
        .filter_map(|e| e.ok())
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    found.sort();
    let mut expected: Vec<String> = expected.iter().map(|s| s.to_string()).collect();
    expected.sort();
    assert_eq!(found, expected, "unexpected contents of {}", dir.display());
}

/// Assert no file under `root` starts like a plaintext image
pub fn assert_no_plaintext_images(root: &Path) {
    for entry in walkdir::WalkDir::new(root).into_iter().filter_map(|e| e.ok()) {
        if !entry.file_type().is_file() {
            continue;
        }
        let bytes = std::fs::read(entry.path()).expect("file should be readable");
        assert!(
            !vault_ingest::mover::is_plain_image_magic(&bytes),
            "plaintext image at {}",
            entry.path().display()
        );
    }
}
