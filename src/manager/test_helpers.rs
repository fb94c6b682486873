//! Shared test helpers for creating JobManager instances in tests.

use crate::config::Config;
use crate::crypto::{DirectCipher, KEY_LEN};
use crate::db::JobRecord;
use crate::manager::JobManager;
use crate::types::{JobId, JobSnapshot, JobStatus};
use crate::vault::{MasterKeyVault, Vault};
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::Duration;
use tempfile::{TempDir, tempdir};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Master key used by test vaults
pub(crate) const MASTER_KEY: [u8; KEY_LEN] = [7; KEY_LEN];

/// Config rooted in `dir` with the finalize pause and delete backoff shortened
pub(crate) fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.library.library_root = dir.join("library");
    config.persistence.database_path = dir.join("state.db");
    config.finalize.settle_delay = Duration::ZERO;
    config.cleanup.delete_retry.initial_delay = Duration::from_millis(1);
    config
}

/// Helper to create a test JobManager with an unlocked vault.
/// Returns the manager and the tempdir (which must be kept alive).
pub(crate) async fn create_test_manager() -> (JobManager, TempDir) {
    create_test_manager_with(Arc::new(MasterKeyVault::unlocked(MASTER_KEY))).await
}

/// Helper to create a test JobManager around a specific vault
pub(crate) async fn create_test_manager_with(vault: Arc<dyn Vault>) -> (JobManager, TempDir) {
    let temp_dir = tempdir().unwrap();
    let manager = JobManager::new(test_config(temp_dir.path()), vault)
        .await
        .unwrap();
    (manager, temp_dir)
}

/// A minimal PNG header of the given size, padded past the plausibility floor
pub(crate) fn png_page(width: u32, height: u32) -> Vec<u8> {
    let mut buf = vec![0x89, b'P', b'N', b'G', 0x0d, 0x0a, 0x1a, 0x0a];
    buf.extend_from_slice(&13u32.to_be_bytes());
    buf.extend_from_slice(b"IHDR");
    buf.extend_from_slice(&width.to_be_bytes());
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(&[8, 6, 0, 0, 0]);
    buf.extend(std::iter::repeat_n(0xab, 200));
    buf
}

/// Serve `body` at `route`
pub(crate) async fn mount_page(server: &MockServer, route: &str, body: Vec<u8>) {
    Mock::given(method("GET"))
        .and(path(route))
        .respond_with(ResponseTemplate::new(200).set_body_bytes(body))
        .mount(server)
        .await;
}

/// Serve three PNG pages at `/p/1.png`..`/p/3.png` and return their URLs
pub(crate) async fn mount_three_pages(server: &MockServer) -> Vec<String> {
    let mut urls = Vec::new();
    for n in 1..=3u32 {
        let route = format!("/p/{n}.png");
        mount_page(server, &route, png_page(100 * n, 150)).await;
        urls.push(format!("{}{}", server.uri(), route));
    }
    urls
}

/// Poll until the job reaches `status`, panicking after 10 seconds
pub(crate) async fn wait_for_status(
    manager: &JobManager,
    id: JobId,
    status: JobStatus,
) -> JobSnapshot {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    loop {
        let snapshot = manager.get_job(id).await.unwrap();
        if snapshot.status == status {
            return snapshot;
        }
        if tokio::time::Instant::now() > deadline {
            panic!(
                "job {id} stuck in {} ({}), expected {status}",
                snapshot.status, snapshot.message
            );
        }
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Poll until no fetch loop or pipeline is running
pub(crate) async fn wait_until_idle(manager: &JobManager) {
    let deadline = tokio::time::Instant::now() + Duration::from_secs(10);
    while !manager.active.is_empty() {
        assert!(tokio::time::Instant::now() < deadline, "tasks still running");
        tokio::time::sleep(Duration::from_millis(20)).await;
    }
}

/// Decrypt one page of a finalized item
pub(crate) async fn read_library_page(
    manager: &JobManager,
    final_dir: &Path,
    name: &str,
) -> Vec<u8> {
    let logical = final_dir.join(name);
    let rel = manager.cipher.rel_path(&logical);
    manager
        .vault
        .decrypt_file(&rel, &final_dir.join(format!("{name}.enc")))
        .await
        .unwrap()
}

/// Encrypt `body` into a temp directory the way the fetch loop does
pub(crate) async fn write_temp_page(
    vault: Arc<dyn Vault>,
    library_root: &Path,
    path: &Path,
    body: &[u8],
) {
    tokio::fs::create_dir_all(path.parent().unwrap()).await.unwrap();
    let cipher = DirectCipher::new(vault, library_root.to_path_buf(), false);
    let mut reader: &[u8] = body;
    let outcome = cipher
        .encrypt_stream_to_file(&cipher.rel_path(path), &mut reader, path)
        .await
        .unwrap();
    cipher.write_meta(path, &outcome).await.unwrap();
}

/// A persisted job as it would look after a crash mid-flight
pub(crate) fn crashed_record(
    id: i64,
    status: JobStatus,
    library_root: &Path,
    urls: &[String],
    exts: &[Option<&str>],
    direct_index: usize,
) -> JobRecord {
    let temp_dir: PathBuf = library_root.join(format!("tmp_1700000000000_{id}"));
    let final_dir: PathBuf = library_root.join(format!("comic_1700000000000_{id}"));
    JobRecord {
        id,
        name: "Recovered".into(),
        status: status.as_str().to_string(),
        message: String::new(),
        progress: 0.0,
        temp_dir: temp_dir.to_string_lossy().into_owned(),
        final_dir: final_dir.to_string_lossy().into_owned(),
        direct_urls: serde_json::to_string(urls).unwrap(),
        direct_index: direct_index as i64,
        direct_skipped: 0,
        direct_exts: serde_json::to_string(exts).unwrap(),
        headers: "{}".into(),
        meta: r#"{"comic_name":"Recovered"}"#.into(),
        meta_path: None,
        post_processed: status.is_finalization_phase(),
        encryption: None,
        created_at: 1_700_000_000_000,
    }
}
