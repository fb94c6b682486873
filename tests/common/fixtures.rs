//! Test fixtures: configs, managers and served pages

use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use vault_ingest::{Config, JobManager, MasterKeyVault, Vault};
use wiremock::matchers::{method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

/// Master key used by every test vault
pub const MASTER_KEY: [u8; 32] = [42; 32];

/// Config rooted in `dir` with no finalize pause
pub fn test_config(dir: &Path) -> Config {
    let mut config = Config::default();
    config.library.library_root = dir.join("library");
    config.persistence.database_path = dir.join("ingest.db");
    config.finalize.settle_delay = Duration::ZERO;
    config.cleanup.delete_retry.initial_delay = Duration::from_millis(1);
    config
}

/// A manager over an unlocked vault, plus the tempdir that backs it
pub async fn create_manager() -> (JobManager, TempDir) {
    let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
    let manager = open_manager(temp_dir.path(), Arc::new(MasterKeyVault::unlocked(MASTER_KEY))).await;
    (manager, temp_dir)
}

/// Open (or reopen) a manager on an existing directory
pub async fn open_manager(dir: &Path, vault: Arc<dyn Vault>) -> JobManager {
    JobManager::new(test_config(dir), vault)
        .await
        .expect("Failed to create manager")
}

/// A JPEG-looking page: SOI, one SOF0 segment with the given size, filler
pub fn jpeg_page(width: u16, height: u16) -> Vec<u8> {
    let mut buf = vec![0xFF, 0xD8, 0xFF, 0xC0, 0x00, 0x11, 0x08];
    buf.extend_from_slice(&height.to_be_bytes());
    buf.extend_from_slice(&width.to_be_bytes());
    buf.extend_from_slice(&[0x03, 0x01, 0x22, 0x00, 0x02, 0x11, 0x01, 0x03, 0x11, 0x01]);
    buf.extend(std::iter::repeat_n(0x5a, 512));
    buf.extend_from_slice(&[0xFF, 0xD9]);
    buf
}

/// Serve `count` JPEG pages at `/gallery/{n}.jpg` and return their URLs
pub async fn serve_gallery(server: &MockServer, count: u16) -> Vec<String> {
    let mut urls = Vec::new();
    for n in 1..=count {
        let route = format!("/gallery/{n}.jpg");
        Mock::given(method("GET"))
            .and(path(route.as_str()))
            .respond_with(ResponseTemplate::new(200).set_body_bytes(jpeg_page(640 + n, 960)))
            .mount(server)
            .await;
        urls.push(format!("{}{}", server.uri(), route));
    }
    urls
}
