use super::test_helpers::*;
use super::*;
use crate::library::{INDEX_FILE, IndexRecord, MetadataRecord, read_encrypted_json};
use crate::types::{DirectDownloadOptions, JobMeta, JobStatus};
use crate::vault::{MasterKeyVault, NoVault};
use std::path::PathBuf;
use tempfile::tempdir;
use wiremock::matchers::{header, method, path};
use wiremock::{Mock, MockServer, ResponseTemplate};

mod import;

fn meta(name: &str) -> JobMeta {
    JobMeta {
        comic_name: Some(name.to_string()),
        ..Default::default()
    }
}
