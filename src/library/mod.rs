//! Library records written next to the pages of a finalized item
//!
//! Each item directory holds `metadata.json.enc` and `index.json.enc`, both
//! encrypted as whole buffers by the vault. The vault relative path of a record
//! is its name without `.enc`.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashSet;
use std::path::{Path, PathBuf};
use utoipa::ToSchema;

use crate::error::{CipherError, Result};
use crate::types::JobMeta;
use crate::utils::{natural_cmp, relative_slash_path, write_bytes_atomic};
use crate::vault::Vault;

pub mod page_meta;

pub use page_meta::{
    ImageDimensions, MAX_DIMENSION_PX, PAGE_META_VERSION, PageEntry, image_dimensions,
    safe_dimension, sanitize_page_entry,
};

/// Suffix of every vault-encrypted file
pub const ENC_SUFFIX: &str = ".enc";
/// Logical name of the page index
pub const INDEX_FILE: &str = "index.json";
/// Logical name of the metadata record
pub const METADATA_FILE: &str = "metadata.json";

/// Page index of a finalized item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct IndexRecord {
    /// Schema version
    pub v: u32,
    /// Display title
    pub title: Option<String>,
    /// First page's name without `.enc`
    pub cover: Option<String>,
    /// Number of pages
    pub pages: usize,
    /// Page entry schema version
    pub page_meta_version: u32,
    /// One entry per page, in reading order
    pub page_entries: Vec<PageEntry>,
    /// RFC 3339 creation time
    pub created_at: String,
}

impl IndexRecord {
    /// Build an index from page entries already in reading order
    pub fn new(title: Option<String>, page_entries: Vec<PageEntry>, created_at: String) -> Self {
        let cover = page_entries
            .first()
            .map(|e| e.file.strip_suffix(ENC_SUFFIX).unwrap_or(&e.file).to_string());
        Self {
            v: 1,
            title,
            cover,
            pages: page_entries.len(),
            page_meta_version: PAGE_META_VERSION,
            page_entries,
            created_at,
        }
    }
}

/// Descriptive record of a finalized item
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize, ToSchema)]
pub struct MetadataRecord {
    /// Schema version
    pub v: u32,
    /// Caller-supplied metadata
    #[serde(flatten)]
    pub meta: JobMeta,
    /// Item directory
    #[schema(value_type = String)]
    pub final_dir: PathBuf,
    /// How the item entered the library (`"direct"`)
    pub download_source: String,
    /// Pages moved
    pub moved: usize,
    /// Pages found in the temp directory
    pub scanned: usize,
    /// RFC 3339 save time
    pub saved_at: String,
}

/// Encrypt `value` as JSON and write it to `<dir>/<name>.enc` atomically
pub async fn write_encrypted_json<T: Serialize + ?Sized>(
    vault: &dyn Vault,
    library_root: &Path,
    dir: &Path,
    name: &str,
    value: &T,
) -> Result<PathBuf> {
    let logical = dir.join(name);
    let rel = relative_slash_path(library_root, &logical);
    let json = serde_json::to_vec_pretty(value)?;
    let sealed = vault.encrypt_buffer(&rel, &json)?;

    let target = dir.join(format!("{name}{ENC_SUFFIX}"));
    write_bytes_atomic(&target, &sealed).await?;
    Ok(target)
}

/// Read and decrypt `<dir>/<name>.enc`
pub async fn read_encrypted_json<T: DeserializeOwned>(
    vault: &dyn Vault,
    library_root: &Path,
    dir: &Path,
    name: &str,
) -> Result<T> {
    let rel = relative_slash_path(library_root, &dir.join(name));
    let plain = vault
        .decrypt_file(&rel, &dir.join(format!("{name}{ENC_SUFFIX}")))
        .await?;
    Ok(serde_json::from_slice(&plain)?)
}

/// Encrypted page files in an item directory, in reading order
pub async fn list_page_files(dir: &Path) -> Vec<String> {
    let records: [String; 2] = [
        format!("{INDEX_FILE}{ENC_SUFFIX}"),
        format!("{METADATA_FILE}{ENC_SUFFIX}"),
    ];
    let mut names = Vec::new();
    let Ok(mut entries) = tokio::fs::read_dir(dir).await else {
        return names;
    };
    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_file = entry
            .file_type()
            .await
            .map(|ft| ft.is_file())
            .unwrap_or(false);
        let name = entry.file_name().to_string_lossy().into_owned();
        if is_file && name.ends_with(ENC_SUFFIX) && !records.contains(&name) {
            names.push(name);
        }
    }
    names.sort_by(|a, b| natural_cmp(a, b));
    names
}

/// Re-validate externally supplied page entries against the real file listing
///
/// Entries naming files that are not in `files` are dropped, duplicates keep
/// their first occurrence and numeric fields are sanitized.
pub fn validate_page_entries(raw: &[Value], files: &[String]) -> Vec<PageEntry> {
    let known: HashSet<&str> = files.iter().map(String::as_str).collect();
    let mut seen = HashSet::new();
    raw.iter()
        .filter_map(sanitize_page_entry)
        .filter(|e| known.contains(e.file.as_str()))
        .filter(|e| seen.insert(e.file.clone()))
        .collect()
}

/// Load an item's index, trusting only what the directory listing confirms
///
/// Pages present on disk but missing from the stored entries are appended as
/// bare entries, so the result always describes exactly the files that exist.
pub async fn load_index(vault: &dyn Vault, library_root: &Path, dir: &Path) -> Result<IndexRecord> {
    let raw: Value = read_encrypted_json(vault, library_root, dir, INDEX_FILE).await?;
    let files = list_page_files(dir).await;

    let stored = raw
        .get("page_entries")
        .and_then(Value::as_array)
        .map(Vec::as_slice)
        .unwrap_or(&[]);
    let mut entries = validate_page_entries(stored, &files);

    let listed: HashSet<String> = entries.iter().map(|e| e.file.clone()).collect();
    entries.extend(
        files
            .iter()
            .filter(|f| !listed.contains(*f))
            .map(|f| PageEntry::bare(f.clone())),
    );
    entries.sort_by(|a, b| natural_cmp(&a.file, &b.file));

    let title = raw
        .get("title")
        .and_then(Value::as_str)
        .map(str::to_string);
    let created_at = raw
        .get("created_at")
        .and_then(Value::as_str)
        .map(str::to_string)
        .unwrap_or_default();

    if entries.is_empty() && !files.is_empty() {
        return Err(CipherError::InvalidFormat(format!(
            "index for {} matches no pages",
            dir.display()
        ))
        .into());
    }

    Ok(IndexRecord::new(title, entries, created_at))
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::KEY_LEN;
    use crate::vault::MasterKeyVault;
    use serde_json::json;
    use tempfile::TempDir;

    #[test]
    fn test_index_cover_strips_enc() {
        let index = IndexRecord::new(
            Some("Vol 1".into()),
            vec![PageEntry::bare("001.jpg.enc"), PageEntry::bare("002.jpg.enc")],
            "2026-01-01T00:00:00Z".into(),
        );
        assert_eq!(index.cover.as_deref(), Some("001.jpg"));
        assert_eq!(index.pages, 2);
        assert_eq!(index.page_meta_version, 2);
    }

    #[test]
    fn test_validate_drops_unknown_and_duplicate_files() {
        let files = vec!["001.jpg.enc".to_string(), "002.jpg.enc".to_string()];
        let raw = vec![
            json!({ "file": "001.jpg.enc", "w": 10, "h": 20 }),
            json!({ "file": "../secret.enc" }),
            json!({ "file": "001.jpg.enc", "w": 99 }),
            json!({ "file": "" }),
            json!({ "file": "002.jpg.enc", "bytes": -5 }),
        ];
        let entries = validate_page_entries(&raw, &files);
        assert_eq!(entries.len(), 2);
        assert_eq!(entries[0].w, Some(10));
        assert_eq!(entries[1].file, "002.jpg.enc");
        assert_eq!(entries[1].bytes, None);
    }

    #[tokio::test]
    async fn test_records_round_trip_through_vault() {
        let root = TempDir::new().unwrap();
        let dir = root.path().join("comic_1_1");
        tokio::fs::create_dir_all(&dir).await.unwrap();
        for name in ["001.jpg.enc", "002.jpg.enc", "010.jpg.enc"] {
            tokio::fs::write(dir.join(name), b"NVEN\x01").await.unwrap();
        }
        let vault = MasterKeyVault::unlocked([5; KEY_LEN]);

        let stored = json!({
            "v": 1,
            "title": "Vol 1",
            "page_entries": [
                { "file": "010.jpg.enc", "w": 5, "h": 5 },
                { "file": "gone.jpg.enc", "w": 5, "h": 5 },
                { "file": "001.jpg.enc", "w": 7, "h": 9 }
            ],
            "created_at": "2026-01-01T00:00:00Z"
        });
        let path = write_encrypted_json(&vault, root.path(), &dir, INDEX_FILE, &stored)
            .await
            .unwrap();
        assert_eq!(path, dir.join("index.json.enc"));
        assert!(!dir.join("index.json.enc.tmp").exists());

        let index = load_index(&vault, root.path(), &dir).await.unwrap();
        let files: Vec<_> = index.page_entries.iter().map(|e| e.file.as_str()).collect();
        assert_eq!(files, vec!["001.jpg.enc", "002.jpg.enc", "010.jpg.enc"]);
        assert_eq!(index.page_entries[0].w, Some(7));
        assert_eq!(index.page_entries[1].w, None);
        assert_eq!(index.cover.as_deref(), Some("001.jpg"));
        assert_eq!(index.title.as_deref(), Some("Vol 1"));
    }

    #[tokio::test]
    async fn test_list_page_files_skips_records() {
        let dir = TempDir::new().unwrap();
        for name in ["index.json.enc", "metadata.json.enc", "2.png.enc", "10.png.enc", "x.txt"] {
            tokio::fs::write(dir.path().join(name), b"").await.unwrap();
        }
        assert_eq!(list_page_files(dir.path()).await, vec!["2.png.enc", "10.png.enc"]);
    }

    #[test]
    fn test_metadata_record_flattens_meta() {
        let record = MetadataRecord {
            v: 1,
            meta: JobMeta {
                comic_name: Some("Vol 1".into()),
                ..Default::default()
            },
            final_dir: PathBuf::from("/lib/comic_1_1"),
            download_source: "direct".into(),
            moved: 3,
            scanned: 3,
            saved_at: "2026-01-01T00:00:00Z".into(),
        };
        let value = serde_json::to_value(&record).unwrap();
        assert_eq!(value["comic_name"], "Vol 1");
        assert_eq!(value["download_source"], "direct");
        assert_eq!(value["v"], 1);
    }
}
