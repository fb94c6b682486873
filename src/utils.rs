//! Utility functions for file operations, naming and ordering

use crate::error::Result;
use rand::RngCore;
use serde::Serialize;
use serde::de::DeserializeOwned;
use std::cmp::Ordering;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;

/// Default extension for pages whose URL carries none
pub const DEFAULT_PAGE_EXT: &str = ".jpg";

/// Prefix of per-job scratch directories under the library root
pub const TEMP_DIR_PREFIX: &str = "tmp_";

/// Prefix of finished item directories under the library root
pub const FINAL_DIR_PREFIX: &str = "comic_";

/// Compare two strings the way people expect file names to sort
///
/// Digit runs compare by numeric value, everything else compares
/// case-insensitively. Strings that are equal under those rules fall back to a
/// plain byte comparison so the order is total and stable across runs.
///
/// # Examples
///
/// ```
/// use vault_ingest::utils::natural_cmp;
/// use std::cmp::Ordering;
///
/// assert_eq!(natural_cmp("page2.jpg", "page10.jpg"), Ordering::Less);
/// assert_eq!(natural_cmp("B/1.jpg", "a/2.jpg"), Ordering::Greater);
/// ```
pub fn natural_cmp(a: &str, b: &str) -> Ordering {
    let mut left = Chunks::new(a);
    let mut right = Chunks::new(b);

    loop {
        match (left.next(), right.next()) {
            (None, None) => return a.cmp(b),
            (None, Some(_)) => return Ordering::Less,
            (Some(_), None) => return Ordering::Greater,
            (Some(l), Some(r)) => {
                let ord = match (l, r) {
                    (Chunk::Digits(x), Chunk::Digits(y)) => cmp_digits(x, y),
                    // Digits sort before letters, as in locale-aware comparisons
                    (Chunk::Digits(_), Chunk::Text(_)) => Ordering::Less,
                    (Chunk::Text(_), Chunk::Digits(_)) => Ordering::Greater,
                    (Chunk::Text(x), Chunk::Text(y)) => cmp_text(x, y),
                };
                if ord != Ordering::Equal {
                    return ord;
                }
            }
        }
    }
}

enum Chunk<'a> {
    Digits(&'a str),
    Text(&'a str),
}

struct Chunks<'a> {
    rest: &'a str,
}

impl<'a> Chunks<'a> {
    fn new(s: &'a str) -> Self {
        Self { rest: s }
    }
}

impl<'a> Iterator for Chunks<'a> {
    type Item = Chunk<'a>;

    fn next(&mut self) -> Option<Self::Item> {
        let first = self.rest.chars().next()?;
        let digits = first.is_ascii_digit();
        let end = self
            .rest
            .char_indices()
            .find(|(_, c)| c.is_ascii_digit() != digits)
            .map(|(i, _)| i)
            .unwrap_or(self.rest.len());
        let (head, tail) = self.rest.split_at(end);
        self.rest = tail;
        Some(if digits {
            Chunk::Digits(head)
        } else {
            Chunk::Text(head)
        })
    }
}

fn cmp_digits(a: &str, b: &str) -> Ordering {
    let a = a.trim_start_matches('0');
    let b = b.trim_start_matches('0');
    a.len().cmp(&b.len()).then_with(|| a.cmp(b))
}

fn cmp_text(a: &str, b: &str) -> Ordering {
    let a = a.chars().flat_map(char::to_lowercase);
    let b = b.chars().flat_map(char::to_lowercase);
    a.cmp(b)
}

/// Zero-pad width for sequential page names: max(3, digits of total)
pub fn pad_width(total: usize) -> usize {
    total.to_string().len().max(3)
}

/// Sequential page name for a zero-based index, e.g. `007.png`
///
/// `ext` must start with a dot; anything else falls back to `.jpg`.
pub fn page_file_name(index: usize, total: usize, ext: &str) -> String {
    let ext = if ext.starts_with('.') {
        ext
    } else {
        DEFAULT_PAGE_EXT
    };
    format!("{:0width$}{}", index + 1, ext, width = pad_width(total))
}

/// Lowercased extension (with dot) of a URL's path, `.jpg` when absent
pub fn image_ext_from_url(url: &str) -> String {
    url::Url::parse(url)
        .ok()
        .and_then(|u| path_extension(u.path()).map(str::to_lowercase))
        .map(|ext| format!(".{ext}"))
        .unwrap_or_else(|| DEFAULT_PAGE_EXT.to_string())
}

/// Drop the last extension of a URL whose path ends in two extensions
///
/// `https://host/p/001.jpg.webp` becomes `https://host/p/001.jpg`. Returns `None`
/// when the path does not end in a doubled extension.
pub fn strip_double_extension(url: &str) -> Option<String> {
    let mut parsed = url::Url::parse(url).ok()?;
    let path = parsed.path().to_string();
    let ext = path_extension(&path)?;
    let without_ext = &path[..path.len() - ext.len() - 1];
    path_extension(without_ext)?;
    parsed.set_path(without_ext);
    Some(parsed.to_string())
}

fn path_extension(path: &str) -> Option<&str> {
    Path::new(path)
        .extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
}

/// Current time as Unix milliseconds
pub fn now_millis() -> i64 {
    chrono::Utc::now().timestamp_millis()
}

/// Random lowercase hex string of `len` characters
pub fn random_hex(len: usize) -> String {
    let mut bytes = vec![0u8; len.div_ceil(2)];
    rand::rngs::OsRng.fill_bytes(&mut bytes);
    let mut out: String = bytes.iter().map(|b| format!("{b:02x}")).collect();
    out.truncate(len);
    out
}

/// Path of `path` relative to `root`, with `/` separators
///
/// Paths outside `root` are returned whole (still normalized).
pub fn relative_slash_path(root: &Path, path: &Path) -> String {
    let rel = path.strip_prefix(root).unwrap_or(path);
    rel.components()
        .map(|c| c.as_os_str().to_string_lossy())
        .collect::<Vec<_>>()
        .join("/")
}

/// Recursively list all files under `dir`
///
/// Unreadable directories are skipped rather than failing the listing.
pub async fn list_files_recursive(dir: &Path) -> Vec<PathBuf> {
    let mut results = Vec::new();
    let mut stack = vec![dir.to_path_buf()];

    while let Some(current) = stack.pop() {
        let mut entries = match tokio::fs::read_dir(&current).await {
            Ok(entries) => entries,
            Err(e) => {
                tracing::debug!(path = ?current, error = %e, "skipping unreadable directory");
                continue;
            }
        };

        while let Ok(Some(entry)) = entries.next_entry().await {
            let file_type = match entry.file_type().await {
                Ok(ft) => ft,
                Err(_) => continue,
            };
            if file_type.is_dir() {
                stack.push(entry.path());
            } else {
                results.push(entry.path());
            }
        }
    }

    results
}

/// List `tmp_*` directories directly under the library root
pub async fn list_temp_dirs(root: &Path) -> Vec<PathBuf> {
    let mut dirs = Vec::new();
    let mut entries = match tokio::fs::read_dir(root).await {
        Ok(entries) => entries,
        Err(_) => return dirs,
    };

    while let Ok(Some(entry)) = entries.next_entry().await {
        let is_dir = entry
            .file_type()
            .await
            .map(|ft| ft.is_dir())
            .unwrap_or(false);
        if is_dir && entry.file_name().to_string_lossy().starts_with(TEMP_DIR_PREFIX) {
            dirs.push(entry.path());
        }
    }

    dirs.sort();
    dirs
}

/// Whether a path exists (async, errors count as absent)
pub async fn path_exists(path: &Path) -> bool {
    tokio::fs::try_exists(path).await.unwrap_or(false)
}

/// Write bytes atomically: temp file, fsync, rename, then fsync the directory
pub async fn write_bytes_atomic(path: &Path, data: &[u8]) -> Result<()> {
    let mut tmp_name = path.as_os_str().to_owned();
    tmp_name.push(".tmp");
    let tmp_path = PathBuf::from(tmp_name);

    let written = async {
        let mut file = tokio::fs::File::create(&tmp_path).await?;
        file.write_all(data).await?;
        file.sync_all().await?;
        tokio::fs::rename(&tmp_path, path).await
    }
    .await;

    if let Err(e) = written {
        tokio::fs::remove_file(&tmp_path).await.ok();
        return Err(e.into());
    }

    // Directory fsync is best effort; not every platform allows opening a directory
    if let Some(parent) = path.parent()
        && let Ok(dir) = tokio::fs::File::open(parent).await
    {
        dir.sync_all().await.ok();
    }

    Ok(())
}

/// Serialize `value` as pretty JSON and write it atomically
pub async fn write_json_atomic<T: Serialize + ?Sized>(path: &Path, value: &T) -> Result<()> {
    let data = serde_json::to_vec_pretty(value)?;
    write_bytes_atomic(path, &data).await
}

/// Read and parse a JSON file, or `None` if it is missing or malformed
pub async fn try_read_json<T: DeserializeOwned>(path: &Path) -> Option<T> {
    let bytes = tokio::fs::read(path).await.ok()?;
    serde_json::from_slice(&bytes).ok()
}
