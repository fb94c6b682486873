//! Content mover
//!
//! Moves the pages of a temp directory into an item directory as vault files.
//! Inputs are processed by a fixed-size worker pool in natural order; a failing
//! file is recorded and skipped without stopping the others.

use futures::stream::{self, StreamExt};
use std::collections::HashSet;
use std::io;
use std::path::{Component, Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::task::{Context, Poll, ready};
use tokio::io::{AsyncRead, ReadBuf};

use crate::crypto::{DirectCipher, meta_backup_path, meta_path, meta_staged_path};
use crate::error::{Error, Result, ToHttpStatus};
use crate::library::{ENC_SUFFIX, PageEntry, image_dimensions};
use crate::utils::{list_files_recursive, natural_cmp, page_file_name, relative_slash_path};

pub mod sniff;

pub use sniff::{SNIFF_LEN, is_plain_image_file, is_plain_image_magic};

/// Extensions picked up by a directory scan (lowercase)
pub const ALLOWED_EXTENSIONS: [&str; 4] = [".webp", ".png", ".jpg", ".jpeg"];

/// Extension used for flattened names when the source has none
pub const FLATTEN_DEFAULT_EXT: &str = ".png";

/// Plaintext captured per page for dimension probing
pub const PROBE_LIMIT: usize = 256 * 1024;

/// What the input files contain
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum MoveSource {
    /// Sidecar-encrypted pages written by the fetch loop
    Encrypted,
    /// Plaintext images
    Plain,
}

/// Progress after each file
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct MoveProgress {
    /// Files handled so far
    pub done: usize,
    /// Files in this run
    pub total: usize,
    /// Whether this file was skipped (failed or already present)
    pub skipped: bool,
}

/// Progress callback
pub type ProgressFn = Arc<dyn Fn(MoveProgress) + Send + Sync>;

/// Options for [`move_to_vault`]
#[derive(Clone)]
pub struct MoveOptions {
    /// Delete sources (and their sidecars) once their vault file exists
    pub delete_originals: bool,
    /// Name outputs `NNN.ext` instead of keeping the relative structure
    pub flatten: bool,
    /// Explicit input list instead of a directory scan
    pub only_files: Option<Vec<PathBuf>>,
    /// Worker pool width
    pub concurrency: usize,
    /// Called after every file
    pub on_progress: Option<ProgressFn>,
}

impl Default for MoveOptions {
    fn default() -> Self {
        Self {
            delete_originals: true,
            flatten: true,
            only_files: None,
            concurrency: 4,
            on_progress: None,
        }
    }
}

/// Result for one input file
#[derive(Clone, Debug, PartialEq)]
pub struct FileOutcome {
    /// Input file
    pub src: PathBuf,
    /// Vault file written (or found), `None` on failure
    pub out: Option<PathBuf>,
    /// Machine-readable failure code
    pub error_code: Option<String>,
    /// Failure message
    pub message: Option<String>,
    /// Page index entry, when the page was encrypted in this run
    pub page: Option<PageEntry>,
}

/// Summary of a mover run
#[derive(Clone, Debug, Default, PartialEq)]
pub struct MoveReport {
    /// Inputs found
    pub total: usize,
    /// Inputs that ended up in the output directory
    pub moved: usize,
    /// Inputs that failed
    pub skipped: usize,
    /// First failure message
    pub first_error: Option<String>,
    /// Per-file results, in input order
    pub results: Vec<FileOutcome>,
    /// Vault files in input order
    pub encrypted_paths: Vec<PathBuf>,
    /// Encrypted inputs that turned out to be plaintext images
    pub plaintext_fallbacks: usize,
}

/// List inputs in natural order of their path relative to `input_dir`
pub async fn list_inputs(input_dir: &Path, only_files: Option<&[PathBuf]>) -> Vec<PathBuf> {
    let candidates: Vec<PathBuf> = match only_files {
        Some(files) if !files.is_empty() => files
            .iter()
            .map(|f| {
                if f.is_absolute() {
                    f.clone()
                } else {
                    input_dir.join(f)
                }
            })
            .collect(),
        _ => list_files_recursive(input_dir)
            .await
            .into_iter()
            .filter(|p| has_allowed_extension(p))
            .collect(),
    };

    let base = normalize_lexically(input_dir);
    let mut seen = HashSet::new();
    let mut inputs: Vec<(String, PathBuf)> = candidates
        .into_iter()
        .map(|p| normalize_lexically(&p))
        .filter(|p| seen.insert(p.clone()))
        .map(|p| (relative_slash_path(&base, &p), p))
        .collect();
    inputs.sort_by(|a, b| natural_cmp(&a.0, &b.0));
    inputs.into_iter().map(|(_, p)| p).collect()
}

/// Resolve `.` and `..` components without touching the filesystem
fn normalize_lexically(path: &Path) -> PathBuf {
    let mut out = PathBuf::new();
    for component in path.components() {
        match component {
            Component::CurDir => {}
            Component::ParentDir => {
                if !out.pop() {
                    out.push(component);
                }
            }
            other => out.push(other),
        }
    }
    out
}

fn has_allowed_extension(path: &Path) -> bool {
    lowercase_ext(path)
        .map(|ext| ALLOWED_EXTENSIONS.contains(&ext.as_str()))
        .unwrap_or(false)
}

fn lowercase_ext(path: &Path) -> Option<String> {
    path.extension()
        .and_then(|e| e.to_str())
        .filter(|e| !e.is_empty())
        .map(|e| format!(".{}", e.to_lowercase()))
}

/// Decide the move variant by sniffing the first `limit` inputs
pub async fn detect_source(
    input_dir: &Path,
    only_files: Option<&[PathBuf]>,
    limit: usize,
) -> MoveSource {
    let inputs = list_inputs(input_dir, only_files).await;
    for input in inputs.iter().take(limit) {
        if is_plain_image_file(input).await {
            return MoveSource::Plain;
        }
    }
    MoveSource::Encrypted
}

/// Move every input of `input_dir` into `output_dir` as vault files
pub async fn move_to_vault(
    cipher: &DirectCipher,
    source: MoveSource,
    input_dir: &Path,
    output_dir: &Path,
    options: &MoveOptions,
) -> Result<MoveReport> {
    tokio::fs::create_dir_all(output_dir).await?;

    let inputs = list_inputs(input_dir, options.only_files.as_deref()).await;
    let total = inputs.len();
    let done = AtomicUsize::new(0);
    let fallbacks = AtomicUsize::new(0);

    tracing::debug!(
        input = ?input_dir,
        output = ?output_dir,
        total,
        ?source,
        concurrency = options.concurrency,
        "moving pages into the library"
    );

    let mut indexed: Vec<(usize, FileOutcome, bool)> = stream::iter(inputs.into_iter().enumerate())
        .map(|(index, src)| {
            let done = &done;
            let fallbacks = &fallbacks;
            async move {
                let job = FileJob {
                    cipher,
                    source,
                    input_dir,
                    output_dir,
                    options,
                    index,
                    total,
                };
                let (outcome, newly_written) = match job.run(&src, fallbacks).await {
                    Ok(file) => (file.outcome, file.newly_written),
                    Err(e) => {
                        tracing::warn!(src = ?src, error = %e, "page move failed");
                        let outcome = FileOutcome {
                            src: src.clone(),
                            out: None,
                            error_code: Some(e.error_code().to_string()),
                            message: Some(e.to_string()),
                            page: None,
                        };
                        (outcome, false)
                    }
                };

                let finished = done.fetch_add(1, Ordering::SeqCst) + 1;
                if let Some(progress) = &options.on_progress {
                    progress(MoveProgress {
                        done: finished,
                        total,
                        skipped: !newly_written,
                    });
                }
                (index, outcome, newly_written)
            }
        })
        .buffer_unordered(options.concurrency.max(1))
        .collect()
        .await;
    indexed.sort_by_key(|(index, _, _)| *index);

    let mut report = MoveReport {
        total,
        plaintext_fallbacks: fallbacks.load(Ordering::SeqCst),
        ..Default::default()
    };
    for (_, outcome, _) in indexed {
        match &outcome.out {
            Some(out) => {
                report.moved += 1;
                report.encrypted_paths.push(out.clone());
            }
            None => {
                report.skipped += 1;
                if report.first_error.is_none() {
                    report.first_error = outcome.message.clone();
                }
            }
        }
        report.results.push(outcome);
    }

    tracing::info!(
        output = ?output_dir,
        total = report.total,
        moved = report.moved,
        skipped = report.skipped,
        plaintext_fallbacks = report.plaintext_fallbacks,
        "page move finished"
    );
    Ok(report)
}

struct FileJob<'a> {
    cipher: &'a DirectCipher,
    source: MoveSource,
    input_dir: &'a Path,
    output_dir: &'a Path,
    options: &'a MoveOptions,
    index: usize,
    total: usize,
}

struct FileDone {
    outcome: FileOutcome,
    newly_written: bool,
}

impl FileJob<'_> {
    fn output_path(&self, src: &Path) -> PathBuf {
        if self.options.flatten {
            let ext = lowercase_ext(src).unwrap_or_else(|| FLATTEN_DEFAULT_EXT.to_string());
            self.output_dir
                .join(page_file_name(self.index, self.total, &ext))
        } else {
            match src.strip_prefix(self.input_dir) {
                Ok(rel) => self.output_dir.join(rel),
                Err(_) => self
                    .output_dir
                    .join(src.file_name().unwrap_or(src.as_os_str())),
            }
        }
    }

    async fn run(&self, src: &Path, fallbacks: &AtomicUsize) -> Result<FileDone> {
        let out_path = self.output_path(src);
        let enc_path = with_enc_suffix(&out_path);
        if let Some(parent) = enc_path.parent() {
            tokio::fs::create_dir_all(parent).await?;
        }

        let out_rel = self.cipher.rel_path(&out_path);
        if self.has_valid_output(&out_rel, &enc_path).await {
            tracing::debug!(src = ?src, out = ?enc_path, "vault file already present");
            if self.options.delete_originals {
                remove_source(src).await;
            }
            return Ok(FileDone {
                outcome: FileOutcome {
                    src: src.to_path_buf(),
                    out: Some(enc_path),
                    error_code: None,
                    message: None,
                    page: None,
                },
                newly_written: false,
            });
        }

        let source_meta = tokio::fs::metadata(src).await?;

        let written = match self.encrypt(src, &out_rel, &enc_path, fallbacks).await {
            Ok(probe) => probe,
            Err(e) => {
                tokio::fs::remove_file(&enc_path).await.ok();
                return Err(e);
            }
        };

        if self.options.delete_originals {
            remove_source(src).await;
        }

        let dims = image_dimensions(&written.head);
        let file_name = enc_path
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_default();
        let page = PageEntry {
            file: file_name,
            w: dims.map(|d| d.width),
            h: dims.map(|d| d.height),
            bytes: Some(written.total).filter(|b| *b > 0),
            source_mtime_ms: source_meta
                .modified()
                .ok()
                .map(|t| chrono::DateTime::<chrono::Utc>::from(t).timestamp_millis())
                .filter(|ms| *ms >= 0),
            source_size: Some(source_meta.len()).filter(|s| *s > 0),
        };

        Ok(FileDone {
            outcome: FileOutcome {
                src: src.to_path_buf(),
                out: Some(enc_path),
                error_code: None,
                message: None,
                page: Some(page),
            },
            newly_written: true,
        })
    }

    /// Whether `enc_path` already holds a complete vault file for `out_rel`
    ///
    /// The whole file is authenticated; a matching header alone is not enough.
    async fn has_valid_output(&self, out_rel: &str, enc_path: &Path) -> bool {
        let vault = self.cipher.vault();
        match sniff::read_head(enc_path, SNIFF_LEN).await {
            Ok(head) if vault.has_vault_header(&head) => {}
            _ => return false,
        }
        match vault.verify_file(out_rel, enc_path).await {
            Ok(()) => true,
            Err(e) => {
                tracing::warn!(out = ?enc_path, error = %e, "existing vault file is not intact, rewriting");
                false
            }
        }
    }

    async fn encrypt(
        &self,
        src: &Path,
        out_rel: &str,
        enc_path: &Path,
        fallbacks: &AtomicUsize,
    ) -> Result<ProbeSummary> {
        let vault = self.cipher.vault();

        if self.source == MoveSource::Encrypted {
            let src_rel = self.cipher.rel_path(src);
            match self.cipher.open_plaintext(&src_rel, src, false).await {
                Ok(plain) => {
                    let mut probe = ProbeReader::new(plain);
                    vault
                        .encrypt_stream_to_path(out_rel, &mut probe, enc_path)
                        .await?;
                    return Ok(probe.finish());
                }
                Err(e) => {
                    if !is_plain_image_file(src).await {
                        return Err(e.into());
                    }
                    fallbacks.fetch_add(1, Ordering::SeqCst);
                    tracing::warn!(
                        src = ?src,
                        error = %e,
                        "encrypted page failed to decrypt but is a plaintext image, moving as plaintext"
                    );
                }
            }
        }

        let file = tokio::fs::File::open(src).await.map_err(Error::Io)?;
        let mut probe = ProbeReader::new(tokio::io::BufReader::new(file));
        vault
            .encrypt_stream_to_path(out_rel, &mut probe, enc_path)
            .await?;
        Ok(probe.finish())
    }
}

fn with_enc_suffix(path: &Path) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(ENC_SUFFIX);
    PathBuf::from(name)
}

async fn remove_source(src: &Path) {
    for path in [
        src.to_path_buf(),
        meta_path(src),
        meta_backup_path(src),
        meta_staged_path(src),
    ] {
        if let Err(e) = tokio::fs::remove_file(&path).await
            && e.kind() != io::ErrorKind::NotFound
        {
            tracing::debug!(path = ?path, error = %e, "failed to delete moved source");
        }
    }
}

struct ProbeSummary {
    head: Vec<u8>,
    total: u64,
}

/// Pass-through reader that keeps the first [`PROBE_LIMIT`] bytes
struct ProbeReader<R> {
    inner: R,
    head: Vec<u8>,
    total: u64,
}

impl<R> ProbeReader<R> {
    fn new(inner: R) -> Self {
        Self {
            inner,
            head: Vec::new(),
            total: 0,
        }
    }

    fn finish(self) -> ProbeSummary {
        ProbeSummary {
            head: self.head,
            total: self.total,
        }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for ProbeReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        let fresh = &buf.filled()[before..];
        this.total += fresh.len() as u64;
        let room = PROBE_LIMIT.saturating_sub(this.head.len());
        this.head
            .extend_from_slice(&fresh[..fresh.len().min(room)]);
        Poll::Ready(Ok(()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests;
