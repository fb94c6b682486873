//! Per-file encryption metadata
//!
//! Every ciphertext has a primary sidecar and a backup, both written atomically.
//! Reads fall back to the backup and rewrite the primary from it, so a sidecar
//! torn by a crash heals itself on the next read.
//!
//! When a ciphertext is replaced in place, the record for the new ciphertext is
//! staged next to it first. A crash after the ciphertext swap leaves the staged
//! record behind, and readers promote it once it authenticates the file.

use base64::{Engine as _, engine::general_purpose::STANDARD};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use zeroize::Zeroizing;

use super::{
    ALGORITHM, KEY_LEN, KeyKind, KeyMode, META_BACKUP_SUFFIX, META_STAGED_SUFFIX, META_SUFFIX,
    META_VERSION, NONCE_LEN, TAG_LEN,
};
use crate::error::CipherError;
use crate::utils::{list_files_recursive, try_read_json, write_bytes_atomic, write_json_atomic};

/// On-disk sidecar record
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct SidecarRecord {
    /// Schema version (1 or 2)
    pub v: i64,
    /// Cipher name, `"aes-256-gcm"`
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub alg: Option<String>,
    /// Key mode name; absent in version 1 records
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub kdf: Option<String>,
    /// Base64 nonce
    pub iv_b64: String,
    /// Base64 tag
    pub tag_b64: String,
    /// Base64 data key, random mode only
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub key_b64: Option<String>,
}

impl SidecarRecord {
    /// Build a current-version record
    pub fn new(nonce: &[u8; NONCE_LEN], tag: &[u8; TAG_LEN], key_mode: &KeyMode) -> Self {
        let key_b64 = match key_mode {
            KeyMode::Vault => None,
            KeyMode::Random { key } => Some(STANDARD.encode(&key[..])),
        };
        Self {
            v: META_VERSION,
            alg: Some(ALGORITHM.to_string()),
            kdf: Some(key_mode.kind().as_str().to_string()),
            iv_b64: STANDARD.encode(nonce),
            tag_b64: STANDARD.encode(tag),
            key_b64,
        }
    }

    /// Key mode the record declares, before any key validation
    pub fn declared_kind(&self) -> KeyKind {
        if self.v == 1 {
            return KeyKind::Random;
        }
        match self.kdf.as_deref().and_then(KeyKind::parse) {
            Some(KeyKind::Vault) => KeyKind::Vault,
            _ => KeyKind::Random,
        }
    }
}

/// Validated sidecar contents, before a vault key has been derived
#[derive(Debug)]
pub struct ParsedMeta {
    /// Record version
    pub version: i64,
    /// Effective key mode (`Random` carries its key)
    pub key_mode: KeyMode,
    /// Nonce
    pub nonce: [u8; NONCE_LEN],
    /// Tag
    pub tag: [u8; TAG_LEN],
}

/// Everything needed to decrypt one ciphertext
pub struct ResolvedMeta {
    /// Data key (derived or from the sidecar)
    pub data_key: Zeroizing<[u8; KEY_LEN]>,
    /// Key mode the file is encrypted under
    pub key_mode: KeyMode,
    /// Nonce
    pub nonce: [u8; NONCE_LEN],
    /// Tag
    pub tag: [u8; TAG_LEN],
    /// Associated data (empty for random mode)
    pub aad: String,
}

/// Key mode of the first sidecar in a temp directory
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct TempEncryptionInfo {
    /// Record version
    pub version: i64,
    /// Declared key mode
    pub key_mode: KeyKind,
}

/// Primary sidecar path for a ciphertext
pub fn meta_path(path: &Path) -> PathBuf {
    with_suffix(path, META_SUFFIX)
}

/// Backup sidecar path for a ciphertext
pub fn meta_backup_path(path: &Path) -> PathBuf {
    with_suffix(path, META_BACKUP_SUFFIX)
}

/// Staged sidecar path for a ciphertext that is being replaced
pub fn meta_staged_path(path: &Path) -> PathBuf {
    with_suffix(path, META_STAGED_SUFFIX)
}

fn with_suffix(path: &Path, suffix: &str) -> PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    PathBuf::from(name)
}

/// Write the sidecar and its backup for `path`
pub async fn write_meta(path: &Path, record: &SidecarRecord) -> Result<(), CipherError> {
    for target in [meta_path(path), meta_backup_path(path)] {
        write_json_atomic(&target, record)
            .await
            .map_err(|e| CipherError::Write {
                path: target.clone(),
                reason: e.to_string(),
            })?;
    }
    Ok(())
}

/// Write the record for a replacement ciphertext under the staged name
pub async fn stage_meta(path: &Path, record: &SidecarRecord) -> Result<(), CipherError> {
    let target = meta_staged_path(path);
    write_json_atomic(&target, record)
        .await
        .map_err(|e| CipherError::Write {
            path: target.clone(),
            reason: e.to_string(),
        })
}

/// Read the staged record for `path`, if there is a valid one
pub async fn read_staged_meta(path: &Path, vault_initialized: bool) -> Option<ParsedMeta> {
    let staged = meta_staged_path(path);
    match load(&staged, &staged, vault_initialized).await {
        Ok((meta, _)) => Some(meta),
        Err(CipherError::MetadataMissing { .. }) => None,
        Err(e) => {
            tracing::warn!(path = ?staged, error = %e, "ignoring unreadable staged sidecar");
            None
        }
    }
}

/// Make the staged record the primary and backup sidecar of `path`
///
/// The staged file is removed only after both copies are written.
pub async fn promote_staged_meta(path: &Path) -> Result<(), CipherError> {
    let staged = meta_staged_path(path);
    let raw = tokio::fs::read(&staged)
        .await
        .map_err(|e| CipherError::MetadataInvalid {
            path: staged.clone(),
            reason: e.to_string(),
        })?;
    for target in [meta_path(path), meta_backup_path(path)] {
        write_bytes_atomic(&target, &raw)
            .await
            .map_err(|e| CipherError::Write {
                path: target.clone(),
                reason: e.to_string(),
            })?;
    }
    discard_staged_meta(path).await;
    Ok(())
}

/// Remove a leftover staged record
pub async fn discard_staged_meta(path: &Path) {
    let staged = meta_staged_path(path);
    if let Err(e) = tokio::fs::remove_file(&staged).await
        && e.kind() != std::io::ErrorKind::NotFound
    {
        tracing::debug!(path = ?staged, error = %e, "failed to remove staged sidecar");
    }
}

/// Read and validate the sidecar for `path`, healing the primary from the backup
///
/// `vault_initialized` decides how a random record with a lost key is treated:
/// with a vault it is read as vault mode, without one it is invalid.
pub async fn read_meta(path: &Path, vault_initialized: bool) -> Result<ParsedMeta, CipherError> {
    let primary = meta_path(path);
    let primary_err = match load(&primary, &primary, vault_initialized).await {
        Ok((meta, _)) => return Ok(meta),
        Err(e) => e,
    };

    let backup = meta_backup_path(path);
    match load(&backup, &primary, vault_initialized).await {
        Ok((meta, raw)) => {
            tracing::info!(path = ?primary, error = %primary_err, "restoring sidecar from backup");
            if let Err(e) = write_bytes_atomic(&primary, &raw).await {
                tracing::warn!(path = ?primary, error = %e, "failed to rewrite sidecar from backup");
            }
            Ok(meta)
        }
        Err(_) => Err(primary_err),
    }
}

async fn load(
    source: &Path,
    primary: &Path,
    vault_initialized: bool,
) -> Result<(ParsedMeta, Vec<u8>), CipherError> {
    let raw = match tokio::fs::read(source).await {
        Ok(raw) => raw,
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
            return Err(CipherError::MetadataMissing {
                path: primary.to_path_buf(),
            });
        }
        Err(e) => {
            return Err(CipherError::MetadataInvalid {
                path: source.to_path_buf(),
                reason: e.to_string(),
            });
        }
    };

    let record: SidecarRecord =
        serde_json::from_slice(&raw).map_err(|e| CipherError::MetadataInvalid {
            path: source.to_path_buf(),
            reason: e.to_string(),
        })?;

    let meta = parse_record(&record, source, vault_initialized)?;
    Ok((meta, raw))
}

/// Validate a record's fields and settle its effective key mode
pub fn parse_record(
    record: &SidecarRecord,
    source: &Path,
    vault_initialized: bool,
) -> Result<ParsedMeta, CipherError> {
    if record.v != 1 && record.v != 2 {
        return Err(CipherError::UnsupportedMetadataVersion { version: record.v });
    }
    if let Some(alg) = record.alg.as_deref()
        && alg != ALGORITHM
    {
        return Err(invalid(source, format!("unsupported algorithm {alg}")));
    }

    let nonce: [u8; NONCE_LEN] = decode_fixed(&record.iv_b64, source, "iv")?;
    let tag: [u8; TAG_LEN] = decode_fixed(&record.tag_b64, source, "tag")?;

    let key_mode = match record.declared_kind() {
        KeyKind::Vault => KeyMode::Vault,
        KeyKind::Random => {
            let key = record
                .key_b64
                .as_deref()
                .and_then(|k| STANDARD.decode(k).ok())
                .and_then(|k| <[u8; KEY_LEN]>::try_from(k.as_slice()).ok());
            match key {
                Some(key) => KeyMode::Random {
                    key: Zeroizing::new(key),
                },
                None if vault_initialized => {
                    tracing::warn!(path = ?source, "random sidecar without usable key, reading as vault mode");
                    KeyMode::Vault
                }
                None => {
                    return Err(invalid(source, "random key missing or not 32 bytes".into()));
                }
            }
        }
    };

    Ok(ParsedMeta {
        version: record.v,
        key_mode,
        nonce,
        tag,
    })
}

fn decode_fixed<const N: usize>(
    value: &str,
    source: &Path,
    field: &str,
) -> Result<[u8; N], CipherError> {
    let bytes = STANDARD
        .decode(value)
        .map_err(|e| invalid(source, format!("{field} is not base64: {e}")))?;
    <[u8; N]>::try_from(bytes.as_slice()).map_err(|_| {
        tracing::warn!(path = ?source, field, expected = N, actual = bytes.len(), "sidecar field has wrong length");
        invalid(source, format!("{field} must be {N} bytes, got {}", bytes.len()))
    })
}

fn invalid(source: &Path, reason: String) -> CipherError {
    CipherError::MetadataInvalid {
        path: source.to_path_buf(),
        reason,
    }
}

/// Inspect the first sidecar (in sorted order) under `temp_dir`
pub async fn read_temp_encryption_info(temp_dir: &Path) -> Option<TempEncryptionInfo> {
    let mut sidecars: Vec<PathBuf> = list_files_recursive(temp_dir)
        .await
        .into_iter()
        .filter(|p| p.to_string_lossy().ends_with(META_SUFFIX))
        .collect();
    sidecars.sort();

    let record: SidecarRecord = try_read_json(sidecars.first()?).await?;
    Some(TempEncryptionInfo {
        version: record.v,
        key_mode: record.declared_kind(),
    })
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn sample_record() -> SidecarRecord {
        SidecarRecord::new(
            &[1; NONCE_LEN],
            &[2; TAG_LEN],
            &KeyMode::Random {
                key: Zeroizing::new([3; KEY_LEN]),
            },
        )
    }

    #[tokio::test]
    async fn test_write_then_read_both_copies() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        write_meta(&page, &sample_record()).await.unwrap();

        assert!(meta_path(&page).exists());
        assert!(meta_backup_path(&page).exists());

        let meta = read_meta(&page, false).await.unwrap();
        assert_eq!(meta.version, 2);
        assert_eq!(meta.nonce, [1; NONCE_LEN]);
        assert!(matches!(meta.key_mode, KeyMode::Random { ref key } if **key == [3; KEY_LEN]));
    }

    #[tokio::test]
    async fn test_corrupt_primary_heals_from_backup() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        write_meta(&page, &sample_record()).await.unwrap();
        tokio::fs::write(meta_path(&page), b"{ torn").await.unwrap();

        let meta = read_meta(&page, false).await.unwrap();
        assert_eq!(meta.tag, [2; TAG_LEN]);

        let healed: SidecarRecord = try_read_json(&meta_path(&page)).await.unwrap();
        assert_eq!(healed, sample_record());
    }

    #[tokio::test]
    async fn test_missing_sidecar_reports_primary_path() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let err = read_meta(&page, false).await.unwrap_err();
        assert!(matches!(err, CipherError::MetadataMissing { ref path } if *path == meta_path(&page)));
    }

    #[tokio::test]
    async fn test_both_unusable_returns_primary_error() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let mut record = sample_record();
        record.v = 7;
        write_meta(&page, &record).await.unwrap();

        let err = read_meta(&page, false).await.unwrap_err();
        assert!(matches!(err, CipherError::UnsupportedMetadataVersion { version: 7 }));
    }

    #[test]
    fn test_version_one_is_always_random() {
        let mut record = sample_record();
        record.v = 1;
        record.kdf = Some("vault".into());
        let meta = parse_record(&record, Path::new("x"), true).unwrap();
        assert!(matches!(meta.key_mode, KeyMode::Random { .. }));
    }

    #[test]
    fn test_wrong_lengths_are_rejected() {
        let mut short_iv = sample_record();
        short_iv.iv_b64 = STANDARD.encode([0u8; 8]);
        assert!(matches!(
            parse_record(&short_iv, Path::new("x"), false),
            Err(CipherError::MetadataInvalid { .. })
        ));

        let mut long_tag = sample_record();
        long_tag.tag_b64 = STANDARD.encode([0u8; 20]);
        assert!(matches!(
            parse_record(&long_tag, Path::new("x"), true),
            Err(CipherError::MetadataInvalid { .. })
        ));

        let mut bad_key = sample_record();
        bad_key.key_b64 = Some(STANDARD.encode([0u8; 16]));
        assert!(matches!(
            parse_record(&bad_key, Path::new("x"), false),
            Err(CipherError::MetadataInvalid { .. })
        ));
    }

    #[test]
    fn test_random_without_key_reads_as_vault_when_initialized() {
        let mut record = sample_record();
        record.key_b64 = None;
        let meta = parse_record(&record, Path::new("x"), true).unwrap();
        assert!(matches!(meta.key_mode, KeyMode::Vault));
    }

    #[tokio::test]
    async fn test_temp_encryption_info_uses_first_sidecar() {
        let dir = TempDir::new().unwrap();
        write_meta(&dir.path().join("002.jpg"), &sample_record())
            .await
            .unwrap();
        let vault_record = SidecarRecord::new(&[0; NONCE_LEN], &[0; TAG_LEN], &KeyMode::Vault);
        write_meta(&dir.path().join("001.jpg"), &vault_record)
            .await
            .unwrap();

        let info = read_temp_encryption_info(dir.path()).await.unwrap();
        assert_eq!(info.key_mode, KeyKind::Vault);
        assert_eq!(info.version, 2);

        let empty = TempDir::new().unwrap();
        assert!(read_temp_encryption_info(empty.path()).await.is_none());
    }
}
