//! Direct (sidecar-based) file encryption
//!
//! Used for pages in a job's temp directory. Ciphertext is written raw with no
//! header; nonce, tag and key mode go into the sidecar.

use rand::RngCore;
use std::io;
use std::path::{Path, PathBuf};
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll, ready};
use tokio::fs::File;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader, ReadBuf};
use zeroize::Zeroizing;

use super::sidecar::{self, ParsedMeta, ResolvedMeta, SidecarRecord};
use super::{CHUNK_SIZE, GcmStream, KEY_LEN, KeyMode, NONCE_LEN, TAG_LEN, normalize_rel_path};
use crate::error::CipherError;
use crate::utils::relative_slash_path;
use crate::vault::Vault;

/// Result of streaming one file through the cipher
#[derive(Debug, Clone)]
pub struct EncryptOutcome {
    /// Nonce used
    pub nonce: [u8; NONCE_LEN],
    /// Detached tag
    pub tag: [u8; TAG_LEN],
    /// Key mode the file was written under
    pub key_mode: KeyMode,
    /// Plaintext bytes consumed
    pub bytes: u64,
}

/// Sidecar-based cipher bound to a vault and a library root
#[derive(Clone)]
pub struct DirectCipher {
    vault: Arc<dyn Vault>,
    library_root: PathBuf,
    upgrade_random_on_read: bool,
}

impl DirectCipher {
    /// Create a cipher for files under `library_root`
    pub fn new(vault: Arc<dyn Vault>, library_root: PathBuf, upgrade_random_on_read: bool) -> Self {
        Self {
            vault,
            library_root,
            upgrade_random_on_read,
        }
    }

    /// The vault backing this cipher
    pub fn vault(&self) -> &Arc<dyn Vault> {
        &self.vault
    }

    /// Path relative to the library root, `/`-separated
    pub fn rel_path(&self, path: &Path) -> String {
        relative_slash_path(&self.library_root, path)
    }

    /// Encrypt `reader` into `output` and return what the sidecar needs
    ///
    /// With an initialized vault the key is derived for `rel_path` and the path
    /// is bound as associated data; without one a random key is generated. The
    /// partial output is deleted if anything fails.
    pub async fn encrypt_stream_to_file<R>(
        &self,
        rel_path: &str,
        reader: &mut R,
        output: &Path,
    ) -> Result<EncryptOutcome, CipherError>
    where
        R: AsyncRead + Unpin + ?Sized,
    {
        let (key, key_mode, aad) = if self.vault.is_initialized() {
            if !self.vault.is_unlocked() {
                return Err(CipherError::VaultLocked);
            }
            (
                self.vault.derive_key(rel_path)?,
                KeyMode::Vault,
                normalize_rel_path(rel_path),
            )
        } else {
            let mut key = Zeroizing::new([0u8; KEY_LEN]);
            rand::rngs::OsRng.fill_bytes(&mut key[..]);
            let mode = KeyMode::Random { key: key.clone() };
            (key, mode, String::new())
        };

        let mut nonce = [0u8; NONCE_LEN];
        rand::rngs::OsRng.fill_bytes(&mut nonce);

        match stream_encrypt(&key, &nonce, aad.as_bytes(), reader, output).await {
            Ok((tag, bytes)) => Ok(EncryptOutcome {
                nonce,
                tag,
                key_mode,
                bytes,
            }),
            Err(e) => {
                tokio::fs::remove_file(output).await.ok();
                Err(e)
            }
        }
    }

    /// Write the sidecar and backup for a freshly encrypted file
    pub async fn write_meta(&self, path: &Path, outcome: &EncryptOutcome) -> Result<(), CipherError> {
        let record = SidecarRecord::new(&outcome.nonce, &outcome.tag, &outcome.key_mode);
        sidecar::write_meta(path, &record).await?;
        sidecar::discard_staged_meta(path).await;
        Ok(())
    }

    /// Read the sidecar for `path` and settle the data key
    pub async fn read_meta(&self, rel_path: &str, path: &Path) -> Result<ResolvedMeta, CipherError> {
        let parsed = sidecar::read_meta(path, self.vault.is_initialized()).await?;
        self.resolve(rel_path, parsed)
    }

    fn resolve(&self, rel_path: &str, parsed: ParsedMeta) -> Result<ResolvedMeta, CipherError> {
        let (data_key, aad) = match &parsed.key_mode {
            KeyMode::Random { key } => (key.clone(), String::new()),
            KeyMode::Vault => {
                if !self.vault.is_initialized() {
                    return Err(CipherError::VaultUninitialized);
                }
                if !self.vault.is_unlocked() {
                    return Err(CipherError::VaultLocked);
                }
                (self.vault.derive_key(rel_path)?, normalize_rel_path(rel_path))
            }
        };

        Ok(ResolvedMeta {
            data_key,
            key_mode: parsed.key_mode,
            nonce: parsed.nonce,
            tag: parsed.tag,
            aad,
        })
    }

    /// Verify `path` and return a reader over its plaintext
    ///
    /// The tag is checked over the whole file before any plaintext is produced.
    /// With `upgrade`, a random-mode file read under an unlocked vault is first
    /// re-encrypted in place under the vault key. A file whose sidecar fails to
    /// authenticate it is retried with a staged record left by an interrupted
    /// upgrade.
    pub async fn open_plaintext(
        &self,
        rel_path: &str,
        path: &Path,
        upgrade: bool,
    ) -> Result<KeystreamReader<BufReader<File>>, CipherError> {
        let meta = self.read_meta(rel_path, path).await?;

        if upgrade
            && matches!(meta.key_mode, KeyMode::Random { .. })
            && self.vault.is_initialized()
            && self.vault.is_unlocked()
        {
            match self.upgrade_to_vault(rel_path, path, &meta).await {
                Ok(()) => {
                    let upgraded = self.read_meta(rel_path, path).await?;
                    return open_verified(path, &upgraded).await;
                }
                Err(e) => {
                    tracing::warn!(path = ?path, error = %e, "random-key upgrade failed, reading original");
                }
            }
        }

        let err = match open_verified(path, &meta).await {
            Ok(reader) => return Ok(reader),
            Err(e) => e,
        };
        if matches!(err, CipherError::AuthFailed { .. })
            && let Some(reader) = self.recover_staged(rel_path, path).await?
        {
            return Ok(reader);
        }
        Err(err)
    }

    /// Open `path` under its staged record and promote that record
    async fn recover_staged(
        &self,
        rel_path: &str,
        path: &Path,
    ) -> Result<Option<KeystreamReader<BufReader<File>>>, CipherError> {
        let Some(parsed) = sidecar::read_staged_meta(path, self.vault.is_initialized()).await
        else {
            return Ok(None);
        };
        let meta = self.resolve(rel_path, parsed)?;
        let Ok(reader) = open_verified(path, &meta).await else {
            return Ok(None);
        };

        tracing::info!(path = ?path, "recovered sidecar staged by an interrupted rewrite");
        if let Err(e) = sidecar::promote_staged_meta(path).await {
            tracing::warn!(path = ?path, error = %e, "failed to promote staged sidecar");
        }
        Ok(Some(reader))
    }

    /// Decrypt `path` into `writer`; returns the plaintext byte count
    pub async fn decrypt_file<W>(
        &self,
        rel_path: &str,
        path: &Path,
        writer: &mut W,
    ) -> Result<u64, CipherError>
    where
        W: AsyncWrite + Unpin + ?Sized,
    {
        let mut reader = self
            .open_plaintext(rel_path, path, self.upgrade_random_on_read)
            .await?;
        let written = copy_plaintext(&mut reader, writer).await?;
        Ok(written)
    }

    /// Decrypt `path` fully into memory
    pub async fn decrypt_to_vec(&self, rel_path: &str, path: &Path) -> Result<Vec<u8>, CipherError> {
        let mut out = Vec::new();
        self.decrypt_file(rel_path, path, &mut out).await?;
        Ok(out)
    }

    async fn upgrade_to_vault(
        &self,
        rel_path: &str,
        path: &Path,
        meta: &ResolvedMeta,
    ) -> Result<(), CipherError> {
        let mut plain = open_verified(path, meta).await?;
        // The current record authenticates the file, so any staged one is stale
        sidecar::discard_staged_meta(path).await;

        let mut tmp_name = path.as_os_str().to_owned();
        tmp_name.push(".upgrade.tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let outcome = self
            .encrypt_stream_to_file(rel_path, &mut plain, &tmp_path)
            .await?;
        if !matches!(outcome.key_mode, KeyMode::Vault) {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(CipherError::VaultLocked);
        }

        // Stage the new record before the swap so a crash in between stays readable
        let record = SidecarRecord::new(&outcome.nonce, &outcome.tag, &outcome.key_mode);
        if let Err(e) = sidecar::stage_meta(path, &record).await {
            tokio::fs::remove_file(&tmp_path).await.ok();
            return Err(e);
        }
        if let Err(e) = tokio::fs::rename(&tmp_path, path).await {
            tokio::fs::remove_file(&tmp_path).await.ok();
            sidecar::discard_staged_meta(path).await;
            return Err(CipherError::Write {
                path: path.to_path_buf(),
                reason: e.to_string(),
            });
        }
        sidecar::promote_staged_meta(path).await?;

        tracing::info!(path = ?path, "upgraded random-key file to vault key");
        Ok(())
    }
}

async fn stream_encrypt<R>(
    key: &[u8; KEY_LEN],
    nonce: &[u8; NONCE_LEN],
    aad: &[u8],
    reader: &mut R,
    output: &Path,
) -> Result<([u8; TAG_LEN], u64), CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
{
    let write_err = |e: io::Error| CipherError::Write {
        path: output.to_path_buf(),
        reason: e.to_string(),
    };

    let mut file = File::create(output).await.map_err(write_err)?;
    let mut gcm = GcmStream::new(key, nonce, aad);
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;

    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| CipherError::Source(e.to_string()))?;
        if n == 0 {
            break;
        }
        gcm.encrypt(&mut buf[..n]);
        file.write_all(&buf[..n]).await.map_err(write_err)?;
        total += n as u64;
    }

    file.flush().await.map_err(write_err)?;
    file.sync_all().await.map_err(write_err)?;
    Ok((gcm.finalize(), total))
}

async fn open_verified(
    path: &Path,
    meta: &ResolvedMeta,
) -> Result<KeystreamReader<BufReader<File>>, CipherError> {
    let read_err = |e: io::Error| CipherError::Source(format!("{}: {e}", path.display()));

    let mut check = GcmStream::new(&meta.data_key, &meta.nonce, meta.aad.as_bytes());
    let mut file = File::open(path).await.map_err(read_err)?;
    let mut buf = vec![0u8; CHUNK_SIZE];
    loop {
        let n = file.read(&mut buf).await.map_err(read_err)?;
        if n == 0 {
            break;
        }
        check.absorb_ciphertext(&buf[..n]);
    }
    if !check.verify(&meta.tag) {
        return Err(CipherError::AuthFailed {
            path: path.to_path_buf(),
        });
    }

    let file = File::open(path).await.map_err(read_err)?;
    Ok(KeystreamReader::new(
        BufReader::with_capacity(CHUNK_SIZE, file),
        GcmStream::new(&meta.data_key, &meta.nonce, meta.aad.as_bytes()),
    ))
}

async fn copy_plaintext<R, W>(reader: &mut R, writer: &mut W) -> Result<u64, CipherError>
where
    R: AsyncRead + Unpin + ?Sized,
    W: AsyncWrite + Unpin + ?Sized,
{
    let mut buf = vec![0u8; CHUNK_SIZE];
    let mut total = 0u64;
    loop {
        let n = reader
            .read(&mut buf)
            .await
            .map_err(|e| CipherError::Source(e.to_string()))?;
        if n == 0 {
            break;
        }
        writer
            .write_all(&buf[..n])
            .await
            .map_err(|e| CipherError::Write {
                path: PathBuf::new(),
                reason: e.to_string(),
            })?;
        total += n as u64;
    }
    writer.flush().await.map_err(|e| CipherError::Write {
        path: PathBuf::new(),
        reason: e.to_string(),
    })?;
    Ok(total)
}

/// Reader that strips the keystream from already-verified ciphertext
pub struct KeystreamReader<R> {
    inner: R,
    gcm: GcmStream,
}

impl<R> KeystreamReader<R> {
    fn new(inner: R, gcm: GcmStream) -> Self {
        Self { inner, gcm }
    }
}

impl<R: AsyncRead + Unpin> AsyncRead for KeystreamReader<R> {
    fn poll_read(
        self: Pin<&mut Self>,
        cx: &mut Context<'_>,
        buf: &mut ReadBuf<'_>,
    ) -> Poll<io::Result<()>> {
        let this = self.get_mut();
        let before = buf.filled().len();
        ready!(Pin::new(&mut this.inner).poll_read(cx, buf))?;
        this.gcm.apply_keystream(&mut buf.filled_mut()[before..]);
        Poll::Ready(Ok(()))
    }
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;
    use crate::crypto::sidecar::{meta_backup_path, meta_path, meta_staged_path};
    use crate::crypto::KeyKind;
    use crate::vault::{MasterKeyVault, NoVault};
    use tempfile::TempDir;

    fn page_bytes() -> Vec<u8> {
        let mut data = b"\x89PNG\r\n\x1a\n".to_vec();
        data.extend((0..150_000u32).map(|i| (i % 251) as u8));
        data
    }

    fn vault_cipher(root: &Path) -> (DirectCipher, Arc<MasterKeyVault>) {
        let vault = Arc::new(MasterKeyVault::unlocked([7; KEY_LEN]));
        let cipher = DirectCipher::new(vault.clone(), root.to_path_buf(), true);
        (cipher, vault)
    }

    async fn encrypt_page(cipher: &DirectCipher, path: &Path, data: &[u8]) -> EncryptOutcome {
        let rel = cipher.rel_path(path);
        let mut reader: &[u8] = data;
        let outcome = cipher
            .encrypt_stream_to_file(&rel, &mut reader, path)
            .await
            .unwrap();
        cipher.write_meta(path, &outcome).await.unwrap();
        outcome
    }

    #[tokio::test]
    async fn test_vault_mode_round_trip() {
        let dir = TempDir::new().unwrap();
        let (cipher, _vault) = vault_cipher(dir.path());
        let page = dir.path().join("tmp_1_1").join("001.png");
        tokio::fs::create_dir_all(page.parent().unwrap()).await.unwrap();

        let data = page_bytes();
        let outcome = encrypt_page(&cipher, &page, &data).await;
        assert!(matches!(outcome.key_mode, KeyMode::Vault));
        assert_eq!(outcome.bytes, data.len() as u64);

        let on_disk = tokio::fs::read(&page).await.unwrap();
        assert_eq!(on_disk.len(), data.len());
        assert_ne!(on_disk, data);

        let plain = cipher.decrypt_to_vec("tmp_1_1/001.png", &page).await.unwrap();
        assert_eq!(plain, data);
    }

    #[tokio::test]
    async fn test_random_mode_without_vault() {
        let dir = TempDir::new().unwrap();
        let cipher = DirectCipher::new(Arc::new(NoVault), dir.path().to_path_buf(), true);
        let page = dir.path().join("001.jpg");

        let outcome = encrypt_page(&cipher, &page, b"jpeg bytes").await;
        assert_eq!(outcome.key_mode.kind(), KeyKind::Random);

        let record: SidecarRecord = crate::utils::try_read_json(&meta_path(&page)).await.unwrap();
        assert_eq!(record.kdf.as_deref(), Some("random"));
        assert!(record.key_b64.is_some());

        let plain = cipher.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(plain, b"jpeg bytes");
    }

    #[tokio::test]
    async fn test_locked_vault_refuses_to_encrypt() {
        let dir = TempDir::new().unwrap();
        let cipher = DirectCipher::new(
            Arc::new(MasterKeyVault::locked()),
            dir.path().to_path_buf(),
            true,
        );
        let page = dir.path().join("001.jpg");
        let mut reader: &[u8] = b"x";
        let err = cipher
            .encrypt_stream_to_file("001.jpg", &mut reader, &page)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::VaultLocked));
        assert!(!page.exists());
    }

    #[tokio::test]
    async fn test_tampered_ciphertext_fails_closed() {
        let dir = TempDir::new().unwrap();
        let (cipher, _vault) = vault_cipher(dir.path());
        let page = dir.path().join("001.png");
        encrypt_page(&cipher, &page, &page_bytes()).await;

        let mut bytes = tokio::fs::read(&page).await.unwrap();
        bytes[100] ^= 0x01;
        tokio::fs::write(&page, &bytes).await.unwrap();

        let mut out = Vec::new();
        let err = cipher
            .decrypt_file("001.png", &page, &mut out)
            .await
            .unwrap_err();
        assert!(matches!(err, CipherError::AuthFailed { .. }));
        assert!(out.is_empty(), "no plaintext before verification");
    }

    #[tokio::test]
    async fn test_wrong_relative_path_fails_auth() {
        let dir = TempDir::new().unwrap();
        let (cipher, _vault) = vault_cipher(dir.path());
        let page = dir.path().join("001.png");
        encrypt_page(&cipher, &page, b"page").await;

        let err = cipher.decrypt_to_vec("002.png", &page).await.unwrap_err();
        assert!(matches!(err, CipherError::AuthFailed { .. }));
    }

    #[tokio::test]
    async fn test_reading_vault_file_with_locked_vault() {
        let dir = TempDir::new().unwrap();
        let (cipher, vault) = vault_cipher(dir.path());
        let page = dir.path().join("001.png");
        encrypt_page(&cipher, &page, b"page").await;

        vault.lock();
        let err = cipher.decrypt_to_vec("001.png", &page).await.unwrap_err();
        assert!(matches!(err, CipherError::VaultLocked));
    }

    #[tokio::test]
    async fn test_random_file_upgrades_on_read() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let writer = DirectCipher::new(Arc::new(NoVault), dir.path().to_path_buf(), true);
        encrypt_page(&writer, &page, b"before the vault existed").await;

        let (reader, _vault) = vault_cipher(dir.path());
        let plain = reader.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(plain, b"before the vault existed");

        for sidecar in [meta_path(&page), meta_backup_path(&page)] {
            let record: SidecarRecord = crate::utils::try_read_json(&sidecar).await.unwrap();
            assert_eq!(record.kdf.as_deref(), Some("vault"));
            assert!(record.key_b64.is_none());
        }
        assert!(!dir.path().join("001.jpg.upgrade.tmp").exists());

        let again = reader.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(again, b"before the vault existed");
    }

    #[tokio::test]
    async fn test_open_plaintext_without_upgrade_keeps_random_mode() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let writer = DirectCipher::new(Arc::new(NoVault), dir.path().to_path_buf(), true);
        encrypt_page(&writer, &page, b"plain").await;

        let (reader, _vault) = vault_cipher(dir.path());
        let mut stream = reader.open_plaintext("001.jpg", &page, false).await.unwrap();
        let mut out = Vec::new();
        stream.read_to_end(&mut out).await.unwrap();
        assert_eq!(out, b"plain");

        let record: SidecarRecord = crate::utils::try_read_json(&meta_path(&page)).await.unwrap();
        assert_eq!(record.kdf.as_deref(), Some("random"));
    }

    #[tokio::test]
    async fn test_failed_write_leaves_no_partial_file() {
        let dir = TempDir::new().unwrap();
        let (cipher, _vault) = vault_cipher(dir.path());
        let output = dir.path().join("missing-parent").join("001.png");
        let mut reader: &[u8] = b"data";
        let err = cipher
            .encrypt_stream_to_file("missing-parent/001.png", &mut reader, &output)
            .await
            .unwrap_err();
        assert!(err.is_fatal());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_source_read_error_is_not_fatal_and_cleans_up() {
        // Hands out a few chunks, then drops the connection mid-body
        struct Truncated {
            chunks_left: usize,
        }
        impl AsyncRead for Truncated {
            fn poll_read(
                mut self: Pin<&mut Self>,
                _cx: &mut Context<'_>,
                buf: &mut ReadBuf<'_>,
            ) -> Poll<io::Result<()>> {
                if self.chunks_left == 0 {
                    return Poll::Ready(Err(io::Error::new(io::ErrorKind::ConnectionReset, "reset")));
                }
                self.chunks_left -= 1;
                let n = buf.remaining().min(4096);
                buf.put_slice(&[0xAB; 4096][..n]);
                Poll::Ready(Ok(()))
            }
        }

        let dir = TempDir::new().unwrap();
        let (cipher, _vault) = vault_cipher(dir.path());
        let output = dir.path().join("001.png");
        let mut source = Truncated { chunks_left: 3 };
        let err = cipher
            .encrypt_stream_to_file("001.png", &mut source, &output)
            .await
            .unwrap_err();
        assert_eq!(source.chunks_left, 0);
        assert!(matches!(err, CipherError::Source(_)));
        assert!(!err.is_fatal());
        assert!(!output.exists());
    }

    #[tokio::test]
    async fn test_upgrade_interrupted_after_swap_stays_readable() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let writer = DirectCipher::new(Arc::new(NoVault), dir.path().to_path_buf(), true);
        encrypt_page(&writer, &page, b"swapped before the sidecar").await;

        // A directory where the sidecar temp file goes fails the rewrite after the swap
        let blocker = dir.path().join("001.jpg.encmeta.json.tmp");
        std::fs::create_dir(&blocker).unwrap();

        let (reader, _vault) = vault_cipher(dir.path());
        let plain = reader.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(plain, b"swapped before the sidecar");
        assert!(meta_staged_path(&page).exists());
        let record: SidecarRecord = crate::utils::try_read_json(&meta_path(&page)).await.unwrap();
        assert_eq!(record.kdf.as_deref(), Some("random"));

        std::fs::remove_dir(&blocker).unwrap();
        let plain = reader.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(plain, b"swapped before the sidecar");
        assert!(!meta_staged_path(&page).exists());
        for sidecar in [meta_path(&page), meta_backup_path(&page)] {
            let record: SidecarRecord = crate::utils::try_read_json(&sidecar).await.unwrap();
            assert_eq!(record.kdf.as_deref(), Some("vault"));
        }
    }

    #[tokio::test]
    async fn test_stale_staged_record_is_dropped_by_upgrade() {
        let dir = TempDir::new().unwrap();
        let page = dir.path().join("001.jpg");
        let writer = DirectCipher::new(Arc::new(NoVault), dir.path().to_path_buf(), true);
        encrypt_page(&writer, &page, b"original").await;

        // Left behind by a crash before the swap: it does not match the file
        let stale = SidecarRecord::new(&[1; NONCE_LEN], &[2; TAG_LEN], &KeyMode::Vault);
        sidecar::stage_meta(&page, &stale).await.unwrap();

        let (reader, _vault) = vault_cipher(dir.path());
        let plain = reader.decrypt_to_vec("001.jpg", &page).await.unwrap();
        assert_eq!(plain, b"original");
        assert!(!meta_staged_path(&page).exists());
    }
}
