//! In-process vault backed by a 32-byte master key
//!
//! File format: `NVEN` magic, version byte, 12-byte nonce, 16-byte tag, then the
//! AES-256-GCM ciphertext. The relative path is the associated data, so a file
//! moved to a different path no longer decrypts.

use aes_gcm::aead::{AeadInPlace, KeyInit};
use aes_gcm::{Aes256Gcm, Nonce, Tag};
use async_trait::async_trait;
use hkdf::Hkdf;
use rand::RngCore;
use sha2::Sha256;
use std::io::SeekFrom;
use std::path::{Path, PathBuf};
use std::sync::RwLock;
use tokio::io::{AsyncRead, AsyncReadExt, AsyncSeekExt, AsyncWriteExt};
use zeroize::Zeroizing;

use super::Vault;
use crate::crypto::{CHUNK_SIZE, GcmStream, KEY_LEN, NONCE_LEN, TAG_LEN, normalize_rel_path};
use crate::error::CipherError;

/// Magic bytes at the start of every vault file
pub const VAULT_MAGIC: &[u8; 4] = b"NVEN";
/// Vault file format version
pub const VAULT_VERSION: u8 = 1;
/// Magic + version + nonce + tag
pub const VAULT_HEADER_LEN: usize = VAULT_MAGIC.len() + 1 + NONCE_LEN + TAG_LEN;

const NONCE_OFFSET: usize = VAULT_MAGIC.len() + 1;
const TAG_OFFSET: usize = NONCE_OFFSET + NONCE_LEN;
const HKDF_INFO: &[u8] = b"vault-ingest:file:v1";

/// Vault whose master key is held in memory while unlocked
#[derive(Default)]
pub struct MasterKeyVault {
    master: RwLock<Option<Zeroizing<[u8; KEY_LEN]>>>,
}

impl MasterKeyVault {
    /// An initialized vault with no key loaded
    pub fn locked() -> Self {
        Self::default()
    }

    /// An initialized vault with `master` loaded
    pub fn unlocked(master: [u8; KEY_LEN]) -> Self {
        let vault = Self::default();
        vault.unlock(master);
        vault
    }

    /// Load the master key
    pub fn unlock(&self, master: [u8; KEY_LEN]) {
        let key = Zeroizing::new(master);
        match self.master.write() {
            Ok(mut guard) => *guard = Some(key),
            Err(poisoned) => *poisoned.into_inner() = Some(key),
        }
    }

    /// Drop the master key; the buffer is zeroized
    pub fn lock(&self) {
        match self.master.write() {
            Ok(mut guard) => *guard = None,
            Err(poisoned) => *poisoned.into_inner() = None,
        }
    }

    fn file_key(&self, rel_path: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
        let guard = self.master.read().map_err(|_| CipherError::VaultLocked)?;
        let master = guard.as_ref().ok_or(CipherError::VaultLocked)?;

        let salt = normalize_rel_path(rel_path);
        let hk = Hkdf::<Sha256>::new(Some(salt.as_bytes()), &master[..]);
        let mut okm = Zeroizing::new([0u8; KEY_LEN]);
        hk.expand(HKDF_INFO, &mut okm[..])
            .map_err(|_| CipherError::InvalidFormat("key derivation failed".into()))?;
        Ok(okm)
    }

    fn parse_header<'a>(
        &self,
        rel_path: &str,
        data: &'a [u8],
    ) -> Result<([u8; NONCE_LEN], [u8; TAG_LEN], &'a [u8]), CipherError> {
        if data.len() < VAULT_HEADER_LEN || !self.has_vault_header(data) {
            return Err(CipherError::InvalidFormat(format!(
                "{rel_path} is not a vault file"
            )));
        }
        let mut nonce = [0u8; NONCE_LEN];
        nonce.copy_from_slice(&data[NONCE_OFFSET..TAG_OFFSET]);
        let mut tag = [0u8; TAG_LEN];
        tag.copy_from_slice(&data[TAG_OFFSET..VAULT_HEADER_LEN]);
        Ok((nonce, tag, &data[VAULT_HEADER_LEN..]))
    }
}

fn header(nonce: &[u8; NONCE_LEN], tag: &[u8; TAG_LEN]) -> Vec<u8> {
    let mut out = Vec::with_capacity(VAULT_HEADER_LEN);
    out.extend_from_slice(VAULT_MAGIC);
    out.push(VAULT_VERSION);
    out.extend_from_slice(nonce);
    out.extend_from_slice(tag);
    out
}

fn random_nonce() -> [u8; NONCE_LEN] {
    let mut nonce = [0u8; NONCE_LEN];
    rand::rngs::OsRng.fill_bytes(&mut nonce);
    nonce
}

#[async_trait]
impl Vault for MasterKeyVault {
    fn is_initialized(&self) -> bool {
        true
    }

    fn is_unlocked(&self) -> bool {
        self.master.read().map(|g| g.is_some()).unwrap_or(false)
    }

    fn derive_key(&self, rel_path: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
        self.file_key(rel_path)
    }

    fn encrypt_buffer(&self, rel_path: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let key = self.file_key(rel_path)?;
        let aad = normalize_rel_path(rel_path);
        let nonce = random_nonce();

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| CipherError::InvalidFormat("bad key length".into()))?;
        let mut body = plaintext.to_vec();
        let tag = cipher
            .encrypt_in_place_detached(Nonce::from_slice(&nonce), aad.as_bytes(), &mut body)
            .map_err(|_| CipherError::InvalidFormat("encryption failed".into()))?;

        let mut tag_bytes = [0u8; TAG_LEN];
        tag_bytes.copy_from_slice(&tag);
        let mut out = header(&nonce, &tag_bytes);
        out.extend_from_slice(&body);
        Ok(out)
    }

    fn decrypt_buffer(&self, rel_path: &str, data: &[u8]) -> Result<Vec<u8>, CipherError> {
        let (nonce, tag, body) = self.parse_header(rel_path, data)?;
        let key = self.file_key(rel_path)?;
        let aad = normalize_rel_path(rel_path);

        let cipher = Aes256Gcm::new_from_slice(&key[..])
            .map_err(|_| CipherError::InvalidFormat("bad key length".into()))?;
        let mut plain = body.to_vec();
        cipher
            .decrypt_in_place_detached(
                Nonce::from_slice(&nonce),
                aad.as_bytes(),
                &mut plain,
                Tag::from_slice(&tag),
            )
            .map_err(|_| CipherError::AuthFailed {
                path: rel_path.into(),
            })?;
        Ok(plain)
    }

    fn has_vault_header(&self, prefix: &[u8]) -> bool {
        prefix.len() > VAULT_MAGIC.len()
            && prefix.starts_with(VAULT_MAGIC)
            && prefix[VAULT_MAGIC.len()] == VAULT_VERSION
    }

    async fn encrypt_stream_to_path(
        &self,
        rel_path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        output: &Path,
    ) -> Result<u64, CipherError> {
        let key = self.file_key(rel_path)?;
        let aad = normalize_rel_path(rel_path);
        let nonce = random_nonce();

        let write_err = |e: std::io::Error| CipherError::Write {
            path: output.to_path_buf(),
            reason: e.to_string(),
        };

        let mut tmp_name = output.as_os_str().to_owned();
        tmp_name.push(".tmp");
        let tmp_path = PathBuf::from(tmp_name);

        let result: Result<u64, CipherError> = async {
            let mut file = tokio::fs::File::create(&tmp_path).await.map_err(write_err)?;
            // Tag is patched in once the whole stream has been authenticated
            file.write_all(&header(&nonce, &[0u8; TAG_LEN]))
                .await
                .map_err(write_err)?;

            let mut gcm = GcmStream::new(&key, &nonce, aad.as_bytes());
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

            let tag = gcm.finalize();
            file.seek(SeekFrom::Start(TAG_OFFSET as u64))
                .await
                .map_err(write_err)?;
            file.write_all(&tag).await.map_err(write_err)?;
            file.sync_all().await.map_err(write_err)?;
            drop(file);
            // Only a fully tagged file ever appears under the final name
            tokio::fs::rename(&tmp_path, output)
                .await
                .map_err(write_err)?;
            Ok(total)
        }
        .await;

        if result.is_err() {
            tokio::fs::remove_file(&tmp_path).await.ok();
        }
        result
    }

    async fn decrypt_file(&self, rel_path: &str, path: &Path) -> Result<Vec<u8>, CipherError> {
        let data = tokio::fs::read(path)
            .await
            .map_err(|e| CipherError::InvalidFormat(format!("cannot read {}: {e}", path.display())))?;
        self.decrypt_buffer(rel_path, &data)
    }

    async fn verify_file(&self, rel_path: &str, path: &Path) -> Result<(), CipherError> {
        let read_err = |e: std::io::Error| {
            CipherError::InvalidFormat(format!("cannot read {}: {e}", path.display()))
        };

        let mut file = tokio::fs::File::open(path).await.map_err(read_err)?;
        let mut head = [0u8; VAULT_HEADER_LEN];
        file.read_exact(&mut head).await.map_err(read_err)?;
        let (nonce, tag, _) = self.parse_header(rel_path, &head)?;
        let key = self.file_key(rel_path)?;
        let aad = normalize_rel_path(rel_path);

        let mut check = GcmStream::new(&key, &nonce, aad.as_bytes());
        let mut buf = vec![0u8; CHUNK_SIZE];
        loop {
            let n = file.read(&mut buf).await.map_err(read_err)?;
            if n == 0 {
                break;
            }
            check.absorb_ciphertext(&buf[..n]);
        }
        if check.verify(&tag) {
            Ok(())
        } else {
            Err(CipherError::AuthFailed {
                path: rel_path.into(),
            })
        }
    }
}
