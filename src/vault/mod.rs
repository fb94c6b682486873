//! Vault collaborator
//!
//! The vault owns the master key. The pipeline only needs to ask it for a per-path
//! data key and to encrypt or decrypt whole files in its own format; unlocking
//! and passphrase handling live with the application.

use async_trait::async_trait;
use std::path::Path;
use tokio::io::AsyncRead;
use zeroize::Zeroizing;

use crate::crypto::KEY_LEN;
use crate::error::CipherError;

mod master_key;

pub use master_key::{MasterKeyVault, VAULT_HEADER_LEN, VAULT_MAGIC, VAULT_VERSION};

/// Interface to the content store's key holder
///
/// Relative paths use `/` separators and are relative to the library root.
#[async_trait]
pub trait Vault: Send + Sync {
    /// Whether a vault has been set up at all
    fn is_initialized(&self) -> bool;

    /// Whether the master key is currently loaded
    fn is_unlocked(&self) -> bool;

    /// Data key for a relative path
    fn derive_key(&self, rel_path: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError>;

    /// Encrypt a whole buffer into the vault file format
    fn encrypt_buffer(&self, rel_path: &str, plaintext: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Decrypt a whole vault-format buffer
    fn decrypt_buffer(&self, rel_path: &str, data: &[u8]) -> Result<Vec<u8>, CipherError>;

    /// Whether the first bytes of a file carry this vault's header
    fn has_vault_header(&self, prefix: &[u8]) -> bool;

    /// Stream `reader` into a vault-format file at `output`
    ///
    /// Returns the plaintext byte count. The partial output is removed on failure.
    async fn encrypt_stream_to_path(
        &self,
        rel_path: &str,
        reader: &mut (dyn AsyncRead + Unpin + Send),
        output: &Path,
    ) -> Result<u64, CipherError>;

    /// Read and decrypt a vault-format file
    async fn decrypt_file(&self, rel_path: &str, path: &Path) -> Result<Vec<u8>, CipherError>;

    /// Check a vault-format file's tag without producing plaintext
    ///
    /// A file whose header is intact but whose body was torn fails with
    /// [`CipherError::AuthFailed`].
    async fn verify_file(&self, rel_path: &str, path: &Path) -> Result<(), CipherError>;
}

/// Backend for installations that have not set up a vault
///
/// Pages can still be fetched (random-key mode), but nothing can be finalized.
#[derive(Clone, Copy, Debug, Default)]
pub struct NoVault;

#[async_trait]
impl Vault for NoVault {
    fn is_initialized(&self) -> bool {
        false
    }

    fn is_unlocked(&self) -> bool {
        false
    }

    fn derive_key(&self, _rel_path: &str) -> Result<Zeroizing<[u8; KEY_LEN]>, CipherError> {
        Err(CipherError::VaultUninitialized)
    }

    fn encrypt_buffer(&self, _rel_path: &str, _plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::VaultUninitialized)
    }

    fn decrypt_buffer(&self, _rel_path: &str, _data: &[u8]) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::VaultUninitialized)
    }

    fn has_vault_header(&self, _prefix: &[u8]) -> bool {
        false
    }

    async fn encrypt_stream_to_path(
        &self,
        _rel_path: &str,
        _reader: &mut (dyn AsyncRead + Unpin + Send),
        _output: &Path,
    ) -> Result<u64, CipherError> {
        Err(CipherError::VaultUninitialized)
    }

    async fn decrypt_file(&self, _rel_path: &str, _path: &Path) -> Result<Vec<u8>, CipherError> {
        Err(CipherError::VaultUninitialized)
    }

    async fn verify_file(&self, _rel_path: &str, _path: &Path) -> Result<(), CipherError> {
        Err(CipherError::VaultUninitialized)
    }
}
