//! Streaming cipher layer
//!
//! Pages are encrypted with AES-256-GCM while they stream in from the network.
//! The nonce and tag are not stored in the ciphertext file; they live in a JSON
//! sidecar next to it (`<file>.encmeta.json`) plus a backup copy
//! (`<file>.encmeta.json.bak`).
//!
//! Two key modes exist:
//! - **vault**: the key is derived by the [`Vault`](crate::vault::Vault) for the
//!   file's path relative to the library root, and that path is bound in as
//!   associated data.
//! - **random**: used when no vault has been set up yet; a one-time key is
//!   generated and stored in the sidecar. Such files are upgraded to vault mode
//!   the first time they are read with an unlocked vault.

use serde::{Deserialize, Serialize};
use utoipa::ToSchema;
use zeroize::Zeroizing;

pub mod direct;
pub mod gcm;
pub mod sidecar;

pub use direct::{DirectCipher, EncryptOutcome, KeystreamReader};
pub use gcm::GcmStream;
pub use sidecar::{
    ResolvedMeta, SidecarRecord, TempEncryptionInfo, meta_backup_path, meta_path,
    meta_staged_path, read_temp_encryption_info,
};

// ============ Format constants ============

/// AES-GCM nonce length in bytes
pub const NONCE_LEN: usize = 12;
/// AES-GCM tag length in bytes
pub const TAG_LEN: usize = 16;
/// AES-256 key length in bytes
pub const KEY_LEN: usize = 32;
/// Current sidecar schema version
pub const META_VERSION: i64 = 2;
/// Algorithm name recorded in sidecars
pub const ALGORITHM: &str = "aes-256-gcm";
/// Suffix of the primary sidecar
pub const META_SUFFIX: &str = ".encmeta.json";
/// Suffix of the backup sidecar
pub const META_BACKUP_SUFFIX: &str = ".encmeta.json.bak";
/// Suffix of a sidecar staged for a ciphertext that is being replaced
pub const META_STAGED_SUFFIX: &str = ".encmeta.json.next";

/// Read/write granularity for streaming encryption
pub(crate) const CHUNK_SIZE: usize = 64 * 1024;

/// How the data key of a ciphertext was obtained
#[derive(Clone)]
pub enum KeyMode {
    /// Key derived by the vault for the file's relative path
    Vault,
    /// One-time key, persisted in the sidecar
    Random {
        /// The 32-byte data key
        key: Zeroizing<[u8; KEY_LEN]>,
    },
}

impl KeyMode {
    /// Key kind without the key material
    pub fn kind(&self) -> KeyKind {
        match self {
            KeyMode::Vault => KeyKind::Vault,
            KeyMode::Random { .. } => KeyKind::Random,
        }
    }
}

impl std::fmt::Debug for KeyMode {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            KeyMode::Vault => f.write_str("Vault"),
            KeyMode::Random { .. } => f.write_str("Random { key: <redacted> }"),
        }
    }
}

/// Key mode name as recorded in sidecars and on jobs
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize, ToSchema)]
#[serde(rename_all = "lowercase")]
pub enum KeyKind {
    /// `"vault"`
    Vault,
    /// `"random"`
    Random,
}

impl KeyKind {
    /// Name stored in the sidecar `kdf` field
    pub fn as_str(&self) -> &'static str {
        match self {
            KeyKind::Vault => "vault",
            KeyKind::Random => "random",
        }
    }

    /// Parse a stored name; anything unknown is `None`
    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "vault" => Some(KeyKind::Vault),
            "random" => Some(KeyKind::Random),
            _ => None,
        }
    }
}

impl std::fmt::Display for KeyKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Normalize a relative path for key derivation and associated data
pub fn normalize_rel_path(rel_path: &str) -> String {
    rel_path.replace('\\', "/")
}

#[allow(clippy::unwrap_used, clippy::expect_used)]
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_key_mode_debug_hides_key() {
        let mode = KeyMode::Random {
            key: Zeroizing::new([0xAB; KEY_LEN]),
        };
        let printed = format!("{mode:?}");
        assert!(printed.contains("redacted"));
        assert!(!printed.contains("171"));
        assert_eq!(mode.kind(), KeyKind::Random);
    }

    #[test]
    fn test_normalize_rel_path() {
        assert_eq!(normalize_rel_path(r"comic_1\001.jpg"), "comic_1/001.jpg");
        assert_eq!(normalize_rel_path("tmp_1/002.png"), "tmp_1/002.png");
    }

    #[test]
    fn test_key_kind_names() {
        assert_eq!(KeyKind::parse("vault"), Some(KeyKind::Vault));
        assert_eq!(KeyKind::parse("random"), Some(KeyKind::Random));
        assert_eq!(KeyKind::parse("pbkdf2"), None);
        assert_eq!(serde_json::to_string(&KeyKind::Random).unwrap(), "\"random\"");
    }
}
