//! Incremental AES-256-GCM
//!
//! `aes-gcm` only works on whole buffers. Pages arrive as network streams of
//! unknown length, so this module drives the same primitives (AES-CTR with a
//! 32-bit big-endian counter, GHASH) one chunk at a time. The output is
//! byte-for-byte what `Aes256Gcm::encrypt_in_place_detached` produces for the
//! same key, nonce and associated data.

use aes::Aes256;
use aes::cipher::generic_array::GenericArray;
use aes::cipher::{BlockEncrypt, KeyInit, KeyIvInit, StreamCipher};
use ctr::Ctr32BE;
use ghash::GHash;
use ghash::universal_hash::UniversalHash;

use super::{KEY_LEN, NONCE_LEN, TAG_LEN};

const BLOCK_LEN: usize = 16;

/// Streaming GCM state for one message
///
/// Encryption calls [`encrypt`](Self::encrypt) on each chunk in order.
/// Decryption is two passes: [`absorb_ciphertext`](Self::absorb_ciphertext) over
/// the whole file to check the tag, then a fresh instance applies
/// [`apply_keystream`](Self::apply_keystream) to produce plaintext.
pub struct GcmStream {
    ctr: Ctr32BE<Aes256>,
    ghash: GHash,
    tag_mask: [u8; TAG_LEN],
    pending: Vec<u8>,
    aad_len: u64,
    ct_len: u64,
}

impl GcmStream {
    /// Set up the keystream and authenticator; `aad` is absorbed immediately
    pub fn new(key: &[u8; KEY_LEN], nonce: &[u8; NONCE_LEN], aad: &[u8]) -> Self {
        let cipher = Aes256::new(GenericArray::from_slice(key));

        let mut hash_key = GenericArray::default();
        cipher.encrypt_block(&mut hash_key);
        let mut ghash = <GHash as ghash::universal_hash::KeyInit>::new(&hash_key);
        ghash.update_padded(aad);

        // J0 = nonce || 1 masks the tag; payload counters start at nonce || 2
        let mut j0 = [0u8; BLOCK_LEN];
        j0[..NONCE_LEN].copy_from_slice(nonce);
        j0[BLOCK_LEN - 1] = 1;
        let mut mask_block = GenericArray::clone_from_slice(&j0);
        cipher.encrypt_block(&mut mask_block);
        let mut tag_mask = [0u8; TAG_LEN];
        tag_mask.copy_from_slice(&mask_block);

        let mut counter = j0;
        counter[BLOCK_LEN - 1] = 2;
        let ctr = Ctr32BE::<Aes256>::new(
            GenericArray::from_slice(key),
            GenericArray::from_slice(&counter),
        );

        Self {
            ctr,
            ghash,
            tag_mask,
            pending: Vec::with_capacity(BLOCK_LEN),
            aad_len: aad.len() as u64,
            ct_len: 0,
        }
    }

    /// Encrypt `buf` in place and authenticate the resulting ciphertext
    pub fn encrypt(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
        self.absorb_ciphertext(buf);
    }

    /// XOR the keystream into `buf` without touching the authenticator
    pub fn apply_keystream(&mut self, buf: &mut [u8]) {
        self.ctr.apply_keystream(buf);
    }

    /// Feed ciphertext to GHASH, buffering partial blocks across calls
    pub fn absorb_ciphertext(&mut self, mut data: &[u8]) {
        self.ct_len += data.len() as u64;

        if !self.pending.is_empty() {
            let take = (BLOCK_LEN - self.pending.len()).min(data.len());
            self.pending.extend_from_slice(&data[..take]);
            data = &data[take..];
            if self.pending.len() < BLOCK_LEN {
                return;
            }
            self.ghash.update_padded(&self.pending);
            self.pending.clear();
        }

        let full = data.len() - data.len() % BLOCK_LEN;
        if full > 0 {
            self.ghash.update_padded(&data[..full]);
        }
        self.pending.extend_from_slice(&data[full..]);
    }

    /// Finish the authenticator and return the tag
    pub fn finalize(mut self) -> [u8; TAG_LEN] {
        if !self.pending.is_empty() {
            self.ghash.update_padded(&self.pending);
        }

        let mut lengths = [0u8; BLOCK_LEN];
        lengths[..8].copy_from_slice(&(self.aad_len * 8).to_be_bytes());
        lengths[8..].copy_from_slice(&(self.ct_len * 8).to_be_bytes());
        self.ghash.update_padded(&lengths);

        let digest = self.ghash.finalize();
        let mut tag = [0u8; TAG_LEN];
        for (i, byte) in tag.iter_mut().enumerate() {
            *byte = digest[i] ^ self.tag_mask[i];
        }
        tag
    }

    /// Finish and compare against an expected tag in constant time
    pub fn verify(self, expected: &[u8; TAG_LEN]) -> bool {
        let actual = self.finalize();
        actual
            .iter()
            .zip(expected.iter())
            .fold(0u8, |acc, (a, b)| acc | (a ^ b))
            == 0
    }
}
