//! Authenticated per-message encryption.
//!
//! # Wire format
//!
//! ```text
//! [12 bytes: random nonce] [ciphertext + 16-byte auth tag]
//! ```
//!
//! Each message is sealed with a fresh nonce from the OS CSPRNG, so
//! encrypting the same plaintext twice yields different blobs. Decryption of
//! anything truncated, tampered with, or sealed under a different key fails
//! with [`CipherError::Decryption`], a recoverable per-message condition.

use chacha20poly1305::{
    aead::{Aead, KeyInit},
    ChaCha20Poly1305, Nonce,
};
use rand::rngs::OsRng;
use rand::RngCore;
use thiserror::Error;

use crate::key::{SessionKey, KEY_LEN};

/// Nonce size for ChaCha20-Poly1305.
pub const NONCE_LEN: usize = 12;

/// Poly1305 authentication tag size.
pub const TAG_LEN: usize = 16;

/// Bytes added to every plaintext on the wire (nonce + tag).
pub const CIPHERTEXT_OVERHEAD: usize = NONCE_LEN + TAG_LEN;

/// Cipher adapter errors.
#[derive(Debug, Error)]
pub enum CipherError {
    #[error("encryption failed: {0}")]
    Encryption(String),

    #[error("decryption failed: {0}")]
    Decryption(String),

    #[error("invalid key length: expected {KEY_LEN} bytes, got {0}")]
    InvalidKeyLength(usize),

    #[error("key material has been wiped")]
    KeyWiped,
}

/// Per-session message cipher.
///
/// Built once from the shared [`SessionKey`]; clones are handed to the send
/// and receive halves of the chat loop. Construction refuses a wiped key, so
/// key material that has been zeroed can never seal new traffic.
#[derive(Clone)]
pub struct ChatCipher {
    inner: ChaCha20Poly1305,
}

impl ChatCipher {
    pub fn new(key: &SessionKey) -> Result<Self, CipherError> {
        if key.is_wiped() {
            return Err(CipherError::KeyWiped);
        }
        let inner = ChaCha20Poly1305::new_from_slice(key.as_bytes())
            .map_err(|_| CipherError::InvalidKeyLength(key.len()))?;
        Ok(Self { inner })
    }

    /// Seal one message. Returns `nonce || ciphertext+tag`.
    pub fn encrypt(&self, plaintext: &[u8]) -> Result<Vec<u8>, CipherError> {
        let mut nonce_bytes = [0u8; NONCE_LEN];
        OsRng.fill_bytes(&mut nonce_bytes);
        let nonce = Nonce::from(nonce_bytes);

        let ciphertext = self
            .inner
            .encrypt(&nonce, plaintext)
            .map_err(|e| CipherError::Encryption(e.to_string()))?;

        let mut blob = Vec::with_capacity(NONCE_LEN + ciphertext.len());
        blob.extend_from_slice(&nonce_bytes);
        blob.extend_from_slice(&ciphertext);
        Ok(blob)
    }

    /// Open one message blob produced by [`encrypt`](ChatCipher::encrypt).
    pub fn decrypt(&self, blob: &[u8]) -> Result<Vec<u8>, CipherError> {
        if blob.len() < CIPHERTEXT_OVERHEAD {
            return Err(CipherError::Decryption("ciphertext too short".into()));
        }

        let (nonce_bytes, ciphertext) = blob.split_at(NONCE_LEN);
        self.inner
            .decrypt(Nonce::from_slice(nonce_bytes), ciphertext)
            .map_err(|e| CipherError::Decryption(e.to_string()))
    }
}
