//! Session key material.
//!
//! A [`SessionKey`] is the single shared secret of one chat session. The
//! listener generates it, the dialer reconstructs it from the first inbound
//! payload, and both sides wipe it at session end. The type is deliberately
//! not `Clone`: there is exactly one key per session per process.

use std::fmt;

use rand::rngs::OsRng;
use rand::RngCore;
use zeroize::Zeroize;

use crate::cipher::CipherError;

/// Session key length in bytes (ChaCha20-Poly1305).
pub const KEY_LEN: usize = 32;

/// Symmetric key for one chat session.
///
/// The buffer is overwritten with zero bytes on [`wipe`](SessionKey::wipe)
/// and again on drop. A wiped key keeps its length but is refused by the
/// cipher, so stale key material can never encrypt new traffic.
pub struct SessionKey {
    bytes: Vec<u8>,
    wiped: bool,
}

impl SessionKey {
    /// Generate a fresh random key from the OS CSPRNG.
    pub fn generate() -> Self {
        let mut bytes = vec![0u8; KEY_LEN];
        OsRng.fill_bytes(&mut bytes);
        Self {
            bytes,
            wiped: false,
        }
    }

    /// Build a key from raw bytes received over the wire.
    ///
    /// The dialer trusts the first inbound payload verbatim as the session
    /// key; anything that is not exactly [`KEY_LEN`] bytes is rejected.
    pub fn from_bytes(raw: &[u8]) -> Result<Self, CipherError> {
        if raw.len() != KEY_LEN {
            return Err(CipherError::InvalidKeyLength(raw.len()));
        }
        Ok(Self {
            bytes: raw.to_vec(),
            wiped: false,
        })
    }

    /// Raw key bytes, as sent on the wire by the listener.
    pub fn as_bytes(&self) -> &[u8] {
        &self.bytes
    }

    /// Key length in bytes. Unchanged by wiping.
    pub fn len(&self) -> usize {
        self.bytes.len()
    }

    pub fn is_empty(&self) -> bool {
        self.bytes.is_empty()
    }

    /// Overwrite the key buffer with zero bytes, preserving its length, and
    /// mark the key unusable.
    pub fn wipe(&mut self) {
        self.bytes.as_mut_slice().zeroize();
        self.wiped = true;
    }

    /// Whether [`wipe`](SessionKey::wipe) has been called.
    pub fn is_wiped(&self) -> bool {
        self.wiped
    }
}

impl Drop for SessionKey {
    fn drop(&mut self) {
        self.bytes.as_mut_slice().zeroize();
    }
}

impl fmt::Debug for SessionKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        // Never log key material.
        write!(
            f,
            "SessionKey({} bytes{})",
            self.bytes.len(),
            if self.wiped { ", wiped" } else { "" }
        )
    }
}
