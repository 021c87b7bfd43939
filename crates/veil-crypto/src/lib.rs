//! Cryptographic primitives for Veil.
//!
//! This crate provides:
//! - Session key generation and wiping
//! - Authenticated per-message encryption (ChaCha20-Poly1305)
//!
//! # Design
//!
//! One symmetric key protects one chat session. The key is generated by the
//! listener, handed to the dialer over the wire, and wiped by both sides when
//! the session ends. Each message is sealed with a fresh random nonce, so the
//! same plaintext never produces the same blob twice, and any tampering or
//! truncation fails authentication rather than yielding garbage plaintext.

#![forbid(unsafe_code)]

pub mod cipher;
pub mod key;

pub use cipher::{ChatCipher, CipherError};
pub use key::{SessionKey, KEY_LEN};
