//! Error types for session bootstrap and the chat loop.

use std::io;
use std::time::Duration;

use thiserror::Error;
use veil_crypto::CipherError;

/// Result type alias using the core error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Errors that abort a session attempt or an active session.
///
/// Connection timeout and connection refusal are distinct variants so the
/// operator can tell a dead route from a closed port.
#[derive(Debug, Error)]
pub enum Error {
    #[error("failed to bind 0.0.0.0:{port}: {source}")]
    Bind { port: u16, source: io::Error },

    #[error("failed to accept connection: {0}")]
    Accept(io::Error),

    #[error("connection to {addr} failed: {source}")]
    Connect { addr: String, source: io::Error },

    #[error("connection to {addr} timed out after {limit:?}")]
    ConnectTimeout { addr: String, limit: Duration },

    #[error("key exchange failed: {0}")]
    KeyExchange(String),

    #[error("cipher error: {0}")]
    Cipher(#[from] CipherError),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}
