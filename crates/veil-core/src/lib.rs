//! Core session protocol for Veil.
//!
//! This crate provides:
//! - The two role bootstraps: listener (bind, accept, send key) and dialer
//!   (connect with timeout, receive key)
//! - The [`Session`]: one encrypted chat between exactly two peers, with a
//!   foreground send loop and a background receive loop
//! - Best-effort NAT traversal via UPnP port mapping
//!
//! # Design
//!
//! The listener generates the session key and sends its raw bytes as the very
//! first payload after accept; whoever connects is trusted with it. All
//! later payloads are authenticated-encryption blobs, one per message, each
//! consumed in a single bounded-size read. The session never terminates the
//! process: it returns a [`CloseReason`] and the binary decides what to do.

#![forbid(unsafe_code)]

pub mod dial;
pub mod error;
pub mod listen;
pub mod nat;
pub mod session;

pub use dial::{connect, run_dialer};
pub use error::{Error, Result};
pub use listen::{run_listener, ChatListener};
pub use session::{CloseReason, Session, SessionEvent, SessionState};
