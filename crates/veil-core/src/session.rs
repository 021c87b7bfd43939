//! One encrypted chat session between exactly two peers.
//!
//! A [`Session`] owns the connected stream, the shared key, and the running
//! flag. [`Session::run`] drives two concurrent activities:
//!
//! - the **foreground input loop**, selecting over operator lines, Ctrl-C,
//!   and the background task's completion; it encrypts and sends
//! - the **background receive loop**, a single task that reads with a short
//!   timeout so it can observe the running flag without blocking forever
//!
//! The two activities share the flag and the two halves of the duplex
//! stream; the halves carry independent directions, so no lock is needed.
//! Shutdown is cooperative: whoever ends the session swaps the flag to
//! false, and the other side notices within one read-timeout interval.
//!
//! Cleanup runs on every exit path: flag swapped, stream shut down, key
//! wiped. The session never exits the process; it returns a [`CloseReason`]
//! and the caller decides.

use std::fmt;
use std::io;
use std::net::SocketAddr;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::tcp::OwnedReadHalf;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::{debug, info, warn};

use veil_common::protocol::{CLEAR_COMMAND, QUIT_COMMANDS, READ_TIMEOUT, RECV_BUFFER_SIZE};
use veil_crypto::cipher::CIPHERTEXT_OVERHEAD;
use veil_crypto::{ChatCipher, SessionKey};

use crate::error::{Error, Result};

/// Largest line the input loop will send. Anything bigger would not fit the
/// peer's single-read framing once the cipher overhead is added.
pub const MAX_MESSAGE_BYTES: usize = RECV_BUFFER_SIZE - CIPHERTEXT_OVERHEAD;

/// How long cleanup waits for the receive task to observe the flag before
/// aborting it (two read-timeout intervals).
const SHUTDOWN_GRACE: Duration = Duration::from_secs(2);

/// Session lifecycle. `Closed` is terminal.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SessionState {
    Idle,
    Active,
    Closing,
    Closed,
}

/// Why the session ended.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CloseReason {
    /// The local operator issued a quit command.
    LocalQuit,
    /// Ctrl-C in the foreground loop.
    Interrupted,
    /// The operator input channel closed (stdin EOF).
    InputClosed,
    /// The peer closed the connection (zero-length read).
    PeerDisconnected,
    /// The peer's connection was reset.
    PeerReset,
    /// Send failure or any other unrecoverable transport error.
    TransportError(String),
}

impl fmt::Display for CloseReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::LocalQuit => write!(f, "quit"),
            Self::Interrupted => write!(f, "interrupted"),
            Self::InputClosed => write!(f, "input closed"),
            Self::PeerDisconnected => write!(f, "peer disconnected"),
            Self::PeerReset => write!(f, "peer connection reset"),
            Self::TransportError(cause) => write!(f, "transport error: {cause}"),
        }
    }
}

/// Chat-visible output of a running session.
///
/// The session reports through this channel instead of printing, so the
/// front end owns the terminal and tests can observe the loop.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SessionEvent {
    /// A peer message was decrypted and decoded.
    MessageReceived { from: SocketAddr, text: String },
    /// Local echo for a message that was sent.
    MessageSent { from: SocketAddr, text: String },
    /// The operator asked for the display to be cleared.
    ClearScreen,
    /// A single message was discarded; the session continues.
    MessageDropped { reason: String },
    /// The peer closed the connection.
    PeerDisconnected { peer: SocketAddr },
    /// The peer's connection was reset mid-session.
    PeerReset { peer: SocketAddr },
    /// Cleanup finished; the key has been wiped.
    Closed,
}

/// What the foreground loop does with one operator line.
#[derive(Debug, PartialEq, Eq)]
enum LineAction {
    Skip,
    Quit,
    Clear,
    Send,
}

fn classify_line(line: &str) -> LineAction {
    let trimmed = line.trim();
    if trimmed.is_empty() {
        return LineAction::Skip;
    }
    let lowered = trimmed.to_ascii_lowercase();
    if QUIT_COMMANDS.contains(&lowered.as_str()) {
        LineAction::Quit
    } else if lowered == CLEAR_COMMAND {
        LineAction::Clear
    } else {
        LineAction::Send
    }
}

fn transition(state: &mut SessionState, next: SessionState) {
    debug!("session state: {:?} -> {:?}", *state, next);
    *state = next;
}

/// One active encrypted chat. At most one per process.
pub struct Session {
    stream: TcpStream,
    key: SessionKey,
    running: Arc<AtomicBool>,
    peer_addr: SocketAddr,
    local_addr: SocketAddr,
    state: SessionState,
}

impl Session {
    /// Wrap a connected stream and an exchanged key.
    pub fn new(stream: TcpStream, key: SessionKey) -> Result<Self> {
        let peer_addr = stream.peer_addr()?;
        let local_addr = stream.local_addr()?;
        Ok(Self {
            stream,
            key,
            running: Arc::new(AtomicBool::new(true)),
            peer_addr,
            local_addr,
            state: SessionState::Idle,
        })
    }

    pub fn peer_addr(&self) -> SocketAddr {
        self.peer_addr
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// The shared session key. Wiped by `run` during cleanup.
    pub fn key(&self) -> &SessionKey {
        &self.key
    }

    pub fn state(&self) -> SessionState {
        self.state
    }

    /// Handle to the running flag, for observers. The flag transitions from
    /// true to false at most once per session.
    pub fn running_flag(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.running)
    }

    /// Drive the chat loop until one side ends the session.
    ///
    /// `input` carries operator lines; `events` carries everything the
    /// front end should show. Returns why the session closed. Cleanup
    /// (flag swap, socket shutdown, key wipe) runs on every exit path.
    pub async fn run(
        self,
        mut input: mpsc::Receiver<String>,
        events: mpsc::Sender<SessionEvent>,
    ) -> Result<CloseReason> {
        let Session {
            stream,
            mut key,
            running,
            peer_addr,
            local_addr,
            mut state,
        } = self;

        let cipher = match ChatCipher::new(&key) {
            Ok(cipher) => cipher,
            Err(e) => {
                key.wipe();
                return Err(Error::Cipher(e));
            }
        };

        transition(&mut state, SessionState::Active);
        info!("chat started: {local_addr} <-> {peer_addr}");

        let (read_half, mut write_half) = stream.into_split();

        let mut recv_task = tokio::spawn(receive_loop(
            read_half,
            cipher.clone(),
            Arc::clone(&running),
            events.clone(),
            peer_addr,
        ));
        let mut recv_done = false;

        let reason = loop {
            tokio::select! {
                joined = &mut recv_task => {
                    recv_done = true;
                    break match joined {
                        Ok(Some(reason)) => reason,
                        Ok(None) => CloseReason::LocalQuit,
                        Err(e) => CloseReason::TransportError(format!("receive task failed: {e}")),
                    };
                }
                maybe_line = input.recv() => {
                    let Some(line) = maybe_line else {
                        break CloseReason::InputClosed;
                    };
                    match classify_line(&line) {
                        LineAction::Skip => continue,
                        LineAction::Quit => break CloseReason::LocalQuit,
                        LineAction::Clear => {
                            let _ = events.send(SessionEvent::ClearScreen).await;
                            continue;
                        }
                        LineAction::Send => {}
                    }

                    if line.len() > MAX_MESSAGE_BYTES {
                        let _ = events
                            .send(SessionEvent::MessageDropped {
                                reason: format!(
                                    "message exceeds {MAX_MESSAGE_BYTES} bytes, not sent"
                                ),
                            })
                            .await;
                        continue;
                    }

                    let blob = match cipher.encrypt(line.as_bytes()) {
                        Ok(blob) => blob,
                        Err(e) => break CloseReason::TransportError(format!("encryption failed: {e}")),
                    };
                    // One whole blob per write; the peer consumes it in one read.
                    if let Err(e) = write_half.write_all(&blob).await {
                        break CloseReason::TransportError(format!("send failed: {e}"));
                    }
                    let _ = events
                        .send(SessionEvent::MessageSent { from: local_addr, text: line })
                        .await;
                }
                _ = tokio::signal::ctrl_c() => {
                    info!("interrupt received");
                    break CloseReason::Interrupted;
                }
            }
        };

        transition(&mut state, SessionState::Closing);
        if running.swap(false, Ordering::SeqCst) {
            debug!("shutdown initiated locally");
        }

        if !recv_done {
            // The receive task observes the flag within one read timeout.
            if timeout(SHUTDOWN_GRACE, &mut recv_task).await.is_err() {
                recv_task.abort();
            }
        }

        if let Err(e) = write_half.shutdown().await {
            debug!("socket shutdown: {e}");
        }

        key.wipe();
        transition(&mut state, SessionState::Closed);
        info!("session closed ({reason})");
        let _ = events.send(SessionEvent::Closed).await;

        Ok(reason)
    }
}

/// Background receive loop. Exactly one per session, for its whole life.
///
/// Returns the close reason it observed, or `None` when it stopped because
/// the running flag went false.
async fn receive_loop(
    mut reader: OwnedReadHalf,
    cipher: ChatCipher,
    running: Arc<AtomicBool>,
    events: mpsc::Sender<SessionEvent>,
    peer_addr: SocketAddr,
) -> Option<CloseReason> {
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];

    while running.load(Ordering::SeqCst) {
        let read = match timeout(READ_TIMEOUT, reader.read(&mut buf)).await {
            // Timeout with no data: not an error, re-check the flag.
            Err(_) => continue,
            Ok(read) => read,
        };

        match read {
            Ok(0) => {
                // Zero-length read: the peer closed the connection.
                if running.swap(false, Ordering::SeqCst) {
                    info!("peer {peer_addr} disconnected");
                    let _ = events
                        .send(SessionEvent::PeerDisconnected { peer: peer_addr })
                        .await;
                }
                return Some(CloseReason::PeerDisconnected);
            }
            Ok(n) => {
                let plaintext = match cipher.decrypt(&buf[..n]) {
                    Ok(plaintext) => plaintext,
                    Err(e) => {
                        warn!("dropping message from {peer_addr}: {e}");
                        let _ = events
                            .send(SessionEvent::MessageDropped { reason: e.to_string() })
                            .await;
                        continue;
                    }
                };
                let text = match String::from_utf8(plaintext) {
                    Ok(text) => text,
                    Err(_) => {
                        warn!("dropping message from {peer_addr}: invalid UTF-8");
                        let _ = events
                            .send(SessionEvent::MessageDropped {
                                reason: "invalid UTF-8 payload".into(),
                            })
                            .await;
                        continue;
                    }
                };
                let _ = events
                    .send(SessionEvent::MessageReceived { from: peer_addr, text })
                    .await;
            }
            Err(e) if e.kind() == io::ErrorKind::ConnectionReset => {
                if running.swap(false, Ordering::SeqCst) {
                    warn!("peer {peer_addr} unexpectedly disconnected");
                    let _ = events.send(SessionEvent::PeerReset { peer: peer_addr }).await;
                }
                return Some(CloseReason::PeerReset);
            }
            Err(e) => {
                if running.swap(false, Ordering::SeqCst) {
                    warn!("receive error from {peer_addr}: {e}");
                }
                return Some(CloseReason::TransportError(e.to_string()));
            }
        }
    }

    None
}
