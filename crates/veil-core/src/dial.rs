//! Dialer role bootstrap.
//!
//! The dialer connects to a known host and port under a bounded timeout,
//! then trusts the first inbound payload verbatim as the session key. A
//! timeout is reported distinctly from a refused or unreachable connection.

use std::time::Duration;

use tokio::io::AsyncReadExt;
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::time::timeout;
use tracing::info;
use zeroize::Zeroize;

use veil_common::protocol::{CONNECT_TIMEOUT, RECV_BUFFER_SIZE};
use veil_crypto::SessionKey;

use crate::error::{Error, Result};
use crate::session::{CloseReason, Session, SessionEvent};

/// Connect to a listening peer and receive the session key.
pub async fn connect(host: &str, port: u16) -> Result<Session> {
    connect_with_timeout(host, port, CONNECT_TIMEOUT).await
}

/// [`connect`] with an explicit connection time limit.
pub async fn connect_with_timeout(host: &str, port: u16, limit: Duration) -> Result<Session> {
    let addr = format!("{host}:{port}");
    info!("connecting to {addr}");

    let mut stream = match timeout(limit, TcpStream::connect(addr.as_str())).await {
        Err(_) => return Err(Error::ConnectTimeout { addr, limit }),
        Ok(Err(source)) => return Err(Error::Connect { addr, source }),
        Ok(Ok(stream)) => stream,
    };

    // The first inbound payload is the raw session key, trusted verbatim.
    let mut buf = vec![0u8; RECV_BUFFER_SIZE];
    let n = stream
        .read(&mut buf)
        .await
        .map_err(|e| Error::KeyExchange(format!("failed to receive session key: {e}")))?;
    if n == 0 {
        return Err(Error::KeyExchange(
            "peer closed the connection before sending a session key".into(),
        ));
    }

    let key = SessionKey::from_bytes(&buf[..n]).map_err(|e| Error::KeyExchange(e.to_string()));
    // Key material passed through the scratch buffer.
    buf.zeroize();
    let key = key?;

    info!("received session key, connected to {addr}");
    Session::new(stream, key)
}

/// Full dialer flow: connect, exchange the key, run the chat loop.
pub async fn run_dialer(
    host: &str,
    port: u16,
    input: mpsc::Receiver<String>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<CloseReason> {
    let session = connect(host, port).await?;
    session.run(input, events).await
}
