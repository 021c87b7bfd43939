//! Listener role bootstrap.
//!
//! The listener binds all interfaces, waits for exactly one peer, generates
//! the session key, and sends its raw bytes as the very first payload on the
//! new connection (trust-on-first-use). Port forwarding is requested from
//! the gateway beforehand and released afterwards, both best-effort.

use std::net::SocketAddr;

use socket2::{Domain, Protocol, Socket, Type};
use tokio::io::AsyncWriteExt;
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tracing::{debug, info};

use veil_crypto::SessionKey;

use crate::error::{Error, Result};
use crate::nat;
use crate::session::{CloseReason, Session, SessionEvent};

/// A bound, listening chat socket waiting for its single peer.
pub struct ChatListener {
    inner: TcpListener,
    local_addr: SocketAddr,
}

impl ChatListener {
    /// Bind a reusable-address socket on all interfaces.
    ///
    /// Pass port 0 to let the OS pick one; [`local_addr`](Self::local_addr)
    /// reports the result.
    pub fn bind(port: u16) -> Result<Self> {
        let addr = SocketAddr::from(([0, 0, 0, 0], port));
        let bind_err = |source| Error::Bind { port, source };

        let socket = Socket::new(Domain::IPV4, Type::STREAM, Some(Protocol::TCP)).map_err(bind_err)?;
        socket.set_reuse_address(true).map_err(bind_err)?;
        socket.bind(&addr.into()).map_err(bind_err)?;
        // Exactly one peer: a backlog of one pending connection.
        socket.listen(1).map_err(bind_err)?;
        socket.set_nonblocking(true).map_err(bind_err)?;

        let inner = TcpListener::from_std(socket.into()).map_err(bind_err)?;
        let local_addr = inner.local_addr().map_err(bind_err)?;
        info!("listening on {local_addr}, waiting for a peer");

        Ok(Self { inner, local_addr })
    }

    pub fn local_addr(&self) -> SocketAddr {
        self.local_addr
    }

    /// Block until one peer connects, then hand it the freshly generated
    /// session key and build the [`Session`].
    ///
    /// Consumes the listener: the listening socket closes as soon as the
    /// single connection exists.
    pub async fn accept(self) -> Result<Session> {
        let (mut stream, peer_addr) = self.inner.accept().await.map_err(Error::Accept)?;
        info!("peer connected from {peer_addr}");

        let key = SessionKey::generate();
        // The key rides unencrypted as the first payload: whoever connected
        // is trusted with it.
        stream
            .write_all(key.as_bytes())
            .await
            .map_err(|e| Error::KeyExchange(format!("failed to send session key: {e}")))?;
        debug!("session key sent to peer");

        Session::new(stream, key)
    }
}

/// Full listener flow: best-effort port forwarding, accept one peer,
/// exchange the key, run the chat loop, release the mapping.
///
/// The mapping release runs whether the session ended cleanly or not.
pub async fn run_listener(
    port: u16,
    use_upnp: bool,
    input: mpsc::Receiver<String>,
    events: mpsc::Sender<SessionEvent>,
) -> Result<CloseReason> {
    let mapper = if use_upnp {
        nat::setup_port_forwarding(port).await
    } else {
        None
    };

    let outcome = async move {
        let listener = ChatListener::bind(port)?;
        info!("share your address and port {port} with your peer");
        let session = listener.accept().await?;
        session.run(input, events).await
    }
    .await;

    if use_upnp {
        nat::teardown_port_forwarding(mapper, port).await;
    }

    outcome
}
