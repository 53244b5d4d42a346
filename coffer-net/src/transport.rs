//! The transport: one listener, many short-lived connections.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::net::{TcpListener, TcpSocket};
use tokio::sync::{mpsc, oneshot};
use tokio_util::sync::CancellationToken;
use tokio_util::task::TaskTracker;
use tracing::{debug, warn};

use crate::{connection, TransportError, IMMEDIATE_TIMEOUT, MAX_MESSAGE_SIZE};

const EVENT_CHANNEL_CAPACITY: usize = 64;
const LISTEN_BACKLOG: u32 = 1024;

/// A message delivered by the transport, carrying the channel its
/// connection is parked on for the reply.
#[derive(Debug)]
pub struct IncomingMessage {
    pub payload: Bytes,
    pub peer: SocketAddr,
    /// Dropping this sender closes the connection without responding.
    pub reply: oneshot::Sender<OutgoingResponse>,
}

/// The application's answer to an [`IncomingMessage`].
#[derive(Debug)]
pub struct OutgoingResponse {
    pub payload: Bytes,
    /// How long the connection then waits for the peer's next message.
    /// [`IMMEDIATE_TIMEOUT`] closes the connection after the write instead.
    pub response_timeout: Duration,
}

impl OutgoingResponse {
    /// A final response: write it, then close.
    pub fn closing(payload: impl Into<Bytes>) -> Self {
        Self {
            payload: payload.into(),
            response_timeout: IMMEDIATE_TIMEOUT,
        }
    }

    /// A response that keeps the exchange going, waiting up to
    /// `response_timeout` for the peer's next message.
    pub fn expecting_reply(payload: impl Into<Bytes>, response_timeout: Duration) -> Self {
        Self {
            payload: payload.into(),
            response_timeout,
        }
    }
}

/// What a transport surfaces to its owner.
#[derive(Debug)]
pub enum TransportEvent {
    /// A complete frame arrived and its connection awaits the response.
    Message(IncomingMessage),
    /// A connection failed; it has been closed.
    Error {
        error: TransportError,
        peer: Option<SocketAddr>,
    },
}

/// A connection-per-message TCP transport.
///
/// Created together with the receiver its events are delivered on. Incoming
/// and outgoing connections are registered in a shared task tracker;
/// [`TcpTransport::shutdown`] cancels and awaits them all.
#[derive(Debug)]
pub struct TcpTransport {
    events: mpsc::Sender<TransportEvent>,
    connections: TaskTracker,
    cancel: CancellationToken,
    listener: Option<ListenerHandle>,
}

#[derive(Debug)]
struct ListenerHandle {
    port: u16,
    cancel: CancellationToken,
}

impl TcpTransport {
    pub fn new() -> (Self, mpsc::Receiver<TransportEvent>) {
        let (events, events_rx) = mpsc::channel(EVENT_CHANNEL_CAPACITY);
        (
            Self {
                events,
                connections: TaskTracker::new(),
                cancel: CancellationToken::new(),
                listener: None,
            },
            events_rx,
        )
    }

    /// Starts accepting connections on `addr`, returning the bound port.
    pub async fn start_listening(&mut self, addr: SocketAddr) -> Result<u16, TransportError> {
        if self.listener.is_some() {
            return Err(TransportError::AlreadyStarted);
        }
        if addr.port() == 0 {
            return Err(TransportError::InvalidPort);
        }

        let socket = match addr {
            SocketAddr::V4(_) => TcpSocket::new_v4(),
            SocketAddr::V6(_) => TcpSocket::new_v6(),
        }
        .map_err(|err| {
            debug!("could not open socket: {err}");
            TransportError::InvalidAddress
        })?;
        // Reuse-address means something different on Windows (it lets two
        // processes bind the same port), so it is set on POSIX only.
        #[cfg(unix)]
        socket.set_reuseaddr(true).map_err(|err| {
            debug!("could not set reuse-address: {err}");
            TransportError::SetOptionFailure
        })?;
        socket.bind(addr).map_err(|err| {
            debug!(%addr, "could not bind: {err}");
            TransportError::BindError
        })?;
        let listener = socket.listen(LISTEN_BACKLOG).map_err(|err| {
            debug!(%addr, "could not listen: {err}");
            TransportError::ListenError
        })?;
        let port = listener
            .local_addr()
            .map_err(|_| TransportError::ListenError)?
            .port();

        let accept_cancel = self.cancel.child_token();
        self.connections.spawn(accept_loop(
            listener,
            self.events.clone(),
            accept_cancel.clone(),
            self.cancel.clone(),
            self.connections.clone(),
        ));
        self.listener = Some(ListenerHandle {
            port,
            cancel: accept_cancel,
        });
        Ok(port)
    }

    /// Stops accepting new connections. Connections already accepted keep
    /// draining.
    pub fn stop_listening(&mut self) {
        if let Some(listener) = self.listener.take() {
            listener.cancel.cancel();
        }
    }

    /// The port the transport is listening on, if any.
    pub fn listening_port(&self) -> Option<u16> {
        self.listener.as_ref().map(|listener| listener.port)
    }

    /// Opens a connection to `peer` and sends `data`.
    ///
    /// Oversized payloads are refused up front through the error event. With
    /// a `response_timeout` other than [`IMMEDIATE_TIMEOUT`] the connection
    /// then waits for the peer's response, which arrives as a
    /// [`TransportEvent::Message`].
    pub fn send(&self, data: Bytes, peer: SocketAddr, response_timeout: Duration) {
        if data.len() > MAX_MESSAGE_SIZE {
            warn!(len = data.len(), "refusing to send oversized message");
            let events = self.events.clone();
            self.connections.spawn(async move {
                let _ = events
                    .send(TransportEvent::Error {
                        error: TransportError::MessageSizeTooLarge,
                        peer: Some(peer),
                    })
                    .await;
            });
            return;
        }
        self.connections.spawn(connection::run_outbound(
            peer,
            data,
            response_timeout,
            self.events.clone(),
            self.cancel.child_token(),
        ));
    }

    /// Cooperative shutdown: stop listening, cancel every connection, and
    /// wait for their tasks to finish.
    pub async fn shutdown(&mut self) {
        self.stop_listening();
        self.cancel.cancel();
        self.connections.close();
        self.connections.wait().await;
    }
}

async fn accept_loop(
    listener: TcpListener,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
    conn_cancel_root: CancellationToken,
    connections: TaskTracker,
) {
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            accepted = listener.accept() => match accepted {
                Ok((stream, peer)) => {
                    debug!(%peer, "accepted connection");
                    connections.spawn(connection::run_inbound(
                        stream,
                        peer,
                        events.clone(),
                        conn_cancel_root.child_token(),
                    ));
                }
                Err(err) => {
                    // Transient accept failures (per-connection resets and
                    // the like); keep the listener alive.
                    debug!("accept failed: {err}");
                }
            },
        }
    }
}
