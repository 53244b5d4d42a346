//! The per-connection state machine.
//!
//! Each connection runs as a single task, which totally orders its socket
//! operations. A connection moves through connect → write → read-size →
//! read-data → dispatch, with a deadline per state: connects get
//! [`DEFAULT_INITIAL_TIMEOUT`], writes get a size-scaled deadline, reads are
//! bounded by the earlier of the whole-response deadline and a per-slice
//! stall allowance, and dispatch has no deadline at all. Dispatch hands the
//! payload out through the transport's event channel and parks on the reply.

use std::net::SocketAddr;
use std::time::Duration;

use bytes::Bytes;
use tokio::io::{AsyncReadExt, AsyncWriteExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, oneshot};
use tokio::time::{timeout, timeout_at, Instant};
use tokio_util::sync::CancellationToken;
use tracing::{debug, debug_span, Instrument};

use crate::codec::HEADER_LEN;
use crate::transport::{IncomingMessage, OutgoingResponse, TransportEvent};
use crate::{
    write_deadline, TransportError, DEFAULT_INITIAL_TIMEOUT, IMMEDIATE_TIMEOUT, MAX_CHUNK_SIZE,
    MAX_MESSAGE_SIZE, STALL_TIMEOUT,
};

/// Serves an accepted connection until it closes or the transport shuts
/// down. Errors are reported through the event channel.
pub(crate) async fn run_inbound(
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let span = debug_span!("conn", %peer, dir = "in");
    async {
        let mut io = Io {
            stream,
            peer,
            events: events.clone(),
        };
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            res = io.serve(DEFAULT_INITIAL_TIMEOUT) => res,
        };
        report(result, peer, &events).await;
    }
    .instrument(span)
    .await
}

/// Connects to `peer`, sends `data`, and (unless the caller asked for an
/// immediate close) serves the response exchange until it finishes.
pub(crate) async fn run_outbound(
    peer: SocketAddr,
    data: Bytes,
    response_timeout: Duration,
    events: mpsc::Sender<TransportEvent>,
    cancel: CancellationToken,
) {
    let span = debug_span!("conn", %peer, dir = "out");
    async {
        let result = tokio::select! {
            _ = cancel.cancelled() => Ok(()),
            res = send_and_serve(peer, data, response_timeout, &events) => res,
        };
        report(result, peer, &events).await;
    }
    .instrument(span)
    .await
}

async fn report(
    result: Result<(), TransportError>,
    peer: SocketAddr,
    events: &mpsc::Sender<TransportEvent>,
) {
    if let Err(error) = result {
        debug!("connection closed: {error}");
        let _ = events
            .send(TransportEvent::Error {
                error,
                peer: Some(peer),
            })
            .await;
    }
}

async fn send_and_serve(
    peer: SocketAddr,
    data: Bytes,
    response_timeout: Duration,
    events: &mpsc::Sender<TransportEvent>,
) -> Result<(), TransportError> {
    let stream = match timeout(DEFAULT_INITIAL_TIMEOUT, TcpStream::connect(peer)).await {
        Err(_) => return Err(TransportError::SendTimeout),
        Ok(Err(err)) => {
            debug!("connect failed: {err}");
            return Err(TransportError::SendFailure);
        }
        Ok(Ok(stream)) => stream,
    };
    let mut io = Io {
        stream,
        peer,
        events: events.clone(),
    };
    io.write_message(&data).await?;
    if response_timeout == IMMEDIATE_TIMEOUT {
        return Ok(());
    }
    io.serve(response_timeout).await
}

struct Io {
    stream: TcpStream,
    peer: SocketAddr,
    events: mpsc::Sender<TransportEvent>,
}

impl Io {
    /// The receive loop: read a frame, dispatch it, write the application's
    /// response, and keep going while responses keep asking for more.
    async fn serve(&mut self, first_timeout: Duration) -> Result<(), TransportError> {
        let mut response_timeout = first_timeout;
        loop {
            let payload = self.read_message(response_timeout).await?;
            let Some(response) = self.dispatch(payload).await else {
                // The application declined to respond.
                return Ok(());
            };
            if response.payload.is_empty() || response.payload.len() > MAX_MESSAGE_SIZE {
                debug!(len = response.payload.len(), "invalid response size, closing");
                return Ok(());
            }
            self.write_message(&response.payload).await?;
            if response.response_timeout == IMMEDIATE_TIMEOUT {
                return Ok(());
            }
            response_timeout = response.response_timeout;
        }
    }

    /// Reads one frame. The whole response must land within
    /// `response_timeout`; additionally each slice must make progress within
    /// the stall allowance.
    async fn read_message(&mut self, response_timeout: Duration) -> Result<Bytes, TransportError> {
        let response_deadline = Instant::now() + response_timeout;

        let mut size_buf = [0u8; HEADER_LEN];
        self.read_slice(&mut size_buf, response_deadline).await?;
        let size = u32::from_be_bytes(size_buf) as usize;
        if size > MAX_MESSAGE_SIZE {
            debug!(size, "peer declared an oversized message");
            return Err(TransportError::MessageSizeTooLarge);
        }

        let mut buf = vec![0u8; size];
        let mut received = 0;
        while received < size {
            let take = (size - received).min(MAX_CHUNK_SIZE);
            self.read_slice(&mut buf[received..received + take], response_deadline)
                .await?;
            received += take;
        }
        Ok(buf.into())
    }

    async fn read_slice(
        &mut self,
        buf: &mut [u8],
        response_deadline: Instant,
    ) -> Result<(), TransportError> {
        let deadline = response_deadline.min(Instant::now() + STALL_TIMEOUT);
        match timeout_at(deadline, self.stream.read_exact(buf)).await {
            Err(_) => Err(TransportError::ReceiveTimeout),
            Ok(Err(err)) => {
                debug!("read failed: {err}");
                Err(TransportError::ReceiveFailure)
            }
            Ok(Ok(_)) => Ok(()),
        }
    }

    async fn write_message(&mut self, payload: &[u8]) -> Result<(), TransportError> {
        let write = async {
            self.stream.write_u32(payload.len() as u32).await?;
            self.stream.write_all(payload).await?;
            self.stream.flush().await
        };
        match timeout(write_deadline(payload.len()), write).await {
            Err(_) => Err(TransportError::SendTimeout),
            Ok(Err(err)) => {
                debug!("write failed: {err}");
                Err(TransportError::SendFailure)
            }
            Ok(Ok(())) => Ok(()),
        }
    }

    /// Hands the payload to the application, outside this connection's
    /// ordering, and parks on the reply with the deadline disabled.
    ///
    /// `None` means the application dropped the reply channel (or the
    /// transport is gone); the connection closes without a response.
    async fn dispatch(&mut self, payload: Bytes) -> Option<OutgoingResponse> {
        let (reply, response) = oneshot::channel();
        self.events
            .send(TransportEvent::Message(IncomingMessage {
                payload,
                peer: self.peer,
                reply,
            }))
            .await
            .ok()?;
        response.await.ok()
    }
}
