//! Length-prefixed TCP transport with bounded, deadline-driven connections.
//!
//! The wire format is a 4-byte big-endian length followed by that many
//! payload bytes. A [`TcpTransport`] multiplexes many short-lived
//! request/response connections over one listener; each connection runs as
//! its own task so all of its socket operations are totally ordered, and
//! application dispatch crosses an event channel out of that task.

use std::time::Duration;

pub mod codec;
mod connection;
pub mod transport;

pub use codec::MessageType;
pub use transport::{IncomingMessage, OutgoingResponse, TcpTransport, TransportEvent};

/// Largest payload a frame may declare or carry.
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;
/// Ceiling on a single read; large messages arrive in slices of this size.
pub const MAX_CHUNK_SIZE: usize = 64 * 1024;
/// Deadline for connecting, and for the first frame of an accepted
/// connection.
pub const DEFAULT_INITIAL_TIMEOUT: Duration = Duration::from_secs(10);
/// Longest tolerated gap between two read completions.
pub const STALL_TIMEOUT: Duration = Duration::from_secs(3);
/// A response timeout of zero: close instead of awaiting another message.
pub const IMMEDIATE_TIMEOUT: Duration = Duration::ZERO;
/// Floor for the write deadline.
pub const MIN_TIMEOUT: Duration = Duration::from_millis(500);
/// Microseconds of write-deadline budget per payload byte.
pub const TIMEOUT_FACTOR: u64 = 10;

/// Deadline for writing a payload of `len` bytes.
pub fn write_deadline(len: usize) -> Duration {
    Duration::from_micros(len as u64 * TIMEOUT_FACTOR).max(MIN_TIMEOUT)
}

/// Why a transport operation failed.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum TransportError {
    #[error("transport is already listening")]
    AlreadyStarted,
    #[error("cannot listen on port 0")]
    InvalidPort,
    #[error("could not open a socket for the address")]
    InvalidAddress,
    #[error("could not set socket options")]
    SetOptionFailure,
    #[error("could not bind to the endpoint")]
    BindError,
    #[error("could not start listening")]
    ListenError,
    #[error("message exceeds the transport size limit")]
    MessageSizeTooLarge,
    #[error("send failed")]
    SendFailure,
    #[error("send timed out")]
    SendTimeout,
    #[error("receive failed")]
    ReceiveFailure,
    #[error("receive timed out")]
    ReceiveTimeout,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn write_deadline_scales_with_size_above_the_floor() {
        assert_eq!(write_deadline(0), MIN_TIMEOUT);
        assert_eq!(write_deadline(1024), MIN_TIMEOUT);
        assert_eq!(
            write_deadline(MAX_MESSAGE_SIZE),
            Duration::from_micros(MAX_MESSAGE_SIZE as u64 * TIMEOUT_FACTOR)
        );
    }
}
