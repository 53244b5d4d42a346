//! Message tagging and frame helpers.
//!
//! A transport payload is a one-byte [`MessageType`] tag followed by the
//! serialized message body. Frames on the wire are the payload preceded by a
//! 4-byte big-endian length.

use std::io;

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use tokio::io::{AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt};

use crate::MAX_MESSAGE_SIZE;

/// Bytes of length prefix on every frame.
pub const HEADER_LEN: usize = 4;

/// The closed set of control messages the supervisor protocol speaks.
#[repr(u8)]
#[derive(Debug, Clone, Copy, PartialEq, Eq, IntoPrimitive, FromPrimitive)]
pub enum MessageType {
    Ping = 1,
    StartVaultRequest = 2,
    StartVaultResponse = 3,
    VaultIdentityRequest = 4,
    VaultIdentityResponse = 5,
    StopVaultRequest = 6,
    VaultShutdownResponse = 7,
    UpdateIntervalRequest = 8,
    UpdateIntervalResponse = 9,
    /// Any tag this implementation does not understand.
    #[num_enum(default)]
    Unknown = 0,
}

/// Prefixes `payload` with its [`MessageType`] tag.
pub fn wrap_message(typ: MessageType, payload: &[u8]) -> Bytes {
    let mut buf = BytesMut::with_capacity(1 + payload.len());
    buf.put_u8(typ.into());
    buf.put_slice(payload);
    buf.freeze()
}

/// Splits a payload into its tag and body.
///
/// Returns `None` for empty payloads and unknown tags; callers drop those
/// silently.
pub fn unwrap_message(message: &[u8]) -> Option<(MessageType, Bytes)> {
    let (&tag, body) = message.split_first()?;
    match MessageType::from(tag) {
        MessageType::Unknown => None,
        typ => Some((typ, Bytes::copy_from_slice(body))),
    }
}

/// Writes one length-prefixed frame.
pub async fn write_frame<W: AsyncWrite + Unpin>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    if payload.len() > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame exceeds maximum message size",
        ));
    }
    writer.write_u32(payload.len() as u32).await?;
    writer.write_all(payload).await?;
    writer.flush().await
}

/// Reads one length-prefixed frame.
///
/// Returns `None` on a clean end of stream before the length prefix. A
/// declared length beyond [`MAX_MESSAGE_SIZE`] is an error; nothing of the
/// oversized payload is read.
pub async fn read_frame<R: AsyncRead + Unpin>(reader: &mut R) -> io::Result<Option<Bytes>> {
    let size = match reader.read_u32().await {
        Ok(size) => size as usize,
        Err(err) if err.kind() == io::ErrorKind::UnexpectedEof => return Ok(None),
        Err(err) => return Err(err),
    };
    if size > MAX_MESSAGE_SIZE {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            "frame declares more than the maximum message size",
        ));
    }
    let mut buf = vec![0u8; size];
    reader.read_exact(&mut buf).await?;
    Ok(Some(buf.into()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn wrap_unwrap_roundtrip() {
        let wrapped = wrap_message(MessageType::Ping, b"payload");
        let (typ, body) = unwrap_message(&wrapped).unwrap();
        assert_eq!(typ, MessageType::Ping);
        assert_eq!(body, Bytes::from_static(b"payload"));
    }

    #[test]
    fn unknown_and_empty_messages_are_dropped() {
        assert!(unwrap_message(&[]).is_none());
        assert!(unwrap_message(&[0, 1, 2]).is_none());
        assert!(unwrap_message(&[0xEE, 1, 2]).is_none());
    }

    #[tokio::test]
    async fn frame_roundtrip() {
        let mut buf = Vec::new();
        write_frame(&mut buf, b"hello frame").await.unwrap();
        assert_eq!(&buf[..HEADER_LEN], &11u32.to_be_bytes()[..]);
        let frame = read_frame(&mut buf.as_slice()).await.unwrap().unwrap();
        assert_eq!(frame, Bytes::from_static(b"hello frame"));
    }

    #[tokio::test]
    async fn oversized_declared_length_is_refused() {
        let mut buf = Vec::new();
        buf.extend_from_slice(&((MAX_MESSAGE_SIZE as u32 + 1).to_be_bytes()));
        buf.extend_from_slice(&[0; 16]);
        let err = read_frame(&mut buf.as_slice()).await.unwrap_err();
        assert_eq!(err.kind(), io::ErrorKind::InvalidData);
    }

    #[tokio::test]
    async fn clean_eof_is_none() {
        let empty: &[u8] = &[];
        assert!(read_frame(&mut &*empty).await.unwrap().is_none());
    }
}
