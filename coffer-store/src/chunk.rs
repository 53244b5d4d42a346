//! Chunk names and the type tag embedded in them.

use std::fmt;

use bytes::{BufMut, Bytes, BytesMut};
use num_enum::{FromPrimitive, IntoPrimitive};
use serde::{Deserialize, Serialize};

/// Length of the digest part of a self-verifying chunk name.
pub const DIGEST_LENGTH: usize = blake3::OUT_LEN;

/// The policy selector embedded as the last byte of a chunk name.
///
/// The tag never changes after first store; it is part of the name.
#[repr(u8)]
#[derive(
    Debug, Clone, Copy, PartialEq, Eq, Hash, IntoPrimitive, FromPrimitive, Serialize, Deserialize,
)]
pub enum ChunkType {
    /// Immutable, self-verifying content: `blake3(bytes)` must equal the
    /// digest part of the name.
    Default = 0,
    /// Owner-controlled chunk other signers may append to.
    AppendableByAll = 1,
    /// Chunk whose every mutation requires the owner's signature.
    ModifiableByOwner = 2,
    /// Self-signed identity packet.
    SignaturePacket = 3,
    /// User-filesystem chunk, stored like `Default`.
    Ufs = 4,
    /// Any unregistered tag; every operation is refused.
    #[num_enum(default)]
    Unknown = u8::MAX,
}

/// An opaque binary chunk identifier: digest bytes followed by a single
/// [`ChunkType`] tag byte.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ChunkName(Bytes);

impl ChunkName {
    /// Builds a name from an explicit digest and type tag.
    pub fn new(digest: &[u8; DIGEST_LENGTH], typ: ChunkType) -> Self {
        let mut bytes = BytesMut::with_capacity(DIGEST_LENGTH + 1);
        bytes.put_slice(digest);
        bytes.put_u8(typ.into());
        Self(bytes.freeze())
    }

    /// Names `content` by its blake3 digest, tagged with `typ`.
    pub fn for_content(content: &[u8], typ: ChunkType) -> Self {
        Self::new(blake3::hash(content).as_bytes(), typ)
    }

    /// Wraps externally supplied name bytes without interpretation.
    pub fn from_bytes(bytes: impl Into<Bytes>) -> Self {
        Self(bytes.into())
    }

    /// The type tag, read from the last byte of the name.
    pub fn typ(&self) -> ChunkType {
        match self.0.last() {
            Some(tag) => ChunkType::from(*tag),
            None => ChunkType::Unknown,
        }
    }

    /// The digest part of the name: everything except the trailing tag byte.
    pub fn digest(&self) -> &[u8] {
        match self.0.len() {
            0 => &[],
            len => &self.0[..len - 1],
        }
    }

    pub fn as_bytes(&self) -> &[u8] {
        &self.0
    }

    pub fn to_bytes(&self) -> Bytes {
        self.0.clone()
    }
}

impl fmt::Debug for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "ChunkName({}, {:?})",
            coffer_util::base32_substr(&self.0),
            self.typ()
        )
    }
}

impl fmt::Display for ChunkName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", coffer_util::base32_substr(&self.0))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn tag_is_last_byte() {
        let name = ChunkName::for_content(b"hello", ChunkType::AppendableByAll);
        assert_eq!(name.typ(), ChunkType::AppendableByAll);
        assert_eq!(name.digest(), blake3::hash(b"hello").as_bytes());
        assert_eq!(name.as_bytes().len(), DIGEST_LENGTH + 1);
    }

    #[test]
    fn unregistered_tags_map_to_unknown() {
        let name = ChunkName::from_bytes(vec![1, 2, 3, 0x7f]);
        assert_eq!(name.typ(), ChunkType::Unknown);
        let empty = ChunkName::from_bytes(Bytes::new());
        assert_eq!(empty.typ(), ChunkType::Unknown);
        assert!(empty.digest().is_empty());
    }

    #[test]
    fn same_content_different_tags_get_distinct_names() {
        let a = ChunkName::for_content(b"content", ChunkType::Default);
        let b = ChunkName::for_content(b"content", ChunkType::Ufs);
        assert_ne!(a, b);
        assert_eq!(a.digest(), b.digest());
    }
}
