//! Rules for signature packets: self-signed identity records.
//!
//! A signature packet stores a [`SignedData`] whose name commits to both the
//! payload and its signature, and whose signature must verify under the key
//! presented at store time. Packets are public to read and immutable once
//! stored; only the self-signing owner can remove one.

use bytes::Bytes;

use crate::chunk::ChunkName;
use crate::error::{ChunkError, Result};
use crate::keys::{parse_public_key, SignedData};
use crate::store::ChunkStore;

use super::GetOutput;

fn packet_digest(packet: &SignedData) -> blake3::Hash {
    let mut hasher = blake3::Hasher::new();
    hasher.update(&packet.data);
    hasher.update(&packet.signature);
    hasher.finalize()
}

/// Names a signature packet by its content: blake3 over data then signature.
pub fn packet_name(packet: &SignedData) -> ChunkName {
    ChunkName::new(
        packet_digest(packet).as_bytes(),
        crate::chunk::ChunkType::SignaturePacket,
    )
}

pub(super) fn get(store: &dyn ChunkStore, name: &ChunkName) -> Result<GetOutput> {
    store
        .get(name)
        .map(GetOutput::Full)
        .ok_or(ChunkError::FailedToFindChunk)
}

pub(super) fn store(
    store: &dyn ChunkStore,
    name: &ChunkName,
    content: &[u8],
    public_key: &[u8],
) -> Result<()> {
    if store.has(name) {
        return Err(ChunkError::KeyNotUnique);
    }
    let packet = SignedData::from_bytes(content).map_err(|_| ChunkError::InvalidSignedData)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !packet.verify(&key) {
        return Err(ChunkError::SignatureVerificationFailure);
    }
    if name.digest() != packet_digest(&packet).as_bytes() {
        tracing::debug!(%name, "store: packet does not hash to name");
        return Err(ChunkError::GeneralError);
    }
    if !store.store(name, Bytes::copy_from_slice(content)) {
        return Err(ChunkError::GeneralError);
    }
    Ok(())
}

pub(super) fn modify() -> Result<Bytes> {
    Err(ChunkError::InvalidModify)
}

pub(super) fn delete(
    store: &dyn ChunkStore,
    name: &ChunkName,
    ownership_proof: Option<&[u8]>,
    public_key: &[u8],
) -> Result<()> {
    let Some(existing) = store.get(name) else {
        return Ok(());
    };
    let packet = SignedData::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !packet.verify(&key) {
        return Err(ChunkError::NotOwner);
    }
    let token = ownership_proof
        .and_then(|proof| SignedData::from_bytes(proof).ok())
        .ok_or(ChunkError::NotOwner)?;
    if !token.verify(&key) {
        return Err(ChunkError::NotOwner);
    }
    if !store.delete(name) {
        return Err(ChunkError::GeneralError);
    }
    Ok(())
}
