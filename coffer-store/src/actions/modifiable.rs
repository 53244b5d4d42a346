//! Rules for modifiable-by-owner chunks.
//!
//! The content is a single [`SignedData`] record; the owner is whoever holds
//! the key the stored record verifies under. Reads and every mutation are
//! owner-only.

use bytes::Bytes;

use crate::chunk::ChunkName;
use crate::error::{ChunkError, Result};
use crate::keys::{parse_public_key, SignedData};
use crate::store::ChunkStore;

use super::GetOutput;

pub(super) fn get(store: &dyn ChunkStore, name: &ChunkName, public_key: &[u8]) -> Result<GetOutput> {
    let Some(existing) = store.get(name) else {
        return Err(ChunkError::FailedToFindChunk);
    };
    let chunk = SignedData::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !chunk.verify(&key) {
        return Err(ChunkError::NotOwner);
    }
    Ok(GetOutput::Full(existing))
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
    let chunk = SignedData::from_bytes(content).map_err(|_| ChunkError::InvalidSignedData)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !chunk.verify(&key) {
        return Err(ChunkError::SignatureVerificationFailure);
    }
    if !store.store(name, Bytes::copy_from_slice(content)) {
        return Err(ChunkError::GeneralError);
    }
    Ok(())
}

pub(super) fn modify(
    store: &dyn ChunkStore,
    name: &ChunkName,
    content: &[u8],
    public_key: &[u8],
) -> Result<Bytes> {
    let Some(existing) = store.get(name) else {
        return Err(ChunkError::FailedToFindChunk);
    };
    let current = SignedData::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !current.verify(&key) {
        return Err(ChunkError::NotOwner);
    }
    let replacement =
        SignedData::from_bytes(content).map_err(|_| ChunkError::InvalidSignedData)?;
    if !replacement.verify(&key) {
        return Err(ChunkError::SignatureVerificationFailure);
    }
    let new_content = Bytes::copy_from_slice(content);
    if !store.modify(name, new_content.clone()) {
        return Err(ChunkError::GeneralError);
    }
    Ok(new_content)
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
    let current = SignedData::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !current.verify(&key) {
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
