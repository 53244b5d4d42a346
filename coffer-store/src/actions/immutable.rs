//! Rules for immutable, self-verifying chunks (`Default` and `Ufs`).
//!
//! The name is the authorization: a store is accepted only when the content
//! hashes to the digest part of the name, after which the chunk can never be
//! changed or removed.

use bytes::Bytes;

use crate::chunk::ChunkName;
use crate::error::{ChunkError, Result};
use crate::store::ChunkStore;

use super::GetOutput;

pub(super) fn get(store: &dyn ChunkStore, name: &ChunkName) -> Result<GetOutput> {
    store
        .get(name)
        .map(GetOutput::Full)
        .ok_or(ChunkError::FailedToFindChunk)
}

pub(super) fn store(store: &dyn ChunkStore, name: &ChunkName, content: &[u8]) -> Result<()> {
    if store.has(name) {
        return Err(ChunkError::KeyNotUnique);
    }
    if name.digest() != blake3::hash(content).as_bytes() {
        tracing::debug!(%name, "store: content does not hash to name");
        return Err(ChunkError::GeneralError);
    }
    if !store.store(name, Bytes::copy_from_slice(content)) {
        return Err(ChunkError::GeneralError);
    }
    Ok(())
}

pub(super) fn delete() -> Result<()> {
    // Immutable chunks are never deleted; nobody owns them.
    Err(ChunkError::NotOwner)
}

pub(super) fn modify() -> Result<Bytes> {
    Err(ChunkError::InvalidModify)
}
