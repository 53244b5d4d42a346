//! Rules for appendable-by-all chunks.
//!
//! The owner is whoever holds the key that verifies the chunk's
//! `allow_others_to_append` field. The owner reads the whole chunk (draining
//! queued appendices), retunes the control fields and deletes; everyone else
//! sees only the identity key, and may append a signed record when the
//! owner's appendability tag permits it.

use bytes::Bytes;
use ed25519_dalek::SigningKey;
use serde::{Deserialize, Serialize};

use crate::chunk::{ChunkName, ChunkType};
use crate::error::{ChunkError, Result};
use crate::keys::{parse_public_key, SignedData};
use crate::store::ChunkStore;

use super::GetOutput;

/// Tag byte at the start of `allow_others_to_append.data` granting
/// third-party appends.
pub const APPEND_ALLOWED_TAG: u8 = ChunkType::AppendableByAll as u8;
/// Tag byte withdrawing third-party appends. Any value other than
/// [`APPEND_ALLOWED_TAG`] forbids appending; this is the conventional one.
pub const APPEND_FORBIDDEN_TAG: u8 = ChunkType::ModifiableByOwner as u8;

/// The parsed form of an appendable-by-all chunk.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AppendableByAll {
    /// The owner's public identity, signed by the owner.
    pub identity_key: SignedData,
    /// Control field: first payload byte is the appendability tag. The
    /// signature over it is what defines ownership of the chunk.
    pub allow_others_to_append: SignedData,
    /// Signed third-party contributions, in insertion order.
    pub appendices: Vec<SignedData>,
}

impl AppendableByAll {
    /// Builds a fresh chunk owned by `owner` with no appendices.
    pub fn new_owned(owner: &SigningKey, allow_others: bool) -> Self {
        let tag = if allow_others {
            APPEND_ALLOWED_TAG
        } else {
            APPEND_FORBIDDEN_TAG
        };
        Self {
            identity_key: SignedData::sign(
                Bytes::copy_from_slice(owner.verifying_key().as_bytes()),
                owner,
            ),
            allow_others_to_append: SignedData::sign(vec![tag], owner),
            appendices: Vec::new(),
        }
    }

    /// Whether the owner currently permits third-party appends.
    pub fn allows_others(&self) -> bool {
        self.allow_others_to_append.data.first() == Some(&APPEND_ALLOWED_TAG)
    }

    pub fn to_bytes(&self) -> Bytes {
        postcard::to_allocvec(self)
            .expect("chunk serialization is infallible")
            .into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// An owner's modify request: exactly one control field replacement.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct ModifyAppendableByAll {
    pub allow_others_to_append: Option<SignedData>,
    pub identity_key: Option<SignedData>,
}

impl ModifyAppendableByAll {
    pub fn to_bytes(&self) -> Bytes {
        postcard::to_allocvec(self)
            .expect("modify serialization is infallible")
            .into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

pub(super) fn get(store: &dyn ChunkStore, name: &ChunkName, public_key: &[u8]) -> Result<GetOutput> {
    let Some(existing) = store.get(name) else {
        tracing::debug!(%name, "get: chunk not found");
        return Err(ChunkError::FailedToFindChunk);
    };
    let chunk =
        AppendableByAll::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;

    if !chunk.allow_others_to_append.verify(&key) {
        // Not the owner: serve the identity key only.
        return Ok(GetOutput::IdentityOnly(chunk.identity_key.to_bytes()));
    }

    // The owner's read drains the appendix queue.
    if !chunk.appendices.is_empty() {
        let drained = AppendableByAll {
            appendices: Vec::new(),
            ..chunk
        };
        if !store.modify(name, drained.to_bytes()) {
            return Err(ChunkError::GeneralError);
        }
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
        tracing::debug!(%name, "store: chunk already exists");
        return Err(ChunkError::KeyNotUnique);
    }
    let chunk = AppendableByAll::from_bytes(content).map_err(|_| ChunkError::InvalidSignedData)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !chunk.allow_others_to_append.verify(&key) {
        return Err(ChunkError::SignatureVerificationFailure);
    }
    if !store.store(name, Bytes::copy_from_slice(content)) {
        return Err(ChunkError::GeneralError);
    }
    Ok(())
}

pub(super) fn delete(
    store: &dyn ChunkStore,
    name: &ChunkName,
    ownership_proof: Option<&[u8]>,
    public_key: &[u8],
) -> Result<()> {
    let Some(existing) = store.get(name) else {
        // Already deleted.
        return Ok(());
    };
    let chunk =
        AppendableByAll::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;
    if !chunk.allow_others_to_append.verify(&key) {
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

pub(super) fn modify(
    store: &dyn ChunkStore,
    name: &ChunkName,
    content: &[u8],
    public_key: &[u8],
) -> Result<Bytes> {
    let Some(existing) = store.get(name) else {
        tracing::debug!(%name, "modify: chunk not found");
        return Err(ChunkError::FailedToFindChunk);
    };
    let mut chunk =
        AppendableByAll::from_bytes(&existing).map_err(|_| ChunkError::GeneralError)?;
    let key = parse_public_key(public_key).ok_or(ChunkError::InvalidPublicKey)?;

    let is_owner = chunk.allow_others_to_append.verify(&key);
    if is_owner {
        let request =
            ModifyAppendableByAll::from_bytes(content).map_err(|_| ChunkError::ParseFailure)?;
        // Exactly one control field may be replaced per request.
        let replacement = match (request.allow_others_to_append, request.identity_key) {
            (None, None) | (Some(_), Some(_)) => return Err(ChunkError::InvalidModify),
            (Some(allow), None) => Field::AllowOthers(allow),
            (None, Some(identity)) => Field::Identity(identity),
        };
        match replacement {
            Field::AllowOthers(new_value) => {
                if !new_value.verify(&key) {
                    return Err(ChunkError::SignatureVerificationFailure);
                }
                if new_value.data == chunk.allow_others_to_append.data {
                    // Re-asserting the current value drains the queue.
                    chunk.appendices.clear();
                } else {
                    chunk.allow_others_to_append = new_value;
                }
            }
            Field::Identity(new_value) => {
                if !new_value.verify(&key) {
                    return Err(ChunkError::SignatureVerificationFailure);
                }
                if new_value.data == chunk.identity_key.data {
                    chunk.appendices.clear();
                } else {
                    chunk.identity_key = new_value;
                }
            }
        }
    } else {
        if !chunk.allows_others() {
            tracing::debug!(%name, "modify: appending disallowed by owner");
            return Err(ChunkError::AppendDisallowed);
        }
        let appendix =
            SignedData::from_bytes(content).map_err(|_| ChunkError::InvalidSignedData)?;
        if !appendix.verify(&key) {
            return Err(ChunkError::SignatureVerificationFailure);
        }
        chunk.appendices.push(appendix);
    }

    let new_content = chunk.to_bytes();
    if !store.modify(name, new_content.clone()) {
        return Err(ChunkError::GeneralError);
    }
    Ok(new_content)
}

enum Field {
    AllowOthers(SignedData),
    Identity(SignedData),
}
