//! The chunk action authority: per-type policy for the five chunk
//! operations.
//!
//! Every chunk name carries a [`ChunkType`] in its trailing byte; the
//! authority dispatches each operation to that type's rules. Rules validate
//! signatures and shapes, then perform the mutation on the policy-free
//! backend themselves, so a chunk that reaches storage has already passed
//! its type's checks.

use std::sync::Arc;

use bytes::Bytes;

use crate::chunk::{ChunkName, ChunkType};
use crate::error::{ChunkError, Result};
use crate::store::ChunkStore;

pub mod appendable;
pub mod immutable;
pub mod modifiable;
pub mod signature;

pub use appendable::{AppendableByAll, ModifyAppendableByAll};

/// What a `get` returns.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GetOutput {
    /// The full serialized chunk, served to readers the type fully trusts.
    Full(Bytes),
    /// The restricted view served to non-owners of an appendable chunk:
    /// the serialized identity key only. Relayed to peers as `NotOwner`.
    IdentityOnly(Bytes),
}

impl GetOutput {
    /// The payload bytes regardless of which view was served.
    pub fn into_bytes(self) -> Bytes {
        match self {
            GetOutput::Full(bytes) | GetOutput::IdentityOnly(bytes) => bytes,
        }
    }

    /// The status code a relay surfaces alongside the payload.
    pub fn status(&self) -> Result<()> {
        match self {
            GetOutput::Full(_) => Ok(()),
            GetOutput::IdentityOnly(_) => Err(ChunkError::NotOwner),
        }
    }
}

/// Dispatches the five chunk operations on the type tag of the name.
#[derive(Clone)]
pub struct ChunkActionAuthority {
    store: Arc<dyn ChunkStore>,
}

impl ChunkActionAuthority {
    pub fn new(store: Arc<dyn ChunkStore>) -> Self {
        Self { store }
    }

    /// The backend this authority guards.
    pub fn backend(&self) -> &Arc<dyn ChunkStore> {
        &self.store
    }

    #[tracing::instrument(skip_all, fields(name = %name))]
    pub fn get(&self, name: &ChunkName, public_key: &[u8]) -> Result<GetOutput> {
        match name.typ() {
            ChunkType::Default | ChunkType::Ufs => immutable::get(&*self.store, name),
            ChunkType::AppendableByAll => appendable::get(&*self.store, name, public_key),
            ChunkType::ModifiableByOwner => modifiable::get(&*self.store, name, public_key),
            ChunkType::SignaturePacket => signature::get(&*self.store, name),
            ChunkType::Unknown => Err(ChunkError::GeneralError),
        }
    }

    #[tracing::instrument(skip_all, fields(name = %name, len = content.len()))]
    pub fn store(&self, name: &ChunkName, content: &[u8], public_key: &[u8]) -> Result<()> {
        match name.typ() {
            ChunkType::Default | ChunkType::Ufs => {
                immutable::store(&*self.store, name, content)
            }
            ChunkType::AppendableByAll => {
                appendable::store(&*self.store, name, content, public_key)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::store(&*self.store, name, content, public_key)
            }
            ChunkType::SignaturePacket => {
                signature::store(&*self.store, name, content, public_key)
            }
            ChunkType::Unknown => Err(ChunkError::GeneralError),
        }
    }

    #[tracing::instrument(skip_all, fields(name = %name))]
    pub fn delete(
        &self,
        name: &ChunkName,
        ownership_proof: Option<&[u8]>,
        public_key: &[u8],
    ) -> Result<()> {
        match name.typ() {
            ChunkType::Default | ChunkType::Ufs => immutable::delete(),
            ChunkType::AppendableByAll => {
                appendable::delete(&*self.store, name, ownership_proof, public_key)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::delete(&*self.store, name, ownership_proof, public_key)
            }
            ChunkType::SignaturePacket => {
                signature::delete(&*self.store, name, ownership_proof, public_key)
            }
            ChunkType::Unknown => Err(ChunkError::GeneralError),
        }
    }

    #[tracing::instrument(skip_all, fields(name = %name, len = content.len()))]
    pub fn modify(&self, name: &ChunkName, content: &[u8], public_key: &[u8]) -> Result<Bytes> {
        match name.typ() {
            ChunkType::Default | ChunkType::Ufs => immutable::modify(),
            ChunkType::AppendableByAll => {
                appendable::modify(&*self.store, name, content, public_key)
            }
            ChunkType::ModifiableByOwner => {
                modifiable::modify(&*self.store, name, content, public_key)
            }
            ChunkType::SignaturePacket => signature::modify(),
            ChunkType::Unknown => Err(ChunkError::GeneralError),
        }
    }

    /// Existence check; every type answers this the same way.
    pub fn has(&self, name: &ChunkName) -> Result<()> {
        if name.typ() == ChunkType::Unknown {
            return Err(ChunkError::GeneralError);
        }
        if self.store.has(name) {
            Ok(())
        } else {
            Err(ChunkError::FailedToFindChunk)
        }
    }

    /// An opaque token callers compare for equality to decide whether their
    /// cached copy of a chunk is current.
    ///
    /// Immutable types return the name itself. Mutable types return a hash
    /// of the stored bytes; the version observable alongside a draining
    /// `get` is therefore the pre-drain value.
    pub fn version(&self, name: &ChunkName) -> Option<Bytes> {
        match name.typ() {
            ChunkType::Default | ChunkType::Ufs | ChunkType::SignaturePacket => {
                Some(name.to_bytes())
            }
            ChunkType::AppendableByAll | ChunkType::ModifiableByOwner => {
                let content = self.store.get(name)?;
                Some(Bytes::copy_from_slice(blake3::hash(&content).as_bytes()))
            }
            ChunkType::Unknown => None,
        }
    }

    /// Whether chunks of this name's type may be served from caches.
    pub fn is_cacheable(name: &ChunkName) -> bool {
        matches!(
            name.typ(),
            ChunkType::Default | ChunkType::Ufs | ChunkType::SignaturePacket
        )
    }
}

impl std::fmt::Debug for ChunkActionAuthority {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ChunkActionAuthority").finish_non_exhaustive()
    }
}
