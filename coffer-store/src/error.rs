//! The status taxonomy surfaced by every chunk authority call.

/// Why a chunk operation was refused.
///
/// These are surfaced unchanged through the local chunk manager so callers
/// can relay them to remote peers as status codes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, thiserror::Error)]
pub enum ChunkError {
    #[error("chunk not found")]
    FailedToFindChunk,
    #[error("chunk name already exists")]
    KeyNotUnique,
    #[error("invalid public key")]
    InvalidPublicKey,
    #[error("signature verification failed")]
    SignatureVerificationFailure,
    #[error("caller is not the owner")]
    NotOwner,
    #[error("content does not parse as signed data")]
    InvalidSignedData,
    #[error("content does not parse")]
    ParseFailure,
    #[error("chunk operation failed")]
    GeneralError,
    #[error("modify must replace exactly one control field")]
    InvalidModify,
    #[error("appending disallowed by owner")]
    AppendDisallowed,
}

pub type Result<T, E = ChunkError> = std::result::Result<T, E>;
