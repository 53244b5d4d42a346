//! Typed, policy-bearing content-addressed chunk storage.
//!
//! Chunks are opaque byte blobs named by a digest whose trailing byte selects
//! a [`ChunkType`]. The [`store`] backends are policy-free maps from name to
//! bytes; all authorization, parsing and mutation rules live in the
//! [`actions`] module (the chunk action authority). [`manager`] adds a
//! single-host façade with simulated latency and a cross-process advisory
//! lock, which is what tests and local tooling drive.

pub mod actions;
pub mod chunk;
pub mod error;
pub mod keys;
pub mod manager;
pub mod store;

pub use actions::{AppendableByAll, ChunkActionAuthority, GetOutput, ModifyAppendableByAll};
pub use chunk::{ChunkName, ChunkType, DIGEST_LENGTH};
pub use error::ChunkError;
pub use keys::{Keys, SignedData};
pub use manager::LocalChunkManager;
pub use store::{ChunkStore, FileChunkStore, MemoryChunkStore};
