//! Shared helpers for the coffer workspace.

use std::path::PathBuf;

use data_encoding::BASE32_NOPAD;
use sha1::{Digest, Sha1};

pub mod lock;

const COFFER_DIR: &str = "coffer";

/// The directory coffer uses for configuration and vault state when no
/// explicit directory is given.
pub fn coffer_app_dir() -> Option<PathBuf> {
    dirs::data_local_dir().map(|dir| dir.join(COFFER_DIR))
}

/// Path to a file inside the coffer application directory.
pub fn coffer_app_path(file_name: &str) -> Option<PathBuf> {
    coffer_app_dir().map(|dir| dir.join(file_name))
}

/// The short identifier used for directories and bootstrap files belonging to
/// a single vault: base-32 of the SHA-1 of the vault's identity bytes.
pub fn short_id(identity: &[u8]) -> String {
    let digest = Sha1::digest(identity);
    BASE32_NOPAD.encode(&digest)
}

/// A compact, loggable rendering of an opaque binary name.
pub fn base32_substr(name: &[u8]) -> String {
    let encoded = BASE32_NOPAD.encode(name);
    match encoded.char_indices().nth(12) {
        Some((idx, _)) => format!("{}..", &encoded[..idx]),
        None => encoded,
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_id_is_stable() {
        let id = short_id(b"some vault identity");
        assert_eq!(id, short_id(b"some vault identity"));
        assert_ne!(id, short_id(b"another vault identity"));
        // SHA-1 digests are 20 bytes, so base-32 without padding is 32 chars.
        assert_eq!(id.len(), 32);
    }

    #[test]
    fn base32_substr_truncates() {
        assert_eq!(base32_substr(b""), "");
        let long = base32_substr(&[0xab; 64]);
        assert!(long.ends_with(".."));
        assert_eq!(long.len(), 14);
    }
}
