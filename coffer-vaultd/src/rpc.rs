//! Control message payloads and their wire helpers.
//!
//! Every payload is postcard-encoded and prefixed with its
//! [`MessageType`] tag by [`encode`]; [`decode`] is the lenient inverse the
//! handlers use, returning `None` for anything malformed so it can be
//! dropped silently.

use bytes::Bytes;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use coffer_net::codec::wrap_message;
use coffer_net::MessageType;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Ping {
    pub payload: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartVaultRequest {
    pub account_name: String,
    /// Serialized [`coffer_store::Keys`].
    pub keys: Bytes,
    pub bootstrap_endpoint: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct StartVaultResponse {
    pub result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultIdentityRequest {
    pub process_index: u32,
}

/// Empty fields mean the process index was unknown.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultIdentityResponse {
    pub account_name: String,
    pub keys: Bytes,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct StopVaultRequest {
    pub identity: Bytes,
    /// Arbitrary payload signed by the vault's key, proving the caller may
    /// stop it.
    pub data: Bytes,
    pub signature: Bytes,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct VaultShutdownResponse {
    pub result: bool,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIntervalRequest {
    /// `None` reads the current interval; `Some` asks to change it.
    pub new_interval_secs: Option<u64>,
}

/// `interval_secs` of zero means a requested change was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct UpdateIntervalResponse {
    pub interval_secs: u64,
}

/// Serializes a message and prefixes its tag.
pub fn encode<T: Serialize>(typ: MessageType, message: &T) -> Bytes {
    let body = postcard::to_allocvec(message).expect("message serialization is infallible");
    wrap_message(typ, &body)
}

/// Deserializes a message body, `None` on any mismatch.
pub fn decode<T: DeserializeOwned>(body: &[u8]) -> Option<T> {
    postcard::from_bytes(body).ok()
}
