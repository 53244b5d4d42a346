//! Signing identities and signed payloads.

use std::fmt;

use bytes::Bytes;
use ed25519_dalek::{Signature, Signer, SigningKey, VerifyingKey};
use rand::{CryptoRng, RngCore};
use serde::{Deserialize, Serialize};

pub const PUBLIC_KEY_LENGTH: usize = 32;
pub const SECRET_KEY_LENGTH: usize = 32;

/// A payload together with an ed25519 signature over it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SignedData {
    pub data: Bytes,
    pub signature: Bytes,
}

impl SignedData {
    /// Signs `data` with `key`.
    pub fn sign(data: impl Into<Bytes>, key: &SigningKey) -> Self {
        let data = data.into();
        let signature = key.sign(&data);
        Self {
            data,
            signature: Bytes::copy_from_slice(&signature.to_bytes()),
        }
    }

    /// Whether `signature` is a valid signature over `data` under `key`.
    pub fn verify(&self, key: &VerifyingKey) -> bool {
        let Ok(signature) = Signature::from_slice(&self.signature) else {
            return false;
        };
        key.verify_strict(&self.data, &signature).is_ok()
    }

    pub fn to_bytes(&self) -> Bytes {
        postcard::to_allocvec(self)
            .expect("signed data serialization is infallible")
            .into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

/// Parses and validates a serialized public key.
///
/// Returns `None` for anything that is not a canonical ed25519 verifying key,
/// which the authority maps to `InvalidPublicKey`.
pub fn parse_public_key(bytes: &[u8]) -> Option<VerifyingKey> {
    let bytes: [u8; PUBLIC_KEY_LENGTH] = bytes.try_into().ok()?;
    VerifyingKey::from_bytes(&bytes).ok()
}

/// The key material a vault owns: an identity, its keypair, and the token a
/// network issues once the identity has been validated.
#[derive(Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Keys {
    pub identity: Bytes,
    pub public_key: [u8; PUBLIC_KEY_LENGTH],
    secret_key: [u8; SECRET_KEY_LENGTH],
    pub validation_token: Bytes,
}

impl Keys {
    pub fn generate<R: RngCore + CryptoRng>(
        identity: impl Into<Bytes>,
        validation_token: impl Into<Bytes>,
        rng: &mut R,
    ) -> Self {
        let signing_key = SigningKey::generate(rng);
        Self {
            identity: identity.into(),
            public_key: signing_key.verifying_key().to_bytes(),
            secret_key: signing_key.to_bytes(),
            validation_token: validation_token.into(),
        }
    }

    pub fn signing_key(&self) -> SigningKey {
        SigningKey::from_bytes(&self.secret_key)
    }

    pub fn verifying_key(&self) -> Option<VerifyingKey> {
        parse_public_key(&self.public_key)
    }

    pub fn to_bytes(&self) -> Bytes {
        postcard::to_allocvec(self)
            .expect("key serialization is infallible")
            .into()
    }

    pub fn from_bytes(bytes: &[u8]) -> Result<Self, postcard::Error> {
        postcard::from_bytes(bytes)
    }
}

impl fmt::Debug for Keys {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("Keys")
            .field("identity", &coffer_util::base32_substr(&self.identity))
            .field("public_key", &coffer_util::base32_substr(&self.public_key))
            .finish_non_exhaustive()
    }
}
