//! Ed25519 keeper identity, signing and verification (RFC 8032).
//!
//! Keepers sign two things: the envelope of every outbound meta request and
//! the digest of a proposed space-time payment. Both go through this module.

use ed25519_dalek::{Signer, Verifier};
use serde::{Deserialize, Serialize};
use zeroize::Zeroize;

use crate::{CryptoError, Result};

/// A keeper's private key. The secret bytes are wiped on drop.
pub struct SigningKey {
    inner: ed25519_dalek::SigningKey,
}

/// Public half of a [`SigningKey`], as published on the ledger.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct VerifyingKey {
    inner: ed25519_dalek::VerifyingKey,
}

/// A detached 64-byte signature.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct Signature {
    inner: ed25519_dalek::Signature,
}

/// Signing key together with its public key.
pub struct KeyPair {
    pub signing_key: SigningKey,
    pub verifying_key: VerifyingKey,
}

fn fixed<const N: usize>(bytes: &[u8]) -> Result<[u8; N]> {
    bytes.try_into().map_err(|_| CryptoError::InvalidKeyLength {
        expected: N,
        actual: bytes.len(),
    })
}

impl SigningKey {
    /// A fresh key from the OS random source.
    pub fn generate() -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::generate(&mut rand::rngs::OsRng),
        }
    }

    pub fn from_bytes(secret: &[u8; 32]) -> Self {
        Self {
            inner: ed25519_dalek::SigningKey::from_bytes(secret),
        }
    }

    /// The 32 secret bytes, for writing the identity to the local store.
    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn verifying_key(&self) -> VerifyingKey {
        VerifyingKey {
            inner: self.inner.verifying_key(),
        }
    }

    pub fn sign(&self, message: &[u8]) -> Signature {
        Signature {
            inner: self.inner.sign(message),
        }
    }
}

impl Clone for SigningKey {
    fn clone(&self) -> Self {
        Self::from_bytes(&self.inner.to_bytes())
    }
}

impl Drop for SigningKey {
    fn drop(&mut self) {
        let mut secret = self.inner.to_bytes();
        secret.zeroize();
    }
}

impl std::fmt::Debug for SigningKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SigningKey")
            .field("node_id", &derive_node_id(&self.verifying_key()))
            .finish()
    }
}

impl VerifyingKey {
    /// Parse a public key; rejects points that are not on the curve.
    pub fn from_bytes(bytes: &[u8; 32]) -> Result<Self> {
        ed25519_dalek::VerifyingKey::from_bytes(bytes)
            .map(|inner| Self { inner })
            .map_err(|e| CryptoError::InvalidInput(e.to_string()))
    }

    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Self::from_bytes(&fixed::<32>(bytes)?)
    }

    pub fn to_bytes(&self) -> [u8; 32] {
        self.inner.to_bytes()
    }

    pub fn as_bytes(&self) -> &[u8; 32] {
        self.inner.as_bytes()
    }

    pub fn verify(&self, message: &[u8], signature: &Signature) -> Result<()> {
        self.inner
            .verify(message, &signature.inner)
            .map_err(|_| CryptoError::SignatureVerification)
    }
}

impl Signature {
    pub fn from_bytes(bytes: &[u8; 64]) -> Self {
        Self {
            inner: ed25519_dalek::Signature::from_bytes(bytes),
        }
    }

    /// Parse a signature received as an untyped byte string.
    pub fn from_slice(bytes: &[u8]) -> Result<Self> {
        Ok(Self::from_bytes(&fixed::<64>(bytes)?))
    }

    pub fn to_bytes(&self) -> [u8; 64] {
        self.inner.to_bytes()
    }
}

impl KeyPair {
    pub fn generate() -> Self {
        let signing_key = SigningKey::generate();
        let verifying_key = signing_key.verifying_key();
        Self {
            signing_key,
            verifying_key,
        }
    }

    pub fn node_id(&self) -> String {
        derive_node_id(&self.verifying_key)
    }
}

impl std::fmt::Debug for KeyPair {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("KeyPair")
            .field("node_id", &self.node_id())
            .finish()
    }
}

/// The keeper ID for a public key: hex of the first 20 bytes of its BLAKE3 hash.
pub fn derive_node_id(public_key: &VerifyingKey) -> String {
    let digest = crate::blake3::hash(public_key.as_bytes());
    hex::encode(&digest[..20])
}
