//! # keeper-crypto
//!
//! Cryptographic primitives used by Keeper nodes.
//!
//! The proof-of-storage math lives in an external proof library; this crate
//! only covers what the Keeper itself signs and commits to.
//!
//! ## Modules
//!
//! - [`blake3`]: Domain-separated BLAKE3 hashing and merkle commitments
//! - [`ed25519`]: Ed25519 keeper identity, signing and verification

pub mod blake3;
pub mod ed25519;

/// Error types for cryptographic operations.
#[derive(Debug, thiserror::Error)]
pub enum CryptoError {
    /// Ed25519 signature verification failed.
    #[error("signature verification failed")]
    SignatureVerification,

    /// Invalid key length.
    #[error("invalid key length: expected {expected}, got {actual}")]
    InvalidKeyLength { expected: usize, actual: usize },

    /// Invalid input data.
    #[error("invalid input: {0}")]
    InvalidInput(String),
}

pub type Result<T> = std::result::Result<T, CryptoError>;
