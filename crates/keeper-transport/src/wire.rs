//! Meta-request envelope.
//!
//! ## Wire format
//!
//! ```text
//! MetaRequest {
//!     op:        Opcode,   // get | put | delete
//!     key:       String,   // <mainID>/<typeTag>/<option>...
//!     value:     Vec<u8>,  // CBOR-encoded payload, may be empty
//!     signature: Vec<u8>,  // Ed25519 over the envelope digest, may be empty
//! }
//! ```
//!
//! The envelope digest is
//! `BLAKE3::derive_key("Keeper v1 meta-request-envelope", op || key || value)`
//! with length-prefixed fields.

use keeper_crypto::blake3::{self, contexts};
use keeper_crypto::ed25519::{Signature, SigningKey, VerifyingKey};
use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::key::{MetaKey, Opcode};

/// A request as handed to the [`Messenger`](crate::Messenger).
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetaRequest {
    pub op: Opcode,
    pub key: String,
    #[serde_as(as = "serde_with::Bytes")]
    pub value: Vec<u8>,
    #[serde_as(as = "serde_with::Bytes")]
    pub signature: Vec<u8>,
}

impl MetaRequest {
    /// Build and sign a request.
    pub fn signed(op: Opcode, key: &MetaKey, value: Vec<u8>, signer: &SigningKey) -> Self {
        let key = key.to_string();
        let digest = envelope_digest(op, &key, &value);
        let signature = signer.sign(&digest).to_bytes().to_vec();
        Self {
            op,
            key,
            value,
            signature,
        }
    }

    /// Check the envelope signature against `public_key`.
    pub fn verify(&self, public_key: &VerifyingKey) -> bool {
        verify_envelope(self.op, &self.key, &self.value, &self.signature, public_key)
    }
}

fn opcode_byte(op: Opcode) -> u8 {
    match op {
        Opcode::Get => 0,
        Opcode::Put => 1,
        Opcode::Delete => 2,
    }
}

/// Digest signed by the sender of a request.
pub fn envelope_digest(op: Opcode, key: &str, value: &[u8]) -> [u8; 32] {
    let input = blake3::encode_multi_field(&[&[opcode_byte(op)], key.as_bytes(), value]);
    blake3::derive_key(contexts::ENVELOPE_DIGEST, &input)
}

/// Verify a raw envelope signature.
pub fn verify_envelope(
    op: Opcode,
    key: &str,
    value: &[u8],
    signature: &[u8],
    public_key: &VerifyingKey,
) -> bool {
    let Ok(signature) = Signature::from_slice(signature) else {
        return false;
    };
    public_key
        .verify(&envelope_digest(op, key, value), &signature)
        .is_ok()
}
