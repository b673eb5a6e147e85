//! Domain-separated BLAKE3 hashing for Keeper signatures and commitments.
//!
//! Every digest a Keeper signs is derived with a registered context string so
//! that a payment signature can never be replayed as an envelope signature.
//!
//! ## Merkle commitments
//!
//! Settlement commits to the challenge points it paid for with a binary merkle
//! tree. Leaves are `hash(0x00 || data)`, inner nodes are a keyed hash under
//! [`contexts::MERKLE_INNER_NODE`]. An odd node at the end of a level is
//! promoted unchanged to the next level.

/// Registered BLAKE3 context strings.
pub mod contexts {
    pub const MERKLE_INNER_NODE: &str = "Keeper v1 merkle-inner-node";
    pub const PAYMENT_DIGEST: &str = "Keeper v1 space-time-payment";
    pub const ENVELOPE_DIGEST: &str = "Keeper v1 meta-request-envelope";
    pub const CHALLENGE_SEED: &str = "Keeper v1 challenge-seed";

    /// All registered context strings. Used for validation.
    pub const ALL_CONTEXTS: &[&str] = &[
        MERKLE_INNER_NODE,
        PAYMENT_DIGEST,
        ENVELOPE_DIGEST,
        CHALLENGE_SEED,
    ];
}

/// Compute BLAKE3 hash of the input data.
pub fn hash(data: &[u8]) -> [u8; 32] {
    *::blake3::hash(data).as_bytes()
}

/// Derive a key using BLAKE3's built-in key derivation mode.
///
/// # Arguments
///
/// * `context` - A registered context string (must start with "Keeper v1 ")
/// * `key_material` - The input key material
pub fn derive_key(context: &str, key_material: &[u8]) -> [u8; 32] {
    debug_assert!(is_registered_context(context), "unregistered context {context:?}");
    let mut hasher = ::blake3::Hasher::new_derive_key(context);
    hasher.update(key_material);
    *hasher.finalize().as_bytes()
}

/// Compute a keyed BLAKE3 hash (MAC/PRF).
pub fn keyed_hash(key: &[u8; 32], message: &[u8]) -> [u8; 32] {
    *::blake3::keyed_hash(key, message).as_bytes()
}

/// Whether a context string is registered.
fn is_registered_context(context: &str) -> bool {
    contexts::ALL_CONTEXTS.contains(&context)
}

/// Compute a merkle leaf hash with domain separation.
///
/// Leaf nodes use `BLAKE3::hash(0x00 || data)` to prevent second-preimage attacks.
pub fn merkle_leaf(data: &[u8]) -> [u8; 32] {
    let mut input = Vec::with_capacity(1 + data.len());
    input.push(0x00);
    input.extend_from_slice(data);
    hash(&input)
}

/// Compute a merkle inner node hash with domain separation.
pub fn merkle_inner(left: &[u8; 32], right: &[u8; 32]) -> [u8; 32] {
    let k_inner = derive_key(contexts::MERKLE_INNER_NODE, b"");
    let mut message = [0u8; 64];
    message[..32].copy_from_slice(left);
    message[32..].copy_from_slice(right);
    keyed_hash(&k_inner, &message)
}

/// Compute the merkle root over already-hashed leaves.
///
/// Returns `None` for an empty leaf set.
pub fn merkle_root(leaves: &[[u8; 32]]) -> Option<[u8; 32]> {
    if leaves.is_empty() {
        return None;
    }

    let mut level: Vec<[u8; 32]> = leaves.to_vec();
    while level.len() > 1 {
        level = level
            .chunks(2)
            .map(|pair| match pair {
                [left, right] => merkle_inner(left, right),
                // chunks(2) never yields an empty slice.
                _ => pair[0],
            })
            .collect();
    }
    level.first().copied()
}

/// Encode multiple dynamic fields using length-prefixed encoding.
///
/// `LE32(len(field1)) || field1 || LE32(len(field2)) || field2 || ...`
pub fn encode_multi_field(fields: &[&[u8]]) -> Vec<u8> {
    let total_len: usize = fields.iter().map(|f| 4 + f.len()).sum();
    let mut output = Vec::with_capacity(total_len);
    for field in fields {
        output.extend_from_slice(&(field.len() as u32).to_le_bytes());
        output.extend_from_slice(field);
    }
    output
}
