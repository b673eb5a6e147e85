//! # keeper-types
//!
//! Shared domain types for the Keeper workspace: block identifiers, bucket
//! layouts, peer records, ledger contract views, challenge records and
//! payment records.

pub mod block;
pub mod challenge;
pub mod contract;
pub mod layout;
pub mod payment;
pub mod peer;

/// A 32-byte BLAKE3 digest.
pub type Hash = [u8; 32];

/// Lower bound of provider credit.
pub const CREDIT_MIN: i32 = -100;

/// Upper bound of provider credit.
pub const CREDIT_MAX: i32 = 100;

/// Credit assigned to a provider the first time it is seen.
pub const DEFAULT_PROVIDER_CREDIT: i32 = 50;

/// Bytes per megabyte used in space-time normalization.
pub const BYTES_PER_MB: u128 = 1024 * 1024;

/// Seconds per hour used in space-time normalization.
pub const SECS_PER_HOUR: u128 = 60 * 60;

/// Errors raised while parsing identifiers.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum TypeError {
    #[error("malformed block id: {0}")]
    MalformedBlockId(String),

    #[error("invalid layout: {0}")]
    InvalidLayout(String),
}
