//! # keeper-transport
//!
//! The Keeper's view of the peer-to-peer messaging layer.
//!
//! The actual transport (connection management, routing, content addressing)
//! is an external collaborator. This crate defines what travels over it and
//! the seam through which the Keeper reaches it:
//!
//! - **Structured keys** `<mainID>/<typeTag>/<option>...` via [`key`]
//! - **Request envelope** (opcode, key, value, signature) via [`wire`]
//! - **CBOR serialization** helpers via [`cbor`]
//! - **Payload types** for every request the Keeper sends or handles via [`messages`]
//! - **[`Messenger`]**, the async request/response primitive
//!
//! ## Architecture
//!
//! ```text
//! Keeper core
//!     |
//!     v
//! MetaRequest (wire.rs)   -- opcode + structured key + CBOR value + signature
//!     |
//!     v
//! Messenger (this crate)  -- send_meta_request / probe
//!     |
//!     v
//! external transport
//! ```

pub mod cbor;
pub mod key;
pub mod messages;
pub mod wire;

use async_trait::async_trait;

use crate::messages::ProbeReply;
use crate::wire::MetaRequest;

/// Error types for transport operations.
#[derive(Debug, thiserror::Error)]
pub enum TransportError {
    /// CBOR serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// CBOR deserialization error.
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// A key string does not follow the `<mainID>/<typeTag>/...` scheme.
    #[error("malformed key: {0}")]
    MalformedKey(String),

    /// The target peer could not be reached.
    #[error("peer unreachable: {0}")]
    Unreachable(String),

    /// The remote side answered with an error.
    #[error("request rejected by {peer}: {reason}")]
    Rejected { peer: String, reason: String },
}

pub type Result<T> = std::result::Result<T, TransportError>;

/// Request/response primitive of the peer-to-peer layer.
///
/// Implementations must not retry internally; the Keeper's schedulers decide
/// when to try again.
#[async_trait]
pub trait Messenger: Send + Sync {
    /// Deliver `request` to `peer` and return the raw response value.
    async fn send_meta_request(&self, request: MetaRequest, peer: &str) -> Result<Vec<u8>>;

    /// Check that `peer` is connectable, returning its current address.
    async fn probe(&self, peer: &str) -> Result<ProbeReply>;
}
