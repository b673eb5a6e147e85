//! Block identifiers.
//!
//! A block is one erasure-coded chunk of one stripe. Its textual form is
//! `<groupID>_<bucketID>_<stripeID>_<chunkID>`; the group ID itself may
//! contain underscores, so parsing splits from the right.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// Position of a stripe within a group.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct StripeId {
    pub group_id: String,
    pub bucket_id: i64,
    pub stripe: u64,
}

/// Position of a single chunk.
#[derive(Clone, Debug, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct BlockId {
    pub group_id: String,
    pub bucket_id: i64,
    pub stripe: u64,
    pub chunk: u32,
}

impl BlockId {
    pub fn new(group_id: impl Into<String>, bucket_id: i64, stripe: u64, chunk: u32) -> Self {
        Self {
            group_id: group_id.into(),
            bucket_id,
            stripe,
            chunk,
        }
    }

    /// The stripe this chunk belongs to.
    pub fn stripe_id(&self) -> StripeId {
        StripeId {
            group_id: self.group_id.clone(),
            bucket_id: self.bucket_id,
            stripe: self.stripe,
        }
    }

    /// Another chunk of the same stripe.
    pub fn with_chunk(&self, chunk: u32) -> Self {
        Self {
            chunk,
            ..self.clone()
        }
    }
}

impl StripeId {
    pub fn chunk(&self, chunk: u32) -> BlockId {
        BlockId {
            group_id: self.group_id.clone(),
            bucket_id: self.bucket_id,
            stripe: self.stripe,
            chunk,
        }
    }
}

impl fmt::Display for BlockId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "{}_{}_{}_{}",
            self.group_id, self.bucket_id, self.stripe, self.chunk
        )
    }
}

impl fmt::Display for StripeId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}_{}_{}", self.group_id, self.bucket_id, self.stripe)
    }
}

impl FromStr for BlockId {
    type Err = TypeError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let malformed = || TypeError::MalformedBlockId(s.to_string());

        let mut parts = s.rsplitn(4, '_');
        let chunk = parts.next().ok_or_else(malformed)?;
        let stripe = parts.next().ok_or_else(malformed)?;
        let bucket = parts.next().ok_or_else(malformed)?;
        let group = parts.next().ok_or_else(malformed)?;
        if group.is_empty() {
            return Err(malformed());
        }

        Ok(Self {
            group_id: group.to_string(),
            bucket_id: bucket.parse().map_err(|_| malformed())?,
            stripe: stripe.parse().map_err(|_| malformed())?,
            chunk: chunk.parse().map_err(|_| malformed())?,
        })
    }
}
