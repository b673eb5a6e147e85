//! Bucket chunk layouts.
//!
//! The erasure-coding library owns the real layout rules; Keepers only cache
//! the three numbers they need to walk stripes and size blocks.

use serde::{Deserialize, Serialize};

use crate::TypeError;

/// Data chunks of the reserved super-bucket.
pub const SUPER_BUCKET_DATA_CHUNKS: u32 = 1;

/// Parity chunks of the reserved super-bucket.
pub const SUPER_BUCKET_PARITY_CHUNKS: u32 = 2;

/// Segment size of the reserved super-bucket in bytes.
pub const SUPER_BUCKET_SEGMENT_SIZE: u64 = 4 * 1024;

/// Most chunks (data plus parity) a stripe may have.
pub const MAX_CHUNKS_PER_STRIPE: u32 = 256;

/// Most stripes a keeper tracks for one bucket.
pub const MAX_STRIPES_PER_BUCKET: u64 = 1 << 16;

/// Chunk layout of a bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketLayout {
    pub data_chunks: u32,
    pub parity_chunks: u32,
    pub segment_size: u64,
}

impl BucketLayout {
    /// Build a layout, rejecting degenerate values.
    pub fn new(data_chunks: u32, parity_chunks: u32, segment_size: u64) -> Result<Self, TypeError> {
        let layout = Self {
            data_chunks,
            parity_chunks,
            segment_size,
        };
        layout.validate()?;
        Ok(layout)
    }

    /// Check a layout that arrived without going through [`new`](Self::new).
    pub fn validate(&self) -> Result<(), TypeError> {
        if self.data_chunks == 0 {
            return Err(TypeError::InvalidLayout("zero data chunks".to_string()));
        }
        if self.segment_size == 0 {
            return Err(TypeError::InvalidLayout("zero segment size".to_string()));
        }
        match self.data_chunks.checked_add(self.parity_chunks) {
            Some(n) if n <= MAX_CHUNKS_PER_STRIPE => Ok(()),
            _ => Err(TypeError::InvalidLayout(format!(
                "more than {MAX_CHUNKS_PER_STRIPE} chunks per stripe"
            ))),
        }
    }

    /// Fixed layout of the metadata super-bucket.
    pub const fn super_bucket() -> Self {
        Self {
            data_chunks: SUPER_BUCKET_DATA_CHUNKS,
            parity_chunks: SUPER_BUCKET_PARITY_CHUNKS,
            segment_size: SUPER_BUCKET_SEGMENT_SIZE,
        }
    }

    /// Total chunks per stripe.
    pub fn chunk_count(&self) -> u32 {
        self.data_chunks.saturating_add(self.parity_chunks)
    }

    /// Stored length of a block whose highest segment index is `offset`.
    pub fn block_len(&self, offset: u64) -> u64 {
        offset.saturating_add(1).saturating_mul(self.segment_size)
    }
}

/// Whether a bucket ID names the reserved super-bucket.
pub fn is_super_bucket(bucket_id: i64) -> bool {
    bucket_id <= 0
}
