//! Proof-of-storage challenge records.
//!
//! A challenge lists the bucket spans it walked and a bitset with one bit per
//! `(bucket, stripe, chunk)` position in those spans. Buckets are laid out in
//! the order of `spans`; inside a span the bit index is
//! `stripe * chunk_count + chunk`. A verifier reconstructs the sampled block
//! IDs from the spans and the set bits alone.

use serde::{Deserialize, Serialize};
use serde_with::serde_as;

use crate::block::BlockId;
use crate::Hash;

/// Which stripes a challenge samples.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChallengeKind {
    /// Regular buckets (ID > 0).
    Data,
    /// The redundancy super-bucket (ID <= 0).
    Meta,
}

impl ChallengeKind {
    /// The kind used on the tick after this one.
    pub fn next(self) -> Self {
        match self {
            Self::Data => Self::Meta,
            Self::Meta => Self::Data,
        }
    }
}

/// One bucket's contribution to the sample bitset.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketSpan {
    pub bucket_id: i64,
    pub stripes: u64,
    pub chunks: u32,
}

impl BucketSpan {
    /// Number of bit positions this span occupies.
    pub fn width(&self) -> u64 {
        self.stripes.saturating_mul(u64::from(self.chunks))
    }

    /// Like [`width`](Self::width), but `None` on overflow.
    pub fn checked_width(&self) -> Option<u64> {
        self.stripes.checked_mul(u64::from(self.chunks))
    }
}

/// Largest bitset a challenge may carry, in positions (2 MiB of bits).
pub const MAX_SAMPLE_POSITIONS: u64 = 1 << 24;

/// Compact bitset of sampled positions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct SampleSet {
    len: u64,
    bits: Vec<u8>,
}

impl SampleSet {
    /// An empty set addressing `len` positions, or `None` beyond
    /// [`MAX_SAMPLE_POSITIONS`].
    pub fn with_len(len: u64) -> Option<Self> {
        if len > MAX_SAMPLE_POSITIONS {
            return None;
        }
        let bytes = usize::try_from(len.div_ceil(8)).ok()?;
        Some(Self {
            len,
            bits: vec![0u8; bytes],
        })
    }

    pub fn len(&self) -> u64 {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set position `index`. Out-of-range positions are ignored.
    pub fn insert(&mut self, index: u64) {
        if index >= self.len {
            return;
        }
        if let Some(byte) = self.bits.get_mut((index / 8) as usize) {
            *byte |= 1 << (index % 8);
        }
    }

    pub fn contains(&self, index: u64) -> bool {
        index < self.len
            && self
                .bits
                .get((index / 8) as usize)
                .is_some_and(|byte| byte & (1 << (index % 8)) != 0)
    }

    pub fn count(&self) -> u64 {
        self.iter().count() as u64
    }

    /// Iterate set positions in ascending order.
    ///
    /// Walks the stored bytes, so a decoded set with a bogus `len` costs no
    /// more than its payload.
    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.bits
            .iter()
            .enumerate()
            .filter(|(_, byte)| **byte != 0)
            .flat_map(|(i, byte)| {
                (0..8u64)
                    .filter(move |bit| byte & (1 << bit) != 0)
                    .map(move |bit| i as u64 * 8 + bit)
            })
            .take_while(move |index| *index < self.len)
    }
}

/// A challenge as issued to a provider.
#[serde_as]
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeRecord {
    pub user_id: String,
    pub group_id: String,
    pub provider: String,
    pub keeper: String,
    /// Unix seconds; also the challenge's identity.
    pub issued_at: u64,
    pub kind: ChallengeKind,
    #[serde_as(as = "serde_with::hex::Hex")]
    pub seed: Hash,
    pub spans: Vec<BucketSpan>,
    pub samples: SampleSet,
}

impl ChallengeRecord {
    /// Reconstruct the block IDs selected by the sample bitset.
    pub fn sampled_blocks(&self) -> Vec<BlockId> {
        let mut blocks = Vec::new();
        let mut base = 0u64;
        for span in &self.spans {
            let end = base.saturating_add(span.width());
            if span.chunks > 0 {
                let chunks = u64::from(span.chunks);
                let inside = self
                    .samples
                    .iter()
                    .skip_while(|i| *i < base)
                    .take_while(|i| *i < end);
                for index in inside {
                    let local = index - base;
                    blocks.push(BlockId::new(
                        self.group_id.clone(),
                        span.bucket_id,
                        local / chunks,
                        (local % chunks) as u32,
                    ));
                }
            }
            base = end;
        }
        blocks
    }
}

/// One entry of a provider's challenge history.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChallengeOutcome {
    pub issued_at: u64,
    pub kind: ChallengeKind,
    /// Bytes covered by the sampled blocks.
    pub sampled_len: u64,
    /// Bytes proven, zero unless `success`.
    pub verified_len: u64,
    pub success: bool,
}

impl ChallengeOutcome {
    /// Whether this outcome counts toward space-time settlement.
    pub fn is_payable(&self) -> bool {
        self.success && self.kind == ChallengeKind::Data
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_sample_set_basics() {
        let mut set = SampleSet::with_len(20).expect("small set");
        set.insert(0);
        set.insert(9);
        set.insert(19);
        set.insert(20); // out of range, ignored
        assert!(set.contains(9));
        assert!(!set.contains(8));
        assert!(!set.contains(20));
        assert_eq!(set.count(), 3);
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 9, 19]);
    }

    #[test]
    fn test_sampled_blocks_across_spans() {
        let spans = vec![
            BucketSpan {
                bucket_id: 1,
                stripes: 2,
                chunks: 3,
            },
            BucketSpan {
                bucket_id: 2,
                stripes: 1,
                chunks: 2,
            },
        ];
        let total: u64 = spans.iter().map(BucketSpan::width).sum();
        let mut samples = SampleSet::with_len(total).expect("small set");
        samples.insert(1); // bucket 1, stripe 0, chunk 1
        samples.insert(5); // bucket 1, stripe 1, chunk 2
        samples.insert(7); // bucket 2, stripe 0, chunk 1

        let record = ChallengeRecord {
            user_id: "u1".to_string(),
            group_id: "q1".to_string(),
            provider: "p1".to_string(),
            keeper: "k1".to_string(),
            issued_at: 100,
            kind: ChallengeKind::Data,
            seed: [0u8; 32],
            spans,
            samples,
        };

        assert_eq!(
            record.sampled_blocks(),
            vec![
                BlockId::new("q1", 1, 0, 1),
                BlockId::new("q1", 1, 1, 2),
                BlockId::new("q1", 2, 0, 1),
            ]
        );
    }

    #[test]
    fn test_sample_set_size_capped() {
        assert!(SampleSet::with_len(MAX_SAMPLE_POSITIONS).is_some());
        assert!(SampleSet::with_len(MAX_SAMPLE_POSITIONS + 1).is_none());
        assert!(SampleSet::with_len(u64::MAX).is_none());

        let span = BucketSpan {
            bucket_id: 1,
            stripes: u64::MAX,
            chunks: 3,
        };
        assert_eq!(span.checked_width(), None);
        assert_eq!(span.width(), u64::MAX);
    }

    #[test]
    fn test_decoded_len_beyond_payload_is_cheap() {
        let set = SampleSet {
            len: u64::MAX,
            bits: vec![0b0000_0101],
        };
        assert_eq!(set.iter().collect::<Vec<_>>(), vec![0, 2]);
        assert_eq!(set.count(), 2);
    }

    #[test]
    fn test_kind_alternates() {
        assert_eq!(ChallengeKind::Data.next(), ChallengeKind::Meta);
        assert_eq!(ChallengeKind::Meta.next().next(), ChallengeKind::Meta);
    }

    #[test]
    fn test_only_successful_data_is_payable() {
        let mut outcome = ChallengeOutcome {
            issued_at: 1,
            kind: ChallengeKind::Data,
            sampled_len: 10,
            verified_len: 10,
            success: true,
        };
        assert!(outcome.is_payable());
        outcome.kind = ChallengeKind::Meta;
        assert!(!outcome.is_payable());
        outcome.kind = ChallengeKind::Data;
        outcome.success = false;
        assert!(!outcome.is_payable());
    }
}
