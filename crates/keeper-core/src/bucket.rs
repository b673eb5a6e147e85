//! Per-group bucket layouts and stripe counts.

use dashmap::DashMap;
use keeper_types::layout::{is_super_bucket, BucketLayout, MAX_STRIPES_PER_BUCKET};
use serde::{Deserialize, Serialize};

/// What a keeper knows about one bucket.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct BucketInfo {
    pub layout: BucketLayout,
    /// Highest stripe count seen.
    pub stripes: u64,
}

#[derive(Default)]
pub struct BucketTracker {
    buckets: DashMap<i64, BucketInfo>,
}

impl BucketTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a declared layout and stripe count.
    ///
    /// The layout is fixed once a bucket exists; the stripe count only grows
    /// and is capped at [`MAX_STRIPES_PER_BUCKET`]. Super-bucket IDs always
    /// use the super-bucket layout.
    pub fn record(&self, bucket_id: i64, layout: BucketLayout, stripes: u64) -> BucketInfo {
        let stripes = stripes.min(MAX_STRIPES_PER_BUCKET);
        let layout = if is_super_bucket(bucket_id) {
            BucketLayout::super_bucket()
        } else {
            layout
        };
        let mut entry = self
            .buckets
            .entry(bucket_id)
            .or_insert_with(|| BucketInfo { layout, stripes: 0 });
        entry.stripes = entry.stripes.max(stripes);
        *entry
    }

    /// Note that `stripe` exists in `bucket_id`.
    ///
    /// Creates super-buckets on demand. Returns `false` for an undeclared
    /// regular bucket or a stripe past [`MAX_STRIPES_PER_BUCKET`].
    pub fn observe_stripe(&self, bucket_id: i64, stripe: u64) -> bool {
        if stripe >= MAX_STRIPES_PER_BUCKET {
            return false;
        }
        if is_super_bucket(bucket_id) {
            self.record(bucket_id, BucketLayout::super_bucket(), stripe.saturating_add(1));
            return true;
        }
        match self.buckets.get_mut(&bucket_id) {
            Some(mut info) => {
                info.stripes = info.stripes.max(stripe.saturating_add(1));
                true
            }
            None => false,
        }
    }

    pub fn get(&self, bucket_id: i64) -> Option<BucketInfo> {
        self.buckets.get(&bucket_id).map(|b| *b)
    }

    pub fn layout(&self, bucket_id: i64) -> Option<BucketLayout> {
        if is_super_bucket(bucket_id) {
            return Some(BucketLayout::super_bucket());
        }
        self.get(bucket_id).map(|b| b.layout)
    }

    /// All buckets in ascending ID order.
    pub fn snapshot(&self) -> Vec<(i64, BucketInfo)> {
        let mut all: Vec<(i64, BucketInfo)> =
            self.buckets.iter().map(|b| (*b.key(), *b.value())).collect();
        all.sort_by_key(|(id, _)| *id);
        all
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn layout() -> BucketLayout {
        BucketLayout::new(4, 2, 1024).expect("layout")
    }

    #[test]
    fn test_layout_is_fixed_and_stripes_grow() {
        let tracker = BucketTracker::new();
        tracker.record(1, layout(), 5);
        let info = tracker.record(1, BucketLayout::new(8, 4, 2048).expect("layout"), 3);
        assert_eq!(info.layout, layout());
        assert_eq!(info.stripes, 5);
        assert!(tracker.observe_stripe(1, 9));
        assert_eq!(tracker.get(1).expect("bucket").stripes, 10);
    }

    #[test]
    fn test_super_bucket_created_on_demand() {
        let tracker = BucketTracker::new();
        assert!(tracker.observe_stripe(-1, 2));
        let info = tracker.get(-1).expect("super bucket");
        assert_eq!(info.layout, BucketLayout::super_bucket());
        assert_eq!(info.stripes, 3);
        assert!(!tracker.observe_stripe(7, 0));
        assert_eq!(tracker.layout(0), Some(BucketLayout::super_bucket()));
        assert_eq!(tracker.layout(7), None);
    }

    #[test]
    fn test_stripe_count_capped() {
        let tracker = BucketTracker::new();
        assert!(!tracker.observe_stripe(-1, 1 << 31));
        assert!(tracker.get(-1).is_none());

        tracker.record(1, layout(), u64::MAX);
        assert_eq!(tracker.get(1).expect("bucket").stripes, MAX_STRIPES_PER_BUCKET);
        assert!(!tracker.observe_stripe(1, MAX_STRIPES_PER_BUCKET));
        assert!(tracker.observe_stripe(1, MAX_STRIPES_PER_BUCKET - 1));
    }

    #[test]
    fn test_snapshot_sorted() {
        let tracker = BucketTracker::new();
        tracker.record(3, layout(), 1);
        tracker.record(-1, layout(), 1);
        tracker.record(1, layout(), 1);
        let ids: Vec<i64> = tracker.snapshot().into_iter().map(|(id, _)| id).collect();
        assert_eq!(ids, vec![-1, 1, 3]);
    }
}
