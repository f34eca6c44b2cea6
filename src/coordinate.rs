//! Per-partition high-watermark tracking and stale-record filtering (§4.4).
//! This is the correctness hinge that keeps a version cutover from
//! re-emitting records a downstream consumer already observed on the prior
//! version.

use crate::error::Partition;
use crate::model::CheckpointVector;
use std::collections::HashMap;

#[derive(Default)]
pub struct CoordinateTracker {
    high_watermarks: HashMap<Partition, CheckpointVector>,
}

impl CoordinateTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// True iff a high-watermark exists for `partition` and `record_vector`
    /// has not advanced past it.
    pub fn should_filter(&self, partition: Partition, record_vector: &CheckpointVector) -> bool {
        match self.high_watermarks.get(&partition) {
            Some(hw) => !record_vector.advanced_past(hw),
            None => false,
        }
    }

    /// Replaces the stored vector for `partition` iff `vector` advances past
    /// it. A regression (possible during a repush) is a silent no-op, never
    /// an error — the partition still switches topics regardless.
    pub fn update_on_version_swap(&mut self, partition: Partition, vector: CheckpointVector) {
        match self.high_watermarks.get(&partition) {
            Some(current) if !vector.advanced_past(current) => {
                tracing::debug!(
                    partition,
                    ?vector,
                    ?current,
                    "version swap watermark did not advance, keeping current high-watermark"
                );
            }
            _ => {
                self.high_watermarks.insert(partition, vector);
            }
        }
    }

    /// Drops the recorded high-watermark for `partition`, used when a caller
    /// seeks or unsubscribes.
    pub fn reset(&mut self, partition: Partition) {
        self.high_watermarks.remove(&partition);
    }

    pub fn high_watermark(&self, partition: Partition) -> Option<&CheckpointVector> {
        self.high_watermarks.get(&partition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn filters_until_a_watermark_is_recorded() {
        let tracker = CoordinateTracker::new();
        assert!(!tracker.should_filter(0, &CheckpointVector::new(vec![0, 0])));
    }

    #[test]
    fn advancing_swap_updates_watermark_and_unblocks_future_records() {
        let mut tracker = CoordinateTracker::new();
        tracker.update_on_version_swap(0, CheckpointVector::new(vec![5, 3]));
        assert!(tracker.should_filter(0, &CheckpointVector::new(vec![5, 3])));
        assert!(tracker.should_filter(0, &CheckpointVector::new(vec![4, 3])));
        assert!(!tracker.should_filter(0, &CheckpointVector::new(vec![5, 4])));
    }

    #[test]
    fn regressing_swap_does_not_overwrite_the_watermark() {
        let mut tracker = CoordinateTracker::new();
        tracker.update_on_version_swap(0, CheckpointVector::new(vec![5, 3]));
        tracker.update_on_version_swap(0, CheckpointVector::new(vec![4, 3]));
        assert_eq!(tracker.high_watermark(0), Some(&CheckpointVector::new(vec![5, 3])));
    }

    #[test]
    fn reset_clears_the_watermark() {
        let mut tracker = CoordinateTracker::new();
        tracker.update_on_version_swap(0, CheckpointVector::new(vec![5, 3]));
        tracker.reset(0);
        assert!(!tracker.should_filter(0, &CheckpointVector::new(vec![0, 0])));
    }
}
