//! Batch resequencing.
//!
//! Batches must reach the receiver in `batchId` order. The in-process
//! transports already preserve order; the sequencer keeps that guarantee for
//! any transport that does not.

use std::collections::BTreeMap;

use rill_protocol::ProtocolError;
use rill_types::{BatchId, OperationBatch};
use tracing::warn;

pub struct BatchSequencer<V> {
    next_expected: BatchId,
    buffered: BTreeMap<BatchId, OperationBatch<V>>,
    max_window: usize,
}

impl<V> BatchSequencer<V> {
    pub fn new(max_window: usize) -> Self {
        Self {
            next_expected: 1,
            buffered: BTreeMap::new(),
            max_window: max_window.max(1),
        }
    }

    pub fn next_expected(&self) -> BatchId {
        self.next_expected
    }

    pub fn buffered(&self) -> usize {
        self.buffered.len()
    }

    /// Accept one batch and return every batch that is now deliverable, in
    /// order. Ids below the cursor, or already buffered, are stale.
    pub fn push(&mut self, batch: OperationBatch<V>) -> Result<Vec<OperationBatch<V>>, ProtocolError> {
        let batch_id = batch.batch_id;
        if batch_id < self.next_expected || self.buffered.contains_key(&batch_id) {
            return Err(ProtocolError::StaleBatch {
                batch_id,
                expected: self.next_expected,
            });
        }
        self.buffered.insert(batch_id, batch);

        if self.buffered.len() > self.max_window {
            if let Some((&first, _)) = self.buffered.first_key_value() {
                warn!(
                    target: "rill::bridge",
                    missing_from = self.next_expected,
                    resume_at = first,
                    window = self.max_window,
                    "reorder window exceeded, skipping missing batches"
                );
                self.next_expected = first;
            }
        }

        let mut ready = Vec::new();
        while let Some(batch) = self.buffered.remove(&self.next_expected) {
            self.next_expected += 1;
            ready.push(batch);
        }
        Ok(ready)
    }

    /// Start a new guest session: ids restart at 1.
    pub fn reset(&mut self) {
        self.next_expected = 1;
        self.buffered.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn batch(id: BatchId) -> OperationBatch<()> {
        OperationBatch::new(id, Vec::new())
    }

    fn ids(batches: &[OperationBatch<()>]) -> Vec<BatchId> {
        batches.iter().map(|b| b.batch_id).collect()
    }

    #[test]
    fn test_in_order_batches_pass_straight_through() {
        let mut seq = BatchSequencer::new(8);
        assert_eq!(ids(&seq.push(batch(1)).unwrap()), vec![1]);
        assert_eq!(ids(&seq.push(batch(2)).unwrap()), vec![2]);
        assert_eq!(seq.next_expected(), 3);
    }

    #[test]
    fn test_out_of_order_batches_are_held_until_gap_fills() {
        let mut seq = BatchSequencer::new(8);
        assert!(seq.push(batch(3)).unwrap().is_empty());
        assert!(seq.push(batch(2)).unwrap().is_empty());
        assert_eq!(seq.buffered(), 2);
        assert_eq!(ids(&seq.push(batch(1)).unwrap()), vec![1, 2, 3]);
        assert_eq!(seq.buffered(), 0);
    }

    #[test]
    fn test_stale_and_duplicate_ids_are_rejected() {
        let mut seq = BatchSequencer::new(8);
        seq.push(batch(1)).unwrap();
        assert_eq!(
            seq.push(batch(1)).unwrap_err(),
            ProtocolError::StaleBatch {
                batch_id: 1,
                expected: 2
            }
        );

        seq.push(batch(4)).unwrap();
        assert!(matches!(
            seq.push(batch(4)),
            Err(ProtocolError::StaleBatch { batch_id: 4, .. })
        ));
    }

    #[test]
    fn test_gap_is_skipped_when_window_overflows() {
        let mut seq = BatchSequencer::new(2);
        assert!(seq.push(batch(3)).unwrap().is_empty());
        assert!(seq.push(batch(4)).unwrap().is_empty());
        // third buffered batch overflows the window: 1 and 2 are given up on
        assert_eq!(ids(&seq.push(batch(5)).unwrap()), vec![3, 4, 5]);
        assert!(seq.push(batch(2)).is_err());
    }

    #[test]
    fn test_reset_restarts_at_one() {
        let mut seq = BatchSequencer::new(4);
        seq.push(batch(1)).unwrap();
        seq.push(batch(3)).unwrap();
        seq.reset();
        assert_eq!(seq.next_expected(), 1);
        assert_eq!(ids(&seq.push(batch(1)).unwrap()), vec![1]);
    }
}
