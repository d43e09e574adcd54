//! Guest-side operation collector.

use rill_types::{BatchId, Operation, OperationBatch};
use tracing::trace;

use crate::merger::OperationMerger;

/// Accumulates operations produced by one reconciliation pass and hands them
/// off as a single batch.
#[derive(Debug)]
pub struct OperationCollector {
    pending: Vec<Operation>,
    next_batch_id: BatchId,
    merger: Option<OperationMerger>,
}

impl Default for OperationCollector {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationCollector {
    pub fn new() -> Self {
        Self {
            pending: Vec::new(),
            next_batch_id: 1,
            merger: None,
        }
    }

    /// Run every flushed batch through `merger` first.
    pub fn with_merger(mut self, merger: OperationMerger) -> Self {
        self.merger = Some(merger);
        self
    }

    /// Queue an operation, stamping its capture time if it has none.
    pub fn push(&mut self, mut op: Operation) {
        if op.timestamp.is_none() {
            op.timestamp = Some(chrono::Utc::now().timestamp_millis());
        }
        self.pending.push(op);
    }

    pub fn pending(&self) -> &[Operation] {
        &self.pending
    }

    pub fn len(&self) -> usize {
        self.pending.len()
    }

    pub fn is_empty(&self) -> bool {
        self.pending.is_empty()
    }

    /// Id the next non-empty flush will use.
    pub fn next_batch_id(&self) -> BatchId {
        self.next_batch_id
    }

    /// Package pending operations into one batch and pass it to `send`.
    ///
    /// Does nothing (and does not call `send`) when nothing is pending.
    /// Returns the id of the flushed batch.
    pub fn flush(&mut self, send: impl FnOnce(OperationBatch)) -> Option<BatchId> {
        if self.pending.is_empty() {
            return None;
        }

        let mut operations = std::mem::take(&mut self.pending);
        if let Some(merger) = &self.merger {
            let before = operations.len();
            operations = merger.merge(operations);
            trace!(before, after = operations.len(), "merged operations");
        }

        let batch_id = self.next_batch_id;
        self.next_batch_id += 1;
        send(OperationBatch::new(batch_id, operations));
        Some(batch_id)
    }

    /// Drop pending operations without sending them.
    pub fn clear(&mut self) {
        self.pending.clear();
    }
}
