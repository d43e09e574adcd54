//! Host-side bookkeeping for promises that cross the boundary.
//!
//! Promise ids are allocated by the side that owns the promise. The guest
//! allocates ids for the promises it sends; the host imports them here as
//! placeholders and settles each one exactly once when `PROMISE_SETTLE`
//! arrives. Ids the host exports come from a separate counter.
//!
//! Outcomes are not kept once delivered: settled ids are remembered only to
//! reject a second settlement.

use std::collections::{BTreeSet, HashMap};

use rill_protocol::ProtocolError;
use rill_types::{ErrorValue, JsPromise, PromiseId, Value};

/// Set of settled ids, compacted into a floor as the low ids fill in.
/// The guest allocates ids in order, so the sparse part stays as small as the
/// number of promises still outstanding below the newest settled one.
#[derive(Debug, Default)]
struct SettledIds {
    /// Every id in `1..=floor` is settled.
    floor: PromiseId,
    above: BTreeSet<PromiseId>,
}

impl SettledIds {
    fn contains(&self, id: PromiseId) -> bool {
        id <= self.floor || self.above.contains(&id)
    }

    fn insert(&mut self, id: PromiseId) {
        if id <= self.floor {
            return;
        }
        self.above.insert(id);
        while self.above.remove(&(self.floor + 1)) {
            self.floor += 1;
        }
    }

    fn sparse_len(&self) -> usize {
        self.above.len()
    }

    fn clear(&mut self) {
        self.floor = 0;
        self.above.clear();
    }
}

#[derive(Debug, Default)]
pub struct PromiseManager {
    next_export: PromiseId,
    imported: HashMap<PromiseId, JsPromise>,
    settled: SettledIds,
}

impl PromiseManager {
    pub fn new() -> Self {
        Self::default()
    }

    /// Allocate an id for a host promise about to cross.
    pub fn export(&mut self) -> PromiseId {
        self.next_export += 1;
        self.next_export
    }

    /// Placeholder for a guest promise. Decoding the same id twice yields the
    /// same placeholder. The guest never sends an id again once it settled,
    /// so such an id comes back rejected.
    pub fn import(&mut self, promise_id: PromiseId) -> JsPromise {
        if self.settled.contains(promise_id) {
            return JsPromise::rejected(Value::Error(ErrorValue::new(
                "ProtocolError",
                format!("promise {promise_id} was already settled"),
            )));
        }
        self.imported.entry(promise_id).or_default().clone()
    }

    /// Remove the placeholder so the caller can settle it outside any borrow
    /// of the manager. The id is remembered, so a second settlement is
    /// reported instead of applied.
    pub fn take_for_settlement(&mut self, promise_id: PromiseId) -> Result<JsPromise, ProtocolError> {
        if self.settled.contains(promise_id) {
            return Err(ProtocolError::DoubleSettlement { promise_id });
        }
        let promise = self
            .imported
            .remove(&promise_id)
            .ok_or(ProtocolError::UnknownPromise { promise_id })?;
        self.settled.insert(promise_id);
        Ok(promise)
    }

    pub fn pending_count(&self) -> usize {
        self.imported.len()
    }

    /// Settled ids that could not be folded into the floor yet.
    pub fn settled_backlog(&self) -> usize {
        self.settled.sparse_len()
    }

    /// Forget the session. Returns the placeholders still pending so the
    /// caller can reject them.
    pub fn drain(&mut self) -> Vec<(PromiseId, JsPromise)> {
        self.settled.clear();
        self.imported.drain().collect()
    }
}
