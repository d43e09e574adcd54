//! Function references that cross the boundary as integer ids.
//!
//! The side that owns a function registers it and sends only the id. The
//! other side calls back by id. Ids are allocated monotonically and never
//! reused within a session, so a call on a released id is always detectable.
//!
//! Unowned registrations are reference counted: every time the same function
//! crosses again it keeps its id and gains a reference, and the other side
//! sends one release per reference it drops.

use std::collections::HashMap;
use std::time::Instant;

use rill_types::{Callable, FnId, NodeId, Value};
use tracing::trace;

use crate::errors::CallbackError;

/// One registered function.
#[derive(Debug, Clone)]
pub struct CallbackRegistration {
    pub fn_id: FnId,
    pub callable: Callable,
    pub created_at: Instant,
    /// Node whose props carried the function, if any. Released with the node.
    pub owner: Option<NodeId>,
    /// References the other side has been handed and not yet released.
    pub refs: usize,
}

/// Owner-side table of functions exposed to the other side.
#[derive(Debug)]
pub struct CallbackRegistry {
    next_id: FnId,
    entries: HashMap<FnId, CallbackRegistration>,
    by_identity: HashMap<(usize, Option<NodeId>), FnId>,
}

impl Default for CallbackRegistry {
    fn default() -> Self {
        Self::new()
    }
}

impl CallbackRegistry {
    pub fn new() -> Self {
        Self {
            next_id: 1,
            entries: HashMap::new(),
            by_identity: HashMap::new(),
        }
    }

    /// Register an unowned function and return its fresh id.
    pub fn register(&mut self, callable: Callable) -> FnId {
        self.register_with_owner(callable, None)
    }

    /// Register a function tied to the lifetime of `owner`.
    pub fn register_owned(&mut self, callable: Callable, owner: NodeId) -> FnId {
        self.register_with_owner(callable, Some(owner))
    }

    fn register_with_owner(&mut self, callable: Callable, owner: Option<NodeId>) -> FnId {
        // Same function under the same owner keeps its id.
        let key = (callable.addr(), owner);
        if let Some(existing) = self
            .by_identity
            .get(&key)
            .and_then(|id| self.entries.get_mut(id))
        {
            existing.refs += 1;
            return existing.fn_id;
        }

        let fn_id = self.next_id;
        self.next_id += 1;
        self.by_identity.insert(key, fn_id);
        self.entries.insert(
            fn_id,
            CallbackRegistration {
                fn_id,
                callable,
                created_at: Instant::now(),
                owner,
                refs: 1,
            },
        );
        trace!(fn_id, ?owner, "registered callback");
        fn_id
    }

    pub fn get(&self, fn_id: FnId) -> Option<&CallbackRegistration> {
        self.entries.get(&fn_id)
    }

    pub fn contains(&self, fn_id: FnId) -> bool {
        self.entries.contains_key(&fn_id)
    }

    /// Look up a function for calling outside of any borrow of the registry.
    pub fn callable(&self, fn_id: FnId) -> Result<Callable, CallbackError> {
        self.entries
            .get(&fn_id)
            .map(|r| r.callable.clone())
            .ok_or(CallbackError::NotFound {
                fn_id,
                released: self.was_released(fn_id),
            })
    }

    /// Look up and call. Calling a released id fails with `NotFound`.
    ///
    /// A function that re-enters a registry shared through a `RefCell` must be
    /// called via [`CallbackRegistry::callable`] instead.
    pub fn invoke(&self, fn_id: FnId, args: Vec<Value>) -> Result<Value, CallbackError> {
        self.callable(fn_id)?
            .call(args)
            .map_err(CallbackError::Failed)
    }

    /// Drop one reference. The mapping goes away with the last one. Returns
    /// whether the id was registered.
    pub fn release(&mut self, fn_id: FnId) -> bool {
        let Some(entry) = self.entries.get_mut(&fn_id) else {
            return false;
        };
        entry.refs = entry.refs.saturating_sub(1);
        if entry.refs == 0 {
            self.remove(fn_id);
            trace!(fn_id, "released callback");
        }
        true
    }

    /// Release every function owned by `owner`, whatever its reference count.
    /// Returns how many were dropped.
    pub fn release_owner(&mut self, owner: NodeId) -> usize {
        let ids: Vec<FnId> = self
            .entries
            .values()
            .filter(|r| r.owner == Some(owner))
            .map(|r| r.fn_id)
            .collect();
        for fn_id in &ids {
            self.remove(*fn_id);
        }
        ids.len()
    }

    fn remove(&mut self, fn_id: FnId) {
        if let Some(entry) = self.entries.remove(&fn_id) {
            self.by_identity.remove(&(entry.callable.addr(), entry.owner));
        }
    }

    pub fn refs(&self, fn_id: FnId) -> usize {
        self.entries.get(&fn_id).map_or(0, |r| r.refs)
    }

    pub fn clear(&mut self) {
        self.entries.clear();
        self.by_identity.clear();
    }

    fn was_released(&self, fn_id: FnId) -> bool {
        fn_id > 0 && fn_id < self.next_id && !self.entries.contains_key(&fn_id)
    }

    pub fn size(&self) -> usize {
        self.entries.len()
    }

    /// Alias of [`CallbackRegistry::size`] used by leak checks.
    pub fn callback_count(&self) -> usize {
        self.size()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}
