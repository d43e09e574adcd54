use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::Rc;

use rill_types::{Callable, FnId, JsPromise, PromiseId};

use super::CodecHooks;
use crate::callbacks::CallbackRegistry;

/// Hooks that resolve ids back into the same process.
///
/// Functions are registered in a local [`CallbackRegistry`] and proxies call
/// straight into it; promises map back to themselves. Useful for exercising
/// the codec without a peer.
#[derive(Debug, Default)]
pub struct LoopbackHooks {
    registry: Rc<RefCell<CallbackRegistry>>,
    promises: RefCell<HashMap<PromiseId, JsPromise>>,
    next_promise: Cell<PromiseId>,
}

impl LoopbackHooks {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn registry(&self) -> Rc<RefCell<CallbackRegistry>> {
        self.registry.clone()
    }

    pub fn promise(&self, promise_id: PromiseId) -> Option<JsPromise> {
        self.promises.borrow().get(&promise_id).cloned()
    }
}

impl CodecHooks for LoopbackHooks {
    fn register_function(&self, callable: &Callable) -> FnId {
        self.registry.borrow_mut().register(callable.clone())
    }

    fn function_proxy(&self, fn_id: FnId) -> Callable {
        let registry = self.registry.clone();
        Callable::named(format!("proxy#{fn_id}"), move |args| {
            let target = registry.borrow().callable(fn_id)?;
            target.call(args)
        })
    }

    fn export_promise(&self, promise: &JsPromise) -> PromiseId {
        let id = self.next_promise.get() + 1;
        self.next_promise.set(id);
        self.promises.borrow_mut().insert(id, promise.clone());
        id
    }

    fn import_promise(&self, promise_id: PromiseId) -> JsPromise {
        self.promise(promise_id).unwrap_or_default()
    }
}
