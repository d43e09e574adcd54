//! Engine event subscriptions.
//!
//! Handlers run synchronously, in subscription order, in the order events are
//! raised. A handler may subscribe, unsubscribe or call back into the engine;
//! the handler list is snapshotted before each dispatch.

use std::cell::RefCell;
use std::rc::{Rc, Weak};

use rill_types::Value;
use tracing::debug;

use crate::errors::EngineError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EngineEventKind {
    Error,
    Message,
    Destroy,
}

#[derive(Debug)]
pub enum EngineEvent {
    /// Execution or runtime failure. Counted in `errorCount`.
    Error(EngineError),
    /// Custom guest-to-host event.
    Message { event_name: String, payload: Value },
    Destroy,
}

impl EngineEvent {
    pub fn kind(&self) -> EngineEventKind {
        match self {
            EngineEvent::Error(_) => EngineEventKind::Error,
            EngineEvent::Message { .. } => EngineEventKind::Message,
            EngineEvent::Destroy => EngineEventKind::Destroy,
        }
    }
}

type Handler = Rc<dyn Fn(&EngineEvent)>;

#[derive(Default)]
pub(crate) struct EventHub {
    next_id: u64,
    handlers: Vec<(u64, EngineEventKind, Handler)>,
}

impl EventHub {
    pub(crate) fn len(&self) -> usize {
        self.handlers.len()
    }

    pub(crate) fn clear(&mut self) {
        self.handlers.clear();
    }
}

/// Shared handle the engine emits through.
#[derive(Clone, Default)]
pub(crate) struct Events {
    hub: Rc<RefCell<EventHub>>,
}

impl Events {
    pub(crate) fn on(&self, kind: EngineEventKind, handler: impl Fn(&EngineEvent) + 'static) -> Subscription {
        let mut hub = self.hub.borrow_mut();
        hub.next_id += 1;
        let id = hub.next_id;
        hub.handlers.push((id, kind, Rc::new(handler)));
        Subscription {
            id,
            hub: Rc::downgrade(&self.hub),
        }
    }

    pub(crate) fn emit(&self, event: &EngineEvent) {
        let kind = event.kind();
        let handlers: Vec<Handler> = self
            .hub
            .borrow()
            .handlers
            .iter()
            .filter(|(_, k, _)| *k == kind)
            .map(|(_, _, h)| Rc::clone(h))
            .collect();
        debug!(target: "rill::engine", ?kind, handlers = handlers.len(), "emitting event");
        for handler in handlers {
            handler(event);
        }
    }

    pub(crate) fn handler_count(&self) -> usize {
        self.hub.borrow().len()
    }

    pub(crate) fn clear(&self) {
        self.hub.borrow_mut().clear();
    }
}

/// Disposer returned by `Engine::on`. Dropping it keeps the handler
/// subscribed; call [`Subscription::dispose`] to remove it.
#[derive(Debug)]
pub struct Subscription {
    id: u64,
    hub: Weak<RefCell<EventHub>>,
}

impl Subscription {
    /// Remove the handler. Returns whether it was still subscribed.
    pub fn dispose(&self) -> bool {
        let Some(hub) = self.hub.upgrade() else {
            return false;
        };
        let mut hub = hub.borrow_mut();
        let before = hub.handlers.len();
        hub.handlers.retain(|(id, _, _)| *id != self.id);
        before != hub.handlers.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::Cell;

    #[test]
    fn test_handlers_filter_by_kind_and_keep_order() {
        let events = Events::default();
        let log = Rc::new(RefCell::new(Vec::new()));

        let l = log.clone();
        events.on(EngineEventKind::Message, move |e| {
            if let EngineEvent::Message { event_name, .. } = e {
                l.borrow_mut().push(format!("a:{event_name}"));
            }
        });
        let l = log.clone();
        events.on(EngineEventKind::Message, move |_| l.borrow_mut().push("b".into()));
        let l = log.clone();
        events.on(EngineEventKind::Destroy, move |_| l.borrow_mut().push("destroy".into()));

        events.emit(&EngineEvent::Message {
            event_name: "ping".into(),
            payload: Value::Null,
        });
        assert_eq!(*log.borrow(), vec!["a:ping", "b"]);
    }

    #[test]
    fn test_dispose_unsubscribes_once() {
        let events = Events::default();
        let hits = Rc::new(Cell::new(0));
        let h = hits.clone();
        let sub = events.on(EngineEventKind::Destroy, move |_| h.set(h.get() + 1));

        events.emit(&EngineEvent::Destroy);
        assert!(sub.dispose());
        assert!(!sub.dispose());
        events.emit(&EngineEvent::Destroy);
        assert_eq!(hits.get(), 1);
        assert_eq!(events.handler_count(), 0);
    }

    #[test]
    fn test_handler_may_unsubscribe_during_dispatch() {
        let events = Events::default();
        let slot: Rc<RefCell<Option<Subscription>>> = Rc::new(RefCell::new(None));
        let s = slot.clone();
        let sub = events.on(EngineEventKind::Destroy, move |_| {
            if let Some(sub) = s.borrow().as_ref() {
                sub.dispose();
            }
        });
        *slot.borrow_mut() = Some(sub);

        events.emit(&EngineEvent::Destroy);
        assert_eq!(events.handler_count(), 0);
    }
}
