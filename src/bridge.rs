//! Host half of the cross-boundary protocol.
//!
//! The bridge owns the codec session for one engine: the host callback
//! registry, the promise manager, calls awaiting a `CALL_RESULT` and the
//! batch sequencer. It talks to two channels supplied by the embedder:
//!
//! - the guest channel receives encoded JSON messages bound for the sandbox
//! - the host receiver gets decoded `OPERATIONS` batches (in `batchId`
//!   order) and `GUEST_EVENT`s
//!
//! Everything else (`CALL_FUNCTION`, `CALL_RESULT`, `PROMISE_SETTLE`,
//! `RELEASE_CALLBACKS`) is answered by the bridge itself. Channels are invoked
//! with no internal borrow held, so they may call straight back into the
//! bridge.
//!
//! Function lifetimes are reference counted across the boundary. Each host
//! function that crosses adds a reference the guest gives back with
//! `RELEASE_CALLBACKS` once it is done with it. Each decoded guest function
//! is a proxy that queues a release for the guest when its last clone drops;
//! [`Bridge::flush_releases`] sends the queue.

use std::cell::{Cell, RefCell};
use std::collections::HashMap;
use std::rc::{Rc, Weak};

use rill_protocol::{CallbackRegistry, Codec, CodecHooks, ProtocolError};
use rill_types::{
    BridgeMessage, CallId, Callable, ErrorValue, FnId, JsPromise, OperationBatch, PromiseId,
    SerializedValue, SettleStatus, Settlement, Value,
};
use serde_json::Value as Json;
use tracing::{debug, error, trace, warn};

use crate::promise::PromiseManager;
use crate::sequencer::BatchSequencer;

type GuestChannel = Box<dyn Fn(Json)>;
type HostReceiver = Box<dyn Fn(BridgeMessage<Value>)>;

#[derive(Clone)]
pub struct Bridge {
    inner: Rc<BridgeInner>,
}

struct BridgeInner {
    this: Weak<BridgeInner>,
    codec: Codec,
    callbacks: RefCell<CallbackRegistry>,
    promises: RefCell<PromiseManager>,
    pending_calls: RefCell<HashMap<CallId, JsPromise>>,
    next_call_id: Cell<CallId>,
    sequencer: RefCell<BatchSequencer<SerializedValue>>,
    /// Settlements of already-settled exports, sent after their carrier.
    deferred: RefCell<Vec<BridgeMessage<Value>>>,
    /// Guest functions whose host proxies were dropped.
    released: RefCell<Vec<FnId>>,
    /// Bumped by every reset so proxies of an old session release nothing.
    session: Cell<u64>,
    guest_channel: GuestChannel,
    host_receiver: HostReceiver,
    destroyed: Cell<bool>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("callbacks", &self.callback_count())
            .field("pending_promises", &self.pending_promises())
            .field("pending_calls", &self.pending_calls())
            .field("destroyed", &self.is_destroyed())
            .finish()
    }
}

impl Bridge {
    pub fn new(
        max_reorder_window: usize,
        guest_channel: impl Fn(Json) + 'static,
        host_receiver: impl Fn(BridgeMessage<Value>) + 'static,
    ) -> Self {
        Self::with_codec(Codec::new(), max_reorder_window, guest_channel, host_receiver)
    }

    pub fn with_codec(
        codec: Codec,
        max_reorder_window: usize,
        guest_channel: impl Fn(Json) + 'static,
        host_receiver: impl Fn(BridgeMessage<Value>) + 'static,
    ) -> Self {
        let inner = Rc::new_cyclic(|this| BridgeInner {
            this: this.clone(),
            codec,
            callbacks: RefCell::new(CallbackRegistry::new()),
            promises: RefCell::new(PromiseManager::new()),
            pending_calls: RefCell::new(HashMap::new()),
            next_call_id: Cell::new(0),
            sequencer: RefCell::new(BatchSequencer::new(max_reorder_window)),
            deferred: RefCell::new(Vec::new()),
            released: RefCell::new(Vec::new()),
            session: Cell::new(0),
            guest_channel: Box::new(guest_channel),
            host_receiver: Box::new(host_receiver),
            destroyed: Cell::new(false),
        });
        Self { inner }
    }

    /// Encode and deliver a message to the guest. Dropped once destroyed.
    pub fn send_to_guest(&self, msg: BridgeMessage<Value>) {
        self.inner.send_to_guest(msg);
    }

    /// Resequence an operation batch, decode its values and hand the batches
    /// that are now in order to the host receiver.
    pub fn send_to_host(&self, batch: OperationBatch<SerializedValue>) -> Result<(), ProtocolError> {
        self.inner.send_to_host(batch)
    }

    /// Entry point for every message the guest posts.
    pub fn receive_from_guest(&self, json: Json) -> Result<(), ProtocolError> {
        self.inner.receive_from_guest(json)
    }

    pub fn encode(&self, value: &Value) -> Json {
        self.inner.codec.encode(value, &*self.inner)
    }

    pub fn decode(&self, json: &Json) -> Value {
        self.inner.codec.decode(json, &*self.inner)
    }

    /// Host functions currently reachable from the guest.
    pub fn callback_count(&self) -> usize {
        self.inner.callbacks.borrow().callback_count()
    }

    pub fn pending_promises(&self) -> usize {
        self.inner.promises.borrow().pending_count()
    }

    pub fn pending_calls(&self) -> usize {
        self.inner.pending_calls.borrow().len()
    }

    /// Tell the guest about proxies dropped since the last flush. Returns
    /// whether a message went out.
    pub fn flush_releases(&self) -> bool {
        self.inner.flush_releases()
    }

    /// Forget everything tied to the current guest session. Pending
    /// placeholders and calls are rejected with `reason`.
    pub fn reset_session(&self, reason: &ErrorValue) {
        self.inner.reset_session(reason);
    }

    /// Reset and stop accepting traffic in either direction.
    pub fn destroy(&self) {
        if self.inner.destroyed.replace(true) {
            return;
        }
        self.inner
            .reset_session(&ErrorValue::new("DestroyedError", "engine destroyed"));
        debug!(target: "rill::bridge", "bridge destroyed");
    }

    pub fn is_destroyed(&self) -> bool {
        self.inner.destroyed.get()
    }
}

impl BridgeInner {
    fn send_to_guest(&self, msg: BridgeMessage<Value>) {
        if self.destroyed.get() {
            trace!(target: "rill::bridge", kind = msg.message_type(), "bridge destroyed, dropping message");
            return;
        }
        let kind = msg.message_type();
        let encoded = msg.map_values(&mut |v| self.codec.encode(&v, self));
        match serde_json::to_value(&encoded) {
            Ok(json) => {
                trace!(target: "rill::bridge", kind, "host -> guest");
                (self.guest_channel)(json);
            }
            Err(err) => warn!(target: "rill::bridge", kind, %err, "failed to serialize message"),
        }

        let deferred = std::mem::take(&mut *self.deferred.borrow_mut());
        for msg in deferred {
            self.send_to_guest(msg);
        }
    }

    fn send_to_host(&self, batch: OperationBatch<SerializedValue>) -> Result<(), ProtocolError> {
        let ready = self.sequencer.borrow_mut().push(batch)?;
        for batch in ready {
            let decoded = batch.map_values(&mut |v| self.codec.decode(&v, self));
            trace!(
                target: "rill::bridge",
                batch_id = decoded.batch_id,
                ops = decoded.len(),
                "guest -> host batch"
            );
            (self.host_receiver)(BridgeMessage::Operations(decoded));
        }
        Ok(())
    }

    fn receive_from_guest(&self, json: Json) -> Result<(), ProtocolError> {
        if self.destroyed.get() {
            trace!(target: "rill::bridge", "bridge destroyed, dropping guest message");
            return Ok(());
        }
        let msg: BridgeMessage<SerializedValue> =
            serde_json::from_value(json).map_err(|e| ProtocolError::Malformed(e.to_string()))?;

        match msg {
            BridgeMessage::Operations(batch) => self.send_to_host(batch),
            BridgeMessage::CallFunction {
                fn_id,
                args,
                call_id,
            } => self.handle_call(fn_id, args, call_id),
            BridgeMessage::CallResult {
                call_id,
                result,
                error,
            } => self.settle_call(call_id, result, error),
            BridgeMessage::PromiseSettle {
                promise_id,
                status,
                value,
                error,
            } => self.settle_promise(promise_id, status, value, error),
            BridgeMessage::ReleaseCallbacks { fn_ids } => {
                let mut callbacks = self.callbacks.borrow_mut();
                for fn_id in fn_ids {
                    if !callbacks.release(fn_id) {
                        trace!(target: "rill::bridge", fn_id, "release of an unknown callback");
                    }
                }
                Ok(())
            }
            BridgeMessage::GuestEvent {
                event_name,
                payload,
            } => {
                let payload = self.codec.decode(&payload, self);
                (self.host_receiver)(BridgeMessage::GuestEvent {
                    event_name,
                    payload,
                });
                Ok(())
            }
            other => Err(ProtocolError::Malformed(format!(
                "{} is not a guest-to-host message",
                other.message_type()
            ))),
        }
    }

    /// The guest invoked a host function.
    fn handle_call(&self, fn_id: FnId, args: Vec<Json>, call_id: CallId) -> Result<(), ProtocolError> {
        let callable = self.callbacks.borrow().callable(fn_id);
        let callable = match callable {
            Ok(callable) => callable,
            Err(err) => {
                self.send_to_guest(call_error(call_id, ErrorValue::new("NotFound", err.to_string())));
                return Err(err
                    .as_protocol_error()
                    .unwrap_or(ProtocolError::UnknownFunction {
                        fn_id,
                        released: false,
                    }));
            }
        };

        let args = args.iter().map(|a| self.codec.decode(a, self)).collect();
        match callable.call(args) {
            Ok(Value::Promise(promise)) => {
                let this = self.this.clone();
                let attached = promise.on_settle(move |outcome| {
                    if let Some(bridge) = this.upgrade() {
                        bridge.send_to_guest(call_reply(call_id, outcome.clone()));
                    }
                    Ok(())
                });
                if let Err(err) = attached {
                    error!(target: "rill::bridge", fn_id, call_id, "{:#}", err);
                }
            }
            Ok(value) => self.send_to_guest(call_reply(call_id, Settlement::Fulfilled(value))),
            Err(err) => {
                debug!(target: "rill::bridge", fn_id, call_id, "host function failed: {:#}", err);
                self.send_to_guest(call_error(call_id, ErrorValue::new("Error", format!("{err:#}"))));
            }
        }
        Ok(())
    }

    /// The guest answered a call made through a host-side proxy.
    fn settle_call(&self, call_id: CallId, result: Option<Json>, error: Option<Json>) -> Result<(), ProtocolError> {
        let promise = self
            .pending_calls
            .borrow_mut()
            .remove(&call_id)
            .ok_or(ProtocolError::UnknownCall { call_id })?;
        let outcome = self.outcome(result, error);
        report_reaction_errors(promise.settle(outcome), "call result");
        Ok(())
    }

    fn settle_promise(
        &self,
        promise_id: PromiseId,
        status: SettleStatus,
        value: Option<Json>,
        error: Option<Json>,
    ) -> Result<(), ProtocolError> {
        let outcome = match status {
            SettleStatus::Resolved => Settlement::Fulfilled(self.decode_or_undefined(value.as_ref())),
            SettleStatus::Rejected => Settlement::Rejected(self.decode_or_undefined(error.as_ref())),
        };
        let promise = self
            .promises
            .borrow_mut()
            .take_for_settlement(promise_id)?;
        report_reaction_errors(promise.settle(outcome), "promise settlement");
        Ok(())
    }

    fn outcome(&self, result: Option<Json>, error: Option<Json>) -> Settlement {
        match error {
            Some(error) => Settlement::Rejected(self.codec.decode(&error, self)),
            None => Settlement::Fulfilled(self.decode_or_undefined(result.as_ref())),
        }
    }

    fn decode_or_undefined(&self, json: Option<&Json>) -> Value {
        json.map_or(Value::Undefined, |j| self.codec.decode(j, self))
    }

    fn flush_releases(&self) -> bool {
        let fn_ids = std::mem::take(&mut *self.released.borrow_mut());
        if fn_ids.is_empty() || self.destroyed.get() {
            return false;
        }
        trace!(target: "rill::bridge", count = fn_ids.len(), "releasing guest callbacks");
        self.send_to_guest(BridgeMessage::ReleaseCallbacks { fn_ids });
        true
    }

    fn reset_session(&self, reason: &ErrorValue) {
        self.session.set(self.session.get() + 1);
        self.released.borrow_mut().clear();
        self.callbacks.borrow_mut().clear();
        self.sequencer.borrow_mut().reset();
        self.deferred.borrow_mut().clear();

        let promises = self.promises.borrow_mut().drain();
        let calls: Vec<JsPromise> = self.pending_calls.borrow_mut().drain().map(|(_, p)| p).collect();
        let rejected = promises.len() + calls.len();
        for promise in promises.into_iter().map(|(_, p)| p).chain(calls) {
            report_reaction_errors(promise.reject(Value::Error(reason.clone())), "session reset");
        }
        if rejected > 0 {
            debug!(target: "rill::bridge", rejected, "rejected pending promises and calls");
        }
    }
}

impl CodecHooks for BridgeInner {
    fn register_function(&self, callable: &Callable) -> FnId {
        self.callbacks.borrow_mut().register(callable.clone())
    }

    /// Calling the proxy sends `CALL_FUNCTION` and returns a promise that the
    /// guest's `CALL_RESULT` settles.
    fn function_proxy(&self, fn_id: FnId) -> Callable {
        let guard = ProxyGuard {
            bridge: self.this.clone(),
            fn_id,
            session: self.session.get(),
        };
        Callable::named(format!("guest#{fn_id}"), move |args| {
            let bridge = guard
                .bridge()
                .filter(|b| !b.destroyed.get())
                .ok_or_else(|| anyhow::anyhow!("guest function {fn_id} called after the bridge was destroyed"))?;
            if bridge.session.get() != guard.session {
                anyhow::bail!("guest function {fn_id} belongs to an ended session");
            }
            let call_id = bridge.next_call_id.get() + 1;
            bridge.next_call_id.set(call_id);
            let promise = JsPromise::new();
            bridge.pending_calls.borrow_mut().insert(call_id, promise.clone());
            bridge.send_to_guest(BridgeMessage::CallFunction {
                fn_id,
                args,
                call_id,
            });
            Ok(Value::Promise(promise))
        })
    }

    fn export_promise(&self, promise: &JsPromise) -> PromiseId {
        let promise_id = self.promises.borrow_mut().export();
        match promise.settlement() {
            Some(outcome) => self
                .deferred
                .borrow_mut()
                .push(settle_message(promise_id, &outcome)),
            None => {
                let this = self.this.clone();
                let attached = promise.on_settle(move |outcome| {
                    if let Some(bridge) = this.upgrade() {
                        bridge.send_to_guest(settle_message(promise_id, outcome));
                    }
                    Ok(())
                });
                if let Err(err) = attached {
                    error!(target: "rill::bridge", promise_id, "{:#}", err);
                }
            }
        }
        promise_id
    }

    fn import_promise(&self, promise_id: PromiseId) -> JsPromise {
        self.promises.borrow_mut().import(promise_id)
    }
}

/// Owned by a guest function proxy. Dropping the last clone of the proxy
/// queues one release for the guest, unless its session is over.
struct ProxyGuard {
    bridge: Weak<BridgeInner>,
    fn_id: FnId,
    session: u64,
}

impl ProxyGuard {
    fn bridge(&self) -> Option<Rc<BridgeInner>> {
        self.bridge.upgrade()
    }
}

impl Drop for ProxyGuard {
    fn drop(&mut self) {
        let Some(bridge) = self.bridge() else {
            return;
        };
        if bridge.destroyed.get() || bridge.session.get() != self.session {
            return;
        }
        match bridge.released.try_borrow_mut() {
            Ok(mut released) => released.push(self.fn_id),
            Err(_) => warn!(target: "rill::bridge", fn_id = self.fn_id, "release queue busy, leaking callback"),
        };
    }
}

fn settle_message(promise_id: PromiseId, outcome: &Settlement) -> BridgeMessage<Value> {
    match outcome {
        Settlement::Fulfilled(value) => BridgeMessage::PromiseSettle {
            promise_id,
            status: SettleStatus::Resolved,
            value: Some(value.clone()),
            error: None,
        },
        Settlement::Rejected(reason) => BridgeMessage::PromiseSettle {
            promise_id,
            status: SettleStatus::Rejected,
            value: None,
            error: Some(reason.clone()),
        },
    }
}

fn call_reply(call_id: CallId, outcome: Settlement) -> BridgeMessage<Value> {
    match outcome {
        Settlement::Fulfilled(result) => BridgeMessage::CallResult {
            call_id,
            result: Some(result),
            error: None,
        },
        Settlement::Rejected(error) => BridgeMessage::CallResult {
            call_id,
            result: None,
            error: Some(error),
        },
    }
}

fn call_error(call_id: CallId, error: ErrorValue) -> BridgeMessage<Value> {
    call_reply(call_id, Settlement::Rejected(Value::Error(error)))
}

/// Reactions that fail while a settlement is delivered are logged here and go
/// no further.
fn report_reaction_errors(errors: Option<Vec<anyhow::Error>>, context: &str) {
    for err in errors.into_iter().flatten() {
        error!(target: "rill::bridge", "{} handler failed: {:#}", context, err);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    struct Harness {
        bridge: Bridge,
        to_guest: Rc<RefCell<Vec<Json>>>,
        to_host: Rc<RefCell<Vec<BridgeMessage<Value>>>>,
    }

    fn harness(window: usize) -> Harness {
        let to_guest = Rc::new(RefCell::new(Vec::new()));
        let to_host = Rc::new(RefCell::new(Vec::new()));
        let g = to_guest.clone();
        let h = to_host.clone();
        let bridge = Bridge::new(
            window,
            move |json| g.borrow_mut().push(json),
            move |msg| h.borrow_mut().push(msg),
        );
        Harness {
            bridge,
            to_guest,
            to_host,
        }
    }

    fn ops_message(batch_id: u64, props: Json) -> Json {
        json!({
            "type": "OPERATIONS",
            "version": 1,
            "batchId": batch_id,
            "operations": [{"id": batch_id, "op": "CREATE", "type": "Button", "props": props}]
        })
    }

    #[test]
    fn test_function_props_decode_to_proxies_that_call_the_guest() {
        let h = harness(8);
        h.bridge
            .receive_from_guest(ops_message(1, json!({"onPress": {"__type": "function", "__fnId": 7}})))
            .unwrap();

        let msgs = h.to_host.borrow();
        let BridgeMessage::Operations(batch) = &msgs[0] else {
            panic!("expected a batch");
        };
        let rill_types::OperationKind::Create { props, .. } = &batch.operations[0].kind else {
            panic!("expected CREATE");
        };
        let on_press = props["onPress"].as_callable().unwrap().clone();
        drop(msgs);

        let result = on_press.call(vec![Value::from("tap")]).unwrap();
        let promise = result.as_promise().unwrap().clone();
        assert!(promise.is_pending());
        assert_eq!(h.bridge.pending_calls(), 1);

        let sent = h.to_guest.borrow()[0].clone();
        assert_eq!(sent["type"], "CALL_FUNCTION");
        assert_eq!(sent["fnId"], 7);
        assert_eq!(sent["args"], json!(["tap"]));

        let call_id = sent["callId"].as_u64().unwrap();
        h.bridge
            .receive_from_guest(json!({"type": "CALL_RESULT", "callId": call_id, "result": 42}))
            .unwrap();
        assert_eq!(promise.settlement(), Some(Settlement::Fulfilled(Value::from(42.0))));
        assert_eq!(h.bridge.pending_calls(), 0);
    }

    #[test]
    fn test_guest_calls_host_function() {
        let h = harness(8);
        let double = Value::function(|args| Ok(Value::from(args[0].as_f64().unwrap_or(0.0) * 2.0)));
        h.bridge.send_to_guest(BridgeMessage::host_event("HANDLER", double));

        let fn_id = h.to_guest.borrow()[0]["payload"]["__fnId"].as_u64().unwrap();
        assert_eq!(h.bridge.callback_count(), 1);

        h.bridge
            .receive_from_guest(json!({"type": "CALL_FUNCTION", "fnId": fn_id, "args": [21], "callId": 5}))
            .unwrap();
        let reply = h.to_guest.borrow()[1].clone();
        assert_eq!(reply, json!({"type": "CALL_RESULT", "callId": 5, "result": 42}));
    }

    #[test]
    fn test_guest_releases_host_function_references() {
        let h = harness(8);
        let f = Value::function(|_| Ok(Value::Null));
        h.bridge.send_to_guest(BridgeMessage::host_event("A", f.clone()));
        h.bridge.send_to_guest(BridgeMessage::host_event("B", f));
        let fn_id = h.to_guest.borrow()[0]["payload"]["__fnId"].as_u64().unwrap();
        assert_eq!(h.to_guest.borrow()[1]["payload"]["__fnId"].as_u64(), Some(fn_id));
        assert_eq!(h.bridge.callback_count(), 1);

        let release = json!({"type": "RELEASE_CALLBACKS", "fnIds": [fn_id]});
        h.bridge.receive_from_guest(release.clone()).unwrap();
        assert_eq!(h.bridge.callback_count(), 1);
        h.bridge.receive_from_guest(release).unwrap();
        assert_eq!(h.bridge.callback_count(), 0);
    }

    #[test]
    fn test_dropped_proxies_are_released_to_the_guest() {
        let h = harness(8);
        let proxy = h.bridge.decode(&json!({"__type": "function", "__fnId": 4}));
        let clone = proxy.clone();
        drop(proxy);
        assert!(!h.bridge.flush_releases());
        drop(clone);
        assert!(h.bridge.flush_releases());
        assert_eq!(
            h.to_guest.borrow().last(),
            Some(&json!({"type": "RELEASE_CALLBACKS", "fnIds": [4]}))
        );

        // A proxy from an ended session neither calls nor releases.
        let stale = h.bridge.decode(&json!({"__type": "function", "__fnId": 5}));
        h.bridge
            .reset_session(&ErrorValue::new("SessionEndedError", "replaced"));
        assert!(stale.as_callable().unwrap().call(vec![]).is_err());
        drop(stale);
        assert!(!h.bridge.flush_releases());
    }

    #[test]
    fn test_unknown_function_replies_not_found() {
        let h = harness(8);
        let err = h
            .bridge
            .receive_from_guest(json!({"type": "CALL_FUNCTION", "fnId": 99, "args": [], "callId": 1}))
            .unwrap_err();
        assert!(matches!(err, ProtocolError::UnknownFunction { fn_id: 99, .. }));
        let reply = h.to_guest.borrow()[0].clone();
        assert_eq!(reply["error"]["__name"], "NotFound");
    }

    #[test]
    fn test_promise_settles_once_and_handler_errors_are_contained() {
        let h = harness(8);
        h.bridge
            .receive_from_guest(ops_message(1, json!({"data": {"__type": "promise", "__promiseId": 3}})))
            .unwrap();
        let placeholder = h.bridge.inner.promises.borrow_mut().import(3);
        placeholder
            .on_settle(|_| anyhow::bail!("renderer blew up"))
            .unwrap();

        h.bridge
            .receive_from_guest(json!({
                "type": "PROMISE_SETTLE", "promiseId": 3, "status": "rejected",
                "error": {"__type": "error", "__name": "Error", "__message": "nope"}
            }))
            .unwrap();
        assert!(!placeholder.is_pending());

        let again = h.bridge.receive_from_guest(json!({
            "type": "PROMISE_SETTLE", "promiseId": 3, "status": "resolved", "value": 1
        }));
        assert_eq!(again.unwrap_err(), ProtocolError::DoubleSettlement { promise_id: 3 });
        assert!(matches!(placeholder.settlement(), Some(Settlement::Rejected(_))));
    }

    #[test]
    fn test_settled_export_follows_its_carrier() {
        let h = harness(8);
        let ready = JsPromise::resolved(Value::from("done"));
        h.bridge
            .send_to_guest(BridgeMessage::host_event("DATA", Value::Promise(ready)));

        let sent = h.to_guest.borrow();
        assert_eq!(sent.len(), 2);
        assert_eq!(sent[0]["type"], "HOST_EVENT");
        let promise_id = sent[0]["payload"]["__promiseId"].clone();
        assert_eq!(sent[1]["type"], "PROMISE_SETTLE");
        assert_eq!(sent[1]["promiseId"], promise_id);
        assert_eq!(sent[1]["value"], "done");
    }

    #[test]
    fn test_out_of_order_batches_reach_host_in_order() {
        let h = harness(8);
        h.bridge.receive_from_guest(ops_message(2, json!({}))).unwrap();
        assert!(h.to_host.borrow().is_empty());
        h.bridge.receive_from_guest(ops_message(1, json!({}))).unwrap();

        let ids: Vec<u64> = h
            .to_host
            .borrow()
            .iter()
            .filter_map(|m| match m {
                BridgeMessage::Operations(b) => Some(b.batch_id),
                _ => None,
            })
            .collect();
        assert_eq!(ids, vec![1, 2]);
        assert!(matches!(
            h.bridge.receive_from_guest(ops_message(1, json!({}))),
            Err(ProtocolError::StaleBatch { .. })
        ));
    }

    #[test]
    fn test_malformed_and_misdirected_messages_are_protocol_errors() {
        let h = harness(8);
        assert!(matches!(
            h.bridge.receive_from_guest(json!({"type": "NOPE"})),
            Err(ProtocolError::Malformed(_))
        ));
        assert!(matches!(
            h.bridge.receive_from_guest(json!({"type": "DESTROY"})),
            Err(ProtocolError::Malformed(_))
        ));
        assert_eq!(
            h.bridge
                .receive_from_guest(json!({"type": "CALL_RESULT", "callId": 4, "result": 1}))
                .unwrap_err(),
            ProtocolError::UnknownCall { call_id: 4 }
        );
    }

    #[test]
    fn test_destroy_rejects_pending_and_stops_traffic() {
        let h = harness(8);
        let proxy = h.bridge.decode(&json!({"__type": "function", "__fnId": 1}));
        let pending = proxy.as_callable().unwrap().call(vec![]).unwrap();
        let pending = pending.as_promise().unwrap().clone();
        let sent_before = h.to_guest.borrow().len();

        h.bridge.destroy();
        match pending.settlement() {
            Some(Settlement::Rejected(Value::Error(e))) => assert_eq!(e.name, "DestroyedError"),
            other => panic!("expected rejection, got {other:?}"),
        }

        h.bridge.send_to_guest(BridgeMessage::Destroy);
        assert_eq!(h.to_guest.borrow().len(), sent_before);
        assert!(proxy.as_callable().unwrap().call(vec![]).is_err());
        h.bridge
            .receive_from_guest(ops_message(1, json!({})))
            .unwrap();
        assert!(h.to_host.borrow().is_empty());
    }

    #[test]
    fn test_guest_events_are_decoded() {
        let h = harness(8);
        h.bridge
            .receive_from_guest(json!({
                "type": "GUEST_EVENT", "eventName": "opened",
                "payload": {"at": {"__type": "date", "__value": "2024-01-02T03:04:05Z"}}
            }))
            .unwrap();
        match &h.to_host.borrow()[0] {
            BridgeMessage::GuestEvent { event_name, payload } => {
                assert_eq!(event_name, "opened");
                assert!(matches!(payload.get("at"), Some(Value::Date(_))));
            }
            other => panic!("unexpected {}", other.message_type()),
        };
    }
}
