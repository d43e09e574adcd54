//! Messages exchanged between host and guest.
//!
//! Every message is a JSON object tagged by `type`. Payload-carrying fields
//! are generic so the host can build messages from [`crate::Value`]s and
//! encode them in one pass just before they leave.

use serde::{Deserialize, Serialize};

use crate::ids::{CallId, FnId, PromiseId};
use crate::operation::{OperationBatch, SerializedValue};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SettleStatus {
    Resolved,
    Rejected,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum BridgeMessage<V = SerializedValue> {
    /// A flushed batch of tree operations (guest to host).
    Operations(OperationBatch<V>),
    /// Invoke a function held by the receiving side.
    CallFunction {
        #[serde(rename = "fnId")]
        fn_id: FnId,
        #[serde(default)]
        args: Vec<V>,
        #[serde(rename = "callId")]
        call_id: CallId,
    },
    /// Answer to a `CALL_FUNCTION`.
    CallResult {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<V>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<V>,
    },
    /// Answer to a `REF_CALL` operation.
    RefMethodResult {
        #[serde(rename = "callId")]
        call_id: CallId,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        result: Option<V>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<V>,
    },
    ConfigUpdate {
        props: V,
    },
    Destroy,
    HostEvent {
        #[serde(rename = "eventName")]
        event_name: String,
        payload: V,
    },
    GuestEvent {
        #[serde(rename = "eventName")]
        event_name: String,
        payload: V,
    },
    PromiseSettle {
        #[serde(rename = "promiseId")]
        promise_id: PromiseId,
        status: SettleStatus,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        value: Option<V>,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        error: Option<V>,
    },
    /// The sender dropped its references to functions owned by the receiving
    /// side. Sent once per reference, so an id listed twice drops two.
    ReleaseCallbacks {
        #[serde(rename = "fnIds")]
        fn_ids: Vec<FnId>,
    },
}

impl<V> BridgeMessage<V> {
    /// Wire tag of the message.
    pub fn message_type(&self) -> &'static str {
        match self {
            BridgeMessage::Operations(_) => "OPERATIONS",
            BridgeMessage::CallFunction { .. } => "CALL_FUNCTION",
            BridgeMessage::CallResult { .. } => "CALL_RESULT",
            BridgeMessage::RefMethodResult { .. } => "REF_METHOD_RESULT",
            BridgeMessage::ConfigUpdate { .. } => "CONFIG_UPDATE",
            BridgeMessage::Destroy => "DESTROY",
            BridgeMessage::HostEvent { .. } => "HOST_EVENT",
            BridgeMessage::GuestEvent { .. } => "GUEST_EVENT",
            BridgeMessage::PromiseSettle { .. } => "PROMISE_SETTLE",
            BridgeMessage::ReleaseCallbacks { .. } => "RELEASE_CALLBACKS",
        }
    }

    pub fn host_event(event_name: impl Into<String>, payload: V) -> Self {
        BridgeMessage::HostEvent {
            event_name: event_name.into(),
            payload,
        }
    }

    /// Convert every payload value, keeping the message shape.
    pub fn map_values<W>(self, f: &mut impl FnMut(V) -> W) -> BridgeMessage<W> {
        match self {
            BridgeMessage::Operations(batch) => BridgeMessage::Operations(batch.map_values(f)),
            BridgeMessage::CallFunction {
                fn_id,
                args,
                call_id,
            } => BridgeMessage::CallFunction {
                fn_id,
                args: args.into_iter().map(&mut *f).collect(),
                call_id,
            },
            BridgeMessage::CallResult {
                call_id,
                result,
                error,
            } => BridgeMessage::CallResult {
                call_id,
                result: result.map(&mut *f),
                error: error.map(&mut *f),
            },
            BridgeMessage::RefMethodResult {
                call_id,
                result,
                error,
            } => BridgeMessage::RefMethodResult {
                call_id,
                result: result.map(&mut *f),
                error: error.map(&mut *f),
            },
            BridgeMessage::ConfigUpdate { props } => BridgeMessage::ConfigUpdate { props: f(props) },
            BridgeMessage::Destroy => BridgeMessage::Destroy,
            BridgeMessage::HostEvent {
                event_name,
                payload,
            } => BridgeMessage::HostEvent {
                event_name,
                payload: f(payload),
            },
            BridgeMessage::GuestEvent {
                event_name,
                payload,
            } => BridgeMessage::GuestEvent {
                event_name,
                payload: f(payload),
            },
            BridgeMessage::PromiseSettle {
                promise_id,
                status,
                value,
                error,
            } => BridgeMessage::PromiseSettle {
                promise_id,
                status,
                value: value.map(&mut *f),
                error: error.map(&mut *f),
            },
            BridgeMessage::ReleaseCallbacks { fn_ids } => BridgeMessage::ReleaseCallbacks { fn_ids },
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_messages_are_tagged_by_type() {
        let msg: BridgeMessage = BridgeMessage::host_event("RECEIVER_BACKPRESSURE", json!({"skipped": 3}));
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"type": "HOST_EVENT", "eventName": "RECEIVER_BACKPRESSURE", "payload": {"skipped": 3}})
        );

        let destroy: BridgeMessage = serde_json::from_value(json!({"type": "DESTROY"})).unwrap();
        assert_eq!(destroy, BridgeMessage::Destroy);
    }

    #[test]
    fn test_operations_message_flattens_batch() {
        let msg: BridgeMessage = serde_json::from_value(json!({
            "type": "OPERATIONS",
            "version": 1,
            "batchId": 2,
            "operations": [{"id": 1, "op": "CREATE", "type": "Text", "props": {}}]
        }))
        .unwrap();

        match msg {
            BridgeMessage::Operations(batch) => {
                assert_eq!(batch.batch_id, 2);
                assert_eq!(batch.operations.len(), 1);
            }
            other => panic!("expected OPERATIONS, got {}", other.message_type()),
        }
    }

    #[test]
    fn test_release_callbacks_wire_shape() {
        let msg: BridgeMessage = serde_json::from_value(json!({"type": "RELEASE_CALLBACKS", "fnIds": [3, 3, 9]})).unwrap();
        assert_eq!(msg, BridgeMessage::ReleaseCallbacks { fn_ids: vec![3, 3, 9] });
        assert_eq!(msg.message_type(), "RELEASE_CALLBACKS");
    }

    #[test]
    fn test_promise_settle_omits_missing_side() {
        let msg: BridgeMessage = BridgeMessage::PromiseSettle {
            promise_id: 4,
            status: SettleStatus::Rejected,
            value: None,
            error: Some(json!("boom")),
        };
        let wire = serde_json::to_value(&msg).unwrap();
        assert_eq!(wire["status"], "rejected");
        assert!(wire.get("value").is_none());

        let back: BridgeMessage = serde_json::from_value(wire).unwrap();
        assert_eq!(back, msg);
    }
}
