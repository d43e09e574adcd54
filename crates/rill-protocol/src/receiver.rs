//! Host-side receiver: applies operation batches to a node tree.
//!
//! The receiver exclusively owns the node map for one engine session. A
//! synthetic root (id [`ROOT_NODE_ID`], type `__root__`) always exists and is
//! the `APPEND` target for top-level nodes.
//!
//! Admission control: a batch longer than `max_batch_size` only has its first
//! `max_batch_size` operations applied. The rest are counted as skipped and a
//! `HOST_EVENT` named `RECEIVER_BACKPRESSURE` goes back toward the guest.
//!
//! Bad operations (unknown nodes, duplicate creates) are logged and dropped.
//! They never abort the rest of the batch.

use std::collections::BTreeMap;
use std::time::Instant;

use rill_types::{
    BatchId, BridgeMessage, ErrorValue, NodeId, Operation, OperationBatch, OperationKind, Props,
    Value, ROOT_NODE_ID,
};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{debug, warn};

use crate::errors::ProtocolError;
use crate::timeline::{ActivitySnapshot, ActivityTimeline};

pub const ROOT_NODE_TYPE: &str = "__root__";

/// Event name of the admission-control signal.
pub const BACKPRESSURE_EVENT: &str = "RECEIVER_BACKPRESSURE";

/// Host mirror of one guest-allocated node.
#[derive(Debug, Clone, PartialEq)]
pub struct NodeInstance {
    pub id: NodeId,
    pub node_type: String,
    pub props: Props<Value>,
    pub parent_id: Option<NodeId>,
    pub children: Vec<NodeId>,
}

impl NodeInstance {
    fn new(id: NodeId, node_type: impl Into<String>, props: Props<Value>) -> Self {
        Self {
            id,
            node_type: node_type.into(),
            props,
            parent_id: None,
            children: Vec::new(),
        }
    }

    pub fn prop(&self, key: &str) -> Option<&Value> {
        self.props.get(key)
    }

    /// Text content as written by `TEXT`.
    pub fn text(&self) -> Option<&str> {
        self.props.get("text").and_then(Value::as_str)
    }
}

/// Executes `REF_CALL`s against the native view behind a node.
pub trait RefHandler {
    fn call_ref(&mut self, node: &NodeInstance, method: &str, args: Vec<Value>) -> Result<Value, Value>;
}

impl<F> RefHandler for F
where
    F: FnMut(&NodeInstance, &str, Vec<Value>) -> Result<Value, Value>,
{
    fn call_ref(&mut self, node: &NodeInstance, method: &str, args: Vec<Value>) -> Result<Value, Value> {
        self(node, method, args)
    }
}

/// Result of one [`Receiver::apply_batch`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ApplyOutcome {
    pub batch_id: BatchId,
    pub applied: usize,
    pub skipped: usize,
    /// Operations that were admitted but rejected as invalid.
    pub rejected: usize,
    pub duration_ms: f64,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ReceiverStats {
    pub nodes: usize,
    pub batches_applied: u64,
    pub ops_applied: u64,
    pub ops_skipped: u64,
    pub last_batch_id: Option<BatchId>,
}

type GuestSender = Box<dyn Fn(BridgeMessage<Value>)>;
type UpdateListener = Box<dyn FnMut(&Receiver)>;

pub struct Receiver {
    nodes: BTreeMap<NodeId, NodeInstance>,
    max_batch_size: usize,
    send_to_guest: Option<GuestSender>,
    on_update: Option<UpdateListener>,
    ref_handler: Option<Box<dyn RefHandler>>,
    timeline: ActivityTimeline,
    stats: ReceiverStats,
}

impl std::fmt::Debug for Receiver {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Receiver")
            .field("nodes", &self.nodes.len())
            .field("max_batch_size", &self.max_batch_size)
            .field("stats", &self.stats)
            .finish()
    }
}

impl Receiver {
    pub fn new(max_batch_size: usize) -> Self {
        let mut nodes = BTreeMap::new();
        nodes.insert(
            ROOT_NODE_ID,
            NodeInstance::new(ROOT_NODE_ID, ROOT_NODE_TYPE, Props::new()),
        );
        Self {
            nodes,
            max_batch_size: max_batch_size.max(1),
            send_to_guest: None,
            on_update: None,
            ref_handler: None,
            timeline: ActivityTimeline::default(),
            stats: ReceiverStats::default(),
        }
    }

    /// Transport back toward the guest (backpressure, ref results).
    pub fn with_sender(mut self, send: impl Fn(BridgeMessage<Value>) + 'static) -> Self {
        self.send_to_guest = Some(Box::new(send));
        self
    }

    /// Called after each applied batch. The listener must not re-enter the
    /// receiver.
    pub fn with_on_update(mut self, listener: impl FnMut(&Receiver) + 'static) -> Self {
        self.on_update = Some(Box::new(listener));
        self
    }

    pub fn with_ref_handler(mut self, handler: impl RefHandler + 'static) -> Self {
        self.ref_handler = Some(Box::new(handler));
        self
    }

    pub fn with_timeline(mut self, timeline: ActivityTimeline) -> Self {
        self.timeline = timeline;
        self
    }

    pub fn set_sender(&mut self, send: impl Fn(BridgeMessage<Value>) + 'static) {
        self.send_to_guest = Some(Box::new(send));
    }

    pub fn set_ref_handler(&mut self, handler: impl RefHandler + 'static) {
        self.ref_handler = Some(Box::new(handler));
    }

    /// Drop the transport and listener. The tree stays readable.
    pub fn detach(&mut self) {
        self.send_to_guest = None;
        self.on_update = None;
    }

    pub fn max_batch_size(&self) -> usize {
        self.max_batch_size
    }

    /// Drop every node except the root, e.g. before a new guest session
    /// starts allocating ids from 1 again. Stats and the timeline are kept.
    pub fn clear(&mut self) {
        self.nodes.retain(|id, _| *id == ROOT_NODE_ID);
        if let Some(root) = self.nodes.get_mut(&ROOT_NODE_ID) {
            root.children.clear();
            root.props.clear();
        }
    }

    pub fn apply_batch(&mut self, batch: OperationBatch<Value>) -> ApplyOutcome {
        let started = Instant::now();
        let batch_id = batch.batch_id;
        let total = batch.operations.len();
        let admitted = total.min(self.max_batch_size);
        let skipped = total - admitted;

        let mut rejected = 0;
        for op in batch.operations.into_iter().take(admitted) {
            if let Err(err) = self.apply_op(op) {
                rejected += 1;
                warn!(target: "rill_protocol::receiver", batch_id, error = %err, "dropped operation");
            }
        }

        if skipped > 0 {
            warn!(
                target: "rill_protocol::receiver",
                batch_id,
                applied = admitted,
                skipped,
                limit = self.max_batch_size,
                "batch exceeded max size"
            );
            self.send(BridgeMessage::host_event(
                BACKPRESSURE_EVENT,
                Value::from_json(&json!({
                    "skipped": skipped,
                    "applied": admitted,
                    "batchId": batch_id,
                    "maxBatchSize": self.max_batch_size,
                })),
            ));
        }

        let duration_ms = started.elapsed().as_secs_f64() * 1000.0;
        self.timeline
            .record(total as u64, skipped as u64, duration_ms);

        self.stats.batches_applied += 1;
        self.stats.ops_applied += admitted as u64;
        self.stats.ops_skipped += skipped as u64;
        self.stats.last_batch_id = Some(batch_id);

        debug!(
            target: "rill_protocol::receiver",
            batch_id,
            applied = admitted,
            skipped,
            rejected,
            duration_ms,
            "applied batch"
        );

        if let Some(mut listener) = self.on_update.take() {
            listener(self);
            if self.on_update.is_none() {
                self.on_update = Some(listener);
            }
        }

        ApplyOutcome {
            batch_id,
            applied: admitted,
            skipped,
            rejected,
            duration_ms,
        }
    }

    fn send(&self, msg: BridgeMessage<Value>) {
        match &self.send_to_guest {
            Some(send) => send(msg),
            None => debug!(
                target: "rill_protocol::receiver",
                kind = msg.message_type(),
                "no transport, dropping message"
            ),
        }
    }

    fn apply_op(&mut self, op: Operation<Value>) -> Result<(), ProtocolError> {
        let id = op.id;
        match op.kind {
            OperationKind::Create { node_type, props } => {
                if self.nodes.contains_key(&id) {
                    return Err(ProtocolError::DuplicateNode { id });
                }
                self.nodes.insert(id, NodeInstance::new(id, node_type, props));
            }
            OperationKind::Update {
                props,
                removed_keys,
            } => {
                let node = self.node_mut("UPDATE", id)?;
                for key in &removed_keys {
                    node.props.shift_remove(key);
                }
                node.props.extend(props);
            }
            OperationKind::Delete => self.delete(id)?,
            OperationKind::Append {
                parent_id,
                child_id,
            } => {
                self.attach("APPEND", parent_id, child_id, None)?;
            }
            OperationKind::Insert {
                parent_id,
                child_id,
                index,
            } => {
                self.attach("INSERT", parent_id, child_id, Some(index))?;
            }
            OperationKind::Remove {
                parent_id,
                child_id,
            } => {
                self.node("REMOVE", child_id)?;
                let parent = self.node_mut("REMOVE", parent_id)?;
                let before = parent.children.len();
                parent.children.retain(|c| *c != child_id);
                if parent.children.len() != before {
                    if let Some(child) = self.nodes.get_mut(&child_id) {
                        child.parent_id = None;
                    }
                }
            }
            OperationKind::Reorder {
                parent_id,
                child_ids,
            } => self.reorder(parent_id, child_ids)?,
            OperationKind::Text { text } => {
                self.node_mut("TEXT", id)?
                    .props
                    .insert("text".to_string(), Value::String(text));
            }
            OperationKind::RefCall {
                ref_id,
                method,
                args,
                call_id,
            } => self.ref_call(ref_id, &method, args, call_id),
        }
        Ok(())
    }

    fn node(&self, op: &'static str, id: NodeId) -> Result<&NodeInstance, ProtocolError> {
        self.nodes.get(&id).ok_or(ProtocolError::UnknownNode { op, id })
    }

    fn node_mut(&mut self, op: &'static str, id: NodeId) -> Result<&mut NodeInstance, ProtocolError> {
        self.nodes
            .get_mut(&id)
            .ok_or(ProtocolError::UnknownNode { op, id })
    }

    /// Unlink `child` from whatever parent currently holds it.
    fn detach_from_parent(&mut self, child_id: NodeId) {
        let parent_id = self.nodes.get_mut(&child_id).and_then(|c| c.parent_id.take());
        if let Some(parent) = parent_id.and_then(|p| self.nodes.get_mut(&p)) {
            parent.children.retain(|c| *c != child_id);
        }
    }

    fn attach(
        &mut self,
        op: &'static str,
        parent_id: NodeId,
        child_id: NodeId,
        index: Option<usize>,
    ) -> Result<(), ProtocolError> {
        self.node(op, parent_id)?;
        self.node(op, child_id)?;
        if child_id == ROOT_NODE_ID || self.is_self_or_ancestor(child_id, parent_id) {
            return Err(ProtocolError::Malformed(format!(
                "{op} cannot attach node {child_id} under {parent_id}: would form a cycle"
            )));
        }

        self.detach_from_parent(child_id);
        let parent = self.node_mut(op, parent_id)?;
        match index {
            Some(i) => {
                let i = i.min(parent.children.len());
                parent.children.insert(i, child_id);
            }
            None => parent.children.push(child_id),
        }
        if let Some(child) = self.nodes.get_mut(&child_id) {
            child.parent_id = Some(parent_id);
        }
        Ok(())
    }

    /// Whether `candidate` is `node` or one of its ancestors.
    fn is_self_or_ancestor(&self, candidate: NodeId, node: NodeId) -> bool {
        let mut current = Some(node);
        // Bounded by the node count so a corrupted link can't spin forever.
        for _ in 0..=self.nodes.len() {
            match current {
                Some(id) if id == candidate => return true,
                Some(id) => current = self.nodes.get(&id).and_then(|n| n.parent_id),
                None => return false,
            }
        }
        true
    }

    fn reorder(&mut self, parent_id: NodeId, child_ids: Vec<NodeId>) -> Result<(), ProtocolError> {
        self.node("REORDER", parent_id)?;

        let mut listed: Vec<NodeId> = Vec::with_capacity(child_ids.len());
        for id in child_ids {
            if id == ROOT_NODE_ID || !self.nodes.contains_key(&id) || listed.contains(&id) {
                continue;
            }
            if self.is_self_or_ancestor(id, parent_id) {
                warn!(
                    target: "rill_protocol::receiver",
                    parent_id,
                    child_id = id,
                    "REORDER lists an ancestor of its parent, ignoring it"
                );
                continue;
            }
            listed.push(id);
        }

        let previous = std::mem::take(&mut self.node_mut("REORDER", parent_id)?.children);
        for id in previous {
            if !listed.contains(&id) {
                if let Some(child) = self.nodes.get_mut(&id) {
                    child.parent_id = None;
                }
            }
        }
        for &id in &listed {
            let current = self.nodes.get(&id).and_then(|c| c.parent_id);
            if current.is_some_and(|p| p != parent_id) {
                self.detach_from_parent(id);
            }
            if let Some(child) = self.nodes.get_mut(&id) {
                child.parent_id = Some(parent_id);
            }
        }
        self.node_mut("REORDER", parent_id)?.children = listed;
        Ok(())
    }

    fn delete(&mut self, id: NodeId) -> Result<(), ProtocolError> {
        if id == ROOT_NODE_ID {
            return Err(ProtocolError::Malformed("the root node cannot be deleted".into()));
        }
        self.node("DELETE", id)?;
        self.detach_from_parent(id);
        if let Some(node) = self.nodes.remove(&id) {
            for child in node.children {
                if let Some(c) = self.nodes.get_mut(&child) {
                    c.parent_id = None;
                }
            }
        }
        Ok(())
    }

    fn ref_call(&mut self, ref_id: NodeId, method: &str, args: Vec<Value>, call_id: u64) {
        let outcome = match (self.nodes.get(&ref_id), self.ref_handler.as_mut()) {
            (None, _) => Err(Value::Error(ErrorValue::new(
                "ProtocolError",
                ProtocolError::UnknownNode { op: "REF_CALL", id: ref_id }.to_string(),
            ))),
            (Some(_), None) => Err(Value::Error(ErrorValue::new(
                "Error",
                format!("no ref handler for {method} on node {ref_id}"),
            ))),
            (Some(node), Some(handler)) => handler.call_ref(node, method, args),
        };

        let (result, error) = match outcome {
            Ok(v) => (Some(v), None),
            Err(e) => (None, Some(e)),
        };
        self.send(BridgeMessage::RefMethodResult {
            call_id,
            result,
            error,
        });
    }

    // ------------------------------------------------------------------------
    // Read side
    // ------------------------------------------------------------------------

    pub fn get(&self, id: NodeId) -> Option<&NodeInstance> {
        self.nodes.get(&id)
    }

    pub fn root(&self) -> Option<&NodeInstance> {
        self.nodes.get(&ROOT_NODE_ID)
    }

    pub fn nodes(&self) -> &BTreeMap<NodeId, NodeInstance> {
        &self.nodes
    }

    /// Number of nodes, root included.
    pub fn node_count(&self) -> usize {
        self.nodes.len()
    }

    pub fn children_of(&self, id: NodeId) -> &[NodeId] {
        self.nodes
            .get(&id)
            .map(|n| n.children.as_slice())
            .unwrap_or(&[])
    }

    pub fn stats(&self) -> ReceiverStats {
        ReceiverStats {
            nodes: self.nodes.len(),
            ..self.stats.clone()
        }
    }

    pub fn activity(&self) -> ActivitySnapshot {
        self.timeline.snapshot()
    }

    pub fn timeline_mut(&mut self) -> &mut ActivityTimeline {
        &mut self.timeline
    }

    /// JSON view of the tree: the root subtree plus any detached islands.
    /// Functions render as `"[Function]"`.
    pub fn snapshot(&self) -> serde_json::Value {
        let detached: Vec<serde_json::Value> = self
            .nodes
            .values()
            .filter(|n| n.id != ROOT_NODE_ID && n.parent_id.is_none())
            .map(|n| self.render(n.id, 0))
            .collect();
        json!({
            "root": self.render(ROOT_NODE_ID, 0),
            "detached": detached,
        })
    }

    fn render(&self, id: NodeId, depth: usize) -> serde_json::Value {
        let Some(node) = self.nodes.get(&id) else {
            return serde_json::Value::Null;
        };
        if depth > 512 {
            return json!({"id": id, "truncated": true});
        }
        let props: serde_json::Map<String, serde_json::Value> = node
            .props
            .iter()
            .map(|(k, v)| {
                let rendered = match v {
                    Value::Function(_) => json!("[Function]"),
                    other => other.to_json_lossy(),
                };
                (k.clone(), rendered)
            })
            .collect();
        json!({
            "id": node.id,
            "type": node.node_type,
            "props": props,
            "children": node
                .children
                .iter()
                .map(|c| self.render(*c, depth + 1))
                .collect::<Vec<_>>(),
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::cell::RefCell;
    use std::rc::Rc;

    fn batch(id: BatchId, ops: Vec<Operation<Value>>) -> OperationBatch<Value> {
        OperationBatch::new(id, ops)
    }

    fn creates(ids: std::ops::Range<NodeId>) -> Vec<Operation<Value>> {
        ids.map(|i| Operation::create(i, "View", Props::new())).collect()
    }

    fn capture() -> (Rc<RefCell<Vec<BridgeMessage<Value>>>>, impl Fn(BridgeMessage<Value>)) {
        let sent = Rc::new(RefCell::new(Vec::new()));
        let s = sent.clone();
        (sent, move |msg| s.borrow_mut().push(msg))
    }

    #[test]
    fn test_backpressure_applies_prefix_and_reports_skipped() {
        let (sent, sender) = capture();
        let mut receiver = Receiver::new(2).with_sender(sender);

        let outcome = receiver.apply_batch(batch(1, creates(1..6)));
        assert_eq!(outcome.applied, 2);
        assert_eq!(outcome.skipped, 3);
        assert_eq!(receiver.node_count(), 3);
        assert!(receiver.get(1).is_some() && receiver.get(2).is_some());
        assert!(receiver.get(3).is_none());

        let sent = sent.borrow();
        assert_eq!(sent.len(), 1);
        match &sent[0] {
            BridgeMessage::HostEvent {
                event_name,
                payload,
            } => {
                assert_eq!(event_name, BACKPRESSURE_EVENT);
                assert_eq!(payload.get("skipped"), Some(Value::Number(3.0)));
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_no_backpressure_event_within_limit() {
        let (sent, sender) = capture();
        let mut receiver = Receiver::new(10).with_sender(sender);
        receiver.apply_batch(batch(1, creates(1..4)));
        assert!(sent.borrow().is_empty());
    }

    #[test]
    fn test_timeline_sums_across_batches() {
        let mut receiver = Receiver::new(2);
        receiver.apply_batch(batch(1, creates(1..6)));
        receiver.apply_batch(batch(2, creates(10..13)));

        let activity = receiver.activity();
        assert_eq!(activity.total_ops(), 8);
        assert_eq!(activity.total_skipped(), 4);

        let stats = receiver.stats();
        assert_eq!(stats.ops_applied, 4);
        assert_eq!(stats.ops_skipped, 4);
        assert_eq!(stats.last_batch_id, Some(2));
    }

    #[test]
    fn test_tree_operations() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..5);
        ops.extend([
            Operation::append(0, 1),
            Operation::append(1, 2),
            Operation::append(1, 3),
            Operation::insert(1, 4, 0),
            Operation::insert(1, 2, 99),
            Operation::text(3, "hello"),
        ]);
        receiver.apply_batch(batch(1, ops));

        assert_eq!(receiver.children_of(0), &[1]);
        assert_eq!(receiver.children_of(1), &[4, 3, 2]);
        assert_eq!(receiver.get(3).unwrap().text(), Some("hello"));

        receiver.apply_batch(batch(
            2,
            vec![
                Operation::reorder(1, vec![2, 4]),
                Operation::remove(1, 4),
                Operation::append(0, 4),
            ],
        ));
        assert_eq!(receiver.children_of(1), &[2]);
        assert_eq!(receiver.get(3).unwrap().parent_id, None);
        assert_eq!(receiver.children_of(0), &[1, 4]);
        assert_eq!(receiver.get(4).unwrap().parent_id, Some(0));
    }

    #[test]
    fn test_attach_rejects_parent_cycles() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..4);
        ops.extend([
            Operation::append(1, 2),
            Operation::append(2, 3),
            Operation::append(2, 1),
            Operation::insert(3, 1, 0),
            Operation::append(3, 3),
        ]);
        let outcome = receiver.apply_batch(batch(1, ops));

        assert_eq!(outcome.rejected, 3);
        assert_eq!(receiver.get(1).unwrap().parent_id, None);
        assert_eq!(receiver.get(2).unwrap().parent_id, Some(1));
        assert_eq!(receiver.get(3).unwrap().parent_id, Some(2));
        assert!(receiver.children_of(2).iter().all(|c| *c != 1));
        assert!(receiver.children_of(3).is_empty());

        // Moving a descendant somewhere unrelated is still fine.
        let outcome = receiver.apply_batch(batch(2, vec![Operation::append(0, 3)]));
        assert_eq!(outcome.rejected, 0);
        assert_eq!(receiver.children_of(0), &[3]);
        assert!(receiver.children_of(2).is_empty());
    }

    #[test]
    fn test_reorder_ignores_ancestors_of_the_parent() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..4);
        ops.extend([Operation::append(1, 2), Operation::append(2, 3)]);
        receiver.apply_batch(batch(1, ops));

        receiver.apply_batch(batch(2, vec![Operation::reorder(2, vec![1, 3])]));
        assert_eq!(receiver.children_of(2), &[3]);
        assert_eq!(receiver.get(1).unwrap().parent_id, None);
        assert_eq!(receiver.children_of(1), &[2]);
    }

    #[test]
    fn test_update_tracks_removed_keys() {
        let mut receiver = Receiver::new(100);
        let mut props = Props::new();
        props.insert("a".to_string(), Value::from(1.0));
        props.insert("b".to_string(), Value::from(2.0));
        receiver.apply_batch(batch(1, vec![Operation::create(1, "View", props)]));

        let mut update = Props::new();
        update.insert("c".to_string(), Value::from(3.0));
        receiver.apply_batch(batch(2, vec![Operation::update(1, update, vec!["a".into()])]));

        let node = receiver.get(1).unwrap();
        assert!(node.prop("a").is_none());
        assert_eq!(node.prop("b"), Some(&Value::from(2.0)));
        assert_eq!(node.prop("c"), Some(&Value::from(3.0)));
    }

    /// Test that DELETE of a node with no parent link is tolerated.
    #[test]
    fn test_delete_without_parent_link() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..3);
        ops.push(Operation::append(1, 2));
        ops.push(Operation::delete(1));
        let outcome = receiver.apply_batch(batch(1, ops));

        assert_eq!(outcome.rejected, 0);
        assert!(receiver.get(1).is_none());
        assert_eq!(receiver.get(2).unwrap().parent_id, None);
    }

    #[test]
    fn test_delete_unlinks_from_parent() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..2);
        ops.push(Operation::append(0, 1));
        ops.push(Operation::delete(1));
        receiver.apply_batch(batch(1, ops));
        assert!(receiver.children_of(0).is_empty());
    }

    #[test]
    fn test_invalid_ops_are_dropped_not_fatal() {
        let mut receiver = Receiver::new(100);
        let outcome = receiver.apply_batch(batch(
            1,
            vec![
                Operation::update(42, Props::new(), vec![]),
                Operation::create(1, "View", Props::new()),
                Operation::create(1, "View", Props::new()),
                Operation::append(0, 77),
                Operation::delete(ROOT_NODE_ID),
                Operation::append(0, 1),
            ],
        ));
        assert_eq!(outcome.rejected, 4);
        assert_eq!(receiver.children_of(0), &[1]);
    }

    #[test]
    fn test_ref_call_round_trip() {
        let (sent, sender) = capture();
        let mut receiver = Receiver::new(100)
            .with_sender(sender)
            .with_ref_handler(
                |node: &NodeInstance, method: &str, _args: Vec<Value>| -> Result<Value, Value> {
                    Ok(Value::from(format!("{}:{}", node.node_type, method)))
                },
            );

        receiver.apply_batch(batch(
            1,
            vec![
                Operation::create(1, "Input", Props::new()),
                Operation::ref_call(1, 1, "focus", vec![], 7),
                Operation::ref_call(1, 99, "focus", vec![], 8),
            ],
        ));

        let sent = sent.borrow();
        assert_eq!(sent.len(), 2);
        assert!(matches!(
            &sent[0],
            BridgeMessage::RefMethodResult { call_id: 7, result: Some(Value::String(s)), error: None } if s.as_str() == "Input:focus"
        ));
        assert!(matches!(&sent[1], BridgeMessage::RefMethodResult { call_id: 8, result: None, error: Some(_) }));
    }

    #[test]
    fn test_on_update_sees_new_tree() {
        let seen = Rc::new(RefCell::new(Vec::new()));
        let s = seen.clone();
        let mut receiver = Receiver::new(100).with_on_update(move |r: &Receiver| {
            s.borrow_mut().push(r.node_count());
        });
        receiver.apply_batch(batch(1, creates(1..3)));
        receiver.apply_batch(batch(2, creates(3..4)));
        assert_eq!(*seen.borrow(), vec![3, 4]);
    }

    #[test]
    fn test_snapshot_renders_functions_and_islands() {
        let mut receiver = Receiver::new(100);
        let mut props = Props::new();
        props.insert("onPress".to_string(), Value::function(|_| Ok(Value::Undefined)));
        receiver.apply_batch(batch(
            1,
            vec![
                Operation::create(1, "Button", props),
                Operation::append(0, 1),
                Operation::create(2, "Text", Props::new()),
            ],
        ));

        let snap = receiver.snapshot();
        assert_eq!(snap["root"]["type"], ROOT_NODE_TYPE);
        assert_eq!(snap["root"]["children"][0]["props"]["onPress"], "[Function]");
        assert_eq!(snap["detached"][0]["id"], 2);
    }

    #[test]
    fn test_clear_keeps_only_root() {
        let mut receiver = Receiver::new(100);
        let mut ops = creates(1..3);
        ops.push(Operation::append(0, 1));
        receiver.apply_batch(batch(1, ops));

        receiver.clear();
        assert_eq!(receiver.node_count(), 1);
        assert!(receiver.children_of(0).is_empty());
        assert_eq!(receiver.stats().batches_applied, 1);

        // Ids from a previous session can be created again.
        receiver.apply_batch(batch(2, creates(1..2)));
        assert_eq!(receiver.node_count(), 2);
    }
}
