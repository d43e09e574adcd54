//! Tree-mutation operations and the batches that carry them.
//!
//! Operations are generic over the prop value type: the guest side and the
//! wire use [`SerializedValue`] (JSON), the host side decodes them into
//! [`crate::Value`] before applying.

use indexmap::IndexMap;
use serde::{Deserialize, Serialize};

use crate::ids::{BatchId, CallId, NodeId, PROTOCOL_VERSION};

/// Transport form of an arbitrary value.
pub type SerializedValue = serde_json::Value;

/// Insertion-ordered props of a node.
pub type Props<V = SerializedValue> = IndexMap<String, V>;

/// One tree mutation.
///
/// Edge operations (`APPEND`, `INSERT`, `REMOVE`, `REORDER`) carry the parent
/// as `id`. `REF_CALL` carries the node issuing the call.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(bound(deserialize = "V: Deserialize<'de>"))]
pub struct Operation<V = SerializedValue> {
    pub id: NodeId,
    /// Capture time in unix milliseconds, stamped by the collector.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub timestamp: Option<i64>,
    #[serde(flatten)]
    pub kind: OperationKind<V>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(
    tag = "op",
    rename_all = "SCREAMING_SNAKE_CASE",
    bound(deserialize = "V: Deserialize<'de>")
)]
pub enum OperationKind<V = SerializedValue> {
    Create {
        #[serde(rename = "type")]
        node_type: String,
        #[serde(default)]
        props: Props<V>,
    },
    Update {
        #[serde(default)]
        props: Props<V>,
        #[serde(rename = "removedKeys", default)]
        removed_keys: Vec<String>,
    },
    Delete,
    Append {
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        #[serde(rename = "childId")]
        child_id: NodeId,
    },
    Insert {
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        #[serde(rename = "childId")]
        child_id: NodeId,
        index: usize,
    },
    Remove {
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        #[serde(rename = "childId")]
        child_id: NodeId,
    },
    Reorder {
        #[serde(rename = "parentId")]
        parent_id: NodeId,
        #[serde(rename = "childIds")]
        child_ids: Vec<NodeId>,
    },
    Text {
        text: String,
    },
    RefCall {
        #[serde(rename = "refId")]
        ref_id: NodeId,
        method: String,
        #[serde(default)]
        args: Vec<V>,
        #[serde(rename = "callId")]
        call_id: CallId,
    },
}

impl<V> Operation<V> {
    pub fn new(id: NodeId, kind: OperationKind<V>) -> Self {
        Self {
            id,
            timestamp: None,
            kind,
        }
    }

    pub fn create(id: NodeId, node_type: impl Into<String>, props: Props<V>) -> Self {
        Self::new(
            id,
            OperationKind::Create {
                node_type: node_type.into(),
                props,
            },
        )
    }

    pub fn update(id: NodeId, props: Props<V>, removed_keys: Vec<String>) -> Self {
        Self::new(id, OperationKind::Update { props, removed_keys })
    }

    pub fn delete(id: NodeId) -> Self {
        Self::new(id, OperationKind::Delete)
    }

    pub fn append(parent_id: NodeId, child_id: NodeId) -> Self {
        Self::new(parent_id, OperationKind::Append { parent_id, child_id })
    }

    pub fn insert(parent_id: NodeId, child_id: NodeId, index: usize) -> Self {
        Self::new(
            parent_id,
            OperationKind::Insert {
                parent_id,
                child_id,
                index,
            },
        )
    }

    pub fn remove(parent_id: NodeId, child_id: NodeId) -> Self {
        Self::new(parent_id, OperationKind::Remove { parent_id, child_id })
    }

    pub fn reorder(parent_id: NodeId, child_ids: Vec<NodeId>) -> Self {
        Self::new(parent_id, OperationKind::Reorder { parent_id, child_ids })
    }

    pub fn text(id: NodeId, text: impl Into<String>) -> Self {
        Self::new(id, OperationKind::Text { text: text.into() })
    }

    pub fn ref_call(
        id: NodeId,
        ref_id: NodeId,
        method: impl Into<String>,
        args: Vec<V>,
        call_id: CallId,
    ) -> Self {
        Self::new(
            id,
            OperationKind::RefCall {
                ref_id,
                method: method.into(),
                args,
                call_id,
            },
        )
    }

    pub fn with_timestamp(mut self, ts: i64) -> Self {
        self.timestamp = Some(ts);
        self
    }

    /// Wire name of the operation (`"CREATE"`, `"REF_CALL"`, ...).
    pub fn name(&self) -> &'static str {
        match &self.kind {
            OperationKind::Create { .. } => "CREATE",
            OperationKind::Update { .. } => "UPDATE",
            OperationKind::Delete => "DELETE",
            OperationKind::Append { .. } => "APPEND",
            OperationKind::Insert { .. } => "INSERT",
            OperationKind::Remove { .. } => "REMOVE",
            OperationKind::Reorder { .. } => "REORDER",
            OperationKind::Text { .. } => "TEXT",
            OperationKind::RefCall { .. } => "REF_CALL",
        }
    }

    /// Convert the prop values, keeping everything else.
    pub fn map_values<W>(self, f: &mut impl FnMut(V) -> W) -> Operation<W> {
        let kind = match self.kind {
            OperationKind::Create { node_type, props } => OperationKind::Create {
                node_type,
                props: props.into_iter().map(|(k, v)| (k, f(v))).collect(),
            },
            OperationKind::Update {
                props,
                removed_keys,
            } => OperationKind::Update {
                props: props.into_iter().map(|(k, v)| (k, f(v))).collect(),
                removed_keys,
            },
            OperationKind::Delete => OperationKind::Delete,
            OperationKind::Append {
                parent_id,
                child_id,
            } => OperationKind::Append {
                parent_id,
                child_id,
            },
            OperationKind::Insert {
                parent_id,
                child_id,
                index,
            } => OperationKind::Insert {
                parent_id,
                child_id,
                index,
            },
            OperationKind::Remove {
                parent_id,
                child_id,
            } => OperationKind::Remove {
                parent_id,
                child_id,
            },
            OperationKind::Reorder {
                parent_id,
                child_ids,
            } => OperationKind::Reorder {
                parent_id,
                child_ids,
            },
            OperationKind::Text { text } => OperationKind::Text { text },
            OperationKind::RefCall {
                ref_id,
                method,
                args,
                call_id,
            } => OperationKind::RefCall {
                ref_id,
                method,
                args: args.into_iter().map(&mut *f).collect(),
                call_id,
            },
        };
        Operation {
            id: self.id,
            timestamp: self.timestamp,
            kind,
        }
    }
}

/// An ordered group of operations, one per collector flush.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct OperationBatch<V = SerializedValue> {
    pub version: u32,
    #[serde(rename = "batchId")]
    pub batch_id: BatchId,
    pub operations: Vec<Operation<V>>,
}

impl<V> OperationBatch<V> {
    pub fn new(batch_id: BatchId, operations: Vec<Operation<V>>) -> Self {
        Self {
            version: PROTOCOL_VERSION,
            batch_id,
            operations,
        }
    }

    pub fn len(&self) -> usize {
        self.operations.len()
    }

    pub fn is_empty(&self) -> bool {
        self.operations.is_empty()
    }

    pub fn map_values<W>(self, f: &mut impl FnMut(V) -> W) -> OperationBatch<W> {
        OperationBatch {
            version: self.version,
            batch_id: self.batch_id,
            operations: self
                .operations
                .into_iter()
                .map(|op| op.map_values(f))
                .collect(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_operation_wire_shape() {
        let mut props = Props::new();
        props.insert("title".to_string(), json!("hi"));
        let op = Operation::create(3, "View", props).with_timestamp(1_700_000_000_000);

        let wire = serde_json::to_value(&op).unwrap();
        assert_eq!(
            wire,
            json!({"id": 3, "timestamp": 1_700_000_000_000i64, "op": "CREATE", "type": "View", "props": {"title": "hi"}})
        );
    }

    #[test]
    fn test_edge_and_ref_ops_parse_from_guest_json() {
        let ops: Vec<Operation> = serde_json::from_value(json!([
            {"id": 0, "op": "INSERT", "parentId": 0, "childId": 4, "index": 2},
            {"id": 0, "op": "REORDER", "parentId": 0, "childIds": [4, 3]},
            {"id": 4, "op": "REF_CALL", "refId": 4, "method": "focus", "args": [], "callId": 9},
            {"id": 4, "op": "UPDATE", "props": {}, "removedKeys": ["color"]},
            {"id": 4, "op": "DELETE"}
        ]))
        .unwrap();

        assert_eq!(ops[0].kind, OperationKind::Insert { parent_id: 0, child_id: 4, index: 2 });
        assert_eq!(ops[1].name(), "REORDER");
        assert!(matches!(&ops[2].kind, OperationKind::RefCall { method, call_id: 9, .. } if method == "focus"));
        assert!(matches!(&ops[3].kind, OperationKind::Update { removed_keys, .. } if removed_keys == &["color"]));
        assert_eq!(ops[4].kind, OperationKind::Delete);
    }

    #[test]
    fn test_map_values_keeps_structure() {
        let mut props = Props::new();
        props.insert("n".to_string(), json!(1));
        let batch = OperationBatch::new(7, vec![Operation::update(2, props, vec!["x".into()])]);
        let mapped = batch.map_values(&mut |v| v.to_string());

        assert_eq!(mapped.batch_id, 7);
        assert_eq!(mapped.version, PROTOCOL_VERSION);
        match &mapped.operations[0].kind {
            OperationKind::Update { props, removed_keys } => {
                assert_eq!(props["n"], "1");
                assert_eq!(removed_keys, &vec!["x".to_string()]);
            }
            other => panic!("unexpected {other:?}"),
        }
    }
}
