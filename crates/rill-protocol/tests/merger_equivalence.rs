//! The merger may drop and fold operations, but a receiver must end up with
//! the same tree, and answer the same ref calls, either way.

use std::cell::RefCell;
use std::rc::Rc;

use proptest::collection::vec;
use proptest::prelude::*;
use rill_protocol::{NodeInstance, OperationMerger, Receiver};
use rill_types::{BridgeMessage, NodeId, Operation, OperationBatch, OperationKind, Props, Value};
use serde_json::json;

const KEYS: [&str; 3] = ["a", "b", "text"];

fn setup_ops() -> Vec<Operation> {
    let mut ops: Vec<Operation> = (1..5)
        .map(|id| Operation::create(id, "View", Props::new()))
        .collect();
    ops.extend([
        Operation::append(0, 1),
        Operation::append(0, 2),
        Operation::append(1, 3),
        Operation::append(1, 4),
    ]);
    ops
}

fn node() -> impl Strategy<Value = NodeId> {
    0u64..10
}

fn op_strategy() -> impl Strategy<Value = Operation> {
    prop_oneof![
        // Guest ids are never reused, so new nodes come from a fresh range.
        (5u64..10).prop_map(|id| Operation::create(id, "View", Props::new())),
        (1u64..10, 0usize..3, 0i64..3, proptest::option::of(0usize..3)).prop_map(
            |(id, key, value, removed)| {
                let mut props = Props::new();
                props.insert(KEYS[key].to_string(), json!(value));
                let removed = removed.map(|k| vec![KEYS[k].to_string()]).unwrap_or_default();
                Operation::update(id, props, removed)
            }
        ),
        (1u64..10).prop_map(Operation::delete),
        (node(), 1u64..10).prop_map(|(p, c)| Operation::append(p, c)),
        (node(), 1u64..10, 0usize..4).prop_map(|(p, c, i)| Operation::insert(p, c, i)),
        (node(), 1u64..10).prop_map(|(p, c)| Operation::remove(p, c)),
        (node(), vec(1u64..10, 0..4)).prop_map(|(p, ids)| Operation::reorder(p, ids)),
        (1u64..10, 0u8..3).prop_map(|(id, t)| Operation::text(id, format!("t{t}"))),
        (1u64..10, 0u8..2).prop_map(|(id, m)| {
            let method = if m == 0 { "focus" } else { "measure" };
            Operation::ref_call(id, id, method, vec![json!(m)], 0)
        }),
    ]
}

/// Single operations, plus the unlink-then-free pair a guest emits when it
/// drops a subtree.
fn step_strategy() -> impl Strategy<Value = Vec<Operation>> {
    prop_oneof![
        4 => op_strategy().prop_map(|op| vec![op]),
        1 => (node(), 1u64..10).prop_map(|(p, c)| vec![Operation::remove(p, c), Operation::delete(c)]),
    ]
}

fn batch_strategy() -> impl Strategy<Value = Vec<Operation>> {
    vec(step_strategy(), 0..30).prop_map(|steps| {
        let mut ops: Vec<Operation> = steps.into_iter().flatten().collect();
        for (i, op) in ops.iter_mut().enumerate() {
            if let OperationKind::RefCall { call_id, .. } = &mut op.kind {
                *call_id = i as u64 + 1;
            }
        }
        ops
    })
}

/// Answers with what the node looks like at call time.
fn describe(node: &NodeInstance, method: &str, _args: Vec<Value>) -> Result<Value, Value> {
    let mut props: Vec<String> = node.props.iter().map(|(k, v)| format!("{k}={v:?}")).collect();
    props.sort();
    Ok(Value::from(format!("{}.{}({})", node.node_type, method, props.join(","))))
}

fn apply(ops: Vec<Operation>) -> (Receiver, Vec<BridgeMessage<Value>>) {
    fn decode(v: serde_json::Value) -> Value {
        Value::from_json(&v)
    }

    let sent = Rc::new(RefCell::new(Vec::new()));
    let sink = sent.clone();
    let mut receiver = Receiver::new(10_000)
        .with_sender(move |msg| sink.borrow_mut().push(msg))
        .with_ref_handler(describe);
    receiver.apply_batch(OperationBatch::new(1, setup_ops()).map_values(&mut decode));
    receiver.apply_batch(OperationBatch::new(2, ops).map_values(&mut decode));
    let sent = sent.borrow().clone();
    (receiver, sent)
}

proptest! {
    #[test]
    fn merged_batches_build_the_same_tree(ops in batch_strategy()) {
        let merged = OperationMerger::new().merge(ops.clone());
        prop_assert!(merged.len() <= ops.len());

        let (plain, plain_sent) = apply(ops);
        let (optimized, optimized_sent) = apply(merged);
        prop_assert_eq!(plain.nodes(), optimized.nodes());
        prop_assert_eq!(plain_sent, optimized_sent);
    }
}

#[test]
fn test_merge_of_typical_render_pass() {
    let mut ops = Vec::new();
    for id in 5..9 {
        ops.push(Operation::create(id, "Row", Props::new()));
        ops.push(Operation::append(1, id));
    }
    // A state change inside the same tick rewrites rows and drops one.
    for id in 5..9 {
        let mut props = Props::new();
        props.insert("a".to_string(), json!(id));
        ops.push(Operation::update(id, props, vec![]));
    }
    ops.push(Operation::remove(1, 6));
    ops.push(Operation::delete(6));
    ops.push(Operation::reorder(1, vec![3, 4, 5, 7, 8]));
    ops.push(Operation::reorder(1, vec![8, 7, 5, 4, 3]));

    let merged = OperationMerger::new().merge(ops.clone());
    assert!(merged.len() < ops.len());

    let (plain, _) = apply(ops);
    let (optimized, _) = apply(merged);
    assert_eq!(plain.nodes(), optimized.nodes());
    assert_eq!(optimized.children_of(1), &[8, 7, 5, 4, 3]);
}

#[test]
fn test_ref_call_sees_updates_made_before_it() {
    let mut first = Props::new();
    first.insert("a".to_string(), json!(1));
    let mut second = Props::new();
    second.insert("a".to_string(), json!(2));
    let ops = vec![
        Operation::update(3, first, vec![]),
        Operation::ref_call(3, 3, "focus", vec![], 1),
        Operation::update(3, second, vec![]),
        Operation::remove(1, 4),
        Operation::delete(4),
        Operation::ref_call(4, 4, "focus", vec![], 2),
    ];

    let merged = OperationMerger::new().merge(ops.clone());
    assert_eq!(merged.len(), ops.len());

    let (_, sent) = apply(merged);
    assert_eq!(sent.len(), 2);
    match &sent[0] {
        BridgeMessage::RefMethodResult { call_id: 1, result: Some(v), .. } => {
            assert_eq!(v.as_str(), Some("View.focus(a=1)"));
        }
        other => panic!("unexpected {other:?}"),
    }
    assert!(matches!(&sent[1], BridgeMessage::RefMethodResult { call_id: 2, error: Some(_), .. }));
}
