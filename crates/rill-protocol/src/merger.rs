//! Same-key collapsing of operations inside one batch.
//!
//! Rules, applied in this order:
//!
//! 1. `CREATE` … `DELETE` of the same id drops every operation on that id.
//! 2. Repeated `INSERT` of the same (parent, child) keeps only the last.
//! 3. Repeated `REORDER` of the same parent keeps only the last.
//! 4. Repeated `UPDATE` of the same id merges into the first one: props are a
//!    last-write-wins union and `removedKeys` holds only keys not re-added
//!    afterwards.
//!
//! Each collapse only happens where it cannot change the tree a receiver ends
//! up with:
//!
//! - a created-then-deleted node must never act as a parent, a `REORDER`
//!   member or a ref target, and its parent must see no `INSERT` of another
//!   child or `REORDER` while the node is linked under it;
//! - `INSERT` dedupe stops at any other `APPEND`, `INSERT` or `REORDER`, and
//!   at a `CREATE`/`DELETE` of either end. Where a node sits decides whether a
//!   later link would form a cycle, so no link may observe the difference;
//! - a `REORDER` is dropped only if the next one on that parent lists every
//!   child it listed, nothing in between links or reorders anything, and
//!   nothing in between removes, creates or deletes that parent or the listed
//!   nodes;
//! - `UPDATE` merging stops at `TEXT`, `CREATE`, `DELETE` or `REF_CALL` on the
//!   same node.
//!
//! Operations on unrelated ids never change relative order.

use std::collections::{HashMap, HashSet};

use rill_types::{NodeId, Operation, OperationKind, Props};

/// Batch optimizer run just before a batch leaves the guest.
#[derive(Debug, Clone)]
pub struct OperationMerger {
    pub collapse_create_delete: bool,
    pub dedupe_inserts: bool,
    pub last_reorder_wins: bool,
    pub merge_updates: bool,
}

impl Default for OperationMerger {
    fn default() -> Self {
        Self::new()
    }
}

impl OperationMerger {
    /// All rules enabled.
    pub fn new() -> Self {
        Self {
            collapse_create_delete: true,
            dedupe_inserts: true,
            last_reorder_wins: true,
            merge_updates: true,
        }
    }

    pub fn merge<V>(&self, ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
        let mut ops = ops;
        if self.collapse_create_delete {
            ops = collapse_create_delete(ops);
        }
        if self.dedupe_inserts {
            ops = dedupe_inserts(ops);
        }
        if self.last_reorder_wins {
            ops = last_reorder_wins(ops);
        }
        if self.merge_updates {
            ops = merge_updates(ops);
        }
        ops
    }
}

/// Every node id an operation refers to.
fn touched_ids<V>(op: &Operation<V>) -> Vec<NodeId> {
    match &op.kind {
        OperationKind::Append {
            parent_id,
            child_id,
        }
        | OperationKind::Insert {
            parent_id,
            child_id,
            ..
        }
        | OperationKind::Remove {
            parent_id,
            child_id,
        } => vec![*parent_id, *child_id],
        OperationKind::Reorder {
            parent_id,
            child_ids,
        } => std::iter::once(*parent_id)
            .chain(child_ids.iter().copied())
            .collect(),
        OperationKind::RefCall { ref_id, .. } => vec![op.id, *ref_id],
        _ => vec![op.id],
    }
}

fn is_create_of<V>(op: &Operation<V>, id: NodeId) -> bool {
    op.id == id && matches!(op.kind, OperationKind::Create { .. })
}

fn is_delete_of<V>(op: &Operation<V>, id: NodeId) -> bool {
    op.id == id && matches!(op.kind, OperationKind::Delete)
}

// ============================================================================
// CREATE … DELETE
// ============================================================================

fn collapse_create_delete<V>(ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
    let mut touches: HashMap<NodeId, Vec<usize>> = HashMap::new();
    let mut excluded: HashSet<NodeId> = HashSet::new();
    // Parent -> positions of ops whose effect depends on sibling indices.
    let mut index_ops: HashMap<NodeId, Vec<usize>> = HashMap::new();

    for (i, op) in ops.iter().enumerate() {
        for id in touched_ids(op) {
            touches.entry(id).or_default().push(i);
        }
        match &op.kind {
            OperationKind::Append { parent_id, .. } | OperationKind::Remove { parent_id, .. } => {
                excluded.insert(*parent_id);
            }
            OperationKind::Insert { parent_id, .. } => {
                excluded.insert(*parent_id);
                index_ops.entry(*parent_id).or_default().push(i);
            }
            OperationKind::Reorder {
                parent_id,
                child_ids,
            } => {
                excluded.insert(*parent_id);
                excluded.extend(child_ids.iter().copied());
                index_ops.entry(*parent_id).or_default().push(i);
            }
            OperationKind::RefCall { ref_id, .. } => {
                excluded.insert(op.id);
                excluded.insert(*ref_id);
            }
            _ => {}
        }
    }

    let mut dropped: HashSet<usize> = HashSet::new();
    for (i, op) in ops.iter().enumerate() {
        let id = op.id;
        if !matches!(op.kind, OperationKind::Create { .. }) || excluded.contains(&id) {
            continue;
        }
        let Some(idxs) = touches.get(&id) else {
            continue;
        };
        let (Some(&first), Some(&last)) = (idxs.first(), idxs.last()) else {
            continue;
        };
        if first != i || !is_delete_of(&ops[last], id) {
            continue;
        }
        let creates = idxs.iter().filter(|&&j| is_create_of(&ops[j], id)).count();
        let deletes = idxs.iter().filter(|&&j| is_delete_of(&ops[j], id)).count();
        if creates != 1 || deletes != 1 {
            continue;
        }
        if !position_neutral(&ops, id, idxs, &index_ops) {
            continue;
        }
        dropped.extend(idxs.iter().copied());
    }

    if dropped.is_empty() {
        return ops;
    }
    ops.into_iter()
        .enumerate()
        .filter(|(i, _)| !dropped.contains(i))
        .map(|(_, op)| op)
        .collect()
}

/// True if no sibling-index-sensitive op hits a parent while `id` is linked
/// under it, so dropping `id` cannot shift anyone else's position.
fn position_neutral<V>(
    ops: &[Operation<V>],
    id: NodeId,
    idxs: &[usize],
    index_ops: &HashMap<NodeId, Vec<usize>>,
) -> bool {
    let conflicts = |parent: NodeId, since: usize, until: usize| {
        index_ops.get(&parent).is_some_and(|positions| {
            positions.iter().any(|&k| {
                k > since
                    && k < until
                    && !matches!(ops[k].kind, OperationKind::Insert { child_id, .. } if child_id == id)
            })
        })
    };

    let mut linked: Option<(NodeId, usize)> = None;
    for &j in idxs {
        match &ops[j].kind {
            OperationKind::Append {
                parent_id,
                child_id,
            }
            | OperationKind::Insert {
                parent_id,
                child_id,
                ..
            } if *child_id == id => {
                if let Some((parent, since)) = linked {
                    if conflicts(parent, since, j) {
                        return false;
                    }
                }
                linked = Some((*parent_id, j));
            }
            OperationKind::Remove {
                parent_id,
                child_id,
            } if *child_id == id => {
                if let Some((parent, since)) = linked {
                    if parent == *parent_id {
                        if conflicts(parent, since, j) {
                            return false;
                        }
                        linked = None;
                    }
                }
            }
            OperationKind::Delete if ops[j].id == id => {
                if let Some((parent, since)) = linked {
                    if conflicts(parent, since, j) {
                        return false;
                    }
                }
            }
            _ => {}
        }
    }
    true
}

// ============================================================================
// INSERT
// ============================================================================

fn dedupe_inserts<V>(ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
    let mut slots: Vec<Option<Operation<V>>> = ops.into_iter().map(Some).collect();
    let mut open: HashMap<(NodeId, NodeId), usize> = HashMap::new();

    for i in 0..slots.len() {
        enum Step {
            Insert(NodeId, NodeId),
            Link,
            Lifecycle(NodeId),
            Other,
        }
        let step = match slots[i].as_ref().map(|op| (op.id, &op.kind)) {
            Some((_, OperationKind::Insert { parent_id, child_id, .. })) => {
                Step::Insert(*parent_id, *child_id)
            }
            Some((_, OperationKind::Append { .. } | OperationKind::Reorder { .. })) => Step::Link,
            Some((id, OperationKind::Create { .. } | OperationKind::Delete)) => Step::Lifecycle(id),
            _ => Step::Other,
        };

        match step {
            Step::Insert(parent, child) => {
                open.retain(|&key, _| key == (parent, child));
                if let Some(prev) = open.insert((parent, child), i) {
                    slots[prev] = None;
                }
            }
            Step::Link => open.clear(),
            Step::Lifecycle(id) => {
                open.retain(|&(p, c), _| p != id && c != id);
            }
            Step::Other => {}
        }
    }

    slots.into_iter().flatten().collect()
}

// ============================================================================
// REORDER
// ============================================================================

fn last_reorder_wins<V>(ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
    let mut slots: Vec<Option<Operation<V>>> = ops.into_iter().map(Some).collect();
    let n = slots.len();

    for i in 0..n {
        let Some((parent, earlier)) = reorder_of(slots[i].as_ref()) else {
            continue;
        };
        let earlier = earlier.to_vec();
        let Some(j) = (i + 1..n).find(|&j| {
            reorder_of(slots[j].as_ref()).is_some_and(|(p, _)| p == parent)
        }) else {
            continue;
        };
        let later = match reorder_of(slots[j].as_ref()) {
            Some((_, ids)) => ids.to_vec(),
            None => continue,
        };
        if !earlier.iter().all(|c| later.contains(c)) {
            continue;
        }

        let members: HashSet<NodeId> = earlier.iter().chain(later.iter()).copied().collect();
        let undisturbed = slots[i + 1..j]
            .iter()
            .flatten()
            .all(|op| !disturbs_children(op, parent, &members));
        if undisturbed {
            slots[i] = None;
        }
    }

    slots.into_iter().flatten().collect()
}

fn reorder_of<V>(op: Option<&Operation<V>>) -> Option<(NodeId, &[NodeId])> {
    match op.map(|op| &op.kind) {
        Some(OperationKind::Reorder {
            parent_id,
            child_ids,
        }) => Some((*parent_id, child_ids.as_slice())),
        _ => None,
    }
}

/// Any link counts: the skipped reorder moves nodes, which changes both
/// sibling indices elsewhere and the ancestry a cycle check walks.
fn disturbs_children<V>(op: &Operation<V>, parent: NodeId, members: &HashSet<NodeId>) -> bool {
    match &op.kind {
        OperationKind::Append { .. } | OperationKind::Insert { .. } | OperationKind::Reorder { .. } => {
            true
        }
        OperationKind::Remove {
            parent_id,
            child_id,
        } => *parent_id == parent || members.contains(child_id),
        OperationKind::Create { .. } | OperationKind::Delete => {
            op.id == parent || members.contains(&op.id)
        }
        _ => false,
    }
}

// ============================================================================
// UPDATE
// ============================================================================

fn merge_updates<V>(ops: Vec<Operation<V>>) -> Vec<Operation<V>> {
    let mut out: Vec<Operation<V>> = Vec::with_capacity(ops.len());
    let mut open: HashMap<NodeId, usize> = HashMap::new();

    for op in ops {
        let id = op.id;
        let closes: Option<NodeId> = match &op.kind {
            OperationKind::Update { .. } => {
                let Some(&target) = open.get(&id) else {
                    open.insert(id, out.len());
                    out.push(op);
                    continue;
                };
                if let (
                    OperationKind::Update {
                        props,
                        removed_keys,
                    },
                    OperationKind::Update {
                        props: later_props,
                        removed_keys: later_removed,
                    },
                ) = (&mut out[target].kind, op.kind)
                {
                    fold_update(props, removed_keys, later_props, later_removed);
                }
                continue;
            }
            OperationKind::Text { .. } | OperationKind::Create { .. } | OperationKind::Delete => None,
            OperationKind::RefCall { ref_id, .. } => Some(*ref_id),
            _ => {
                out.push(op);
                continue;
            }
        };
        open.remove(&id);
        if let Some(other) = closes {
            open.remove(&other);
        }
        out.push(op);
    }

    out
}

/// Apply a later update on top of an earlier one. Removals of an update apply
/// before its sets, matching the receiver.
fn fold_update<V>(
    props: &mut Props<V>,
    removed: &mut Vec<String>,
    later_props: Props<V>,
    later_removed: Vec<String>,
) {
    for key in later_removed {
        props.shift_remove(&key);
        if !removed.contains(&key) {
            removed.push(key);
        }
    }
    for (key, value) in later_props {
        removed.retain(|r| r != &key);
        props.insert(key, value);
    }
}
