//! The per-space op DAG.

use std::collections::{BTreeMap, BTreeSet, HashSet};

use crate::op::{Op, OpId};

/// A space's operation DAG. Never stores back-references from ops to heads;
/// heads are derived as "ops no other op names as parent".
#[derive(Debug, Default)]
pub struct SpaceDag {
    ops: BTreeMap<OpId, Op>,
    referenced: HashSet<OpId>,
    max_lamport: u64,
}

impl SpaceDag {
    /// Empty DAG.
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert an op. Returns false (and changes nothing) when the id is
    /// already present — all mutations accept duplicates without error.
    pub fn add_op(&mut self, op: Op) -> bool {
        if self.ops.contains_key(&op.op_id) {
            return false;
        }
        self.max_lamport = self.max_lamport.max(op.lamport);
        for parent in &op.parents {
            self.referenced.insert(*parent);
        }
        self.ops.insert(op.op_id, op);
        true
    }

    /// Lamport value for the next local op:
    /// `max(self, max(parents)) + 1` collapses to `max_seen + 1` because
    /// every parent is already counted in `max_seen`.
    pub fn next_lamport(&self) -> u64 {
        self.max_lamport + 1
    }

    /// Current heads: ops without known children, in id order.
    pub fn heads(&self) -> Vec<OpId> {
        self.ops
            .keys()
            .filter(|id| !self.referenced.contains(id))
            .copied()
            .collect()
    }

    /// All op ids, ascending.
    pub fn op_ids(&self) -> Vec<OpId> {
        self.ops.keys().copied().collect()
    }

    /// Number of ops.
    pub fn len(&self) -> usize {
        self.ops.len()
    }

    /// Whether the DAG holds no ops.
    pub fn is_empty(&self) -> bool {
        self.ops.is_empty()
    }

    /// Whether an op id is present.
    pub fn contains(&self, id: &OpId) -> bool {
        self.ops.contains_key(id)
    }

    /// Fetch one op.
    pub fn get(&self, id: &OpId) -> Option<&Op> {
        self.ops.get(id)
    }

    /// Ids from `offered` that this DAG does not hold.
    pub fn missing_from(&self, offered: &[OpId]) -> Vec<OpId> {
        offered
            .iter()
            .filter(|id| !self.ops.contains_key(id))
            .copied()
            .collect()
    }

    /// Ops in total order `(lamport, op_id)`.
    pub fn total_order(&self) -> Vec<&Op> {
        let mut ops: Vec<&Op> = self.ops.values().collect();
        ops.sort_by_key(|op| op.order_key());
        ops
    }

    /// Op id set, for set-equality assertions.
    pub fn id_set(&self) -> BTreeSet<OpId> {
        self.ops.keys().copied().collect()
    }
}
