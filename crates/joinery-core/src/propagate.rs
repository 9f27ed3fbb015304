//! Transitive constant propagation across join equalities.
//!
//! Join components tie a near-side field to a far-side field. Fields tied
//! together form an equivalence class (per chain position); a constant known
//! for one member holds for all of them, so it is copied onto every member
//! that lacks one. Conflicting constants intersect, and an empty intersection
//! collapses to `None`.

use crate::attribute::Attribute;
use crate::mapper::Mapper;
use crate::operation::Operation;
use crate::stack::MapperStack;
use ahash::AHashMap;
use joinery_model::{Field, Value};
use std::collections::BTreeSet;

type Node = (MapperStack, Field);

#[derive(Debug, Default)]
pub struct TransitivePropagator {
    nodes: Vec<Node>,
    ids: AHashMap<Node, usize>,
    parent: Vec<usize>,
    constants: AHashMap<usize, BTreeSet<Value>>,
}

impl TransitivePropagator {
    pub fn new() -> Self {
        Self::default()
    }

    /// `op` with every implied `field in (...)` made explicit.
    pub fn propagate(op: &Operation) -> Operation {
        let mut propagator = Self::new();
        propagator.collect(op, &MapperStack::root());

        let inserts = propagator.inserts();
        if inserts.is_empty() {
            return op.clone();
        }
        tracing::trace!(
            predicates = inserts.values().map(Vec::len).sum::<usize>(),
            positions = inserts.len(),
            "propagated join constants"
        );
        rewrite(op, &MapperStack::root(), &inserts)
    }

    fn node(&mut self, stack: &MapperStack, field: &Field) -> usize {
        let key = (stack.clone(), field.clone());
        if let Some(&id) = self.ids.get(&key) {
            return id;
        }
        let id = self.nodes.len();
        self.nodes.push(key.clone());
        self.parent.push(id);
        self.ids.insert(key, id);
        id
    }

    fn find(&mut self, mut id: usize) -> usize {
        while self.parent[id] != id {
            self.parent[id] = self.parent[self.parent[id]];
            id = self.parent[id];
        }
        id
    }

    fn union(&mut self, a: usize, b: usize) {
        let (ra, rb) = (self.find(a), self.find(b));
        if ra != rb {
            self.parent[rb] = ra;
        }
    }

    fn constrain(&mut self, stack: &MapperStack, field: &Field, values: BTreeSet<Value>) {
        let id = self.node(stack, field);
        self.constants
            .entry(id)
            .and_modify(|known| known.retain(|v| values.contains(v)))
            .or_insert(values);
    }

    fn collect(&mut self, op: &Operation, stack: &MapperStack) {
        for conjunct in op.conjuncts() {
            match conjunct {
                Operation::Eq(field, value) if !value.is_null() => {
                    self.constrain(stack, field, BTreeSet::from([value.clone()]));
                }
                Operation::In(field, values) => {
                    self.constrain(stack, field, values.iter().cloned().collect());
                }
                Operation::Mapped(mapped) => {
                    let far = mapped.mapper().far_position(stack);
                    self.collect_mapper(mapped.mapper(), stack, &far);
                    self.collect(mapped.underlying(), &far);
                }
                _ => {}
            }
        }
    }

    fn collect_mapper(&mut self, mapper: &Mapper, stack: &MapperStack, far: &MapperStack) {
        if let Mapper::Filtered(filtered) = mapper {
            if let Some(pre) = filtered.pre_filter() {
                self.collect(pre, stack);
            }
            if let Some(post) = filtered.post_filter() {
                self.collect(post, far);
            }
        }
        for component in mapper.equality_components() {
            if !component.adds_to_where_clause() {
                continue;
            }
            if let (Attribute::Direct(left), Attribute::Direct(right)) =
                (component.left(), component.right())
            {
                let a = self.node(stack, left);
                let b = self.node(far, right);
                self.union(a, b);
            }
        }
    }

    /// Predicates to add, keyed by position.
    fn inserts(&mut self) -> AHashMap<MapperStack, Vec<Operation>> {
        let mut classes: AHashMap<usize, Option<BTreeSet<Value>>> = AHashMap::new();
        let constrained: Vec<(usize, BTreeSet<Value>)> =
            self.constants.iter().map(|(id, v)| (*id, v.clone())).collect();
        for (id, values) in constrained {
            let root = self.find(id);
            let slot = classes.entry(root).or_insert(None);
            *slot = Some(match slot.take() {
                Some(known) => known.intersection(&values).cloned().collect(),
                None => values,
            });
        }

        let mut inserts: AHashMap<MapperStack, Vec<Operation>> = AHashMap::new();
        for id in 0..self.nodes.len() {
            if self.constants.contains_key(&id) {
                continue;
            }
            let root = self.find(id);
            let Some(Some(values)) = classes.get(&root) else {
                continue;
            };
            let (stack, field) = &self.nodes[id];
            inserts
                .entry(stack.clone())
                .or_default()
                .push(Operation::in_values(field, values.iter().cloned()));
        }
        inserts
    }
}

fn rewrite(
    op: &Operation,
    stack: &MapperStack,
    inserts: &AHashMap<MapperStack, Vec<Operation>>,
) -> Operation {
    let parts = op.conjuncts().iter().map(|conjunct| match conjunct {
        Operation::Mapped(mapped) => {
            let far = mapped.mapper().far_position(stack);
            Operation::mapped(
                mapped.mapper().clone(),
                rewrite(mapped.underlying(), &far, inserts),
            )
        }
        other => other.clone(),
    });
    let extra = inserts.get(stack).cloned().unwrap_or_default();
    Operation::and_all(parts.chain(extra)).unwrap_or_else(|| op.clone())
}
