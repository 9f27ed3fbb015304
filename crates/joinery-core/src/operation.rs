//! Predicate nodes.
//!
//! An [`Operation`] is a conjunction-friendly predicate over one entity. The
//! only cross-entity node is [`Operation::Mapped`]: "objects of the mapper's
//! near entity related through the mapper to far objects satisfying
//! `underlying`".
//!
//! General predicate evaluation stays minimal; [`Operation::evaluate`] covers
//! what filtered mappers and the reference cache need, and reports `None` for
//! nodes that cannot be decided from one object.

use crate::mapper::Mapper;
use joinery_model::{DomainObject, EntityName, Field, ObjectRef, Value};
use std::cmp::Ordering;
use std::fmt;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum CompareOp {
    Lt,
    Le,
    Gt,
    Ge,
    Ne,
}

impl CompareOp {
    pub fn sql(&self) -> &'static str {
        match self {
            CompareOp::Lt => "<",
            CompareOp::Le => "<=",
            CompareOp::Gt => ">",
            CompareOp::Ge => ">=",
            CompareOp::Ne => "<>",
        }
    }

    fn holds(&self, ordering: Ordering) -> bool {
        match self {
            CompareOp::Lt => ordering == Ordering::Less,
            CompareOp::Le => ordering != Ordering::Greater,
            CompareOp::Gt => ordering == Ordering::Greater,
            CompareOp::Ge => ordering != Ordering::Less,
            CompareOp::Ne => ordering != Ordering::Equal,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Operation {
    /// Every object of the entity.
    All(EntityName),
    /// No object of the entity.
    None(EntityName),
    Eq(Field, Value),
    /// Sorted, deduplicated, null-free values.
    In(Field, Vec<Value>),
    Compare(Field, CompareOp, Value),
    IsNull(Field),
    /// Temporal pin: the object's milestone contains the date.
    AsOfEq(Field, Value),
    And(Vec<Operation>),
    Mapped(MappedOperation),
}

impl Operation {
    pub fn all(entity: &EntityName) -> Self {
        Operation::All(entity.clone())
    }

    pub fn eq(field: &Field, value: impl Into<Value>) -> Self {
        Operation::Eq(field.clone(), value.into())
    }

    /// `field in (values)`. Nulls never match and are dropped; an empty list
    /// collapses to `None` and a single value to `Eq`.
    pub fn in_values(field: &Field, values: impl IntoIterator<Item = Value>) -> Self {
        let mut values: Vec<Value> = values.into_iter().filter(|v| !v.is_null()).collect();
        values.sort();
        values.dedup();
        match values.len() {
            0 => Operation::None(field.owner().clone()),
            1 => Operation::Eq(field.clone(), values.remove(0)),
            _ => Operation::In(field.clone(), values),
        }
    }

    pub fn compare(field: &Field, op: CompareOp, value: impl Into<Value>) -> Self {
        Operation::Compare(field.clone(), op, value.into())
    }

    pub fn is_null(field: &Field) -> Self {
        Operation::IsNull(field.clone())
    }

    pub fn as_of_eq(field: &Field, date: impl Into<Value>) -> Self {
        Operation::AsOfEq(field.clone(), date.into())
    }

    pub fn mapped(mapper: impl Into<Mapper>, underlying: Operation) -> Self {
        Operation::Mapped(MappedOperation::new(mapper.into(), underlying))
    }

    /// AND of `ops`; `None` when `ops` is empty.
    pub fn and_all(ops: impl IntoIterator<Item = Operation>) -> Option<Operation> {
        ops.into_iter().reduce(|acc, op| acc.and(&op))
    }

    /// Entity whose objects this predicate selects.
    pub fn result_entity(&self) -> Option<&EntityName> {
        match self {
            Operation::All(entity) | Operation::None(entity) => Some(entity),
            Operation::Eq(field, _)
            | Operation::In(field, _)
            | Operation::Compare(field, _, _)
            | Operation::IsNull(field)
            | Operation::AsOfEq(field, _) => Some(field.owner()),
            Operation::And(ops) => ops.first().and_then(Operation::result_entity),
            Operation::Mapped(mapped) => Some(mapped.mapper.near_entity()),
        }
    }

    /// Top-level conjuncts.
    pub fn conjuncts(&self) -> &[Operation] {
        match self {
            Operation::And(ops) => ops,
            other => std::slice::from_ref(other),
        }
    }

    /// Field constrained by an atomic predicate.
    pub fn atomic_field(&self) -> Option<&Field> {
        match self {
            Operation::Eq(field, _)
            | Operation::In(field, _)
            | Operation::Compare(field, _, _)
            | Operation::IsNull(field)
            | Operation::AsOfEq(field, _) => Some(field),
            _ => None,
        }
    }

    pub fn is_atomic(&self) -> bool {
        self.atomic_field().is_some()
    }

    pub fn mapped_operations(&self) -> impl Iterator<Item = &MappedOperation> {
        self.conjuncts().iter().filter_map(|op| match op {
            Operation::Mapped(mapped) => Some(mapped),
            _ => None,
        })
    }

    /// Logical AND. Flattens conjunctions, drops redundant `All`, short-cuts
    /// on `None` and folds mapped operations that can share one join.
    pub fn and(&self, other: &Operation) -> Operation {
        let mut parts: Vec<Operation> = Vec::new();
        for op in self.conjuncts().iter().chain(other.conjuncts()) {
            if let Operation::None(entity) = op {
                return Operation::None(entity.clone());
            }
            if parts.contains(op) {
                continue;
            }
            if let Operation::Mapped(incoming) = op {
                let merged = parts.iter().enumerate().find_map(|(i, existing)| match existing {
                    Operation::Mapped(current) => current.combine(incoming).map(|c| (i, c)),
                    _ => None,
                });
                if let Some((i, combined)) = merged {
                    parts[i] = Operation::Mapped(combined);
                    continue;
                }
            }
            parts.push(op.clone());
        }

        if parts.len() > 1 {
            let has_other = parts.iter().any(|op| !matches!(op, Operation::All(_)));
            if has_other {
                parts.retain(|op| !matches!(op, Operation::All(_)));
            }
        }

        if parts.len() == 1 {
            parts.remove(0)
        } else {
            Operation::And(parts)
        }
    }

    /// Does a top-level atomic conjunct constrain `field`?
    pub fn depends_on(&self, field: &Field) -> bool {
        self.conjuncts()
            .iter()
            .any(|op| op.atomic_field() == Some(field))
    }

    /// The same atomic predicate with `from` replaced by `to`.
    pub fn substitute_other_attribute(&self, from: &Field, to: &Field) -> Option<Operation> {
        if self.atomic_field() != Some(from) {
            return None;
        }
        let substituted = match self {
            Operation::Eq(_, value) => Operation::Eq(to.clone(), value.clone()),
            Operation::In(_, values) => Operation::In(to.clone(), values.clone()),
            Operation::Compare(_, op, value) => Operation::Compare(to.clone(), *op, value.clone()),
            Operation::IsNull(_) => Operation::IsNull(to.clone()),
            Operation::AsOfEq(_, value) => Operation::AsOfEq(to.clone(), value.clone()),
            _ => return None,
        };
        Some(substituted)
    }

    /// Evaluate against one object; `None` when the node needs the cache.
    pub fn evaluate(&self, object: &DomainObject) -> Option<bool> {
        match self {
            Operation::All(entity) => Some(object.entity() == entity),
            Operation::None(_) => Some(false),
            Operation::Eq(field, value) => {
                Some(!value.is_null() && object.value_of(field) == value)
            }
            Operation::In(field, values) => {
                let actual = object.value_of(field);
                Some(!actual.is_null() && values.binary_search(actual).is_ok())
            }
            Operation::Compare(field, op, value) => {
                let actual = object.value_of(field);
                if actual.is_null() || value.is_null() {
                    return Some(false);
                }
                Some(op.holds(actual.cmp(value)))
            }
            Operation::IsNull(field) => Some(object.value_of(field).is_null()),
            Operation::AsOfEq(field, date) => Some(as_of_matches(object, field, date)),
            Operation::And(ops) => {
                let mut undecided = false;
                for op in ops {
                    match op.evaluate(object) {
                        Some(false) => return Some(false),
                        Some(true) => {}
                        None => undecided = true,
                    }
                }
                if undecided {
                    None
                } else {
                    Some(true)
                }
            }
            Operation::Mapped(_) => None,
        }
    }

    /// Keep the objects this predicate accepts; `None` if any is undecidable.
    pub fn filter(&self, objects: Vec<ObjectRef>) -> Option<Vec<ObjectRef>> {
        let mut kept = Vec::with_capacity(objects.len());
        for object in objects {
            if self.evaluate(&object)? {
                kept.push(object);
            }
        }
        Some(kept)
    }

    /// Push constant bounds on mapper left attributes through to the right
    /// side of every mapped conjunct, recursively down the chain.
    pub fn with_substituted_equalities(&self) -> Operation {
        let conjuncts = self.conjuncts();
        let rewritten: Vec<Operation> = conjuncts
            .iter()
            .map(|op| match op {
                Operation::Mapped(mapped) => mapped
                    .substitute_equalities(conjuncts)
                    .map(Operation::Mapped)
                    .unwrap_or_else(|| op.clone()),
                other => other.clone(),
            })
            .collect();
        Operation::and_all(rewritten).unwrap_or_else(|| self.clone())
    }
}

/// An as-of object carries its milestone under the field's `from`/`to`
/// columns (an open `to` is null). Objects without milestone values compare
/// the attribute value directly.
fn as_of_matches(object: &DomainObject, field: &Field, date: &Value) -> bool {
    if date.is_null() || object.entity() != field.owner() {
        return false;
    }
    if let Some((from_column, to_column)) = field.milestone_columns() {
        let from = object.value(from_column);
        if !from.is_null() {
            let to = object.value(to_column);
            return from <= date && (to.is_null() || date < to);
        }
    }
    object.value_of(field) == date
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Operation::All(entity) => write!(f, "all({entity})"),
            Operation::None(entity) => write!(f, "none({entity})"),
            Operation::Eq(field, value) => write!(f, "{field} = {value}"),
            Operation::In(field, values) => {
                write!(f, "{field} in (")?;
                for (i, value) in values.iter().enumerate() {
                    if i > 0 {
                        f.write_str(", ")?;
                    }
                    write!(f, "{value}")?;
                }
                f.write_str(")")
            }
            Operation::Compare(field, op, value) => write!(f, "{field} {} {value}", op.sql()),
            Operation::IsNull(field) => write!(f, "{field} is null"),
            Operation::AsOfEq(field, value) => write!(f, "{field} as of {value}"),
            Operation::And(ops) => {
                for (i, op) in ops.iter().enumerate() {
                    if i > 0 {
                        f.write_str(" and ")?;
                    }
                    write!(f, "{op}")?;
                }
                Ok(())
            }
            Operation::Mapped(mapped) => write!(f, "{}({})", mapped.mapper, mapped.underlying),
        }
    }
}

// ============================================================================
// Mapped operations
// ============================================================================

/// Near objects related through `mapper` to far objects matching `underlying`.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct MappedOperation {
    mapper: Mapper,
    underlying: Box<Operation>,
}

impl MappedOperation {
    pub fn new(mapper: Mapper, underlying: Operation) -> Self {
        Self {
            mapper,
            underlying: Box::new(underlying),
        }
    }

    pub fn mapper(&self) -> &Mapper {
        &self.mapper
    }

    pub fn underlying(&self) -> &Operation {
        &self.underlying
    }

    /// Merge two mapped conjuncts into one join when they traverse the same
    /// relationship (or combinable relationships on the same entity pair).
    pub fn combine(&self, other: &MappedOperation) -> Option<MappedOperation> {
        if self.mapper == other.mapper {
            return Some(Self::new(
                self.mapper.clone(),
                self.underlying.and(&other.underlying),
            ));
        }
        if self.mapper.has_mapped_attributes() || other.mapper.has_mapped_attributes() {
            return None;
        }
        let mapper = self.mapper.and(&other.mapper)?;
        Some(Self::new(mapper, self.underlying.and(&other.underlying)))
    }

    /// Push an atomic bound on a single-equality mapper's left attribute
    /// through to its right attribute.
    pub fn equality_substitute_with_atomic(&self, atomic: &Operation) -> Option<MappedOperation> {
        if !matches!(self.mapper, Mapper::Equality(_)) {
            return None;
        }
        self.substitute_equalities(std::slice::from_ref(atomic))
    }

    /// Same as [`Self::equality_substitute_with_atomic`] for every conjunct of
    /// `and_op`, across all components of a composite mapper.
    pub fn equality_substitute_with_multi_equality(
        &self,
        and_op: &Operation,
    ) -> Option<MappedOperation> {
        self.substitute_equalities(and_op.conjuncts())
    }

    pub(crate) fn substitute_equalities(&self, conjuncts: &[Operation]) -> Option<MappedOperation> {
        let mut pushed = Vec::new();
        for component in self.mapper.equality_components() {
            for candidate in conjuncts {
                if let Some(op) = component.substitute_equality(candidate, &self.underlying) {
                    if !self.underlying.conjuncts().contains(&op) && !pushed.contains(&op) {
                        pushed.push(op);
                    }
                }
            }
        }
        let pushed = Operation::and_all(pushed)?;
        let underlying = self.underlying.and(&pushed).with_substituted_equalities();
        Some(Self::new(self.mapper.clone(), underlying))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::EqualityMapper;
    use joinery_model::{EntityBuilder, Schema};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                EntityBuilder::new("Order")
                    .field("id", "ID")
                    .field("customerId", "CUSTOMER_ID")
                    .field("amount", "AMOUNT"),
            )
            .entity(
                EntityBuilder::new("Customer")
                    .field("id", "ID")
                    .field("name", "NAME"),
            )
            .build()
            .unwrap()
    }

    #[test]
    fn in_values_normalises_its_list() {
        let schema = schema();
        let id = schema.field("Order", "id").unwrap();
        let op = Operation::in_values(&id, vec![Value::from(3), Value::Null, Value::from(1), Value::from(3)]);
        assert_eq!(op, Operation::In(id.clone(), vec![Value::from(1), Value::from(3)]));
        assert_eq!(
            Operation::in_values(&id, vec![Value::from(2)]),
            Operation::eq(&id, 2)
        );
        assert!(matches!(
            Operation::in_values(&id, Vec::new()),
            Operation::None(_)
        ));
    }

    #[test]
    fn and_flattens_and_drops_redundant_all() {
        let schema = schema();
        let id = schema.field("Order", "id").unwrap();
        let amount = schema.field("Order", "amount").unwrap();
        let entity = id.owner().clone();

        let op = Operation::all(&entity)
            .and(&Operation::eq(&id, 1))
            .and(&Operation::compare(&amount, CompareOp::Gt, 10));
        assert_eq!(op.conjuncts().len(), 2);
        assert_eq!(op.result_entity(), Some(&entity));

        let none = op.and(&Operation::None(entity.clone()));
        assert_eq!(none, Operation::None(entity));
    }

    #[test]
    fn mapped_conjuncts_on_the_same_mapper_share_one_join() {
        let schema = schema();
        let mapper = EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        );
        let name = schema.field("Customer", "name").unwrap();
        let cid = schema.field("Customer", "id").unwrap();

        let a = Operation::mapped(mapper.clone(), Operation::eq(&name, "ann"));
        let b = Operation::mapped(mapper.clone(), Operation::compare(&cid, CompareOp::Lt, 10));
        let combined = a.and(&b);

        let Operation::Mapped(mapped) = combined else {
            panic!("expected a single mapped operation, got {combined}");
        };
        assert_eq!(mapped.underlying().conjuncts().len(), 2);
    }

    #[test]
    fn evaluate_follows_sql_null_semantics() {
        let schema = schema();
        let cid = schema.field("Order", "customerId").unwrap();
        let order = joinery_model::DomainObject::of("Order").set("id", 1).build();

        assert_eq!(Operation::eq(&cid, Value::Null).evaluate(&order), Some(false));
        assert_eq!(Operation::compare(&cid, CompareOp::Ne, 4).evaluate(&order), Some(false));
        assert_eq!(Operation::is_null(&cid).evaluate(&order), Some(true));
    }

    #[test]
    fn constant_on_left_is_pushed_to_the_far_side() {
        let schema = schema();
        let order_cid = schema.field("Order", "customerId").unwrap();
        let customer_id = schema.field("Customer", "id").unwrap();
        let name = schema.field("Customer", "name").unwrap();
        let mapper = EqualityMapper::new(order_cid.clone(), customer_id.clone());

        let op = Operation::eq(&order_cid, 7)
            .and(&Operation::mapped(mapper, Operation::eq(&name, "ann")));
        let substituted = op.with_substituted_equalities();

        let mapped = substituted
            .mapped_operations()
            .next()
            .expect("mapped conjunct survives");
        assert!(mapped.underlying().depends_on(&customer_id));
        assert!(mapped
            .underlying()
            .conjuncts()
            .contains(&Operation::eq(&customer_id, 7)));
    }

    #[test]
    fn no_substitution_when_right_is_already_constrained() {
        let schema = schema();
        let order_cid = schema.field("Order", "customerId").unwrap();
        let customer_id = schema.field("Customer", "id").unwrap();
        let mapper = EqualityMapper::new(order_cid.clone(), customer_id.clone());
        let mapped = MappedOperation::new(mapper.into(), Operation::eq(&customer_id, 3));

        assert!(mapped
            .equality_substitute_with_atomic(&Operation::eq(&order_cid, 7))
            .is_none());
    }
}
