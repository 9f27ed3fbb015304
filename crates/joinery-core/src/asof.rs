//! As-of (temporal) equality checking over a join chain.
//!
//! For every entity an operation reaches, each as-of attribute must be either
//!
//! - bound explicitly (`AsOfEq` at that position),
//! - pinned by the join reaching it (both sides of a component are as-of, so
//!   the parent's date carries over), or
//! - defaulted from the attribute's declared default date.
//!
//! Anything else is temporally ambiguous and rejected, unless the caller
//! asked to ignore that attribute.

use crate::attribute::Attribute;
use crate::error::{MapperError, Result};
use crate::mapper::Mapper;
use crate::operation::Operation;
use crate::stack::MapperStack;
use joinery_model::{EntityName, Field, Schema, Value};

/// What the checker found at one chain position.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AsOfPosition {
    pub stack: MapperStack,
    pub entity: EntityName,
    /// Index of the position this one was reached from.
    pub parent: Option<usize>,
    /// Mapper that reached this position.
    pub reached_by: Option<Mapper>,
    pub explicit: Vec<(Field, Value)>,
    pub pinned: Vec<Field>,
    /// `AsOfEq` default-date predicates to inject here.
    pub defaults: Vec<Operation>,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct AsOfAnalysis {
    positions: Vec<AsOfPosition>,
}

pub struct AsOfEqualityChecker<'a> {
    schema: &'a Schema,
    ignore: Vec<Field>,
}

impl<'a> AsOfEqualityChecker<'a> {
    pub fn new(schema: &'a Schema) -> Self {
        Self {
            schema,
            ignore: Vec::new(),
        }
    }

    /// Skip these attributes entirely; the caller handles them.
    pub fn ignoring(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.ignore.extend(fields);
        self
    }

    pub fn check(&self, op: &Operation) -> Result<AsOfAnalysis> {
        let root = op.result_entity().ok_or(MapperError::UnknownEntity)?;
        let mut analysis = AsOfAnalysis::default();
        self.visit(op, &MapperStack::root(), root, None, None, &mut analysis)?;

        let injected = analysis.defaults_count();
        if injected > 0 {
            tracing::debug!(
                entity = %root,
                positions = analysis.positions.len(),
                defaults = injected,
                "injecting as-of defaults"
            );
        }
        Ok(analysis)
    }

    fn visit(
        &self,
        op: &Operation,
        stack: &MapperStack,
        entity: &EntityName,
        parent: Option<usize>,
        reached_by: Option<&Mapper>,
        analysis: &mut AsOfAnalysis,
    ) -> Result<()> {
        let mut bound: Vec<&Operation> = op.conjuncts().iter().collect();
        if let Some(Mapper::Filtered(filtered)) = reached_by {
            if let Some(post) = filtered.post_filter() {
                bound.extend(post.conjuncts());
            }
        }
        let index = self.record(stack, entity, parent, reached_by, &bound, analysis)?;

        if let Some(mapper) = reached_by {
            self.visit_chain(mapper, stack_of_parent(analysis, parent), parent, analysis)?;
        }

        for mapped in op.mapped_operations() {
            let mapper = mapped.mapper();
            let far = mapper.far_position(stack);
            self.visit(
                mapped.underlying(),
                &far,
                mapper.far_entity(),
                Some(index),
                Some(mapper),
                analysis,
            )?;
        }
        Ok(())
    }

    /// Intermediate entities joined by mapped attributes inside `mapper`.
    fn visit_chain(
        &self,
        mapper: &Mapper,
        stack: MapperStack,
        parent: Option<usize>,
        analysis: &mut AsOfAnalysis,
    ) -> Result<()> {
        for component in mapper.equality_components() {
            for attribute in [component.left(), component.right()] {
                self.visit_attribute(attribute, &stack, parent, analysis)?;
            }
        }
        Ok(())
    }

    fn visit_attribute(
        &self,
        attribute: &Attribute,
        stack: &MapperStack,
        parent: Option<usize>,
        analysis: &mut AsOfAnalysis,
    ) -> Result<()> {
        let Attribute::Mapped(m) = attribute else {
            return Ok(());
        };
        let far = m.mapper.far_position(stack);
        let index = match analysis.index_of(&far) {
            Some(existing) => existing,
            None => {
                let index = self.record(&far, m.mapper.far_entity(), parent, Some(&m.mapper), &[], analysis)?;
                self.visit_chain(&m.mapper, stack.clone(), Some(index), analysis)?;
                index
            }
        };
        self.visit_attribute(&m.wrapped, &far, Some(index), analysis)
    }

    fn record(
        &self,
        stack: &MapperStack,
        entity: &EntityName,
        parent: Option<usize>,
        reached_by: Option<&Mapper>,
        bound: &[&Operation],
        analysis: &mut AsOfAnalysis,
    ) -> Result<usize> {
        let mut position = AsOfPosition {
            stack: stack.clone(),
            entity: entity.clone(),
            parent,
            reached_by: reached_by.cloned(),
            explicit: Vec::new(),
            pinned: Vec::new(),
            defaults: Vec::new(),
        };

        for field in self.schema.as_of_fields(entity) {
            if self.ignore.contains(&field) {
                continue;
            }
            let explicit = bound.iter().find_map(|op| match op {
                Operation::AsOfEq(f, value) if f == &field => Some(value.clone()),
                _ => None,
            });
            if let Some(value) = explicit {
                position.explicit.push((field, value));
            } else if reached_by.map_or(false, |m| m.pins_as_of(&field)) {
                position.pinned.push(field);
            } else if let Some(default) = field.as_of_default() {
                position.defaults.push(Operation::as_of_eq(&field, default.clone()));
            } else {
                return Err(MapperError::UnresolvableTemporalAttribute {
                    entity: entity.clone(),
                    attribute: field.name().to_string(),
                });
            }
        }

        analysis.positions.push(position);
        Ok(analysis.positions.len() - 1)
    }
}

fn stack_of_parent(analysis: &AsOfAnalysis, parent: Option<usize>) -> MapperStack {
    parent
        .and_then(|i| analysis.positions.get(i))
        .map(|p| p.stack.clone())
        .unwrap_or_default()
}

impl AsOfAnalysis {
    pub fn positions(&self) -> &[AsOfPosition] {
        &self.positions
    }

    pub fn position(&self, stack: &MapperStack) -> Option<&AsOfPosition> {
        self.positions.iter().find(|p| &p.stack == stack)
    }

    fn index_of(&self, stack: &MapperStack) -> Option<usize> {
        self.positions.iter().position(|p| &p.stack == stack)
    }

    pub fn defaults_count(&self) -> usize {
        self.positions.iter().map(|p| p.defaults.len()).sum()
    }

    /// Date bound to `field` at `stack`, following pins up the chain.
    pub fn binding(&self, stack: &MapperStack, field: &Field) -> Option<Value> {
        let index = self.index_of(stack)?;
        self.binding_at(index, field)
    }

    fn binding_at(&self, index: usize, field: &Field) -> Option<Value> {
        let position = self.positions.get(index)?;
        if let Some((_, value)) = position.explicit.iter().find(|(f, _)| f == field) {
            return Some(value.clone());
        }
        if let Some(value) = position.defaults.iter().find_map(|op| match op {
            Operation::AsOfEq(f, value) if f == field => Some(value.clone()),
            _ => None,
        }) {
            return Some(value);
        }
        if position.pinned.contains(field) {
            let mapper = position.reached_by.as_ref()?;
            let component = mapper
                .equality_components()
                .into_iter()
                .find(|c| c.pins_as_of(field))?;
            let parent_field = component.left().terminal();
            return self.binding_at(position.parent?, parent_field);
        }
        None
    }

    /// `AsOfEq` predicates for the pinned attributes at `stack` whose date is
    /// known.
    pub fn pinned_filters(&self, stack: &MapperStack) -> Vec<Operation> {
        let Some(position) = self.position(stack) else {
            return Vec::new();
        };
        position
            .pinned
            .iter()
            .filter_map(|field| {
                self.binding(stack, field)
                    .map(|date| Operation::as_of_eq(field, date))
            })
            .collect()
    }

    /// Inject every default: ANDed at the root, as far-side filters of the
    /// mapper reaching any other position.
    pub fn apply(&self, op: &Operation) -> Operation {
        let inserts: Vec<(&MapperStack, &[Operation])> = self
            .positions
            .iter()
            .filter(|p| !p.stack.is_root() && !p.defaults.is_empty())
            .map(|p| (&p.stack, p.defaults.as_slice()))
            .collect();
        let rewritten = self.rewrite(op, &MapperStack::root(), &inserts);

        let root_defaults = self
            .position(&MapperStack::root())
            .map(|p| p.defaults.clone())
            .unwrap_or_default();
        match Operation::and_all(root_defaults) {
            Some(defaults) => rewritten.and(&defaults),
            None => rewritten,
        }
    }

    fn rewrite(
        &self,
        op: &Operation,
        stack: &MapperStack,
        inserts: &[(&MapperStack, &[Operation])],
    ) -> Operation {
        if op.mapped_operations().next().is_none() {
            return op.clone();
        }
        let parts = op.conjuncts().iter().map(|conjunct| match conjunct {
            Operation::Mapped(mapped) => {
                let far = mapped.mapper().far_position(stack);
                let underlying = self.rewrite(mapped.underlying(), &far, inserts);
                let mapper = inserts
                    .iter()
                    .fold(mapped.mapper().clone(), |mapper, (position, ops)| {
                        mapper.insert_as_of_operation_in_middle(ops, position, stack)
                    });
                Operation::mapped(mapper, underlying)
            }
            other => other.clone(),
        });
        Operation::and_all(parts).unwrap_or_else(|| op.clone())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mapper::EqualityMapper;
    use chrono::NaiveDate;
    use joinery_model::EntityBuilder;

    fn date(day: u32) -> Value {
        NaiveDate::from_ymd_opt(2024, 1, day)
            .and_then(|d| d.and_hms_opt(0, 0, 0))
            .map(Value::from)
            .unwrap()
    }

    fn schema(order_default: Option<Value>) -> Schema {
        Schema::builder()
            .entity(
                EntityBuilder::new("Order")
                    .field("customerId", "CUSTOMER_ID")
                    .as_of("businessDate", "FROM_Z", "THRU_Z", order_default),
            )
            .entity(
                EntityBuilder::new("Customer")
                    .field("id", "ID")
                    .as_of("businessDate", "FROM_Z", "THRU_Z", Some(date(2))),
            )
            .build()
            .unwrap()
    }

    fn to_customer(schema: &Schema) -> EqualityMapper {
        EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        )
    }

    #[test]
    fn unpinned_attribute_without_default_is_rejected() {
        let schema = schema(None);
        let op = Operation::all(&EntityName::new("Order"));
        let err = AsOfEqualityChecker::new(&schema).check(&op).unwrap_err();
        match err {
            MapperError::UnresolvableTemporalAttribute { entity, attribute } => {
                assert_eq!(entity, EntityName::new("Order"));
                assert_eq!(attribute, "businessDate");
            }
            other => panic!("unexpected error: {other}"),
        }
    }

    #[test]
    fn ignored_attributes_are_skipped() {
        let schema = schema(None);
        let order_date = schema.field("Order", "businessDate").unwrap();
        let op = Operation::all(&EntityName::new("Order"));
        let analysis = AsOfEqualityChecker::new(&schema)
            .ignoring([order_date])
            .check(&op)
            .unwrap();
        assert_eq!(analysis.defaults_count(), 0);
    }

    #[test]
    fn explicit_binding_wins_over_default() {
        let schema = schema(Some(date(1)));
        let order_date = schema.field("Order", "businessDate").unwrap();
        let op = Operation::as_of_eq(&order_date, date(5));
        let analysis = AsOfEqualityChecker::new(&schema).check(&op).unwrap();

        assert_eq!(analysis.defaults_count(), 0);
        assert_eq!(analysis.binding(&MapperStack::root(), &order_date), Some(date(5)));
    }

    #[test]
    fn defaults_land_at_their_chain_position() {
        let schema = schema(Some(date(1)));
        let mapper = to_customer(&schema);
        let customer_id = schema.field("Customer", "id").unwrap();
        let op = Operation::mapped(mapper.clone(), Operation::eq(&customer_id, 7));

        let analysis = AsOfEqualityChecker::new(&schema).check(&op).unwrap();
        assert_eq!(analysis.defaults_count(), 2);

        let applied = analysis.apply(&op);
        let order_date = schema.field("Order", "businessDate").unwrap();
        assert!(applied
            .conjuncts()
            .contains(&Operation::as_of_eq(&order_date, date(1))));

        let mapped = applied.mapped_operations().next().unwrap();
        let Mapper::Filtered(filtered) = mapped.mapper() else {
            panic!("expected the customer default as a post filter");
        };
        let customer_date = schema.field("Customer", "businessDate").unwrap();
        assert_eq!(
            filtered.post_filter(),
            Some(&Operation::as_of_eq(&customer_date, date(2)))
        );

        let recheck = AsOfEqualityChecker::new(&schema).check(&applied).unwrap();
        assert_eq!(recheck.defaults_count(), 0);
    }

    #[test]
    fn as_of_join_pins_the_far_attribute() {
        let schema = schema(None);
        let order_date = schema.field("Order", "businessDate").unwrap();
        let customer_date = schema.field("Customer", "businessDate").unwrap();
        let by_id = to_customer(&schema);
        let by_date = EqualityMapper::new(order_date.clone(), customer_date.clone());
        let mapper = Mapper::Equality(by_id).and(&Mapper::Equality(by_date)).unwrap();

        let op = Operation::as_of_eq(&order_date, date(9))
            .and(&Operation::mapped(mapper.clone(), Operation::all(&EntityName::new("Customer"))));
        let analysis = AsOfEqualityChecker::new(&schema).check(&op).unwrap();

        let far = mapper.far_position(&MapperStack::root());
        let position = analysis.position(&far).unwrap();
        assert_eq!(position.pinned, vec![customer_date.clone()]);
        assert!(position.defaults.is_empty());
        assert_eq!(
            analysis.pinned_filters(&far),
            vec![Operation::as_of_eq(&customer_date, date(9))]
        );
    }
}
