//! End-to-end resolution of a predicate graph.
//!
//! `resolve` checks temporal completeness, injects default dates, propagates
//! join constants and then either answers from the cache or hands back the
//! remote query to run.

use crate::asof::{AsOfAnalysis, AsOfEqualityChecker};
use crate::cache::MapperContext;
use crate::error::Result;
use crate::mapper::intersect;
use crate::operation::Operation;
use crate::propagate::TransitivePropagator;
use crate::sql::SqlQuery;
use crate::stack::MapperStack;
use joinery_model::{Field, ObjectRef};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Resolution {
    InMemory(Vec<ObjectRef>),
    Remote(SqlQuery),
}

impl Resolution {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, Resolution::InMemory(_))
    }

    pub fn objects(&self) -> Option<&[ObjectRef]> {
        match self {
            Resolution::InMemory(objects) => Some(objects),
            Resolution::Remote(_) => None,
        }
    }

    pub fn query(&self) -> Option<&SqlQuery> {
        match self {
            Resolution::InMemory(_) => None,
            Resolution::Remote(query) => Some(query),
        }
    }
}

pub struct Resolver<'a> {
    ctx: MapperContext<'a>,
    ignore_as_of: Vec<Field>,
}

impl<'a> Resolver<'a> {
    pub fn new(ctx: MapperContext<'a>) -> Self {
        Self {
            ctx,
            ignore_as_of: Vec::new(),
        }
    }

    /// As-of attributes the caller binds itself.
    pub fn ignoring_as_of(mut self, fields: impl IntoIterator<Item = Field>) -> Self {
        self.ignore_as_of.extend(fields);
        self
    }

    /// Defaults injected and constants propagated, plus the analysis of the
    /// rewritten graph.
    pub fn prepare(&self, op: &Operation) -> Result<(Operation, AsOfAnalysis)> {
        let checker =
            AsOfEqualityChecker::new(self.ctx.schema).ignoring(self.ignore_as_of.iter().cloned());
        let with_defaults = checker.check(op)?.apply(op);
        let prepared = TransitivePropagator::propagate(&with_defaults);
        // Inserting filters can rename chain positions; re-derive the bindings.
        let analysis = checker.check(&prepared)?;
        Ok((prepared, analysis))
    }

    pub fn resolve(&self, op: &Operation) -> Result<Resolution> {
        let (prepared, analysis) = self.prepare(op)?;

        if let Some(objects) = self.resolve_in_memory(&prepared, &MapperStack::root(), &analysis) {
            return Ok(Resolution::InMemory(objects));
        }

        let query = SqlQuery::for_operation(&prepared, self.ctx.schema, self.ctx.config, Some(&analysis))?;
        tracing::debug!(
            entity = ?prepared.result_entity(),
            tables = query.tables().len(),
            joins = query.join_conditions().len(),
            "falling back to remote query"
        );
        Ok(Resolution::Remote(query))
    }

    fn resolve_in_memory(
        &self,
        op: &Operation,
        stack: &MapperStack,
        analysis: &AsOfAnalysis,
    ) -> Option<Vec<ObjectRef>> {
        let entity = op.result_entity()?;
        if op.conjuncts().iter().any(|c| matches!(c, Operation::None(_))) {
            return Some(Vec::new());
        }

        let mut local: Vec<Operation> = op
            .conjuncts()
            .iter()
            .filter(|c| !matches!(c, Operation::Mapped(_) | Operation::All(_)))
            .cloned()
            .collect();
        local.extend(analysis.pinned_filters(stack));

        let mut result = if local.is_empty() && op.mapped_operations().next().is_some() {
            None
        } else {
            let local = Operation::and_all(local).unwrap_or_else(|| Operation::all(entity));
            Some(self.ctx.cache.resolve_in_memory(&local)?)
        };

        for mapped in op.mapped_operations() {
            let mapper = mapped.mapper();
            if mapper.back_resolution_plan(&self.ctx).is_remote() {
                return None;
            }
            let far = mapper.far_position(stack);
            let far_objects = self.resolve_in_memory(mapped.underlying(), &far, analysis)?;
            let near = mapper.map_back(&far_objects, &self.ctx)?;
            result = Some(match result {
                Some(current) => intersect(current, &near),
                None => near,
            });
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapperConfig;
    use crate::mapper::EqualityMapper;
    use crate::test_support::{order_customer_schema, StubCache};
    use joinery_model::DomainObject;

    fn orders_and_customers() -> StubCache {
        StubCache::default()
            .with_objects(
                "Order",
                vec![
                    DomainObject::of("Order").set("id", 1).set("customerId", 10).build(),
                    DomainObject::of("Order").set("id", 2).set("customerId", 20).build(),
                    DomainObject::of("Order").set("id", 3).set("customerId", 10).build(),
                ],
            )
            .with_objects(
                "Customer",
                vec![
                    DomainObject::of("Customer").set("id", 10).set("name", "acme").build(),
                    DomainObject::of("Customer").set("id", 20).set("name", "globex").build(),
                ],
            )
    }

    #[test]
    fn resolves_a_mapped_predicate_in_memory() {
        let schema = order_customer_schema();
        let config = MapperConfig::default();
        let cache = orders_and_customers();
        let ctx = MapperContext::new(&cache, &schema, &config);

        let mapper = EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        );
        let name = schema.field("Customer", "name").unwrap();
        let op = Operation::mapped(mapper, Operation::eq(&name, "acme"));

        let resolution = Resolver::new(ctx).resolve(&op).unwrap();
        let mut ids: Vec<_> = resolution
            .objects()
            .unwrap()
            .iter()
            .map(|o| o.value("id").clone())
            .collect();
        ids.sort();
        assert_eq!(ids, vec![1.into(), 3.into()]);
    }

    #[test]
    fn missing_index_falls_back_to_sql() {
        let schema = order_customer_schema();
        let config = MapperConfig::default();
        let cache = StubCache::default();
        let ctx = MapperContext::new(&cache, &schema, &config);

        let mapper = EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        );
        let name = schema.field("Customer", "name").unwrap();
        let op = Operation::mapped(mapper, Operation::eq(&name, "acme"));

        let resolution = Resolver::new(ctx).resolve(&op).unwrap();
        let query = resolution.query().unwrap();
        assert_eq!(
            query.sql(),
            "select distinct t0.* from ORDER t0, CUSTOMER t1 where t0.CUSTOMER_ID = t1.ID and t1.NAME = ?"
        );
        assert_eq!(query.params(), &["acme".into()]);
    }

    #[test]
    fn none_resolves_to_empty_without_touching_the_cache() {
        let schema = order_customer_schema();
        let config = MapperConfig::default();
        let cache = StubCache::default();
        let ctx = MapperContext::new(&cache, &schema, &config);

        let op = Operation::None("Order".into());
        let resolution = Resolver::new(ctx).resolve(&op).unwrap();
        assert_eq!(resolution, Resolution::InMemory(Vec::new()));
    }
}
