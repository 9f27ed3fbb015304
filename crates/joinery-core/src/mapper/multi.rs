//! Composite-key mapper: AND of single equalities on one entity pair.

use super::{
    crosses_source, decide, intersect, max_result_size, selectivity, EqualityMapper, Mapper,
    ResolutionPlan,
};
use crate::cache::MapperContext;
use crate::error::{MapperError, Result};
use crate::index::{IndexHandle, IndexMemo};
use crate::sql::RemoteQueryBuilder;
use crate::stack::MapperStack;
use ahash::AHashSet;
use joinery_model::{EntityName, Field, ObjectRef, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

#[derive(Debug, Default)]
struct CompositeMemos {
    left: IndexMemo,
    right: IndexMemo,
}

/// Components are kept sorted and deduplicated, so equality and hashing do
/// not depend on combination order.
#[derive(Clone)]
pub struct MultiEqualityMapper {
    components: Arc<[EqualityMapper]>,
    memos: Arc<CompositeMemos>,
}

impl MultiEqualityMapper {
    pub fn new(components: impl IntoIterator<Item = EqualityMapper>) -> Result<Self> {
        let mut components: Vec<EqualityMapper> = components.into_iter().collect();
        let Some(first) = components.first().cloned() else {
            return Err(MapperError::EmptyComposite);
        };
        for component in &components {
            if component.has_mapped_attributes()
                || component.near_entity() != first.near_entity()
                || component.far_entity() != first.far_entity()
            {
                return Err(MapperError::IncompatibleComponents {
                    left: first.to_string(),
                    right: component.to_string(),
                });
            }
        }
        components.sort_by(|a, b| {
            (a.left().terminal(), a.right().terminal(), a.is_auto_generated()).cmp(&(
                b.left().terminal(),
                b.right().terminal(),
                b.is_auto_generated(),
            ))
        });
        components.dedup();
        Ok(Self {
            components: components.into(),
            memos: Arc::new(CompositeMemos::default()),
        })
    }

    pub fn components(&self) -> &[EqualityMapper] {
        &self.components
    }

    fn first(&self) -> &EqualityMapper {
        &self.components[0]
    }

    pub fn near_entity(&self) -> &EntityName {
        self.first().near_entity()
    }

    pub fn far_entity(&self) -> &EntityName {
        self.first().far_entity()
    }

    /// Components that become join conditions (as-of and source pairs don't).
    fn joining(&self) -> Vec<&EqualityMapper> {
        self.components
            .iter()
            .filter(|c| c.adds_to_where_clause())
            .collect()
    }

    pub fn left_fields(&self) -> Vec<Field> {
        self.components
            .iter()
            .map(|c| c.left().terminal().clone())
            .collect()
    }

    pub fn right_fields(&self) -> Vec<Field> {
        self.components
            .iter()
            .map(|c| c.right().terminal().clone())
            .collect()
    }

    pub(crate) fn with_component(&self, component: &EqualityMapper) -> Option<Self> {
        if self.components.contains(component) {
            return Some(self.clone());
        }
        let mut components = self.components.to_vec();
        components.push(component.clone());
        Self::new(components).ok()
    }

    pub(crate) fn merge(&self, other: &MultiEqualityMapper) -> Option<Self> {
        if self == other {
            return Some(self.clone());
        }
        let mut components = self.components.to_vec();
        components.extend(other.components.iter().cloned());
        Self::new(components).ok()
    }

    pub fn reverse(&self) -> Result<Self> {
        let reversed = self
            .components
            .iter()
            .map(EqualityMapper::reverse)
            .collect::<Result<Vec<_>>>()?;
        Self::new(reversed)
    }

    // ------------------------------------------------------------------
    // Index selection
    // ------------------------------------------------------------------

    pub fn lookup_index(&self, ctx: &MapperContext<'_>) -> IndexHandle {
        self.memos
            .right
            .get(self.far_entity(), &self.right_fields(), ctx.cache)
    }

    pub fn back_index(&self, ctx: &MapperContext<'_>) -> IndexHandle {
        self.memos
            .left
            .get(self.near_entity(), &self.left_fields(), ctx.cache)
    }

    pub fn resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        let probed = self.far_entity();
        let crosses = crosses_source(ctx.schema, probed, |source| {
            self.components
                .iter()
                .any(|c| c.right().terminal() == source && c.left().is_source())
        });
        decide(
            self,
            probed,
            &self.lookup_index(ctx),
            crosses,
            ctx,
            ctx.config.allow_partial_cache_hits,
        )
    }

    pub fn back_resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        let probed = self.near_entity();
        let crosses = crosses_source(ctx.schema, probed, |source| {
            self.components
                .iter()
                .any(|c| c.left().terminal() == source && c.right().is_source())
        });
        decide(
            self,
            probed,
            &self.back_index(ctx),
            crosses,
            ctx,
            ctx.config.allow_partial_cache_hits,
        )
    }

    pub fn estimate_selectivity(&self, ctx: &MapperContext<'_>) -> f64 {
        selectivity(
            &self.lookup_index(ctx),
            ctx.cache.estimate_size(self.near_entity()),
            ctx.cache.estimate_size(self.far_entity()),
        )
    }

    pub fn estimate_max_result_size(&self, multiplier: usize, ctx: &MapperContext<'_>) -> usize {
        max_result_size(
            &self.lookup_index(ctx),
            multiplier,
            ctx.cache.estimate_size(self.near_entity()),
            ctx.cache.estimate_size(self.far_entity()),
        )
    }

    // ------------------------------------------------------------------
    // In-memory resolution
    // ------------------------------------------------------------------

    /// Intersection of every component's lookup, narrowed to far objects
    /// whose key tuple matches some near object's tuple.
    pub fn map(&self, near: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        if near.is_empty() {
            return Some(Vec::new());
        }
        if self.resolution_plan(ctx).is_remote() {
            return None;
        }
        let joining = self.joining();
        let mut result: Option<Vec<ObjectRef>> = None;
        for component in &joining {
            let found = component.lookup_far(near, ctx)?;
            result = Some(match result {
                None => found,
                Some(acc) => intersect(acc, &found),
            });
        }
        let result = result?;

        let lefts: Vec<Field> = joining.iter().map(|c| c.left().terminal().clone()).collect();
        let rights: Vec<Field> = joining.iter().map(|c| c.right().terminal().clone()).collect();
        let keys = key_tuples(near, &lefts);
        Some(
            result
                .into_iter()
                .filter(|far| keys.contains(&far.key(&rights)))
                .collect(),
        )
    }

    pub fn map_back(&self, far: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        if far.is_empty() {
            return Some(Vec::new());
        }
        if self.back_resolution_plan(ctx).is_remote() {
            return None;
        }
        let joining = self.joining();
        let mut result: Option<Vec<ObjectRef>> = None;
        for component in &joining {
            let found = component.lookup_near(far, ctx)?;
            result = Some(match result {
                None => found,
                Some(acc) => intersect(acc, &found),
            });
        }
        let result = result?;

        let lefts: Vec<Field> = joining.iter().map(|c| c.left().terminal().clone()).collect();
        let rights: Vec<Field> = joining.iter().map(|c| c.right().terminal().clone()).collect();
        let keys = key_tuples(far, &rights);
        Some(
            result
                .into_iter()
                .filter(|near| keys.contains(&near.key(&lefts)))
                .collect(),
        )
    }

    // ------------------------------------------------------------------
    // SQL + topology
    // ------------------------------------------------------------------

    pub fn far_position(&self, stack: &MapperStack) -> MapperStack {
        stack.pushed(self.clone())
    }

    pub fn generate_sql(&self, builder: &mut dyn RemoteQueryBuilder, stack: &MapperStack) {
        let far = self.far_position(stack);
        if builder.is_mapped_already(&far) {
            return;
        }
        builder.mark_mapped(&far);
        builder.push_join_context(&Mapper::MultiEquality(self.clone()));

        let joining = self.joining();
        if !joining.is_empty() {
            builder.begin_group();
            for component in joining {
                let left = builder.column(component.left().terminal(), stack);
                let right = builder.column(component.right().terminal(), &far);
                builder.emit_join_clause(left, right, "=");
            }
            builder.end_group();
        }
        builder.add_as_of_attribute_sql(&far);
        builder.pop_join_context();
    }

    pub fn dependent_entities(&self) -> BTreeSet<EntityName> {
        BTreeSet::from([self.near_entity().clone(), self.far_entity().clone()])
    }

    pub fn dependent_attributes(&self) -> Vec<Field> {
        let mut fields = self.left_fields();
        fields.extend(self.right_fields());
        fields
    }
}

/// Non-null key tuples of `objects` over `fields`.
fn key_tuples(objects: &[ObjectRef], fields: &[Field]) -> AHashSet<Vec<Value>> {
    objects
        .iter()
        .map(|o| o.key(fields))
        .filter(|key| key.iter().all(|v| !v.is_null()))
        .collect()
}

impl PartialEq for MultiEqualityMapper {
    fn eq(&self, other: &Self) -> bool {
        self.components == other.components
    }
}

impl Eq for MultiEqualityMapper {}

impl Hash for MultiEqualityMapper {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.components.hash(state);
    }
}

impl fmt::Display for MultiEqualityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "[ -> {}: ", self.far_entity())?;
        for (i, component) in self.components.iter().enumerate() {
            if i > 0 {
                f.write_str(" & ")?;
            }
            write!(
                f,
                "{} = {}",
                component.left().path_name(),
                component.right().path_name()
            )?;
        }
        f.write_str("]")
    }
}

impl fmt::Debug for MultiEqualityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use joinery_model::{EntityBuilder, Schema};

    fn schema() -> Schema {
        Schema::builder()
            .entity(
                EntityBuilder::new("Order")
                    .field("customerId", "CUSTOMER_ID")
                    .field("region", "REGION"),
            )
            .entity(
                EntityBuilder::new("Account")
                    .field("customerId", "CUSTOMER_ID")
                    .field("region", "REGION"),
            )
            .entity(EntityBuilder::new("Customer").field("id", "ID"))
            .build()
            .unwrap()
    }

    fn pair(schema: &Schema, field: &str) -> EqualityMapper {
        EqualityMapper::new(
            schema.field("Order", field).unwrap(),
            schema.field("Account", field).unwrap(),
        )
    }

    #[test]
    fn component_order_does_not_matter() {
        let schema = schema();
        let a = MultiEqualityMapper::new([pair(&schema, "customerId"), pair(&schema, "region")]).unwrap();
        let b = MultiEqualityMapper::new([pair(&schema, "region"), pair(&schema, "customerId")]).unwrap();
        assert_eq!(a, b);
        assert_eq!(
            a.to_string(),
            "[ -> Account: customerId = customerId & region = region]"
        );
    }

    #[test]
    fn duplicates_collapse() {
        let schema = schema();
        let multi = MultiEqualityMapper::new([
            pair(&schema, "region"),
            pair(&schema, "customerId"),
            pair(&schema, "region"),
        ])
        .unwrap();
        assert_eq!(multi.components().len(), 2);
        assert_eq!(multi.with_component(&pair(&schema, "region")), Some(multi.clone()));
    }

    #[test]
    fn rejects_empty_and_mixed_entity_pairs() {
        let schema = schema();
        assert!(matches!(
            MultiEqualityMapper::new(Vec::new()),
            Err(MapperError::EmptyComposite)
        ));
        let other_pair = EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        );
        assert!(matches!(
            MultiEqualityMapper::new([pair(&schema, "region"), other_pair]),
            Err(MapperError::IncompatibleComponents { .. })
        ));
    }

    #[test]
    fn reverse_flips_every_component() {
        let schema = schema();
        let multi = MultiEqualityMapper::new([pair(&schema, "customerId"), pair(&schema, "region")]).unwrap();
        let reversed = multi.reverse().unwrap();
        assert_eq!(reversed.near_entity(), &EntityName::new("Account"));
        assert_eq!(reversed.far_entity(), &EntityName::new("Order"));
        assert_eq!(reversed.reverse().unwrap(), multi);
    }
}
