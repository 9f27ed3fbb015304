//! Single-equality mapper: `near.left = far.right`.

use super::{
    apply_filter, crosses_source, decide, dedup, intersect, max_result_size, probe, selectivity,
    values_of, Mapper, MultiEqualityMapper, ResolutionPlan,
};
use crate::attribute::Attribute;
use crate::cache::MapperContext;
use crate::error::{MapperError, Result};
use crate::index::{IndexHandle, IndexMemo};
use crate::operation::Operation;
use crate::sql::{ColumnRef, RemoteQueryBuilder};
use crate::stack::MapperStack;
use ahash::AHashMap;
use joinery_model::{DomainObject, EntityName, Field, ObjectRef, Schema, Value};
use std::collections::{BTreeSet, HashMap};
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;

/// Both directions of one relationship, built together. The mapper and its
/// reverse share this value; neither points at the other.
struct EqualityPair {
    left: Attribute,
    right: Attribute,
    auto_generated: bool,
    left_memo: IndexMemo,
    right_memo: IndexMemo,
}

#[derive(Clone)]
pub struct EqualityMapper {
    pair: Arc<EqualityPair>,
    reversed: bool,
}

/// Far objects bucketed by their `right` value.
#[derive(Debug, Default)]
pub struct JoinIndex {
    buckets: AHashMap<Value, Vec<ObjectRef>>,
}

impl JoinIndex {
    pub fn get(&self, key: &Value) -> &[ObjectRef] {
        self.buckets.get(key).map(Vec::as_slice).unwrap_or(&[])
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}

/// Outcome of rewriting a mapper for a temp-table join.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TempJoinStep {
    /// `left` has no temp column: bind `right` to the prototype's value.
    Operation(Operation),
    /// Join from the temp column instead of `left`.
    Mapper(EqualityMapper),
}

impl EqualityMapper {
    pub fn new(left: impl Into<Attribute>, right: impl Into<Attribute>) -> Self {
        Self::build(left.into(), right.into(), false)
    }

    /// A mapper synthesized by the engine rather than declared.
    pub fn auto_generated(left: impl Into<Attribute>, right: impl Into<Attribute>) -> Self {
        Self::build(left.into(), right.into(), true)
    }

    fn build(left: Attribute, right: Attribute, auto_generated: bool) -> Self {
        Self {
            pair: Arc::new(EqualityPair {
                left,
                right,
                auto_generated,
                left_memo: IndexMemo::new(),
                right_memo: IndexMemo::new(),
            }),
            reversed: false,
        }
    }

    pub fn left(&self) -> &Attribute {
        if self.reversed {
            &self.pair.right
        } else {
            &self.pair.left
        }
    }

    pub fn right(&self) -> &Attribute {
        if self.reversed {
            &self.pair.left
        } else {
            &self.pair.right
        }
    }

    fn left_memo(&self) -> &IndexMemo {
        if self.reversed {
            &self.pair.right_memo
        } else {
            &self.pair.left_memo
        }
    }

    fn right_memo(&self) -> &IndexMemo {
        if self.reversed {
            &self.pair.left_memo
        } else {
            &self.pair.right_memo
        }
    }

    pub fn is_auto_generated(&self) -> bool {
        self.pair.auto_generated
    }

    pub fn any_left_attribute(&self) -> &Attribute {
        self.left()
    }

    pub fn any_right_attribute(&self) -> &Attribute {
        self.right()
    }

    pub fn all_left_attributes(&self) -> Vec<Attribute> {
        vec![self.left().clone()]
    }

    pub fn near_entity(&self) -> &EntityName {
        self.left().top_owner()
    }

    pub fn far_entity(&self) -> &EntityName {
        self.right().owner()
    }

    pub fn has_mapped_attributes(&self) -> bool {
        self.left().is_mapped() || self.right().is_mapped()
    }

    pub fn is_single_level(&self) -> bool {
        !self.has_mapped_attributes()
    }

    /// Reversal is only defined when neither side is a mapped attribute.
    pub fn is_reversible(&self) -> bool {
        !self.has_mapped_attributes()
    }

    pub fn reverse(&self) -> Result<EqualityMapper> {
        if !self.is_reversible() {
            return Err(MapperError::IrreversibleMapper {
                mapper: self.to_string(),
            });
        }
        Ok(Self {
            pair: Arc::clone(&self.pair),
            reversed: !self.reversed,
        })
    }

    /// Source and as-of pairs never become join conditions.
    pub fn adds_to_where_clause(&self) -> bool {
        !(self.left().is_source()
            || self.right().is_source()
            || self.left().is_as_of()
            || self.right().is_as_of())
    }

    pub(crate) fn and_equality(&self, other: &EqualityMapper) -> Option<Mapper> {
        if self == other {
            return Some(Mapper::Equality(self.clone()));
        }
        if self.has_mapped_attributes() || other.has_mapped_attributes() {
            return None;
        }
        if self.near_entity() != other.near_entity() || self.far_entity() != other.far_entity() {
            return None;
        }
        MultiEqualityMapper::new([self.clone(), other.clone()])
            .ok()
            .map(Mapper::MultiEquality)
    }

    // ------------------------------------------------------------------
    // Index selection
    // ------------------------------------------------------------------

    /// Index probed by [`Self::map`]: `right`'s field on the far side.
    pub fn lookup_index(&self, ctx: &MapperContext<'_>) -> IndexHandle {
        let right = self.right();
        self.right_memo()
            .get(right.owner(), std::slice::from_ref(right.terminal()), ctx.cache)
    }

    /// Index probed by [`Self::map_back`]: `left`'s field.
    pub fn back_index(&self, ctx: &MapperContext<'_>) -> IndexHandle {
        let left = self.left();
        self.left_memo()
            .get(left.owner(), std::slice::from_ref(left.terminal()), ctx.cache)
    }

    pub fn resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        self.forward_plan(ctx, ctx.config.allow_partial_cache_hits)
    }

    fn forward_plan(&self, ctx: &MapperContext<'_>, allow_partial: bool) -> ResolutionPlan {
        let probed = self.right().owner();
        let crosses = crosses_source(ctx.schema, probed, |source| {
            self.right().terminal() == source && self.left().is_source()
        });
        decide(self, probed, &self.lookup_index(ctx), crosses, ctx, allow_partial)
    }

    pub fn back_resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        let probed = self.left().owner();
        let crosses = crosses_source(ctx.schema, probed, |source| {
            self.left().terminal() == source && self.right().is_source()
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

    pub fn is_using_unique_index(&self, ctx: &MapperContext<'_>) -> bool {
        self.lookup_index(ctx).is_unique()
    }

    pub fn is_using_non_unique_index(&self, ctx: &MapperContext<'_>) -> bool {
        self.lookup_index(ctx).is_non_unique()
    }

    pub fn is_using_immutable_unique_index(&self, ctx: &MapperContext<'_>) -> bool {
        self.lookup_index(ctx).is_immutable_unique()
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

    pub fn is_estimatable(&self, ctx: &MapperContext<'_>) -> bool {
        ctx.cache.is_fully_cached(self.near_entity()) && ctx.cache.is_fully_cached(self.far_entity())
    }

    // ------------------------------------------------------------------
    // In-memory resolution
    // ------------------------------------------------------------------

    pub fn map(&self, near: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        if near.is_empty() {
            return Some(Vec::new());
        }
        if self.resolution_plan(ctx).is_remote() {
            return None;
        }
        self.lookup_far(near, ctx)
    }

    /// Forward lookup without the plan check.
    pub(crate) fn lookup_far(
        &self,
        near: &[ObjectRef],
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<ObjectRef>> {
        let holders = reach(self.left(), near, ctx)?;
        let values = values_of(&holders, self.left().terminal());
        let direct = probe(ctx, self.right().terminal(), values)?;
        match self.right() {
            Attribute::Direct(_) => Some(direct),
            right @ Attribute::Mapped(_) => {
                let via = reach(right, near, ctx)?;
                Some(intersect(direct, &via))
            }
        }
    }

    pub fn map_back(&self, far: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        if far.is_empty() {
            return Some(Vec::new());
        }
        if self.back_resolution_plan(ctx).is_remote() {
            return None;
        }
        self.lookup_near(far, ctx)
    }

    pub(crate) fn lookup_near(
        &self,
        far: &[ObjectRef],
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<ObjectRef>> {
        let values = values_of(far, self.right().terminal());
        let holders = probe(ctx, self.left().terminal(), values)?;
        let near = reach_back(self.left(), holders, ctx)?;
        match self.right() {
            Attribute::Direct(_) => Some(near),
            right @ Attribute::Mapped(_) => {
                let via = reach_back(right, far.to_vec(), ctx)?;
                Some(intersect(near, &via))
            }
        }
    }

    /// Far objects for one near object, narrowed by `extra` in the same
    /// cache lookup when both sides are direct.
    pub fn map_one(
        &self,
        near: &ObjectRef,
        extra: Option<&Operation>,
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<ObjectRef>> {
        if self.resolution_plan(ctx).is_remote() {
            return None;
        }
        match (self.left().as_direct(), self.right().as_direct()) {
            (Some(left), Some(right)) => {
                let value = near.value_of(left);
                if value.is_null() {
                    return Some(Vec::new());
                }
                let lookup = Operation::eq(right, value.clone());
                let lookup = match extra {
                    Some(extra) => lookup.and(extra),
                    None => lookup,
                };
                ctx.cache.resolve_in_memory(&lookup)
            }
            _ => {
                let far = self.lookup_far(std::slice::from_ref(near), ctx)?;
                apply_filter(far, extra)
            }
        }
    }

    pub fn map_with_extra(
        &self,
        near: &[ObjectRef],
        extra_on_result: &Operation,
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<ObjectRef>> {
        let far = self.map(near, ctx)?;
        extra_on_result.filter(far)
    }

    /// Resolve against a partially cached far side; only a complete unique
    /// index hit resolves.
    pub fn map_return_null_if_incomplete_index_hit(
        &self,
        near: &[ObjectRef],
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<ObjectRef>> {
        if near.is_empty() {
            return Some(Vec::new());
        }
        if self.forward_plan(ctx, true).is_remote() {
            return None;
        }
        self.lookup_far(near, ctx)
    }

    /// Far objects per near object; a parent without match gets an empty vec.
    pub fn map_by_parent(
        &self,
        near: &[ObjectRef],
        ctx: &MapperContext<'_>,
    ) -> Option<Vec<(ObjectRef, Vec<ObjectRef>)>> {
        if self.resolution_plan(ctx).is_remote() {
            return None;
        }
        match self.left().as_direct() {
            Some(left) if !self.right().is_mapped() => {
                let far = self.lookup_far(near, ctx)?;
                let index = self.index_by_right(&far);
                Some(
                    near.iter()
                        .map(|parent| (parent.clone(), index.get(parent.value_of(left)).to_vec()))
                        .collect(),
                )
            }
            _ => near
                .iter()
                .map(|parent| {
                    let far = self.lookup_far(std::slice::from_ref(parent), ctx)?;
                    Some((parent.clone(), far))
                })
                .collect(),
        }
    }

    /// Bucket `far` objects by their `right` value; nulls are skipped.
    pub fn index_by_right(&self, far: &[ObjectRef]) -> JoinIndex {
        let field = self.right().terminal();
        let mut buckets: AHashMap<Value, Vec<ObjectRef>> = AHashMap::new();
        for object in far {
            let key = object.value_of(field);
            if key.is_null() {
                continue;
            }
            buckets.entry(key.clone()).or_default().push(object.clone());
        }
        JoinIndex { buckets }
    }

    /// Re-attach rows fetched by a remote query to their parents.
    pub fn attach(
        &self,
        parents: &[ObjectRef],
        fetched: &[ObjectRef],
    ) -> Result<Vec<(ObjectRef, Vec<ObjectRef>)>> {
        let Some(left) = self.left().as_direct() else {
            return Err(MapperError::AttachThroughMappedLeft {
                mapper: self.to_string(),
            });
        };
        let index = self.index_by_right(fetched);
        Ok(parents
            .iter()
            .map(|parent| (parent.clone(), index.get(parent.value_of(left)).to_vec()))
            .collect())
    }

    /// `right in (distinct left values of parents)`; `None` when there is
    /// nothing to fetch, too much to list, or a side is mapped.
    pub fn simplified_join_op(&self, parents: &[ObjectRef], max_in_clause: usize) -> Option<Operation> {
        let left = self.left().as_direct()?;
        let right = self.right().as_direct()?;
        let values = values_of(parents, left);
        if values.is_empty() || values.len() > max_in_clause {
            return None;
        }
        Some(Operation::in_values(right, values))
    }

    // ------------------------------------------------------------------
    // Predicate substitution
    // ------------------------------------------------------------------

    /// Rewrite an atomic `left` bound into the same bound on `right`, unless
    /// `far_side` already constrains `right`.
    pub fn substitute_equality(&self, candidate: &Operation, far_side: &Operation) -> Option<Operation> {
        if !matches!(candidate, Operation::Eq(..) | Operation::In(..)) {
            return None;
        }
        let left = self.left().as_direct()?;
        let right = self.right().as_direct()?;
        if far_side.depends_on(right) {
            return None;
        }
        candidate.substitute_other_attribute(left, right)
    }

    /// The direct attribute transitively equal to `attribute` through this
    /// mapper.
    pub fn deepest_equal_attribute(&self, attribute: &Attribute) -> Option<Attribute> {
        if attribute == self.left() {
            return Some(Attribute::Direct(self.right().terminal().clone()));
        }
        if attribute == self.right() {
            return Some(Attribute::Direct(self.left().terminal().clone()));
        }
        None
    }

    /// Equality on `left` selecting the near object(s) that own `far`.
    pub fn operation_from_result(&self, far: &DomainObject) -> Option<Operation> {
        let left = self.left().as_direct()?;
        let value = far.value_of(self.right().terminal());
        if value.is_null() {
            return None;
        }
        Some(Operation::eq(left, value.clone()))
    }

    /// Equality on `right` selecting the far object(s) `near` points at.
    pub fn operation_from_original(&self, near: &DomainObject) -> Option<Operation> {
        let right = self.right().as_direct()?;
        let value = near.value_of(self.left().as_direct()?);
        if value.is_null() {
            return None;
        }
        Some(Operation::eq(right, value.clone()))
    }

    // ------------------------------------------------------------------
    // As-of support
    // ------------------------------------------------------------------

    /// Far-side `field` is tied to a near-side as-of attribute.
    pub fn pins_as_of(&self, field: &Field) -> bool {
        self.right().terminal() == field && self.left().is_as_of() && self.right().is_as_of()
    }

    pub fn default_as_of_operations(&self, schema: &Schema, ignore: &[Field]) -> Vec<Operation> {
        Mapper::Equality(self.clone()).default_as_of_operations(schema, ignore)
    }

    pub fn has_left_mappings_for(&self, as_of: &Field) -> bool {
        self.left().terminal() == as_of
    }

    pub fn has_left_or_default_mappings_for(&self, as_of: &Field) -> bool {
        self.has_left_mappings_for(as_of) || as_of.as_of_default().is_some()
    }

    pub fn insert_operation_in_middle(
        &self,
        position: &MapperStack,
        ops: &Operation,
        stack: &MapperStack,
    ) -> Mapper {
        Mapper::Equality(self.clone()).insert_operation_in_middle(position, ops, stack)
    }

    pub fn insert_as_of_operation_in_middle(
        &self,
        ops: &[Operation],
        position: &MapperStack,
        stack: &MapperStack,
    ) -> Mapper {
        Mapper::Equality(self.clone()).insert_as_of_operation_in_middle(ops, position, stack)
    }

    /// Insert into the mapped attributes' chains; `position` is not this
    /// mapper's own far position.
    pub(crate) fn insert_into_chain(
        &self,
        position: &MapperStack,
        ops: &Operation,
        stack: &MapperStack,
    ) -> Mapper {
        let left = insert_into_attribute(self.left(), position, ops, stack);
        let right = insert_into_attribute(self.right(), position, ops, stack);
        if left.is_none() && right.is_none() {
            return Mapper::Equality(self.clone());
        }
        Mapper::Equality(Self::build(
            left.unwrap_or_else(|| self.left().clone()),
            right.unwrap_or_else(|| self.right().clone()),
            self.is_auto_generated(),
        ))
    }

    // ------------------------------------------------------------------
    // Temp-join support
    // ------------------------------------------------------------------

    pub fn is_mappable_for_temp_join(&self, fields: &[Field]) -> bool {
        self.left()
            .as_direct()
            .map_or(false, |left| fields.contains(left))
    }

    /// Re-root the join on the temp column standing in for `left`.
    pub fn create_mapper_for_temp_join(
        &self,
        substitutions: &HashMap<Field, Field>,
    ) -> Result<EqualityMapper> {
        let temp = self
            .left()
            .as_direct()
            .and_then(|left| substitutions.get(left))
            .ok_or_else(|| MapperError::MissingTempJoinAttribute {
                attribute: self.left().to_string(),
            })?;
        Ok(self.substitute_new_left(temp.clone()))
    }

    pub fn create_operation_or_mapper_for_temp_join(
        &self,
        substitutions: &HashMap<Field, Field>,
        prototype: &DomainObject,
    ) -> TempJoinStep {
        match self.create_mapper_for_temp_join(substitutions) {
            Ok(mapper) => TempJoinStep::Mapper(mapper),
            Err(_) => {
                let value = prototype.value_of(self.left().terminal()).clone();
                TempJoinStep::Operation(Operation::eq(self.right().terminal(), value))
            }
        }
    }

    pub fn substitute_new_left(&self, new_left: impl Into<Attribute>) -> EqualityMapper {
        Self::build(new_left.into(), self.right().clone(), self.is_auto_generated())
    }

    // ------------------------------------------------------------------
    // Topology
    // ------------------------------------------------------------------

    pub fn dependent_entities(&self) -> BTreeSet<EntityName> {
        let mut entities = BTreeSet::new();
        entities.insert(self.near_entity().clone());
        entities.insert(self.far_entity().clone());
        for mapper in self.chained() {
            entities.extend(mapper.dependent_entities());
        }
        entities
    }

    pub fn dependent_attributes(&self) -> Vec<Field> {
        let mut fields = vec![self.left().terminal().clone(), self.right().terminal().clone()];
        for mapper in self.chained() {
            for field in mapper.dependent_attributes() {
                if !fields.contains(&field) {
                    fields.push(field);
                }
            }
        }
        fields
    }

    fn chained(&self) -> impl Iterator<Item = &Mapper> {
        self.left()
            .mapper_chain()
            .into_iter()
            .chain(self.right().mapper_chain())
    }

    /// Both sides are reached through different (or multi-hop) paths.
    pub fn detect_triangle_join(&self) -> bool {
        match (self.left().as_mapped(), self.right().as_mapped()) {
            (Some(left), Some(right)) => {
                !(left.mapper == right.mapper && left.mapper.is_single_level())
            }
            _ => false,
        }
    }

    pub fn has_triangle_joins(&self) -> bool {
        self.detect_triangle_join() || self.chained().any(Mapper::has_triangle_joins)
    }

    pub fn unchained_mappers(&self) -> Vec<Mapper> {
        if !self.has_mapped_attributes() {
            return vec![Mapper::Equality(self.clone())];
        }
        let mut mappers: Vec<Mapper> = self
            .chained()
            .flat_map(Mapper::unchained_mappers)
            .collect();
        mappers.push(Mapper::Equality(Self::build(
            Attribute::Direct(self.left().terminal().clone()),
            Attribute::Direct(self.right().terminal().clone()),
            self.is_auto_generated(),
        )));
        mappers
    }

    // ------------------------------------------------------------------
    // SQL
    // ------------------------------------------------------------------

    pub fn far_position(&self, stack: &MapperStack) -> MapperStack {
        match self.right() {
            Attribute::Direct(_) => stack.pushed(self.clone()),
            right @ Attribute::Mapped(_) => attribute_position(right, stack),
        }
    }

    pub fn generate_sql(&self, builder: &mut dyn RemoteQueryBuilder, stack: &MapperStack) {
        let key = stack.pushed(self.clone());
        if builder.is_mapped_already(&key) {
            return;
        }
        builder.mark_mapped(&key);
        builder.push_join_context(&Mapper::Equality(self.clone()));

        let far = self.far_position(stack);
        if self.adds_to_where_clause() {
            let grouped = self.has_mapped_attributes();
            if grouped {
                builder.begin_group();
            }
            let left = attribute_column(self.left(), builder, stack);
            let right = match self.right() {
                Attribute::Direct(field) => builder.column(field, &far),
                mapped => attribute_column(mapped, builder, stack),
            };
            builder.emit_join_clause(left, right, "=");
            if grouped {
                builder.end_group();
            }
        }
        builder.add_as_of_attribute_sql(&far);
        builder.pop_join_context();
    }
}

/// Objects owning `attribute`'s terminal field, reached from `objects` (which
/// own its top).
fn reach(attribute: &Attribute, objects: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
    match attribute {
        Attribute::Direct(_) => Some(objects.to_vec()),
        Attribute::Mapped(m) => {
            let next = m.mapper.map(objects, ctx)?;
            reach(&m.wrapped, &next, ctx)
        }
    }
}

/// Inverse of [`reach`]: top-owner objects reaching `holders`.
fn reach_back(
    attribute: &Attribute,
    holders: Vec<ObjectRef>,
    ctx: &MapperContext<'_>,
) -> Option<Vec<ObjectRef>> {
    match attribute {
        Attribute::Direct(_) => Some(dedup(holders)),
        Attribute::Mapped(m) => {
            let inner = reach_back(&m.wrapped, holders, ctx)?;
            m.mapper.map_back(&inner, ctx)
        }
    }
}

fn attribute_position(attribute: &Attribute, stack: &MapperStack) -> MapperStack {
    match attribute {
        Attribute::Direct(_) => stack.clone(),
        Attribute::Mapped(m) => attribute_position(&m.wrapped, &m.mapper.far_position(stack)),
    }
}

fn attribute_column(
    attribute: &Attribute,
    builder: &mut dyn RemoteQueryBuilder,
    stack: &MapperStack,
) -> ColumnRef {
    match attribute {
        Attribute::Direct(field) => builder.column(field, stack),
        Attribute::Mapped(m) => {
            m.mapper.generate_sql(builder, stack);
            attribute_column(&m.wrapped, builder, &m.mapper.far_position(stack))
        }
    }
}

fn insert_into_attribute(
    attribute: &Attribute,
    position: &MapperStack,
    ops: &Operation,
    stack: &MapperStack,
) -> Option<Attribute> {
    let Attribute::Mapped(m) = attribute else {
        return None;
    };
    let mapper = m.mapper.insert_operation_in_middle(position, ops, stack);
    let wrapped = insert_into_attribute(&m.wrapped, position, ops, &m.mapper.far_position(stack));
    if mapper == m.mapper && wrapped.is_none() {
        return None;
    }
    Some(Attribute::mapped(
        mapper,
        wrapped.unwrap_or_else(|| m.wrapped.clone()),
    ))
}

impl PartialEq for EqualityMapper {
    fn eq(&self, other: &Self) -> bool {
        (Arc::ptr_eq(&self.pair, &other.pair) && self.reversed == other.reversed)
            || (self.left() == other.left()
                && self.right() == other.right()
                && self.is_auto_generated() == other.is_auto_generated())
    }
}

impl Eq for EqualityMapper {}

impl Hash for EqualityMapper {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.left().hash(state);
        self.right().hash(state);
        self.is_auto_generated().hash(state);
    }
}

impl fmt::Display for EqualityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(
            f,
            "[ -> {}: {} = {}]",
            self.far_entity(),
            self.left().path_name(),
            self.right().path_name()
        )
    }
}

impl fmt::Debug for EqualityMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(self, f)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::MapperConfig;
    use crate::mapper::RemoteReason;
    use crate::test_support::{order_customer_schema, StubCache};
    use joinery_model::EntityName;

    fn order_to_customer(schema: &Schema) -> EqualityMapper {
        EqualityMapper::new(
            schema.field("Order", "customerId").unwrap(),
            schema.field("Customer", "id").unwrap(),
        )
    }

    #[test]
    fn display_names_the_far_entity_and_both_fields() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        assert_eq!(mapper.to_string(), "[ -> Customer: customerId = id]");
        assert_eq!(mapper.near_entity(), &EntityName::new("Order"));
        assert_eq!(mapper.far_entity(), &EntityName::new("Customer"));
    }

    #[test]
    fn reverse_twice_is_the_same_mapper() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let reversed = mapper.reverse().unwrap();

        assert_eq!(reversed.left(), mapper.right());
        assert_eq!(reversed.right(), mapper.left());
        assert_eq!(reversed.far_entity(), &EntityName::new("Order"));
        assert_eq!(reversed.reverse().unwrap(), mapper);
        assert_ne!(reversed, mapper);
    }

    #[test]
    fn mapped_attributes_are_not_reversible() {
        let schema = order_customer_schema();
        let to_customer = order_to_customer(&schema);
        let through = EqualityMapper::new(
            schema.field("Order", "id").unwrap(),
            Attribute::mapped(
                to_customer.clone().into(),
                schema.field("Customer", "id").unwrap(),
            ),
        );
        assert!(!through.is_reversible());
        assert!(matches!(
            through.reverse(),
            Err(MapperError::IrreversibleMapper { .. })
        ));
        assert!(to_customer.is_reversible());
    }

    #[test]
    fn structural_equality_ignores_the_memo() {
        let schema = order_customer_schema();
        let a = order_to_customer(&schema);
        let b = order_to_customer(&schema);
        assert_eq!(a, b);
        let auto = EqualityMapper::auto_generated(a.left().clone(), a.right().clone());
        assert_ne!(a, auto);
    }

    #[test]
    fn estimates_fall_back_to_size_ratio_without_statistics() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let config = MapperConfig::default();

        let cache = StubCache::default().with_size("Order", 40).with_size("Customer", 10);
        let ctx = MapperContext::new(&cache, &schema, &config);
        assert_eq!(mapper.estimate_selectivity(&ctx), 4.0);
        assert_eq!(mapper.estimate_max_result_size(3, &ctx), 10);

        let empty = StubCache::default().with_size("Order", 40);
        let ctx = MapperContext::new(&empty, &schema, &config);
        assert_eq!(mapper.estimate_selectivity(&ctx), 0.0);
        assert_eq!(mapper.estimate_max_result_size(3, &ctx), 0);
    }

    #[test]
    fn estimates_use_index_statistics_when_initialized() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let config = MapperConfig::default();
        let cache = StubCache::default()
            .with_size("Order", 40)
            .with_size("Customer", 10)
            .with_index(
                "Customer",
                IndexHandle {
                    valid: true,
                    unique: true,
                    initialized: true,
                    avg_size: 1.0,
                    max_size: 1,
                    ..IndexHandle::default()
                },
            );
        let ctx = MapperContext::new(&cache, &schema, &config);
        assert_eq!(mapper.estimate_selectivity(&ctx), 1.0);
        assert_eq!(mapper.estimate_max_result_size(7, &ctx), 7);
        assert!(mapper.is_using_unique_index(&ctx));
        assert!(!mapper.is_using_non_unique_index(&ctx));
        assert!(!mapper.is_using_immutable_unique_index(&ctx));
    }

    #[test]
    fn plan_requires_valid_index_and_cached_far_side() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let config = MapperConfig::default();

        let no_index = StubCache::default().fully_cached("Customer");
        let ctx = MapperContext::new(&no_index, &schema, &config);
        assert_eq!(
            mapper.resolution_plan(&ctx),
            ResolutionPlan::Remote(RemoteReason::NoValidIndex)
        );
        assert_eq!(mapper.map(&[], &ctx), Some(Vec::new()));

        let non_unique_partial = StubCache::default().with_index(
            "Customer",
            IndexHandle {
                valid: true,
                ..IndexHandle::default()
            },
        );
        let ctx = MapperContext::new(&non_unique_partial, &schema, &config);
        assert_eq!(
            mapper.resolution_plan(&ctx),
            ResolutionPlan::Remote(RemoteReason::NotFullyCached)
        );
    }

    #[test]
    fn partially_cached_far_side_is_remote_unless_opted_in() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let unique_partial = StubCache::default().with_index(
            "Customer",
            IndexHandle {
                valid: true,
                unique: true,
                ..IndexHandle::default()
            },
        );

        let config = MapperConfig::default();
        let ctx = MapperContext::new(&unique_partial, &schema, &config);
        assert_eq!(
            mapper.resolution_plan(&ctx),
            ResolutionPlan::Remote(RemoteReason::NotFullyCached)
        );
        assert_eq!(mapper.map(&[DomainObject::of("Order").set("customerId", 1).build()], &ctx), None);

        let permissive = MapperConfig {
            allow_partial_cache_hits: true,
            ..MapperConfig::default()
        };
        let ctx = MapperContext::new(&unique_partial, &schema, &permissive);
        assert_eq!(
            mapper.resolution_plan(&ctx),
            ResolutionPlan::InMemory { unique: true }
        );
    }

    #[test]
    fn simplified_join_op_respects_the_in_clause_cap() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let orders: Vec<ObjectRef> = (0..5)
            .map(|i| DomainObject::of("Order").set("id", i).set("customerId", i % 3).build())
            .collect();

        let op = mapper.simplified_join_op(&orders, 10).unwrap();
        let customer_id = schema.field("Customer", "id").unwrap();
        assert_eq!(
            op,
            Operation::in_values(&customer_id, vec![Value::from(0), Value::from(1), Value::from(2)])
        );
        assert!(mapper.simplified_join_op(&orders, 2).is_none());
        assert!(mapper.simplified_join_op(&[], 10).is_none());
    }

    #[test]
    fn attach_groups_fetched_rows_under_parents() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let o1 = DomainObject::of("Order").set("id", 1).set("customerId", 2).build();
        let o2 = DomainObject::of("Order").set("id", 2).set("customerId", 9).build();
        let c2 = DomainObject::of("Customer").set("id", 2).build();
        let orphan = DomainObject::of("Customer").build();

        let attached = mapper.attach(&[o1.clone(), o2.clone()], &[c2.clone(), orphan]).unwrap();
        assert_eq!(attached, vec![(o1, vec![c2]), (o2, Vec::new())]);
    }

    #[test]
    fn temp_join_requires_an_entry_for_left() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let order_cid = schema.field("Order", "customerId").unwrap();
        let temp = schema.field("Order", "id").unwrap();

        let err = mapper.create_mapper_for_temp_join(&HashMap::new()).unwrap_err();
        assert!(matches!(err, MapperError::MissingTempJoinAttribute { .. }));

        let substitutions = HashMap::from([(order_cid.clone(), temp.clone())]);
        let rerooted = mapper.create_mapper_for_temp_join(&substitutions).unwrap();
        assert_eq!(rerooted.left(), &Attribute::Direct(temp));
        assert!(mapper.is_mappable_for_temp_join(&[order_cid]));

        let prototype = DomainObject::of("Order").set("customerId", 4).build();
        let step = mapper.create_operation_or_mapper_for_temp_join(&HashMap::new(), &prototype);
        assert_eq!(
            step,
            TempJoinStep::Operation(Operation::eq(&schema.field("Customer", "id").unwrap(), 4))
        );
    }

    #[test]
    fn refresh_operations_bind_the_opposite_side() {
        let schema = order_customer_schema();
        let mapper = order_to_customer(&schema);
        let order = DomainObject::of("Order").set("customerId", 3).build();
        let customer = DomainObject::of("Customer").set("id", 3).build();

        assert_eq!(
            mapper.operation_from_original(&order),
            Some(Operation::eq(&schema.field("Customer", "id").unwrap(), 3))
        );
        assert_eq!(
            mapper.operation_from_result(&customer),
            Some(Operation::eq(&schema.field("Order", "customerId").unwrap(), 3))
        );
    }

    #[test]
    fn triangle_join_needs_two_distinct_mapped_sides() {
        let schema = order_customer_schema();
        let to_customer: Mapper = order_to_customer(&schema).into();
        let customer_id = schema.field("Customer", "id").unwrap();
        let customer_name = schema.field("Customer", "name").unwrap();

        let same_hop = EqualityMapper::new(
            Attribute::mapped(to_customer.clone(), customer_id.clone()),
            Attribute::mapped(to_customer.clone(), customer_name),
        );
        assert!(!same_hop.detect_triangle_join());

        let plain = order_to_customer(&schema);
        assert!(!plain.detect_triangle_join());
        assert!(!plain.has_triangle_joins());
        assert_eq!(
            plain.dependent_entities().len(),
            2,
            "Order and Customer only"
        );
    }
}
