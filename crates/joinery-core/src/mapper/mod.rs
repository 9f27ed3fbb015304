//! The join-descriptor (mapper) algebra.
//!
//! A mapper relates *near* objects (owners of its left attributes) to *far*
//! objects (owners of its right attributes):
//!
//! - [`EqualityMapper`]: one `left = right` pair, either side possibly a
//!   mapped attribute; its reverse is the same shared pair viewed flipped
//! - [`MultiEqualityMapper`]: AND of single equalities on one entity pair
//!   (composite keys)
//! - [`FilteredMapper`]: a base mapper plus a near-side pre-filter and/or a
//!   far-side post-filter inserted at a chain position
//!
//! Combination under AND is an explicit table over `(variant, variant)`; see
//! [`Mapper::and`].
//!
//! Direction: `map(near)` returns far objects and probes the far-side lookup
//! index on `right`; `map_back(far)` returns near objects and probes the index
//! on `left`. Both return `None` when the lookup must go remote, and
//! `Some(vec![])` for a valid empty result.

mod equality;
mod filtered;
mod multi;

pub use equality::{EqualityMapper, JoinIndex, TempJoinStep};
pub use filtered::FilteredMapper;
pub use multi::MultiEqualityMapper;

use crate::cache::MapperContext;
use crate::error::Result;
use crate::index::IndexHandle;
use crate::operation::Operation;
use crate::sql::RemoteQueryBuilder;
use crate::stack::MapperStack;
use ahash::AHashSet;
use joinery_model::{EntityName, Field, ObjectRef, Schema, Value};
use std::collections::BTreeSet;
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Mapper {
    Equality(EqualityMapper),
    MultiEquality(MultiEqualityMapper),
    Filtered(Arc<FilteredMapper>),
}

impl From<EqualityMapper> for Mapper {
    fn from(mapper: EqualityMapper) -> Self {
        Mapper::Equality(mapper)
    }
}

impl From<MultiEqualityMapper> for Mapper {
    fn from(mapper: MultiEqualityMapper) -> Self {
        Mapper::MultiEquality(mapper)
    }
}

impl From<FilteredMapper> for Mapper {
    fn from(mapper: FilteredMapper) -> Self {
        Mapper::Filtered(Arc::new(mapper))
    }
}

// ============================================================================
// Resolution plan
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum RemoteReason {
    /// The probed entity is source-partitioned and the join does not pin the
    /// source attribute.
    CrossesSourceBoundary,
    NoValidIndex,
    NotFullyCached,
}

impl fmt::Display for RemoteReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            RemoteReason::CrossesSourceBoundary => "crosses source boundary",
            RemoteReason::NoValidIndex => "no valid index",
            RemoteReason::NotFullyCached => "not fully cached",
        })
    }
}

/// In-memory vs. remote decision for one traversal. Re-evaluated on every
/// call.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ResolutionPlan {
    /// `unique`: at most one object per key.
    InMemory { unique: bool },
    Remote(RemoteReason),
}

impl ResolutionPlan {
    pub fn is_in_memory(&self) -> bool {
        matches!(self, ResolutionPlan::InMemory { .. })
    }

    pub fn is_remote(&self) -> bool {
        matches!(self, ResolutionPlan::Remote(_))
    }
}

pub(crate) fn decide(
    mapper: &dyn fmt::Display,
    probed: &EntityName,
    handle: &IndexHandle,
    crosses_source: bool,
    ctx: &MapperContext<'_>,
    allow_partial: bool,
) -> ResolutionPlan {
    let plan = if crosses_source {
        ResolutionPlan::Remote(RemoteReason::CrossesSourceBoundary)
    } else if !handle.valid {
        ResolutionPlan::Remote(RemoteReason::NoValidIndex)
    } else if !ctx.cache.is_fully_cached(probed) && !(allow_partial && handle.unique) {
        ResolutionPlan::Remote(RemoteReason::NotFullyCached)
    } else {
        ResolutionPlan::InMemory {
            unique: handle.unique,
        }
    };
    if let ResolutionPlan::Remote(reason) = plan {
        tracing::debug!(mapper = %mapper, entity = %probed, reason = %reason, "join resolves remotely");
    }
    plan
}

/// `probed` is source-partitioned and `pinned` does not tie its source field.
pub(crate) fn crosses_source(
    schema: &Schema,
    probed: &EntityName,
    pinned: impl Fn(&Field) -> bool,
) -> bool {
    schema
        .source_field(probed)
        .map_or(false, |source| !pinned(&source))
}

// ============================================================================
// Estimates
// ============================================================================

/// Average rows per key from index statistics, else `near / far`. Zero-sized
/// far sides yield 0.
pub(crate) fn selectivity(handle: &IndexHandle, near_size: usize, far_size: usize) -> f64 {
    if handle.has_statistics() {
        return handle.avg_size;
    }
    if far_size == 0 {
        return 0.0;
    }
    near_size as f64 / far_size as f64
}

/// Worst-case result size, never above `far_size`.
pub(crate) fn max_result_size(
    handle: &IndexHandle,
    multiplier: usize,
    near_size: usize,
    far_size: usize,
) -> usize {
    if far_size == 0 {
        return 0;
    }
    let raw = if handle.has_statistics() {
        handle.max_size.saturating_mul(multiplier)
    } else {
        near_size.saturating_mul(multiplier) / far_size
    };
    raw.min(far_size)
}

// ============================================================================
// Object-set helpers
// ============================================================================

/// Members of `left` also present in `right`, in `left` order.
pub(crate) fn intersect(left: Vec<ObjectRef>, right: &[ObjectRef]) -> Vec<ObjectRef> {
    let keep: AHashSet<&ObjectRef> = right.iter().collect();
    left.into_iter().filter(|o| keep.contains(o)).collect()
}

pub(crate) fn dedup(objects: Vec<ObjectRef>) -> Vec<ObjectRef> {
    let mut seen: AHashSet<ObjectRef> = AHashSet::with_capacity(objects.len());
    objects
        .into_iter()
        .filter(|o| seen.insert(o.clone()))
        .collect()
}

/// Distinct non-null values of `field`.
pub(crate) fn values_of(objects: &[ObjectRef], field: &Field) -> Vec<Value> {
    let set: BTreeSet<Value> = objects
        .iter()
        .map(|o| o.value_of(field))
        .filter(|v| !v.is_null())
        .cloned()
        .collect();
    set.into_iter().collect()
}

pub(crate) fn apply_filter(
    objects: Vec<ObjectRef>,
    filter: Option<&Operation>,
) -> Option<Vec<ObjectRef>> {
    match filter {
        Some(op) => op.filter(objects),
        None => Some(objects),
    }
}

/// Cache lookup of objects whose `field` is one of `values`.
pub(crate) fn probe(ctx: &MapperContext<'_>, field: &Field, values: Vec<Value>) -> Option<Vec<ObjectRef>> {
    if values.is_empty() {
        return Some(Vec::new());
    }
    ctx.cache
        .resolve_in_memory(&Operation::in_values(field, values))
}

fn and_filters(a: Option<&Operation>, b: Option<&Operation>) -> Option<Operation> {
    match (a, b) {
        (Some(a), Some(b)) => Some(a.and(b)),
        (Some(op), None) | (None, Some(op)) => Some(op.clone()),
        (None, None) => None,
    }
}

// ============================================================================
// Dispatch
// ============================================================================

impl Mapper {
    /// Wrap `base` with filters; nested filtered mappers collapse.
    pub fn filtered(base: Mapper, pre: Option<Operation>, post: Option<Operation>) -> Mapper {
        match base {
            Mapper::Filtered(inner) => Mapper::from(FilteredMapper::new(
                inner.base().clone(),
                and_filters(inner.pre_filter(), pre.as_ref()),
                and_filters(inner.post_filter(), post.as_ref()),
            )),
            base => Mapper::from(FilteredMapper::new(base, pre, post)),
        }
    }

    pub fn near_entity(&self) -> &EntityName {
        match self {
            Mapper::Equality(m) => m.near_entity(),
            Mapper::MultiEquality(m) => m.near_entity(),
            Mapper::Filtered(m) => m.base().near_entity(),
        }
    }

    pub fn far_entity(&self) -> &EntityName {
        match self {
            Mapper::Equality(m) => m.far_entity(),
            Mapper::MultiEquality(m) => m.far_entity(),
            Mapper::Filtered(m) => m.base().far_entity(),
        }
    }

    /// AND-combination table.
    ///
    /// | self \ other | Equality | Multi | Filtered |
    /// |---|---|---|---|
    /// | Equality | same pair: composite (identical collapse) | fold in | combine bases, keep filters |
    /// | Multi | fold in | merge | combine bases, keep filters |
    /// | Filtered | combine bases, keep filters | combine bases, keep filters | combine bases, AND filters |
    ///
    /// `None`: not combinable (different entity pair, or mapped attributes).
    pub fn and(&self, other: &Mapper) -> Option<Mapper> {
        match (self, other) {
            (Mapper::Equality(a), Mapper::Equality(b)) => a.and_equality(b),
            (Mapper::Equality(single), Mapper::MultiEquality(multi))
            | (Mapper::MultiEquality(multi), Mapper::Equality(single)) => {
                multi.with_component(single).map(Mapper::MultiEquality)
            }
            (Mapper::MultiEquality(a), Mapper::MultiEquality(b)) => {
                a.merge(b).map(Mapper::MultiEquality)
            }
            (Mapper::Filtered(filtered), other) | (other, Mapper::Filtered(filtered)) => {
                filtered.and_mapper(other)
            }
        }
    }

    /// Single-equality components, through filters.
    pub fn equality_components(&self) -> Vec<&EqualityMapper> {
        match self {
            Mapper::Equality(m) => vec![m],
            Mapper::MultiEquality(m) => m.components().iter().collect(),
            Mapper::Filtered(m) => m.base().equality_components(),
        }
    }

    pub fn has_mapped_attributes(&self) -> bool {
        match self {
            Mapper::Equality(m) => m.has_mapped_attributes(),
            Mapper::MultiEquality(_) => false,
            Mapper::Filtered(m) => m.base().has_mapped_attributes(),
        }
    }

    pub fn is_single_level(&self) -> bool {
        !self.has_mapped_attributes()
    }

    pub fn is_reversible(&self) -> bool {
        !self.has_mapped_attributes()
    }

    pub fn reverse(&self) -> Result<Mapper> {
        match self {
            Mapper::Equality(m) => m.reverse().map(Mapper::Equality),
            Mapper::MultiEquality(m) => m.reverse().map(Mapper::MultiEquality),
            Mapper::Filtered(m) => m.reverse().map(Mapper::from),
        }
    }

    pub fn map(&self, near: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        match self {
            Mapper::Equality(m) => m.map(near, ctx),
            Mapper::MultiEquality(m) => m.map(near, ctx),
            Mapper::Filtered(m) => m.map(near, ctx),
        }
    }

    pub fn map_back(&self, far: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        match self {
            Mapper::Equality(m) => m.map_back(far, ctx),
            Mapper::MultiEquality(m) => m.map_back(far, ctx),
            Mapper::Filtered(m) => m.map_back(far, ctx),
        }
    }

    pub fn resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        match self {
            Mapper::Equality(m) => m.resolution_plan(ctx),
            Mapper::MultiEquality(m) => m.resolution_plan(ctx),
            Mapper::Filtered(m) => m.base().resolution_plan(ctx),
        }
    }

    pub fn back_resolution_plan(&self, ctx: &MapperContext<'_>) -> ResolutionPlan {
        match self {
            Mapper::Equality(m) => m.back_resolution_plan(ctx),
            Mapper::MultiEquality(m) => m.back_resolution_plan(ctx),
            Mapper::Filtered(m) => m.base().back_resolution_plan(ctx),
        }
    }

    pub fn lookup_index(&self, ctx: &MapperContext<'_>) -> IndexHandle {
        match self {
            Mapper::Equality(m) => m.lookup_index(ctx),
            Mapper::MultiEquality(m) => m.lookup_index(ctx),
            Mapper::Filtered(m) => m.base().lookup_index(ctx),
        }
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

    /// Both entities are fully cached, so estimates reflect real contents.
    pub fn is_estimatable(&self, ctx: &MapperContext<'_>) -> bool {
        ctx.cache.is_fully_cached(self.near_entity()) && ctx.cache.is_fully_cached(self.far_entity())
    }

    /// Position of the far entity when this mapper is applied at `stack`.
    pub fn far_position(&self, stack: &MapperStack) -> MapperStack {
        match self {
            Mapper::Equality(m) => m.far_position(stack),
            Mapper::MultiEquality(m) => m.far_position(stack),
            Mapper::Filtered(m) => m.base().far_position(stack),
        }
    }

    pub fn generate_sql(&self, builder: &mut dyn RemoteQueryBuilder, stack: &MapperStack) {
        match self {
            Mapper::Equality(m) => m.generate_sql(builder, stack),
            Mapper::MultiEquality(m) => m.generate_sql(builder, stack),
            Mapper::Filtered(m) => m.generate_sql(builder, stack),
        }
    }

    /// Does a join component tie far-side `field` to an as-of attribute of the
    /// near side?
    pub fn pins_as_of(&self, field: &Field) -> bool {
        self.equality_components()
            .iter()
            .any(|component| component.pins_as_of(field))
    }

    /// Default-date predicates for the far entity's unpinned as-of fields.
    pub fn default_as_of_operations(&self, schema: &Schema, ignore: &[Field]) -> Vec<Operation> {
        schema
            .as_of_fields(self.far_entity())
            .into_iter()
            .filter(|field| !ignore.contains(field) && !self.pins_as_of(field))
            .filter_map(|field| {
                field
                    .as_of_default()
                    .cloned()
                    .map(|date| Operation::as_of_eq(&field, date))
            })
            .collect()
    }

    /// Attach `ops` as a far-side filter at `position`, which may sit inside
    /// this mapper's own chain of mapped attributes.
    pub fn insert_operation_in_middle(
        &self,
        position: &MapperStack,
        ops: &Operation,
        stack: &MapperStack,
    ) -> Mapper {
        if &self.far_position(stack) == position {
            return Mapper::filtered(self.clone(), None, Some(ops.clone()));
        }
        match self {
            Mapper::Equality(m) => m.insert_into_chain(position, ops, stack),
            Mapper::MultiEquality(_) => self.clone(),
            Mapper::Filtered(m) => {
                let base = m.base().insert_operation_in_middle(position, ops, stack);
                if &base == m.base() {
                    self.clone()
                } else {
                    Mapper::filtered(base, m.pre_filter().cloned(), m.post_filter().cloned())
                }
            }
        }
    }

    /// As [`Self::insert_operation_in_middle`] for as-of predicates, dropping
    /// the ones this mapper already pins at `position`.
    pub fn insert_as_of_operation_in_middle(
        &self,
        ops: &[Operation],
        position: &MapperStack,
        stack: &MapperStack,
    ) -> Mapper {
        let at_far = &self.far_position(stack) == position;
        let kept = ops.iter().filter(|op| match op {
            Operation::AsOfEq(field, _) => !(at_far && self.pins_as_of(field)),
            _ => true,
        });
        match Operation::and_all(kept.cloned()) {
            Some(op) => self.insert_operation_in_middle(position, &op, stack),
            None => self.clone(),
        }
    }

    pub fn dependent_entities(&self) -> BTreeSet<EntityName> {
        match self {
            Mapper::Equality(m) => m.dependent_entities(),
            Mapper::MultiEquality(m) => m.dependent_entities(),
            Mapper::Filtered(m) => m.base().dependent_entities(),
        }
    }

    pub fn dependent_attributes(&self) -> Vec<Field> {
        match self {
            Mapper::Equality(m) => m.dependent_attributes(),
            Mapper::MultiEquality(m) => m.dependent_attributes(),
            Mapper::Filtered(m) => m.base().dependent_attributes(),
        }
    }

    pub fn has_triangle_joins(&self) -> bool {
        match self {
            Mapper::Equality(m) => m.has_triangle_joins(),
            Mapper::MultiEquality(_) => false,
            Mapper::Filtered(m) => m.base().has_triangle_joins(),
        }
    }

    /// The single-hop mappers this mapper is built from, near to far.
    pub fn unchained_mappers(&self) -> Vec<Mapper> {
        match self {
            Mapper::Equality(m) => m.unchained_mappers(),
            _ => vec![self.clone()],
        }
    }
}

impl fmt::Display for Mapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Mapper::Equality(m) => write!(f, "{m}"),
            Mapper::MultiEquality(m) => write!(f, "{m}"),
            Mapper::Filtered(m) => write!(f, "{m}"),
        }
    }
}
