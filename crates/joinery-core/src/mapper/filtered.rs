//! A mapper plus extra predicates applied on either side of the join.

use super::{and_filters, apply_filter, Mapper};
use crate::cache::MapperContext;
use crate::error::Result;
use crate::operation::Operation;
use crate::sql::RemoteQueryBuilder;
use crate::stack::MapperStack;
use joinery_model::ObjectRef;
use std::fmt;

/// `pre` narrows near objects before the join, `post` narrows far objects
/// after it. The chain position of a filtered mapper is its base's.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FilteredMapper {
    base: Mapper,
    pre: Option<Operation>,
    post: Option<Operation>,
}

impl FilteredMapper {
    pub fn new(base: Mapper, pre: Option<Operation>, post: Option<Operation>) -> Self {
        Self { base, pre, post }
    }

    pub fn base(&self) -> &Mapper {
        &self.base
    }

    pub fn pre_filter(&self) -> Option<&Operation> {
        self.pre.as_ref()
    }

    pub fn post_filter(&self) -> Option<&Operation> {
        self.post.as_ref()
    }

    pub(crate) fn and_mapper(&self, other: &Mapper) -> Option<Mapper> {
        match other {
            Mapper::Filtered(other) => {
                let base = self.base.and(&other.base)?;
                Some(Mapper::filtered(
                    base,
                    and_filters(self.pre_filter(), other.pre_filter()),
                    and_filters(self.post_filter(), other.post_filter()),
                ))
            }
            other => {
                let base = self.base.and(other)?;
                Some(Mapper::filtered(base, self.pre.clone(), self.post.clone()))
            }
        }
    }

    /// Reverse the base; the filters swap sides with it.
    pub fn reverse(&self) -> Result<FilteredMapper> {
        Ok(Self::new(
            self.base.reverse()?,
            self.post.clone(),
            self.pre.clone(),
        ))
    }

    pub fn map(&self, near: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        let near = apply_filter(near.to_vec(), self.pre_filter())?;
        let far = self.base.map(&near, ctx)?;
        apply_filter(far, self.post_filter())
    }

    pub fn map_back(&self, far: &[ObjectRef], ctx: &MapperContext<'_>) -> Option<Vec<ObjectRef>> {
        let far = apply_filter(far.to_vec(), self.post_filter())?;
        let near = self.base.map_back(&far, ctx)?;
        apply_filter(near, self.pre_filter())
    }

    pub fn generate_sql(&self, builder: &mut dyn RemoteQueryBuilder, stack: &MapperStack) {
        self.base.generate_sql(builder, stack);
        if let Some(pre) = &self.pre {
            builder.emit_filter(pre, stack);
        }
        if let Some(post) = &self.post {
            builder.emit_filter(post, &self.base.far_position(stack));
        }
    }
}

impl fmt::Display for FilteredMapper {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.base)?;
        if let Some(pre) = &self.pre {
            write!(f, " pre({pre})")?;
        }
        if let Some(post) = &self.post {
            write!(f, " post({post})")?;
        }
        Ok(())
    }
}
