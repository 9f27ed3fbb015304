//! Chain positions.
//!
//! A [`MapperStack`] names a position in a join chain by the mappers applied
//! to reach it from the root entity. Stacks are values: recursive walks pass
//! `stack.pushed(mapper)` down instead of mutating a shared stack, and two
//! positions are the same iff they hold structurally equal mappers in the
//! same order.

use crate::mapper::Mapper;
use std::fmt;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash)]
pub struct MapperStack {
    mappers: Vec<Mapper>,
}

impl MapperStack {
    /// Position of the root entity.
    pub fn root() -> Self {
        Self::default()
    }

    pub fn pushed(&self, mapper: impl Into<Mapper>) -> Self {
        let mut mappers = Vec::with_capacity(self.mappers.len() + 1);
        mappers.extend(self.mappers.iter().cloned());
        mappers.push(mapper.into());
        Self { mappers }
    }

    pub fn is_root(&self) -> bool {
        self.mappers.is_empty()
    }

    pub fn depth(&self) -> usize {
        self.mappers.len()
    }

    pub fn last(&self) -> Option<&Mapper> {
        self.mappers.last()
    }

    pub fn mappers(&self) -> &[Mapper] {
        &self.mappers
    }

    /// Is `self` a (non-strict) prefix of `other`?
    pub fn is_prefix_of(&self, other: &MapperStack) -> bool {
        other.mappers.starts_with(&self.mappers)
    }
}

impl fmt::Display for MapperStack {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.mappers.is_empty() {
            return f.write_str("/");
        }
        for mapper in &self.mappers {
            write!(f, "/{mapper}")?;
        }
        Ok(())
    }
}
