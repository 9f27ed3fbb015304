//! Attribute references: a direct field, or a field reached by first
//! traversing another mapper.

use crate::mapper::Mapper;
use joinery_model::{EntityName, Field};
use std::fmt;
use std::sync::Arc;

#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum Attribute {
    Direct(Field),
    Mapped(Arc<MappedAttribute>),
}

/// `wrapped`, reached from `mapper`'s near entity by traversing `mapper`.
#[derive(Debug, PartialEq, Eq, Hash)]
pub struct MappedAttribute {
    pub mapper: Mapper,
    pub wrapped: Attribute,
}

impl Attribute {
    pub fn mapped(mapper: Mapper, wrapped: impl Into<Attribute>) -> Self {
        Attribute::Mapped(Arc::new(MappedAttribute {
            mapper,
            wrapped: wrapped.into(),
        }))
    }

    /// Entity that holds the value.
    pub fn owner(&self) -> &EntityName {
        match self {
            Attribute::Direct(field) => field.owner(),
            Attribute::Mapped(m) => m.wrapped.owner(),
        }
    }

    /// Entity where navigation to this attribute starts.
    pub fn top_owner(&self) -> &EntityName {
        match self {
            Attribute::Direct(field) => field.owner(),
            Attribute::Mapped(m) => m.mapper.near_entity(),
        }
    }

    /// The direct field finally reached.
    pub fn terminal(&self) -> &Field {
        match self {
            Attribute::Direct(field) => field,
            Attribute::Mapped(m) => m.wrapped.terminal(),
        }
    }

    pub fn as_direct(&self) -> Option<&Field> {
        match self {
            Attribute::Direct(field) => Some(field),
            Attribute::Mapped(_) => None,
        }
    }

    pub fn as_mapped(&self) -> Option<&MappedAttribute> {
        match self {
            Attribute::Direct(_) => None,
            Attribute::Mapped(m) => Some(m),
        }
    }

    pub fn is_mapped(&self) -> bool {
        matches!(self, Attribute::Mapped(_))
    }

    pub fn is_as_of(&self) -> bool {
        self.terminal().is_as_of()
    }

    pub fn is_source(&self) -> bool {
        self.terminal().is_source()
    }

    /// Mapper chain walked before the terminal field applies, outermost first.
    pub fn mapper_chain(&self) -> Vec<&Mapper> {
        let mut chain = Vec::new();
        let mut current = self;
        while let Attribute::Mapped(m) = current {
            chain.push(&m.mapper);
            current = &m.wrapped;
        }
        chain
    }

    /// Name used in synthetic relationship names: `field` or `far.path`.
    pub fn path_name(&self) -> String {
        match self {
            Attribute::Direct(field) => field.name().to_string(),
            Attribute::Mapped(m) => {
                format!("{}.{}", m.mapper.far_entity(), m.wrapped.path_name())
            }
        }
    }
}

impl From<Field> for Attribute {
    fn from(field: Field) -> Self {
        Attribute::Direct(field)
    }
}

impl From<&Field> for Attribute {
    fn from(field: &Field) -> Self {
        Attribute::Direct(field.clone())
    }
}

impl fmt::Display for Attribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Attribute::Direct(field) => write!(f, "{field}"),
            Attribute::Mapped(m) => write!(f, "{}{}", m.mapper, m.wrapped),
        }
    }
}
