//! In-memory domain objects.
//!
//! A [`DomainObject`] is a flat, immutable bag of named values tagged with its
//! entity. Objects compare and hash by value so result sets can be intersected
//! and deduplicated without an identity map.

use crate::schema::{EntityName, Field};
use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

static NULL_VALUE: Value = Value::Null;

/// Shared handle to a cached object.
pub type ObjectRef = Arc<DomainObject>;

#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct DomainObject {
    entity: EntityName,
    values: BTreeMap<Arc<str>, Value>,
}

impl DomainObject {
    pub fn new(entity: EntityName, values: BTreeMap<Arc<str>, Value>) -> Self {
        Self { entity, values }
    }

    /// Start building an object of `entity`.
    pub fn of(entity: &str) -> DomainObjectBuilder {
        DomainObjectBuilder {
            entity: EntityName::new(entity),
            values: BTreeMap::new(),
        }
    }

    pub fn entity(&self) -> &EntityName {
        &self.entity
    }

    /// Value stored under `name`; `Null` when absent.
    pub fn value(&self, name: &str) -> &Value {
        self.values.get(name).unwrap_or(&NULL_VALUE)
    }

    /// Value of `field`. Fields owned by another entity read as `Null`.
    pub fn value_of(&self, field: &Field) -> &Value {
        if field.owner() != &self.entity {
            return &NULL_VALUE;
        }
        self.value(field.name())
    }

    /// Tuple of values for `fields`, in order.
    pub fn key(&self, fields: &[Field]) -> Vec<Value> {
        fields.iter().map(|f| self.value_of(f).clone()).collect()
    }

    pub fn values(&self) -> impl Iterator<Item = (&str, &Value)> {
        self.values.iter().map(|(k, v)| (k.as_ref(), v))
    }
}

impl fmt::Debug for DomainObject {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{{", self.entity)?;
        for (i, (name, value)) in self.values.iter().enumerate() {
            if i > 0 {
                f.write_str(", ")?;
            }
            write!(f, "{name}: {value}")?;
        }
        f.write_str("}")
    }
}

#[derive(Debug)]
pub struct DomainObjectBuilder {
    entity: EntityName,
    values: BTreeMap<Arc<str>, Value>,
}

impl DomainObjectBuilder {
    pub fn set(mut self, name: &str, value: impl Into<Value>) -> Self {
        self.values.insert(Arc::from(name), value.into());
        self
    }

    pub fn build(self) -> ObjectRef {
        Arc::new(DomainObject {
            entity: self.entity,
            values: self.values,
        })
    }
}
