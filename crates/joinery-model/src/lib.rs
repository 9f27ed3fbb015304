//! Joinery model: the leaf types every other crate speaks.
//!
//! - [`Value`]: totally ordered attribute values (including timestamps for
//!   as-of attributes)
//! - [`Schema`]: entity metadata registry (tables, columns, as-of and source
//!   attributes, primary keys)
//! - [`DomainObject`]: immutable in-memory objects held by the object cache

pub mod object;
pub mod schema;
pub mod value;

pub use object::{DomainObject, DomainObjectBuilder, ObjectRef};
pub use schema::{
    EntityBuilder, EntityMeta, EntityName, Field, FieldDef, FieldKind, Schema, SchemaBuilder,
    SchemaError,
};
pub use value::Value;
