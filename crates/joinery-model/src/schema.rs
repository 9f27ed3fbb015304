//! Entity metadata: entity names, field definitions and the schema registry.
//!
//! Fields come in three kinds:
//! - **plain** columns,
//! - **as-of** (temporal) attributes, milestoned by a `from`/`to` column pair
//!   and optionally carrying a default date,
//! - **source** attributes, which discriminate the partition/source an object
//!   was loaded from.
//!
//! A [`Field`] is a cheap `Arc` handle. Two handles are equal iff they name the
//! same field on the same owner entity; column names and kinds do not take
//! part in identity.

use crate::value::Value;
use serde::{Deserialize, Serialize};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::hash::{Hash, Hasher};
use std::sync::Arc;
use thiserror::Error;

// ============================================================================
// Entity names
// ============================================================================

/// Identity of an entity type.
#[derive(Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityName(Arc<str>);

impl EntityName {
    pub fn new(name: impl AsRef<str>) -> Self {
        Self(Arc::from(name.as_ref()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Debug for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl fmt::Display for EntityName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityName {
    fn from(value: &str) -> Self {
        Self::new(value)
    }
}

// ============================================================================
// Fields
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum FieldKind {
    Plain,
    /// Temporal attribute. An object is visible at date `d` when
    /// `from_column <= d < to_column`.
    AsOf {
        from_column: Arc<str>,
        to_column: Arc<str>,
        default: Option<Value>,
    },
    /// Source / partition discriminator.
    Source,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldDef {
    pub owner: EntityName,
    pub name: Arc<str>,
    pub column: Arc<str>,
    pub kind: FieldKind,
}

/// Shared handle to a field definition.
#[derive(Clone)]
pub struct Field(Arc<FieldDef>);

impl Field {
    pub fn new(def: FieldDef) -> Self {
        Self(Arc::new(def))
    }

    pub fn def(&self) -> &FieldDef {
        &self.0
    }

    pub fn owner(&self) -> &EntityName {
        &self.0.owner
    }

    pub fn name(&self) -> &str {
        &self.0.name
    }

    pub fn column(&self) -> &str {
        &self.0.column
    }

    pub fn kind(&self) -> &FieldKind {
        &self.0.kind
    }

    pub fn is_as_of(&self) -> bool {
        matches!(self.0.kind, FieldKind::AsOf { .. })
    }

    pub fn is_source(&self) -> bool {
        matches!(self.0.kind, FieldKind::Source)
    }

    /// Default date of an as-of attribute, if it declares one.
    pub fn as_of_default(&self) -> Option<&Value> {
        match &self.0.kind {
            FieldKind::AsOf { default, .. } => default.as_ref(),
            _ => None,
        }
    }

    /// `(from, to)` milestone columns of an as-of attribute.
    pub fn milestone_columns(&self) -> Option<(&str, &str)> {
        match &self.0.kind {
            FieldKind::AsOf {
                from_column,
                to_column,
                ..
            } => Some((from_column, to_column)),
            _ => None,
        }
    }
}

impl PartialEq for Field {
    fn eq(&self, other: &Self) -> bool {
        Arc::ptr_eq(&self.0, &other.0)
            || (self.0.owner == other.0.owner && self.0.name == other.0.name)
    }
}

impl Eq for Field {}

impl Hash for Field {
    fn hash<H: Hasher>(&self, state: &mut H) {
        self.0.owner.hash(state);
        self.0.name.hash(state);
    }
}

impl PartialOrd for Field {
    fn partial_cmp(&self, other: &Self) -> Option<Ordering> {
        Some(self.cmp(other))
    }
}

impl Ord for Field {
    fn cmp(&self, other: &Self) -> Ordering {
        (&self.0.owner, &self.0.name).cmp(&(&other.0.owner, &other.0.name))
    }
}

impl fmt::Debug for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.owner, self.0.name)
    }
}

impl fmt::Display for Field {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.0.owner, self.0.name)
    }
}

// ============================================================================
// Entity metadata + registry
// ============================================================================

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SchemaError {
    #[error("unknown entity `{0}`")]
    UnknownEntity(EntityName),

    #[error("unknown field `{entity}.{field}`")]
    UnknownField { entity: EntityName, field: String },

    #[error("entity `{0}` is declared twice")]
    DuplicateEntity(EntityName),

    #[error("field `{entity}.{field}` is declared twice")]
    DuplicateField { entity: EntityName, field: String },

    #[error("entity `{0}` declares more than one source attribute")]
    MultipleSourceFields(EntityName),
}

#[derive(Debug, Clone)]
pub struct EntityMeta {
    name: EntityName,
    table: Arc<str>,
    fields: Vec<Field>,
    primary_key: Vec<Field>,
}

impl EntityMeta {
    pub fn name(&self) -> &EntityName {
        &self.name
    }

    pub fn table(&self) -> &str {
        &self.table
    }

    pub fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub fn primary_key(&self) -> &[Field] {
        &self.primary_key
    }

    pub fn field(&self, name: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.name() == name)
    }

    pub fn field_by_column(&self, column: &str) -> Option<&Field> {
        self.fields.iter().find(|f| f.column() == column)
    }

    /// Temporal attributes, in declaration order.
    pub fn as_of_fields(&self) -> impl Iterator<Item = &Field> {
        self.fields.iter().filter(|f| f.is_as_of())
    }

    pub fn source_field(&self) -> Option<&Field> {
        self.fields.iter().find(|f| f.is_source())
    }
}

/// Registry of every entity the engine knows about.
#[derive(Debug, Clone, Default)]
pub struct Schema {
    entities: HashMap<EntityName, Arc<EntityMeta>>,
}

impl Schema {
    pub fn builder() -> SchemaBuilder {
        SchemaBuilder::default()
    }

    pub fn get(&self, entity: &EntityName) -> Option<&Arc<EntityMeta>> {
        self.entities.get(entity)
    }

    pub fn entity(&self, entity: &EntityName) -> Result<&Arc<EntityMeta>, SchemaError> {
        self.entities
            .get(entity)
            .ok_or_else(|| SchemaError::UnknownEntity(entity.clone()))
    }

    /// Look up a field by `(entity, name)`.
    pub fn field(&self, entity: &str, name: &str) -> Result<Field, SchemaError> {
        let entity = EntityName::new(entity);
        let meta = self.entity(&entity)?;
        meta.field(name)
            .cloned()
            .ok_or_else(|| SchemaError::UnknownField {
                entity,
                field: name.to_string(),
            })
    }

    /// Temporal attributes of `entity`; empty for unknown entities.
    pub fn as_of_fields(&self, entity: &EntityName) -> Vec<Field> {
        self.entities
            .get(entity)
            .map(|meta| meta.as_of_fields().cloned().collect())
            .unwrap_or_default()
    }

    pub fn source_field(&self, entity: &EntityName) -> Option<Field> {
        self.entities
            .get(entity)
            .and_then(|meta| meta.source_field().cloned())
    }

    pub fn entities(&self) -> impl Iterator<Item = &Arc<EntityMeta>> {
        self.entities.values()
    }
}

#[derive(Debug, Default)]
pub struct SchemaBuilder {
    entities: Vec<EntityBuilder>,
}

impl SchemaBuilder {
    pub fn entity(mut self, entity: EntityBuilder) -> Self {
        self.entities.push(entity);
        self
    }

    pub fn build(self) -> Result<Schema, SchemaError> {
        let mut entities = HashMap::with_capacity(self.entities.len());
        for builder in self.entities {
            let meta = builder.build()?;
            let name = meta.name.clone();
            if entities.insert(name.clone(), Arc::new(meta)).is_some() {
                return Err(SchemaError::DuplicateEntity(name));
            }
        }
        Ok(Schema { entities })
    }
}

#[derive(Debug)]
pub struct EntityBuilder {
    name: EntityName,
    table: Option<String>,
    fields: Vec<(String, String, FieldKind)>,
    key: Vec<String>,
}

impl EntityBuilder {
    pub fn new(name: &str) -> Self {
        Self {
            name: EntityName::new(name),
            table: None,
            fields: Vec::new(),
            key: Vec::new(),
        }
    }

    pub fn table(mut self, table: &str) -> Self {
        self.table = Some(table.to_string());
        self
    }

    pub fn field(mut self, name: &str, column: &str) -> Self {
        self.fields
            .push((name.to_string(), column.to_string(), FieldKind::Plain));
        self
    }

    pub fn as_of(
        mut self,
        name: &str,
        from_column: &str,
        to_column: &str,
        default: Option<Value>,
    ) -> Self {
        self.fields.push((
            name.to_string(),
            from_column.to_string(),
            FieldKind::AsOf {
                from_column: Arc::from(from_column),
                to_column: Arc::from(to_column),
                default,
            },
        ));
        self
    }

    pub fn source(mut self, name: &str, column: &str) -> Self {
        self.fields
            .push((name.to_string(), column.to_string(), FieldKind::Source));
        self
    }

    pub fn key(mut self, fields: &[&str]) -> Self {
        self.key = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    fn build(self) -> Result<EntityMeta, SchemaError> {
        let table = self
            .table
            .unwrap_or_else(|| self.name.as_str().to_ascii_uppercase());

        let mut fields: Vec<Field> = Vec::with_capacity(self.fields.len());
        for (name, column, kind) in self.fields {
            if fields.iter().any(|f| f.name() == name) {
                return Err(SchemaError::DuplicateField {
                    entity: self.name.clone(),
                    field: name,
                });
            }
            fields.push(Field::new(FieldDef {
                owner: self.name.clone(),
                name: Arc::from(name),
                column: Arc::from(column),
                kind,
            }));
        }

        if fields.iter().filter(|f| f.is_source()).count() > 1 {
            return Err(SchemaError::MultipleSourceFields(self.name));
        }

        let mut primary_key = Vec::with_capacity(self.key.len());
        for key in &self.key {
            let field = fields.iter().find(|f| f.name() == key).ok_or_else(|| {
                SchemaError::UnknownField {
                    entity: self.name.clone(),
                    field: key.clone(),
                }
            })?;
            primary_key.push(field.clone());
        }

        Ok(EntityMeta {
            name: self.name,
            table: Arc::from(table),
            fields,
            primary_key,
        })
    }
}
