//! Joinery reference cache: an in-memory object store behind
//! [`CacheLayer`].
//!
//! - one store per registered entity, in a `DashMap`, each behind its own
//!   `parking_lot::RwLock`
//! - unique and non-unique indices mapping key tuples to roaring bitmaps of
//!   object slots
//! - a generation stamp per entity, drawn from one process-wide counter, bumped
//!   on every mutation so memoized index handles refresh
//! - fully cached entities answer any single-entity predicate; partially
//!   cached ones only answer complete unique-index hits

mod index;


pub use index::IndexOptions;

use ahash::AHashMap;
use dashmap::DashMap;
use index::ObjectIndex;
use joinery_core::{CacheGeneration, CacheLayer, IndexHandle, Operation};
use joinery_model::{EntityMeta, EntityName, Field, ObjectRef, SchemaError, Value};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use thiserror::Error;

static NEXT_GENERATION: AtomicU64 = AtomicU64::new(1);

/// Fresh stamp, unique across every cache in the process.
fn next_generation() -> CacheGeneration {
    CacheGeneration(NEXT_GENERATION.fetch_add(1, Ordering::SeqCst))
}

// ============================================================================
// Errors
// ============================================================================

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("entity `{0}` is not registered with the cache")]
    UnregisteredEntity(EntityName),

    #[error("entity `{0}` is already registered")]
    AlreadyRegistered(EntityName),

    #[error("an index needs at least one field (entity `{0}`)")]
    EmptyIndex(EntityName),

    #[error("unique index {entity}({fields}) already holds key {key}")]
    UniqueViolation {
        entity: EntityName,
        fields: String,
        key: String,
    },

    #[error(transparent)]
    Schema(#[from] SchemaError),
}

pub type Result<T, E = CacheError> = std::result::Result<T, E>;

// ============================================================================
// Store
// ============================================================================

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum CacheMode {
    /// Every object of the entity is cached.
    Full,
    /// Only some objects are cached; misses may exist remotely.
    Partial,
}

#[derive(Debug)]
struct EntityStore {
    meta: Arc<EntityMeta>,
    mode: CacheMode,
    generation: CacheGeneration,
    loaded: bool,
    objects: Vec<ObjectRef>,
    by_key: AHashMap<Vec<Value>, u32>,
    indices: Vec<ObjectIndex>,
}

impl EntityStore {
    fn new(meta: Arc<EntityMeta>, mode: CacheMode) -> Self {
        Self {
            meta,
            mode,
            generation: next_generation(),
            loaded: false,
            objects: Vec::new(),
            by_key: AHashMap::new(),
            indices: Vec::new(),
        }
    }

    fn identity(&self, object: &ObjectRef) -> Option<Vec<Value>> {
        let pk = self.meta.primary_key();
        if pk.is_empty() {
            None
        } else {
            Some(object.key(pk))
        }
    }

    fn insert(&mut self, object: ObjectRef) -> Result<()> {
        let identity = self.identity(&object);
        let existing = identity.as_ref().and_then(|k| self.by_key.get(k)).copied();
        let slot = existing.unwrap_or(self.objects.len() as u32);

        for index in &self.indices {
            if index.conflict(&object, slot).is_some() {
                return Err(CacheError::UniqueViolation {
                    entity: self.meta.name().clone(),
                    fields: field_names(index.fields()),
                    key: format!("{:?}", index.key_of(&object).unwrap_or_default()),
                });
            }
        }

        match existing {
            Some(slot) => {
                let previous = std::mem::replace(&mut self.objects[slot as usize], object.clone());
                for index in &mut self.indices {
                    index.remove(&previous, slot);
                    index.insert(&object, slot);
                }
            }
            None => {
                for index in &mut self.indices {
                    index.insert(&object, slot);
                }
                if let Some(identity) = identity {
                    self.by_key.insert(identity, slot);
                }
                self.objects.push(object);
            }
        }
        self.loaded = true;
        Ok(())
    }

    /// Same entity and index definitions, no objects.
    fn emptied(&self) -> Self {
        Self {
            meta: Arc::clone(&self.meta),
            mode: self.mode,
            generation: self.generation,
            loaded: false,
            objects: Vec::new(),
            by_key: AHashMap::new(),
            indices: self
                .indices
                .iter()
                .map(|index| ObjectIndex::new(index.fields().to_vec(), index.options()))
                .collect(),
        }
    }

    fn clear(&mut self) {
        self.objects.clear();
        self.by_key.clear();
        for index in &mut self.indices {
            index.clear();
        }
    }

    fn touch(&mut self) {
        self.generation = next_generation();
    }

    /// Best index over a subset of `fields`: unique first, then widest.
    fn best_index(&self, fields: &[Field]) -> Option<&ObjectIndex> {
        self.indices
            .iter()
            .filter(|index| index.fields().iter().all(|f| fields.contains(f)))
            .max_by_key(|index| (index.options().unique, index.fields().len()))
    }

    fn slots(&self, bitmap: &roaring::RoaringBitmap) -> Vec<ObjectRef> {
        bitmap
            .iter()
            .filter_map(|slot| self.objects.get(slot as usize).cloned())
            .collect()
    }

    fn resolve(&self, op: &Operation) -> Option<Vec<ObjectRef>> {
        if matches!(op, Operation::None(_)) {
            return Some(Vec::new());
        }

        let constraints = equality_constraints(op);
        let constrained: Vec<Field> = constraints.keys().cloned().collect();
        let candidates = match self.best_index(&constrained) {
            Some(index) => {
                let keys = key_combinations(index.fields(), &constraints);
                let mut hits = roaring::RoaringBitmap::new();
                let mut complete = true;
                for key in &keys {
                    match index.get(key) {
                        Some(bucket) => hits |= bucket,
                        None => complete = false,
                    }
                }
                if self.mode == CacheMode::Partial && !(index.options().unique && complete) {
                    return None;
                }
                self.slots(&hits)
            }
            None if self.mode == CacheMode::Full => self.objects.clone(),
            None => return None,
        };
        op.filter(candidates)
    }
}

fn field_names(fields: &[Field]) -> String {
    fields
        .iter()
        .map(|f| f.name())
        .collect::<Vec<_>>()
        .join(", ")
}

/// Allowed values per field from top-level `Eq` / `In` conjuncts.
fn equality_constraints(op: &Operation) -> AHashMap<Field, BTreeSet<Value>> {
    let mut constraints: AHashMap<Field, BTreeSet<Value>> = AHashMap::new();
    for conjunct in op.conjuncts() {
        let (field, values): (&Field, BTreeSet<Value>) = match conjunct {
            Operation::Eq(field, value) if value.is_null() => (field, BTreeSet::new()),
            Operation::Eq(field, value) => (field, BTreeSet::from([value.clone()])),
            Operation::In(field, values) => (field, values.iter().cloned().collect()),
            _ => continue,
        };
        constraints
            .entry(field.clone())
            .and_modify(|known| known.retain(|v| values.contains(v)))
            .or_insert(values);
    }
    constraints
}

fn key_combinations(
    fields: &[Field],
    constraints: &AHashMap<Field, BTreeSet<Value>>,
) -> Vec<Vec<Value>> {
    let mut keys: Vec<Vec<Value>> = vec![Vec::new()];
    for field in fields {
        let Some(values) = constraints.get(field) else {
            return Vec::new();
        };
        keys = keys
            .into_iter()
            .flat_map(|prefix| {
                values.iter().map(move |value| {
                    let mut key = prefix.clone();
                    key.push(value.clone());
                    key
                })
            })
            .collect();
    }
    keys
}

// ============================================================================
// MemoryCache
// ============================================================================

#[derive(Debug, Default)]
pub struct MemoryCache {
    entities: DashMap<EntityName, RwLock<EntityStore>>,
}

impl MemoryCache {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, meta: Arc<EntityMeta>, mode: CacheMode) -> Result<()> {
        let name = meta.name().clone();
        if self.entities.contains_key(&name) {
            return Err(CacheError::AlreadyRegistered(name));
        }
        tracing::debug!(entity = %name, mode = ?mode, "registered entity");
        self.entities
            .insert(name, RwLock::new(EntityStore::new(meta, mode)));
        Ok(())
    }

    /// Index `fields` of `entity`, built over the objects already cached.
    pub fn add_index(&self, entity: &EntityName, fields: &[&str], options: IndexOptions) -> Result<()> {
        let slot = self
            .entities
            .get(entity)
            .ok_or_else(|| CacheError::UnregisteredEntity(entity.clone()))?;
        let mut store = slot.write();
        if fields.is_empty() {
            return Err(CacheError::EmptyIndex(entity.clone()));
        }

        let mut resolved = Vec::with_capacity(fields.len());
        for name in fields {
            let field = store.meta.field(name).cloned().ok_or_else(|| SchemaError::UnknownField {
                entity: entity.clone(),
                field: name.to_string(),
            })?;
            resolved.push(field);
        }

        let mut index = ObjectIndex::new(resolved, options);
        for (position, object) in store.objects.iter().enumerate() {
            let position = position as u32;
            if index.conflict(object, position).is_some() {
                return Err(CacheError::UniqueViolation {
                    entity: entity.clone(),
                    fields: field_names(index.fields()),
                    key: format!("{:?}", index.key_of(object).unwrap_or_default()),
                });
            }
            index.insert(object, position);
        }
        tracing::debug!(
            entity = %entity,
            fields = %field_names(index.fields()),
            unique = options.unique,
            keys = index.distinct_keys(),
            "built index"
        );
        store.indices.push(index);
        store.touch();
        Ok(())
    }

    pub fn insert(&self, object: ObjectRef) -> Result<()> {
        let slot = self
            .entities
            .get(object.entity())
            .ok_or_else(|| CacheError::UnregisteredEntity(object.entity().clone()))?;
        let mut store = slot.write();
        store.insert(object)?;
        store.touch();
        Ok(())
    }

    /// Insert every object; stops at the first failure. Returns how many
    /// were inserted.
    pub fn insert_all(&self, objects: impl IntoIterator<Item = ObjectRef>) -> Result<usize> {
        let mut inserted = 0;
        for object in objects {
            self.insert(object)?;
            inserted += 1;
        }
        Ok(inserted)
    }

    /// Replace `entity`'s contents under one generation bump.
    pub fn reload(&self, entity: &EntityName, objects: Vec<ObjectRef>) -> Result<()> {
        let slot = self
            .entities
            .get(entity)
            .ok_or_else(|| CacheError::UnregisteredEntity(entity.clone()))?;
        let mut store = slot.write();
        let mut staged = store.emptied();
        let count = objects.len();
        if let Err(err) = objects.into_iter().try_for_each(|object| staged.insert(object)) {
            tracing::warn!(entity = %entity, error = %err, "reload rejected, keeping previous contents");
            return Err(err);
        }
        store.objects = staged.objects;
        store.by_key = staged.by_key;
        store.indices = staged.indices;
        store.loaded = true;
        store.touch();
        tracing::debug!(entity = %entity, objects = count, generation = %store.generation, "reloaded entity");
        Ok(())
    }

    pub fn clear(&self, entity: &EntityName) -> Result<()> {
        let slot = self
            .entities
            .get(entity)
            .ok_or_else(|| CacheError::UnregisteredEntity(entity.clone()))?;
        let mut store = slot.write();
        store.clear();
        store.loaded = false;
        store.touch();
        Ok(())
    }

    pub fn mode(&self, entity: &EntityName) -> Option<CacheMode> {
        self.entities.get(entity).map(|slot| slot.read().mode)
    }

    pub fn objects(&self, entity: &EntityName) -> Vec<ObjectRef> {
        self.entities
            .get(entity)
            .map(|slot| slot.read().objects.clone())
            .unwrap_or_default()
    }
}

impl CacheLayer for MemoryCache {
    fn generation(&self, entity: &EntityName) -> CacheGeneration {
        self.entities
            .get(entity)
            .map(|slot| slot.read().generation)
            .unwrap_or_default()
    }

    fn index_handle(&self, entity: &EntityName, fields: &[Field]) -> IndexHandle {
        let Some(slot) = self.entities.get(entity) else {
            return IndexHandle::invalid();
        };
        let store = slot.read();
        let Some(index) = store.best_index(fields) else {
            return IndexHandle::invalid();
        };
        let options = index.options();
        let handle = IndexHandle {
            valid: true,
            unique: options.unique,
            immutable: options.immutable,
            as_of_proxy: store.meta.as_of_fields().next().is_some(),
            initialized: store.loaded,
            avg_size: index.avg_size(),
            max_size: index.max_size(),
        };
        handle
    }

    fn is_fully_cached(&self, entity: &EntityName) -> bool {
        self.mode(entity) == Some(CacheMode::Full)
    }

    fn estimate_size(&self, entity: &EntityName) -> usize {
        self.entities
            .get(entity)
            .map(|slot| slot.read().objects.len())
            .unwrap_or(0)
    }

    fn resolve_in_memory(&self, op: &Operation) -> Option<Vec<ObjectRef>> {
        let entity = op.result_entity()?;
        let slot = self.entities.get(entity)?;
        let store = slot.read();
        store.resolve(op)
    }
}
