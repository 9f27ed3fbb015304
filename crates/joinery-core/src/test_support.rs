//! Fixtures shared by the unit tests.

use crate::cache::CacheLayer;
use crate::index::{CacheGeneration, IndexHandle};
use crate::operation::Operation;
use joinery_model::{EntityBuilder, EntityName, Field, ObjectRef, Schema};
use std::collections::{HashMap, HashSet};

/// Order(id, customerId) and Customer(id, name).
pub fn order_customer_schema() -> Schema {
    Schema::builder()
        .entity(
            EntityBuilder::new("Order")
                .field("id", "ID")
                .field("customerId", "CUSTOMER_ID")
                .key(&["id"]),
        )
        .entity(
            EntityBuilder::new("Customer")
                .field("id", "ID")
                .field("name", "NAME")
                .key(&["id"]),
        )
        .build()
        .unwrap()
}

/// Scripted cache: sizes, one index handle per entity and a set of fully
/// cached entities. In-memory resolution scans the stored objects of fully
/// cached entities.
#[derive(Default)]
pub struct StubCache {
    sizes: HashMap<EntityName, usize>,
    indices: HashMap<EntityName, IndexHandle>,
    full: HashSet<EntityName>,
    objects: HashMap<EntityName, Vec<ObjectRef>>,
}

impl StubCache {
    pub fn with_size(mut self, entity: &str, size: usize) -> Self {
        self.sizes.insert(EntityName::new(entity), size);
        self
    }

    pub fn with_index(mut self, entity: &str, handle: IndexHandle) -> Self {
        self.indices.insert(EntityName::new(entity), handle);
        self
    }

    pub fn fully_cached(mut self, entity: &str) -> Self {
        self.full.insert(EntityName::new(entity));
        self
    }

    /// Store `objects` and mark their entity fully cached with a unique index.
    pub fn with_objects(mut self, entity: &str, objects: Vec<ObjectRef>) -> Self {
        let name = EntityName::new(entity);
        self.sizes.insert(name.clone(), objects.len());
        self.indices.entry(name.clone()).or_insert(IndexHandle {
            valid: true,
            unique: true,
            ..IndexHandle::default()
        });
        self.full.insert(name.clone());
        self.objects.insert(name, objects);
        self
    }
}

impl CacheLayer for StubCache {
    fn generation(&self, _entity: &EntityName) -> CacheGeneration {
        CacheGeneration(1)
    }

    fn index_handle(&self, entity: &EntityName, _fields: &[Field]) -> IndexHandle {
        self.indices.get(entity).cloned().unwrap_or_default()
    }

    fn is_fully_cached(&self, entity: &EntityName) -> bool {
        self.full.contains(entity)
    }

    fn estimate_size(&self, entity: &EntityName) -> usize {
        self.sizes.get(entity).copied().unwrap_or(0)
    }

    fn resolve_in_memory(&self, op: &Operation) -> Option<Vec<ObjectRef>> {
        let entity = op.result_entity()?;
        if !self.full.contains(entity) {
            return None;
        }
        let objects = self.objects.get(entity).cloned().unwrap_or_default();
        op.filter(objects)
    }
}
