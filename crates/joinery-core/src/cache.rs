//! The narrow cache-layer interface descriptors consult, and the per-call
//! context bundling it with schema and configuration.

use crate::config::MapperConfig;
use crate::index::{CacheGeneration, IndexHandle};
use crate::operation::Operation;
use joinery_model::{EntityName, Field, ObjectRef, Schema};

/// Object cache as seen by the mapper algebra.
///
/// Implementations must be safe to share between reader threads.
pub trait CacheLayer: Send + Sync {
    /// Stamp that changes whenever `entity`'s cached contents or indices do.
    fn generation(&self, entity: &EntityName) -> CacheGeneration;

    /// Best index over (a subset of) `fields`.
    fn index_handle(&self, entity: &EntityName, fields: &[Field]) -> IndexHandle;

    fn is_fully_cached(&self, entity: &EntityName) -> bool;

    fn estimate_size(&self, entity: &EntityName) -> usize;

    /// Resolve a single-entity predicate from cache. `None` means a remote
    /// query is required; `Some(vec![])` is a valid empty result.
    fn resolve_in_memory(&self, op: &Operation) -> Option<Vec<ObjectRef>>;
}

/// Collaborators for one resolution call. Descriptors never keep these.
#[derive(Clone, Copy)]
pub struct MapperContext<'a> {
    pub cache: &'a dyn CacheLayer,
    pub schema: &'a Schema,
    pub config: &'a MapperConfig,
}

impl<'a> MapperContext<'a> {
    pub fn new(cache: &'a dyn CacheLayer, schema: &'a Schema, config: &'a MapperConfig) -> Self {
        Self {
            cache,
            schema,
            config,
        }
    }
}
