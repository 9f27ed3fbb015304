//! Cache index handles and the generation-stamped memo descriptors keep.
//!
//! The cache layer owns the physical index. A descriptor only remembers the
//! last handle it was given together with the cache generation it was read
//! at, and re-fetches whenever the generation moves:
//!
//! - readers take the shared lock and return the handle when the stamp matches
//! - a stale stamp triggers a re-fetch; concurrent refreshes race and the last
//!   writer wins, which is harmless because every fetch is idempotent
//! - the `(generation, handle)` pair is swapped under one write lock, so
//!   readers never observe a handle paired with the wrong generation

use crate::cache::CacheLayer;
use joinery_model::{EntityName, Field};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::fmt;

/// Monotonic stamp of a cached entity's contents.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CacheGeneration(pub u64);

impl fmt::Display for CacheGeneration {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "g{}", self.0)
    }
}

/// What the cache knows about its best index for a set of fields.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct IndexHandle {
    pub valid: bool,
    pub unique: bool,
    pub immutable: bool,
    /// The index answers as-of lookups through a milestone proxy.
    pub as_of_proxy: bool,
    /// Statistics below are only meaningful once initialized.
    pub initialized: bool,
    /// Average objects per distinct key.
    pub avg_size: f64,
    /// Largest bucket.
    pub max_size: usize,
}

impl IndexHandle {
    /// No usable index.
    pub fn invalid() -> Self {
        Self::default()
    }

    pub fn has_statistics(&self) -> bool {
        self.valid && self.initialized
    }

    pub fn is_unique(&self) -> bool {
        self.valid && self.unique
    }

    pub fn is_non_unique(&self) -> bool {
        self.valid && !self.unique
    }

    pub fn is_immutable_unique(&self) -> bool {
        self.is_unique() && self.immutable
    }
}

#[derive(Debug, Default)]
pub struct IndexMemo {
    slot: RwLock<Option<(CacheGeneration, IndexHandle)>>,
}

impl IndexMemo {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current handle for `fields` on `entity`, refreshed if the cache moved on.
    pub fn get(&self, entity: &EntityName, fields: &[Field], cache: &dyn CacheLayer) -> IndexHandle {
        let current = cache.generation(entity);
        if let Some((generation, handle)) = self.slot.read().as_ref() {
            if *generation == current {
                return handle.clone();
            }
        }

        let handle = cache.index_handle(entity, fields);
        let mut slot = self.slot.write();
        let previous = slot.as_ref().map(|(generation, _)| *generation);
        tracing::trace!(
            entity = %entity,
            old_generation = ?previous,
            new_generation = %current,
            "refreshed stale index handle"
        );
        *slot = Some((current, handle.clone()));
        handle
    }

    /// Generation of the memoized handle, if any.
    pub fn stamped_generation(&self) -> Option<CacheGeneration> {
        self.slot.read().as_ref().map(|(generation, _)| *generation)
    }
}
