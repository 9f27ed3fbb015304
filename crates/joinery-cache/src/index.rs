//! Object indices over a store's slot numbers.
//!
//! Each index maps a key tuple to a bitmap of slots. Objects with a null in
//! any key field are not indexed: nulls never match an equality.

use ahash::AHashMap;
use joinery_model::{DomainObject, Field, Value};
use roaring::RoaringBitmap;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct IndexOptions {
    pub unique: bool,
    /// Indexed values never change once an object is cached.
    pub immutable: bool,
}

#[derive(Debug, Clone)]
pub(crate) struct ObjectIndex {
    fields: Vec<Field>,
    options: IndexOptions,
    buckets: AHashMap<Vec<Value>, RoaringBitmap>,
    indexed: u64,
}

impl ObjectIndex {
    pub(crate) fn new(fields: Vec<Field>, options: IndexOptions) -> Self {
        Self {
            fields,
            options,
            buckets: AHashMap::new(),
            indexed: 0,
        }
    }

    pub(crate) fn fields(&self) -> &[Field] {
        &self.fields
    }

    pub(crate) fn options(&self) -> IndexOptions {
        self.options
    }

    pub(crate) fn key_of(&self, object: &DomainObject) -> Option<Vec<Value>> {
        let key = object.key(&self.fields);
        if key.iter().any(Value::is_null) {
            None
        } else {
            Some(key)
        }
    }

    /// Slot already holding `object`'s key in a unique index, other than `slot`.
    pub(crate) fn conflict(&self, object: &DomainObject, slot: u32) -> Option<u32> {
        if !self.options.unique {
            return None;
        }
        let key = self.key_of(object)?;
        self.buckets
            .get(&key)
            .and_then(|bucket| bucket.iter().find(|&s| s != slot))
    }

    pub(crate) fn insert(&mut self, object: &DomainObject, slot: u32) {
        if let Some(key) = self.key_of(object) {
            if self.buckets.entry(key).or_default().insert(slot) {
                self.indexed += 1;
            }
        }
    }

    pub(crate) fn remove(&mut self, object: &DomainObject, slot: u32) {
        let Some(key) = self.key_of(object) else {
            return;
        };
        let Some(bucket) = self.buckets.get_mut(&key) else {
            return;
        };
        if bucket.remove(slot) {
            self.indexed -= 1;
        }
        if bucket.is_empty() {
            self.buckets.remove(&key);
        }
    }

    pub(crate) fn get(&self, key: &[Value]) -> Option<&RoaringBitmap> {
        self.buckets.get(key)
    }

    pub(crate) fn clear(&mut self) {
        self.buckets.clear();
        self.indexed = 0;
    }

    pub(crate) fn distinct_keys(&self) -> usize {
        self.buckets.len()
    }

    pub(crate) fn avg_size(&self) -> f64 {
        if self.buckets.is_empty() {
            return 0.0;
        }
        self.indexed as f64 / self.buckets.len() as f64
    }

    pub(crate) fn max_size(&self) -> usize {
        self.buckets
            .values()
            .map(|b| b.len() as usize)
            .max()
            .unwrap_or(0)
    }
}
