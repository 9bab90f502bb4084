//! Key-value mappings that marker stores can be built on.

use super::marker::ReplayMarker;
use crate::error::Result;
use lru::LruCache;
use parking_lot::{Mutex, RwLock};
use std::collections::HashMap;
use std::num::NonZeroUsize;
use std::sync::Arc;

/// A mapping with unique string keys and arbitrary ordering.
pub trait MarkerMapping: Send + Sync {
    fn get(&self, key: &str) -> Result<Option<ReplayMarker>>;

    fn insert(&self, key: &str, marker: ReplayMarker) -> Result<()>;

    /// Remove a key. Removing a missing key is not an error.
    fn remove(&self, key: &str) -> Result<()>;

    fn len(&self) -> Result<usize>;

    fn is_empty(&self) -> Result<bool> {
        Ok(self.len()? == 0)
    }
}

impl<M: MarkerMapping + ?Sized> MarkerMapping for Arc<M> {
    fn get(&self, key: &str) -> Result<Option<ReplayMarker>> {
        (**self).get(key)
    }

    fn insert(&self, key: &str, marker: ReplayMarker) -> Result<()> {
        (**self).insert(key, marker)
    }

    fn remove(&self, key: &str) -> Result<()> {
        (**self).remove(key)
    }

    fn len(&self) -> Result<usize> {
        (**self).len()
    }
}

/// In-memory mapping.
#[derive(Debug, Default)]
pub struct MemoryMapping {
    entries: RwLock<HashMap<String, ReplayMarker>>,
}

impl MemoryMapping {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed the mapping with existing markers.
    pub fn with_markers(markers: impl IntoIterator<Item = ReplayMarker>) -> Self {
        let entries = markers
            .into_iter()
            .map(|marker| (marker.channel.clone(), marker))
            .collect();
        Self {
            entries: RwLock::new(entries),
        }
    }
}

impl MarkerMapping for MemoryMapping {
    fn get(&self, key: &str) -> Result<Option<ReplayMarker>> {
        Ok(self.entries.read().get(key).cloned())
    }

    fn insert(&self, key: &str, marker: ReplayMarker) -> Result<()> {
        self.entries.write().insert(key.to_string(), marker);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.write().remove(key);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.read().len())
    }
}

/// Capacity-bounded mapping that evicts the least recently used channel.
///
/// An evicted channel behaves as if it never had a marker.
pub struct LruMapping {
    entries: Mutex<LruCache<String, ReplayMarker>>,
}

impl LruMapping {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    pub fn capacity(&self) -> usize {
        self.entries.lock().cap().get()
    }
}

impl MarkerMapping for LruMapping {
    fn get(&self, key: &str) -> Result<Option<ReplayMarker>> {
        Ok(self.entries.lock().get(key).cloned())
    }

    fn insert(&self, key: &str, marker: ReplayMarker) -> Result<()> {
        self.entries.lock().put(key.to_string(), marker);
        Ok(())
    }

    fn remove(&self, key: &str) -> Result<()> {
        self.entries.lock().pop(key);
        Ok(())
    }

    fn len(&self) -> Result<usize> {
        Ok(self.entries.lock().len())
    }
}
