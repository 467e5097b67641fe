//! Decoder configuration cache.
//!
//! Written by the drain thread on a configuration-change event, read by the
//! accept thread when a compressed-stream client connects. It has its own lock
//! so neither thread ever waits on the connection write lock to reach it.

use std::sync::{Mutex, MutexGuard, PoisonError};

/// Latest start-code delimited configuration blob (parameter sets).
#[derive(Debug, Default)]
pub struct ParameterCache {
    blob: Mutex<Option<Vec<u8>>>,
}

impl ParameterCache {
    pub fn new() -> Self {
        Self::default()
    }

    /// Replace the cached configuration. An empty blob clears the cache.
    pub fn set(&self, blob: Vec<u8>) {
        let mut guard = self.lock();
        *guard = if blob.is_empty() { None } else { Some(blob) };
    }

    /// Copy of the cached configuration, if any.
    pub fn get(&self) -> Option<Vec<u8>> {
        self.lock().clone()
    }

    /// Drop the cached configuration. Called on pipeline teardown only.
    pub fn clear(&self) {
        self.lock().take();
    }

    /// Size in bytes of the cached blob (0 when absent).
    pub fn len(&self) -> usize {
        self.lock().as_ref().map_or(0, Vec::len)
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn lock(&self) -> MutexGuard<'_, Option<Vec<u8>>> {
        self.blob.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn get_returns_last_set_blob() {
        let cache = ParameterCache::new();
        assert!(cache.get().is_none());

        cache.set(vec![0, 0, 0, 1, 0x67, 0x42]);
        cache.set(vec![0, 0, 0, 1, 0x67, 0x64]);
        assert_eq!(cache.get(), Some(vec![0, 0, 0, 1, 0x67, 0x64]));
        assert_eq!(cache.len(), 6);
    }

    #[test]
    fn clear_leaves_cache_absent() {
        let cache = ParameterCache::new();
        cache.set(vec![1, 2, 3]);
        cache.clear();
        assert!(cache.get().is_none());
        assert!(cache.is_empty());
    }

    #[test]
    fn empty_blob_is_treated_as_absent() {
        let cache = ParameterCache::new();
        cache.set(vec![9]);
        cache.set(Vec::new());
        assert!(cache.get().is_none());
    }
}
