//! The `object_cache` module keeps a process-local, byte-bounded LRU of
//! encoded broadcast values. The cache is consulted before any network work
//! on the consumer side, and a hit short-circuits the whole fetch path.

use crate::broadcast_id::BroadcastId;
use lru::LruCache;
use std::sync::{Arc, Mutex};

pub const DEFAULT_CACHE_BYTES: usize = 256 * 1024 * 1024;

struct CacheInner {
    entries: LruCache<BroadcastId, Arc<Vec<u8>>>,
    total_bytes: usize,
}

pub struct ObjectCache {
    max_bytes: usize,
    inner: Mutex<CacheInner>,
}

impl ObjectCache {
    pub fn new(max_bytes: usize) -> Self {
        ObjectCache {
            max_bytes,
            inner: Mutex::new(CacheInner {
                entries: LruCache::unbounded(),
                total_bytes: 0,
            }),
        }
    }

    pub fn put(&self, id: BroadcastId, bytes: Vec<u8>) -> bool {
        self.put_shared(id, Arc::new(bytes))
    }

    /// Admits `bytes` under `id`, evicting least-recently-used entries until
    /// it fits. Returns false when the value alone exceeds the budget.
    pub fn put_shared(&self, id: BroadcastId, bytes: Arc<Vec<u8>>) -> bool {
        if bytes.len() > self.max_bytes {
            warn!(
                "{} too big to cache: {} bytes, budget {}",
                id,
                bytes.len(),
                self.max_bytes
            );
            return false;
        }
        let mut inner = self.inner.lock().unwrap();
        let inner = &mut *inner;
        if let Some(old) = inner.entries.pop(&id) {
            inner.total_bytes -= old.len();
        }
        while inner.total_bytes + bytes.len() > self.max_bytes {
            match inner.entries.pop_lru() {
                Some((evicted_id, evicted)) => {
                    trace!("evicting {} ({} bytes)", evicted_id, evicted.len());
                    inner.total_bytes -= evicted.len();
                }
                None => break,
            }
        }
        inner.total_bytes += bytes.len();
        inner.entries.put(id, bytes);
        true
    }

    pub fn get(&self, id: &BroadcastId) -> Option<Arc<Vec<u8>>> {
        self.inner.lock().unwrap().entries.get(id).cloned()
    }

    pub fn total_bytes(&self) -> usize {
        self.inner.lock().unwrap().total_bytes
    }

    pub fn len(&self) -> usize {
        self.inner.lock().unwrap().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

impl Default for ObjectCache {
    fn default() -> Self {
        Self::new(DEFAULT_CACHE_BYTES)
    }
}
