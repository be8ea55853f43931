//! Best-effort read cache for entity payloads. Population happens after a
//! successful store write and never fails the write; invalidation happens on
//! update and delete.

use std::num::NonZeroUsize;

use lru::LruCache;
use parking_lot::Mutex;

use crate::keys::EntityClass;

pub trait CacheProvider: Send + Sync {
    fn get(&self, class: EntityClass, token: &str) -> Option<Vec<u8>>;
    fn put(&self, class: EntityClass, token: &str, payload: Vec<u8>);
    fn invalidate(&self, class: EntityClass, token: &str);
}

pub struct LruTokenCache {
    entries: Mutex<LruCache<String, Vec<u8>>>,
}

impl LruTokenCache {
    pub fn new(capacity: usize) -> Self {
        let capacity = NonZeroUsize::new(capacity.max(1)).unwrap_or(NonZeroUsize::MIN);
        Self {
            entries: Mutex::new(LruCache::new(capacity)),
        }
    }

    fn cache_key(class: EntityClass, token: &str) -> String {
        format!("{class:?}:{token}")
    }
}

impl CacheProvider for LruTokenCache {
    fn get(&self, class: EntityClass, token: &str) -> Option<Vec<u8>> {
        self.entries.lock().get(&Self::cache_key(class, token)).cloned()
    }

    fn put(&self, class: EntityClass, token: &str, payload: Vec<u8>) {
        self.entries
            .lock()
            .put(Self::cache_key(class, token), payload);
    }

    fn invalidate(&self, class: EntityClass, token: &str) {
        self.entries.lock().pop(&Self::cache_key(class, token));
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn evicts_least_recently_used() {
        let cache = LruTokenCache::new(2);
        cache.put(EntityClass::Site, "a", vec![1]);
        cache.put(EntityClass::Site, "b", vec![2]);
        cache.get(EntityClass::Site, "a");
        cache.put(EntityClass::Site, "c", vec![3]);

        assert!(cache.get(EntityClass::Site, "a").is_some());
        assert!(cache.get(EntityClass::Site, "b").is_none());
    }

    #[test]
    fn classes_do_not_collide() {
        let cache = LruTokenCache::new(4);
        cache.put(EntityClass::Site, "t", vec![1]);
        assert!(cache.get(EntityClass::Device, "t").is_none());
    }
}
