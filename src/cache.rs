//! Size-bounded response cache with per-entry absolute expiry.
//!
//! Entries are keyed by `<canonical-host>$<request-url>` and linked into an
//! LRU over the arena-backed list. Every mutating operation — lookup with
//! expiry removal, insertion, eviction — runs under a single mutex so the
//! totals invariant holds at all times: the sum of entry sizes equals
//! `total_size` and never exceeds the configured limit.
//!
//! Eviction is by recency only; expiry order plays no part in it.

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Instant;

use parking_lot::Mutex;
use tracing::{debug, trace};

use crate::collections::{LinkedList, NodeId};
use crate::descriptor::ResponseDescriptor;

struct CacheEntry {
    key: String,
    descriptor: Arc<ResponseDescriptor>,
    size: u64,
    expires_at: Instant,
}

struct Inner {
    limit: u64,
    total: u64,
    map: HashMap<String, NodeId>,
    lru: LinkedList<CacheEntry>,
}

/// LRU response cache. A `limit` of zero disables the size bound.
pub struct ResponseCache {
    inner: Mutex<Inner>,
}

impl ResponseCache {
    pub fn new(limit: u64) -> Self {
        Self {
            inner: Mutex::new(Inner {
                limit,
                total: 0,
                map: HashMap::new(),
                lru: LinkedList::new(),
            }),
        }
    }

    /// Looks up a key. An expired entry is removed and reported as a miss;
    /// a live hit moves the entry to the MRU position.
    pub fn get(&self, key: &str) -> Option<Arc<ResponseDescriptor>> {
        self.get_at(key, Instant::now())
    }

    fn get_at(&self, key: &str, now: Instant) -> Option<Arc<ResponseDescriptor>> {
        let mut inner = self.inner.lock();
        let id = *inner.map.get(key)?;
        let expired = inner
            .lru
            .get(id)
            .map(|e| e.expires_at <= now)
            .unwrap_or(true);
        if expired {
            if let Some(entry) = inner.lru.remove(id) {
                inner.total -= entry.size;
                inner.map.remove(&entry.key);
                trace!(key, "cache entry expired");
            }
            return None;
        }
        inner.lru.move_to_front(id);
        inner.lru.get(id).map(|e| e.descriptor.clone())
    }

    /// Inserts or refreshes an entry, then evicts LRU tails while the total
    /// exceeds the limit.
    pub fn put(&self, key: &str, descriptor: ResponseDescriptor, size: u64, expires_at: Instant) {
        let descriptor = Arc::new(descriptor);
        let mut inner = self.inner.lock();

        if let Some(&id) = inner.map.get(key) {
            let old = inner.lru.get(id).map(|e| e.size).unwrap_or(size);
            if let Some(entry) = inner.lru.get_mut(id) {
                entry.descriptor = descriptor;
                entry.size = size;
                entry.expires_at = expires_at;
            }
            inner.total = inner.total - old + size;
            inner.lru.move_to_front(id);
        } else {
            let id = inner.lru.push_front(CacheEntry {
                key: key.to_owned(),
                descriptor,
                size,
                expires_at,
            });
            inner.map.insert(key.to_owned(), id);
            inner.total += size;
        }

        while inner.limit > 0 && inner.total > inner.limit {
            match inner.lru.pop_back() {
                Some(entry) => {
                    inner.total -= entry.size;
                    inner.map.remove(&entry.key);
                    debug!(key = %entry.key, size = entry.size, "evicted cache entry");
                }
                None => break,
            }
        }
    }

    /// Current byte total across all entries.
    pub fn total_size(&self) -> u64 {
        self.inner.lock().total
    }

    pub fn len(&self) -> usize {
        self.inner.lock().map.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    fn descriptor(body: &str) -> ResponseDescriptor {
        let mut d = ResponseDescriptor::text(200, "text/plain", body);
        d.entity_tag = Some(format!("\"{body}\""));
        d
    }

    fn far_future() -> Instant {
        Instant::now() + Duration::from_secs(3600)
    }

    #[test]
    fn eviction_under_pressure() {
        let cache = ResponseCache::new(1000);
        cache.put("A", descriptor("a"), 600, far_future());
        cache.put("B", descriptor("b"), 300, far_future());
        cache.put("C", descriptor("c"), 200, far_future());

        // 1100 > 1000: the LRU tail (A) goes.
        assert_eq!(cache.total_size(), 500);
        assert_eq!(cache.len(), 2);
        assert!(cache.get("A").is_none());
        assert!(cache.get("B").is_some());
        assert!(cache.get("C").is_some());
    }

    #[test]
    fn expired_hit_removes_entry() {
        let cache = ResponseCache::new(1000);
        let past = Instant::now() - Duration::from_millis(1);
        cache.put("K", descriptor("k"), 100, past);
        assert_eq!(cache.total_size(), 100);

        assert!(cache.get("K").is_none());
        assert_eq!(cache.total_size(), 0);
        assert_eq!(cache.len(), 0);
    }

    #[test]
    fn absent_get_leaves_size_unchanged() {
        let cache = ResponseCache::new(1000);
        cache.put("K", descriptor("k"), 100, far_future());
        assert!(cache.get("missing").is_none());
        assert_eq!(cache.total_size(), 100);
    }

    #[test]
    fn get_refreshes_recency() {
        let cache = ResponseCache::new(1000);
        cache.put("A", descriptor("a"), 400, far_future());
        cache.put("B", descriptor("b"), 400, far_future());

        // Touch A so B becomes the LRU tail.
        assert!(cache.get("A").is_some());
        cache.put("C", descriptor("c"), 400, far_future());

        assert!(cache.get("B").is_none());
        assert!(cache.get("A").is_some());
        assert!(cache.get("C").is_some());
        assert_eq!(cache.total_size(), 800);
    }

    #[test]
    fn put_then_get_round_trip() {
        let cache = ResponseCache::new(1000);
        cache.put("K", descriptor("payload"), 7, far_future());

        let first = cache.get("K").expect("hit");
        let second = cache.get("K").expect("hit");
        assert!(Arc::ptr_eq(&first, &second));
        assert_eq!(first.entity_tag.as_deref(), Some("\"payload\""));
    }

    #[test]
    fn put_existing_key_adjusts_total() {
        let cache = ResponseCache::new(1000);
        cache.put("K", descriptor("v1"), 300, far_future());
        cache.put("K", descriptor("v2"), 500, far_future());
        assert_eq!(cache.total_size(), 500);
        assert_eq!(cache.len(), 1);
    }

    #[test]
    fn zero_limit_disables_bound() {
        let cache = ResponseCache::new(0);
        cache.put("A", descriptor("a"), u64::MAX / 4, far_future());
        cache.put("B", descriptor("b"), u64::MAX / 4, far_future());
        assert_eq!(cache.len(), 2);
    }

    #[test]
    fn eviction_ignores_expiry_order() {
        let cache = ResponseCache::new(1000);
        // A expires sooner but was touched last; B expires late but is LRU.
        cache.put("A", descriptor("a"), 500, Instant::now() + Duration::from_secs(10));
        cache.put("B", descriptor("b"), 500, far_future());
        assert!(cache.get("A").is_some());

        cache.put("C", descriptor("c"), 500, far_future());
        assert!(cache.get("B").is_none(), "recency, not expiry, picks the victim");
        assert!(cache.get("A").is_some());
    }
}
