//! Clean-page cache.
//!
//! An LRU of page images read from the snapshot a pager is currently bound
//! to. Dirty pages never live here; the pager keeps those itself. Entries
//! are shared `Arc` buffers, so evicting a page that a cursor still holds
//! only drops the cache's reference.

use std::collections::HashMap;
use std::sync::Arc;

use crate::types::Pgno;

const NIL: usize = usize::MAX;

struct Slot {
    pgno: Pgno,
    data: Arc<Vec<u8>>,
    prev: usize,
    next: usize,
}

/// Page cache for one pager (PCache + PCache1 in SQLite).
pub struct PCache {
    page_size: usize,
    /// Configured size: positive is pages, negative is KiB
    cache_size: i32,
    spill_size: i32,
    slots: Vec<Slot>,
    free: Vec<usize>,
    index: HashMap<Pgno, usize>,
    /// Most recently used
    head: usize,
    /// Least recently used
    tail: usize,
    hits: u64,
    misses: u64,
}

impl PCache {
    pub fn open(page_size: usize, cache_size: i32) -> Self {
        Self {
            page_size,
            cache_size,
            spill_size: 1,
            slots: Vec::new(),
            free: Vec::new(),
            index: HashMap::new(),
            head: NIL,
            tail: NIL,
            hits: 0,
            misses: 0,
        }
    }

    /// Maximum number of pages retained.
    pub fn capacity(&self) -> usize {
        let n = if self.cache_size >= 0 {
            self.cache_size as i64
        } else {
            (-(self.cache_size as i64) * 1024) / self.page_size.max(1) as i64
        };
        n.max(10) as usize
    }

    pub fn set_cache_size(&mut self, n_cache_size: i32) {
        self.cache_size = n_cache_size;
        self.shrink();
    }

    /// Returns the previous value.
    pub fn set_spill_size(&mut self, n_spill: i32) -> i32 {
        std::mem::replace(&mut self.spill_size, n_spill)
    }

    pub fn spill_size(&self) -> i32 {
        self.spill_size
    }

    /// Drop everything and adopt a new page size.
    pub fn set_page_size(&mut self, page_size: usize) {
        self.clear();
        self.page_size = page_size;
    }

    pub fn fetch(&mut self, pgno: Pgno) -> Option<Arc<Vec<u8>>> {
        match self.index.get(&pgno).copied() {
            Some(slot) => {
                self.hits += 1;
                self.unlink(slot);
                self.push_front(slot);
                Some(Arc::clone(&self.slots[slot].data))
            }
            None => {
                self.misses += 1;
                None
            }
        }
    }

    pub fn insert(&mut self, pgno: Pgno, data: Arc<Vec<u8>>) {
        if let Some(slot) = self.index.get(&pgno).copied() {
            self.slots[slot].data = data;
            self.unlink(slot);
            self.push_front(slot);
            return;
        }
        let entry = Slot {
            pgno,
            data,
            prev: NIL,
            next: NIL,
        };
        let slot = match self.free.pop() {
            Some(slot) => {
                self.slots[slot] = entry;
                slot
            }
            None => {
                self.slots.push(entry);
                self.slots.len() - 1
            }
        };
        self.index.insert(pgno, slot);
        self.push_front(slot);
        self.shrink();
    }

    /// Forget one page.
    pub fn drop_page(&mut self, pgno: Pgno) {
        if let Some(slot) = self.index.remove(&pgno) {
            self.release(slot);
        }
    }

    /// Forget every page numbered above `pgno`.
    pub fn truncate(&mut self, pgno: Pgno) {
        let doomed: Vec<Pgno> = self.index.keys().copied().filter(|&p| p > pgno).collect();
        for p in doomed {
            self.drop_page(p);
        }
    }

    pub fn clear(&mut self) {
        self.slots.clear();
        self.free.clear();
        self.index.clear();
        self.head = NIL;
        self.tail = NIL;
    }

    /// Evict least recently used pages down to capacity.
    pub fn shrink(&mut self) {
        let cap = self.capacity();
        while self.index.len() > cap && self.tail != NIL {
            let slot = self.tail;
            self.index.remove(&self.slots[slot].pgno);
            self.release(slot);
        }
    }

    pub fn page_count(&self) -> usize {
        self.index.len()
    }

    /// (hits, misses) since open.
    pub fn stats(&self) -> (u64, u64) {
        (self.hits, self.misses)
    }

    fn release(&mut self, slot: usize) {
        self.unlink(slot);
        self.slots[slot].data = Arc::new(Vec::new());
        self.free.push(slot);
    }

    fn unlink(&mut self, slot: usize) {
        let (prev, next) = (self.slots[slot].prev, self.slots[slot].next);
        if prev != NIL {
            self.slots[prev].next = next;
        } else if self.head == slot {
            self.head = next;
        }
        if next != NIL {
            self.slots[next].prev = prev;
        } else if self.tail == slot {
            self.tail = prev;
        }
        self.slots[slot].prev = NIL;
        self.slots[slot].next = NIL;
    }

    fn push_front(&mut self, slot: usize) {
        self.slots[slot].prev = NIL;
        self.slots[slot].next = self.head;
        if self.head != NIL {
            self.slots[self.head].prev = slot;
        }
        self.head = slot;
        if self.tail == NIL {
            self.tail = slot;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn page(byte: u8) -> Arc<Vec<u8>> {
        Arc::new(vec![byte; 16])
    }

    #[test]
    fn test_fetch_after_insert() {
        let mut cache = PCache::open(16, 100);
        cache.insert(3, page(3));
        assert_eq!(cache.fetch(3).unwrap()[0], 3);
        assert!(cache.fetch(4).is_none());
        assert_eq!(cache.stats(), (1, 1));
    }

    #[test]
    fn test_lru_eviction_order() {
        let mut cache = PCache::open(16, 10);
        for p in 1..=10 {
            cache.insert(p, page(p as u8));
        }
        // Touch page 1 so page 2 becomes the eviction victim.
        cache.fetch(1);
        cache.insert(11, page(11));
        assert_eq!(cache.page_count(), 10);
        assert!(cache.fetch(1).is_some());
        assert!(cache.fetch(2).is_none());
        assert!(cache.fetch(11).is_some());
    }

    #[test]
    fn test_negative_cache_size_is_kib() {
        let mut cache = PCache::open(1024, 0);
        cache.set_cache_size(-64);
        assert_eq!(cache.capacity(), 64);
    }

    #[test]
    fn test_truncate_drops_high_pages() {
        let mut cache = PCache::open(16, 100);
        for p in 1..=20 {
            cache.insert(p, page(0));
        }
        cache.truncate(5);
        assert_eq!(cache.page_count(), 5);
        assert!(cache.fetch(6).is_none());
        // Freed slots are reused.
        cache.insert(30, page(1));
        assert_eq!(cache.page_count(), 6);
    }
}
