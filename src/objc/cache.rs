//! Class-RO cache: a fixed-capacity, single-probe direct-mapped cache of
//! parsed `class_ro_t` data, keyed by class address.
//!
//! Parsing a class's read-only data (name, method list location, superclass
//! link) requires a handful of remote memory reads; re-parsing it for
//! every frame that lands in the same class is wasted work during a
//! multi-frame unwind. The cache is deliberately dumb: one direct-mapped
//! slot per hash bucket, no chaining, no eviction policy beyond
//! first-writer-wins, and no locking, since every access below happens on
//! the signal-handling thread with nothing else touching it -- a lookup
//! just misses rather than contending.

const SLOTS: usize = 64;

/// Whatever a slot needs to remember about a class to avoid re-walking its
/// `class_ro_t` on the next lookup.
#[derive(Debug, Clone, Copy)]
pub struct CachedClassInfo {
    pub class_addr: u64,
    pub name_addr: u64,
    pub method_list_addr: u64,
    pub superclass_addr: u64,
}

pub struct ClassRoCache {
    slots: [Option<CachedClassInfo>; SLOTS],
}

impl Default for ClassRoCache {
    fn default() -> Self {
        Self::new()
    }
}

impl ClassRoCache {
    pub fn new() -> Self {
        Self {
            slots: [None; SLOTS],
        }
    }

    fn bucket(class_addr: u64) -> usize {
        // Class addresses are at least pointer-aligned; shifting off the
        // low bits spreads consecutive classes (as laid out by the
        // compiler in `__objc_classlist`) across buckets instead of
        // piling them into one.
        ((class_addr >> 4) as usize) % SLOTS
    }

    /// Returns the cached entry for `class_addr`, only if the bucket it
    /// hashes to actually holds that class (a single probe, never a
    /// chain walk).
    pub fn get(&self, class_addr: u64) -> Option<CachedClassInfo> {
        let slot = self.slots[Self::bucket(class_addr)]?;
        (slot.class_addr == class_addr).then_some(slot)
    }

    /// Inserts or overwrites the bucket for `info.class_addr`. A
    /// collision between two distinct classes simply evicts the older
    /// one -- acceptable since a miss just costs a re-parse, never
    /// incorrectness.
    pub fn insert(&mut self, info: CachedClassInfo) {
        self.slots[Self::bucket(info.class_addr)] = Some(info);
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn hit_after_insert() {
        let mut cache = ClassRoCache::new();
        let info = CachedClassInfo {
            class_addr: 0x1000,
            name_addr: 0x2000,
            method_list_addr: 0x3000,
            superclass_addr: 0,
        };
        cache.insert(info);
        assert_eq!(cache.get(0x1000).unwrap().name_addr, 0x2000);
    }

    #[test]
    fn miss_for_unknown_class() {
        let cache = ClassRoCache::new();
        assert!(cache.get(0xdead).is_none());
    }

    #[test]
    fn colliding_insert_evicts_previous_entry() {
        let mut cache = ClassRoCache::new();
        let a = CachedClassInfo {
            class_addr: 0x10,
            name_addr: 1,
            method_list_addr: 0,
            superclass_addr: 0,
        };
        // `0x10 >> 4 == 1`, and `(1 + SLOTS) << 4` collides into the same
        // bucket as `0x10`.
        let colliding_addr = 0x10 + (SLOTS as u64) * 16;
        let b = CachedClassInfo {
            class_addr: colliding_addr,
            name_addr: 2,
            method_list_addr: 0,
            superclass_addr: 0,
        };
        cache.insert(a);
        cache.insert(b);
        assert!(cache.get(0x10).is_none());
        assert_eq!(cache.get(colliding_addr).unwrap().name_addr, 2);
    }
}
